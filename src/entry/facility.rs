use anyhow::Context as _;
use nix::unistd::{AccessFlags, access};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};
use xmltree::Element;

use crate::entry::xml;

pub const OFFICE_PLACEHOLDER: &str = "@@OFFICE@@";
pub const OFFICE_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Conversion tools the client can delegate work to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Facility {
    ImageMagick,
    ExifTool,
    Ghostscript,
    WkHtmlToImage,
    PngQuant,
    Ffmpeg,
    Office,
}

impl Facility {
    pub const ALL: [Facility; 7] = [
        Facility::ImageMagick,
        Facility::ExifTool,
        Facility::Ghostscript,
        Facility::WkHtmlToImage,
        Facility::PngQuant,
        Facility::Ffmpeg,
        Facility::Office,
    ];

    pub fn key(&self) -> &'static str {
        match self {
            Facility::ImageMagick => "imagemagick",
            Facility::ExifTool => "exiftool",
            Facility::Ghostscript => "ghostscript",
            Facility::WkHtmlToImage => "wkhtmltoimage",
            Facility::PngQuant => "pngquant",
            Facility::Ffmpeg => "ffmpeg",
            Facility::Office => "office",
        }
    }

    pub fn from_key(key: &str) -> Option<Facility> {
        Self::ALL.into_iter().find(|f| f.key() == key)
    }

    /// `(placeholder, executable)` pairs written as `<path key=… path=…/>`.
    pub fn tool_paths(&self) -> &'static [(&'static str, &'static str)] {
        match self {
            Facility::ImageMagick => &[
                ("@@CONVERT@@", "/usr/local/bin/magick"),
                ("@@COMPOSITE@@", "/usr/local/bin/composite"),
            ],
            Facility::ExifTool => &[("@@EXIFTOOL@@", "/usr/local/bin/exiftool")],
            Facility::Ghostscript => &[("@@GS@@", "/usr/local/bin/gs")],
            Facility::WkHtmlToImage => &[("@@HTML2IMG@@", "/usr/local/bin/wkhtmltoimage")],
            Facility::PngQuant => &[("@@PNGQUANT@@", "/usr/local/bin/pngquant")],
            Facility::Ffmpeg => &[("@@FFMPEG-PATH@@", "/usr/local/bin/ffmpeg")],
            Facility::Office => &[],
        }
    }
}

/// Outcome of probing the office conversion endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OfficeProbe {
    NotConfigured,
    Reachable { url: String },
    Unreachable { url: String, reason: String },
}

/// Inputs for reconciling the `<facility>` elements.
pub struct FacilityOptions<'a> {
    pub timeouts: &'a BTreeMap<String, String>,
    pub auto_enable: bool,
    pub office: &'a OfficeProbe,
    pub is_executable: &'a dyn Fn(&Path) -> bool,
}

/// Regular file the current user may execute.
pub fn is_executable_file(path: &Path) -> bool {
    path.is_file() && access(path, AccessFlags::X_OK).is_ok()
}

/// POST a small multipart upload to the office endpoint. Only an HTTP 200 counts as
/// reachable; there are no retries.
pub async fn probe_office(url: Option<&str>, validate_certs: bool) -> OfficeProbe {
    let Some(url) = url else {
        info!("facility=office probe=skipped reason=no_url");
        return OfficeProbe::NotConfigured;
    };
    match post_probe(url, validate_certs).await {
        Ok(()) => {
            info!("facility=office probe=ok url={url}");
            OfficeProbe::Reachable {
                url: url.to_string(),
            }
        }
        Err(e) => {
            warn!("facility=office probe=failed url={url} err={e:#}");
            OfficeProbe::Unreachable {
                url: url.to_string(),
                reason: format!("{e:#}"),
            }
        }
    }
}

async fn post_probe(url: &str, validate_certs: bool) -> anyhow::Result<()> {
    let client = reqwest::Client::builder()
        .timeout(OFFICE_PROBE_TIMEOUT)
        .danger_accept_invalid_certs(!validate_certs)
        .build()
        .context("build HTTP client")?;
    let part = reqwest::multipart::Part::text("foobar")
        .file_name("test.txt")
        .mime_str("text/plain")
        .context("build multipart body")?;
    let form = reqwest::multipart::Form::new().part("file", part);
    let resp = client
        .post(url)
        .multipart(form)
        .send()
        .await
        .with_context(|| format!("POST {url}"))?;
    let status = resp.status();
    anyhow::ensure!(
        status == reqwest::StatusCode::OK,
        "non-200 status code received: {status}"
    );
    Ok(())
}

/// `{KEY}_TIMEOUT` override for a facility, if any.
pub fn apply_timeout(el: &mut Element, key: &str, timeouts: &BTreeMap<String, String>) {
    if let Some(timeout) = timeouts.get(&key.to_ascii_uppercase()) {
        xml::set_attr(el, "timeout", timeout.as_str());
        info!("facility={key} timeout={timeout}");
    }
}

/// Upsert the table paths of `facility` and, when allowed, enable it once every tool
/// is installed.
pub fn apply_tool_paths(
    el: &mut Element,
    facility: Facility,
    auto_enable: bool,
    is_executable: &dyn Fn(&Path) -> bool,
) {
    let paths = facility.tool_paths();
    if paths.is_empty() {
        return;
    }
    for (placeholder, real) in paths {
        let path_el = xml::upsert_descendant_by_attr(el, "path", "key", placeholder);
        xml::set_attr(path_el, "path", *real);
    }
    info!("facility={} paths=updated count={}", facility.key(), paths.len());

    if !auto_enable {
        return;
    }
    let installed = paths.iter().all(|(_, real)| is_executable(Path::new(real)));
    let current = xml::attr(el, "enabled").map(str::to_string);
    if installed && current.as_deref() != Some("true") {
        if current.as_deref() == Some("false") {
            warn!(
                "facility={} enabled=false overridden=true reason=binaries_present",
                facility.key()
            );
        } else {
            info!("facility={} enabled=true reason=binaries_present", facility.key());
        }
        xml::set_attr(el, "enabled", "true");
    }
}

/// Record the office probe result on the office facility element.
pub fn apply_office_probe(el: &mut Element, probe: &OfficeProbe) {
    match probe {
        OfficeProbe::Reachable { url } => {
            let path_el = xml::upsert_descendant_by_attr(el, "path", "key", OFFICE_PLACEHOLDER);
            xml::set_attr(path_el, "port", url.as_str());
            xml::set_attr(el, "enabled", "true");
        }
        OfficeProbe::Unreachable { .. } | OfficeProbe::NotConfigured => {
            xml::set_attr(el, "enabled", "false");
        }
    }
}

/// Apply timeouts, tool paths and the office probe to every `<facility>` below
/// `facilities`. Facilities with unknown keys only receive timeout overrides.
pub fn reconcile_facilities(facilities: &mut Element, opts: &FacilityOptions<'_>) {
    xml::for_each_named_mut(facilities, "facility", &mut |el: &mut Element| {
        let Some(key) = xml::attr(el, "key").map(str::to_string) else {
            warn!("facility key=<missing> outcome=skipped");
            return;
        };
        apply_timeout(el, &key, opts.timeouts);
        match Facility::from_key(&key) {
            Some(Facility::Office) => apply_office_probe(el, opts.office),
            Some(f) => apply_tool_paths(el, f, opts.auto_enable, opts.is_executable),
            None => {}
        }
    });
}
