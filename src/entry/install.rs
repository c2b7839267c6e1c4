use anyhow::Context as _;
use flate2::read::GzDecoder;
use nix::unistd::{Gid, Uid, chown};
use regex::Regex;
use sha2::{Digest as _, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};
use users::{get_group_by_name, get_user_by_name};

use crate::entry::config::{Layout, Settings};

static VERSION_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"-Dcenshare\.serviceclient\.version=([\w.\-]+)").expect("static regex")
});

/// Size and checksums of a downloaded file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadDigest {
    pub bytes: u64,
    pub md5: String,
    pub sha256: String,
}

pub fn archive_url(user: &str, pass: &str, repo_host: &str, version: &str) -> String {
    format!(
        "https://{user}:{pass}@{repo_host}/censhare-release/censhare-Service/v{version}/Shell/censhare-Service-Client-v{version}.tar.gz"
    )
}

/// URL with any userinfo stripped, for logging.
pub fn redact_url(url: &str) -> String {
    match reqwest::Url::parse(url) {
        Ok(mut u) => {
            let _ = u.set_username("");
            let _ = u.set_password(None);
            u.to_string()
        }
        Err(_) => "<unparsable url>".to_string(),
    }
}

/// Stream `url` to `dest`, hashing as it goes. Anything but HTTP 200 is an error.
pub async fn download_to(url: &str, dest: &Path) -> anyhow::Result<DownloadDigest> {
    let shown = redact_url(url);
    let client = reqwest::Client::builder()
        .build()
        .context("build HTTP client")?;
    let mut resp = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("GET {shown}"))?;
    let status = resp.status();
    anyhow::ensure!(
        status == reqwest::StatusCode::OK,
        "download {shown} failed with status {status}"
    );

    let mut file = tokio::fs::File::create(dest)
        .await
        .with_context(|| format!("create {}", dest.display()))?;
    let mut md5 = md5::Context::new();
    let mut sha256 = Sha256::new();
    let mut bytes = 0u64;
    while let Some(chunk) = resp
        .chunk()
        .await
        .with_context(|| format!("read body of {shown}"))?
    {
        file.write_all(&chunk)
            .await
            .with_context(|| format!("write {}", dest.display()))?;
        md5.consume(&chunk);
        sha256.update(&chunk);
        bytes += chunk.len() as u64;
    }
    file.flush()
        .await
        .with_context(|| format!("flush {}", dest.display()))?;

    Ok(DownloadDigest {
        bytes,
        md5: format!("{:x}", md5.compute()),
        sha256: hex::encode(sha256.finalize()),
    })
}

/// Unpack a `.tar.gz` under `dest`. Entries that would land outside `dest` are skipped.
/// Returns the number of entries written.
pub fn unpack_archive(archive: &Path, dest: &Path) -> anyhow::Result<usize> {
    let file = fs::File::open(archive).with_context(|| format!("open {}", archive.display()))?;
    let mut tar = tar::Archive::new(GzDecoder::new(file));
    tar.set_preserve_permissions(true);
    tar.set_overwrite(true);
    fs::create_dir_all(dest).with_context(|| format!("create_dir_all {}", dest.display()))?;

    let mut unpacked = 0usize;
    for entry in tar
        .entries()
        .with_context(|| format!("read {}", archive.display()))?
    {
        let mut entry = entry.with_context(|| format!("read entry of {}", archive.display()))?;
        let path = entry
            .path()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|_| "<non-utf8>".to_string());
        let written = entry
            .unpack_in(dest)
            .with_context(|| format!("unpack {path} into {}", dest.display()))?;
        if written {
            unpacked += 1;
        } else {
            warn!("install entry={path} outcome=skipped reason=outside_destination");
        }
    }
    Ok(unpacked)
}

/// Resolve the service account to numeric ids.
pub fn lookup_owner(user: &str, group: &str) -> anyhow::Result<(Uid, Gid)> {
    let usr = get_user_by_name(user).ok_or_else(|| anyhow::anyhow!("unknown user: {user}"))?;
    let grp = get_group_by_name(group).ok_or_else(|| anyhow::anyhow!("unknown group: {group}"))?;
    Ok((Uid::from_raw(usr.uid()), Gid::from_raw(grp.gid())))
}

/// Hand `root` and everything below it to `uid`/`gid`. Symlinks are left alone.
/// Returns the number of entries changed.
pub fn chown_recursive(root: &Path, uid: Option<Uid>, gid: Option<Gid>) -> anyhow::Result<usize> {
    let mut pending = vec![root.to_path_buf()];
    let mut changed = 0usize;
    while let Some(path) = pending.pop() {
        let md = fs::symlink_metadata(&path).with_context(|| format!("stat {}", path.display()))?;
        if md.file_type().is_symlink() {
            continue;
        }
        chown(&path, uid, gid).with_context(|| format!("chown {}", path.display()))?;
        changed += 1;
        if md.is_dir() {
            for ent in fs::read_dir(&path).with_context(|| format!("read_dir {}", path.display()))? {
                pending.push(ent?.path());
            }
        }
    }
    Ok(changed)
}

/// Client version embedded in the launcher script, if any.
pub fn parse_version_marker(script: &str) -> Option<String> {
    script
        .lines()
        .find_map(|l| VERSION_MARKER.captures(l))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

pub fn detect_installed_version(script: &Path) -> Option<String> {
    match fs::read_to_string(script) {
        Ok(text) => parse_version_marker(&text),
        Err(e) => {
            warn!("install version=unknown script={} err={e}", script.display());
            None
        }
    }
}

pub fn read_version_file(path: &Path) -> Option<String> {
    fs::read_to_string(path)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Persist the client version. Failures are logged only.
pub fn write_version_file(path: &Path, version: &str) {
    let res = path
        .parent()
        .map(fs::create_dir_all)
        .transpose()
        .and_then(|_| fs::write(path, version));
    match res {
        Ok(()) => info!("install version={version} marker={}", path.display()),
        Err(e) => warn!(
            "install version={version} marker={} outcome=not_persisted err={e}",
            path.display()
        ),
    }
}

/// Download, verify-log, unpack and hand over the client archive.
pub async fn install_client(url: &str, layout: &Layout) -> anyhow::Result<()> {
    let archive = std::env::temp_dir().join("censhare-client.tar.gz");
    info!("install attempt=download url={}", redact_url(url));
    let digest = download_to(url, &archive).await?;
    info!(
        "install outcome=downloaded bytes={} md5={} sha256={}",
        digest.bytes, digest.md5, digest.sha256
    );

    let dest = layout.install_root.clone();
    let src = archive.clone();
    let unpacked = tokio::task::spawn_blocking(move || unpack_archive(&src, &dest))
        .await
        .context("unpack task panicked")??;
    if let Err(e) = fs::remove_file(&archive) {
        warn!("install cleanup={} err={e}", archive.display());
    }
    info!(
        "install outcome=unpacked entries={unpacked} dest={}",
        layout.install_root.display()
    );

    let (uid, gid) = lookup_owner(&layout.service_user, &layout.service_group)?;
    let owned = chown_recursive(&layout.install_root, Some(uid), Some(gid))?;
    info!(
        "install chown user={} group={} entries={owned}",
        layout.service_user, layout.service_group
    );

    match detect_installed_version(&layout.serviceclient_script()) {
        Some(v) => info!("install detected_version={v}"),
        None => warn!("install detected_version=unknown"),
    }
    Ok(())
}

/// Make sure the client is installed and return its version, when known.
pub async fn ensure_installed(settings: &Settings, layout: &Layout) -> anyhow::Result<Option<String>> {
    if !layout.install_dir.exists() {
        let (user, pass, version) = settings.repo_credentials()?;
        install_client(&archive_url(user, pass, &layout.repo_host, version), layout).await?;
        write_version_file(&layout.version_file, version);
        return Ok(Some(version.to_string()));
    }
    info!("install dir={} outcome=present", layout.install_dir.display());
    if let Some(version) = settings.version.as_deref() {
        write_version_file(&layout.version_file, version);
        return Ok(Some(version.to_string()));
    }
    Ok(read_version_file(&layout.version_file)
        .or_else(|| detect_installed_version(&layout.serviceclient_script())))
}

/// Copy regular files from each existing, non-empty source directory into `target`.
/// Later sources overwrite earlier ones. Returns the number of files copied.
pub fn copy_icc_profiles(sources: &[PathBuf], target: &Path) -> anyhow::Result<usize> {
    let mut copied = 0usize;
    for src in sources {
        let entries: Vec<fs::DirEntry> = match fs::read_dir(src) {
            Ok(rd) => rd.collect::<Result<_, _>>()?,
            Err(_) => Vec::new(),
        };
        if entries.is_empty() {
            info!("icc source={} outcome=skipped reason=missing_or_empty", src.display());
            continue;
        }
        fs::create_dir_all(target).with_context(|| format!("create_dir_all {}", target.display()))?;
        for ent in entries {
            let p = ent.path();
            if !p.is_file() {
                continue;
            }
            let dst = target.join(ent.file_name());
            fs::copy(&p, &dst)
                .with_context(|| format!("copy {} -> {}", p.display(), dst.display()))?;
            copied += 1;
        }
        info!("icc source={} target={} outcome=copied", src.display(), target.display());
    }
    Ok(copied)
}

#[cfg(test)]
mod tests;
