use anyhow::Context as _;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tokio::process::Command;
use tracing::{info, warn};

use crate::entry::install;

/// Newest client release (`major * 100 + minor`) served by each JDK major.
pub const JAVA_WINDOWS: [(u32, u32); 2] = [(202201, 11), (202403, 17)];
pub const JAVA_DEFAULT: u32 = 21;

static JAVA_VERSION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"version\s+"(\d+)"#).expect("static regex"));

/// JDK major for a client version such as `2024.1.2`.
pub fn select_jdk_major(client_version: Option<&str>) -> u32 {
    let Some(version) = client_version.map(str::trim).filter(|v| !v.is_empty()) else {
        warn!("java client_version=unknown jdk={JAVA_DEFAULT} reason=default");
        return JAVA_DEFAULT;
    };
    let mut parts = version.split('.');
    let (Some(major), Some(minor)) = (parts.next(), parts.next()) else {
        warn!("java client_version={version:?} jdk={JAVA_DEFAULT} reason=unexpected_format");
        return JAVA_DEFAULT;
    };
    let (Ok(major), Ok(minor)) = (major.parse::<u32>(), minor.parse::<u32>()) else {
        warn!("java client_version={version:?} jdk={JAVA_DEFAULT} reason=unparsable");
        return JAVA_DEFAULT;
    };
    let release = major * 100 + minor;
    JAVA_WINDOWS
        .iter()
        .find(|(upper, _)| release <= *upper)
        .map(|(_, jdk)| *jdk)
        .unwrap_or(JAVA_DEFAULT)
}

/// Corretto's name for a machine architecture.
pub fn corretto_arch(machine: &str) -> anyhow::Result<&'static str> {
    match machine {
        "x86_64" => Ok("x64"),
        "aarch64" => Ok("aarch64"),
        other => anyhow::bail!("unsupported architecture for Corretto JDK: {other}"),
    }
}

pub fn corretto_url(major: u32, arch: &str) -> String {
    format!("https://corretto.aws/downloads/latest/amazon-corretto-{major}-{arch}-linux-jdk.deb")
}

/// Major version from `java -version` output (`version "17.0.9"` → 17).
pub fn parse_java_major(output: &str) -> Option<u32> {
    JAVA_VERSION
        .captures(output)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Location of the selected JDK.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JavaRuntime {
    pub java_binary: PathBuf,
    pub java_home: PathBuf,
}

impl JavaRuntime {
    /// `<home>/bin/java` resolved through symlinks (alternatives).
    pub fn from_binary(java_binary: &Path) -> Self {
        let real = std::fs::canonicalize(java_binary).unwrap_or_else(|_| java_binary.to_path_buf());
        let java_home = real
            .parent()
            .and_then(Path::parent)
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("/"));
        Self {
            java_binary: java_binary.to_path_buf(),
            java_home,
        }
    }

    /// Variables handed to the client so it picks this JDK.
    pub fn child_env(&self, current_path: Option<&str>) -> Vec<(String, String)> {
        let home = self.java_home.display().to_string();
        let bin = self.java_home.join("bin").display().to_string();
        let path = match current_path.filter(|p| !p.is_empty()) {
            Some(p) => format!("{bin}:{p}"),
            None => bin,
        };
        vec![
            ("JAVA_HOME".to_string(), home.clone()),
            ("JDK_HOME".to_string(), home),
            ("PATH".to_string(), path),
        ]
    }
}

async fn current_java_major(java: &Path) -> Option<u32> {
    let out = Command::new(java).arg("-version").output().await.ok()?;
    if !out.status.success() {
        return None;
    }
    // `java -version` prints to stderr.
    let text = format!(
        "{}{}",
        String::from_utf8_lossy(&out.stderr),
        String::from_utf8_lossy(&out.stdout)
    );
    parse_java_major(&text)
}

async fn run_checked(program: &str, args: &[&str]) -> anyhow::Result<()> {
    info!("java attempt=exec argv={:?}", std::iter::once(program).chain(args.iter().copied()).collect::<Vec<_>>());
    let status = Command::new(program)
        .args(args)
        .status()
        .await
        .with_context(|| format!("spawn {program}"))?;
    anyhow::ensure!(status.success(), "{program} {} failed (status={status})", args.join(" "));
    Ok(())
}

async fn install_deb(deb: &Path) -> anyhow::Result<()> {
    let deb_s = deb.display().to_string();
    if let Err(e) = run_checked("dpkg", &["-i", &deb_s]).await {
        warn!("java dpkg=failed decision=repair err={e:#}");
        run_checked("apt-get", &["update"]).await?;
        run_checked("apt-get", &["-y", "-f", "install"]).await?;
        run_checked("dpkg", &["-i", &deb_s]).await?;
    }
    Ok(())
}

/// Point the system alternatives at `rt`. Best-effort.
async fn set_alternatives(rt: &JavaRuntime) {
    let javac = rt.java_home.join("bin").join("javac");
    let mut targets = vec![("java", rt.java_binary.clone())];
    if javac.exists() {
        targets.push(("javac", javac));
    }
    for (name, target) in targets {
        let res = Command::new("update-alternatives")
            .arg("--set")
            .arg(name)
            .arg(&target)
            .status()
            .await;
        match res {
            Ok(s) if s.success() => {}
            Ok(s) => warn!("java alternatives={name} target={} status={s}", target.display()),
            Err(e) => {
                warn!("java alternatives=unavailable err={e}");
                return;
            }
        }
    }
}

/// Reuse the installed JDK when its major matches, otherwise install the matching
/// Corretto package. Returns the runtime the client should use, if one was found.
pub async fn ensure_corretto(major: u32) -> anyhow::Result<Option<JavaRuntime>> {
    if let Ok(java) = which::which("java")
        && current_java_major(&java).await == Some(major)
    {
        info!("java jdk={major} outcome=reused binary={}", java.display());
        let rt = JavaRuntime::from_binary(&java);
        set_alternatives(&rt).await;
        return Ok(Some(rt));
    }

    let arch = corretto_arch(std::env::consts::ARCH)?;
    let url = corretto_url(major, arch);
    let deb = std::env::temp_dir().join(format!("amazon-corretto-{major}.deb"));
    info!("java jdk={major} attempt=install url={url}");
    let res = async {
        install::download_to(&url, &deb).await?;
        install_deb(&deb).await
    }
    .await;
    if deb.exists()
        && let Err(e) = std::fs::remove_file(&deb)
    {
        warn!("java cleanup={} err={e}", deb.display());
    }
    res.with_context(|| format!("install Corretto JDK {major}"))?;

    match which::which("java") {
        Ok(java) => {
            let rt = JavaRuntime::from_binary(&java);
            info!("java jdk={major} outcome=installed home={}", rt.java_home.display());
            set_alternatives(&rt).await;
            Ok(Some(rt))
        }
        Err(_) => {
            warn!("java jdk={major} outcome=binary_missing_after_install");
            Ok(None)
        }
    }
}
