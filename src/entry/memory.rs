use anyhow::Context as _;
use serde::Deserialize;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use crate::entry::config::{Layout, Settings};

pub const MIB: u64 = 1024 * 1024;
pub const GIB: u64 = 1024 * MIB;

/// cgroup v1 reports "no limit" as `LONG_MAX` rounded down to the page size.
pub const CGROUP_V1_UNLIMITED: u64 = 9_223_372_036_854_771_712;

const ECS_METADATA_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemorySource {
    Ecs,
    CgroupV2,
    CgroupV1,
    Host,
}

impl MemorySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemorySource::Ecs => "ecs",
            MemorySource::CgroupV2 => "cgroup_v2",
            MemorySource::CgroupV1 => "cgroup_v1",
            MemorySource::Host => "host",
        }
    }
}

impl fmt::Display for MemorySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Effective memory ceiling visible to this container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryLimit {
    pub bytes: u64,
    pub source: MemorySource,
}

/// Where to look for the memory ceiling.
#[derive(Debug, Clone)]
pub struct MemoryProbe {
    pub ecs_metadata_uri: Option<String>,
    pub cgroup_v2_memory_max: PathBuf,
    pub cgroup_v1_memory_limit: PathBuf,
    /// Total physical memory of the host, in bytes.
    pub host_total: u64,
}

impl MemoryProbe {
    pub fn from_config(settings: &Settings, layout: &Layout) -> Self {
        Self {
            ecs_metadata_uri: settings.ecs_metadata_uri.clone(),
            cgroup_v2_memory_max: layout.cgroup_v2_memory_max.clone(),
            cgroup_v1_memory_limit: layout.cgroup_v1_memory_limit.clone(),
            host_total: host_total_memory(),
        }
    }
}

pub fn host_total_memory() -> u64 {
    let mut sys = sysinfo::System::new();
    sys.refresh_memory();
    sys.total_memory()
}

/// Resolve the memory ceiling: ECS task metadata, cgroup v2, cgroup v1, host total.
/// Never fails; every source has a fallback.
pub async fn resolve_memory_limit(probe: &MemoryProbe) -> MemoryLimit {
    let ecs = match probe.ecs_metadata_uri.as_deref() {
        Some(uri) => match fetch_ecs_memory_bytes(uri).await {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!("memory source=ecs outcome=unavailable err={e:#}");
                None
            }
        },
        None => None,
    };
    resolve_local(probe, ecs)
}

/// Resolution once the ECS lookup (if any) has been attempted.
pub fn resolve_local(probe: &MemoryProbe, ecs_bytes: Option<u64>) -> MemoryLimit {
    let limit = if let Some(bytes) = ecs_bytes {
        MemoryLimit {
            bytes,
            source: MemorySource::Ecs,
        }
    } else if let Some(bytes) = read_cgroup_v2(&probe.cgroup_v2_memory_max, probe.host_total) {
        MemoryLimit {
            bytes,
            source: MemorySource::CgroupV2,
        }
    } else if let Some(bytes) = read_cgroup_v1(&probe.cgroup_v1_memory_limit, probe.host_total) {
        MemoryLimit {
            bytes,
            source: MemorySource::CgroupV1,
        }
    } else {
        MemoryLimit {
            bytes: probe.host_total,
            source: MemorySource::Host,
        }
    };
    info!(
        "memory source={} bytes={} mib={}",
        limit.source,
        limit.bytes,
        limit.bytes / MIB
    );
    limit
}

#[derive(Debug, Deserialize)]
struct EcsTaskMetadata {
    #[serde(rename = "Limits")]
    limits: Option<EcsLimits>,
}

#[derive(Debug, Deserialize)]
struct EcsLimits {
    #[serde(rename = "Memory")]
    memory: Option<f64>,
}

/// Parse the `Limits.Memory` field (whole MiB) of an ECS `/task` response into bytes.
pub fn parse_ecs_task_memory(body: &str) -> anyhow::Result<u64> {
    let meta: EcsTaskMetadata =
        serde_json::from_str(body).context("parse ECS task metadata")?;
    let mb = meta
        .limits
        .and_then(|l| l.memory)
        .ok_or_else(|| anyhow::anyhow!("ECS task metadata has no Limits.Memory"))?;
    anyhow::ensure!(mb.is_finite() && mb > 0.0, "ECS Limits.Memory is not positive: {mb}");
    anyhow::ensure!(mb < u64::MAX as f64, "ECS Limits.Memory is out of range: {mb}");
    let bytes = (mb as u64)
        .checked_mul(MIB)
        .ok_or_else(|| anyhow::anyhow!("ECS Limits.Memory overflows a byte count: {mb}"))?;
    anyhow::ensure!(bytes > 0, "ECS Limits.Memory is below 1 MiB: {mb}");
    Ok(bytes)
}

async fn fetch_ecs_memory_bytes(uri: &str) -> anyhow::Result<u64> {
    let url = format!("{}/task", uri.trim_end_matches('/'));
    let client = reqwest::Client::builder()
        .timeout(ECS_METADATA_TIMEOUT)
        .build()
        .context("build HTTP client")?;
    let resp = client
        .get(&url)
        .send()
        .await
        .with_context(|| format!("GET {url}"))?;
    let status = resp.status();
    anyhow::ensure!(status == reqwest::StatusCode::OK, "GET {url} returned {status}");
    let body = resp.text().await.with_context(|| format!("read body of {url}"))?;
    parse_ecs_task_memory(&body)
}

fn read_trimmed_opt(path: &Path) -> anyhow::Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(s) => Ok(Some(s.trim().to_string()).filter(|s| !s.is_empty())),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("read {}", path.display())),
    }
}

/// cgroup v2 `memory.max`: bytes, or `max` for no limit.
fn read_cgroup_v2(path: &Path, host_total: u64) -> Option<u64> {
    let raw = match read_trimmed_opt(path) {
        Ok(Some(raw)) => raw,
        Ok(None) => return None,
        Err(e) => {
            warn!("memory source=cgroup_v2 outcome=unreadable err={e:#}");
            return None;
        }
    };
    if raw == "max" {
        return Some(host_total);
    }
    match raw.parse::<u64>() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(
                "memory source=cgroup_v2 outcome=unexpected_value path={} value={raw:?}",
                path.display()
            );
            None
        }
    }
}

/// cgroup v1 `memory.limit_in_bytes`: `0` or the page-rounded `LONG_MAX` mean no limit.
fn read_cgroup_v1(path: &Path, host_total: u64) -> Option<u64> {
    let raw = match read_trimmed_opt(path) {
        Ok(Some(raw)) => raw,
        Ok(None) => return None,
        Err(e) => {
            warn!("memory source=cgroup_v1 outcome=unreadable err={e:#}");
            return None;
        }
    };
    match raw.parse::<u64>() {
        Ok(0) => Some(host_total),
        Ok(v) if v >= CGROUP_V1_UNLIMITED => Some(host_total),
        Ok(v) => Some(v),
        Err(_) => {
            warn!(
                "memory source=cgroup_v1 outcome=unexpected_value path={} value={raw:?}",
                path.display()
            );
            None
        }
    }
}

#[cfg(test)]
mod tests;
