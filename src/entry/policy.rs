use anyhow::Context as _;
use std::path::Path;
use std::time::Duration;
use tokio::process::Command;
use tracing::{info, warn};
use xmltree::{Element, XMLNode};

use crate::entry::config::{Layout, Settings};
use crate::entry::memory::{GIB, MIB};
use crate::entry::xml;

pub const RESOURCE_DOMAIN: &str = "resource";
pub const DISK_LIMIT: &str = "8GiB";
pub const THREAD_LIMIT: u32 = 1;

const LIST_RESOURCE_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-process ImageMagick resource limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicyLimits {
    pub memory_mb: u64,
    pub map_mb: u64,
    pub area_kp: u64,
    pub thread: u32,
}

impl PolicyLimits {
    /// Split `ceiling` (minus the buffer) across `instances` workers, never going below
    /// 1 GiB per process.
    pub fn compute(ceiling: u64, instances: u64, buffer_fraction: f64) -> Self {
        let buffer = (ceiling as f64 * buffer_fraction).floor() as u64;
        let available = ceiling.saturating_sub(buffer);
        let per_process = (available / instances.max(1)).max(GIB);
        let memory_mb = per_process / MIB;
        Self {
            memory_mb,
            map_mb: 2 * memory_mb,
            area_kp: memory_mb * 1024,
            thread: THREAD_LIMIT,
        }
    }

    /// `(name, value)` pairs in the order they are written to the policy document.
    pub fn entries(&self) -> Vec<(&'static str, String)> {
        vec![
            ("memory", format!("{}MiB", self.memory_mb)),
            ("map", format!("{}MiB", self.map_mb)),
            ("area", format!("{}KP", self.area_kp)),
            ("disk", DISK_LIMIT.to_string()),
            ("thread", self.thread.to_string()),
        ]
    }
}

fn is_resource_policy(name: &str) -> impl Fn(&Element) -> bool + '_ {
    move |e: &Element| {
        e.name == "policy"
            && xml::attr(e, "domain") == Some(RESOURCE_DOMAIN)
            && xml::attr(e, "name") == Some(name)
    }
}

/// Upsert the resource policies into an already-parsed policy document.
pub fn apply_limits(root: &mut Element, limits: &PolicyLimits) {
    for (name, value) in limits.entries() {
        if let Some(el) = xml::find_first_mut(root, &is_resource_policy(name)) {
            xml::set_attr(el, "value", value);
            continue;
        }
        let mut el = Element::new("policy");
        xml::set_attr(&mut el, "domain", RESOURCE_DOMAIN);
        xml::set_attr(&mut el, "name", name);
        xml::set_attr(&mut el, "value", value);
        root.children.push(XMLNode::Element(el));
    }
}

/// Load the policy document at `path`, upsert the limits and write it back.
/// The document must already exist and be well-formed.
pub fn write_policy(path: &Path, limits: &PolicyLimits) -> anyhow::Result<()> {
    let mut root = xml::load_document(path)
        .with_context(|| format!("load ImageMagick policy {}", path.display()))?;
    apply_limits(&mut root, limits);
    xml::write_document(path, &root)?;
    info!(
        "policy path={} memory={}MiB map={}MiB area={}KP disk={DISK_LIMIT} thread={}",
        path.display(),
        limits.memory_mb,
        limits.map_mb,
        limits.area_kp,
        limits.thread
    );
    Ok(())
}

/// Size and write the resource policy for the given memory ceiling. The instance count
/// always comes from the validated settings.
pub async fn apply_resource_policy(
    settings: &Settings,
    layout: &Layout,
    ceiling: u64,
) -> anyhow::Result<PolicyLimits> {
    let instances = settings.instance_count();
    let limits = PolicyLimits::compute(ceiling, instances, settings.buffer_fraction);
    info!(
        "policy ceiling={ceiling} instances={instances} buffer_fraction={} per_process_mib={}",
        settings.buffer_fraction, limits.memory_mb
    );
    write_policy(&layout.policy_path, &limits)?;
    report_effective_resources(&layout.magick).await;
    Ok(limits)
}

/// Ask the image tool which limits it actually picked up. Failures are logged only.
pub async fn report_effective_resources(magick: &Path) {
    let mut cmd = Command::new(magick);
    cmd.args(["-list", "resource"]).kill_on_drop(true);
    match tokio::time::timeout(LIST_RESOURCE_TIMEOUT, cmd.output()).await {
        Ok(Ok(out)) if out.status.success() => {
            let text = String::from_utf8_lossy(&out.stdout);
            info!("policy effective resources:\n{}", text.trim_end());
        }
        Ok(Ok(out)) => {
            warn!(
                "policy check={} -list resource exit={} stderr={}",
                magick.display(),
                out.status,
                String::from_utf8_lossy(&out.stderr).trim()
            );
        }
        Ok(Err(e)) => warn!("policy check={} -list resource err={e}", magick.display()),
        Err(_) => warn!("policy check={} -list resource timed out", magick.display()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const POLICY: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<policymap>
  <policy domain="resource" name="memory" value="256MiB"/>
  <policy domain="resource" name="disk" value="1GiB"/>
  <policy domain="coder" rights="none" pattern="PS"/>
</policymap>
"#;

    fn value_of(root: &Element, name: &str) -> Option<String> {
        xml::find_first(root, &is_resource_policy(name))
            .and_then(|e| xml::attr(e, "value"))
            .map(str::to_string)
    }

    #[test]
    fn test_compute_splits_available_memory() {
        let l = PolicyLimits::compute(16 * GIB, 4, 0.2);
        // 16 GiB - 20% = 13107.2 MiB, floor(bytes) / 4
        let expected = (16 * GIB - (16 * GIB) / 5) / 4 / MIB;
        assert_eq!(l.memory_mb, expected);
        assert_eq!(l.map_mb, 2 * l.memory_mb);
        assert_eq!(l.area_kp, l.memory_mb * 1024);
        assert_eq!(l.thread, 1);
        assert!(l.memory_mb * 4 * MIB <= 16 * GIB - (16 * GIB) / 5);
    }

    #[test]
    fn test_compute_applies_one_gib_floor() {
        let l = PolicyLimits::compute(2 * GIB, 8, 0.1);
        assert_eq!(l.memory_mb, 1024);
        assert_eq!(l.map_mb, 2048);
    }

    #[test]
    fn test_floor_and_map_invariants_hold_across_inputs() {
        for ceiling in [1, MIB, 512 * MIB, GIB, 3 * GIB + 7, 64 * GIB, u64::MAX / 4] {
            for instances in [1, 2, 3, 4, 16, 1000] {
                let l = PolicyLimits::compute(ceiling, instances, 0.1);
                assert!(l.memory_mb * MIB >= GIB, "ceiling={ceiling} instances={instances}");
                assert_eq!(l.map_mb, 2 * l.memory_mb);
            }
        }
    }

    #[test]
    fn test_zero_instances_is_treated_as_one() {
        assert_eq!(
            PolicyLimits::compute(8 * GIB, 0, 0.0),
            PolicyLimits::compute(8 * GIB, 1, 0.0)
        );
    }

    #[test]
    fn test_entries_render_units() {
        let l = PolicyLimits::compute(4 * GIB, 1, 0.0);
        let entries = l.entries();
        assert_eq!(entries[0], ("memory", "4096MiB".to_string()));
        assert_eq!(entries[1], ("map", "8192MiB".to_string()));
        assert_eq!(entries[2], ("area", "4194304KP".to_string()));
        assert_eq!(entries[3], ("disk", "8GiB".to_string()));
        assert_eq!(entries[4], ("thread", "1".to_string()));
    }

    #[test]
    fn test_write_policy_updates_in_place_and_appends_missing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("policy.xml");
        std::fs::write(&path, POLICY).unwrap();

        let limits = PolicyLimits::compute(8 * GIB, 2, 0.0);
        write_policy(&path, &limits).unwrap();

        let root = xml::load_document(&path).unwrap();
        assert_eq!(value_of(&root, "memory").as_deref(), Some("4096MiB"));
        assert_eq!(value_of(&root, "map").as_deref(), Some("8192MiB"));
        assert_eq!(value_of(&root, "area").as_deref(), Some("4194304KP"));
        assert_eq!(value_of(&root, "disk").as_deref(), Some("8GiB"));
        assert_eq!(value_of(&root, "thread").as_deref(), Some("1"));

        let policies: Vec<&Element> = xml::children_named(&root, "policy").collect();
        assert_eq!(policies.len(), 6);
        // existing entries keep their position, the unrelated coder policy is untouched
        assert_eq!(xml::attr(policies[0], "name"), Some("memory"));
        assert_eq!(xml::attr(policies[2], "pattern"), Some("PS"));

        // second pass is a no-op
        let first = std::fs::read(&path).unwrap();
        write_policy(&path, &limits).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), first);
    }

    #[test]
    fn test_write_policy_rejects_malformed_document() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("policy.xml");
        std::fs::write(&path, "<policymap><policy").unwrap();
        let limits = PolicyLimits::compute(8 * GIB, 2, 0.0);
        assert!(write_policy(&path, &limits).is_err());
        assert!(write_policy(&dir.path().join("missing.xml"), &limits).is_err());
    }

    #[tokio::test]
    async fn test_missing_magick_binary_is_not_fatal() {
        report_effective_resources(Path::new("/nonexistent/magick")).await;
    }
}
