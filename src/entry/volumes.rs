use anyhow::Context as _;
use serde_json::Value;
use std::path::Path;
use tracing::{info, warn};
use xmltree::{Element, XMLNode};

use crate::entry::xml;

/// One `<volume>` element: the filesystem name plus its attributes, in input order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeEntry {
    pub filesystem_name: String,
    pub attributes: Vec<(String, String)>,
}

/// Attribute text for a JSON value; `None` for `null`.
pub fn render_attr_value(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::Bool(b) => Some(b.to_string()),
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Array(_) | Value::Object(_) => Some(value.to_string()),
    }
}

/// Parse `VOLUMES_INFO`: a JSON object mapping filesystem names to attribute objects.
pub fn parse_volumes_info(raw: &str) -> anyhow::Result<Vec<VolumeEntry>> {
    let value: Value = serde_json::from_str(raw).context("VOLUMES_INFO is not valid JSON")?;
    let Value::Object(map) = value else {
        anyhow::bail!("VOLUMES_INFO is not a JSON object");
    };
    let mut entries = Vec::with_capacity(map.len());
    for (name, attrs) in map {
        let attributes = match attrs {
            Value::Object(attrs) => attrs
                .iter()
                .filter_map(|(k, v)| render_attr_value(v).map(|v| (k.clone(), v)))
                .collect(),
            Value::Null => Vec::new(),
            other => {
                warn!("volumes filesystem={name} attributes={other} outcome=ignored reason=not_an_object");
                Vec::new()
            }
        };
        entries.push(VolumeEntry {
            filesystem_name: name,
            attributes,
        });
    }
    Ok(entries)
}

fn volumes_element(entries: &[VolumeEntry]) -> Element {
    let mut volumes = Element::new("volumes");
    for entry in entries {
        let mut volume = Element::new("volume");
        xml::set_attr(&mut volume, "filesystemname", entry.filesystem_name.as_str());
        for (k, v) in &entry.attributes {
            if k == "filesystemname" {
                continue;
            }
            xml::set_attr(&mut volume, k, v.as_str());
        }
        volumes.children.push(XMLNode::Element(volume));
    }
    volumes
}

/// Rewrite the volumes block of every `<host>` in the tree. Returns the number of
/// hosts touched.
pub fn apply_volumes(root: &mut Element, entries: &[VolumeEntry]) -> usize {
    let mut hosts = 0;
    xml::for_each_named_mut(root, "host", &mut |host: &mut Element| {
        hosts += 1;
        xml::remove_children_named(host, "volumes");
        if xml::children_named(host, "censhare-vfs").next().is_none() {
            let mut vfs = Element::new("censhare-vfs");
            xml::set_attr(&mut vfs, "use", "0");
            host.children.push(XMLNode::Element(vfs));
        }
        host.children
            .push(XMLNode::Element(volumes_element(entries)));
    });
    hosts
}

/// Apply `VOLUMES_INFO` to the hosts document. Absent or malformed input leaves the
/// document alone; a missing or unparsable document is an error once input is present.
/// Returns whether the document was rewritten.
pub fn reconcile_volumes(hosts_path: &Path, volumes_info: Option<&str>) -> anyhow::Result<bool> {
    let Some(raw) = volumes_info else {
        info!("volumes VOLUMES_INFO=unset outcome=skipped");
        return Ok(false);
    };
    let entries = match parse_volumes_info(raw) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("volumes outcome=skipped err={e:#}");
            return Ok(false);
        }
    };
    let mut root = xml::load_document(hosts_path)
        .with_context(|| format!("load hosts document {}", hosts_path.display()))?;
    let hosts = apply_volumes(&mut root, &entries);
    xml::write_document(hosts_path, &root)?;
    info!(
        "volumes path={} hosts={hosts} volumes={}",
        hosts_path.display(),
        entries.len()
    );
    Ok(true)
}
