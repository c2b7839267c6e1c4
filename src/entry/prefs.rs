use anyhow::Context as _;
use std::path::Path;
use tracing::{info, warn};
use xmltree::Element;

use crate::entry::callback;
use crate::entry::config::{ConnectionSettings, Layout, Settings};
use crate::entry::facility::{self, FacilityOptions, OfficeProbe};
use crate::entry::volumes;
use crate::entry::xml;

/// What a reconciliation pass changed, plus the java options for the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrefsReport {
    pub java_options: String,
    pub connection_updated: bool,
    pub facilities_updated: bool,
    pub volumes_updated: bool,
}

/// Environment-dependent collaborators, injectable for tests.
pub struct Probes<'a> {
    pub office: &'a OfficeProbe,
    pub is_executable: &'a dyn Fn(&Path) -> bool,
    pub detect_host: &'a dyn Fn() -> Option<String>,
}

/// Switch the connection element to a fixed port range. A `port-range` connection is
/// preferred over a `standard` one.
pub fn apply_connection(root: &mut Element, conn: &ConnectionSettings) -> bool {
    let kind = ["port-range", "standard"].into_iter().find(|kind| {
        xml::find_first(root, &xml::named_with_attr("connection", "type", kind)).is_some()
    });
    let Some(el) = kind.and_then(|kind| {
        xml::find_first_mut(root, &xml::named_with_attr("connection", "type", kind))
    }) else {
        warn!("prefs connection=<missing> outcome=skipped");
        return false;
    };
    xml::set_attr(el, "type", "port-range");
    xml::set_attr(el, "client-map-host-from", conn.map_host_from.as_str());
    xml::set_attr(el, "client-map-host-to", conn.map_host_to.as_str());
    xml::set_attr(el, "client-map-port-from", conn.map_port_from.as_str());
    xml::set_attr(el, "client-map-port-to", conn.map_port_to.as_str());
    xml::set_attr(el, "server-port-range-from", conn.port_from.as_str());
    xml::set_attr(el, "server-port-range-to", conn.port_to.as_str());
    info!(
        "prefs connection=port-range range={}-{} map_host={}-{} map_port={}-{}",
        conn.port_from,
        conn.port_to,
        conn.map_host_from,
        conn.map_host_to,
        conn.map_port_from,
        conn.map_port_to
    );
    true
}

/// Instance count and per-facility settings.
pub fn apply_facilities(root: &mut Element, settings: &Settings, probes: &Probes<'_>) -> bool {
    let Some(facilities) = xml::find_first_mut(root, &|e: &Element| e.name == "facilities") else {
        warn!("prefs facilities=<missing> outcome=skipped");
        return false;
    };
    xml::set_attr(facilities, "instances", settings.svc_instances.as_str());
    info!("prefs facilities instances={}", settings.svc_instances);
    facility::reconcile_facilities(
        facilities,
        &FacilityOptions {
            timeouts: &settings.facility_timeouts,
            auto_enable: settings.facility_auto_enable,
            office: probes.office,
            is_executable: probes.is_executable,
        },
    );
    true
}

/// Reconcile the preferences document for `SVC_HOST`/`SVC_USER`, then the shared hosts
/// document. The preferences document must exist.
pub fn reconcile_preferences(
    settings: &Settings,
    layout: &Layout,
    probes: &Probes<'_>,
) -> anyhow::Result<PrefsReport> {
    if let Some(host) = settings.callback_host.as_deref() {
        info!("prefs callback_host={host} source=SERVICECLIENT_CALLBACK_HOST");
    }
    let java_options = callback::apply_callback_host(
        settings.callback_host.as_deref(),
        &settings.java_options,
        probes.detect_host,
    );

    let path = layout.preferences_path(&settings.svc_host, &settings.svc_user);
    let mut root = xml::load_document(&path)
        .with_context(|| format!("load service client preferences {}", path.display()))?;

    let connection_updated = apply_connection(&mut root, &settings.connection);
    let facilities_updated = apply_facilities(&mut root, settings, probes);
    let volumes_updated =
        volumes::reconcile_volumes(&layout.hosts_path(), settings.volumes_info.as_deref())?;

    xml::write_document(&path, &root)?;
    info!("prefs path={} outcome=updated", path.display());

    Ok(PrefsReport {
        java_options,
        connection_updated,
        facilities_updated,
        volumes_updated,
    })
}

/// Probe the office endpoint and reconcile against the live system.
pub async fn configure(settings: &Settings, layout: &Layout) -> anyhow::Result<PrefsReport> {
    let office =
        facility::probe_office(settings.office_url.as_deref(), settings.office_validate_certs).await;
    reconcile_preferences(
        settings,
        layout,
        &Probes {
            office: &office,
            is_executable: &facility::is_executable_file,
            detect_host: &callback::detect_callback_host,
        },
    )
}
