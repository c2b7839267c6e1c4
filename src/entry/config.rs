use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Snapshot of the process environment, taken once at startup.
pub type EnvMap = BTreeMap<String, String>;

pub const DEFAULT_RMI_PORT: &str = "30550";
pub const DEFAULT_SVC_INSTANCES: &str = "4";
pub const DEFAULT_INSTANCE_COUNT: u64 = 4;
pub const DEFAULT_BUFFER_FRACTION: f64 = 0.10;

pub fn snapshot_env() -> EnvMap {
    std::env::vars().collect()
}

/// Everything the entrypoint reads from the environment, validated up front.
#[derive(Debug, Clone)]
pub struct Settings {
    pub svc_user: String,
    pub svc_pass: String,
    pub svc_host: String,

    pub version: Option<String>,
    pub repo_user: Option<String>,
    pub repo_pass: Option<String>,

    /// Written verbatim into `facilities@instances`.
    pub svc_instances: String,

    pub office_url: Option<String>,
    pub office_validate_certs: bool,

    pub callback_host: Option<String>,
    /// Current `SERVICECLIENT_JAVA_OPTIONS` (trimmed, may be empty).
    pub java_options: String,

    pub connection: ConnectionSettings,

    /// `<KEY>_TIMEOUT` overrides, keyed by the upper-cased facility key.
    pub facility_timeouts: BTreeMap<String, String>,
    pub facility_auto_enable: bool,

    /// Raw `VOLUMES_INFO` payload; parsed by the volumes reconciler.
    pub volumes_info: Option<String>,

    pub buffer_fraction: f64,
    pub ecs_metadata_uri: Option<String>,
}

/// How the client's RMI listener is addressed from the outside.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub port_from: String,
    pub port_to: String,
    pub map_host_from: String,
    pub map_host_to: String,
    pub map_port_from: String,
    pub map_port_to: String,
}

fn non_empty(env: &EnvMap, key: &str) -> Option<String> {
    env.get(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn is_numeric(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_digit())
}

/// `true|1|t|y|yes` (any case) is true; everything else is false.
pub fn str_to_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "true" | "1" | "t" | "y" | "yes"
    )
}

/// Server port range bounds. A non-numeric lower bound falls back to the default port;
/// the upper bound falls back to the lower bound.
pub fn resolve_port_range(port: Option<&str>, port_to: Option<&str>) -> (String, String) {
    let from = match port {
        None => DEFAULT_RMI_PORT.to_string(),
        Some(p) if is_numeric(p) => p.to_string(),
        Some(p) => {
            warn!("SERVICECLIENT_RMI_PORT {p:?} is not numeric; falling back to {DEFAULT_RMI_PORT}");
            DEFAULT_RMI_PORT.to_string()
        }
    };
    let to = match port_to {
        None => from.clone(),
        Some(p) if is_numeric(p) => p.to_string(),
        Some(p) => {
            warn!("SERVICECLIENT_RMI_PORT_TO {p:?} is not numeric; falling back to {from}");
            from.clone()
        }
    };
    (from, to)
}

/// When only one side of a from/to pair is supplied, the other side mirrors it.
pub fn mirror_pair(from: Option<String>, to: Option<String>) -> (String, String) {
    match (from, to) {
        (Some(f), Some(t)) => (f, t),
        (Some(f), None) => (f.clone(), f),
        (None, Some(t)) => (t.clone(), t),
        (None, None) => (String::new(), String::new()),
    }
}

/// Parse `IMAGEMAGICK_BUFFER_PERCENTAGE`. Values in `[0, 1)` are fractions, values in
/// `(1, 100]` are percentages. A trailing `%` is allowed.
pub fn parse_buffer_fraction(raw: Option<&str>) -> f64 {
    let Some(raw) = raw else {
        return DEFAULT_BUFFER_FRACTION;
    };
    let t = raw.trim().trim_end_matches('%');
    match t.parse::<f64>() {
        Ok(v) if (0.0..1.0).contains(&v) => v,
        Ok(v) if v > 1.0 && v <= 100.0 => v / 100.0,
        _ => {
            warn!(
                "IMAGEMAGICK_BUFFER_PERCENTAGE {raw:?} is not a usable fraction; using {DEFAULT_BUFFER_FRACTION}"
            );
            DEFAULT_BUFFER_FRACTION
        }
    }
}

impl Settings {
    pub fn from_env(env: &EnvMap) -> anyhow::Result<Settings> {
        let svc_user = non_empty(env, "SVC_USER");
        let svc_pass = non_empty(env, "SVC_PASS");
        let svc_host = non_empty(env, "SVC_HOST");
        let (Some(svc_user), Some(svc_pass), Some(svc_host)) = (svc_user, svc_pass, svc_host) else {
            anyhow::bail!("required variables (SVC_USER, SVC_PASS, SVC_HOST) are not set");
        };

        let (port_from, port_to) = resolve_port_range(
            env.get("SERVICECLIENT_RMI_PORT").map(|s| s.trim()),
            non_empty(env, "SERVICECLIENT_RMI_PORT_TO").as_deref(),
        );
        let (map_host_from, map_host_to) = mirror_pair(
            non_empty(env, "CLIENT_MAP_HOST_FROM"),
            non_empty(env, "CLIENT_MAP_HOST_TO"),
        );
        let (map_port_from, map_port_to) = mirror_pair(
            non_empty(env, "CLIENT_MAP_PORT_FROM"),
            non_empty(env, "CLIENT_MAP_PORT_TO"),
        );

        let facility_timeouts = env
            .iter()
            .filter_map(|(k, v)| {
                let key = k.strip_suffix("_TIMEOUT")?;
                let v = v.trim();
                if key.is_empty() || v.is_empty() {
                    return None;
                }
                Some((key.to_string(), v.to_string()))
            })
            .collect();

        let svc_instances =
            non_empty(env, "SVC_INSTANCES").unwrap_or_else(|| DEFAULT_SVC_INSTANCES.to_string());

        Ok(Settings {
            svc_user,
            svc_pass,
            svc_host,
            version: non_empty(env, "VERSION"),
            repo_user: non_empty(env, "REPO_USER"),
            repo_pass: non_empty(env, "REPO_PASS"),
            svc_instances,
            office_url: non_empty(env, "OFFICE_URL"),
            office_validate_certs: non_empty(env, "OFFICE_VALIDATE_CERTS")
                .map(|v| str_to_bool(&v))
                .unwrap_or(true),
            callback_host: non_empty(env, "SERVICECLIENT_CALLBACK_HOST"),
            java_options: non_empty(env, "SERVICECLIENT_JAVA_OPTIONS").unwrap_or_default(),
            connection: ConnectionSettings {
                port_from,
                port_to,
                map_host_from,
                map_host_to,
                map_port_from,
                map_port_to,
            },
            facility_timeouts,
            facility_auto_enable: non_empty(env, "FACILITY_AUTO_ENABLE")
                .map(|v| str_to_bool(&v))
                .unwrap_or(true),
            volumes_info: non_empty(env, "VOLUMES_INFO"),
            buffer_fraction: parse_buffer_fraction(
                non_empty(env, "IMAGEMAGICK_BUFFER_PERCENTAGE").as_deref(),
            ),
            ecs_metadata_uri: non_empty(env, "ECS_CONTAINER_METADATA_URI_V4"),
        })
    }

    /// Worker-instance count for the resource policy. Falls back to the default when
    /// `SVC_INSTANCES` is not a positive integer.
    pub fn instance_count(&self) -> u64 {
        match self.svc_instances.parse::<u64>() {
            Ok(n) if n > 0 => n,
            _ => {
                warn!(
                    "SVC_INSTANCES {:?} is not a positive integer; sizing policy for {DEFAULT_INSTANCE_COUNT}",
                    self.svc_instances
                );
                DEFAULT_INSTANCE_COUNT
            }
        }
    }

    /// Credentials needed to download the client archive.
    pub fn repo_credentials(&self) -> anyhow::Result<(&str, &str, &str)> {
        match (
            self.repo_user.as_deref(),
            self.repo_pass.as_deref(),
            self.version.as_deref(),
        ) {
            (Some(u), Some(p), Some(v)) => Ok((u, p, v)),
            _ => anyhow::bail!(
                "service client not pre-installed and required variables (REPO_USER, REPO_PASS, VERSION) are not set"
            ),
        }
    }
}

/// Filesystem layout and fixed tool locations.
#[derive(Debug, Clone, PartialEq)]
pub struct Layout {
    pub install_root: PathBuf,
    pub install_dir: PathBuf,
    pub version_file: PathBuf,
    pub repo_host: String,
    pub service_user: String,
    pub service_group: String,

    pub cgroup_v2_memory_max: PathBuf,
    pub cgroup_v1_memory_limit: PathBuf,

    pub policy_path: PathBuf,
    pub magick: PathBuf,

    pub icc_sources: Vec<PathBuf>,
}

impl Default for Layout {
    fn default() -> Self {
        Self {
            install_root: default_install_root(),
            install_dir: default_install_dir(),
            version_file: default_version_file(),
            repo_host: default_repo_host(),
            service_user: default_service_user(),
            service_group: default_service_user(),
            cgroup_v2_memory_max: default_cgroup_v2_memory_max(),
            cgroup_v1_memory_limit: default_cgroup_v1_memory_limit(),
            policy_path: default_policy_path(),
            magick: default_magick(),
            icc_sources: default_icc_sources(),
        }
    }
}

impl Layout {
    pub fn serviceclient_script(&self) -> PathBuf {
        self.install_dir.join("serviceclient.sh")
    }

    pub fn preferences_path(&self, host: &str, user: &str) -> PathBuf {
        self.install_dir
            .join("config")
            .join(".hosts")
            .join(host)
            .join(format!("serviceclient-preferences-{user}.xml"))
    }

    pub fn hosts_path(&self) -> PathBuf {
        self.install_dir.join("config").join("hosts.xml")
    }

    pub fn startup_log(&self) -> PathBuf {
        self.install_dir.join("logs").join("startup.log")
    }

    pub fn service_log(&self) -> PathBuf {
        self.install_dir
            .join("logs")
            .join("service-client-internal-0.0.log")
    }

    pub fn icc_target(&self) -> PathBuf {
        self.install_dir.join("iccprofiles")
    }
}

// -------- YAML file schema (grouped only; strict) --------

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct InstallConfigFile {
    #[serde(default = "default_install_root")]
    root: PathBuf,
    #[serde(default = "default_install_dir")]
    dir: PathBuf,
    #[serde(default = "default_version_file")]
    version_file: PathBuf,
    #[serde(default = "default_repo_host")]
    repo_host: String,
    #[serde(default = "default_service_user")]
    service_user: String,
    #[serde(default)]
    service_group: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct CgroupConfigFile {
    #[serde(default = "default_cgroup_v2_memory_max")]
    v2_memory_max: PathBuf,
    #[serde(default = "default_cgroup_v1_memory_limit")]
    v1_memory_limit: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct ImageMagickConfigFile {
    #[serde(default = "default_policy_path")]
    policy: PathBuf,
    #[serde(default = "default_magick")]
    magick: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct IccProfilesConfigFile {
    #[serde(default = "default_icc_sources")]
    sources: Vec<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct LayoutConfigFile {
    #[serde(default)]
    install: Option<InstallConfigFile>,
    #[serde(default)]
    cgroup: Option<CgroupConfigFile>,
    #[serde(default)]
    imagemagick: Option<ImageMagickConfigFile>,
    #[serde(default)]
    icc_profiles: Option<IccProfilesConfigFile>,
}

fn default_install_root() -> PathBuf {
    "/opt/corpus".into()
}
fn default_install_dir() -> PathBuf {
    "/opt/corpus/censhare/censhare-Service-Client".into()
}
fn default_version_file() -> PathBuf {
    "/opt/corpus/censhare/client-version.txt".into()
}
fn default_repo_host() -> String {
    "rpm.censhare.com".to_string()
}
fn default_service_user() -> String {
    "corpus".to_string()
}
fn default_cgroup_v2_memory_max() -> PathBuf {
    "/sys/fs/cgroup/memory.max".into()
}
fn default_cgroup_v1_memory_limit() -> PathBuf {
    "/sys/fs/cgroup/memory/memory.limit_in_bytes".into()
}
fn default_policy_path() -> PathBuf {
    "/usr/local/etc/ImageMagick-7/policy.xml".into()
}
fn default_magick() -> PathBuf {
    "/usr/local/bin/magick".into()
}
fn default_icc_sources() -> Vec<PathBuf> {
    vec!["/build_iccprofiles".into(), "/iccprofiles".into()]
}

/// Load the layout: defaults, overlaid by the optional YAML file.
pub fn load_layout(config_path: Option<&Path>) -> anyhow::Result<Layout> {
    let Some(config_path) = config_path else {
        return Ok(Layout::default());
    };
    let raw = std::fs::read_to_string(config_path)
        .map_err(|e| anyhow::anyhow!("failed to read config {}: {e}", config_path.display()))?;
    parse_layout(&raw, config_path)
}

pub fn parse_layout(raw: &str, config_path: &Path) -> anyhow::Result<Layout> {
    let file_cfg: LayoutConfigFile = serde_yaml::from_str(raw)
        .map_err(|e| anyhow::anyhow!("failed to parse config {}: {e}", config_path.display()))?;

    let mut cfg = Layout::default();

    if let Some(inst) = file_cfg.install {
        cfg.install_root = inst.root;
        cfg.install_dir = inst.dir;
        cfg.version_file = inst.version_file;
        cfg.repo_host = inst.repo_host.trim().to_string();
        cfg.service_user = inst.service_user.trim().to_string();
        cfg.service_group = inst
            .service_group
            .map(|g| g.trim().to_string())
            .unwrap_or_else(|| cfg.service_user.clone());
        anyhow::ensure!(!cfg.repo_host.is_empty(), "install.repo_host must not be empty");
        anyhow::ensure!(
            !cfg.service_user.is_empty(),
            "install.service_user must not be empty"
        );
        anyhow::ensure!(
            !cfg.service_group.is_empty(),
            "install.service_group must not be empty (omit it to use the service user)"
        );
    }
    if let Some(cg) = file_cfg.cgroup {
        cfg.cgroup_v2_memory_max = cg.v2_memory_max;
        cfg.cgroup_v1_memory_limit = cg.v1_memory_limit;
    }
    if let Some(im) = file_cfg.imagemagick {
        cfg.policy_path = im.policy;
        cfg.magick = im.magick;
    }
    if let Some(icc) = file_cfg.icc_profiles {
        cfg.icc_sources = icc.sources;
    }

    // Resolve relative paths against the config file directory.
    let base = config_path.parent().unwrap_or_else(|| Path::new("."));
    for p in [
        &mut cfg.install_root,
        &mut cfg.install_dir,
        &mut cfg.version_file,
        &mut cfg.cgroup_v2_memory_max,
        &mut cfg.cgroup_v1_memory_limit,
        &mut cfg.policy_path,
        &mut cfg.magick,
    ] {
        if p.is_relative() {
            *p = base.join(&*p);
        }
    }
    for p in cfg.icc_sources.iter_mut() {
        if p.is_relative() {
            *p = base.join(&*p);
        }
    }

    Ok(cfg)
}
