use regex::Regex;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::LazyLock;
use tracing::{info, warn};

pub const RMI_HOSTNAME_PROPERTY: &str = "-Djava.rmi.server.hostname";

static RMI_HOST_OPTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"-Djava\.rmi\.server\.hostname=(\S+)").expect("static regex")
});

/// Where the callback host came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackSource {
    Explicit,
    ExistingOption,
    Detected,
}

impl CallbackSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallbackSource::Explicit => "SERVICECLIENT_CALLBACK_HOST",
            CallbackSource::ExistingOption => "existing SERVICECLIENT_JAVA_OPTIONS",
            CallbackSource::Detected => "detected host IP",
        }
    }
}

/// Host currently pinned by `-Djava.rmi.server.hostname=` in `java_options`, if any.
pub fn existing_callback_host(java_options: &str) -> Option<&str> {
    RMI_HOST_OPTION
        .captures(java_options)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}

/// Drop any previous hostname option and append one for `host`.
pub fn inject_callback_host(java_options: &str, host: &str) -> String {
    let cleaned = RMI_HOST_OPTION.replace_all(java_options, "");
    let cleaned = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
    let option = format!("{RMI_HOSTNAME_PROPERTY}={host}");
    if cleaned.is_empty() {
        option
    } else {
        format!("{cleaned} {option}")
    }
}

/// Pick the callback host: explicit setting, then the existing java option, then
/// `detect`. Returns the host and where it came from.
pub fn resolve_callback_host(
    explicit: Option<&str>,
    java_options: &str,
    detect: &dyn Fn() -> Option<String>,
) -> Option<(String, CallbackSource)> {
    if let Some(h) = explicit.map(str::trim).filter(|h| !h.is_empty()) {
        return Some((h.to_string(), CallbackSource::Explicit));
    }
    if let Some(h) = existing_callback_host(java_options) {
        return Some((h.to_string(), CallbackSource::ExistingOption));
    }
    detect().map(|h| (h, CallbackSource::Detected))
}

/// Java options with the callback host applied. Without a resolvable host the options
/// are returned unchanged.
pub fn apply_callback_host(
    explicit: Option<&str>,
    java_options: &str,
    detect: &dyn Fn() -> Option<String>,
) -> String {
    match resolve_callback_host(explicit, java_options, detect) {
        Some((host, source)) => {
            let combined = inject_callback_host(java_options, &host);
            info!(
                "callback host={host} source={:?} java_options={combined:?}",
                source.as_str()
            );
            combined
        }
        None => {
            warn!("callback host=<none> outcome=unchanged reason=undetectable");
            java_options.to_string()
        }
    }
}

fn usable(ip: &IpAddr) -> bool {
    !ip.is_loopback() && !ip.is_unspecified()
}

fn first_usable(candidates: impl IntoIterator<Item = IpAddr>) -> Option<IpAddr> {
    candidates.into_iter().find(usable)
}

fn resolve_hostname() -> Vec<IpAddr> {
    let Ok(name) = nix::unistd::gethostname() else {
        return Vec::new();
    };
    let name = name.to_string_lossy().to_string();
    match (name.as_str(), 0u16).to_socket_addrs() {
        Ok(addrs) => addrs.map(|a| a.ip()).filter(IpAddr::is_ipv4).collect(),
        Err(_) => Vec::new(),
    }
}

/// Source address the kernel would pick for the default route. `connect` on a UDP
/// socket only selects a route; nothing is sent.
fn default_route_source() -> Option<IpAddr> {
    let sock = UdpSocket::bind("0.0.0.0:0").ok()?;
    sock.connect(SocketAddr::from(([1, 0, 0, 0], 9))).ok()?;
    sock.local_addr().ok().map(|a| a.ip())
}

/// Best-effort guess of the address the JVM will embed in RMI stubs.
pub fn detect_callback_host() -> Option<String> {
    let mut candidates = resolve_hostname();
    candidates.extend(default_route_source());
    first_usable(candidates).map(|ip| ip.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn none() -> Option<String> {
        None
    }

    fn detected() -> Option<String> {
        Some("10.1.2.3".to_string())
    }

    #[test]
    fn test_existing_callback_host() {
        assert_eq!(
            existing_callback_host("-Xmx2g -Djava.rmi.server.hostname=10.0.0.5 -Dfoo=bar"),
            Some("10.0.0.5")
        );
        assert_eq!(existing_callback_host("-Xmx2g"), None);
    }

    #[test]
    fn test_inject_replaces_previous_option() {
        assert_eq!(
            inject_callback_host("-Xmx2g -Djava.rmi.server.hostname=old -Dfoo=bar", "new"),
            "-Xmx2g -Dfoo=bar -Djava.rmi.server.hostname=new"
        );
        assert_eq!(
            inject_callback_host("", "h"),
            "-Djava.rmi.server.hostname=h"
        );
    }

    #[test]
    fn test_precedence() {
        let opts = "-Djava.rmi.server.hostname=from-opts";
        assert_eq!(
            resolve_callback_host(Some("explicit"), opts, &detected),
            Some(("explicit".to_string(), CallbackSource::Explicit))
        );
        assert_eq!(
            resolve_callback_host(None, opts, &detected),
            Some(("from-opts".to_string(), CallbackSource::ExistingOption))
        );
        assert_eq!(
            resolve_callback_host(Some("  "), "-Xmx1g", &detected),
            Some(("10.1.2.3".to_string(), CallbackSource::Detected))
        );
        assert_eq!(resolve_callback_host(None, "-Xmx1g", &none), None);
    }

    #[test]
    fn test_apply_without_host_keeps_options() {
        assert_eq!(apply_callback_host(None, "-Xmx1g", &none), "-Xmx1g");
        assert_eq!(
            apply_callback_host(None, "-Xmx1g", &detected),
            "-Xmx1g -Djava.rmi.server.hostname=10.1.2.3"
        );
    }

    #[test]
    fn test_loopback_candidates_are_skipped() {
        let got = first_usable([
            "127.0.1.1".parse().unwrap(),
            "0.0.0.0".parse().unwrap(),
            "172.17.0.2".parse().unwrap(),
        ]);
        assert_eq!(got, Some("172.17.0.2".parse().unwrap()));
        assert_eq!(first_usable(["127.0.0.1".parse().unwrap()]), None);
    }
}
