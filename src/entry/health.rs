use regex::Regex;
use std::fmt;
use std::io::{BufRead as _, BufReader};
use std::net::{SocketAddr, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;
use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};

pub const RMI_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
pub const PROC_NET_TCP: [&str; 2] = ["/proc/net/tcp", "/proc/net/tcp6"];

/// `st` column value for an established TCP socket.
const TCP_ESTABLISHED: &str = "01";

static LOGIN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"INFO\s+: LoginAction: ServiceClientLoginAction: client token:").expect("static regex")
});
static REGISTRATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"INFO\s+: LoginAction: RMIProcessClient: created new RMIProcessClient 'ClientCLIService'")
        .expect("static regex")
});

/// First failed check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthFailure {
    JavaNotRunning,
    NoLogin,
    NoRegistration,
    NoEstablishedConnection,
    RmiPortClosed(u16),
}

impl fmt::Display for HealthFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthFailure::JavaNotRunning => f.write_str("Java process not running."),
            HealthFailure::NoLogin => f.write_str("No successful login found in logs."),
            HealthFailure::NoRegistration => {
                f.write_str("No successful service registration found in logs.")
            }
            HealthFailure::NoEstablishedConnection => {
                f.write_str("No established TCP connections found.")
            }
            HealthFailure::RmiPortClosed(port) => write!(f, "RMI port {port} not open."),
        }
    }
}

/// Observations the health check is built from.
pub trait HealthProbe {
    fn java_running(&self) -> bool;
    /// Whether any line of the service log matches `pattern`.
    fn log_matches(&self, pattern: &Regex) -> bool;
    fn tcp_established(&self) -> bool;
    fn port_open(&self, port: u16) -> bool;
}

/// Probes against the live system.
pub struct SystemProbe {
    pub service_log: PathBuf,
}

impl HealthProbe for SystemProbe {
    fn java_running(&self) -> bool {
        java_process_running()
    }

    fn log_matches(&self, pattern: &Regex) -> bool {
        log_contains(&self.service_log, pattern)
    }

    fn tcp_established(&self) -> bool {
        PROC_NET_TCP.iter().any(|p| match std::fs::read_to_string(p) {
            Ok(table) => has_established(&table),
            Err(_) => false,
        })
    }

    fn port_open(&self, port: u16) -> bool {
        let addr = SocketAddr::from(([127, 0, 0, 1], port));
        match TcpStream::connect_timeout(&addr, RMI_CONNECT_TIMEOUT) {
            Ok(_) => true,
            Err(e) => {
                println!("RMI port {port} not reachable: {e}");
                false
            }
        }
    }
}

/// Any process other than ourselves whose name or command line mentions `java`.
pub fn java_process_running() -> bool {
    let mut sys = System::new();
    sys.refresh_processes_specifics(
        ProcessesToUpdate::All,
        true,
        ProcessRefreshKind::nothing().with_cmd(UpdateKind::Always),
    );
    let me = std::process::id();
    sys.processes().iter().any(|(pid, p)| {
        pid.as_u32() != me
            && (p.name().to_string_lossy().contains("java")
                || p.cmd().iter().any(|a| a.to_string_lossy().contains("java")))
    })
}

pub fn log_contains(path: &Path, pattern: &Regex) -> bool {
    let Ok(file) = std::fs::File::open(path) else {
        return false;
    };
    BufReader::new(file)
        .split(b'\n')
        .map_while(Result::ok)
        .any(|line| pattern.is_match(&String::from_utf8_lossy(&line)))
}

/// Whether a `/proc/net/tcp{,6}` table lists an established socket.
pub fn has_established(table: &str) -> bool {
    table
        .lines()
        .skip(1)
        .filter_map(|l| l.split_whitespace().nth(3))
        .any(|st| st == TCP_ESTABLISHED)
}

/// Run the checks in order, stopping at the first failure.
pub fn run_health_check(probe: &dyn HealthProbe, rmi_port: u16) -> Result<(), HealthFailure> {
    if !probe.java_running() {
        return Err(HealthFailure::JavaNotRunning);
    }
    if !probe.log_matches(&LOGIN) {
        return Err(HealthFailure::NoLogin);
    }
    if !probe.log_matches(&REGISTRATION) {
        return Err(HealthFailure::NoRegistration);
    }
    if !probe.tcp_established() {
        return Err(HealthFailure::NoEstablishedConnection);
    }
    if !probe.port_open(rmi_port) {
        return Err(HealthFailure::RmiPortClosed(rmi_port));
    }
    Ok(())
}
