use crate::entry::config::{self, DEFAULT_RMI_PORT};
use crate::entry::{daemon, health, logging};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "scentry", version, about = "Service Client container entrypoint")]
pub struct Args {
    /// Optional layout YAML overriding install and tool paths
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub cmd: Option<Cmd>,
}

#[derive(Debug, Subcommand)]
pub enum Cmd {
    /// Reconcile the preference documents once and print the JVM options
    Configure,
    /// Resolve the memory ceiling and rewrite the image resource policy
    Policy,
    /// Print the resolved memory ceiling
    Memory,
}

pub fn run() -> anyhow::Result<()> {
    let args = Args::parse();
    logging::init("info");
    let layout = config::load_layout(args.config.as_deref())?;
    let env = config::snapshot_env();
    match args.cmd {
        None => daemon::run_entrypoint(&layout, &env),
        Some(Cmd::Configure) => daemon::run_configure(&layout, &env),
        Some(Cmd::Policy) => daemon::run_policy(&layout, &env),
        Some(Cmd::Memory) => daemon::run_memory(&layout, &env),
    }
}

#[derive(Debug, Parser)]
#[command(name = "sc-healthcheck", version, about = "Service Client container health check")]
pub struct HealthArgs {
    /// Optional layout YAML overriding install paths
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// Service log to scan instead of the one under the install directory
    #[arg(long = "log")]
    pub log: Option<PathBuf>,
}

/// Run the health check and return the process exit code.
pub fn run_healthcheck() -> i32 {
    let args = HealthArgs::parse();
    logging::init("warn");
    let service_log = match args.log {
        Some(p) => p,
        None => match config::load_layout(args.config.as_deref()) {
            Ok(layout) => layout.service_log(),
            Err(e) => {
                println!("{e:#}");
                return 1;
            }
        },
    };
    let port = rmi_port(std::env::var("SERVICECLIENT_RMI_PORT").ok().as_deref());
    match health::run_health_check(&health::SystemProbe { service_log }, port) {
        Ok(()) => {
            println!("Service is healthy.");
            0
        }
        Err(failure) => {
            println!("{failure}");
            1
        }
    }
}

/// RMI port probed by the health check.
pub fn rmi_port(raw: Option<&str>) -> u16 {
    let raw = raw.map(str::trim).filter(|s| !s.is_empty());
    let (from, _) = config::resolve_port_range(raw, None);
    from.parse::<u16>()
        .or_else(|_| DEFAULT_RMI_PORT.parse::<u16>())
        .unwrap_or(30550)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory as _;

    #[test]
    fn test_args_shape() {
        Args::command().debug_assert();
        HealthArgs::command().debug_assert();

        let a = Args::try_parse_from(["scentry", "-c", "/etc/scentry.yaml", "configure"]).unwrap();
        assert_eq!(a.config, Some(PathBuf::from("/etc/scentry.yaml")));
        assert!(matches!(a.cmd, Some(Cmd::Configure)));
        assert!(Args::try_parse_from(["scentry"]).unwrap().cmd.is_none());

        let h = HealthArgs::try_parse_from(["sc-healthcheck", "--log", "/tmp/s.log"]).unwrap();
        assert_eq!(h.log, Some(PathBuf::from("/tmp/s.log")));
    }

    #[test]
    fn test_rmi_port() {
        assert_eq!(rmi_port(None), 30550);
        assert_eq!(rmi_port(Some("")), 30550);
        assert_eq!(rmi_port(Some(" 40000 ")), 40000);
        assert_eq!(rmi_port(Some("abc")), 30550);
        assert_eq!(rmi_port(Some("99999")), 30550);
    }
}
