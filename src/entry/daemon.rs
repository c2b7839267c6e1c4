use crate::entry::build_info;
use crate::entry::config::{EnvMap, Layout, Settings};
use crate::entry::install;
use crate::entry::java;
use crate::entry::memory::{self, MIB, MemoryLimit, MemoryProbe};
use crate::entry::policy::{self, PolicyLimits};
use crate::entry::prefs;
use crate::entry::supervisor::{self, LOG_FOLLOW_POLL, LOG_WAIT_POLL, LOG_WAIT_TIMEOUT, STOP_GRACE};
use anyhow::Context as _;
use std::future::Future;
use tokio::signal::unix::{SignalKind, signal as unix_signal};
use tracing::{info, warn};

/// Environment variable carrying the reconciled JVM options to the client.
pub const JAVA_OPTIONS_VAR: &str = "SERVICECLIENT_JAVA_OPTIONS";

fn block_on<F: Future>(fut: F) -> anyhow::Result<F::Output> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("build tokio runtime")?;
    Ok(rt.block_on(fut))
}

/// Resolves on the first SIGTERM or SIGINT.
fn shutdown_signal() -> anyhow::Result<impl Future<Output = ()>> {
    let mut term = unix_signal(SignalKind::terminate()).context("install SIGTERM handler")?;
    let mut int = unix_signal(SignalKind::interrupt()).context("install SIGINT handler")?;
    Ok(async move {
        tokio::select! {
            _ = term.recv() => info!("shutdown signal=SIGTERM"),
            _ = int.recv() => info!("shutdown signal=SIGINT"),
        }
    })
}

/// Full container entrypoint: prepare, start and supervise the service client until a
/// termination signal arrives.
pub fn run_entrypoint(layout: &Layout, env: &EnvMap) -> anyhow::Result<()> {
    block_on(run_entrypoint_async(layout, env))?
}

pub async fn run_entrypoint_async(layout: &Layout, env: &EnvMap) -> anyhow::Result<()> {
    info!("{}", build_info::banner());
    let settings = Settings::from_env(env)?;

    let shutdown = shutdown_signal()?;
    tokio::pin!(shutdown);

    tokio::select! {
        started = start_client(&settings, layout, env) => started?,
        _ = &mut shutdown => return stop_client().await,
    }

    supervisor::print_startup_log(&layout.startup_log(), &mut std::io::stdout());

    let service_log = layout.service_log();
    let found = tokio::select! {
        found = supervisor::wait_for_log_file(&service_log, LOG_WAIT_TIMEOUT, LOG_WAIT_POLL) => found,
        _ = &mut shutdown => return stop_client().await,
    };

    if found {
        info!("follow path={}", service_log.display());
        if let Err(e) = supervisor::follow_log(&service_log, LOG_FOLLOW_POLL, &mut shutdown).await {
            warn!("follow path={} outcome=failed err={e:#}", service_log.display());
            (&mut shutdown).await;
        }
    } else {
        warn!(
            "follow path={} outcome=missing waited_secs={}",
            service_log.display(),
            LOG_WAIT_TIMEOUT.as_secs()
        );
        (&mut shutdown).await;
    }
    stop_client().await
}

/// Steps up to and including `serviceclient.sh start`.
async fn start_client(settings: &Settings, layout: &Layout, env: &EnvMap) -> anyhow::Result<()> {
    let version = install::ensure_installed(settings, layout).await?;
    info!("install version={}", version.as_deref().unwrap_or("unknown"));

    let major = java::select_jdk_major(version.as_deref());
    let mut child_env = match java::ensure_corretto(major).await? {
        Some(rt) => {
            info!("java jdk={major} home={}", rt.java_home.display());
            rt.child_env(env.get("PATH").map(String::as_str))
        }
        None => {
            warn!("java jdk={major} outcome=not_found");
            Vec::new()
        }
    };

    match install::copy_icc_profiles(&layout.icc_sources, &layout.icc_target()) {
        Ok(n) => info!("icc copied={n} target={}", layout.icc_target().display()),
        Err(e) => warn!("icc outcome=failed err={e:#}"),
    }

    let limit = memory::resolve_memory_limit(&MemoryProbe::from_config(settings, layout)).await;
    policy::apply_resource_policy(settings, layout, limit.bytes).await?;

    let script = layout.serviceclient_script();
    let setup = supervisor::setup_argv(
        &script,
        &settings.svc_host,
        &settings.svc_user,
        &settings.svc_pass,
    );
    supervisor::run_as_user(
        &layout.service_user,
        &setup,
        Some(&supervisor::setup_input()),
        &child_env,
    )
    .await?;

    let report = prefs::configure(settings, layout).await?;
    info!(
        "prefs connection_updated={} facilities_updated={} volumes_updated={}",
        report.connection_updated, report.facilities_updated, report.volumes_updated
    );
    child_env.push((JAVA_OPTIONS_VAR.to_string(), report.java_options));

    supervisor::run_as_user(
        &layout.service_user,
        &supervisor::start_argv(&script),
        None,
        &child_env,
    )
    .await?;
    Ok(())
}

async fn stop_client() -> anyhow::Result<()> {
    match supervisor::stop_service_client(STOP_GRACE).await {
        Ok(outcome) => info!("shutdown client={outcome:?}"),
        Err(e) => warn!("shutdown outcome=failed err={e:#}"),
    }
    Ok(())
}

/// Reconcile the preference documents once and print the resulting JVM options as a
/// shell assignment.
pub fn run_configure(layout: &Layout, env: &EnvMap) -> anyhow::Result<()> {
    let settings = Settings::from_env(env)?;
    let report = block_on(prefs::configure(&settings, layout))??;
    println!(
        "{JAVA_OPTIONS_VAR}={}",
        shell_words::quote(&report.java_options)
    );
    Ok(())
}

/// Resolve the memory ceiling and rewrite the resource policy once.
pub fn run_policy(layout: &Layout, env: &EnvMap) -> anyhow::Result<()> {
    let settings = Settings::from_env(env)?;
    let limits: PolicyLimits = block_on(async {
        let limit = memory::resolve_memory_limit(&MemoryProbe::from_config(&settings, layout)).await;
        policy::apply_resource_policy(&settings, layout, limit.bytes).await
    })??;
    for (name, value) in limits.entries() {
        println!("{name}={value}");
    }
    Ok(())
}

/// Print the resolved memory ceiling. Needs none of the service credentials.
pub fn run_memory(layout: &Layout, env: &EnvMap) -> anyhow::Result<()> {
    let probe = MemoryProbe {
        ecs_metadata_uri: env
            .get("ECS_CONTAINER_METADATA_URI_V4")
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty()),
        cgroup_v2_memory_max: layout.cgroup_v2_memory_max.clone(),
        cgroup_v1_memory_limit: layout.cgroup_v1_memory_limit.clone(),
        host_total: memory::host_total_memory(),
    };
    let limit: MemoryLimit = block_on(memory::resolve_memory_limit(&probe))?;
    println!("source={} bytes={} mib={}", limit.source, limit.bytes, limit.bytes / MIB);
    Ok(())
}
