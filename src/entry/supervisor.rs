use anyhow::Context as _;
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use std::io::{self, Read as _, Seek as _, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{info, warn};

pub const SERVICE_CLIENT_MARKER: &str = "ServiceClient";
pub const STOP_GRACE: Duration = Duration::from_secs(120);
pub const LOG_WAIT_TIMEOUT: Duration = Duration::from_secs(60);
pub const LOG_WAIT_POLL: Duration = Duration::from_secs(5);
pub const LOG_FOLLOW_POLL: Duration = Duration::from_millis(100);

const FOLLOW_READ_CHUNK_BYTES: usize = 64 * 1024;

/// `serviceclient.sh setup` arguments registering this client with the master.
pub fn setup_argv(script: &Path, host: &str, user: &str, pass: &str) -> Vec<String> {
    vec![
        script.display().to_string(),
        "setup".to_string(),
        "-m".to_string(),
        format!("frmis://{host}:30546/corpus.RMIServerSSL"),
        "-n".to_string(),
        host.to_string(),
        "-u".to_string(),
        user.to_string(),
        "-p".to_string(),
        pass.to_string(),
    ]
}

/// Answers for every confirmation prompt `setup` may ask.
pub fn setup_input() -> String {
    "Y\n".repeat(10)
}

pub fn start_argv(script: &Path) -> Vec<String> {
    vec![script.display().to_string(), "start".to_string()]
}

pub fn runuser_argv(user: &str, argv: &[String]) -> Vec<String> {
    let mut out = vec!["runuser".to_string(), "-u".to_string(), user.to_string(), "--".to_string()];
    out.extend(argv.iter().cloned());
    out
}

pub fn su_argv(user: &str, argv: &[String]) -> Vec<String> {
    vec![
        "su".to_string(),
        "-s".to_string(),
        "/bin/bash".to_string(),
        user.to_string(),
        "-c".to_string(),
        shell_words::join(argv),
    ]
}

/// Spawn `argv` with extra environment, feed `input` on stdin and wait. Output goes
/// to our own stdout/stderr.
pub async fn run_command(
    argv: &[String],
    input: Option<&str>,
    env: &[(String, String)],
) -> io::Result<ExitStatus> {
    let Some((program, args)) = argv.split_first() else {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty argv"));
    };
    let mut cmd = Command::new(program);
    cmd.args(args)
        .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(if input.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());
    let mut child = cmd.spawn()?;
    if let Some(input) = input
        && let Some(mut stdin) = child.stdin.take()
    {
        // The child may exit before reading everything; that is not an error here.
        let _ = stdin.write_all(input.as_bytes()).await;
        drop(stdin);
    }
    child.wait().await
}

/// Run `argv` as `user` via `runuser`, falling back to `su` when `runuser` is not
/// installed. A non-zero exit is logged and returned, not raised.
pub async fn run_as_user(
    user: &str,
    argv: &[String],
    input: Option<&str>,
    env: &[(String, String)],
) -> anyhow::Result<ExitStatus> {
    let what = argv.get(1).map(String::as_str).unwrap_or("-");
    let status = match run_command(&runuser_argv(user, argv), input, env).await {
        Ok(s) => s,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            warn!("run_as user={user} runuser=missing fallback=su");
            run_command(&su_argv(user, argv), input, env)
                .await
                .with_context(|| format!("su -c {what} as {user}"))?
        }
        Err(e) => return Err(e).with_context(|| format!("runuser {what} as {user}")),
    };
    if status.success() {
        info!("run_as user={user} command={what} outcome=ok");
    } else {
        let code = status.code().map(|c| c.to_string()).unwrap_or_else(|| "-".to_string());
        warn!("run_as user={user} command={what} outcome=failed exit_code={code}");
    }
    Ok(status)
}

/// Whether a process command line belongs to the Java service client.
pub fn is_service_client(name: &str, cmd: &[String]) -> bool {
    let is_java = name == "java" || cmd.first().is_some_and(|a| a == "java" || a.ends_with("/java"));
    is_java && cmd.iter().any(|a| a.contains(SERVICE_CLIENT_MARKER))
}

pub fn find_service_client() -> Option<Pid> {
    let mut sys = System::new();
    sys.refresh_processes_specifics(
        ProcessesToUpdate::All,
        true,
        ProcessRefreshKind::nothing().with_cmd(UpdateKind::Always),
    );
    sys.processes().iter().find_map(|(pid, p)| {
        let name = p.name().to_string_lossy();
        let cmd: Vec<String> = p.cmd().iter().map(|a| a.to_string_lossy().to_string()).collect();
        is_service_client(&name, &cmd).then(|| Pid::from_raw(pid.as_u32() as i32))
    })
}

/// Reap `pid` if it is our child and report whether it still runs. Zombies count as
/// gone.
pub fn process_alive(pid: Pid) -> bool {
    let _ = waitpid(pid, Some(WaitPidFlag::WNOHANG));
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => stat
            .rsplit_once(')')
            .and_then(|(_, rest)| rest.split_whitespace().next())
            .is_none_or(|state| state != "Z"),
        Err(_) => false,
    }
}

/// Collect exit statuses of orphans re-parented to us when running as PID 1. Only safe
/// while no tokio-managed child is outstanding.
pub fn reap_orphans() -> usize {
    let mut reaped = 0;
    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) | Err(_) => return reaped,
            Ok(_) => reaped += 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    NotRunning,
    Terminated,
    Killed,
}

/// SIGTERM, wait up to `grace` (polling every second), then SIGKILL.
pub async fn stop_pid(pid: Pid, grace: Duration) -> anyhow::Result<StopOutcome> {
    info!("stop attempt=signal sig=SIGTERM pid={pid}");
    match kill(pid, Signal::SIGTERM) {
        Ok(()) => {}
        Err(Errno::ESRCH) => return Ok(StopOutcome::NotRunning),
        Err(e) => anyhow::bail!("kill -TERM {pid} failed: {e}"),
    }

    let t0 = Instant::now();
    let deadline = t0 + grace;
    let poll = Duration::from_secs(1).min(grace.max(Duration::from_millis(50)));
    loop {
        if !process_alive(pid) {
            info!("stop outcome=grace_exit pid={pid} elapsed_ms={}", t0.elapsed().as_millis());
            return Ok(StopOutcome::Terminated);
        }
        if Instant::now() >= deadline {
            break;
        }
        tokio::time::sleep(poll).await;
    }

    warn!(
        "stop outcome=grace_expired pid={pid} elapsed_ms={} decision=kill",
        t0.elapsed().as_millis()
    );
    match kill(pid, Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => anyhow::bail!("kill -9 {pid} failed: {e}"),
    }
    for _ in 0..30 {
        if !process_alive(pid) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    info!("stop outcome=killed pid={pid}");
    Ok(StopOutcome::Killed)
}

/// Stop the running service client, if any.
pub async fn stop_service_client(grace: Duration) -> anyhow::Result<StopOutcome> {
    info!("stop attempt=find marker={SERVICE_CLIENT_MARKER}");
    match find_service_client() {
        Some(pid) => stop_pid(pid, grace).await,
        None => {
            info!("stop outcome=not_running");
            Ok(StopOutcome::NotRunning)
        }
    }
}

/// Print the startup log verbatim, if it can be read.
pub fn print_startup_log(path: &Path, out: &mut dyn Write) {
    match std::fs::read_to_string(path) {
        Ok(text) => {
            let _ = writeln!(out, "{text}");
            let _ = out.flush();
        }
        Err(e) => warn!("logs startup_log={} outcome=unreadable err={e}", path.display()),
    }
}

/// Wait until `path` exists. Returns false after `timeout`.
pub async fn wait_for_log_file(path: &Path, timeout: Duration, poll: Duration) -> bool {
    let t0 = Instant::now();
    while !path.exists() {
        if t0.elapsed() > timeout {
            warn!("logs path={} outcome=timeout waited_ms={}", path.display(), t0.elapsed().as_millis());
            return false;
        }
        info!("logs path={} outcome=waiting", path.display());
        tokio::time::sleep(poll).await;
    }
    info!("logs path={} outcome=found", path.display());
    true
}

/// Incremental reader over a growing log file. Starts at the beginning of the file; a
/// shrinking file is treated as truncated and read again from the start.
pub struct LogFollower {
    path: PathBuf,
    offset: u64,
    partial: Vec<u8>,
}

impl LogFollower {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            offset: 0,
            partial: Vec::new(),
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Emit every complete line appended since the last call. Returns the number of lines
    /// written.
    pub fn poll(&mut self, out: &mut dyn Write) -> io::Result<usize> {
        let len = match std::fs::metadata(&self.path) {
            Ok(m) => m.len(),
            Err(_) => return Ok(0),
        };
        if len < self.offset {
            self.offset = 0;
            self.partial.clear();
        }
        if len == self.offset {
            return Ok(0);
        }
        let mut f = std::fs::File::open(&self.path)?;
        f.seek(SeekFrom::Start(self.offset))?;

        let mut lines = 0usize;
        let mut remaining = (len - self.offset) as usize;
        let mut buf = vec![0u8; FOLLOW_READ_CHUNK_BYTES.min(remaining)];
        while remaining > 0 {
            let take = remaining.min(buf.len());
            let n = f.read(&mut buf[..take])?;
            if n == 0 {
                break;
            }
            self.offset += n as u64;
            remaining -= n;
            self.partial.extend_from_slice(&buf[..n]);

            let mut start = 0usize;
            while let Some(pos) = self.partial[start..].iter().position(|b| *b == b'\n') {
                let line = &self.partial[start..start + pos];
                let line = String::from_utf8_lossy(line);
                writeln!(out, "{}", line.trim_end_matches('\r'))?;
                lines += 1;
                start += pos + 1;
            }
            self.partial.drain(..start);
        }
        out.flush()?;
        Ok(lines)
    }
}

/// Follow `path` until `shutdown` resolves, writing lines to stdout.
pub async fn follow_log<F>(path: &Path, poll: Duration, shutdown: F) -> anyhow::Result<()>
where
    F: std::future::Future<Output = ()>,
{
    let mut follower = LogFollower::new(path);
    tokio::pin!(shutdown);
    let mut tick = tokio::time::interval(poll);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = &mut shutdown => return Ok(()),
            _ = tick.tick() => {
                let mut stdout = io::stdout().lock();
                follower
                    .poll(&mut stdout)
                    .with_context(|| format!("follow {}", path.display()))?;
                drop(stdout);
                if std::process::id() == 1 {
                    reap_orphans();
                }
            }
        }
    }
}
