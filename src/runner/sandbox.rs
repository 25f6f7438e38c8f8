// src/runner/sandbox.rs
//! Containerized agent sandboxes
//!
//! One isolated container process per agent, with an injected credential
//! file, a private workspace mount, and CPU/memory limits. Output is
//! streamed incrementally so failures are visible long before exit. A
//! watchdog on its own timer forcibly terminates a stalled sandbox.
//!
//! Terminal status is a write-once cell: organic exit, stream corruption,
//! and the watchdog all race to record it, first writer wins, every later
//! write is a no-op.

use crate::runner::agent::{AgentSpec, TerminalStatus};
use crate::runner::usage::UsageMeter;
use crate::runner::workspace::Workspace;
use crate::utils::config::{RunnerConfig, SandboxSettings};
use crate::utils::errors::{Result, RunnerError};
use metrics::counter;
use once_cell::sync::OnceCell;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Grace period between SIGTERM and SIGKILL
const TERM_GRACE: Duration = Duration::from_secs(5);

/// How long to keep draining output after the process is gone; an orphaned
/// grandchild can hold the pipe open indefinitely
const STREAM_DRAIN: Duration = Duration::from_secs(5);

/// Launches and supervises one sandbox per agent
pub struct SandboxLauncher {
    settings: SandboxSettings,

    /// Per-agent wall-clock budget
    budget: Duration,

    /// Prompt handed to every agent
    prompt: String,

    /// Root directory for per-agent logs
    log_root: PathBuf,
}

impl SandboxLauncher {
    pub fn new(config: &RunnerConfig, log_root: PathBuf) -> Self {
        Self {
            settings: config.sandbox.clone(),
            budget: config.timing.agent_budget(),
            prompt: config.agent_prompt(),
            log_root,
        }
    }

    /// Start the agent's container and its supervision tasks.
    pub async fn launch(&self, spec: &AgentSpec, workspace: &Workspace) -> Result<SandboxHandle> {
        let log_dir = self.log_root.join(&spec.agent_id);
        tokio::fs::create_dir_all(&log_dir)
            .await
            .map_err(|e| RunnerError::Sandbox(format!("log dir: {}", e)))?;
        let log_path = log_dir.join("stdout.log");

        let cmd = self.build_command(spec, workspace);
        let handle = spawn_supervised(spec.agent_id.clone(), cmd, self.budget, log_path).await?;

        counter!("sandboxes_launched_total").increment(1);
        info!(
            agent_id = %spec.agent_id,
            city_id = %spec.city_id,
            budget_secs = self.budget.as_secs(),
            "sandbox launched"
        );
        Ok(handle)
    }

    /// Container invocation: private workspace mount, env-file credential
    /// injection, resource limits, structured streaming output.
    fn build_command(&self, spec: &AgentSpec, workspace: &Workspace) -> Command {
        let mut cmd = Command::new(&self.settings.runtime_bin);
        cmd.arg("run")
            .arg("--rm")
            .arg("--env-file")
            .arg(workspace.env_file())
            .arg("-v")
            .arg(format!("{}:/workspace", workspace.path().display()))
            .arg("-w")
            .arg("/workspace")
            .arg(format!("--cpus={}", self.settings.cpus))
            .arg(format!("--memory={}m", self.settings.memory_limit_mb))
            .arg(&self.settings.image)
            .arg("--dangerously-skip-permissions")
            .arg("--max-turns")
            .arg(self.settings.max_turns.to_string())
            .arg("--output-format")
            .arg("stream-json")
            .arg("--verbose")
            .arg("--append-system-prompt-file")
            .arg(&workspace.intent_file)
            .arg("-p")
            .arg(&self.prompt);

        debug!(agent_id = %spec.agent_id, runtime = %self.settings.runtime_bin, "sandbox command built");
        cmd
    }
}

/// Handle to a running (or finished) sandbox
pub struct SandboxHandle {
    pub agent_id: String,

    /// Raw stream log on disk
    pub log_path: PathBuf,

    status: Arc<OnceCell<TerminalStatus>>,
    meter: Arc<UsageMeter>,
    kill: CancellationToken,
    task: JoinHandle<()>,
}

impl SandboxHandle {
    /// Consumption meter fed by the output stream
    pub fn meter(&self) -> Arc<UsageMeter> {
        self.meter.clone()
    }

    /// Terminal status, if one has been recorded yet
    pub fn status(&self) -> Option<TerminalStatus> {
        self.status.get().copied()
    }

    /// Request forcible termination. Idempotent; safe to call on a sandbox
    /// that already exited (the recorded status is never overwritten).
    pub fn terminate(&self) {
        self.kill.cancel();
    }

    /// Token that, when cancelled, terminates this sandbox
    pub fn termination_token(&self) -> CancellationToken {
        self.kill.clone()
    }

    /// Block until the sandbox reaches its terminal status. Call once.
    pub async fn wait(&mut self) -> TerminalStatus {
        if let Err(e) = (&mut self.task).await {
            error!(agent_id = %self.agent_id, error = %e, "sandbox supervisor aborted");
            let _ = self.status.set(TerminalStatus::Crashed);
        }
        self.status.get().copied().unwrap_or(TerminalStatus::Crashed)
    }
}

/// Spawn `cmd` and wire up stream pumps, watchdog, and supervisor.
async fn spawn_supervised(
    agent_id: String,
    mut cmd: Command,
    budget: Duration,
    log_path: PathBuf,
) -> Result<SandboxHandle> {
    cmd.stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .stdin(Stdio::null())
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .map_err(|e| RunnerError::Sandbox(format!("spawn {}: {}", agent_id, e)))?;

    let status: Arc<OnceCell<TerminalStatus>> = Arc::new(OnceCell::new());
    let meter = Arc::new(UsageMeter::new());
    let kill = CancellationToken::new();

    let log = Arc::new(Mutex::new(
        tokio::fs::File::create(&log_path)
            .await
            .map_err(|e| RunnerError::Sandbox(format!("stream log: {}", e)))?,
    ));

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| RunnerError::Sandbox(format!("{}: no stdout pipe", agent_id)))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| RunnerError::Sandbox(format!("{}: no stderr pipe", agent_id)))?;

    let mut pumps = Vec::with_capacity(2);
    pumps.push(tokio::spawn(pump_stream(
        agent_id.clone(),
        stdout,
        log.clone(),
        Some(meter.clone()),
        status.clone(),
        kill.clone(),
    )));
    pumps.push(tokio::spawn(pump_stream(
        agent_id.clone(),
        stderr,
        log.clone(),
        None,
        status.clone(),
        kill.clone(),
    )));

    // Watchdog on its own timer, never on the supervised path
    let watchdog = {
        let kill = kill.clone();
        let agent_id = agent_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(budget).await;
            warn!(agent_id = %agent_id, budget_secs = budget.as_secs(), "watchdog fired");
            kill.cancel();
        })
    };

    let task = tokio::spawn(supervise(
        agent_id.clone(),
        child,
        status.clone(),
        kill.clone(),
        watchdog,
        pumps,
    ));

    Ok(SandboxHandle {
        agent_id,
        log_path,
        status,
        meter,
        kill,
        task,
    })
}

/// Wait for organic exit or a termination request, record the terminal
/// status exactly once, and drain the stream pumps.
async fn supervise(
    agent_id: String,
    mut child: Child,
    status: Arc<OnceCell<TerminalStatus>>,
    kill: CancellationToken,
    watchdog: JoinHandle<()>,
    pumps: Vec<JoinHandle<()>>,
) {
    let organic_exit = tokio::select! {
        exit = child.wait() => Some(exit),
        _ = kill.cancelled() => None,
    };

    match organic_exit {
        Some(Ok(code)) if code.success() => {
            let _ = status.set(TerminalStatus::Completed);
            info!(agent_id = %agent_id, "sandbox completed");
        }
        Some(Ok(code)) => {
            let _ = status.set(TerminalStatus::Crashed);
            warn!(agent_id = %agent_id, exit = %code, "sandbox crashed");
        }
        Some(Err(e)) => {
            let _ = status.set(TerminalStatus::Crashed);
            error!(agent_id = %agent_id, error = %e, "sandbox wait failed");
        }
        None => {
            // First writer wins: if the stream pump already recorded a
            // crash, this set is a no-op and we only clean up the process.
            let _ = status.set(TerminalStatus::TimedOut);
            warn!(agent_id = %agent_id, status = ?status.get(), "terminating sandbox");
            terminate_child(&agent_id, &mut child).await;
        }
    }

    watchdog.abort();
    for mut pump in pumps {
        if tokio::time::timeout(STREAM_DRAIN, &mut pump).await.is_err() {
            pump.abort();
        }
    }
}

/// SIGTERM, a bounded grace period, then SIGKILL.
async fn terminate_child(agent_id: &str, child: &mut Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if let Some(raw) = child.id() {
        let pid = Pid::from_raw(raw as i32);
        debug!(agent_id, pid = raw, "sending SIGTERM");
        if kill(pid, Signal::SIGTERM).is_ok() {
            if tokio::time::timeout(TERM_GRACE, child.wait()).await.is_ok() {
                return;
            }
            warn!(agent_id, pid = raw, "no exit after SIGTERM, sending SIGKILL");
        }
    }

    if let Err(e) = child.start_kill() {
        debug!(agent_id, error = %e, "kill after exit");
    }
    let _ = tokio::time::timeout(TERM_GRACE, child.wait()).await;
}

/// Pump one output stream to the log file line by line.
///
/// Stdout lines are additionally parsed as stream-json and fed to the
/// meter; a read failure there counts as stream corruption and crashes
/// the agent.
async fn pump_stream<R: AsyncRead + Unpin>(
    agent_id: String,
    stream: R,
    log: Arc<Mutex<tokio::fs::File>>,
    meter: Option<Arc<UsageMeter>>,
    status: Arc<OnceCell<TerminalStatus>>,
    kill: CancellationToken,
) {
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                {
                    let mut file = log.lock().await;
                    let _ = file.write_all(line.as_bytes()).await;
                    let _ = file.write_all(b"\n").await;
                    let _ = file.flush().await;
                }
                if let Some(meter) = &meter {
                    if let Ok(event) = serde_json::from_str::<serde_json::Value>(line.trim()) {
                        meter.observe(&event);
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                if meter.is_some() {
                    error!(agent_id = %agent_id, error = %e, "output stream corrupted");
                    let _ = status.set(TerminalStatus::Crashed);
                    kill.cancel();
                } else {
                    warn!(agent_id = %agent_id, error = %e, "stderr stream error");
                }
                break;
            }
        }
    }
}
