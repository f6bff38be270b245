use crate::error::AppError;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio as StdProcessStdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use sysinfo::{Pid, Signal, System};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command as TokioCommand;
use tokio::sync::{mpsc, Notify};
use tokio::time::{sleep, timeout, Duration, Instant};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

const EVENT_CHANNEL_CAPACITY: usize = 256;
/// How long to keep draining pipes after the process itself has exited.
const PIPE_DRAIN_LIMIT: Duration = Duration::from_secs(2);
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Crashed,
    Cancelled,
}

/// What to launch. `env` is overlaid on the inherited environment.
#[derive(Debug, Clone, Default)]
pub struct RunSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    /// If present after a crash, the run is treated as a soft success.
    pub expected_artifact: Option<PathBuf>,
}

impl RunSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn expected_artifact(mut self, path: impl Into<PathBuf>) -> Self {
        self.expected_artifact = Some(path.into());
        self
    }
}

/// One external-process invocation, owned by its reader task.
#[derive(Debug, Clone)]
pub struct RunSession {
    pub id: Uuid,
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub pid: Option<u32>,
    pub output: Vec<String>,
    pub status: RunStatus,
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub exit_code: Option<i32>,
    pub soft_success: bool,
    pub output: Vec<String>,
}

#[derive(Debug, Clone)]
pub enum RunEvent {
    Line(String),
    Finished(RunOutcome),
}

/// Ordered output of a single run. Ends with exactly one `RunEvent::Finished`.
#[derive(Debug)]
pub struct RunStream {
    pub run_id: Uuid,
    pub pid: Option<u32>,
    rx: mpsc::Receiver<RunEvent>,
}

impl RunStream {
    pub async fn next(&mut self) -> Option<RunEvent> {
        self.rx.recv().await
    }

    /// Drains the stream and returns the final outcome.
    pub async fn collect(mut self) -> Result<RunOutcome, AppError> {
        while let Some(event) = self.rx.recv().await {
            if let RunEvent::Finished(outcome) = event {
                return Ok(outcome);
            }
        }
        Err(AppError::ProcessCrash(format!("Run {} ended without an outcome", self.run_id)))
    }
}

#[derive(Debug)]
struct RunHandle {
    id: Uuid,
    pid: Option<u32>,
    cancelled: AtomicBool,
    force_kill: Notify,
}

/// Active runs, shared by every runner and by stop requests.
#[derive(Debug, Default)]
pub struct ProcessRegistry {
    active: StdMutex<HashMap<Uuid, Arc<RunHandle>>>,
    stop_generation: AtomicU64,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, Arc<RunHandle>>> {
        // A panic while holding the lock cannot leave the map half-updated.
        self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn register(self: &Arc<Self>, handle: Arc<RunHandle>) -> RegistrationGuard {
        let id = handle.id;
        self.lock().insert(id, handle);
        RegistrationGuard {
            registry: Arc::clone(self),
            id,
        }
    }

    fn snapshot(&self) -> Vec<Arc<RunHandle>> {
        self.lock().values().cloned().collect()
    }

    fn contains(&self, id: &Uuid) -> bool {
        self.lock().contains_key(id)
    }

    pub fn active_count(&self) -> usize {
        self.lock().len()
    }

    /// Bumped by every stop request; batches compare it before starting the next pair.
    pub fn stop_generation(&self) -> u64 {
        self.stop_generation.load(Ordering::SeqCst)
    }
}

/// Unregisters on drop, including when the owning task is aborted or panics.
struct RegistrationGuard {
    registry: Arc<ProcessRegistry>,
    id: Uuid,
}

impl Drop for RegistrationGuard {
    fn drop(&mut self) {
        if self.registry.lock().remove(&self.id).is_none() {
            let err = AppError::RegistryError(format!("run {} was already unregistered", self.id));
            warn!(error = %err, "Ignoring registry inconsistency");
        }
    }
}

fn send_sigterm(pid: u32) -> Result<(), AppError> {
    let mut sys = System::new();
    let sys_pid = Pid::from_u32(pid);
    if !sys.refresh_process(sys_pid) {
        return Err(AppError::RegistryError(format!("process {} already exited", pid)));
    }
    match sys.process(sys_pid).and_then(|p| p.kill_with(Signal::Term)) {
        Some(true) => Ok(()),
        Some(false) => Err(AppError::RegistryError(format!("failed to signal process {}", pid))),
        None => Err(AppError::RegistryError("SIGTERM is not supported on this platform".to_string())),
    }
}

async fn pump_lines<R>(reader: R, tx: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if tx.send(line).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "Output pipe read failed");
                break;
            }
        }
    }
}

async fn forward_line(session: &mut RunSession, tx: &mpsc::Sender<RunEvent>, line: String) {
    session.output.push(line.clone());
    // A gone consumer must not stop us from draining the pipes.
    let _ = tx.send(RunEvent::Line(line)).await;
}

#[derive(Debug, Clone)]
pub struct ProcessRunner {
    registry: Arc<ProcessRegistry>,
    terminate_grace: Duration,
}

impl ProcessRunner {
    pub fn new(registry: Arc<ProcessRegistry>, terminate_grace: Duration) -> Self {
        Self {
            registry,
            terminate_grace,
        }
    }

    pub fn registry(&self) -> &Arc<ProcessRegistry> {
        &self.registry
    }

    /// Spawns one process and returns its line stream. The process is registered until it exits.
    #[instrument(skip(self, spec), fields(program = %spec.program))]
    pub fn run(&self, spec: RunSpec) -> Result<RunStream, AppError> {
        let mut command = TokioCommand::new(&spec.program);
        command.args(&spec.args);
        if let Some(cwd) = &spec.cwd {
            command.current_dir(cwd);
        }
        command.envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        command.stdin(StdProcessStdio::null());
        command.stdout(StdProcessStdio::piped());
        command.stderr(StdProcessStdio::piped());
        command.kill_on_drop(true);

        debug!(args = ?spec.args, cwd = ?spec.cwd, "Spawning process");
        let mut child = command.spawn().map_err(|e| {
            error!(error = %e, program = %spec.program, "Failed to spawn process");
            AppError::CommandExecutionError(format!("Failed to spawn '{}': {}", spec.program, e))
        })?;

        let run_id = Uuid::new_v4();
        let pid = child.id();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AppError::CommandExecutionError("stdout was not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| AppError::CommandExecutionError("stderr was not captured".to_string()))?;

        let handle = Arc::new(RunHandle {
            id: run_id,
            pid,
            cancelled: AtomicBool::new(false),
            force_kill: Notify::new(),
        });
        let guard = self.registry.register(handle.clone());
        info!(run_id = %run_id, pid = ?pid, "Process started");

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            let guard = guard;
            let mut session = RunSession {
                id: run_id,
                program: spec.program,
                args: spec.args,
                cwd: spec.cwd,
                pid,
                output: Vec::new(),
                status: RunStatus::Running,
                exit_code: None,
            };

            let (line_tx, mut line_rx) = mpsc::channel::<String>(EVENT_CHANNEL_CAPACITY);
            tokio::spawn(pump_lines(stdout, line_tx.clone()));
            tokio::spawn(pump_lines(stderr, line_tx));

            let wait_result = loop {
                tokio::select! {
                    Some(line) = line_rx.recv() => forward_line(&mut session, &tx, line).await,
                    status = child.wait() => break status,
                    _ = handle.force_kill.notified() => {
                        warn!(run_id = %run_id, pid = ?pid, "Grace period expired; killing process");
                        if let Err(e) = child.start_kill() {
                            debug!(run_id = %run_id, error = %e, "Kill failed; process likely already exited");
                        }
                    }
                }
            };

            let drain = async {
                while let Some(line) = line_rx.recv().await {
                    forward_line(&mut session, &tx, line).await;
                }
            };
            if timeout(PIPE_DRAIN_LIMIT, drain).await.is_err() {
                warn!(run_id = %run_id, "Output pipes still open after exit; stopped reading");
            }

            let cancelled = handle.cancelled.load(Ordering::SeqCst);
            let (status, exit_code) = match wait_result {
                Ok(exit) if exit.success() => (RunStatus::Completed, exit.code()),
                Ok(exit) if cancelled => (RunStatus::Cancelled, exit.code()),
                Ok(exit) => match exit.code() {
                    Some(code) => (RunStatus::Failed, Some(code)),
                    None => (RunStatus::Crashed, None),
                },
                Err(e) => {
                    warn!(run_id = %run_id, error = %e, "Failed to wait for process");
                    (if cancelled { RunStatus::Cancelled } else { RunStatus::Crashed }, None)
                }
            };

            let soft_success = status == RunStatus::Crashed
                && session.expected_artifact_present(spec.expected_artifact.as_deref());
            session.status = if soft_success { RunStatus::Completed } else { status };
            session.exit_code = exit_code;
            info!(
                run_id = %run_id,
                pid = ?pid,
                program = %session.program,
                args = ?session.args,
                cwd = ?session.cwd,
                status = ?session.status,
                exit_code = ?exit_code,
                soft_success,
                "Process finished"
            );

            drop(guard);
            let outcome = RunOutcome {
                run_id,
                status: session.status,
                exit_code,
                soft_success,
                output: session.output,
            };
            let _ = tx.send(RunEvent::Finished(outcome)).await;
        });

        Ok(RunStream { run_id, pid, rx })
    }

    /// Terminates every registered run: SIGTERM, a grace period, then a hard kill.
    /// Returns how many runs were targeted.
    #[instrument(skip(self))]
    pub async fn cancel_all(&self) -> usize {
        self.registry.stop_generation.fetch_add(1, Ordering::SeqCst);
        let handles = self.registry.snapshot();
        if handles.is_empty() {
            debug!("Stop requested with no active processes");
            return 0;
        }

        for handle in &handles {
            handle.cancelled.store(true, Ordering::SeqCst);
            match handle.pid {
                Some(pid) => {
                    if let Err(e) = send_sigterm(pid) {
                        debug!(run_id = %handle.id, pid, error = %e, "SIGTERM not delivered");
                    }
                }
                None => handle.force_kill.notify_one(),
            }
        }

        let deadline = Instant::now() + self.terminate_grace;
        loop {
            let survivors = handles.iter().filter(|h| self.registry.contains(&h.id)).count();
            if survivors == 0 || Instant::now() >= deadline {
                break;
            }
            sleep(CANCEL_POLL_INTERVAL).await;
        }

        for handle in handles.iter().filter(|h| self.registry.contains(&h.id)) {
            handle.force_kill.notify_one();
        }
        info!(count = handles.len(), "Stop request delivered to active processes");
        handles.len()
    }
}

impl RunSession {
    fn expected_artifact_present(&self, artifact: Option<&std::path::Path>) -> bool {
        match artifact {
            Some(path) => {
                let present = path.exists();
                if present {
                    warn!(run_id = %self.id, path = %path.display(), "Process crashed but expected artifact exists");
                }
                present
            }
            None => false,
        }
    }
}
