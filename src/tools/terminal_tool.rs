use crate::config::Config;
use crate::error::AppError;
use crate::events::{ChannelSink, EventSink, StreamEvent};
use crate::tools::filestore_tool::ArtifactStore;
use crate::utils::chunk_decoder::ChunkDecoder;
use crate::utils::credentials::{resolve_api_key, ApiKey, CHILD_ENV_VAR};
use crate::utils::path_utils::{canonical_or_lexical, resolve_against};
use chrono::{DateTime, Utc};
use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use tokio::sync::{mpsc, Mutex as TokioMutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, timeout_at, Instant};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

const SESSION_EVENT_CAPACITY: usize = 1024;
const READ_BUFFER_SIZE: usize = 4096;
const REAP_ATTEMPTS: usize = 20;

type SessionMap = Arc<TokioMutex<HashMap<String, Arc<TerminalSession>>>>;

#[derive(Debug, Deserialize)]
pub struct StartSessionParams {
    pub session_key: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SendInputParams {
    pub data: String,
}

#[derive(Debug, Serialize)]
pub struct StartSessionResult {
    pub session_key: String,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct SessionInfo {
    pub session_key: String,
    pub phase: SessionPhase,
    pub created_at: DateTime<Utc>,
    pub events_attached: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Starting,
    Phase1Running,
    Phase1Done,
    Phase2Running,
    Phase2Done,
    Failed,
    CleanedUp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PhaseResult {
    Succeeded,
    /// Crashed, but the evidence of success is on disk.
    SoftSucceeded,
    Failed(u32),
    Crashed,
    TimedOut,
}

impl PhaseResult {
    fn is_success(self) -> bool {
        matches!(self, PhaseResult::Succeeded | PhaseResult::SoftSucceeded)
    }

    fn describe(self) -> String {
        match self {
            PhaseResult::Succeeded => "completed".to_string(),
            PhaseResult::SoftSucceeded => "crashed but left its output behind".to_string(),
            PhaseResult::Failed(code) => AppError::ProcessFailure { exit_code: code as i32 }.to_string(),
            PhaseResult::Crashed => AppError::ProcessCrash("terminated by a signal".to_string()).to_string(),
            PhaseResult::TimedOut => AppError::TimeoutError("session exceeded its time limit".to_string()).to_string(),
        }
    }
}

#[derive(Debug, Clone)]
struct PhaseCommand {
    label: &'static str,
    program: String,
    args: Vec<String>,
    cwd: PathBuf,
    /// Any of these existing after a crash upgrades the phase to a soft success.
    evidence: Vec<PathBuf>,
}

/// Controlling side of the pty for the phase currently running.
struct PtyControl {
    _master: Box<dyn MasterPty + Send>,
    writer: Box<dyn Write + Send>,
    killer: Box<dyn ChildKiller + Send + Sync>,
}

pub struct TerminalSession {
    key: String,
    created_at: DateTime<Utc>,
    phase: StdMutex<SessionPhase>,
    control: StdMutex<Option<PtyControl>>,
    events: StdMutex<Option<mpsc::Receiver<StreamEvent>>>,
    driver: StdMutex<Option<JoinHandle<()>>>,
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl TerminalSession {
    pub fn phase(&self) -> SessionPhase {
        *lock(&self.phase)
    }

    fn advance(&self, next: SessionPhase) {
        let mut phase = lock(&self.phase);
        if *phase != SessionPhase::CleanedUp {
            debug!(session_key = %self.key, from = ?*phase, to = ?next, "Session phase change");
            *phase = next;
        }
    }

    /// Installs the pty for a new phase unless the session was cleaned up meanwhile.
    fn install_control(&self, mut control: PtyControl) -> Result<(), AppError> {
        let phase = lock(&self.phase);
        if *phase == SessionPhase::CleanedUp {
            let _ = control.killer.kill();
            return Err(AppError::SessionNotFound(self.key.clone()));
        }
        *lock(&self.control) = Some(control);
        Ok(())
    }

    /// Drops the controlling side, closing the terminal.
    fn release_control(&self) {
        lock(&self.control).take();
    }

    fn kill_active(&self) {
        if let Some(control) = lock(&self.control).as_mut() {
            if let Err(e) = control.killer.kill() {
                debug!(session_key = %self.key, error = %e, "Kill failed; process likely already exited");
            }
        }
    }

    fn write_input(&self, data: &[u8]) -> Result<(), AppError> {
        let mut control = lock(&self.control);
        let control = control
            .as_mut()
            .ok_or_else(|| AppError::InvalidInput(format!("Session {} has no running phase", self.key)))?;
        control
            .writer
            .write_all(data)
            .and_then(|_| control.writer.flush())
            .map_err(|e| AppError::PtyError(format!("Failed to write to terminal: {}", e)))
    }

    /// Idempotent teardown: kill the live process, close the terminal, stop the driver.
    fn shutdown(&self) {
        {
            let mut phase = lock(&self.phase);
            if *phase == SessionPhase::CleanedUp {
                return;
            }
            *phase = SessionPhase::CleanedUp;
        }
        if let Some(mut control) = lock(&self.control).take() {
            if let Err(e) = control.killer.kill() {
                debug!(session_key = %self.key, error = %e, "Kill during cleanup failed");
            }
        }
        if let Some(driver) = lock(&self.driver).take() {
            driver.abort();
        }
        info!(session_key = %self.key, "Session cleaned up");
    }
}

struct SpawnedPhase {
    child: Box<dyn Child + Send + Sync>,
    reader: Box<dyn Read + Send>,
    control: PtyControl,
}

fn spawn_in_pty(command: &PhaseCommand, api_key: Option<&ApiKey>) -> Result<SpawnedPhase, AppError> {
    let pty_system = native_pty_system();
    let pair = pty_system
        .openpty(PtySize {
            rows: 40,
            cols: 120,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(|e| AppError::PtyError(e.to_string()))?;

    let mut cmd = CommandBuilder::new(&command.program);
    cmd.args(&command.args);
    cmd.cwd(&command.cwd);
    cmd.env("TERM", "xterm-256color");
    cmd.env("PYTHONUNBUFFERED", "1");
    if let Some(key) = api_key {
        cmd.env(CHILD_ENV_VAR, key.expose());
    }

    let child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|e| AppError::CommandExecutionError(format!("Failed to spawn '{}': {}", command.program, e)))?;
    // Only the controlling side stays open in this process.
    drop(pair.slave);

    let reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| AppError::PtyError(e.to_string()))?;
    let writer = pair
        .master
        .take_writer()
        .map_err(|e| AppError::PtyError(e.to_string()))?;
    let killer = child.clone_killer();

    Ok(SpawnedPhase {
        child,
        reader,
        control: PtyControl {
            _master: pair.master,
            writer,
            killer,
        },
    })
}

/// Forwards raw pty chunks from a blocking reader thread into the async driver.
fn spawn_reader_thread(mut reader: Box<dyn Read + Send>, tx: mpsc::Sender<Vec<u8>>) {
    std::thread::spawn(move || {
        let mut buf = [0u8; READ_BUFFER_SIZE];
        loop {
            match reader.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
            }
        }
    });
}

struct ChainContext {
    session: Arc<TerminalSession>,
    sink: ChannelSink,
    store: Arc<dyn ArtifactStore>,
    api_key: Option<ApiKey>,
    deadline: Instant,
    poll_interval: std::time::Duration,
    phase1: PhaseCommand,
    phase2: PhaseCommand,
    artifact_candidates: Vec<PathBuf>,
}

impl ChainContext {
    /// Waits for room in the event channel, but never past the session deadline.
    /// Returns false if the event was dropped because nobody drained the stream in time.
    async fn emit(&self, event: StreamEvent) -> bool {
        match timeout_at(self.deadline, self.sink.emit(event)).await {
            Ok(()) => true,
            Err(_) => {
                debug!(session_key = %self.session.key, "Event stream full at the deadline; event dropped");
                false
            }
        }
    }

    #[instrument(skip(self, command), fields(session_key = %self.session.key, phase = command.label))]
    async fn run_phase(&self, command: &PhaseCommand) -> Result<PhaseResult, AppError> {
        let SpawnedPhase {
            mut child,
            reader,
            control,
        } = spawn_in_pty(command, self.api_key.as_ref())?;
        self.session.install_control(control)?;
        info!(pid = ?child.process_id(), program = %command.program, "Phase process started");

        let (chunk_tx, mut chunk_rx) = mpsc::channel::<Vec<u8>>(64);
        spawn_reader_thread(reader, chunk_tx);

        let mut decoder = ChunkDecoder::new();
        let mut exit_status = None;
        loop {
            if Instant::now() >= self.deadline {
                return Ok(self.time_out(&mut decoder, command, child.as_mut()).await);
            }
            match timeout(self.poll_interval, chunk_rx.recv()).await {
                Ok(Some(chunk)) => {
                    let text = decoder.push(&chunk);
                    if !text.is_empty()
                        && !self
                            .emit(StreamEvent::output(text).with_extra(json!({ "phase": command.label })))
                            .await
                    {
                        return Ok(self.time_out(&mut decoder, command, child.as_mut()).await);
                    }
                }
                // Terminal closed: every holder of the subordinate side is gone.
                Ok(None) => break,
                Err(_) => {
                    if let Some(status) = child.try_wait()? {
                        // Exited while something else keeps the terminal open.
                        exit_status = Some(status);
                        break;
                    }
                }
            }
        }

        let status = loop {
            if let Some(status) = exit_status.take() {
                break status;
            }
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if Instant::now() >= self.deadline {
                return Ok(self.time_out(&mut decoder, command, child.as_mut()).await);
            }
            sleep(self.poll_interval).await;
        };

        if decoder.has_pending() {
            let rest = decoder.finish();
            self.emit(StreamEvent::output(rest).with_extra(json!({ "phase": command.label }))).await;
        }
        self.session.release_control();

        let result = if status.success() {
            PhaseResult::Succeeded
        } else if status.signal().is_some() {
            if command.evidence.iter().any(|p| p.exists()) {
                warn!("Phase crashed but its expected output exists; continuing");
                PhaseResult::SoftSucceeded
            } else {
                PhaseResult::Crashed
            }
        } else {
            PhaseResult::Failed(status.exit_code())
        };
        info!(result = ?result, "Phase process finished");
        Ok(result)
    }

    async fn time_out(
        &self,
        decoder: &mut ChunkDecoder,
        command: &PhaseCommand,
        child: &mut (dyn Child + Send + Sync),
    ) -> PhaseResult {
        warn!(session_key = %self.session.key, phase = command.label, "Session timed out; killing process");
        self.session.kill_active();
        self.session.release_control();
        for _ in 0..REAP_ATTEMPTS {
            match child.try_wait() {
                Ok(Some(_)) | Err(_) => break,
                Ok(None) => sleep(self.poll_interval).await,
            }
        }
        if decoder.has_pending() {
            let rest = decoder.finish();
            self.emit(StreamEvent::output(rest).with_extra(json!({ "phase": command.label }))).await;
        }
        PhaseResult::TimedOut
    }

    async fn fail(&self, message: String, extra: serde_json::Value) {
        self.session.advance(SessionPhase::Failed);
        self.emit(StreamEvent::error(message).with_extra(extra)).await;
    }

    /// Runs the chain, then expires the session if no client ever took its events.
    async fn drive(self, sessions: SessionMap, unclaimed_grace: std::time::Duration) {
        let session = self.session.clone();
        self.run_chain().await;
        expire_if_unclaimed(&sessions, &session, unclaimed_grace).await;
    }

    async fn run_chain(self) {
        let key = self.session.key.clone();
        self.emit(StreamEvent::started("Starting persona generation").with_extra(json!({ "session_key": key })))
            .await;

        self.session.advance(SessionPhase::Phase1Running);
        self.emit(StreamEvent::started(format!("{} started", self.phase1.label))).await;
        let phase1 = match self.run_phase(&self.phase1).await {
            Ok(result) => result,
            Err(e) => {
                self.fail(format!("{} could not run: {}", self.phase1.label, e), json!({ "phase": self.phase1.label }))
                    .await;
                return;
            }
        };
        if !phase1.is_success() {
            self.fail(
                format!("{} {}; generation aborted", self.phase1.label, phase1.describe()),
                json!({ "phase": self.phase1.label }),
            )
            .await;
            return;
        }
        self.session.advance(SessionPhase::Phase1Done);
        self.emit(StreamEvent::completed(format!("{} {}", self.phase1.label, phase1.describe()))).await;

        self.session.advance(SessionPhase::Phase2Running);
        self.emit(StreamEvent::started(format!("{} started", self.phase2.label))).await;
        let phase2 = match self.run_phase(&self.phase2).await {
            Ok(result) => result,
            Err(e) => {
                self.fail(format!("{} could not run: {}", self.phase2.label, e), json!({ "phase": self.phase2.label }))
                    .await;
                return;
            }
        };
        if !phase2.is_success() {
            self.fail(
                format!("{} {}", self.phase2.label, phase2.describe()),
                json!({ "phase": self.phase2.label }),
            )
            .await;
            return;
        }

        let Some(found) = self.artifact_candidates.iter().find(|p| p.exists()) else {
            let searched: Vec<String> = self.artifact_candidates.iter().map(|p| p.display().to_string()).collect();
            let err = AppError::ArtifactNotFound(searched.join(", "));
            self.fail(err.to_string(), json!({ "phase": self.phase2.label })).await;
            return;
        };
        match self.store.import_generated(found).await {
            Ok(artifact) => {
                self.session.advance(SessionPhase::Phase2Done);
                info!(session_key = %key, artifact = %artifact.name, "Generated juror stored");
                self.emit(
                    StreamEvent::completed(format!("Generated juror {}", artifact.name))
                        .with_extra(json!({ "artifact": artifact })),
                )
                .await;
            }
            Err(e) => {
                self.fail(format!("Generated file could not be stored: {}", e), json!({ "phase": self.phase2.label }))
                    .await;
            }
        }
    }
}

async fn expire_if_unclaimed(sessions: &SessionMap, session: &Arc<TerminalSession>, grace: std::time::Duration) {
    if lock(&session.events).is_none() {
        return;
    }
    sleep(grace).await;
    if lock(&session.events).is_none() {
        return;
    }
    {
        let mut map = sessions.lock().await;
        // The key may have been reused by a newer session.
        if map.get(&session.key).is_some_and(|current| Arc::ptr_eq(current, session)) {
            map.remove(&session.key);
        }
    }
    info!(session_key = %session.key, phase = ?session.phase(), "Session expired without a listener");
    session.shutdown();
}

/// Interactive pty sessions keyed by client identity.
pub struct SessionManager {
    config: Arc<Config>,
    store: Arc<dyn ArtifactStore>,
    sessions: SessionMap,
}

impl SessionManager {
    pub fn new(config: Arc<Config>, store: Arc<dyn ArtifactStore>) -> Self {
        Self {
            config,
            store,
            sessions: Arc::new(TokioMutex::new(HashMap::new())),
        }
    }

    fn workdir(&self) -> PathBuf {
        let base = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        canonical_or_lexical(&resolve_against(&base, &self.config.generator_workdir))
    }

    fn phase_command(&self, label: &'static str, args: &[String], evidence: Vec<PathBuf>, cwd: &Path) -> PhaseCommand {
        PhaseCommand {
            label,
            program: self.config.generator_program.clone(),
            args: args.to_vec(),
            cwd: cwd.to_path_buf(),
            evidence,
        }
    }

    #[instrument(skip(self, params))]
    pub async fn start_session(&self, params: &StartSessionParams) -> Result<StartSessionResult, AppError> {
        let key = params
            .session_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(String::from)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        if self.cleanup(&key).await {
            debug!(session_key = %key, "Replaced previous session with the same key");
        }

        let workdir = self.workdir();
        let artifact_candidates: Vec<PathBuf> = self
            .config
            .generator_artifact_candidates
            .iter()
            .map(|p| resolve_against(&workdir, p))
            .collect();
        let phase1_evidence: Vec<PathBuf> = self
            .config
            .generator_phase1_evidence
            .iter()
            .map(|p| resolve_against(&workdir, p))
            .collect();

        let (sink, rx) = ChannelSink::new(SESSION_EVENT_CAPACITY);
        let session = Arc::new(TerminalSession {
            key: key.clone(),
            created_at: Utc::now(),
            phase: StdMutex::new(SessionPhase::Starting),
            control: StdMutex::new(None),
            events: StdMutex::new(Some(rx)),
            driver: StdMutex::new(None),
        });

        let context = ChainContext {
            session: session.clone(),
            sink,
            store: self.store.clone(),
            api_key: resolve_api_key(&workdir, &self.config.credential_files),
            deadline: Instant::now() + self.config.session_timeout,
            poll_interval: self.config.pty_poll_interval,
            phase1: self.phase_command("Persona generation", &self.config.generator_phase1_args, phase1_evidence, &workdir),
            phase2: self.phase_command(
                "Juror assembly",
                &self.config.generator_phase2_args,
                artifact_candidates.clone(),
                &workdir,
            ),
            artifact_candidates,
        };

        self.sessions.lock().await.insert(key.clone(), session.clone());
        let driver = tokio::spawn(context.drive(self.sessions.clone(), self.config.unclaimed_session_grace));
        *lock(&session.driver) = Some(driver);
        info!(session_key = %key, "Interactive session started");

        Ok(StartSessionResult {
            message: format!("Session {} started", key),
            session_key: key,
        })
    }

    async fn get(&self, key: &str) -> Result<Arc<TerminalSession>, AppError> {
        self.sessions
            .lock()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| AppError::SessionNotFound(key.to_string()))
    }

    /// Hands the session's event stream to its single consumer.
    pub async fn take_events(&self, key: &str) -> Result<mpsc::Receiver<StreamEvent>, AppError> {
        let session = self.get(key).await?;
        let taken = lock(&session.events).take();
        taken.ok_or_else(|| AppError::InvalidInput(format!("Session {} already has a listener", key)))
    }

    #[instrument(skip(self, params), fields(bytes = params.data.len()))]
    pub async fn send_input(&self, key: &str, params: &SendInputParams) -> Result<(), AppError> {
        let session = self.get(key).await?;
        session.write_input(params.data.as_bytes())
    }

    pub async fn phase(&self, key: &str) -> Result<SessionPhase, AppError> {
        Ok(self.get(key).await?.phase())
    }

    /// Returns whether a session was removed. Safe to call repeatedly.
    #[instrument(skip(self))]
    pub async fn cleanup(&self, key: &str) -> bool {
        let removed = self.sessions.lock().await.remove(key);
        match removed {
            Some(session) => {
                session.shutdown();
                true
            }
            None => false,
        }
    }

    pub async fn cleanup_all(&self) -> usize {
        let drained: Vec<Arc<TerminalSession>> = self.sessions.lock().await.drain().map(|(_, s)| s).collect();
        for session in &drained {
            session.shutdown();
        }
        drained.len()
    }

    pub async fn list_sessions(&self) -> Vec<SessionInfo> {
        let sessions = self.sessions.lock().await;
        let mut infos: Vec<SessionInfo> = sessions
            .values()
            .map(|s| SessionInfo {
                session_key: s.key.clone(),
                phase: s.phase(),
                created_at: s.created_at,
                events_attached: lock(&s.events).is_none(),
            })
            .collect();
        infos.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        infos
    }
}
