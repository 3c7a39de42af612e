//! One worker subprocess per session.
//!
//! Each worker gets three tasks: a stdout reader that decodes events, a
//! stderr reader for diagnostics, and a monitor that owns the `Child` and
//! handles both explicit stops and unexpected exits.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::ChatPilotError;
use crate::notify::Notifier;
use crate::protocol::{decode_line, WorkerCommand, WorkerEvent};

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Program and leading args, split shell-style.
    pub worker_command: String,
    pub sessions_dir: String,
    pub restart_backoff: Duration,
    pub stop_grace: Duration,
    pub event_capacity: usize,
}

impl SupervisorConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            worker_command: config.worker_command.clone(),
            sessions_dir: config.sessions_dir.clone(),
            restart_backoff: Duration::from_millis(config.worker_restart_backoff_ms),
            stop_grace: Duration::from_millis(config.worker_stop_grace_ms),
            event_capacity: config.event_feed_capacity,
        }
    }
}

/// Lifecycle notifications, separate from the decoded event stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    Started { session_id: String, pid: u32 },
    Exited { session_id: String, code: Option<i32> },
    RestartScheduled { session_id: String, delay_ms: u64 },
    Stopped { session_id: String },
}

type StopAck = oneshot::Sender<()>;

struct WorkerHandle {
    stdin: Arc<tokio::sync::Mutex<ChildStdin>>,
    stop_tx: oneshot::Sender<StopAck>,
    pid: u32,
    generation: u64,
}

struct Inner {
    config: SupervisorConfig,
    notifier: Arc<dyn Notifier>,
    workers: Mutex<HashMap<String, WorkerHandle>>,
    pending_restarts: Mutex<HashMap<String, JoinHandle<()>>>,
    events: mpsc::Sender<WorkerEvent>,
    lifecycle: broadcast::Sender<SupervisorEvent>,
    next_generation: AtomicU64,
}

#[derive(Clone)]
pub struct ProcessSupervisor {
    inner: Arc<Inner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl ProcessSupervisor {
    /// Returns the supervisor and the receiving end of the decoded event stream.
    pub fn new(
        config: SupervisorConfig,
        notifier: Arc<dyn Notifier>,
    ) -> (Self, mpsc::Receiver<WorkerEvent>) {
        let (events, rx) = mpsc::channel(config.event_capacity.max(1));
        let (lifecycle, _) = broadcast::channel(256);
        let supervisor = Self {
            inner: Arc::new(Inner {
                config,
                notifier,
                workers: Mutex::new(HashMap::new()),
                pending_restarts: Mutex::new(HashMap::new()),
                events,
                lifecycle,
                next_generation: AtomicU64::new(1),
            }),
        };
        (supervisor, rx)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.inner.lifecycle.subscribe()
    }

    fn emit(&self, event: SupervisorEvent) {
        let _ = self.inner.lifecycle.send(event);
    }

    pub fn is_running(&self, session_id: &str) -> bool {
        lock(&self.inner.workers).contains_key(session_id)
    }

    pub fn running_sessions(&self) -> Vec<String> {
        let mut sessions: Vec<String> = lock(&self.inner.workers).keys().cloned().collect();
        sessions.sort();
        sessions
    }

    pub fn pid(&self, session_id: &str) -> Option<u32> {
        lock(&self.inner.workers).get(session_id).map(|h| h.pid)
    }

    fn build_command(&self, session_id: &str) -> Result<Command, ChatPilotError> {
        let parts = split_cmd(&self.inner.config.worker_command);
        let Some((program, args)) = parts.split_first() else {
            return Err(ChatPilotError::Config("worker_command is empty".into()));
        };
        let mut cmd = Command::new(program);
        cmd.args(args)
            .arg(session_id)
            .arg(&self.inner.config.sessions_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        Ok(cmd)
    }

    /// Spawn the worker for `session_id`; no-op if one is already tracked.
    pub async fn start(&self, session_id: &str) -> Result<(), ChatPilotError> {
        let mut workers = lock(&self.inner.workers);
        if workers.contains_key(session_id) {
            debug!(session_id, "Worker already running");
            return Ok(());
        }

        let mut child = self
            .build_command(session_id)?
            .spawn()
            .map_err(|e| ChatPilotError::Worker {
                session: session_id.to_string(),
                msg: format!("spawn failed: {e}"),
            })?;
        let pid = child.id().unwrap_or(0);
        let missing_pipe = |name: &str| ChatPilotError::Worker {
            session: session_id.to_string(),
            msg: format!("{name} pipe unavailable"),
        };
        let stdin = child.stdin.take().ok_or_else(|| missing_pipe("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing_pipe("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing_pipe("stderr"))?;

        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let (stop_tx, stop_rx) = oneshot::channel();
        workers.insert(
            session_id.to_string(),
            WorkerHandle {
                stdin: Arc::new(tokio::sync::Mutex::new(stdin)),
                stop_tx,
                pid,
                generation,
            },
        );
        drop(workers);

        spawn_stdout_reader(session_id.to_string(), stdout, self.inner.events.clone());
        spawn_stderr_reader(session_id.to_string(), stderr);
        self.spawn_monitor(session_id.to_string(), child, stop_rx, generation);

        info!(session_id, pid, "Started worker");
        self.emit(SupervisorEvent::Started {
            session_id: session_id.to_string(),
            pid,
        });
        Ok(())
    }

    fn spawn_monitor(
        &self,
        session_id: String,
        mut child: Child,
        stop_rx: oneshot::Receiver<StopAck>,
        generation: u64,
    ) {
        let supervisor = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => {
                    let code = match status {
                        Ok(status) => status.code(),
                        Err(e) => {
                            error!(session_id = %session_id, "Failed to wait on worker: {e}");
                            None
                        }
                    };
                    supervisor.on_exit(&session_id, code, generation).await;
                }
                ack = stop_rx => {
                    let grace = supervisor.inner.config.stop_grace;
                    if tokio::time::timeout(grace, child.wait()).await.is_err() {
                        warn!(session_id = %session_id, "Worker ignored stop, killing");
                        if let Err(e) = child.kill().await {
                            error!(session_id = %session_id, "Failed to kill worker: {e}");
                        }
                    }
                    info!(session_id = %session_id, "Stopped worker");
                    supervisor.emit(SupervisorEvent::Stopped { session_id: session_id.clone() });
                    if let Ok(ack) = ack {
                        let _ = ack.send(());
                    }
                }
            }
        });
    }

    async fn on_exit(&self, session_id: &str, code: Option<i32>, generation: u64) {
        let was_tracked = {
            let mut workers = lock(&self.inner.workers);
            let current = workers
                .get(session_id)
                .is_some_and(|h| h.generation == generation);
            if current {
                workers.remove(session_id);
            }
            current
        };
        info!(session_id, ?code, "Worker exited");
        self.emit(SupervisorEvent::Exited {
            session_id: session_id.to_string(),
            code,
        });

        // Untracked means an explicit stop raced the exit.
        if !was_tracked || code == Some(0) {
            return;
        }

        // Register the restart first so a stop during a slow alert cancels it.
        self.schedule_restart(session_id);
        let code_text = code.map_or_else(|| "signal".to_string(), |c| c.to_string());
        self.inner
            .notifier
            .alert(
                "Worker disconnected",
                &format!("Session {session_id} exited with code {code_text}"),
                None,
            )
            .await;
    }

    fn schedule_restart(&self, session_id: &str) {
        let delay = self.inner.config.restart_backoff;
        let mut pending = lock(&self.inner.pending_restarts);
        if pending.contains_key(session_id) {
            return;
        }
        warn!(
            session_id,
            delay_ms = delay.as_millis() as u64,
            "Scheduling worker restart"
        );
        self.emit(SupervisorEvent::RestartScheduled {
            session_id: session_id.to_string(),
            delay_ms: delay.as_millis() as u64,
        });

        let supervisor = self.clone();
        let session = session_id.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            lock(&supervisor.inner.pending_restarts).remove(&session);
            if let Err(e) = supervisor.start(&session).await {
                error!(session_id = %session, "Worker restart failed: {e}");
            }
        });
        pending.insert(session_id.to_string(), handle);
    }

    fn cancel_restart(&self, session_id: &str) {
        if let Some(handle) = lock(&self.inner.pending_restarts).remove(session_id) {
            handle.abort();
            debug!(session_id, "Cancelled pending restart");
        }
    }

    /// Ask the worker to stop, then kill it after the grace period. Idempotent.
    pub async fn stop(&self, session_id: &str) -> Result<(), ChatPilotError> {
        self.cancel_restart(session_id);
        let handle = lock(&self.inner.workers).remove(session_id);
        let Some(handle) = handle else {
            return Ok(());
        };

        if let Ok(line) = WorkerCommand::Stop.encode_line() {
            let mut stdin = handle.stdin.lock().await;
            if let Err(e) = stdin.write_all(line.as_bytes()).await {
                debug!(session_id, "Could not deliver stop command: {e}");
            }
            let _ = stdin.flush().await;
        }

        let (ack_tx, ack_rx) = oneshot::channel();
        if handle.stop_tx.send(ack_tx).is_ok() {
            // The monitor drops the ack if the process exited on its own first.
            let _ = ack_rx.await;
        }
        Ok(())
    }

    pub async fn stop_all(&self) {
        let sessions: Vec<String> = {
            let mut pending = lock(&self.inner.pending_restarts);
            for (_, handle) in pending.drain() {
                handle.abort();
            }
            lock(&self.inner.workers).keys().cloned().collect()
        };
        for session_id in sessions {
            if let Err(e) = self.stop(&session_id).await {
                error!(session_id = %session_id, "Failed to stop worker: {e}");
            }
        }
    }

    /// Write one command line to the worker's stdin.
    ///
    /// Fails with [`ChatPilotError::WorkerNotRunning`] when no worker is tracked,
    /// so callers can tell a dropped command from a delivered one.
    pub async fn send_command(
        &self,
        session_id: &str,
        command: &WorkerCommand,
    ) -> Result<(), ChatPilotError> {
        let stdin = lock(&self.inner.workers)
            .get(session_id)
            .map(|h| h.stdin.clone())
            .ok_or_else(|| ChatPilotError::WorkerNotRunning(session_id.to_string()))?;

        let line = command.encode_line()?;
        let mut stdin = stdin.lock().await;
        let write = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.flush().await
        };
        write.await.map_err(|e| ChatPilotError::Worker {
            session: session_id.to_string(),
            msg: format!("write {} failed: {e}", command.name()),
        })?;
        debug!(session_id, command = command.name(), "Sent command");
        Ok(())
    }
}

/// Where outbound worker commands go. The router and the action executor
/// depend on this rather than on the process table directly.
#[async_trait]
pub trait CommandSink: Send + Sync {
    async fn send_command(
        &self,
        session_id: &str,
        command: &WorkerCommand,
    ) -> Result<(), ChatPilotError>;
}

#[async_trait]
impl CommandSink for ProcessSupervisor {
    async fn send_command(
        &self,
        session_id: &str,
        command: &WorkerCommand,
    ) -> Result<(), ChatPilotError> {
        ProcessSupervisor::send_command(self, session_id, command).await
    }
}

fn spawn_stdout_reader(
    session_id: String,
    stdout: tokio::process::ChildStdout,
    events: mpsc::Sender<WorkerEvent>,
) {
    tokio::spawn(async move {
        let mut reader = BufReader::new(stdout);
        let mut buf = Vec::new();
        loop {
            match read_lossy_line(&mut reader, &mut buf).await {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match decode_line(&line) {
                        Ok(event) => {
                            if events.send(event).await.is_err() {
                                debug!(session_id = %session_id, "Event receiver closed");
                                break;
                            }
                        }
                        Err(_) => info!(target: "worker", session_id = %session_id, "{line}"),
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(target: "worker", session_id = %session_id, "stdout read error: {e}");
                    break;
                }
            }
        }
    });
}

fn spawn_stderr_reader(session_id: String, stderr: tokio::process::ChildStderr) {
    tokio::spawn(async move {
        let mut reader = BufReader::new(stderr);
        let mut buf = Vec::new();
        while let Ok(Some(line)) = read_lossy_line(&mut reader, &mut buf).await {
            warn!(target: "worker", session_id = %session_id, "{line}");
        }
    });
}

/// Next newline-terminated line with invalid UTF-8 replaced. `None` at EOF.
async fn read_lossy_line<R>(reader: &mut R, buf: &mut Vec<u8>) -> std::io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    if reader.read_until(b'\n', buf).await? == 0 {
        return Ok(None);
    }
    let line = String::from_utf8_lossy(buf);
    Ok(Some(line.trim_end_matches(&['\n', '\r'][..]).to_string()))
}

/// Shell-style splitting with single/double quotes and backslash escapes.
pub fn split_cmd(cmd: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut chars = cmd.chars();

    while let Some(ch) = chars.next() {
        match (ch, quote) {
            ('\\', q) if q != Some('\'') => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            ('\'' | '"', None) => quote = Some(ch),
            (c, Some(q)) if c == q => quote = None,
            (' ' | '\t', None) => {
                if !current.is_empty() {
                    parts.push(std::mem::take(&mut current));
                }
            }
            _ => current.push(ch),
        }
    }
    if !current.is_empty() {
        parts.push(current);
    }
    parts
}
