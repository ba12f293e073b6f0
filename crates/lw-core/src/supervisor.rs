//! Long-running worker supervision.
//!
//! [`WorkerSupervisor`] is a cloneable handle onto a single actor task. The
//! actor owns everything mutable: the status, the worker's stdin and control
//! channel, the [`LineParser`] and the [`EventBuffer`]. Reader tasks forward
//! stdout and stderr chunks into the actor's internal channel, so output is
//! handled strictly in arrival order and no lock guards supervisor state.
//!
//! # State machine
//!
//! ```text
//! stopped --start()--> starting --spawn ok--> running
//! starting --spawn error--> stopped
//! running <--pause()/resume()--> paused
//! {running,paused} --stop_after_current()--> stopping_after_current
//! stopping_after_current --cancel_stop_after_current()--> running
//! {running,paused,stopping_after_current} --stop()--> stopping --exit--> stopped
//! any --unsolicited exit--> stopped
//! ```
//!
//! Structured events that arrive while paused are held in the buffer and
//! flushed in order on resume. Raw output lines arriving while paused are
//! dropped. When the worker exits the buffer is discarded, never replayed.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::io::AsyncReadExt;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::buffer::EventBuffer;
use crate::config::WorkerConfig;
use crate::error::SupervisorError;
use crate::launcher::{
    BoxedReader, BoxedWriter, ExitInfo, Invocation, ProcessSignal, WorkerControl, WorkerLauncher,
};
use crate::protocol::{LineParser, ParsedLine, StructuredEvent, encode_message, write_line};

/// Capacity of the handle → actor command channel.
const COMMAND_CHANNEL_CAPACITY: usize = 64;

/// Size of each stdout/stderr read.
const READ_CHUNK_SIZE: usize = 8 * 1024;

/// How long to wait for stdout to reach EOF after the worker has been reaped.
const STDOUT_DRAIN_GRACE_MS: u64 = 250;

/// Upper bound on a single stdin write (a suspended worker cannot drain its pipe).
const STDIN_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Lifecycle status of the supervised worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Stopped,
    Starting,
    Running,
    Paused,
    Stopping,
    StoppingAfterCurrent,
}

impl WorkerStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopping => "stopping",
            Self::StoppingAfterCurrent => "stopping_after_current",
        }
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Options for [`WorkerSupervisor::start`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartOptions {
    /// Append `--watch` to the invocation
    #[serde(default)]
    pub watch: bool,
    /// Append the iteration count as the trailing argument
    #[serde(default)]
    pub iterations: Option<u32>,
}

/// Notifications published by a [`WorkerSupervisor`].
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerSignal {
    /// The status changed
    Status(WorkerStatus),
    /// A structured line (held back while paused)
    Event(StructuredEvent),
    /// A non-JSON line (dropped while paused)
    Output(String),
    /// Spawn failure or a non-empty stderr chunk
    Error(String),
    /// The worker terminated
    Exit(ExitInfo),
}

/// Build the worker command line for `options`.
pub fn build_invocation(config: &WorkerConfig, options: StartOptions) -> Invocation {
    let mut invocation = Invocation::new(config.command.clone()).args(config.args.iter().cloned());
    if options.watch {
        invocation = invocation.arg("--watch");
    }
    if let Some(n) = options.iterations {
        invocation = invocation.arg(n.to_string());
    }
    if let Some(ref dir) = config.cwd {
        invocation = invocation.current_dir(dir);
    }
    invocation
}

type Reply<T> = oneshot::Sender<Result<T, SupervisorError>>;

enum Command {
    Start { options: StartOptions, reply: Reply<()> },
    Stop { timeout: Duration, reply: oneshot::Sender<()> },
    Pause { reply: Reply<()> },
    Resume { reply: Reply<()> },
    StopAfterCurrent { reply: Reply<()> },
    CancelStopAfterCurrent { reply: Reply<()> },
    Send { message: Value, reply: Reply<()> },
    Shutdown { reply: oneshot::Sender<()> },
}

/// Messages from the per-worker background tasks. `generation` identifies
/// the launch they belong to so late messages from a previous worker are
/// ignored.
enum Internal {
    Stdout { generation: u64, chunk: Vec<u8> },
    Stderr { generation: u64, text: String },
    Exited { generation: u64, result: io::Result<ExitInfo> },
    StopTimeout { generation: u64 },
}

/// Handle to a worker supervisor actor.
#[derive(Debug, Clone)]
pub struct WorkerSupervisor {
    commands: mpsc::Sender<Command>,
    signals: broadcast::Sender<WorkerSignal>,
    status: watch::Receiver<WorkerStatus>,
    default_stop_timeout: Duration,
}

impl WorkerSupervisor {
    /// Spawn the actor task. Must be called from within a tokio runtime.
    pub fn new(config: WorkerConfig, launcher: Arc<dyn WorkerLauncher>) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (signals, _) = broadcast::channel(config.signal_capacity.max(1));
        let (status_tx, status_rx) = watch::channel(WorkerStatus::Stopped);
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let default_stop_timeout = config.stop_timeout();

        let actor = Actor {
            config,
            launcher,
            status: WorkerStatus::Stopped,
            status_tx,
            signals: signals.clone(),
            internal_tx,
            worker: None,
            next_generation: 0,
            parser: LineParser::new(),
            buffer: EventBuffer::new(),
            stop_waiters: Vec::new(),
            shutdown_reply: None,
        };
        tokio::spawn(actor.run(cmd_rx, internal_rx));

        Self {
            commands: cmd_tx,
            signals,
            status: status_rx,
            default_stop_timeout,
        }
    }

    /// Subscribe to supervisor signals.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkerSignal> {
        self.signals.subscribe()
    }

    /// Current status snapshot.
    pub fn status(&self) -> WorkerStatus {
        *self.status.borrow()
    }

    /// Spawn the worker. Resolves once the spawn has succeeded.
    ///
    /// # Errors
    ///
    /// [`SupervisorError::AlreadyRunning`] if a worker is owned,
    /// [`SupervisorError::Spawn`] if the process could not be started.
    pub async fn start(&self, options: StartOptions) -> Result<(), SupervisorError> {
        self.request(|reply| Command::Start { options, reply }).await?
    }

    /// Ask the worker to exit and wait until it has. Escalates to a kill
    /// after `timeout` (the configured default when `None`). No-op when
    /// nothing is running.
    pub async fn stop(&self, timeout: Option<Duration>) -> Result<(), SupervisorError> {
        let timeout = timeout.unwrap_or(self.default_stop_timeout);
        self.request(|reply| Command::Stop { timeout, reply }).await
    }

    /// Suspend the worker. Idempotent while paused.
    pub async fn pause(&self) -> Result<(), SupervisorError> {
        self.request(|reply| Command::Pause { reply }).await?
    }

    /// Resume a paused worker and flush the events buffered meanwhile.
    pub async fn resume(&self) -> Result<(), SupervisorError> {
        self.request(|reply| Command::Resume { reply }).await?
    }

    /// Ask the worker to finish its current unit of work and then exit.
    pub async fn stop_after_current(&self) -> Result<(), SupervisorError> {
        self.request(|reply| Command::StopAfterCurrent { reply }).await?
    }

    /// Withdraw a pending stop-after-current request.
    pub async fn cancel_stop_after_current(&self) -> Result<(), SupervisorError> {
        self.request(|reply| Command::CancelStopAfterCurrent { reply }).await?
    }

    /// Write a message to the worker's stdin. JSON strings are written
    /// verbatim, anything else is JSON-encoded.
    pub async fn send(&self, message: Value) -> Result<(), SupervisorError> {
        self.request(|reply| Command::Send { message, reply }).await?
    }

    /// Stop any running worker with the default timeout and end the actor.
    pub async fn shutdown(&self) -> Result<(), SupervisorError> {
        self.request(|reply| Command::Shutdown { reply }).await
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SupervisorError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .await
            .map_err(|_| SupervisorError::Closed)?;
        rx.await.map_err(|_| SupervisorError::Closed)
    }
}

struct OwnedWorker {
    generation: u64,
    pid: Option<u32>,
    stdin: BoxedWriter,
    control: mpsc::UnboundedSender<ProcessSignal>,
    cooperative_pause: bool,
}

impl OwnedWorker {
    fn signal(&self, signal: ProcessSignal) {
        if self.control.send(signal).is_err() {
            tracing::debug!(?signal, "worker already reaped; signal not delivered");
        }
    }
}

struct Actor {
    config: WorkerConfig,
    launcher: Arc<dyn WorkerLauncher>,
    status: WorkerStatus,
    status_tx: watch::Sender<WorkerStatus>,
    signals: broadcast::Sender<WorkerSignal>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    worker: Option<OwnedWorker>,
    next_generation: u64,
    parser: LineParser,
    buffer: EventBuffer,
    stop_waiters: Vec<oneshot::Sender<()>>,
    shutdown_reply: Option<oneshot::Sender<()>>,
}

impl Actor {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
    ) {
        loop {
            tokio::select! {
                cmd = commands.recv() => {
                    let Some(cmd) = cmd else {
                        if let Some(worker) = self.worker.take() {
                            tracing::debug!("all supervisor handles dropped; killing worker");
                            worker.signal(ProcessSignal::Kill);
                        }
                        break;
                    };
                    if self.handle_command(cmd).await {
                        break;
                    }
                }
                Some(msg) = internal.recv() => {
                    self.handle_internal(msg);
                    if self.worker.is_none() {
                        if let Some(reply) = self.shutdown_reply.take() {
                            let _ = reply.send(());
                            break;
                        }
                    }
                }
            }
        }
        tracing::debug!("worker supervisor actor stopped");
    }

    /// Returns true when the actor should exit.
    async fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Start { options, reply } => {
                let _ = reply.send(self.start(options));
            }
            Command::Stop { timeout, reply } => self.stop(timeout, reply),
            Command::Pause { reply } => {
                let _ = reply.send(self.pause().await);
            }
            Command::Resume { reply } => {
                let _ = reply.send(self.resume().await);
            }
            Command::StopAfterCurrent { reply } => {
                let _ = reply.send(self.stop_after_current().await);
            }
            Command::CancelStopAfterCurrent { reply } => {
                let _ = reply.send(self.cancel_stop_after_current().await);
            }
            Command::Send { message, reply } => {
                let result = match encode_message(&message) {
                    Ok(line) => self.write_stdin(&line).await,
                    Err(e) => Err(SupervisorError::Serialize(e)),
                };
                let _ = reply.send(result);
            }
            Command::Shutdown { reply } => {
                if self.worker.is_none() {
                    let _ = reply.send(());
                    return true;
                }
                self.shutdown_reply = Some(reply);
                let (tx, _rx) = oneshot::channel();
                self.stop(self.config.stop_timeout(), tx);
            }
        }
        false
    }

    fn emit(&self, signal: WorkerSignal) {
        // No subscribers is not an error.
        let _ = self.signals.send(signal);
    }

    fn set_status(&mut self, status: WorkerStatus) {
        if self.status == status {
            return;
        }
        tracing::debug!(from = %self.status, to = %status, "worker status change");
        self.status = status;
        self.status_tx.send_replace(status);
        self.emit(WorkerSignal::Status(status));
    }

    fn start(&mut self, options: StartOptions) -> Result<(), SupervisorError> {
        if self.worker.is_some() {
            return Err(SupervisorError::AlreadyRunning);
        }
        self.set_status(WorkerStatus::Starting);

        let invocation = build_invocation(&self.config, options);
        let io = match self.launcher.launch(&invocation) {
            Ok(io) => io,
            Err(source) => {
                tracing::error!(command = %invocation, error = %source, "failed to spawn worker");
                let err = SupervisorError::Spawn {
                    command: invocation.program.clone(),
                    source,
                };
                self.set_status(WorkerStatus::Stopped);
                self.emit(WorkerSignal::Error(err.to_string()));
                return Err(err);
            }
        };

        self.next_generation += 1;
        let generation = self.next_generation;
        self.parser.reset();
        self.buffer.clear();

        let stdout_task = tokio::spawn(read_stdout(
            generation,
            io.stdout,
            self.internal_tx.clone(),
        ));
        if let Some(stderr) = io.stderr {
            tokio::spawn(read_stderr(generation, stderr, self.internal_tx.clone()));
        }
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        tokio::spawn(supervise_process(
            generation,
            io.control,
            control_rx,
            stdout_task,
            self.internal_tx.clone(),
        ));

        tracing::info!(pid = io.pid, command = %invocation, "worker started");
        self.worker = Some(OwnedWorker {
            generation,
            pid: io.pid,
            stdin: io.stdin,
            control: control_tx,
            cooperative_pause: io.cooperative_pause,
        });
        self.set_status(WorkerStatus::Running);
        Ok(())
    }

    fn stop(&mut self, timeout: Duration, reply: oneshot::Sender<()>) {
        let Some(worker) = self.worker.as_ref() else {
            let _ = reply.send(());
            return;
        };
        self.stop_waiters.push(reply);
        if self.status == WorkerStatus::Stopping {
            return;
        }

        let was_paused = self.status == WorkerStatus::Paused;
        let generation = worker.generation;
        tracing::info!(pid = worker.pid, ?timeout, "stopping worker");
        worker.signal(ProcessSignal::Terminate);
        if was_paused && !worker.cooperative_pause {
            worker.signal(ProcessSignal::Continue);
        }
        self.set_status(WorkerStatus::Stopping);

        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = internal.send(Internal::StopTimeout { generation });
        });
    }

    async fn pause(&mut self) -> Result<(), SupervisorError> {
        if self.worker.is_none() {
            return Err(SupervisorError::NotRunning);
        }
        match self.status {
            WorkerStatus::Paused => return Ok(()),
            WorkerStatus::Running => {}
            status => {
                return Err(SupervisorError::InvalidState {
                    operation: "pause",
                    status,
                });
            }
        }
        self.suspend_worker().await?;
        self.set_status(WorkerStatus::Paused);
        Ok(())
    }

    async fn resume(&mut self) -> Result<(), SupervisorError> {
        if self.worker.is_none() {
            return Err(SupervisorError::NotRunning);
        }
        if self.status != WorkerStatus::Paused {
            return Err(SupervisorError::InvalidState {
                operation: "resume",
                status: self.status,
            });
        }
        self.continue_worker().await?;
        self.set_status(WorkerStatus::Running);
        self.flush_buffer();
        Ok(())
    }

    async fn stop_after_current(&mut self) -> Result<(), SupervisorError> {
        if self.worker.is_none() {
            return Err(SupervisorError::NotRunning);
        }
        match self.status {
            WorkerStatus::Running => {}
            WorkerStatus::Paused => {
                self.continue_worker().await?;
                self.set_status(WorkerStatus::Running);
                self.flush_buffer();
            }
            status => {
                return Err(SupervisorError::InvalidState {
                    operation: "stop after current",
                    status,
                });
            }
        }
        self.write_control("stop_after_current").await?;
        self.set_status(WorkerStatus::StoppingAfterCurrent);
        Ok(())
    }

    async fn cancel_stop_after_current(&mut self) -> Result<(), SupervisorError> {
        if self.worker.is_none() {
            return Err(SupervisorError::NotRunning);
        }
        if self.status != WorkerStatus::StoppingAfterCurrent {
            return Err(SupervisorError::InvalidState {
                operation: "cancel stop after current",
                status: self.status,
            });
        }
        self.write_control("cancel_stop_after_current").await?;
        self.set_status(WorkerStatus::Running);
        Ok(())
    }

    async fn suspend_worker(&mut self) -> Result<(), SupervisorError> {
        let Some(worker) = self.worker.as_ref() else {
            return Err(SupervisorError::NotRunning);
        };
        if worker.cooperative_pause {
            return self.write_control("pause").await;
        }
        worker.signal(ProcessSignal::Suspend);
        Ok(())
    }

    async fn continue_worker(&mut self) -> Result<(), SupervisorError> {
        let Some(worker) = self.worker.as_ref() else {
            return Err(SupervisorError::NotRunning);
        };
        if worker.cooperative_pause {
            return self.write_control("resume").await;
        }
        worker.signal(ProcessSignal::Continue);
        Ok(())
    }

    async fn write_control(&mut self, kind: &str) -> Result<(), SupervisorError> {
        let line = serde_json::to_string(&json!({ "type": kind }))?;
        self.write_stdin(&line).await
    }

    async fn write_stdin(&mut self, line: &str) -> Result<(), SupervisorError> {
        let Some(worker) = self.worker.as_mut() else {
            return Err(SupervisorError::NotRunning);
        };
        match tokio::time::timeout(STDIN_WRITE_TIMEOUT, write_line(&mut worker.stdin, line)).await
        {
            Ok(result) => result.map_err(SupervisorError::from),
            Err(_) => Err(SupervisorError::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                "timed out writing to worker stdin",
            ))),
        }
    }

    fn flush_buffer(&mut self) {
        let events = self.buffer.drain();
        if !events.is_empty() {
            tracing::debug!(count = events.len(), "flushing events buffered while paused");
        }
        for event in events {
            self.emit(WorkerSignal::Event(event));
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.worker
            .as_ref()
            .is_some_and(|w| w.generation == generation)
    }

    fn handle_internal(&mut self, msg: Internal) {
        match msg {
            Internal::Stdout { generation, chunk } => {
                if !self.is_current(generation) {
                    return;
                }
                for line in self.parser.push(&chunk) {
                    self.handle_line(line);
                }
            }
            Internal::Stderr { generation, text } => {
                if self.is_current(generation) {
                    tracing::debug!(stderr = %text, "worker stderr");
                    self.emit(WorkerSignal::Error(text));
                }
            }
            Internal::StopTimeout { generation } => {
                if self.is_current(generation) && self.status == WorkerStatus::Stopping {
                    if let Some(worker) = self.worker.as_ref() {
                        tracing::warn!(pid = worker.pid, "worker ignored terminate; killing");
                        worker.signal(ProcessSignal::Kill);
                    }
                }
            }
            Internal::Exited { generation, result } => {
                if self.is_current(generation) {
                    self.on_exit(result);
                }
            }
        }
    }

    fn handle_line(&mut self, line: ParsedLine) {
        let paused = self.status == WorkerStatus::Paused;
        match line {
            ParsedLine::Event(event) if paused => self.buffer.push(event),
            ParsedLine::Event(event) => self.emit(WorkerSignal::Event(event)),
            ParsedLine::Raw(text) if paused => {
                tracing::trace!(line = %text, "dropping raw output while paused");
            }
            ParsedLine::Raw(text) => self.emit(WorkerSignal::Output(text)),
        }
    }

    fn on_exit(&mut self, result: io::Result<ExitInfo>) {
        let pid = self.worker.take().and_then(|w| w.pid);
        if self.parser.pending() > 0 {
            tracing::debug!(bytes = self.parser.pending(), "discarding incomplete trailing line");
        }
        self.parser.reset();
        let dropped = self.buffer.clear();
        if dropped > 0 {
            tracing::debug!(dropped, "discarding events buffered while paused");
        }

        let info = match result {
            Ok(info) => info,
            Err(e) => {
                tracing::warn!(error = %e, "failed to wait on worker");
                self.emit(WorkerSignal::Error(format!("Failed to wait on worker: {e}")));
                ExitInfo::default()
            }
        };
        tracing::info!(pid, code = info.code, signal = info.signal, "worker exited");

        self.set_status(WorkerStatus::Stopped);
        self.emit(WorkerSignal::Exit(info));
        for waiter in self.stop_waiters.drain(..) {
            let _ = waiter.send(());
        }
    }
}

async fn read_stdout(
    generation: u64,
    mut stdout: BoxedReader,
    internal: mpsc::UnboundedSender<Internal>,
) {
    let mut buf = vec![0u8; READ_CHUNK_SIZE];
    loop {
        match stdout.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let chunk = buf[..n].to_vec();
                if internal.send(Internal::Stdout { generation, chunk }).is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "worker stdout read failed");
                break;
            }
        }
    }
}

async fn read_stderr(
    generation: u64,
    mut stderr: BoxedReader,
    internal: mpsc::UnboundedSender<Internal>,
) {
    let mut buf = vec![0u8; READ_CHUNK_SIZE];
    loop {
        match stderr.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let text = String::from_utf8_lossy(&buf[..n]).trim().to_string();
                if text.is_empty() {
                    continue;
                }
                if internal.send(Internal::Stderr { generation, text }).is_err() {
                    break;
                }
            }
        }
    }
}

/// Own the worker's control handle: deliver signal requests until the worker
/// exits, then let stdout drain before reporting the exit.
async fn supervise_process(
    generation: u64,
    mut control: Box<dyn WorkerControl>,
    mut signals: mpsc::UnboundedReceiver<ProcessSignal>,
    mut stdout_task: JoinHandle<()>,
    internal: mpsc::UnboundedSender<Internal>,
) {
    let result = loop {
        tokio::select! {
            result = control.wait() => break result,
            Some(signal) = signals.recv() => {
                if let Err(e) = control.signal(signal) {
                    tracing::warn!(?signal, error = %e, "failed to signal worker");
                }
            }
        }
    };

    let grace = Duration::from_millis(STDOUT_DRAIN_GRACE_MS);
    if tokio::time::timeout(grace, &mut stdout_task).await.is_err() {
        tracing::debug!("worker stdout still open after exit; abandoning reader");
        stdout_task.abort();
    }
    let _ = internal.send(Internal::Exited { generation, result });
}
