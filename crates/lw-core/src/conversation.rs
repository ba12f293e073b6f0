//! Chat supervision: one short-lived worker invocation per message.
//!
//! [`ConversationSupervisor::send_message`] records the user message, builds a
//! prompt that replays recent history, launches the chat worker in
//! `stream-json` mode and reconstructs the reply from its structured events:
//!
//! | Event shape | Effect |
//! |---|---|
//! | `content_block_delta` (bare or inside `stream_event`) | append delta, emit chunk |
//! | `assistant` | replace text with the joined text blocks, emit chunk |
//! | `result` with a string `result` | replace text (authoritative) |
//! | `error` | emit error, keep going |
//!
//! Every event is also forwarded verbatim. Transcript and status live behind
//! a short-lived mutex; cancellation goes through a [`CancellationToken`].

use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncReadExt;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::config::ConversationConfig;
use crate::error::ConversationError;
use crate::launcher::{
    BoxedReader, ExitInfo, Invocation, ProcessSignal, WorkerControl, WorkerLauncher,
};
use crate::now_ms;
use crate::protocol::{LineParser, ParsedLine, StructuredEvent};
use crate::task_context::{TaskContextSource, render_task_summary};

const SIGNAL_CAPACITY: usize = 256;
const READ_CHUNK_SIZE: usize = 8 * 1024;

/// How long stdout may stay open after the chat worker has exited.
const STDOUT_DRAIN_GRACE: Duration = Duration::from_millis(250);

/// How long a cancelled chat worker gets between SIGTERM and SIGKILL.
const CANCEL_KILL_GRACE: Duration = Duration::from_secs(5);

/// System prompt used when no instructions file is configured or readable.
pub const DEFAULT_INSTRUCTIONS: &str = "\
You are the operator's assistant for an autonomous coding loop supervised by loopwatch.
Answer questions about the loop's progress, its tasks and its output concisely.
You cannot run tools; when an action is needed, say which loopwatch command to use
(start, stop, pause, resume, stop after current).";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    fn label(self) -> &'static str {
        match self {
            Self::User => "User",
            Self::Assistant => "Assistant",
        }
    }
}

/// One transcript entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: Role,
    pub content: String,
    /// Epoch milliseconds
    pub timestamp: i64,
}

impl ConversationMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: now_ms(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    Idle,
    Processing,
    Error,
}

/// Notifications published by a [`ConversationSupervisor`].
#[derive(Debug, Clone, PartialEq)]
pub enum ConversationSignal {
    /// A message was appended to the transcript
    Message(ConversationMessage),
    /// Streaming text: a delta, or the full text so far for assistant events
    Chunk(String),
    /// Raw structured event from the chat worker
    Event(StructuredEvent),
    Error(String),
    Status(ConversationStatus),
    HistoryCleared,
}

/// Build the prompt for `text` given the transcript *before* it.
///
/// The first message goes out verbatim; later ones replay the last `window`
/// prior messages.
pub fn build_prompt(prior: &[ConversationMessage], text: &str, window: usize) -> String {
    if prior.is_empty() {
        return text.to_string();
    }
    let start = prior.len().saturating_sub(window);
    let replay: Vec<String> = prior[start..]
        .iter()
        .map(|m| format!("{}: {}", m.role.label(), m.content))
        .collect();
    format!(
        "Previous conversation:\n{}\n\nUser: {}",
        replay.join("\n"),
        text
    )
}

/// Build the chat worker command line.
pub fn build_invocation(config: &ConversationConfig, preamble: &str, prompt: &str) -> Invocation {
    Invocation::new(config.command.clone())
        .args(["--print", "--output-format", "stream-json", "--verbose"])
        .arg("--model")
        .arg(config.model.clone())
        .arg("--system-prompt")
        .arg(preamble)
        .arg("--tools")
        .arg("")
        .arg(prompt)
}

/// What a single structured event did to the reply.
#[derive(Debug, Clone, PartialEq, Eq)]
enum StreamUpdate {
    Chunk(String),
    Error(String),
}

/// Accumulates reply text from the chat worker's event stream.
#[derive(Debug, Default)]
struct ReplyStream {
    text: String,
}

impl ReplyStream {
    fn apply(&mut self, event: &StructuredEvent) -> Option<StreamUpdate> {
        match event.kind() {
            Some("content_block_delta") => self.apply_delta(event.fields().get("delta")),
            Some("stream_event") => {
                let inner = event.get("event")?;
                if inner.get("type").and_then(Value::as_str) != Some("content_block_delta") {
                    return None;
                }
                self.apply_delta(inner.get("delta"))
            }
            Some("assistant") => {
                let content = event
                    .get("message")
                    .and_then(|m| m.get("content"))
                    .and_then(Value::as_array)?;
                let full: String = content
                    .iter()
                    .filter(|block| block.get("type").and_then(Value::as_str) == Some("text"))
                    .filter_map(|block| block.get("text").and_then(Value::as_str))
                    .collect();
                if full.is_empty() {
                    return None;
                }
                self.text = full.clone();
                Some(StreamUpdate::Chunk(full))
            }
            Some("result") => {
                if let Some(result) = event.get("result").and_then(Value::as_str) {
                    self.text = result.to_string();
                }
                None
            }
            Some("error") => Some(StreamUpdate::Error(error_message(event))),
            _ => None,
        }
    }

    fn apply_delta(&mut self, delta: Option<&Value>) -> Option<StreamUpdate> {
        let text = delta?.get("text").and_then(Value::as_str)?;
        if text.is_empty() {
            return None;
        }
        self.text.push_str(text);
        Some(StreamUpdate::Chunk(text.to_string()))
    }
}

fn error_message(event: &StructuredEvent) -> String {
    let nested = event.get("error").and_then(|e| match e {
        Value::String(s) => Some(s.clone()),
        other => other.get("message").and_then(Value::as_str).map(str::to_string),
    });
    nested
        .or_else(|| event.get("message").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| "Unknown error from conversation worker".to_string())
}

struct ActiveCall {
    id: u64,
    cancel: CancellationToken,
}

struct State {
    history: Vec<ConversationMessage>,
    status: ConversationStatus,
    call: Option<ActiveCall>,
    next_call: u64,
}

struct Inner {
    config: ConversationConfig,
    launcher: Arc<dyn WorkerLauncher>,
    tasks: Arc<dyn TaskContextSource>,
    state: Mutex<State>,
    signals: broadcast::Sender<ConversationSignal>,
}

/// Handle to the chat supervisor. Cheap to clone.
#[derive(Clone)]
pub struct ConversationSupervisor {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ConversationSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationSupervisor")
            .field("command", &self.inner.config.command)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl ConversationSupervisor {
    pub fn new(
        config: ConversationConfig,
        launcher: Arc<dyn WorkerLauncher>,
        tasks: Arc<dyn TaskContextSource>,
    ) -> Self {
        let (signals, _) = broadcast::channel(SIGNAL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                config,
                launcher,
                tasks,
                state: Mutex::new(State {
                    history: Vec::new(),
                    status: ConversationStatus::Idle,
                    call: None,
                    next_call: 0,
                }),
                signals,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConversationSignal> {
        self.inner.signals.subscribe()
    }

    pub fn status(&self) -> ConversationStatus {
        self.lock().status
    }

    pub fn history(&self) -> Vec<ConversationMessage> {
        self.lock().history.clone()
    }

    /// Empty the transcript.
    pub fn clear_history(&self) {
        self.lock().history.clear();
        self.emit(ConversationSignal::HistoryCleared);
    }

    /// Abort the in-flight call, if any. The status returns to idle at once;
    /// the pending `send_message` settles when the worker has exited.
    pub fn cancel(&self) -> bool {
        let call = {
            let mut state = self.lock();
            if state.status != ConversationStatus::Processing {
                return false;
            }
            state.status = ConversationStatus::Idle;
            state.call.take()
        };
        if let Some(call) = call {
            tracing::info!(call = call.id, "cancelling conversation call");
            call.cancel.cancel();
        }
        self.emit(ConversationSignal::Status(ConversationStatus::Idle));
        true
    }

    /// Send one user message and wait for the reply text.
    ///
    /// # Errors
    ///
    /// [`ConversationError::Busy`] while another call is processing,
    /// [`ConversationError::Spawn`] if the worker cannot be launched,
    /// [`ConversationError::Exit`] if it fails without producing any text.
    pub async fn send_message(&self, text: impl Into<String>) -> Result<String, ConversationError> {
        let text = text.into();
        let (call_id, cancel, prompt, user_message) = {
            let mut state = self.lock();
            if state.status == ConversationStatus::Processing {
                return Err(ConversationError::Busy);
            }
            let prompt = build_prompt(&state.history, &text, self.inner.config.history_window);
            let user_message = ConversationMessage::new(Role::User, text);
            state.history.push(user_message.clone());
            state.status = ConversationStatus::Processing;
            state.next_call += 1;
            let id = state.next_call;
            let cancel = CancellationToken::new();
            state.call = Some(ActiveCall {
                id,
                cancel: cancel.clone(),
            });
            (id, cancel, prompt, user_message)
        };
        self.emit(ConversationSignal::Message(user_message));
        self.emit(ConversationSignal::Status(ConversationStatus::Processing));

        // A call cancelled while its preamble is still being built never launches.
        let preamble = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!(call = call_id, "conversation call cancelled before launch");
                return Ok(String::new());
            }
            preamble = self.build_preamble() => preamble,
        };
        let invocation = build_invocation(&self.inner.config, &preamble, &prompt);

        let io = match self.inner.launcher.launch(&invocation) {
            Ok(io) => io,
            Err(source) => {
                tracing::error!(command = %self.inner.config.command, error = %source, "failed to spawn conversation worker");
                let err = ConversationError::Spawn {
                    command: self.inner.config.command.clone(),
                    source,
                };
                self.fail(call_id, err.to_string());
                return Err(err);
            }
        };
        tracing::debug!(call = call_id, pid = io.pid, "conversation worker spawned");

        // The prompt travels as an argument; closing stdin keeps the worker
        // from waiting for more input.
        drop(io.stdin);
        if let Some(stderr) = io.stderr {
            tokio::spawn(log_stderr(stderr));
        }
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (exit_tx, mut exit_rx) = oneshot::channel();
        tokio::spawn(drive_control(io.control, signal_rx, exit_tx));

        let mut stdout = io.stdout;
        let mut parser = LineParser::new();
        let mut reply = ReplyStream::default();
        let mut buf = vec![0u8; READ_CHUNK_SIZE];
        let mut stdout_open = true;
        let mut terminated = false;

        let exit = loop {
            tokio::select! {
                _ = cancel.cancelled(), if !terminated => {
                    terminated = true;
                    let _ = signal_tx.send(ProcessSignal::Terminate);
                    let escalate = signal_tx.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(CANCEL_KILL_GRACE).await;
                        let _ = escalate.send(ProcessSignal::Kill);
                    });
                }
                read = stdout.read(&mut buf), if stdout_open => match read {
                    Ok(0) => stdout_open = false,
                    Ok(n) => {
                        for line in parser.push(&buf[..n]) {
                            self.handle_line(line, &mut reply);
                        }
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "conversation stdout read failed");
                        stdout_open = false;
                    }
                },
                exit = &mut exit_rx => {
                    break exit.unwrap_or_else(|_| Err(io::Error::other("conversation worker control task ended")));
                }
            }
        };

        if stdout_open {
            let drain = async {
                loop {
                    match stdout.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            for line in parser.push(&buf[..n]) {
                                self.handle_line(line, &mut reply);
                            }
                        }
                    }
                }
            };
            let _ = tokio::time::timeout(STDOUT_DRAIN_GRACE, drain).await;
        }

        self.finish(call_id, &cancel, exit, reply.text)
    }

    fn finish(
        &self,
        call_id: u64,
        cancel: &CancellationToken,
        exit: io::Result<ExitInfo>,
        text: String,
    ) -> Result<String, ConversationError> {
        if cancel.is_cancelled() {
            tracing::debug!(call = call_id, "cancelled conversation call settled");
            return Ok(text);
        }

        let info = match exit {
            Ok(info) => info,
            Err(e) => {
                self.fail(call_id, format!("Failed to wait on conversation worker: {e}"));
                return Err(ConversationError::Io(e));
            }
        };

        if !info.success() && text.is_empty() {
            let err = ConversationError::Exit { code: info.code };
            tracing::warn!(call = call_id, code = info.code, signal = info.signal, "conversation worker failed");
            self.fail(call_id, err.to_string());
            return Err(err);
        }

        let message = ConversationMessage::new(Role::Assistant, text.clone());
        let current = {
            let mut state = self.lock();
            state.history.push(message.clone());
            let current = state.call.as_ref().is_some_and(|c| c.id == call_id);
            if current {
                state.call = None;
                state.status = ConversationStatus::Idle;
            }
            current
        };
        self.emit(ConversationSignal::Message(message));
        if current {
            self.emit(ConversationSignal::Status(ConversationStatus::Idle));
        }
        Ok(text)
    }

    /// Report a failed call: error signal, then status error if still current.
    fn fail(&self, call_id: u64, message: String) {
        self.emit(ConversationSignal::Error(message));
        let current = {
            let mut state = self.lock();
            let current = state.call.as_ref().is_some_and(|c| c.id == call_id);
            if current {
                state.call = None;
                state.status = ConversationStatus::Error;
            }
            current
        };
        if current {
            self.emit(ConversationSignal::Status(ConversationStatus::Error));
        }
    }

    fn handle_line(&self, line: ParsedLine, reply: &mut ReplyStream) {
        match line {
            ParsedLine::Event(event) => {
                let update = reply.apply(&event);
                self.emit(ConversationSignal::Event(event));
                match update {
                    Some(StreamUpdate::Chunk(chunk)) => self.emit(ConversationSignal::Chunk(chunk)),
                    Some(StreamUpdate::Error(message)) => {
                        tracing::warn!(%message, "conversation worker reported an error");
                        self.emit(ConversationSignal::Error(message));
                    }
                    None => {}
                }
            }
            ParsedLine::Raw(text) => tracing::debug!(line = %text, "ignoring raw conversation output"),
        }
    }

    async fn build_preamble(&self) -> String {
        let mut preamble = match self.inner.config.instructions_file {
            Some(ref path) => match tokio::fs::read_to_string(path).await {
                Ok(text) => text,
                Err(e) => {
                    tracing::debug!(path = %path.display(), error = %e, "using default instructions");
                    DEFAULT_INSTRUCTIONS.to_string()
                }
            },
            None => DEFAULT_INSTRUCTIONS.to_string(),
        };

        match self.inner.tasks.fetch(self.inner.config.task_limit).await {
            Ok(tasks) => {
                if let Some(summary) = render_task_summary(&tasks) {
                    preamble.push_str("\n\n");
                    preamble.push_str(&summary);
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to fetch task context; continuing without it"),
        }
        preamble
    }

    fn emit(&self, signal: ConversationSignal) {
        let _ = self.inner.signals.send(signal);
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // State stays consistent across a panic in another holder.
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

async fn drive_control(
    mut control: Box<dyn WorkerControl>,
    mut signals: mpsc::UnboundedReceiver<ProcessSignal>,
    exit: oneshot::Sender<io::Result<ExitInfo>>,
) {
    let result = loop {
        tokio::select! {
            result = control.wait() => break result,
            Some(signal) = signals.recv() => {
                if let Err(e) = control.signal(signal) {
                    tracing::debug!(?signal, error = %e, "failed to signal conversation worker");
                }
            }
        }
    };
    let _ = exit.send(result);
}

async fn log_stderr(mut stderr: BoxedReader) {
    let mut buf = vec![0u8; READ_CHUNK_SIZE];
    while let Ok(n) = stderr.read(&mut buf).await {
        if n == 0 {
            break;
        }
        let text = String::from_utf8_lossy(&buf[..n]);
        let text = text.trim();
        if !text.is_empty() {
            tracing::debug!(stderr = %text, "conversation worker stderr");
        }
    }
}
