//! Bridge between the supervisors and the observer hub.
//!
//! Supervisor signals fan out to every observer as [`HubMessage`]s; observer
//! commands are mapped onto supervisor operations. A failed command is
//! reported to all observers as an `error` message naming the command.

use std::sync::Arc;
use std::time::Duration;

use loopwatch_core::{
    BroadcastHub, ConversationError, ConversationSupervisor, HubMessage, ObserverCommand,
    StartOptions, SupervisorError, WorkerSupervisor,
};
use serde_json::{Value, json};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Error)]
enum CommandError {
    #[error("Unknown command")]
    Unknown,

    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error(transparent)]
    Worker(#[from] SupervisorError),

    #[error(transparent)]
    Chat(#[from] ConversationError),
}

impl CommandError {
    /// Whether the supervisor has already published this failure.
    fn already_reported(&self) -> bool {
        matches!(
            self,
            CommandError::Worker(SupervisorError::Spawn { .. })
                | CommandError::Chat(ConversationError::Spawn { .. } | ConversationError::Exit { .. })
        )
    }
}

/// Connects one worker supervisor and one conversation supervisor to a hub.
#[derive(Debug, Clone)]
pub struct Bridge {
    worker: WorkerSupervisor,
    chat: ConversationSupervisor,
    hub: Arc<BroadcastHub>,
}

impl Bridge {
    pub fn new(worker: WorkerSupervisor, chat: ConversationSupervisor, hub: Arc<BroadcastHub>) -> Self {
        Self { worker, chat, hub }
    }

    /// Start forwarding signals and handling `commands` until `cancel` fires.
    ///
    /// Subscriptions are taken before this returns, so nothing the
    /// supervisors publish afterwards is missed. Signals already queued when
    /// `cancel` fires are still forwarded.
    pub fn spawn(
        self,
        mut commands: mpsc::Receiver<ObserverCommand>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let worker_forwarder = tokio::spawn(forward(
            self.worker.subscribe(),
            Arc::clone(&self.hub),
            cancel.clone(),
            "worker",
        ));
        let chat_forwarder = tokio::spawn(forward(
            self.chat.subscribe(),
            Arc::clone(&self.hub),
            cancel.clone(),
            "chat",
        ));

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    command = commands.recv() => match command {
                        Some(command) => self.dispatch(command).await,
                        None => break,
                    },
                }
            }
            for forwarder in [worker_forwarder, chat_forwarder] {
                if let Err(e) = forwarder.await {
                    warn!(error = %e, "signal forwarder failed");
                }
            }
        })
    }

    /// Apply one observer command.
    pub async fn dispatch(&self, command: ObserverCommand) {
        let kind = command.kind().to_string();
        debug!(connection = %command.connection, command = %kind, "observer command");

        let result = match kind.as_str() {
            "start" => self.start(&command).await,
            "stop" => {
                let timeout = command
                    .get("timeout_ms")
                    .and_then(Value::as_u64)
                    .map(Duration::from_millis);
                self.worker.stop(timeout).await.map_err(Into::into)
            }
            "pause" => self.worker.pause().await.map_err(Into::into),
            "resume" => self.worker.resume().await.map_err(Into::into),
            "stop_after_current" => self.worker.stop_after_current().await.map_err(Into::into),
            "cancel_stop_after_current" => self
                .worker
                .cancel_stop_after_current()
                .await
                .map_err(Into::into),
            "send" => match command.get("message") {
                Some(message) => self.worker.send(message.clone()).await.map_err(Into::into),
                None => Err(CommandError::InvalidArguments(
                    "missing field 'message'".to_string(),
                )),
            },
            "chat" => match command.get("text").and_then(Value::as_str) {
                Some(text) if !text.trim().is_empty() => {
                    self.spawn_chat(text.to_string());
                    Ok(())
                }
                _ => Err(CommandError::InvalidArguments(
                    "'text' must be a non-empty string".to_string(),
                )),
            },
            "chat_cancel" => {
                if !self.chat.cancel() {
                    debug!("no chat message in flight");
                }
                Ok(())
            }
            "chat_clear" => {
                self.chat.clear_history();
                Ok(())
            }
            _ => Err(CommandError::Unknown),
        };

        if let Err(e) = result {
            report(&self.hub, &kind, &e);
        }
    }

    async fn start(&self, command: &ObserverCommand) -> Result<(), CommandError> {
        let options: StartOptions = serde_json::from_value(Value::Object(command.message.clone()))
            .map_err(|e| CommandError::InvalidArguments(e.to_string()))?;
        self.worker.start(options).await?;
        Ok(())
    }

    /// Run a chat message in the background; replies stream as chat signals.
    fn spawn_chat(&self, text: String) {
        let chat = self.chat.clone();
        let hub = Arc::clone(&self.hub);
        tokio::spawn(async move {
            match chat.send_message(text).await {
                Ok(reply) => debug!(chars = reply.len(), "chat reply complete"),
                Err(e) => report(&hub, "chat", &CommandError::Chat(e)),
            }
        });
    }
}

fn report(hub: &BroadcastHub, command: &str, error: &CommandError) {
    if error.already_reported() {
        debug!(command, error = %error, "observer command failed");
        return;
    }
    warn!(command, error = %error, "observer command failed");
    hub.broadcast(&HubMessage::new(
        "error",
        json!({ "command": command, "message": error.to_string() }),
    ));
}

async fn forward<T>(
    mut signals: broadcast::Receiver<T>,
    hub: Arc<BroadcastHub>,
    cancel: CancellationToken,
    source: &'static str,
) where
    T: Clone + Send + 'static,
    for<'a> HubMessage: From<&'a T>,
{
    loop {
        tokio::select! {
            biased;
            signal = signals.recv() => match signal {
                Ok(signal) => {
                    hub.broadcast(&HubMessage::from(&signal));
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(source, skipped, "signal forwarder lagged; observers missed signals");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = cancel.cancelled() => break,
        }
    }
}
