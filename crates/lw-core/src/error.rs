//! Error types for worker and conversation supervision.

use std::io;
use thiserror::Error;

use crate::supervisor::WorkerStatus;

/// Errors returned by [`crate::WorkerSupervisor`] operations.
#[derive(Error, Debug)]
pub enum SupervisorError {
    /// The worker process could not be spawned
    #[error("Failed to spawn worker '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    /// A worker process is already owned by this supervisor
    #[error("Worker is already running")]
    AlreadyRunning,

    /// No worker process is owned (or its input is not writable)
    #[error("Worker is not running")]
    NotRunning,

    /// The operation is not valid in the current status
    #[error("Cannot {operation} while worker is {status}")]
    InvalidState {
        operation: &'static str,
        status: WorkerStatus,
    },

    /// Writing to the worker's stdin failed
    #[error("I/O error talking to worker: {0}")]
    Io(#[from] io::Error),

    /// A message could not be JSON-encoded
    #[error("Failed to encode message: {0}")]
    Serialize(#[from] serde_json::Error),

    /// The supervisor actor has shut down
    #[error("Supervisor has shut down")]
    Closed,
}

/// Errors returned by [`crate::ConversationSupervisor::send_message`].
#[derive(Error, Debug)]
pub enum ConversationError {
    /// A previous message is still being processed
    #[error("A message is already being processed")]
    Busy,

    /// The per-message worker could not be spawned
    #[error("Failed to spawn conversation worker '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    /// The worker exited unsuccessfully without producing any reply text
    #[error("Conversation worker exited with {}", describe_code(.code))]
    Exit { code: Option<i32> },

    /// Waiting on the worker failed
    #[error("I/O error talking to conversation worker: {0}")]
    Io(#[from] io::Error),
}

fn describe_code(code: &Option<i32>) -> String {
    match code {
        Some(c) => format!("code {c}"),
        None => "no exit code (terminated by signal)".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_state_message_names_status() {
        let err = SupervisorError::InvalidState {
            operation: "resume",
            status: WorkerStatus::Running,
        };
        assert_eq!(err.to_string(), "Cannot resume while worker is running");
    }

    #[test]
    fn exit_error_message() {
        assert_eq!(
            ConversationError::Exit { code: Some(1) }.to_string(),
            "Conversation worker exited with code 1"
        );
        assert!(
            ConversationError::Exit { code: None }
                .to_string()
                .contains("signal")
        );
    }
}
