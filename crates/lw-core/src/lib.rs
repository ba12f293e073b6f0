//! Core library for loopwatch.
//!
//! loopwatch supervises external worker processes that speak a
//! newline-delimited output protocol (one JSON object or one line of plain
//! text per line), mediates pause/resume/cancel, and relays everything they
//! emit to any number of connected observers in real time.
//!
//! ```text
//!  worker stdout ──► LineParser ──► WorkerSupervisor ──► BroadcastHub ──► observers
//!                    (protocol)     (buffer while         (websocket,
//!                                    paused)               liveness probes)
//! ```
//!
//! [`ConversationSupervisor`] runs one short-lived worker invocation per chat
//! message and reconstructs the streamed reply.

pub mod buffer;
pub mod config;
pub mod conversation;
pub mod error;
pub mod home;
pub mod hub;
pub mod launcher;
pub mod logging;
pub mod protocol;
pub mod supervisor;
pub mod task_context;

pub use conversation::{
    ConversationMessage, ConversationSignal, ConversationStatus, ConversationSupervisor, Role,
};
pub use error::{ConversationError, SupervisorError};
pub use hub::{BroadcastHub, HubMessage, ObserverCommand};
pub use protocol::{LineParser, ParsedLine, StructuredEvent};
pub use supervisor::{StartOptions, WorkerSignal, WorkerStatus, WorkerSupervisor};

// Re-export toml for config consumers
pub use toml;

/// Current wall-clock time in epoch milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
