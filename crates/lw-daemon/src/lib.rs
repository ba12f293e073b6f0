//! loopwatch daemon
//!
//! Wires a [`loopwatch_core::WorkerSupervisor`] and a
//! [`loopwatch_core::ConversationSupervisor`] to a
//! [`loopwatch_core::BroadcastHub`] so every WebSocket observer sees the same
//! live stream and can drive both supervisors.

pub mod bridge;
pub mod commands;

pub use commands::Cli;
