//! Configuration types

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Complete configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LwConfig {
    /// Long-running worker supervision
    #[serde(default)]
    pub worker: WorkerConfig,
    /// Per-message chat worker
    #[serde(default)]
    pub conversation: ConversationConfig,
    /// Observer broadcast hub
    #[serde(default)]
    pub hub: HubConfig,
    /// Issue-tracker task context
    #[serde(default)]
    pub tasks: TasksConfig,
}

/// Worker configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Executable to launch
    #[serde(default = "default_worker_command")]
    pub command: String,
    /// Fixed arguments placed before `--watch` and the iteration count
    #[serde(default = "default_worker_args")]
    pub args: Vec<String>,
    /// Grace period before a stop escalates to a kill
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,
    /// Capacity of the signal broadcast channel
    #[serde(default = "default_signal_capacity")]
    pub signal_capacity: usize,
    /// Working directory for the worker; the daemon's own when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
}

impl WorkerConfig {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            command: default_worker_command(),
            args: default_worker_args(),
            stop_timeout_ms: default_stop_timeout_ms(),
            signal_capacity: default_signal_capacity(),
            cwd: None,
        }
    }
}

/// Conversation configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationConfig {
    /// Executable invoked once per chat message
    #[serde(default = "default_chat_command")]
    pub command: String,
    /// Model name passed as `--model`
    #[serde(default = "default_chat_model")]
    pub model: String,
    /// Base instruction document; the built-in text is used when unset or unreadable
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions_file: Option<PathBuf>,
    /// Number of prior messages replayed into the prompt
    #[serde(default = "default_history_window")]
    pub history_window: usize,
    /// Maximum tasks rendered into the system preamble
    #[serde(default = "default_task_limit")]
    pub task_limit: usize,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            command: default_chat_command(),
            model: default_chat_model(),
            instructions_file: None,
            history_window: default_history_window(),
            task_limit: default_task_limit(),
        }
    }
}

/// Hub configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HubConfig {
    /// WebSocket listen address
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Interval between liveness probes
    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,
}

impl HubConfig {
    /// The probe period; a zero setting falls back to the default.
    pub fn probe_interval(&self) -> Duration {
        match self.probe_interval_ms {
            0 => Duration::from_millis(default_probe_interval_ms()),
            ms => Duration::from_millis(ms),
        }
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            probe_interval_ms: default_probe_interval_ms(),
        }
    }
}

/// Task-context collaborator configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TasksConfig {
    /// Issue-tracker executable
    #[serde(default = "default_tasks_command")]
    pub command: String,
    /// Arguments; `--limit <N>` is appended at call time
    #[serde(default = "default_tasks_args")]
    pub args: Vec<String>,
    /// Fetch task context for chat preambles
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            command: default_tasks_command(),
            args: default_tasks_args(),
            enabled: true,
        }
    }
}

fn default_worker_command() -> String {
    "ralph".to_string()
}

fn default_worker_args() -> Vec<String> {
    vec!["run".to_string(), "--json-events".to_string()]
}

fn default_stop_timeout_ms() -> u64 {
    5000
}

fn default_signal_capacity() -> usize {
    1024
}

fn default_chat_command() -> String {
    "claude".to_string()
}

fn default_chat_model() -> String {
    "sonnet".to_string()
}

fn default_history_window() -> usize {
    9
}

fn default_task_limit() -> usize {
    10
}

fn default_bind() -> String {
    "127.0.0.1:7878".to_string()
}

pub(crate) fn default_probe_interval_ms() -> u64 {
    30_000
}

fn default_tasks_command() -> String {
    "bd".to_string()
}

fn default_tasks_args() -> Vec<String> {
    vec!["ready".to_string(), "--json".to_string()]
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_yields_defaults() {
        let config: LwConfig = toml::from_str("").unwrap();
        assert_eq!(config, LwConfig::default());
        assert_eq!(config.worker.stop_timeout(), Duration::from_secs(5));
        assert_eq!(config.hub.probe_interval(), Duration::from_secs(30));
        assert_eq!(config.conversation.history_window, 9);
    }

    #[test]
    fn partial_section_keeps_other_defaults() {
        let config: LwConfig = toml::from_str(
            r#"
[worker]
command = "./loop.sh"

[tasks]
enabled = false
"#,
        )
        .unwrap();
        assert_eq!(config.worker.command, "./loop.sh");
        assert_eq!(config.worker.args, vec!["run", "--json-events"]);
        assert_eq!(config.worker.cwd, None);
        assert!(!config.tasks.enabled);
        assert_eq!(config.tasks.command, "bd");
    }

    #[test]
    fn zero_probe_interval_uses_default_period() {
        let config: LwConfig = toml::from_str("[hub]\nprobe_interval_ms = 0").unwrap();
        assert_eq!(config.hub.probe_interval(), Duration::from_secs(30));
    }

    #[test]
    fn config_roundtrips_through_toml() {
        let mut config = LwConfig::default();
        config.conversation.instructions_file = Some(PathBuf::from("/tmp/agents.md"));
        let text = toml::to_string(&config).unwrap();
        let back: LwConfig = toml::from_str(&text).unwrap();
        assert_eq!(back, config);
    }
}
