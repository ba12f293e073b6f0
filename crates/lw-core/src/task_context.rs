//! Task context for chat preambles.
//!
//! The issue tracker is an external collaborator: loopwatch only runs its CLI
//! as a request/response subprocess (`bd ready --json --limit N` by default)
//! and renders the returned tasks into a short summary for the system prompt.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::config::TasksConfig;

/// One ready task as reported by the tracker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSummary {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub priority: Option<i64>,
    #[serde(default)]
    pub status: String,
}

/// Source of task summaries.
#[async_trait]
pub trait TaskContextSource: Send + Sync + std::fmt::Debug {
    /// Fetch at most `limit` ready tasks.
    async fn fetch(&self, limit: usize) -> Result<Vec<TaskSummary>>;
}

/// Runs the configured issue-tracker command.
#[derive(Debug, Clone)]
pub struct CommandTaskSource {
    command: String,
    args: Vec<String>,
}

impl CommandTaskSource {
    pub fn new(config: &TasksConfig) -> Self {
        Self {
            command: config.command.clone(),
            args: config.args.clone(),
        }
    }
}

#[async_trait]
impl TaskContextSource for CommandTaskSource {
    async fn fetch(&self, limit: usize) -> Result<Vec<TaskSummary>> {
        let output = Command::new(&self.command)
            .args(&self.args)
            .arg("--limit")
            .arg(limit.to_string())
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("Failed to execute {}", self.command))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("{} exited with {}: {}", self.command, output.status, stderr.trim());
        }

        let stdout = String::from_utf8(output.stdout)
            .with_context(|| format!("Invalid UTF-8 in {} output", self.command))?;
        let mut tasks = parse_tasks(&stdout)?;
        tasks.truncate(limit);
        Ok(tasks)
    }
}

/// No task context at all.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoTaskContext;

#[async_trait]
impl TaskContextSource for NoTaskContext {
    async fn fetch(&self, _limit: usize) -> Result<Vec<TaskSummary>> {
        Ok(Vec::new())
    }
}

/// Parse the tracker's JSON array. Blank output means no tasks.
pub fn parse_tasks(json: &str) -> Result<Vec<TaskSummary>> {
    let trimmed = json.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(trimmed).context("Failed to parse task list JSON")
}

/// Render the preamble section; `None` when there is nothing to say.
pub fn render_task_summary(tasks: &[TaskSummary]) -> Option<String> {
    if tasks.is_empty() {
        return None;
    }
    let mut out = String::from("## Ready tasks\n\n");
    for task in tasks {
        out.push_str("- ");
        if let Some(p) = task.priority {
            out.push_str(&format!("[P{p}] "));
        }
        out.push_str(&format!("{}: {}", task.id, task.title));
        if !task.status.is_empty() {
            out.push_str(&format!(" ({})", task.status));
        }
        out.push('\n');
    }
    Some(out)
}
