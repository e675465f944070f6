// crates/core/src/sandbox.rs

//! The "run agent code safely" collaborator.
//!
//! Solving a benchmark task, rewriting a canary file and implementing a
//! self-modification all go through the same [`SandboxExecutor::run_task`]
//! call; only the task content differs.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SandboxError;

/// Name of the file the canary edit task asks the agent to rewrite.
pub const CANARY_FILE: &str = "dgm_canary.txt";

/// How a task's result is judged. Never shown to the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskCheck {
    /// Benchmark task: stdout must match the hidden expected value.
    ExpectedOutput(Value),
    /// Edit task: after the run, `path` (relative to the codebase) must hold `contents`.
    FileContents { path: String, contents: String },
    /// Self-modification: a clean exit is enough; the diff is judged elsewhere.
    ExitSuccess,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub id: String,
    pub problem_statement: String,
    /// Function or task identifier from the benchmark definition.
    #[serde(default)]
    pub function: Option<String>,
    #[serde(default)]
    pub input: Value,
    pub check: TaskCheck,
}

impl TaskSpec {
    /// Whether the agent needs write access to its codebase for this task.
    pub fn edits_codebase(&self) -> bool {
        !matches!(self.check, TaskCheck::ExpectedOutput(_))
    }

    /// What the agent sees on stdin: everything except the check.
    pub fn payload(&self) -> AgentPayload<'_> {
        AgentPayload {
            task_id: &self.id,
            problem_statement: &self.problem_statement,
            function: self.function.as_deref(),
            input: &self.input,
            workspace: self.edits_codebase().then_some(WORKSPACE_GUEST_PATH),
        }
    }
}

/// Guest path the codebase is mounted at for editing tasks.
pub const WORKSPACE_GUEST_PATH: &str = "/workspace";

#[derive(Debug, Serialize)]
pub struct AgentPayload<'a> {
    pub task_id: &'a str,
    pub problem_statement: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function: Option<&'a str>,
    pub input: &'a Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace: Option<&'a str>,
}

/// Result of one task run. A failed or timed-out task is data, not an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub task_id: String,
    pub passed: bool,
    /// Captured stdout (or a failure description when the agent crashed).
    pub output: String,
    #[serde(default)]
    pub timed_out: bool,
    #[serde(default)]
    pub duration_ms: u64,
}

impl TaskOutcome {
    pub fn timed_out(task_id: &str, duration_ms: u64) -> Self {
        Self {
            task_id: task_id.to_string(),
            passed: false,
            output: "task timed out".to_string(),
            timed_out: true,
            duration_ms,
        }
    }
}

#[async_trait]
pub trait SandboxExecutor: Send + Sync {
    /// Run the agent at `codebase` on `task`, giving up after `timeout`.
    async fn run_task(
        &self,
        codebase: &Path,
        task: &TaskSpec,
        timeout: Duration,
    ) -> Result<TaskOutcome, SandboxError>;
}

/// Compare an agent's stdout to the expected value.
///
/// JSON equality when the output parses as JSON, otherwise trimmed string
/// equality against the expected value's plain-text form.
pub fn outputs_match(actual: &str, expected: &Value) -> bool {
    let trimmed = actual.trim();
    if let Ok(parsed) = serde_json::from_str::<Value>(trimmed) {
        if &parsed == expected {
            return true;
        }
    }
    match expected {
        Value::String(s) => s.trim() == trimmed,
        other => other.to_string() == trimmed,
    }
}

/// Judge a finished run's stdout against the task's check. File checks are
/// resolved by the executor, which owns the codebase path.
pub fn judge(task: &TaskSpec, stdout: &str, codebase: &Path) -> bool {
    match &task.check {
        TaskCheck::ExpectedOutput(expected) => outputs_match(stdout, expected),
        TaskCheck::FileContents { path, contents } => std::fs::read_to_string(codebase.join(path))
            .map(|actual| actual.trim() == contents.trim())
            .unwrap_or(false),
        TaskCheck::ExitSuccess => true,
    }
}
