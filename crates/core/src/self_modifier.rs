// crates/core/src/self_modifier.rs

//! Diagnose a parent, turn the diagnosis into a coding task and let the
//! parent implement it on a copy of its own codebase.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::config::SelfModificationConfig;
use crate::error::{SandboxError, SelfModificationError};
use crate::fm::{FmGateway, Message};
use crate::prompts;
use crate::retry::{retry_transient, RetryPolicy};
use crate::sandbox::{SandboxExecutor, TaskCheck, TaskOutcome, TaskSpec};
use crate::types::AgentRecord;
use crate::workspace::{diff_dirs, CandidateCodebase, Workspace};

static JSON_FENCE: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").ok());

/// Structured diagnosis of a parent's weaknesses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosisReport {
    pub log_summarization: String,
    #[serde(deserialize_with = "text_or_list")]
    pub potential_improvements: String,
    pub improvement_proposal: String,
    pub implementation_suggestion: String,
    pub problem_description: String,
}

/// Models sometimes answer a free-text field with a list.
fn text_or_list<'de, D: Deserializer<'de>>(de: D) -> Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum TextOrList {
        Text(String),
        List(Vec<String>),
    }
    Ok(match TextOrList::deserialize(de)? {
        TextOrList::Text(s) => s,
        TextOrList::List(items) => items
            .iter()
            .map(|i| format!("- {i}"))
            .collect::<Vec<_>>()
            .join("\n"),
    })
}

/// The feature the parent is asked to add to itself.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Proposal {
    pub feature_description: String,
    pub target_problem_statement: String,
}

impl From<&DiagnosisReport> for Proposal {
    fn from(report: &DiagnosisReport) -> Self {
        Self {
            feature_description: report.improvement_proposal.clone(),
            target_problem_statement: format!(
                "{}\n\n{}",
                report.implementation_suggestion.trim(),
                report.problem_description.trim()
            ),
        }
    }
}

/// Parse a diagnosis from raw JSON, a fenced block, or the outermost object
/// in the text. Every field must be present and non-empty.
pub fn parse_diagnosis(text: &str) -> Result<DiagnosisReport, SelfModificationError> {
    let trimmed = text.trim();
    let candidate = if trimmed.starts_with('{') {
        trimmed
    } else if let Some(caps) = JSON_FENCE.as_ref().and_then(|re| re.captures(trimmed)) {
        caps.get(1).map(|m| m.as_str()).unwrap_or(trimmed)
    } else {
        match (trimmed.find('{'), trimmed.rfind('}')) {
            (Some(start), Some(end)) if start < end => &trimmed[start..=end],
            _ => return Err(SelfModificationError::DiagnosisParse("no JSON object in response".to_string())),
        }
    };

    let report: DiagnosisReport =
        serde_json::from_str(candidate).map_err(|e| SelfModificationError::DiagnosisParse(e.to_string()))?;

    let required = [
        ("improvement_proposal", &report.improvement_proposal),
        ("implementation_suggestion", &report.implementation_suggestion),
        ("problem_description", &report.problem_description),
    ];
    if let Some((name, _)) = required.iter().find(|(_, v)| v.trim().is_empty()) {
        return Err(SelfModificationError::DiagnosisParse(format!("field {name} is empty")));
    }
    Ok(report)
}

pub struct SelfModifier {
    fm: Arc<dyn FmGateway>,
    sandbox: Arc<dyn SandboxExecutor>,
    config: SelfModificationConfig,
    retry: RetryPolicy,
}

impl SelfModifier {
    pub fn new(
        fm: Arc<dyn FmGateway>,
        sandbox: Arc<dyn SandboxExecutor>,
        config: SelfModificationConfig,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            fm,
            sandbox,
            config,
            retry,
        }
    }

    fn workspace_err(&self, source: std::io::Error) -> SelfModificationError {
        SelfModificationError::Workspace {
            path: self.config.workspace_root.clone(),
            source,
        }
    }

    /// Diagnose, propose, implement. The result is unvalidated.
    pub async fn propose_and_implement(
        &self,
        parent: &AgentRecord,
        snapshot: &Path,
        evaluation_logs: &[TaskOutcome],
    ) -> Result<CandidateCodebase, SelfModificationError> {
        let report = self.diagnose(parent, snapshot, evaluation_logs).await?;
        let proposal = Proposal::from(&report);
        info!(parent = %parent.id, feature = %proposal.feature_description, "proposal ready");
        self.implement(parent, snapshot, &proposal).await
    }

    /// Ask the FM for a structured diagnosis, re-asking on malformed replies.
    pub async fn diagnose(
        &self,
        parent: &AgentRecord,
        snapshot: &Path,
        evaluation_logs: &[TaskOutcome],
    ) -> Result<DiagnosisReport, SelfModificationError> {
        let codebase = prompts::render_codebase(snapshot, self.config.codebase_char_budget)
            .map_err(|e| self.workspace_err(e))?;
        let log = prompts::render_evaluation_log(evaluation_logs, self.config.log_char_budget);
        let schema = prompts::diagnosis_schema();

        let mut conversation = vec![
            Message::system(prompts::diagnosis_system_prompt()),
            Message::user(prompts::build_diagnosis_prompt(&codebase, &log)),
        ];

        let attempts = self.config.diagnosis_attempts.max(1);
        let mut last_err = SelfModificationError::DiagnosisParse("no diagnosis attempted".to_string());
        for attempt in 1..=attempts {
            let messages = &conversation;
            let completion = retry_transient(&self.retry, "diagnosis", || {
                self.fm.complete(messages, Some(&schema))
            })
            .await?;

            match parse_diagnosis(&completion.content) {
                Ok(report) => {
                    info!(
                        parent = %parent.id,
                        attempt,
                        input_tokens = completion.token_usage.input_tokens,
                        output_tokens = completion.token_usage.output_tokens,
                        "diagnosis parsed"
                    );
                    return Ok(report);
                }
                Err(e) => {
                    warn!(parent = %parent.id, attempt, error = %e, "malformed diagnosis");
                    conversation.push(Message::assistant(completion.content));
                    conversation.push(Message::user(format!(
                        "That reply could not be used ({e}). Reply with only the JSON object containing every required field."
                    )));
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    /// Let the parent implement `proposal` on fresh copies of its snapshot
    /// until one attempt exits cleanly with a non-empty diff.
    pub async fn implement(
        &self,
        parent: &AgentRecord,
        snapshot: &Path,
        proposal: &Proposal,
    ) -> Result<CandidateCodebase, SelfModificationError> {
        let timeout = Duration::from_millis(self.config.implementation_timeout_ms);
        let attempts = self.config.implementation_attempts.max(1);
        let mut reason = String::from("no implementation attempted");

        for attempt in 1..=attempts {
            let workspace = Workspace::copy_of(
                &self.config.workspace_root,
                &format!("{}_child{}", parent.id, attempt),
                snapshot,
            )
            .map_err(|e| self.workspace_err(e))?;

            let task = TaskSpec {
                id: format!("self_modify/{}/{attempt}", parent.id),
                problem_statement: prompts::build_implementation_task(proposal),
                function: None,
                input: json!({ "feature": proposal.feature_description }),
                check: TaskCheck::ExitSuccess,
            };

            let ws_path: PathBuf = workspace.path().to_path_buf();
            let run = retry_transient(&self.retry, "self-modification", || {
                self.sandbox.run_task(&ws_path, &task, timeout)
            })
            .await;

            match run {
                Err(SandboxError::LoadFailed(msg)) => {
                    return Err(SelfModificationError::ParentLoadFailed {
                        parent: parent.id,
                        reason: msg,
                    });
                }
                Err(SandboxError::Unavailable(msg)) => {
                    reason = format!("sandbox unavailable: {msg}");
                }
                Ok(outcome) if outcome.timed_out => {
                    reason = "implementation timed out".to_string();
                }
                Ok(outcome) if !outcome.passed => {
                    reason = format!("implementation run failed: {}", outcome.output.chars().take(500).collect::<String>());
                }
                Ok(_) => {
                    let diff = diff_dirs(snapshot, workspace.path()).map_err(|e| self.workspace_err(e))?;
                    if diff.is_empty() {
                        reason = "implementation left the codebase unchanged".to_string();
                    } else {
                        info!(
                            parent = %parent.id,
                            attempt,
                            added = diff.added.len(),
                            modified = diff.modified.len(),
                            removed = diff.removed.len(),
                            "candidate codebase produced"
                        );
                        return Ok(CandidateCodebase::new(
                            workspace,
                            parent.id,
                            proposal.feature_description.clone(),
                            diff,
                        ));
                    }
                }
            }
            warn!(parent = %parent.id, attempt, reason = %reason, "implementation attempt discarded");
        }

        Err(SelfModificationError::SelfModificationFailed {
            parent: parent.id,
            reason,
        })
    }
}
