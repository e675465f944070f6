// crates/core/src/evaluator.rs

//! Staged, cost-aware benchmark evaluation.
//!
//! 1. Validity probe: the candidate must load (first task) and still be able
//!    to edit code (canary task on a scratch copy).
//! 2. Stage 1: score on the validity subset.
//! 3. Promotion: above the threshold and within the archive's top M, the
//!    candidate is scored on the larger subset. Stage-1 outcomes are reused
//!    for the overlapping prefix.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::benchmark::{score, BenchmarkSuite, BenchmarkTask};
use crate::config::EvaluationConfig;
use crate::error::{EvaluationError, SandboxError};
use crate::sandbox::{SandboxExecutor, TaskCheck, TaskOutcome, TaskSpec, CANARY_FILE};
use crate::types::AgentRecord;
use crate::workspace::Workspace;

/// Result of evaluating one codebase.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Evaluation {
    pub is_valid: bool,
    /// `None` for invalid candidates.
    pub score: Option<f64>,
    pub eval_task_count: usize,
    pub outcomes: Vec<TaskOutcome>,
    pub promoted: bool,
    /// Why the validity probe failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invalid_reason: Option<String>,
}

impl Evaluation {
    fn invalid(reason: String, outcomes: Vec<TaskOutcome>) -> Self {
        Self {
            is_valid: false,
            score: None,
            eval_task_count: 0,
            outcomes,
            promoted: false,
            invalid_reason: Some(reason),
        }
    }
}

pub struct StagedEvaluator {
    sandbox: Arc<dyn SandboxExecutor>,
    suite: Arc<BenchmarkSuite>,
    config: EvaluationConfig,
    scratch_root: PathBuf,
}

impl StagedEvaluator {
    /// `scratch_root` holds the throwaway copies used by the canary task.
    pub fn new(
        sandbox: Arc<dyn SandboxExecutor>,
        suite: Arc<BenchmarkSuite>,
        config: EvaluationConfig,
        scratch_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            sandbox,
            suite,
            config,
            scratch_root: scratch_root.into(),
        }
    }

    pub fn suite(&self) -> &BenchmarkSuite {
        &self.suite
    }

    /// How many archived agents a candidate must rank among to be promoted.
    pub fn promotion_top_m(&self) -> usize {
        self.config.promotion_top_m
    }

    fn stage1_len(&self) -> usize {
        self.config.validity_subset_size.min(self.suite.len())
    }

    fn stage2_len(&self) -> usize {
        self.config.promotion_subset_size.min(self.suite.len())
    }

    /// Above the threshold and fewer than M archived scores strictly better.
    pub fn qualifies_for_promotion(&self, stage1_score: f64, archive_top_scores: &[f64]) -> bool {
        if stage1_score <= self.config.promotion_threshold {
            return false;
        }
        let better = archive_top_scores.iter().filter(|s| **s > stage1_score).count();
        better < self.config.promotion_top_m
    }

    /// Full staged evaluation of a fresh candidate.
    pub async fn evaluate_candidate(
        &self,
        candidate: &Path,
        archive_top_scores: &[f64],
    ) -> Result<Evaluation, EvaluationError> {
        if self.suite.is_empty() {
            return Err(EvaluationError::EmptySuite);
        }

        let stage1 = self.suite.prefix(self.stage1_len());
        let mut outcomes = Vec::with_capacity(self.stage2_len());
        for task in stage1 {
            match self.run(candidate, task).await? {
                Some(outcome) => outcomes.push(outcome),
                None => {
                    info!(candidate = %candidate.display(), "candidate failed to load");
                    return Ok(Evaluation::invalid("agent code failed to load".to_string(), outcomes));
                }
            }
        }

        if self.config.canary_enabled {
            if let Err(reason) = self.run_canary(candidate).await? {
                info!(candidate = %candidate.display(), reason = %reason, "canary edit failed");
                return Ok(Evaluation::invalid(reason, outcomes));
            }
        }

        let stage1_score = score(&outcomes).unwrap_or(0.0);
        let promote = self.stage2_len() > outcomes.len()
            && self.qualifies_for_promotion(stage1_score, archive_top_scores);

        if promote {
            self.extend(candidate, &mut outcomes).await?;
        }

        let evaluation = Evaluation {
            is_valid: true,
            score: score(&outcomes),
            eval_task_count: outcomes.len(),
            outcomes,
            promoted: promote,
            invalid_reason: None,
        };
        info!(
            candidate = %candidate.display(),
            score = ?evaluation.score,
            tasks = evaluation.eval_task_count,
            promoted = promote,
            "candidate evaluated"
        );
        Ok(evaluation)
    }

    /// Re-check an archived agent for promotion now that the archive may have
    /// changed. Returns `None` without running anything when the agent is
    /// already scored on the full subset or does not qualify.
    pub async fn promote_archived(
        &self,
        record: &AgentRecord,
        snapshot: &Path,
        previous: &[TaskOutcome],
        archive_top_scores: &[f64],
    ) -> Result<Option<Evaluation>, EvaluationError> {
        let Some(current) = record.score.filter(|_| record.is_valid) else {
            return Ok(None);
        };
        if record.eval_task_count >= self.stage2_len() {
            return Ok(None);
        }
        if !self.qualifies_for_promotion(current, archive_top_scores) {
            return Ok(None);
        }

        // Reuse the stored outcomes only if they are exactly the suite prefix.
        let reusable = previous.len() == record.eval_task_count
            && previous
                .iter()
                .zip(self.suite.tasks())
                .all(|(o, t)| o.task_id == t.spec.id);
        let mut outcomes = if reusable { previous.to_vec() } else { Vec::new() };

        if !self.extend(snapshot, &mut outcomes).await? {
            return Ok(None);
        }

        let evaluation = Evaluation {
            is_valid: true,
            score: score(&outcomes),
            eval_task_count: outcomes.len(),
            outcomes,
            promoted: true,
            invalid_reason: None,
        };
        info!(
            agent = %record.id,
            score = ?evaluation.score,
            tasks = evaluation.eval_task_count,
            "archived agent promoted"
        );
        Ok(Some(evaluation))
    }

    /// Run the stage-2 tasks not yet in `outcomes`. Returns false if the agent
    /// stopped loading part way, leaving `outcomes` untouched.
    async fn extend(&self, codebase: &Path, outcomes: &mut Vec<TaskOutcome>) -> Result<bool, EvaluationError> {
        let start = outcomes.len();
        let mut extra = Vec::new();
        for task in &self.suite.prefix(self.stage2_len())[start..] {
            match self.run(codebase, task).await? {
                Some(outcome) => extra.push(outcome),
                None => return Ok(false),
            }
        }
        outcomes.extend(extra);
        Ok(true)
    }

    /// `Ok(None)` when the agent cannot load.
    async fn run(&self, codebase: &Path, task: &BenchmarkTask) -> Result<Option<TaskOutcome>, EvaluationError> {
        let limit = task.timeout.min(Duration::from_millis(self.config.task_timeout_ms));
        match self.sandbox.run_task(codebase, &task.spec, limit).await {
            Ok(outcome) => {
                debug!(task = %outcome.task_id, passed = outcome.passed, timed_out = outcome.timed_out, "task finished");
                Ok(Some(outcome))
            }
            Err(SandboxError::LoadFailed(msg)) => {
                debug!(task = %task.spec.id, error = %msg, "load failure");
                Ok(None)
            }
            Err(SandboxError::Unavailable(msg)) => Err(EvaluationError::SandboxUnavailable(msg)),
        }
    }

    /// Ask the agent to rewrite the canary file in a scratch copy of itself.
    /// The inner `Err` is the reason the candidate is invalid.
    async fn run_canary(&self, candidate: &Path) -> Result<Result<(), String>, EvaluationError> {
        let scratch = Workspace::copy_of(&self.scratch_root, "canary", candidate).map_err(|source| {
            EvaluationError::Workspace {
                path: self.scratch_root.clone(),
                source,
            }
        })?;

        let token = format!("dgm-canary-{:08x}", rand::random::<u32>());
        let task = TaskSpec {
            id: "canary".to_string(),
            problem_statement: format!(
                "Using your file editing tools, write exactly `{token}` (nothing else) to the file \
                 {CANARY_FILE} at the root of the workspace, replacing any existing content."
            ),
            function: None,
            input: Value::Null,
            check: TaskCheck::FileContents {
                path: CANARY_FILE.to_string(),
                contents: token,
            },
        };

        let limit = Duration::from_millis(self.config.task_timeout_ms);
        match self.sandbox.run_task(scratch.path(), &task, limit).await {
            Ok(outcome) if outcome.passed => Ok(Ok(())),
            Ok(outcome) if outcome.timed_out => Ok(Err("canary edit timed out".to_string())),
            Ok(_) => Ok(Err("canary edit produced the wrong file contents".to_string())),
            Err(SandboxError::LoadFailed(msg)) => Ok(Err(format!("agent code failed to load: {msg}"))),
            Err(SandboxError::Unavailable(msg)) => Err(EvaluationError::SandboxUnavailable(msg)),
        }
    }
}
