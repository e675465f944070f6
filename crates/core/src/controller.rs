// crates/core/src/controller.rs

//! The generation loop: select parents, self-modify and evaluate them in
//! parallel pipelines, then admit the results into the archive.
//!
//! ```text
//! Idle -> SelectingParents -> SelfModifying -> Evaluating -> Admitting -> (Paused | Idle)
//!                                                                  any fatal -> Stopped
//! ```
//!
//! The state moves to `Evaluating` only once every pipeline of the
//! generation has left self-modification.
//!
//! Pipelines own their workspaces. A pipeline cancelled by the generation
//! timeout or a stop signal drops its candidate, which deletes the workspace,
//! so nothing half-built ever reaches the archive.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{watch, Semaphore};
use tokio::task::{self, JoinError, JoinSet};
use tracing::{debug, error, info, warn};

use crate::archive::{Archive, ArchiveStatistics, NewAgent};
use crate::benchmark::BenchmarkSuite;
use crate::config::{ControllerConfig, DgmConfig};
use crate::error::{ArchiveError, ControllerError, EvaluationError, FailureKind};
use crate::evaluator::{Evaluation, StagedEvaluator};
use crate::fm::FmGateway;
use crate::retry::{retry_transient, RetryPolicy};
use crate::sandbox::SandboxExecutor;
use crate::selector::ParentSelector;
use crate::self_modifier::SelfModifier;
use crate::types::{AgentId, AgentRecord};
use crate::workspace::{CandidateCodebase, Workspace};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerState {
    Idle,
    SelectingParents,
    SelfModifying,
    Evaluating,
    Admitting,
    Paused,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    Run,
    Pause,
    Stop,
}

/// Cloneable remote control for a running controller.
#[derive(Clone)]
pub struct ControlHandle {
    tx: Arc<watch::Sender<ControlSignal>>,
}

impl ControlHandle {
    fn new() -> Self {
        let (tx, _rx) = watch::channel(ControlSignal::Run);
        Self { tx: Arc::new(tx) }
    }

    /// Pause after the current generation is admitted.
    pub fn pause(&self) {
        self.tx.send_if_modified(|s| {
            if *s == ControlSignal::Run {
                *s = ControlSignal::Pause;
                true
            } else {
                false
            }
        });
    }

    /// Resume a paused controller. A stopped controller stays stopped.
    pub fn resume(&self) {
        self.tx.send_if_modified(|s| {
            if *s == ControlSignal::Pause {
                *s = ControlSignal::Run;
                true
            } else {
                false
            }
        });
    }

    /// Cancel in-flight pipelines and stop the run.
    pub fn stop(&self) {
        self.tx.send_replace(ControlSignal::Stop);
    }

    pub fn signal(&self) -> ControlSignal {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ControlSignal> {
        self.tx.subscribe()
    }
}

/// What happened to one parent's pipeline in a generation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PipelineOutcome {
    Admitted {
        id: AgentId,
        score: Option<f64>,
        is_valid: bool,
        eval_task_count: usize,
        promoted: bool,
    },
    /// Evaluated but not stored (invalid, with `persist_invalid` off).
    Discarded { reason: String },
    Failed { kind: FailureKind, message: String },
    /// Cut off by the generation timeout or a stop signal.
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineReport {
    pub parent: AgentId,
    pub parent_score: Option<f64>,
    pub outcome: PipelineOutcome,
}

/// An archived agent re-scored on the larger task subset.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Promotion {
    pub agent: AgentId,
    pub previous_score: Option<f64>,
    pub score: f64,
    pub eval_task_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationSummary {
    pub generation: u64,
    pub reports: Vec<PipelineReport>,
    pub promotions: Vec<Promotion>,
    pub timed_out: bool,
    /// A stop signal arrived mid-generation; the generation is not counted.
    pub interrupted: bool,
    pub archive_size: usize,
    pub best_score: Option<f64>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    IterationsReached,
    TargetScoreReached,
    MaxRuntimeExceeded,
    External,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub generations_run: u64,
    pub iterations_completed: u64,
    pub agents_created: u64,
    pub valid_agents_created: u64,
    /// Valid children that scored above their parent.
    pub improvements: u64,
    pub improvement_rate: f64,
    pub failed_pipelines: u64,
    pub stop_reason: Option<StopReason>,
    pub archive: ArchiveStatistics,
    pub top_agents: Vec<AgentRecord>,
}

#[derive(Debug, Default)]
struct RunStats {
    generations: u64,
    agents_created: u64,
    valid_created: u64,
    improvements: u64,
    failures: u64,
    stop_reason: Option<StopReason>,
}

/// Everything a pipeline needs; cheap to clone into a spawned task.
#[derive(Clone)]
struct PipelineCtx {
    archive: Arc<Archive>,
    modifier: Arc<SelfModifier>,
    evaluator: Arc<StagedEvaluator>,
    /// Controller-level retries for an unavailable sandbox.
    eval_retry: RetryPolicy,
    state: Arc<Mutex<ControllerState>>,
    /// Pipelines of the current generation still self-modifying.
    modifying: Arc<AtomicUsize>,
}

enum PipelineResult {
    Evaluated {
        candidate: CandidateCodebase,
        evaluation: Evaluation,
    },
    Failed {
        kind: FailureKind,
        message: String,
    },
}

struct PipelineDone {
    slot: usize,
    parent: AgentRecord,
    result: Result<PipelineResult, ArchiveError>,
}

impl PipelineCtx {
    async fn evaluate(&self, codebase: &Path) -> Result<Evaluation, EvaluationError> {
        let top = self.archive.top_scores(self.evaluator.promotion_top_m());
        let top = &top;
        retry_transient(&self.eval_retry, "evaluation", || {
            self.evaluator.evaluate_candidate(codebase, top)
        })
        .await
    }

    async fn run(self, slot: usize, parent: AgentRecord) -> PipelineDone {
        let result = self.drive(&parent).await;
        PipelineDone { slot, parent, result }
    }

    fn leave_self_modification(&self) {
        if self.modifying.fetch_sub(1, Ordering::SeqCst) == 1 {
            let mut state = self.state.lock();
            if *state == ControllerState::SelfModifying {
                debug!("all pipelines evaluating");
                *state = ControllerState::Evaluating;
            }
        }
    }

    async fn drive(&self, parent: &AgentRecord) -> Result<PipelineResult, ArchiveError> {
        let modified = async {
            let snapshot = self.archive.snapshot_path(parent.id)?;
            let logs = self.archive.evaluation_log(parent.id)?;
            Ok::<_, ArchiveError>(self.modifier.propose_and_implement(parent, &snapshot, &logs).await)
        }
        .await;
        self.leave_self_modification();

        let candidate = match modified? {
            Ok(candidate) => candidate,
            Err(e) => {
                warn!(parent = %parent.id, error = %e, "self-modification failed");
                return Ok(PipelineResult::Failed {
                    kind: FailureKind::from(&e),
                    message: e.to_string(),
                });
            }
        };

        match self.evaluate(candidate.path()).await {
            Ok(evaluation) => Ok(PipelineResult::Evaluated {
                candidate,
                evaluation,
            }),
            Err(e) => {
                warn!(parent = %parent.id, error = %e, "evaluation failed");
                Ok(PipelineResult::Failed {
                    kind: FailureKind::from(&e),
                    message: e.to_string(),
                })
            }
        }
    }
}

pub struct DgmController {
    archive: Arc<Archive>,
    selector: ParentSelector,
    ctx: PipelineCtx,
    config: ControllerConfig,
    parents_per_iteration: usize,
    workspace_root: PathBuf,
    control: ControlHandle,
    state: Arc<Mutex<ControllerState>>,
    stats: Mutex<RunStats>,
    /// Wall clock of the latest `run_with` call, or of construction.
    started_at: Mutex<DateTime<Utc>>,
}

impl DgmController {
    pub fn new(
        config: &DgmConfig,
        archive: Arc<Archive>,
        fm: Arc<dyn FmGateway>,
        sandbox: Arc<dyn SandboxExecutor>,
        suite: Arc<BenchmarkSuite>,
    ) -> Self {
        let selector = ParentSelector::new(&config.selection);
        Self::with_selector(config, archive, fm, sandbox, suite, selector)
    }

    pub fn with_selector(
        config: &DgmConfig,
        archive: Arc<Archive>,
        fm: Arc<dyn FmGateway>,
        sandbox: Arc<dyn SandboxExecutor>,
        suite: Arc<BenchmarkSuite>,
        selector: ParentSelector,
    ) -> Self {
        let workspace_root = config.self_modification.workspace_root.clone();
        let modifier = SelfModifier::new(
            fm,
            sandbox.clone(),
            config.self_modification.clone(),
            config.retry.clone(),
        );
        let evaluator = StagedEvaluator::new(sandbox, suite, config.evaluation.clone(), workspace_root.clone());
        let state = Arc::new(Mutex::new(ControllerState::Idle));

        let ctx = PipelineCtx {
            archive: archive.clone(),
            modifier: Arc::new(modifier),
            evaluator: Arc::new(evaluator),
            eval_retry: RetryPolicy {
                max_retries: config.evaluation.sandbox_retries,
                ..config.retry.clone()
            },
            state: state.clone(),
            modifying: Arc::new(AtomicUsize::new(0)),
        };

        Self {
            archive,
            selector,
            ctx,
            config: config.controller.clone(),
            parents_per_iteration: config.selection.parents_per_iteration,
            workspace_root,
            control: ControlHandle::new(),
            state,
            stats: Mutex::new(RunStats::default()),
            started_at: Mutex::new(Utc::now()),
        }
    }

    pub fn archive(&self) -> &Arc<Archive> {
        &self.archive
    }

    pub fn handle(&self) -> ControlHandle {
        self.control.clone()
    }

    pub fn state(&self) -> ControllerState {
        *self.state.lock()
    }

    pub fn pause(&self) {
        self.control.pause();
    }

    pub fn resume(&self) {
        self.control.resume();
    }

    pub fn stop(&self) {
        self.control.stop();
    }

    fn set_state(&self, next: ControllerState) {
        let mut state = self.state.lock();
        if *state != next {
            debug!(from = ?*state, to = ?next, "controller state");
            *state = next;
        }
    }

    /// Evaluate and archive the seed agent. Does nothing when the archive
    /// already has agents (a resumed run).
    pub async fn bootstrap(&self, seed_dir: &Path) -> Result<Option<AgentId>, ControllerError> {
        if !self.archive.is_empty() {
            info!(agents = self.archive.len(), "archive already seeded, resuming");
            return Ok(None);
        }
        if !seed_dir.is_dir() {
            return Err(ControllerError::InvalidSeed(format!(
                "{} is not a directory",
                seed_dir.display()
            )));
        }

        let mut workspace = Workspace::copy_of(&self.workspace_root, "seed", seed_dir)
            .map_err(|e| ControllerError::InvalidSeed(format!("cannot copy seed: {e}")))?;

        self.set_state(ControllerState::Evaluating);
        let evaluation = self.ctx.evaluate(workspace.path()).await;
        self.set_state(ControllerState::Idle);
        let evaluation = evaluation?;

        if !evaluation.is_valid {
            return Err(ControllerError::InvalidSeed(
                evaluation
                    .invalid_reason
                    .unwrap_or_else(|| "validity probe failed".to_string()),
            ));
        }

        let score = evaluation.score;
        let seed = NewAgent {
            parent_id: None,
            score,
            eval_task_count: evaluation.eval_task_count,
            is_valid: true,
            summary: "seed".to_string(),
            outcomes: evaluation.outcomes,
        };
        let id = on_archive_worker(&self.archive, move |archive| archive.insert(seed, &mut workspace)).await?;
        info!(agent = %id, score = ?score, "seed archived");
        Ok(Some(id))
    }

    /// Run one generation end to end.
    pub async fn run_iteration(&self) -> Result<GenerationSummary, ControllerError> {
        if self.control.signal() == ControlSignal::Stop {
            return Err(ControllerError::Stopped);
        }
        if self.archive.is_empty() {
            return Err(ControllerError::NotBootstrapped);
        }

        let started = Instant::now();
        let generation = self.archive.iterations_completed() + 1;
        info!(generation, "generation starting");

        let promotions = if self.config.repromote_archived {
            self.set_state(ControllerState::Evaluating);
            match self.repromote().await {
                Ok(p) => p,
                Err(e) => return Err(self.halt(e.into())),
            }
        } else {
            Vec::new()
        };

        self.set_state(ControllerState::SelectingParents);
        let parents = match self.selector.select(&self.archive, self.parents_per_iteration) {
            Ok(p) => p,
            Err(e) => return Err(self.halt(e.into())),
        };
        info!(
            generation,
            parents = ?parents.iter().map(|p| p.id.to_string()).collect::<Vec<_>>(),
            "parents selected"
        );

        self.set_state(ControllerState::SelfModifying);
        self.ctx.modifying.store(parents.len(), Ordering::SeqCst);
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
        let mut set = JoinSet::new();
        let mut slots: HashMap<task::Id, usize> = HashMap::with_capacity(parents.len());
        for (slot, parent) in parents.iter().cloned().enumerate() {
            let ctx = self.ctx.clone();
            let semaphore = semaphore.clone();
            let handle = set.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                ctx.run(slot, parent).await
            });
            slots.insert(handle.id(), slot);
        }

        let mut pending: BTreeSet<usize> = (0..parents.len()).collect();
        let mut done = Vec::with_capacity(parents.len());
        let mut panicked: Vec<(usize, String)> = Vec::new();
        let mut collect = |joined: Result<(task::Id, PipelineDone), JoinError>| match joined {
            Ok((_, result)) => {
                pending.remove(&result.slot);
                done.push(result);
            }
            Err(e) if e.is_panic() => {
                error!(generation, error = %e, "pipeline task panicked");
                if let Some(slot) = slots.get(&e.id()).copied() {
                    pending.remove(&slot);
                    panicked.push((slot, e.to_string()));
                }
            }
            // Aborted by us; the slot stays pending and is reported cancelled.
            Err(_) => {}
        };
        let mut timed_out = false;
        let mut interrupted = false;

        let deadline = self
            .config
            .generation_timeout_ms
            .map(|ms| tokio::time::Instant::now() + Duration::from_millis(ms));
        let generation_timer = async move {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(generation_timer);
        let mut control = self.control.subscribe();

        loop {
            tokio::select! {
                joined = set.join_next_with_id() => match joined {
                    None => break,
                    Some(joined) => collect(joined),
                },
                _ = &mut generation_timer => {
                    warn!(generation, in_flight = set.len(), "generation timed out, cancelling pipelines");
                    timed_out = true;
                    break;
                }
                _ = wait_for_stop(&mut control) => {
                    warn!(generation, in_flight = set.len(), "stop requested, cancelling pipelines");
                    interrupted = true;
                    break;
                }
            }
        }
        // Dropping the aborted futures removes their workspaces before admission.
        set.abort_all();
        while let Some(joined) = set.join_next_with_id().await {
            collect(joined);
        }

        self.set_state(ControllerState::Admitting);
        let mut reports: Vec<(usize, PipelineReport)> = Vec::with_capacity(parents.len());
        let mut fatal: Option<ArchiveError> = None;

        for PipelineDone { slot, parent, result } in done {
            let outcome = match result {
                Ok(PipelineResult::Evaluated {
                    candidate,
                    evaluation,
                }) => match self.admit(&parent, candidate, evaluation).await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        error!(parent = %parent.id, error = %e, "admission failed");
                        let outcome = PipelineOutcome::Failed {
                            kind: FailureKind::Archive,
                            message: e.to_string(),
                        };
                        fatal.get_or_insert(e);
                        outcome
                    }
                },
                Ok(PipelineResult::Failed { kind, message }) => PipelineOutcome::Failed { kind, message },
                Err(e) => {
                    let outcome = PipelineOutcome::Failed {
                        kind: FailureKind::Archive,
                        message: e.to_string(),
                    };
                    fatal.get_or_insert(e);
                    outcome
                }
            };
            reports.push((
                slot,
                PipelineReport {
                    parent: parent.id,
                    parent_score: parent.score,
                    outcome,
                },
            ));
        }
        for (slot, message) in panicked {
            reports.push((
                slot,
                PipelineReport {
                    parent: parents[slot].id,
                    parent_score: parents[slot].score,
                    outcome: PipelineOutcome::Failed {
                        kind: FailureKind::Panicked,
                        message,
                    },
                },
            ));
        }
        for slot in pending {
            reports.push((
                slot,
                PipelineReport {
                    parent: parents[slot].id,
                    parent_score: parents[slot].score,
                    outcome: PipelineOutcome::Cancelled,
                },
            ));
        }
        reports.sort_by_key(|(slot, _)| *slot);
        let reports: Vec<PipelineReport> = reports.into_iter().map(|(_, r)| r).collect();

        {
            let mut stats = self.stats.lock();
            stats.failures += reports
                .iter()
                .filter(|r| matches!(r.outcome, PipelineOutcome::Failed { .. }))
                .count() as u64;
        }

        if let Some(e) = fatal {
            return Err(self.halt(e.into()));
        }

        if !interrupted {
            if let Err(e) = on_archive_worker(&self.archive, move |archive| archive.commit_iteration(generation)).await {
                return Err(self.halt(e.into()));
            }
            self.stats.lock().generations += 1;
        }

        let summary = GenerationSummary {
            generation,
            reports,
            promotions,
            timed_out,
            interrupted,
            archive_size: self.archive.len(),
            best_score: self.best_score(),
            duration_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            generation,
            archive_size = summary.archive_size,
            best_score = ?summary.best_score,
            duration_ms = summary.duration_ms,
            "generation complete"
        );

        if self.config.pause_between_generations && !interrupted {
            self.control.pause();
        }
        self.set_state(if interrupted {
            ControllerState::Stopped
        } else {
            ControllerState::Idle
        });
        Ok(summary)
    }

    fn halt(&self, err: ControllerError) -> ControllerError {
        error!(error = %err, "controller halted");
        self.set_state(ControllerState::Stopped);
        err
    }

    async fn admit(
        &self,
        parent: &AgentRecord,
        mut candidate: CandidateCodebase,
        evaluation: Evaluation,
    ) -> Result<PipelineOutcome, ArchiveError> {
        let Evaluation {
            is_valid,
            score,
            eval_task_count,
            outcomes,
            promoted,
            invalid_reason,
        } = evaluation;

        if !is_valid && !self.config.persist_invalid {
            info!(parent = %parent.id, "invalid candidate discarded");
            return Ok(PipelineOutcome::Discarded {
                reason: invalid_reason.unwrap_or_else(|| "validity probe failed".to_string()),
            });
        }

        let child = NewAgent {
            parent_id: Some(parent.id),
            score,
            eval_task_count,
            is_valid,
            summary: candidate.summary.clone(),
            outcomes,
        };
        let id = on_archive_worker(&self.archive, move |archive| {
            archive.insert(child, candidate.workspace_mut())
        })
        .await?;

        let mut stats = self.stats.lock();
        stats.agents_created += 1;
        if is_valid {
            stats.valid_created += 1;
            if let (Some(child), Some(base)) = (score, parent.score) {
                if child > base {
                    stats.improvements += 1;
                }
            }
        }

        Ok(PipelineOutcome::Admitted {
            id,
            score,
            is_valid,
            eval_task_count,
            promoted,
        })
    }

    /// Give archived top performers their stage-2 evaluation when they now qualify.
    async fn repromote(&self) -> Result<Vec<Promotion>, ArchiveError> {
        let top_m = self.ctx.evaluator.promotion_top_m();
        let mut promotions = Vec::new();

        for record in self.archive.top_agents(top_m) {
            let top = self.archive.top_scores(top_m);
            let snapshot = self.archive.snapshot_path(record.id)?;
            let log = self.archive.evaluation_log(record.id)?;

            match self
                .ctx
                .evaluator
                .promote_archived(&record, &snapshot, &log, &top)
                .await
            {
                Ok(Some(evaluation)) => {
                    let Some(score) = evaluation.score else {
                        continue;
                    };
                    self.archive
                        .update_score(record.id, score, evaluation.eval_task_count)?;
                    self.archive
                        .record_evaluation_log(record.id, &evaluation.outcomes)?;
                    promotions.push(Promotion {
                        agent: record.id,
                        previous_score: record.score,
                        score,
                        eval_task_count: evaluation.eval_task_count,
                    });
                }
                Ok(None) => {}
                Err(e) => warn!(agent = %record.id, error = %e, "re-promotion skipped"),
            }
        }
        Ok(promotions)
    }

    fn best_score(&self) -> Option<f64> {
        self.archive.top_scores(1).first().copied()
    }

    /// Run generations until the configured total, a stop criterion or a
    /// stop signal. Resumes from the archive's committed iteration count.
    pub async fn run(&self) -> Result<RunReport, ControllerError> {
        self.run_with(|_| {}).await
    }

    /// Like [`run`](Self::run), calling `on_generation` after every generation.
    pub async fn run_with<F>(&self, mut on_generation: F) -> Result<RunReport, ControllerError>
    where
        F: FnMut(&GenerationSummary) + Send,
    {
        if self.archive.is_empty() {
            return Err(ControllerError::NotBootstrapped);
        }
        let mut control = self.control.subscribe();
        let started = Instant::now();
        *self.started_at.lock() = Utc::now();

        let reason = loop {
            if self.control.signal() == ControlSignal::Stop {
                break StopReason::External;
            }
            if self.archive.iterations_completed() >= self.config.iterations {
                break StopReason::IterationsReached;
            }
            if let Some(limit) = self.config.max_runtime_secs {
                if started.elapsed() >= Duration::from_secs(limit) {
                    break StopReason::MaxRuntimeExceeded;
                }
            }
            if let (Some(target), Some(best)) = (self.config.target_score, self.best_score()) {
                if best >= target {
                    break StopReason::TargetScoreReached;
                }
            }
            if self.control.signal() == ControlSignal::Pause {
                self.set_state(ControllerState::Paused);
                info!("paused, waiting for resume");
                if control.wait_for(|s| *s != ControlSignal::Pause).await.is_err() {
                    break StopReason::External;
                }
                continue;
            }

            match self.run_iteration().await {
                Ok(summary) => on_generation(&summary),
                Err(ControllerError::Stopped) => break StopReason::External,
                Err(e) => return Err(e),
            }
        };

        info!(reason = ?reason, "run finished");
        self.set_state(ControllerState::Stopped);
        self.stats.lock().stop_reason = Some(reason);
        Ok(self.report())
    }

    pub fn report(&self) -> RunReport {
        let stats = self.stats.lock();
        RunReport {
            started_at: *self.started_at.lock(),
            finished_at: Utc::now(),
            generations_run: stats.generations,
            iterations_completed: self.archive.iterations_completed(),
            agents_created: stats.agents_created,
            valid_agents_created: stats.valid_created,
            improvements: stats.improvements,
            improvement_rate: if stats.valid_created == 0 {
                0.0
            } else {
                stats.improvements as f64 / stats.valid_created as f64
            },
            failed_pipelines: stats.failures,
            stop_reason: stats.stop_reason,
            archive: self.archive.statistics(),
            top_agents: self.archive.top_agents(5),
        }
    }
}

/// Archive writes rename and fsync under the index lock; run them on the
/// blocking pool.
async fn on_archive_worker<T, F>(archive: &Arc<Archive>, op: F) -> Result<T, ArchiveError>
where
    F: FnOnce(&Archive) -> Result<T, ArchiveError> + Send + 'static,
    T: Send + 'static,
{
    let archive = archive.clone();
    task::spawn_blocking(move || op(&archive))
        .await
        .map_err(|e| ArchiveError::Worker(e.to_string()))?
}

async fn wait_for_stop(control: &mut watch::Receiver<ControlSignal>) {
    // The sender lives as long as the controller; a closed channel never stops.
    if control.wait_for(|s| *s == ControlSignal::Stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::benchmark::Benchmark;
    use crate::error::{FmError, SandboxError, SelectionError};
    use crate::fm::{Completion, Message, ResponseSchema, TokenUsage};
    use crate::sandbox::{TaskCheck, TaskOutcome, TaskSpec};
    use async_trait::async_trait;
    use std::fs;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    const DIAGNOSIS: &str = r#"{
        "log_summarization": "misses half the tasks",
        "potential_improvements": "a better solver",
        "improvement_proposal": "Improve the solver",
        "implementation_suggestion": "Raise skill by one",
        "problem_description": "The agent fails too many tasks"
    }"#;

    #[derive(Default)]
    struct TestFm {
        calls: AtomicUsize,
        fail_first: bool,
    }

    #[async_trait]
    impl FmGateway for TestFm {
        async fn complete(
            &self,
            _conversation: &[Message],
            _schema: Option<&ResponseSchema>,
        ) -> Result<Completion, FmError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_first && n == 0 {
                return Err(FmError::Fatal("invalid api key".into()));
            }
            Ok(Completion {
                content: DIAGNOSIS.to_string(),
                token_usage: TokenUsage::default(),
            })
        }
    }

    struct PanickingFm;

    #[async_trait]
    impl FmGateway for PanickingFm {
        async fn complete(
            &self,
            _conversation: &[Message],
            _schema: Option<&ResponseSchema>,
        ) -> Result<Completion, FmError> {
            panic!("diagnosis backend crashed")
        }
    }

    /// Agents are directories with a `skill` file: task `n` passes when
    /// `n % 10 < skill`. Self-modification raises skill by one. Marker files:
    /// `unloadable` fails loading, `breeds_broken` makes children unloadable.
    #[derive(Default)]
    struct SkillSandbox {
        hang_first_modification: AtomicBool,
        hanging: AtomicBool,
    }

    fn read_skill(codebase: &Path) -> usize {
        fs::read_to_string(codebase.join("skill"))
            .map(|s| s.trim().parse().unwrap())
            .unwrap_or(0)
    }

    #[async_trait]
    impl SandboxExecutor for SkillSandbox {
        async fn run_task(
            &self,
            codebase: &Path,
            task: &TaskSpec,
            _timeout: Duration,
        ) -> Result<TaskOutcome, SandboxError> {
            if codebase.join("unloadable").exists() {
                return Err(SandboxError::LoadFailed("broken".into()));
            }
            let passed = match &task.check {
                TaskCheck::ExpectedOutput(_) => {
                    let n: usize = task.id.rsplit('/').next().unwrap().parse().unwrap();
                    n % 10 < read_skill(codebase)
                }
                TaskCheck::FileContents { path, contents } => {
                    fs::write(codebase.join(path), contents).unwrap();
                    true
                }
                TaskCheck::ExitSuccess => {
                    if self.hang_first_modification.swap(false, Ordering::SeqCst) {
                        self.hanging.store(true, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_secs(3600)).await;
                    }
                    let skill = read_skill(codebase);
                    fs::write(codebase.join("skill"), (skill + 1).min(10).to_string()).unwrap();
                    if codebase.join("breeds_broken").exists() {
                        fs::write(codebase.join("unloadable"), "").unwrap();
                    }
                    true
                }
            };
            Ok(TaskOutcome {
                task_id: task.id.clone(),
                passed,
                output: String::new(),
                timed_out: false,
                duration_ms: 1,
            })
        }
    }

    struct Harness {
        dir: tempfile::TempDir,
        config: DgmConfig,
    }

    impl Harness {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let mut config = DgmConfig::default();
            config.archive.root = dir.path().join("archive");
            config.self_modification.workspace_root = dir.path().join("workspaces");
            config.retry = RetryPolicy {
                initial_delay_ms: 1,
                max_delay_ms: 2,
                max_retries: 2,
                multiplier: 2.0,
            };
            config.evaluation.validity_subset_size = 10;
            config.evaluation.promotion_subset_size = 20;
            config.controller.iterations = 1;
            config.controller.repromote_archived = false;
            Self { dir, config }
        }

        fn seed(&self, skill: usize, markers: &[&str]) -> PathBuf {
            let seed = self.dir.path().join("seed");
            fs::create_dir_all(&seed).unwrap();
            fs::write(seed.join("agent.json"), "{}").unwrap();
            fs::write(seed.join("skill"), skill.to_string()).unwrap();
            for m in markers {
                fs::write(seed.join(m), "").unwrap();
            }
            seed
        }

        fn controller(&self, fm: TestFm, sandbox: SkillSandbox) -> DgmController {
            self.controller_with(Arc::new(fm), Arc::new(sandbox))
        }

        fn controller_with(&self, fm: Arc<dyn FmGateway>, sandbox: Arc<dyn SandboxExecutor>) -> DgmController {
            let cases: String = (0..20)
                .map(|i| format!("  - input: {i}\n    expected_output: {i}\n"))
                .collect();
            let bench = Benchmark::from_yaml(&format!("name: t\ntest_cases:\n{cases}")).unwrap();
            let suite = Arc::new(BenchmarkSuite::from_benchmarks([bench]));
            let archive = Arc::new(Archive::open(&self.config.archive.root).unwrap());
            DgmController::with_selector(
                &self.config,
                archive,
                fm,
                sandbox,
                suite,
                ParentSelector::with_seed(&self.config.selection, 11),
            )
        }

        fn leftover_workspaces(&self) -> usize {
            fs::read_dir(&self.config.self_modification.workspace_root)
                .map(|d| d.count())
                .unwrap_or(0)
        }
    }

    #[tokio::test]
    async fn test_generation_admits_children_and_counts_them() {
        let h = Harness::new();
        let seed = h.seed(3, &[]);
        let c = h.controller(TestFm::default(), SkillSandbox::default());

        assert_eq!(c.bootstrap(&seed).await.unwrap(), Some(AgentId(0)));
        assert_eq!(c.archive().get(AgentId(0)).unwrap().score, Some(0.3));

        let summary = c.run_iteration().await.unwrap();
        assert_eq!(summary.generation, 1);
        assert_eq!(summary.reports.len(), 2);
        for report in &summary.reports {
            assert!(matches!(
                report.outcome,
                PipelineOutcome::Admitted { score: Some(s), is_valid: true, .. } if (s - 0.4).abs() < 1e-9
            ));
        }
        assert_eq!(c.archive().len(), 3);
        assert_eq!(c.archive().get(AgentId(0)).unwrap().children_count, 2);
        assert_eq!(c.archive().iterations_completed(), 1);
        assert_eq!(h.leftover_workspaces(), 0);
        assert_eq!(c.state(), ControllerState::Idle);

        let report = c.report();
        assert_eq!(report.improvements, 2);
        assert_eq!(report.improvement_rate, 1.0);
    }

    #[tokio::test]
    async fn test_one_failed_pipeline_does_not_block_the_other() {
        let h = Harness::new();
        let seed = h.seed(3, &[]);
        let c = h.controller(
            TestFm {
                fail_first: true,
                ..Default::default()
            },
            SkillSandbox::default(),
        );
        c.bootstrap(&seed).await.unwrap();

        let summary = c.run_iteration().await.unwrap();
        let failed = summary
            .reports
            .iter()
            .filter(|r| {
                matches!(
                    r.outcome,
                    PipelineOutcome::Failed {
                        kind: FailureKind::FoundationModel,
                        ..
                    }
                )
            })
            .count();
        let admitted = summary
            .reports
            .iter()
            .filter(|r| matches!(r.outcome, PipelineOutcome::Admitted { .. }))
            .count();
        assert_eq!((failed, admitted), (1, 1));
        assert_eq!(c.archive().len(), 2);
    }

    #[tokio::test]
    async fn test_generation_timeout_commits_nothing_partial() {
        let mut h = Harness::new();
        h.config.controller.generation_timeout_ms = Some(2_000);
        let seed = h.seed(3, &[]);
        let sandbox = SkillSandbox {
            hang_first_modification: AtomicBool::new(true),
            ..Default::default()
        };
        let c = h.controller(TestFm::default(), sandbox);
        c.bootstrap(&seed).await.unwrap();

        let summary = c.run_iteration().await.unwrap();
        assert!(summary.timed_out);
        let cancelled = summary
            .reports
            .iter()
            .filter(|r| r.outcome == PipelineOutcome::Cancelled)
            .count();
        assert_eq!(cancelled, 1);
        assert_eq!(c.archive().len(), 2);
        assert_eq!(c.archive().get(AgentId(0)).unwrap().children_count, 1);
        // The cancelled pipeline's workspace was removed with it.
        assert_eq!(h.leftover_workspaces(), 0);
    }

    #[tokio::test]
    async fn test_panicked_pipeline_counts_as_failure() {
        let h = Harness::new();
        let seed = h.seed(3, &[]);
        let c = h.controller_with(Arc::new(PanickingFm), Arc::new(SkillSandbox::default()));
        c.bootstrap(&seed).await.unwrap();

        let summary = c.run_iteration().await.unwrap();
        assert_eq!(summary.reports.len(), 2);
        for report in &summary.reports {
            assert!(matches!(
                &report.outcome,
                PipelineOutcome::Failed {
                    kind: FailureKind::Panicked,
                    message,
                } if message.contains("diagnosis backend crashed")
            ));
        }
        assert!(!summary.interrupted);
        assert_eq!(c.report().failed_pipelines, 2);
        assert_eq!(c.archive().len(), 1);
        assert_eq!(c.archive().iterations_completed(), 1);
        assert_eq!(h.leftover_workspaces(), 0);
        assert_eq!(c.state(), ControllerState::Idle);
    }

    #[tokio::test]
    async fn test_stop_mid_generation_cancels_in_flight_pipeline() {
        let h = Harness::new();
        let seed = h.seed(3, &[]);
        let sandbox = Arc::new(SkillSandbox {
            hang_first_modification: AtomicBool::new(true),
            ..Default::default()
        });
        let c = Arc::new(h.controller_with(Arc::new(TestFm::default()), sandbox.clone()));
        c.bootstrap(&seed).await.unwrap();

        let runner = {
            let c = c.clone();
            tokio::spawn(async move { c.run_iteration().await })
        };
        let mut waited = 0;
        while !sandbox.hanging.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(10)).await;
            waited += 1;
            assert!(waited < 500, "modification never started");
        }
        // The other pipeline may finish meanwhile; one is still self-modifying.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(c.state(), ControllerState::SelfModifying);

        c.stop();
        let summary = runner.await.unwrap().unwrap();
        assert!(summary.interrupted);
        assert!(!summary.timed_out);
        let cancelled = summary
            .reports
            .iter()
            .filter(|r| r.outcome == PipelineOutcome::Cancelled)
            .count();
        let admitted = summary
            .reports
            .iter()
            .filter(|r| matches!(r.outcome, PipelineOutcome::Admitted { .. }))
            .count();
        assert_eq!(cancelled, 1);
        assert_eq!(c.archive().len(), 1 + admitted);
        assert_eq!(c.archive().iterations_completed(), 0);
        assert_eq!(c.report().generations_run, 0);
        assert_eq!(h.leftover_workspaces(), 0);
        assert_eq!(c.state(), ControllerState::Stopped);
    }

    #[tokio::test]
    async fn test_archive_worker_panic_becomes_error() {
        let dir = tempfile::tempdir().unwrap();
        let archive = Arc::new(Archive::open(dir.path()).unwrap());
        let err = on_archive_worker(&archive, |_| -> Result<(), ArchiveError> { panic!("disk vanished") })
            .await
            .unwrap_err();
        assert!(matches!(err, ArchiveError::Worker(_)));
        assert!(archive.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_children_persisted_but_never_selected() {
        let h = Harness::new();
        let seed = h.seed(3, &["breeds_broken"]);
        let c = h.controller(TestFm::default(), SkillSandbox::default());
        c.bootstrap(&seed).await.unwrap();

        let summary = c.run_iteration().await.unwrap();
        for report in &summary.reports {
            assert!(matches!(
                report.outcome,
                PipelineOutcome::Admitted {
                    is_valid: false,
                    score: None,
                    ..
                }
            ));
        }
        assert_eq!(c.archive().len(), 3);
        assert_eq!(c.archive().get(AgentId(0)).unwrap().children_count, 0);
        let eligible: Vec<AgentId> = c.archive().eligible_for_selection().iter().map(|r| r.id).collect();
        assert_eq!(eligible, vec![AgentId(0)]);
    }

    #[tokio::test]
    async fn test_invalid_children_discarded_when_configured() {
        let mut h = Harness::new();
        h.config.controller.persist_invalid = false;
        let seed = h.seed(3, &["breeds_broken"]);
        let c = h.controller(TestFm::default(), SkillSandbox::default());
        c.bootstrap(&seed).await.unwrap();

        let summary = c.run_iteration().await.unwrap();
        assert!(summary
            .reports
            .iter()
            .all(|r| matches!(r.outcome, PipelineOutcome::Discarded { .. })));
        assert_eq!(c.archive().len(), 1);
        assert_eq!(h.leftover_workspaces(), 0);
    }

    #[tokio::test]
    async fn test_pause_then_resume() {
        let mut h = Harness::new();
        h.config.controller.iterations = 2;
        h.config.controller.pause_between_generations = true;
        let seed = h.seed(3, &[]);
        let c = Arc::new(h.controller(TestFm::default(), SkillSandbox::default()));
        c.bootstrap(&seed).await.unwrap();

        let runner = {
            let c = c.clone();
            tokio::spawn(async move { c.run().await })
        };

        let mut waited = 0;
        while c.state() != ControllerState::Paused {
            tokio::time::sleep(Duration::from_millis(20)).await;
            waited += 1;
            assert!(waited < 500, "controller never paused");
        }
        assert_eq!(c.archive().iterations_completed(), 1);

        c.handle().resume();
        let report = runner.await.unwrap().unwrap();
        assert_eq!(report.generations_run, 2);
        assert_eq!(report.stop_reason, Some(StopReason::IterationsReached));
        assert_eq!(c.state(), ControllerState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_before_run() {
        let h = Harness::new();
        let seed = h.seed(3, &[]);
        let c = h.controller(TestFm::default(), SkillSandbox::default());
        c.bootstrap(&seed).await.unwrap();

        c.stop();
        let report = c.run().await.unwrap();
        assert_eq!(report.generations_run, 0);
        assert_eq!(report.stop_reason, Some(StopReason::External));
        assert!(matches!(c.run_iteration().await, Err(ControllerError::Stopped)));
    }

    #[tokio::test]
    async fn test_run_resumes_from_committed_iterations() {
        let mut h = Harness::new();
        let seed = h.seed(3, &[]);
        {
            let c = h.controller(TestFm::default(), SkillSandbox::default());
            c.bootstrap(&seed).await.unwrap();
            c.run().await.unwrap();
            assert_eq!(c.archive().iterations_completed(), 1);
        }

        h.config.controller.iterations = 2;
        let c = h.controller(TestFm::default(), SkillSandbox::default());
        assert_eq!(c.bootstrap(&seed).await.unwrap(), None);
        let report = c.run().await.unwrap();
        assert_eq!(report.generations_run, 1);
        assert_eq!(report.iterations_completed, 2);
        assert_eq!(c.archive().len(), 5);
    }

    #[tokio::test]
    async fn test_perfect_archive_has_no_parents() {
        let h = Harness::new();
        let seed = h.seed(10, &[]);
        let c = h.controller(TestFm::default(), SkillSandbox::default());
        c.bootstrap(&seed).await.unwrap();

        let err = c.run().await.unwrap_err();
        assert!(matches!(err, ControllerError::Selection(SelectionError::NoEligibleParents)));
        assert!(err.is_global_fatal());
        assert_eq!(c.state(), ControllerState::Stopped);
    }

    #[tokio::test]
    async fn test_unloadable_seed_is_rejected() {
        let h = Harness::new();
        let seed = h.seed(3, &["unloadable"]);
        let c = h.controller(TestFm::default(), SkillSandbox::default());
        assert!(matches!(c.bootstrap(&seed).await, Err(ControllerError::InvalidSeed(_))));
        assert!(c.archive().is_empty());
    }

    #[tokio::test]
    async fn test_runtime_limit_counts_from_run_start() {
        let mut h = Harness::new();
        h.config.controller.max_runtime_secs = Some(1);
        let seed = h.seed(3, &[]);
        let c = h.controller(TestFm::default(), SkillSandbox::default());
        c.bootstrap(&seed).await.unwrap();

        // A slow bootstrap must not eat into the run's budget.
        tokio::time::sleep(Duration::from_millis(1_100)).await;
        let before = Utc::now();
        let report = c.run().await.unwrap();
        assert_eq!(report.stop_reason, Some(StopReason::IterationsReached));
        assert_eq!(report.generations_run, 1);
        assert!(report.started_at >= before);
    }

    #[tokio::test]
    async fn test_target_score_stops_run() {
        let mut h = Harness::new();
        h.config.controller.iterations = 10;
        h.config.controller.target_score = Some(0.3);
        let seed = h.seed(3, &[]);
        let c = h.controller(TestFm::default(), SkillSandbox::default());
        c.bootstrap(&seed).await.unwrap();

        let report = c.run().await.unwrap();
        assert_eq!(report.generations_run, 0);
        assert_eq!(report.stop_reason, Some(StopReason::TargetScoreReached));
    }
}
