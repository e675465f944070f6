// crates/core/src/error.rs

//! Error kinds for every stage of the evolutionary loop.
//!
//! Failed benchmark tasks are data (`TaskOutcome { passed: false, .. }`), not
//! errors. Everything here is either transient (retried where it happens),
//! pipeline-local (isolated to one candidate), archive-structural (a
//! sequencing bug) or global (halts the controller).

use std::path::PathBuf;

use thiserror::Error;

use crate::types::AgentId;

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("agent {0} not found in archive")]
    NotFound(AgentId),

    #[error("parent {0} does not resolve to an archived agent")]
    InvalidParentReference(AgentId),

    #[error("archive already holds a seed agent; new records need a parent")]
    SeedAlreadyPresent,

    #[error("score regression for {id}: stored {stored_count} tasks, update has {new_count}")]
    ScoreRegression {
        id: AgentId,
        stored_count: usize,
        new_count: usize,
    },

    #[error("score {0} outside [0, 1]")]
    InvalidScore(f64),

    #[error("archive index is inconsistent: {0}")]
    Corrupt(String),

    #[error("archive storage failure at {path}: {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode archive index: {0}")]
    Encode(#[from] serde_json::Error),

    /// The blocking task running an archive write died before finishing.
    #[error("archive write task failed: {0}")]
    Worker(String),
}

impl ArchiveError {
    pub(crate) fn storage(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Storage {
            path: path.into(),
            source,
        }
    }
}

#[derive(Error, Debug, PartialEq)]
pub enum SelectionError {
    #[error("no eligible parents in archive")]
    NoEligibleParents,

    #[error("invalid selection weights: {0}")]
    InvalidWeights(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FmError {
    /// Rate limits, timeouts, 5xx. Safe to retry.
    #[error("transient foundation model failure: {0}")]
    Transient(String),

    /// Auth failures, rejected requests, malformed responses.
    #[error("foundation model failure: {0}")]
    Fatal(String),
}

impl FmError {
    pub fn is_transient(&self) -> bool {
        matches!(self, FmError::Transient(_))
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SandboxError {
    /// The agent code cannot be compiled or instantiated.
    #[error("agent code failed to load: {0}")]
    LoadFailed(String),

    /// The sandbox itself cannot execute anything right now.
    #[error("sandbox unavailable: {0}")]
    Unavailable(String),
}

#[derive(Error, Debug)]
pub enum EvaluationError {
    #[error("sandbox unavailable during evaluation: {0}")]
    SandboxUnavailable(String),

    #[error("no benchmark tasks configured")]
    EmptySuite,

    #[error("evaluation workspace error at {path}: {source}")]
    Workspace {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Error, Debug)]
pub enum SelfModificationError {
    #[error("diagnosis response is not well-formed: {0}")]
    DiagnosisParse(String),

    #[error("foundation model call failed: {0}")]
    Fm(#[from] FmError),

    #[error("self-modification failed for {parent}: {reason}")]
    SelfModificationFailed { parent: AgentId, reason: String },

    #[error("parent {parent} cannot run its own code: {reason}")]
    ParentLoadFailed { parent: AgentId, reason: String },

    #[error("workspace error at {path}: {source}")]
    Workspace {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Error, Debug)]
pub enum ControllerError {
    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error(transparent)]
    Selection(#[from] SelectionError),

    #[error("seed agent is invalid: {0}")]
    InvalidSeed(String),

    #[error("seed evaluation failed: {0}")]
    SeedEvaluation(#[from] EvaluationError),

    #[error("archive is empty; bootstrap a seed agent first")]
    NotBootstrapped,

    #[error("controller is stopped")]
    Stopped,
}

impl ControllerError {
    /// Everything except an external stop halts the run until an operator
    /// intervenes; the archive stays resumable from its last commit.
    pub fn is_global_fatal(&self) -> bool {
        !matches!(self, ControllerError::Stopped)
    }
}

/// Coarse error kind carried in per-parent generation reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    DiagnosisParse,
    FoundationModel,
    SelfModification,
    SandboxUnavailable,
    Workspace,
    Configuration,
    Archive,
    /// The pipeline task panicked.
    Panicked,
}

impl From<&SelfModificationError> for FailureKind {
    fn from(err: &SelfModificationError) -> Self {
        match err {
            SelfModificationError::DiagnosisParse(_) => FailureKind::DiagnosisParse,
            SelfModificationError::Fm(_) => FailureKind::FoundationModel,
            SelfModificationError::SelfModificationFailed { .. }
            | SelfModificationError::ParentLoadFailed { .. } => FailureKind::SelfModification,
            SelfModificationError::Workspace { .. } => FailureKind::Workspace,
        }
    }
}

impl From<&EvaluationError> for FailureKind {
    fn from(err: &EvaluationError) -> Self {
        match err {
            EvaluationError::SandboxUnavailable(_) => FailureKind::SandboxUnavailable,
            EvaluationError::EmptySuite => FailureKind::Configuration,
            EvaluationError::Workspace { .. } => FailureKind::Workspace,
        }
    }
}
