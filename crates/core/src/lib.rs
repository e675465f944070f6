//! Darwin Gödel Machine core: an archive of self-modifying coding agents,
//! open-ended parent selection, staged benchmark evaluation and the
//! generation loop that ties them together.

pub mod archive;
pub mod benchmark;
pub mod config;
pub mod controller;
pub mod error;
pub mod evaluator;
pub mod fm;
pub mod foundry_client;
pub mod prompts;
pub mod retry;
pub mod sandbox;
pub mod selector;
pub mod self_modifier;
pub mod types;
pub mod wasm_sandbox;
pub mod workspace;

pub use archive::{Archive, ArchiveStatistics};
pub use config::DgmConfig;
pub use controller::{ControlHandle, ControlSignal, ControllerState, DgmController, GenerationSummary, RunReport};
pub use error::{ArchiveError, ControllerError, EvaluationError, FmError, SandboxError, SelectionError, SelfModificationError};
pub use types::{AgentId, AgentRecord};
