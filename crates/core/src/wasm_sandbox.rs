// crates/core/src/wasm_sandbox.rs

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::Deserialize;
use wasmtime::{Config, Engine, Linker, Module, Store, Trap};
use wasmtime_wasi::pipe::{MemoryInputPipe, MemoryOutputPipe};
use wasmtime_wasi::preview1::{self, WasiP1Ctx};
use wasmtime_wasi::{DirPerms, FilePerms, WasiCtxBuilder};

use crate::config::SandboxConfig;
use crate::error::SandboxError;
use crate::sandbox::{judge, SandboxExecutor, TaskOutcome, TaskSpec, WORKSPACE_GUEST_PATH};

/// Manifest file at the root of every agent codebase.
pub const MANIFEST_FILE: &str = "agent.json";

const DEFAULT_BINARY: &str = "agent.wasm";

/// Interval between epoch ticks once a run's deadline has passed.
const INTERRUPT_TICK: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Deserialize)]
pub struct AgentManifest {
    #[serde(default = "default_binary")]
    pub binary: String,
    #[serde(default)]
    pub description: String,
}

fn default_binary() -> String {
    DEFAULT_BINARY.to_string()
}

impl Default for AgentManifest {
    fn default() -> Self {
        Self {
            binary: default_binary(),
            description: String::new(),
        }
    }
}

impl AgentManifest {
    /// Read `agent.json`; a codebase without one uses the defaults.
    pub fn load(codebase: &Path) -> Result<Self, SandboxError> {
        let path = codebase.join(MANIFEST_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(&path)
            .map_err(|e| SandboxError::LoadFailed(format!("cannot read {}: {e}", path.display())))?;
        serde_json::from_str(&raw)
            .map_err(|e| SandboxError::LoadFailed(format!("invalid {MANIFEST_FILE}: {e}")))
    }
}

/// Runs agent codebases compiled to wasm32-wasip1 under Wasmtime.
///
/// Contract:
/// - The codebase's manifest names a WASI command module (`_start`)
/// - The task payload is passed as JSON on stdin
/// - The answer is captured from stdout
/// - Editing tasks get the codebase pre-opened read/write at `/workspace`
///
/// Every run gets its own engine so that the epoch used to interrupt a
/// timed-out run cannot reach a concurrent one.
pub struct WasmSandbox {
    config: SandboxConfig,
}

impl WasmSandbox {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }
}

impl Default for WasmSandbox {
    fn default() -> Self {
        Self::new(SandboxConfig::default())
    }
}

/// How a single module execution ended.
enum RunEnd {
    Exited(i32),
    Interrupted,
    Trapped(String),
}

struct RawRun {
    end: RunEnd,
    stdout: String,
    stderr: String,
}

fn run_module(
    engine: &Engine,
    codebase: &Path,
    task: &TaskSpec,
    limits: &SandboxConfig,
) -> Result<RawRun, SandboxError> {
    let manifest = AgentManifest::load(codebase)?;
    let wasm_path = codebase.join(&manifest.binary);
    if !wasm_path.exists() {
        return Err(SandboxError::LoadFailed(format!(
            "agent module not found at {}",
            wasm_path.display()
        )));
    }

    let module = Module::from_file(engine, &wasm_path)
        .map_err(|e| SandboxError::LoadFailed(format!("failed to compile {}: {e}", wasm_path.display())))?;

    let payload = serde_json::to_vec(&task.payload())
        .map_err(|e| SandboxError::Unavailable(format!("failed to encode task payload: {e}")))?;

    let stdout_pipe = MemoryOutputPipe::new(limits.max_stdout_bytes);
    let stderr_pipe = MemoryOutputPipe::new(limits.max_stderr_bytes);

    let mut builder = WasiCtxBuilder::new();
    builder
        .stdin(MemoryInputPipe::new(bytes::Bytes::from(payload)))
        .stdout(stdout_pipe.clone())
        .stderr(stderr_pipe.clone());
    if task.edits_codebase() {
        builder
            .preopened_dir(codebase, WORKSPACE_GUEST_PATH, DirPerms::all(), FilePerms::all())
            .map_err(|e| SandboxError::Unavailable(format!("failed to mount workspace: {e}")))?;
    }
    let wasi_ctx = builder.build_p1();

    let mut store = Store::new(engine, wasi_ctx);
    store.set_epoch_deadline(1);

    let mut linker: Linker<WasiP1Ctx> = Linker::new(engine);
    preview1::add_to_linker_sync(&mut linker, |cx| cx)
        .map_err(|e| SandboxError::Unavailable(format!("failed to link WASI: {e}")))?;

    let instance = linker
        .instantiate(&mut store, &module)
        .map_err(|e| SandboxError::LoadFailed(format!("failed to instantiate agent: {e}")))?;

    let start = instance
        .get_typed_func::<(), ()>(&mut store, "_start")
        .map_err(|e| SandboxError::LoadFailed(format!("agent module missing _start: {e}")))?;

    let result = start.call(&mut store, ());

    // Drop the store to release the pipes
    drop(store);

    let stdout = String::from_utf8_lossy(&stdout_pipe.contents()).into_owned();
    let stderr = String::from_utf8_lossy(&stderr_pipe.contents()).into_owned();

    let end = match result {
        Ok(()) => RunEnd::Exited(0),
        Err(e) => {
            if let Some(exit) = e.downcast_ref::<wasmtime_wasi::I32Exit>() {
                RunEnd::Exited(exit.0)
            } else if e.downcast_ref::<Trap>() == Some(&Trap::Interrupt) {
                RunEnd::Interrupted
            } else {
                RunEnd::Trapped(e.to_string())
            }
        }
    };

    Ok(RawRun { end, stdout, stderr })
}

/// Stops the deadline timer when the run ends, and interrupts the module
/// when the caller is cancelled before it finishes.
struct Watchdog {
    engine: Engine,
    timer: tokio::task::JoinHandle<()>,
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.timer.abort();
        self.engine.increment_epoch();
    }
}

fn new_engine() -> Result<Engine, SandboxError> {
    let mut config = Config::new();
    config.epoch_interruption(true);
    Engine::new(&config).map_err(|e| SandboxError::Unavailable(format!("failed to create engine: {e}")))
}

#[async_trait::async_trait]
impl SandboxExecutor for WasmSandbox {
    async fn run_task(
        &self,
        codebase: &Path,
        task: &TaskSpec,
        timeout: Duration,
    ) -> Result<TaskOutcome, SandboxError> {
        let engine = new_engine()?;
        let started = Instant::now();

        // Keeps interrupting after the deadline so a run that starts late still stops.
        let ticker = engine.clone();
        let _watchdog = Watchdog {
            engine: engine.clone(),
            timer: tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                loop {
                    ticker.increment_epoch();
                    tokio::time::sleep(INTERRUPT_TICK).await;
                }
            }),
        };

        let codebase_buf: PathBuf = codebase.to_path_buf();
        let owned_task = task.clone();
        let limits = self.config.clone();
        let joined = tokio::task::spawn_blocking(move || {
            run_module(&engine, &codebase_buf, &owned_task, &limits)
        })
        .await;

        let raw = joined.map_err(|e| SandboxError::Unavailable(format!("sandbox worker failed: {e}")))??;
        let duration_ms = started.elapsed().as_millis() as u64;

        let outcome = match raw.end {
            RunEnd::Interrupted => {
                tracing::debug!(task = %task.id, duration_ms, "task interrupted at deadline");
                TaskOutcome::timed_out(&task.id, duration_ms)
            }
            RunEnd::Exited(0) => TaskOutcome {
                task_id: task.id.clone(),
                passed: judge(task, &raw.stdout, codebase),
                output: raw.stdout,
                timed_out: false,
                duration_ms,
            },
            RunEnd::Exited(code) => TaskOutcome {
                task_id: task.id.clone(),
                passed: false,
                output: format!("exited with code {code}: {}", tail(&raw.stderr, 2000)),
                timed_out: false,
                duration_ms,
            },
            RunEnd::Trapped(message) => TaskOutcome {
                task_id: task.id.clone(),
                passed: false,
                output: format!("trapped: {message}: {}", tail(&raw.stderr, 2000)),
                timed_out: false,
                duration_ms,
            },
        };

        Ok(outcome)
    }
}

fn tail(s: &str, max_chars: usize) -> &str {
    let count = s.chars().count();
    if count <= max_chars {
        return s;
    }
    match s.char_indices().nth(count - max_chars) {
        Some((idx, _)) => &s[idx..],
        None => s,
    }
}
