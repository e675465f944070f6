mod log;

use std::fs;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;

use dgm_core::archive::Archive;
use dgm_core::benchmark::BenchmarkSuite;
use dgm_core::config::DgmConfig;
use dgm_core::controller::{ControlHandle, ControlSignal, DgmController, RunReport};
use dgm_core::foundry_client::FoundryClient;
use dgm_core::types::AgentId;
use dgm_core::wasm_sandbox::WasmSandbox;

#[derive(Parser)]
#[command(name = "dgm", about = "Darwin Gödel Machine: open-ended evolution of self-improving coding agents")]
struct Cli {
    /// -v for debug, -vv for trace. RUST_LOG overrides.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Bootstrap the seed (if needed) and run generations.
    Run {
        #[arg(long)]
        config: PathBuf,
        /// Seed agent codebase; only read when the archive is empty.
        #[arg(long)]
        seed: PathBuf,
        /// Override `controller.iterations`.
        #[arg(long)]
        iterations: Option<u64>,
    },
    /// Archive statistics and top agents.
    Status {
        #[arg(long)]
        archive: PathBuf,
        #[arg(long, default_value_t = 10)]
        top: usize,
    },
    /// Dump the archive index as JSON.
    Export {
        #[arg(long)]
        archive: PathBuf,
        #[arg(long)]
        out: PathBuf,
    },
    /// Ancestor chain of an agent, seed first.
    Lineage {
        #[arg(long)]
        archive: PathBuf,
        /// `agent_7` or `7`.
        id: AgentId,
    },
    /// Delete every agent, log and report under the archive root.
    Reset {
        #[arg(long)]
        archive: PathBuf,
        #[arg(long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    log::init(cli.verbose);

    match cli.command {
        Command::Run {
            config,
            seed,
            iterations,
        } => run(&config, &seed, iterations).await,
        Command::Status { archive, top } => status(&archive, top),
        Command::Export { archive, out } => {
            let archive = open_archive(&archive)?;
            archive.export(&out)?;
            log::success(format!("exported {} agents to {}", archive.len(), out.display()));
            Ok(())
        }
        Command::Lineage { archive, id } => {
            let archive = open_archive(&archive)?;
            let chain = archive.lineage(id)?;
            log::agents(&format!("Lineage of {id}"), &chain);
            Ok(())
        }
        Command::Reset { archive, yes } => {
            if !yes {
                bail!("refusing to reset {} without --yes", archive.display());
            }
            Archive::reset(&archive)?;
            log::success(format!("archive {} reset", archive.display()));
            Ok(())
        }
    }
}

fn open_archive(root: &Path) -> Result<Archive> {
    Archive::open(root).with_context(|| format!("failed to open archive {}", root.display()))
}

fn status(root: &Path, top: usize) -> Result<()> {
    let archive = open_archive(root)?;
    let stats = archive.statistics();
    println!("{}", serde_json::to_string_pretty(&stats)?);
    log::agents(&format!("Top {top} agents"), &archive.top_agents(top));
    Ok(())
}

async fn run(config_path: &Path, seed: &Path, iterations: Option<u64>) -> Result<()> {
    let mut config = DgmConfig::load(config_path)?;
    if let Some(n) = iterations {
        config.controller.iterations = n;
    }

    let suite = BenchmarkSuite::load(&config.benchmarks)?;
    if suite.is_empty() {
        bail!("no benchmark tasks configured in {}", config_path.display());
    }
    log::info(format!("loaded {} benchmark tasks", suite.len()));

    let archive = Arc::new(open_archive(&config.archive.root)?);
    let fm = FoundryClient::from_config(&config.fm)?;
    let sandbox = WasmSandbox::new(config.sandbox.clone());

    let controller = DgmController::new(
        &config,
        archive.clone(),
        Arc::new(fm),
        Arc::new(sandbox),
        Arc::new(suite),
    );

    match controller.bootstrap(seed).await? {
        Some(id) => log::success(format!("seed archived as {id}")),
        None => log::info(format!(
            "resuming: {} agents, {} generations completed",
            archive.len(),
            archive.iterations_completed()
        )),
    }

    let handle = controller.handle();
    tokio::spawn(stop_on_ctrl_c(handle.clone()));
    if config.controller.pause_between_generations {
        tokio::spawn(prompt_when_paused(handle));
    }

    let report = controller.run_with(log::generation).await;
    let report = match report {
        Ok(report) => report,
        Err(e) => {
            // The archive is resumable from its last committed generation.
            log::warn(format!("run halted: {e}"));
            let report = controller.report();
            write_report(archive.root(), &report)?;
            return Err(e.into());
        }
    };

    let path = write_report(archive.root(), &report)?;
    log::run_report(&report);
    log::success(format!("report written to {}", path.display()));
    Ok(())
}

async fn stop_on_ctrl_c(handle: ControlHandle) {
    if tokio::signal::ctrl_c().await.is_ok() {
        log::warn("stop requested, cancelling in-flight pipelines");
        handle.stop();
    }
}

/// Stdin lines on a plain thread, which never holds up runtime shutdown.
fn stdin_lines() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

/// Ask on stdin whether to continue each time the controller pauses.
async fn prompt_when_paused(handle: ControlHandle) {
    let mut signals = handle.subscribe();
    let mut lines = stdin_lines();

    while signals.changed().await.is_ok() {
        let signal = *signals.borrow_and_update();
        if signal != ControlSignal::Pause {
            continue;
        }
        eprint!("Generation done. Type 'continue' or 'stop': ");
        loop {
            let Some(line) = lines.recv().await else {
                // stdin closed: nobody can resume, so stop cleanly.
                handle.stop();
                return;
            };
            match line.trim().to_ascii_lowercase().as_str() {
                "continue" | "c" | "" => {
                    handle.resume();
                    break;
                }
                "stop" | "s" | "quit" => {
                    handle.stop();
                    return;
                }
                other => eprint!("unknown answer '{other}', type 'continue' or 'stop': "),
            }
        }
    }
}

fn write_report(archive_root: &Path, report: &RunReport) -> Result<PathBuf> {
    let dir = archive_root.join("reports");
    fs::create_dir_all(&dir).with_context(|| format!("failed to create {}", dir.display()))?;
    let path = dir.join(format!(
        "dgm_report_{}.json",
        report.finished_at.format("%Y%m%d_%H%M%S")
    ));
    let json = serde_json::to_string_pretty(report)?;
    fs::write(&path, json).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(path)
}
