// crates/host/src/log.rs

//! Tracing setup and colored console summaries.

use std::fmt::Display;

use dgm_core::controller::{GenerationSummary, PipelineOutcome, RunReport};
use dgm_core::types::AgentRecord;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// ANSI color codes
const RESET: &str = "\x1b[0m";
const BOLD: &str = "\x1b[1m";
const DIM: &str = "\x1b[2m";

const RED: &str = "\x1b[31m";
const GREEN: &str = "\x1b[32m";
const YELLOW: &str = "\x1b[33m";
const MAGENTA: &str = "\x1b[35m";
const CYAN: &str = "\x1b[36m";

/// `RUST_LOG` wins over the verbosity flag.
pub fn init(verbose: u8) {
    let filter = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn score(score: Option<f64>) -> String {
    score.map(|s| format!("{s:.3}")).unwrap_or_else(|| "-".to_string())
}

/// One block per generation: a line per parent pipeline, then totals.
pub fn generation(summary: &GenerationSummary) {
    let flag = if summary.interrupted {
        format!(" {YELLOW}(interrupted){RESET}")
    } else if summary.timed_out {
        format!(" {YELLOW}(timed out){RESET}")
    } else {
        String::new()
    };
    eprintln!("{MAGENTA}{BOLD}[Generation {}]{RESET}{flag}", summary.generation);

    for p in &summary.promotions {
        eprintln!(
            "  {CYAN}↑ {}{RESET} re-scored {} -> {} {DIM}({} tasks){RESET}",
            p.agent,
            score(p.previous_score),
            score(Some(p.score)),
            p.eval_task_count
        );
    }

    for report in &summary.reports {
        let parent = format!("{} ({})", report.parent, score(report.parent_score));
        match &report.outcome {
            PipelineOutcome::Admitted {
                id,
                score: s,
                is_valid: true,
                eval_task_count,
                promoted,
            } => {
                let stage = if *promoted { " promoted" } else { "" };
                eprintln!(
                    "  {GREEN}✓{RESET} {parent} -> {BOLD}{id}{RESET} score {} {DIM}({eval_task_count} tasks{stage}){RESET}",
                    score(*s)
                );
            }
            PipelineOutcome::Admitted { id, .. } => {
                eprintln!("  {YELLOW}✗{RESET} {parent} -> {id} {DIM}invalid, kept for lineage{RESET}");
            }
            PipelineOutcome::Discarded { reason } => {
                eprintln!("  {YELLOW}✗{RESET} {parent} {DIM}discarded: {}{RESET}", truncate(reason, 120));
            }
            PipelineOutcome::Failed { kind, message } => {
                eprintln!("  {RED}✗{RESET} {parent} {RED}{kind:?}{RESET}: {DIM}{}{RESET}", truncate(message, 120));
            }
            PipelineOutcome::Cancelled => {
                eprintln!("  {YELLOW}…{RESET} {parent} {DIM}cancelled{RESET}");
            }
        }
    }

    eprintln!(
        "  {DIM}archive: {} agents, best {}, {:.1}s{RESET}",
        summary.archive_size,
        score(summary.best_score),
        summary.duration_ms as f64 / 1000.0
    );
}

pub fn run_report(report: &RunReport) {
    eprintln!("{BOLD}Run finished{RESET} {DIM}({:?}){RESET}", report.stop_reason);
    eprintln!(
        "  generations {}, agents {} ({} valid), improvements {} ({:.0}%), failed pipelines {}",
        report.generations_run,
        report.agents_created,
        report.valid_agents_created,
        report.improvements,
        report.improvement_rate * 100.0,
        report.failed_pipelines
    );
    eprintln!(
        "  {DIM}lineage branches {}, frontier {}, score spread {}{RESET}",
        report.archive.lineage_branches,
        report.archive.leaf_agents,
        score(report.archive.score_std_dev)
    );
    agents("Top agents", &report.top_agents);
}

/// Table of agents, one per line.
pub fn agents(title: &str, records: &[AgentRecord]) {
    eprintln!("{BOLD}{title}{RESET}");
    for r in records {
        let parent = r.parent_id.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string());
        let status = if r.is_valid {
            format!("{GREEN}valid{RESET}")
        } else {
            format!("{RED}invalid{RESET}")
        };
        eprintln!(
            "  {BOLD}{:<10}{RESET} score {:<6} {DIM}tasks {:<3} gen {:<3} parent {:<10} children {}{RESET} {status} {DIM}{}{RESET}",
            r.id.to_string(),
            score(r.score),
            r.eval_task_count,
            r.generation,
            parent,
            r.children_count,
            truncate(&r.summary, 60)
        );
    }
}

pub fn info(message: impl Display) {
    eprintln!("{DIM}[info]{RESET} {}", message);
}

pub fn warn(message: impl Display) {
    eprintln!("{YELLOW}[warn]{RESET} {}", message);
}

pub fn success(message: impl Display) {
    eprintln!("{GREEN}[ok]{RESET} {}", message);
}

/// Single-line preview, cut on a char boundary.
fn truncate(s: &str, max: usize) -> String {
    let clean: String = s
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect();
    let trimmed = clean.trim();
    if trimmed.chars().count() > max {
        format!("{}...", trimmed.chars().take(max).collect::<String>())
    } else {
        trimmed.to_string()
    }
}
