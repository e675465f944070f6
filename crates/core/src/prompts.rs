// crates/core/src/prompts.rs

//! Prompt templates for self-modification.
//!
//! The parent's codebase and evaluation log are read at runtime and
//! truncated to the configured character budgets.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::Path;

use serde_json::json;

use crate::fm::ResponseSchema;
use crate::sandbox::TaskOutcome;
use crate::self_modifier::Proposal;

pub const DIAGNOSIS_FIELDS: [&str; 5] = [
    "log_summarization",
    "potential_improvements",
    "improvement_proposal",
    "implementation_suggestion",
    "problem_description",
];

pub fn diagnosis_system_prompt() -> &'static str {
    "You are an expert software engineer reviewing a coding agent. The agent solves \
     programming tasks by editing code, and it is about to improve itself by editing its \
     own source. Your job is to find the single most valuable general capability the agent \
     is missing and describe it precisely enough that the agent can implement it. Prefer \
     improvements that help across many tasks over fixes for one benchmark case. Reply \
     with JSON only."
}

/// JSON schema of the diagnosis reply.
pub fn diagnosis_schema() -> ResponseSchema {
    let properties: serde_json::Map<String, serde_json::Value> = DIAGNOSIS_FIELDS
        .iter()
        .map(|f| (f.to_string(), json!({ "type": "string" })))
        .collect();
    ResponseSchema {
        name: "diagnosis".to_string(),
        schema: json!({
            "type": "object",
            "properties": properties,
            "required": DIAGNOSIS_FIELDS,
            "additionalProperties": false,
        }),
    }
}

/// Build the diagnosis request for one parent.
pub fn build_diagnosis_prompt(codebase: &str, evaluation_log: &str) -> String {
    format!(
        r#"## AGENT CODEBASE
{codebase}

## EVALUATION LOG
Failed tasks are listed first.
{evaluation_log}

## WHAT TO PRODUCE
Answer with a JSON object with these string fields:
- log_summarization: what the agent did on the tasks above and where it went wrong.
- potential_improvements: a list of general improvements to the agent's tools, workflow or prompts.
- improvement_proposal: the ONE improvement you recommend implementing now.
- implementation_suggestion: concrete steps to implement it in this codebase (files, functions, behaviour).
- problem_description: a self-contained problem statement for the agent, phrased as a coding task.

## RULES
- Do not propose changes that only special-case individual benchmark inputs.
- The improved agent must keep its manifest and still build the same way.
- Keep the proposal small enough to implement in one session.
"#
    )
}

/// The task handed to the parent agent to implement the proposal on itself.
pub fn build_implementation_task(proposal: &Proposal) -> String {
    format!(
        r#"You are working on your own source code, mounted at the workspace root.

## FEATURE TO ADD
{feature}

## PROBLEM STATEMENT
{problem}

## REQUIREMENTS
- Edit the files in the workspace to implement the feature.
- Rebuild the agent so the module named in agent.json reflects your change.
- Keep existing behaviour working: you must still be able to solve tasks and edit files.
- Exit successfully only when the change is complete.
"#,
        feature = proposal.feature_description,
        problem = proposal.target_problem_statement,
    )
}

/// Text files of the codebase, in path order, until `budget` characters.
pub fn render_codebase(root: &Path, budget: usize) -> io::Result<String> {
    let mut files = BTreeSet::new();
    collect_files(root, Path::new(""), &mut files)?;

    let mut out = String::new();
    let mut skipped = 0;
    for rel in files {
        let Ok(text) = fs::read_to_string(root.join(&rel)) else {
            // Binary artifacts (compiled modules) are not useful to the model.
            continue;
        };
        let section = format!("### {}\n```\n{}\n```\n\n", rel.display(), text.trim_end());
        if out.len() + section.len() > budget {
            skipped += 1;
            continue;
        }
        out.push_str(&section);
    }
    if skipped > 0 {
        out.push_str(&format!("({skipped} more files omitted)\n"));
    }
    Ok(out)
}

fn collect_files(root: &Path, rel: &Path, out: &mut BTreeSet<std::path::PathBuf>) -> io::Result<()> {
    for entry in fs::read_dir(root.join(rel))? {
        let entry = entry?;
        let name = entry.file_name();
        if name.to_string_lossy().starts_with('.') || name == "target" {
            continue;
        }
        let rel_path = rel.join(&name);
        if entry.file_type()?.is_dir() {
            collect_files(root, &rel_path, out)?;
        } else {
            out.insert(rel_path);
        }
    }
    Ok(())
}

/// One line per task outcome, failures first, until `budget` characters.
pub fn render_evaluation_log(outcomes: &[TaskOutcome], budget: usize) -> String {
    if outcomes.is_empty() {
        return "(no evaluation log recorded)\n".to_string();
    }
    let passed = outcomes.iter().filter(|o| o.passed).count();
    let mut out = format!("{passed}/{} tasks passed.\n", outcomes.len());

    let ordered = outcomes
        .iter()
        .filter(|o| !o.passed)
        .chain(outcomes.iter().filter(|o| o.passed));
    for o in ordered {
        let status = match (o.passed, o.timed_out) {
            (true, _) => "PASS",
            (false, true) => "TIMEOUT",
            (false, false) => "FAIL",
        };
        let output: String = o.output.chars().take(300).collect();
        let line = format!("- [{status}] {}: {}\n", o.task_id, output.replace('\n', " "));
        if out.len() + line.len() > budget {
            out.push_str("(log truncated)\n");
            break;
        }
        out.push_str(&line);
    }
    out
}
