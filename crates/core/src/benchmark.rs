// crates/core/src/benchmark.rs

//! Declarative benchmark definitions and the ordered task suite built from them.
//!
//! A benchmark file names a set of test cases. Two shapes are accepted and
//! may be mixed in one file:
//!
//! ```yaml
//! test_cases:
//!   - function_name: reverse_with_numbers
//!     inputs: ["abc123def", "123"]
//!     expected_outputs: ["fed123cba", "123"]
//!   - input: "a1b"
//!     expected_output: "b1a"
//! ```
//!
//! Every (input, expected) pair becomes one binary pass/fail task.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;

use crate::sandbox::{TaskCheck, TaskOutcome, TaskSpec};

const DEFAULT_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Deserialize)]
struct BenchmarkFile {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    task_prompt: Option<String>,
    #[serde(default)]
    timeout: Option<u64>,
    #[serde(default = "default_scoring")]
    scoring_method: String,
    test_cases: Vec<TestCaseDef>,
}

fn default_scoring() -> String {
    "pass_fail".to_string()
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TestCaseDef {
    Batch {
        #[serde(default)]
        function_name: Option<String>,
        inputs: Vec<Value>,
        expected_outputs: Vec<Value>,
        #[serde(default)]
        timeout: Option<u64>,
    },
    Single {
        #[serde(default)]
        function_name: Option<String>,
        input: Value,
        expected_output: Value,
        #[serde(default)]
        timeout: Option<u64>,
    },
}

/// One (input, expected) pair.
#[derive(Debug, Clone, PartialEq)]
pub struct TestCase {
    pub function_name: Option<String>,
    pub input: Value,
    pub expected_output: Value,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct Benchmark {
    pub name: String,
    pub description: String,
    /// Problem statement shown to the agent; falls back to the description.
    pub task_prompt: String,
    pub test_cases: Vec<TestCase>,
}

impl Benchmark {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read benchmark {}", path.display()))?;
        let is_json = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false);
        let file: BenchmarkFile = if is_json {
            serde_json::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))?
        } else {
            serde_yaml::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))?
        };
        Self::from_file(file).with_context(|| format!("invalid benchmark {}", path.display()))
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        let file: BenchmarkFile = serde_yaml::from_str(text).context("failed to parse benchmark")?;
        Self::from_file(file)
    }

    fn from_file(file: BenchmarkFile) -> Result<Self> {
        if file.scoring_method != "pass_fail" {
            anyhow::bail!(
                "benchmark {}: unsupported scoring method {:?}",
                file.name,
                file.scoring_method
            );
        }
        let default_timeout = file.timeout.unwrap_or(DEFAULT_TIMEOUT_SECS);

        let mut test_cases = Vec::new();
        for (idx, def) in file.test_cases.into_iter().enumerate() {
            match def {
                TestCaseDef::Batch {
                    function_name,
                    inputs,
                    expected_outputs,
                    timeout,
                } => {
                    if inputs.len() != expected_outputs.len() {
                        anyhow::bail!(
                            "benchmark {}: test case {} has {} inputs but {} expected outputs",
                            file.name,
                            idx,
                            inputs.len(),
                            expected_outputs.len()
                        );
                    }
                    let timeout = Duration::from_secs(timeout.unwrap_or(default_timeout));
                    for (input, expected_output) in inputs.into_iter().zip(expected_outputs) {
                        test_cases.push(TestCase {
                            function_name: function_name.clone(),
                            input,
                            expected_output,
                            timeout,
                        });
                    }
                }
                TestCaseDef::Single {
                    function_name,
                    input,
                    expected_output,
                    timeout,
                } => test_cases.push(TestCase {
                    function_name,
                    input,
                    expected_output,
                    timeout: Duration::from_secs(timeout.unwrap_or(default_timeout)),
                }),
            }
        }

        if test_cases.is_empty() {
            anyhow::bail!("benchmark {} has no test cases", file.name);
        }

        let task_prompt = file.task_prompt.unwrap_or_else(|| file.description.clone());
        Ok(Self {
            name: file.name,
            description: file.description,
            task_prompt,
            test_cases,
        })
    }
}

/// A task ready for the sandbox, with its own time limit.
#[derive(Debug, Clone)]
pub struct BenchmarkTask {
    pub spec: TaskSpec,
    pub timeout: Duration,
}

/// Ordered concatenation of every loaded benchmark's tasks.
/// Staged subsets are prefixes of this order.
#[derive(Debug, Clone, Default)]
pub struct BenchmarkSuite {
    tasks: Vec<BenchmarkTask>,
}

impl BenchmarkSuite {
    pub fn load<P: AsRef<Path>>(paths: &[P]) -> Result<Self> {
        let benchmarks = paths
            .iter()
            .map(|p| Benchmark::load(p.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::from_benchmarks(benchmarks))
    }

    pub fn from_benchmarks(benchmarks: impl IntoIterator<Item = Benchmark>) -> Self {
        let mut tasks = Vec::new();
        for bench in benchmarks {
            for (i, case) in bench.test_cases.into_iter().enumerate() {
                tasks.push(BenchmarkTask {
                    spec: TaskSpec {
                        id: format!("{}/{}", bench.name, i),
                        problem_statement: bench.task_prompt.clone(),
                        function: case.function_name,
                        input: case.input,
                        check: TaskCheck::ExpectedOutput(case.expected_output),
                    },
                    timeout: case.timeout,
                });
            }
        }
        Self { tasks }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// The first `n` tasks (or all of them when the suite is shorter).
    pub fn prefix(&self, n: usize) -> &[BenchmarkTask] {
        &self.tasks[..n.min(self.tasks.len())]
    }

    pub fn tasks(&self) -> &[BenchmarkTask] {
        &self.tasks
    }
}

/// Fraction of passed tasks; `None` when nothing was attempted.
pub fn score(outcomes: &[TaskOutcome]) -> Option<f64> {
    if outcomes.is_empty() {
        return None;
    }
    let passed = outcomes.iter().filter(|o| o.passed).count();
    Some(passed as f64 / outcomes.len() as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const REVERSE: &str = r#"
name: reverse_with_numbers
description: Reverse a string keeping digits in place
timeout: 30
test_cases:
  - function_name: reverse_with_numbers
    inputs: ["abc123def", "123"]
    expected_outputs: ["fed123cba", "123"]
"#;

    fn outcome(task: &BenchmarkTask, passed: bool) -> TaskOutcome {
        TaskOutcome {
            task_id: task.spec.id.clone(),
            passed,
            output: String::new(),
            timed_out: false,
            duration_ms: 1,
        }
    }

    #[test]
    fn test_reverse_with_numbers_scoring() {
        let suite = BenchmarkSuite::from_benchmarks([Benchmark::from_yaml(REVERSE).unwrap()]);
        assert_eq!(suite.len(), 2);

        let tasks = suite.tasks();
        assert_eq!(tasks[0].spec.input, json!("abc123def"));
        assert_eq!(tasks[0].spec.check, TaskCheck::ExpectedOutput(json!("fed123cba")));
        assert_eq!(tasks[1].spec.check, TaskCheck::ExpectedOutput(json!("123")));
        assert_eq!(tasks[0].timeout, Duration::from_secs(30));

        let both = [outcome(&tasks[0], true), outcome(&tasks[1], true)];
        assert_eq!(score(&both), Some(1.0));

        let one = [outcome(&tasks[0], true), outcome(&tasks[1], false)];
        assert_eq!(score(&one), Some(0.5));

        assert_eq!(score(&[]), None);
    }

    #[test]
    fn test_mixed_shapes_and_prompt_fallback() {
        let bench = Benchmark::from_yaml(
            r#"
name: mixed
description: fallback prompt
test_cases:
  - input: [3, 1, 2]
    expected_output: [1, 2, 3]
    timeout: 5
  - function_name: sort
    inputs: [[2, 1]]
    expected_outputs: [[1, 2]]
"#,
        )
        .unwrap();

        assert_eq!(bench.task_prompt, "fallback prompt");
        assert_eq!(bench.test_cases.len(), 2);
        assert_eq!(bench.test_cases[0].function_name, None);
        assert_eq!(bench.test_cases[0].timeout, Duration::from_secs(5));
        assert_eq!(bench.test_cases[1].function_name.as_deref(), Some("sort"));
        assert_eq!(bench.test_cases[1].timeout, Duration::from_secs(DEFAULT_TIMEOUT_SECS));
    }

    #[test]
    fn test_mismatched_batch_is_rejected() {
        let err = Benchmark::from_yaml(
            "name: bad\ntest_cases:\n  - inputs: [1, 2]\n    expected_outputs: [1]\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("expected outputs"));
    }

    #[test]
    fn test_prefix_is_clamped() {
        let suite = BenchmarkSuite::from_benchmarks([Benchmark::from_yaml(REVERSE).unwrap()]);
        assert_eq!(suite.prefix(1).len(), 1);
        assert_eq!(suite.prefix(50).len(), 2);
    }

    #[test]
    fn test_json_file_loads_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("b.json");
        fs::write(
            &path,
            r#"{"name": "j", "test_cases": [{"input": 1, "expected_output": 2}]}"#,
        )
        .unwrap();
        let suite = BenchmarkSuite::load(&[path]).unwrap();
        assert_eq!(suite.tasks()[0].spec.id, "j/0");
    }
}
