// crates/core/src/config.rs

//! Run configuration.
//!
//! Every section has defaults, so an empty file is a valid configuration.
//! `${VAR}` placeholders are expanded from the environment before parsing.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;

static ENV_PLACEHOLDER: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"\$\{([^}]+)\}").ok());

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DgmConfig {
    pub archive: ArchiveConfig,
    pub selection: SelectionConfig,
    pub evaluation: EvaluationConfig,
    pub self_modification: SelfModificationConfig,
    pub controller: ControllerConfig,
    pub retry: RetryPolicy,
    pub fm: FmConfig,
    pub sandbox: SandboxConfig,
    /// Benchmark definition files, loaded in order.
    pub benchmarks: Vec<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    pub root: PathBuf,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("archive"),
        }
    }
}

/// Parameters of the sigmoid-times-novelty parent sampling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionConfig {
    /// Sigmoid steepness.
    pub lambda: f64,
    /// Sigmoid midpoint.
    pub alpha_0: f64,
    /// Parents drawn per generation (with replacement).
    pub parents_per_iteration: usize,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            lambda: 10.0,
            alpha_0: 0.5,
            parents_per_iteration: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluationConfig {
    /// Tasks in the validity probe / stage-1 subset.
    pub validity_subset_size: usize,
    /// Tasks in the refined stage-2 subset (includes the stage-1 prefix).
    pub promotion_subset_size: usize,
    /// Stage-1 score must exceed this to be promoted.
    pub promotion_threshold: f64,
    /// Stage-1 score must rank within the archive's top M.
    pub promotion_top_m: usize,
    pub task_timeout_ms: u64,
    /// Run the code-editing canary as part of the validity probe.
    pub canary_enabled: bool,
    /// Controller-level retries when the sandbox is unavailable.
    pub sandbox_retries: u32,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            validity_subset_size: 10,
            promotion_subset_size: 50,
            promotion_threshold: 0.4,
            promotion_top_m: 5,
            task_timeout_ms: 60_000,
            canary_enabled: true,
            sandbox_retries: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SelfModificationConfig {
    /// Diagnosis requests before a parse failure is surfaced.
    pub diagnosis_attempts: u32,
    /// Fresh-workspace implementation attempts per parent.
    pub implementation_attempts: u32,
    pub implementation_timeout_ms: u64,
    /// Pipeline-owned workspaces live under this directory.
    pub workspace_root: PathBuf,
    /// Character budget for the parent's source in the diagnosis prompt.
    pub codebase_char_budget: usize,
    /// Character budget for the parent's evaluation log in the diagnosis prompt.
    pub log_char_budget: usize,
}

impl Default for SelfModificationConfig {
    fn default() -> Self {
        Self {
            diagnosis_attempts: 2,
            implementation_attempts: 2,
            implementation_timeout_ms: 30 * 60 * 1000,
            workspace_root: PathBuf::from("workspaces"),
            codebase_char_budget: 60_000,
            log_char_budget: 20_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Total generations for the run (resumed runs continue towards this).
    pub iterations: u64,
    /// Pipelines allowed to run at the same time.
    pub max_concurrency: usize,
    /// Whole-generation deadline; in-flight pipelines are cancelled past it.
    pub generation_timeout_ms: Option<u64>,
    /// Wait for an external resume signal after every generation.
    pub pause_between_generations: bool,
    /// Keep invalid candidates in the archive (excluded from selection).
    pub persist_invalid: bool,
    /// Re-check archived agents for stage-2 promotion at generation start.
    pub repromote_archived: bool,
    /// Stop once any archived agent reaches this score.
    pub target_score: Option<f64>,
    pub max_runtime_secs: Option<u64>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            iterations: 80,
            max_concurrency: 2,
            generation_timeout_ms: None,
            pause_between_generations: false,
            persist_invalid: true,
            repromote_archived: true,
            target_score: None,
            max_runtime_secs: None,
        }
    }
}

/// Foundation model endpoint. Unset values fall back to `FOUNDRY_*` env vars.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FmConfig {
    pub endpoint: Option<String>,
    pub deployment: Option<String>,
    pub api_key: Option<String>,
    pub max_output_tokens: u32,
    pub request_timeout_ms: u64,
}

impl Default for FmConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            deployment: None,
            api_key: None,
            max_output_tokens: 16_000,
            request_timeout_ms: 120_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub max_stdout_bytes: usize,
    pub max_stderr_bytes: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            max_stdout_bytes: 1024 * 1024,
            max_stderr_bytes: 64 * 1024,
        }
    }
}

impl DgmConfig {
    /// Load a YAML (`.yaml`/`.yml`) or JSON file. Relative benchmark paths are
    /// resolved against the config file's directory.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let expanded = expand_env_vars(&raw);

        let is_json = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false);
        let mut config: DgmConfig = if is_json {
            serde_json::from_str(&expanded)
                .with_context(|| format!("failed to parse {}", path.display()))?
        } else {
            serde_yaml::from_str(&expanded)
                .with_context(|| format!("failed to parse {}", path.display()))?
        };

        if let Some(base) = path.parent() {
            for bench in &mut config.benchmarks {
                if bench.is_relative() {
                    *bench = base.join(&*bench);
                }
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the loop cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.selection.parents_per_iteration == 0 {
            anyhow::bail!("selection.parents_per_iteration must be at least 1");
        }
        if self.controller.max_concurrency == 0 {
            anyhow::bail!("controller.max_concurrency must be at least 1");
        }
        if self.evaluation.validity_subset_size == 0 {
            anyhow::bail!("evaluation.validity_subset_size must be at least 1");
        }
        if self.evaluation.promotion_subset_size <= self.evaluation.validity_subset_size {
            anyhow::bail!(
                "evaluation.promotion_subset_size ({}) must exceed validity_subset_size ({})",
                self.evaluation.promotion_subset_size,
                self.evaluation.validity_subset_size
            );
        }
        if !(0.0..=1.0).contains(&self.evaluation.promotion_threshold) {
            anyhow::bail!(
                "evaluation.promotion_threshold {} outside [0, 1]",
                self.evaluation.promotion_threshold
            );
        }
        if self.retry.initial_delay_ms > self.retry.max_delay_ms {
            anyhow::bail!("retry.initial_delay_ms exceeds retry.max_delay_ms");
        }
        if !self.selection.lambda.is_finite() || !self.selection.alpha_0.is_finite() {
            anyhow::bail!("selection.lambda and selection.alpha_0 must be finite");
        }
        Ok(())
    }
}

/// Replace `${VAR}` with the variable's value; unset variables stay verbatim.
pub fn expand_env_vars(text: &str) -> String {
    let Some(re) = ENV_PLACEHOLDER.as_ref() else {
        return text.to_string();
    };
    re.replace_all(text, |caps: &regex::Captures<'_>| {
        std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
    })
    .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_yaml_uses_defaults() {
        let config: DgmConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.selection.lambda, 10.0);
        assert_eq!(config.selection.alpha_0, 0.5);
        assert_eq!(config.evaluation.validity_subset_size, 10);
        assert!(config.controller.persist_invalid);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_expansion() {
        std::env::set_var("DGM_CONFIG_TEST_KEY", "secret");
        let out = expand_env_vars("key: ${DGM_CONFIG_TEST_KEY}, other: ${DGM_SURELY_UNSET_VAR}");
        assert_eq!(out, "key: secret, other: ${DGM_SURELY_UNSET_VAR}");
    }

    #[test]
    fn test_load_yaml_resolves_benchmarks_and_validates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dgm.yaml");
        fs::write(
            &path,
            "selection:\n  parents_per_iteration: 4\nbenchmarks:\n  - benchmarks/a.yaml\n",
        )
        .unwrap();

        let config = DgmConfig::load(&path).unwrap();
        assert_eq!(config.selection.parents_per_iteration, 4);
        assert_eq!(config.benchmarks[0], dir.path().join("benchmarks/a.yaml"));
    }

    #[test]
    fn test_validate_rejects_inverted_subsets() {
        let mut config = DgmConfig::default();
        config.evaluation.promotion_subset_size = config.evaluation.validity_subset_size;
        assert!(config.validate().is_err());

        let mut config = DgmConfig::default();
        config.selection.parents_per_iteration = 0;
        assert!(config.validate().is_err());
    }
}
