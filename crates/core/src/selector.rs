// crates/core/src/selector.rs

//! Parent selection: sigmoid-scaled performance times a novelty bonus.
//!
//! For every eligible agent `i`:
//!
//! ```text
//! s_i = 1 / (1 + exp(-λ (α_i - α_0)))
//! h_i = 1 / (1 + n_i)            n_i = children_count
//! p_i = s_i h_i / Σ_j s_j h_j
//! ```
//!
//! `k` parents are drawn independently from `p`, with replacement.

use parking_lot::Mutex;
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::archive::Archive;
use crate::config::SelectionConfig;
use crate::error::SelectionError;
use crate::types::{AgentId, AgentRecord};

/// Unnormalized selection weight. Strictly positive for finite inputs in range.
pub fn selection_weight(score: f64, children_count: u32, lambda: f64, alpha_0: f64) -> f64 {
    let s = 1.0 / (1.0 + (-lambda * (score - alpha_0)).exp());
    let h = 1.0 / (1.0 + children_count as f64);
    s * h
}

pub struct ParentSelector {
    lambda: f64,
    alpha_0: f64,
    rng: Mutex<StdRng>,
}

impl ParentSelector {
    pub fn new(config: &SelectionConfig) -> Self {
        Self::with_rng(config, StdRng::from_entropy())
    }

    /// Deterministic sampling, for tests and reproducible runs.
    pub fn with_seed(config: &SelectionConfig, seed: u64) -> Self {
        Self::with_rng(config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(config: &SelectionConfig, rng: StdRng) -> Self {
        Self {
            lambda: config.lambda,
            alpha_0: config.alpha_0,
            rng: Mutex::new(rng),
        }
    }

    /// Normalized selection probability for each eligible agent.
    pub fn probabilities(&self, eligible: &[AgentRecord]) -> Result<Vec<(AgentId, f64)>, SelectionError> {
        let weights = self.weights(eligible)?;
        let total: f64 = weights.iter().sum();
        Ok(eligible
            .iter()
            .zip(weights)
            .map(|(r, w)| (r.id, w / total))
            .collect())
    }

    /// Draw `k` parents from the archive's eligible agents.
    pub fn select(&self, archive: &Archive, k: usize) -> Result<Vec<AgentRecord>, SelectionError> {
        let eligible = archive.eligible_for_selection();
        self.sample(&eligible, k)
    }

    /// Draw `k` agents from `eligible` with replacement.
    pub fn sample(&self, eligible: &[AgentRecord], k: usize) -> Result<Vec<AgentRecord>, SelectionError> {
        let weights = self.weights(eligible)?;
        let dist = WeightedIndex::new(&weights).map_err(|e| SelectionError::InvalidWeights(e.to_string()))?;

        let mut rng = self.rng.lock();
        let picked: Vec<AgentRecord> = (0..k).map(|_| eligible[dist.sample(&mut *rng)].clone()).collect();

        tracing::debug!(
            candidates = eligible.len(),
            picked = ?picked.iter().map(|r| r.id.to_string()).collect::<Vec<_>>(),
            "parents selected"
        );
        Ok(picked)
    }

    fn weights(&self, eligible: &[AgentRecord]) -> Result<Vec<f64>, SelectionError> {
        if eligible.is_empty() {
            return Err(SelectionError::NoEligibleParents);
        }
        eligible
            .iter()
            .map(|r| {
                let score = r.score.ok_or_else(|| {
                    SelectionError::InvalidWeights(format!("{} has no score", r.id))
                })?;
                let w = selection_weight(score, r.children_count, self.lambda, self.alpha_0);
                if w.is_finite() && w > 0.0 {
                    Ok(w)
                } else {
                    Err(SelectionError::InvalidWeights(format!("{} has weight {w}", r.id)))
                }
            })
            .collect()
    }
}
