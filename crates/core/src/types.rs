// crates/core/src/types.rs

//! Agent records, scores and lineage metadata.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unique identifier for an archived agent. Assigned by the archive from a
/// monotonic counter; the seed agent is always `agent_0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(pub u64);

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "agent_{}", self.0)
    }
}

impl FromStr for AgentId {
    type Err = std::num::ParseIntError;

    /// Accepts both `agent_7` and `7`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim_start_matches("agent_").parse().map(AgentId)
    }
}

/// One generation's agent as stored in the archive.
///
/// Records are created by the archive's commit operation and only ever
/// mutated by it (`children_count` on child insert, `score`/`eval_task_count`
/// on promotion).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: AgentId,
    /// Lineage back-reference; `None` only for the seed.
    pub parent_id: Option<AgentId>,
    /// Snapshot directory name relative to the archive's `agents/` root.
    pub codebase: String,
    /// Fraction of passed tasks, `None` when the agent never produced a score.
    pub score: Option<f64>,
    /// Number of benchmark tasks the score reflects.
    pub eval_task_count: usize,
    pub is_valid: bool,
    /// Number of valid children committed with this record as parent.
    pub children_count: u32,
    /// Distance from the seed in the lineage tree.
    pub generation: u32,
    /// What the self-modification that produced this agent tried to add.
    #[serde(default)]
    pub summary: String,
    pub created_at: DateTime<Utc>,
}

impl AgentRecord {
    /// Valid, scored and not yet perfect.
    pub fn is_eligible_parent(&self) -> bool {
        self.is_valid && matches!(self.score, Some(s) if s < 1.0)
    }

    /// Score used for ranking; unscored agents rank last.
    pub fn rank_score(&self) -> f64 {
        self.score.unwrap_or(f64::NEG_INFINITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(score: Option<f64>, is_valid: bool) -> AgentRecord {
        AgentRecord {
            id: AgentId(3),
            parent_id: Some(AgentId(0)),
            codebase: "agent_3".to_string(),
            score,
            eval_task_count: 10,
            is_valid,
            children_count: 0,
            generation: 1,
            summary: String::new(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_agent_id_display_and_parse() {
        assert_eq!(AgentId(12).to_string(), "agent_12");
        assert_eq!("agent_12".parse::<AgentId>().unwrap(), AgentId(12));
        assert_eq!("12".parse::<AgentId>().unwrap(), AgentId(12));
        assert!("agent_x".parse::<AgentId>().is_err());
    }

    #[test]
    fn test_eligibility() {
        assert!(record(Some(0.5), true).is_eligible_parent());
        assert!(!record(Some(1.0), true).is_eligible_parent());
        assert!(!record(None, false).is_eligible_parent());
        assert!(!record(Some(0.3), false).is_eligible_parent());
    }
}
