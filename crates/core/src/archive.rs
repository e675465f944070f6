// crates/core/src/archive.rs

//! Durable, append-only store of every agent the run has produced.
//!
//! Layout under the archive root:
//!
//! ```text
//! archive/
//!   index.json            records, next id, committed generations
//!   agents/agent_<id>/    immutable codebase snapshot
//!   logs/agent_<id>.json  per-task outcomes of the agent's latest evaluation
//! ```
//!
//! All mutation goes through a single write lock; `index.json` is rewritten
//! atomically (temp file + rename) on every commit, so a restart always sees
//! the last fully committed state.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::ArchiveError;
use crate::sandbox::TaskOutcome;
use crate::types::{AgentId, AgentRecord};
use crate::workspace::Workspace;

const INDEX_FILE: &str = "index.json";
const AGENTS_DIR: &str = "agents";
const LOGS_DIR: &str = "logs";
const INDEX_VERSION: u32 = 1;

/// Everything needed to commit a new agent, minus the id the archive assigns.
#[derive(Debug, Clone)]
pub struct NewAgent {
    pub parent_id: Option<AgentId>,
    pub score: Option<f64>,
    pub eval_task_count: usize,
    pub is_valid: bool,
    pub summary: String,
    pub outcomes: Vec<TaskOutcome>,
}

#[derive(Debug, Serialize, Deserialize)]
struct IndexFile {
    version: u32,
    next_id: u64,
    #[serde(default)]
    iterations_completed: u64,
    agents: Vec<AgentRecord>,
}

#[derive(Debug, Clone, Default)]
struct ArchiveState {
    next_id: u64,
    iterations_completed: u64,
    records: BTreeMap<AgentId, AgentRecord>,
}

impl ArchiveState {
    /// The seed's child that `id` descends from, or `id` itself at generation one.
    fn branch_root(&self, id: AgentId) -> Option<AgentId> {
        let mut current = self.records.get(&id)?;
        while let Some(parent) = current.parent_id.and_then(|p| self.records.get(&p)) {
            if parent.parent_id.is_none() {
                return Some(current.id);
            }
            current = parent;
        }
        None
    }

    fn to_index(&self) -> IndexFile {
        IndexFile {
            version: INDEX_VERSION,
            next_id: self.next_id,
            iterations_completed: self.iterations_completed,
            agents: self.records.values().cloned().collect(),
        }
    }

    fn from_index(index: IndexFile) -> Result<Self, ArchiveError> {
        if index.version != INDEX_VERSION {
            return Err(ArchiveError::Corrupt(format!(
                "unsupported index version {}",
                index.version
            )));
        }
        let mut records = BTreeMap::new();
        for record in index.agents {
            if records.insert(record.id, record).is_some() {
                return Err(ArchiveError::Corrupt("duplicate agent id".to_string()));
            }
        }
        let state = Self {
            next_id: index.next_id,
            iterations_completed: index.iterations_completed,
            records,
        };
        state.check_invariants()?;
        Ok(state)
    }

    /// Parent references resolve, children counts match, ids below `next_id`.
    fn check_invariants(&self) -> Result<(), ArchiveError> {
        let mut valid_children: HashMap<AgentId, u32> = HashMap::new();
        let mut seeds = 0;

        for record in self.records.values() {
            if record.id.0 >= self.next_id {
                return Err(ArchiveError::Corrupt(format!(
                    "{} is not below next id {}",
                    record.id, self.next_id
                )));
            }
            if let Some(score) = record.score {
                if !(0.0..=1.0).contains(&score) {
                    return Err(ArchiveError::Corrupt(format!("{} has score {score}", record.id)));
                }
            }
            match record.parent_id {
                None => seeds += 1,
                Some(parent) => {
                    if !self.records.contains_key(&parent) {
                        return Err(ArchiveError::Corrupt(format!(
                            "{} references missing parent {parent}",
                            record.id
                        )));
                    }
                    if record.is_valid {
                        *valid_children.entry(parent).or_default() += 1;
                    }
                }
            }
        }

        if seeds > 1 {
            return Err(ArchiveError::Corrupt(format!("{seeds} seed agents")));
        }

        for record in self.records.values() {
            let expected = valid_children.get(&record.id).copied().unwrap_or(0);
            if record.children_count != expected {
                return Err(ArchiveError::Corrupt(format!(
                    "{} records {} children, found {expected}",
                    record.id, record.children_count
                )));
            }
        }
        Ok(())
    }
}

/// Aggregate view of the archive.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArchiveStatistics {
    pub total_agents: usize,
    pub valid_agents: usize,
    pub invalid_agents: usize,
    pub best_score: Option<f64>,
    pub mean_score: Option<f64>,
    pub max_generation: u32,
    pub iterations_completed: u64,
    /// Population standard deviation of the scored agents.
    pub score_std_dev: Option<f64>,
    /// Direct children of the seed whose subtree holds a valid agent.
    pub lineage_branches: usize,
    /// Valid agents without valid children: the open frontier.
    pub leaf_agents: usize,
}

pub struct Archive {
    root: PathBuf,
    state: RwLock<ArchiveState>,
}

impl Archive {
    /// Open (or create) the archive under `root`, validating the stored index.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, ArchiveError> {
        let root = root.as_ref().to_path_buf();
        for dir in [root.join(AGENTS_DIR), root.join(LOGS_DIR)] {
            fs::create_dir_all(&dir).map_err(|e| ArchiveError::storage(&dir, e))?;
        }

        let index_path = root.join(INDEX_FILE);
        let state = if index_path.exists() {
            let raw = fs::read_to_string(&index_path)
                .map_err(|e| ArchiveError::storage(&index_path, e))?;
            let index: IndexFile = serde_json::from_str(&raw)
                .map_err(|e| ArchiveError::Corrupt(format!("cannot parse {INDEX_FILE}: {e}")))?;
            ArchiveState::from_index(index)?
        } else {
            ArchiveState::default()
        };

        for record in state.records.values() {
            let snapshot = root.join(AGENTS_DIR).join(&record.codebase);
            if !snapshot.exists() {
                warn!(agent = %record.id, path = %snapshot.display(), "snapshot missing");
            }
        }

        info!(
            root = %root.display(),
            agents = state.records.len(),
            iterations = state.iterations_completed,
            "archive opened"
        );

        Ok(Self {
            root,
            state: RwLock::new(state),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Commit a new agent: move its snapshot in, write its evaluation log and
    /// persist the index. Either everything lands or the archive is unchanged.
    pub fn insert(&self, agent: NewAgent, snapshot: &mut Workspace) -> Result<AgentId, ArchiveError> {
        if let Some(score) = agent.score {
            if !(0.0..=1.0).contains(&score) {
                return Err(ArchiveError::InvalidScore(score));
            }
        }

        let mut state = self.state.write();

        let generation = match agent.parent_id {
            None if !state.records.is_empty() => return Err(ArchiveError::SeedAlreadyPresent),
            None => 0,
            Some(parent) => match state.records.get(&parent) {
                Some(p) => p.generation + 1,
                None => return Err(ArchiveError::InvalidParentReference(parent)),
            },
        };

        let id = AgentId(state.next_id);
        let record = AgentRecord {
            id,
            parent_id: agent.parent_id,
            codebase: id.to_string(),
            score: if agent.is_valid { agent.score } else { None },
            eval_task_count: if agent.is_valid { agent.eval_task_count } else { 0 },
            is_valid: agent.is_valid,
            children_count: 0,
            generation,
            summary: agent.summary,
            created_at: Utc::now(),
        };

        let mut next = state.clone();
        next.next_id += 1;
        if record.is_valid {
            if let Some(parent) = record.parent_id.and_then(|p| next.records.get_mut(&p)) {
                parent.children_count += 1;
            }
        }
        next.records.insert(id, record.clone());

        let snapshot_path = self.root.join(AGENTS_DIR).join(&record.codebase);
        if let Err(e) = snapshot.persist_to(&snapshot_path) {
            let _ = fs::remove_dir_all(&snapshot_path);
            return Err(ArchiveError::storage(&snapshot_path, e));
        }

        let committed = self
            .write_log(id, &agent.outcomes)
            .and_then(|()| self.write_index(&next));
        if let Err(e) = committed {
            let _ = fs::remove_dir_all(&snapshot_path);
            let _ = fs::remove_file(self.log_path(id));
            return Err(e);
        }

        *state = next;
        info!(
            agent = %id,
            parent = ?record.parent_id.map(|p| p.to_string()),
            generation = record.generation,
            score = ?record.score,
            valid = record.is_valid,
            "agent committed"
        );
        Ok(id)
    }

    pub fn get(&self, id: AgentId) -> Result<AgentRecord, ArchiveError> {
        self.state
            .read()
            .records
            .get(&id)
            .cloned()
            .ok_or(ArchiveError::NotFound(id))
    }

    /// Valid agents that still have room to improve (`score < 1.0`).
    pub fn eligible_for_selection(&self) -> Vec<AgentRecord> {
        self.state
            .read()
            .records
            .values()
            .filter(|r| r.is_eligible_parent())
            .cloned()
            .collect()
    }

    /// Upgrade a score after evaluation on a larger task subset.
    ///
    /// A smaller task count than stored is a regression. The same count is
    /// accepted only as an idempotent retry carrying the identical score.
    pub fn update_score(&self, id: AgentId, score: f64, eval_task_count: usize) -> Result<(), ArchiveError> {
        if !(0.0..=1.0).contains(&score) {
            return Err(ArchiveError::InvalidScore(score));
        }

        let mut state = self.state.write();
        let current = state.records.get(&id).ok_or(ArchiveError::NotFound(id))?;

        if eval_task_count < current.eval_task_count {
            return Err(ArchiveError::ScoreRegression {
                id,
                stored_count: current.eval_task_count,
                new_count: eval_task_count,
            });
        }
        if eval_task_count == current.eval_task_count {
            if current.score == Some(score) {
                return Ok(());
            }
            return Err(ArchiveError::ScoreRegression {
                id,
                stored_count: current.eval_task_count,
                new_count: eval_task_count,
            });
        }

        let mut next = state.clone();
        if let Some(record) = next.records.get_mut(&id) {
            record.score = Some(score);
            record.eval_task_count = eval_task_count;
        }
        self.write_index(&next)?;
        *state = next;

        info!(agent = %id, score, eval_task_count, "score updated");
        Ok(())
    }

    /// Replace an agent's evaluation log (after promotion).
    pub fn record_evaluation_log(&self, id: AgentId, outcomes: &[TaskOutcome]) -> Result<(), ArchiveError> {
        let state = self.state.write();
        if !state.records.contains_key(&id) {
            return Err(ArchiveError::NotFound(id));
        }
        self.write_log(id, outcomes)
    }

    pub fn evaluation_log(&self, id: AgentId) -> Result<Vec<TaskOutcome>, ArchiveError> {
        self.get(id)?;
        let path = self.log_path(id);
        match fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw)
                .map_err(|e| ArchiveError::Corrupt(format!("cannot parse {}: {e}", path.display()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(ArchiveError::storage(&path, e)),
        }
    }

    pub fn snapshot_path(&self, id: AgentId) -> Result<PathBuf, ArchiveError> {
        let record = self.get(id)?;
        Ok(self.root.join(AGENTS_DIR).join(record.codebase))
    }

    /// All records in id order.
    pub fn records(&self) -> Vec<AgentRecord> {
        self.state.read().records.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.state.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().records.is_empty()
    }

    /// Best `n` valid, scored agents: highest score first, then the score
    /// backed by more tasks, then the older agent.
    pub fn top_agents(&self, n: usize) -> Vec<AgentRecord> {
        let mut scored: Vec<AgentRecord> = self
            .state
            .read()
            .records
            .values()
            .filter(|r| r.is_valid && r.score.is_some())
            .cloned()
            .collect();
        scored.sort_by(|a, b| {
            b.rank_score()
                .total_cmp(&a.rank_score())
                .then(b.eval_task_count.cmp(&a.eval_task_count))
                .then(a.id.cmp(&b.id))
        });
        scored.truncate(n);
        scored
    }

    /// Scores of the best `m` agents, descending.
    pub fn top_scores(&self, m: usize) -> Vec<f64> {
        self.top_agents(m).iter().filter_map(|r| r.score).collect()
    }

    /// Ancestor chain from the seed down to `id` (inclusive).
    pub fn lineage(&self, id: AgentId) -> Result<Vec<AgentRecord>, ArchiveError> {
        let state = self.state.read();
        let mut chain = Vec::new();
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            let record = state
                .records
                .get(&current)
                .ok_or(ArchiveError::NotFound(current))?;
            chain.push(record.clone());
            cursor = record.parent_id;
            if chain.len() > state.records.len() {
                return Err(ArchiveError::Corrupt(format!("lineage cycle through {current}")));
            }
        }
        chain.reverse();
        Ok(chain)
    }

    /// Every agent descended from `id`, breadth first.
    pub fn descendants(&self, id: AgentId) -> Result<Vec<AgentRecord>, ArchiveError> {
        let state = self.state.read();
        if !state.records.contains_key(&id) {
            return Err(ArchiveError::NotFound(id));
        }
        let mut children: HashMap<AgentId, Vec<AgentId>> = HashMap::new();
        for record in state.records.values() {
            if let Some(parent) = record.parent_id {
                children.entry(parent).or_default().push(record.id);
            }
        }

        let mut out = Vec::new();
        let mut queue: VecDeque<AgentId> = children.get(&id).cloned().unwrap_or_default().into();
        while let Some(next) = queue.pop_front() {
            if let Some(record) = state.records.get(&next) {
                out.push(record.clone());
            }
            if let Some(grandchildren) = children.get(&next) {
                queue.extend(grandchildren);
            }
        }
        Ok(out)
    }

    pub fn statistics(&self) -> ArchiveStatistics {
        let state = self.state.read();
        let valid = state.records.values().filter(|r| r.is_valid).count();
        let scores: Vec<f64> = state.records.values().filter_map(|r| r.score).collect();
        let mean_score = (!scores.is_empty()).then(|| scores.iter().sum::<f64>() / scores.len() as f64);
        let score_std_dev = mean_score.map(|mean| {
            let variance = scores.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / scores.len() as f64;
            variance.sqrt()
        });

        let branches: BTreeSet<AgentId> = state
            .records
            .values()
            .filter(|r| r.is_valid && r.parent_id.is_some())
            .filter_map(|r| state.branch_root(r.id))
            .collect();

        ArchiveStatistics {
            total_agents: state.records.len(),
            valid_agents: valid,
            invalid_agents: state.records.len() - valid,
            best_score: scores.iter().copied().reduce(f64::max),
            mean_score,
            max_generation: state.records.values().map(|r| r.generation).max().unwrap_or(0),
            iterations_completed: state.iterations_completed,
            score_std_dev,
            lineage_branches: branches.len(),
            leaf_agents: state
                .records
                .values()
                .filter(|r| r.is_valid && r.children_count == 0)
                .count(),
        }
    }

    pub fn iterations_completed(&self) -> u64 {
        self.state.read().iterations_completed
    }

    /// Durably record that `iterations` generations have been fully admitted.
    pub fn commit_iteration(&self, iterations: u64) -> Result<(), ArchiveError> {
        let mut state = self.state.write();
        if iterations < state.iterations_completed {
            return Err(ArchiveError::Corrupt(format!(
                "iteration counter moving backwards ({} -> {iterations})",
                state.iterations_completed
            )));
        }
        let mut next = state.clone();
        next.iterations_completed = iterations;
        self.write_index(&next)?;
        *state = next;
        Ok(())
    }

    /// Dump statistics and all records as pretty JSON.
    pub fn export(&self, path: impl AsRef<Path>) -> Result<(), ArchiveError> {
        let path = path.as_ref();
        let dump = serde_json::json!({
            "root": self.root,
            "exported_at": Utc::now(),
            "statistics": self.statistics(),
            "agents": self.records(),
        });
        let text = serde_json::to_string_pretty(&dump)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| ArchiveError::storage(parent, e))?;
        }
        fs::write(path, text).map_err(|e| ArchiveError::storage(path, e))
    }

    /// Delete every archive artifact under `root`. Other files are left alone.
    pub fn reset(root: impl AsRef<Path>) -> Result<(), ArchiveError> {
        let root = root.as_ref();
        for dir in [AGENTS_DIR, LOGS_DIR, "reports"] {
            let path = root.join(dir);
            if path.exists() {
                fs::remove_dir_all(&path).map_err(|e| ArchiveError::storage(&path, e))?;
            }
        }
        let index = root.join(INDEX_FILE);
        if index.exists() {
            fs::remove_file(&index).map_err(|e| ArchiveError::storage(&index, e))?;
        }
        info!(root = %root.display(), "archive reset");
        Ok(())
    }

    fn log_path(&self, id: AgentId) -> PathBuf {
        self.root.join(LOGS_DIR).join(format!("{id}.json"))
    }

    fn write_log(&self, id: AgentId, outcomes: &[TaskOutcome]) -> Result<(), ArchiveError> {
        let text = serde_json::to_string_pretty(outcomes)?;
        write_atomic(&self.log_path(id), text.as_bytes())
    }

    fn write_index(&self, state: &ArchiveState) -> Result<(), ArchiveError> {
        let text = serde_json::to_string_pretty(&state.to_index())?;
        write_atomic(&self.root.join(INDEX_FILE), text.as_bytes())
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), ArchiveError> {
    let tmp = path.with_extension("json.tmp");
    let mut file = fs::File::create(&tmp).map_err(|e| ArchiveError::storage(&tmp, e))?;
    file.write_all(bytes)
        .and_then(|()| file.sync_all())
        .map_err(|e| ArchiveError::storage(&tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| ArchiveError::storage(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixture {
        _dir: tempfile::TempDir,
        scratch: PathBuf,
        archive: Archive,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let scratch = dir.path().join("workspaces");
            fs::create_dir_all(&scratch).unwrap();
            let archive = Archive::open(dir.path().join("archive")).unwrap();
            Self {
                _dir: dir,
                scratch,
                archive,
            }
        }

        fn snapshot(&self) -> Workspace {
            let ws = Workspace::create(&self.scratch, "candidate").unwrap();
            fs::write(ws.path().join("agent.json"), "{}").unwrap();
            ws
        }

        fn add(&self, parent: Option<AgentId>, score: Option<f64>, valid: bool) -> Result<AgentId, ArchiveError> {
            let mut ws = self.snapshot();
            self.archive.insert(
                NewAgent {
                    parent_id: parent,
                    score,
                    eval_task_count: 10,
                    is_valid: valid,
                    summary: "test".to_string(),
                    outcomes: Vec::new(),
                },
                &mut ws,
            )
        }
    }

    #[test]
    fn test_children_count_tracks_valid_children_only() {
        let f = Fixture::new();
        let seed = f.add(None, Some(0.5), true).unwrap();
        let a = f.add(Some(seed), Some(0.6), true).unwrap();
        f.add(Some(seed), None, false).unwrap();
        f.add(Some(a), Some(0.7), true).unwrap();
        f.add(Some(seed), Some(0.2), true).unwrap();

        let records = f.archive.records();
        for r in &records {
            let expected = records
                .iter()
                .filter(|c| c.parent_id == Some(r.id) && c.is_valid)
                .count() as u32;
            assert_eq!(r.children_count, expected, "{}", r.id);
        }
        assert_eq!(f.archive.get(seed).unwrap().children_count, 2);
    }

    #[test]
    fn test_invalid_parent_and_second_seed_rejected() {
        let f = Fixture::new();
        assert!(matches!(
            f.add(Some(AgentId(9)), Some(0.5), true),
            Err(ArchiveError::InvalidParentReference(AgentId(9)))
        ));
        f.add(None, Some(0.5), true).unwrap();
        assert!(matches!(
            f.add(None, Some(0.5), true),
            Err(ArchiveError::SeedAlreadyPresent)
        ));
        assert_eq!(f.archive.len(), 1);
    }

    #[test]
    fn test_rejected_insert_leaves_no_snapshot() {
        let f = Fixture::new();
        f.add(None, Some(0.5), true).unwrap();
        let mut ws = f.snapshot();
        let ws_path = ws.path().to_path_buf();
        let err = f.archive.insert(
            NewAgent {
                parent_id: Some(AgentId(0)),
                score: Some(1.5),
                eval_task_count: 10,
                is_valid: true,
                summary: String::new(),
                outcomes: Vec::new(),
            },
            &mut ws,
        );
        assert!(matches!(err, Err(ArchiveError::InvalidScore(_))));
        drop(ws);
        assert!(!ws_path.exists());
        assert!(!f.archive.root().join("agents/agent_1").exists());
    }

    #[test]
    fn test_get_missing_is_not_found() {
        let f = Fixture::new();
        assert!(matches!(f.archive.get(AgentId(3)), Err(ArchiveError::NotFound(AgentId(3)))));
    }

    #[test]
    fn test_invalid_candidate_is_stored_but_not_eligible() {
        let f = Fixture::new();
        let seed = f.add(None, Some(0.5), true).unwrap();
        let bad = f.add(Some(seed), Some(0.9), false).unwrap();

        let stored = f.archive.get(bad).unwrap();
        assert!(!stored.is_valid);
        assert_eq!(stored.score, None);
        let eligible: Vec<AgentId> = f.archive.eligible_for_selection().iter().map(|r| r.id).collect();
        assert_eq!(eligible, vec![seed]);
    }

    #[test]
    fn test_perfect_score_not_eligible() {
        let f = Fixture::new();
        let seed = f.add(None, Some(0.5), true).unwrap();
        f.add(Some(seed), Some(1.0), true).unwrap();
        assert_eq!(f.archive.eligible_for_selection().len(), 1);
    }

    #[test]
    fn test_update_score_is_monotonic_and_idempotent() {
        let f = Fixture::new();
        let seed = f.add(None, Some(0.5), true).unwrap();

        f.archive.update_score(seed, 0.62, 50).unwrap();
        // Same stage, same value: idempotent retry.
        f.archive.update_score(seed, 0.62, 50).unwrap();
        let r = f.archive.get(seed).unwrap();
        assert_eq!((r.score, r.eval_task_count), (Some(0.62), 50));

        assert!(matches!(
            f.archive.update_score(seed, 0.9, 10),
            Err(ArchiveError::ScoreRegression { stored_count: 50, new_count: 10, .. })
        ));
        assert!(matches!(
            f.archive.update_score(seed, 0.7, 50),
            Err(ArchiveError::ScoreRegression { .. })
        ));
        assert_eq!(f.archive.get(seed).unwrap().score, Some(0.62));
    }

    #[test]
    fn test_reopen_restores_committed_state() {
        let f = Fixture::new();
        let seed = f.add(None, Some(0.5), true).unwrap();
        let child = f.add(Some(seed), Some(0.7), true).unwrap();
        f.archive.commit_iteration(1).unwrap();

        let reopened = Archive::open(f.archive.root()).unwrap();
        assert_eq!(reopened.len(), 2);
        assert_eq!(reopened.iterations_completed(), 1);
        assert_eq!(reopened.get(seed).unwrap().children_count, 1);
        assert!(reopened.snapshot_path(child).unwrap().join("agent.json").exists());

        // Ids keep counting from where the run stopped.
        let mut ws = f.snapshot();
        let next = reopened
            .insert(
                NewAgent {
                    parent_id: Some(child),
                    score: Some(0.8),
                    eval_task_count: 10,
                    is_valid: true,
                    summary: String::new(),
                    outcomes: Vec::new(),
                },
                &mut ws,
            )
            .unwrap();
        assert_eq!(next, AgentId(2));
    }

    #[test]
    fn test_corrupt_children_count_detected() {
        let f = Fixture::new();
        let seed = f.add(None, Some(0.5), true).unwrap();
        f.add(Some(seed), Some(0.7), true).unwrap();

        let index_path = f.archive.root().join(INDEX_FILE);
        let raw = fs::read_to_string(&index_path).unwrap();
        let mut index: IndexFile = serde_json::from_str(&raw).unwrap();
        index.agents[0].children_count = 5;
        fs::write(&index_path, serde_json::to_string(&index).unwrap()).unwrap();

        assert!(matches!(Archive::open(f.archive.root()), Err(ArchiveError::Corrupt(_))));
    }

    #[test]
    fn test_lineage_descendants_and_statistics() {
        let f = Fixture::new();
        let seed = f.add(None, Some(0.2), true).unwrap();
        let a = f.add(Some(seed), Some(0.4), true).unwrap();
        let b = f.add(Some(a), Some(0.8), true).unwrap();
        let c = f.add(Some(seed), None, false).unwrap();

        let chain: Vec<AgentId> = f.archive.lineage(b).unwrap().iter().map(|r| r.id).collect();
        assert_eq!(chain, vec![seed, a, b]);

        let desc: Vec<AgentId> = f.archive.descendants(seed).unwrap().iter().map(|r| r.id).collect();
        assert_eq!(desc, vec![a, c, b]);

        let stats = f.archive.statistics();
        assert_eq!(stats.total_agents, 4);
        assert_eq!(stats.valid_agents, 3);
        assert_eq!(stats.invalid_agents, 1);
        assert_eq!(stats.best_score, Some(0.8));
        assert_eq!(stats.max_generation, 2);

        assert_eq!(f.archive.top_scores(2), vec![0.8, 0.4]);
    }

    #[test]
    fn test_diversity_counts_branches_and_frontier() {
        let f = Fixture::new();
        assert_eq!(f.archive.statistics().score_std_dev, None);

        let seed = f.add(None, Some(0.2), true).unwrap();
        let stats = f.archive.statistics();
        assert_eq!((stats.lineage_branches, stats.leaf_agents), (0, 1));
        assert_eq!(stats.score_std_dev, Some(0.0));

        let a = f.add(Some(seed), Some(0.4), true).unwrap();
        f.add(Some(seed), Some(0.6), true).unwrap();
        f.add(Some(a), Some(0.8), true).unwrap();
        // An invalid branch adds no diversity.
        f.add(Some(seed), None, false).unwrap();

        let stats = f.archive.statistics();
        assert_eq!(stats.lineage_branches, 2);
        assert_eq!(stats.leaf_agents, 2);
        let sd = stats.score_std_dev.unwrap();
        assert!((sd - 0.05f64.sqrt()).abs() < 1e-9, "std dev {sd}");
    }

    #[test]
    fn test_evaluation_log_round_trip_and_reset() {
        let f = Fixture::new();
        let seed = f.add(None, Some(0.5), true).unwrap();
        assert!(f.archive.evaluation_log(seed).unwrap().is_empty());

        let outcome = TaskOutcome {
            task_id: "t/0".into(),
            passed: false,
            output: "wrong".into(),
            timed_out: false,
            duration_ms: 3,
        };
        f.archive.record_evaluation_log(seed, &[outcome.clone()]).unwrap();
        assert_eq!(f.archive.evaluation_log(seed).unwrap(), vec![outcome]);

        let export = f.archive.root().join("export/dump.json");
        f.archive.export(&export).unwrap();
        assert!(fs::read_to_string(&export).unwrap().contains("agent_0"));

        Archive::reset(f.archive.root()).unwrap();
        assert!(Archive::open(f.archive.root()).unwrap().is_empty());
    }
}
