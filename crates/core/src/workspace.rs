// crates/core/src/workspace.rs

//! Pipeline-owned scratch directories and candidate codebases.
//!
//! A [`Workspace`] deletes its directory when dropped unless the archive has
//! taken it. Cancelling a pipeline therefore never leaves a half-built agent
//! behind.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use serde::Serialize;

use crate::types::AgentId;

static WORKSPACE_SEQ: AtomicU64 = AtomicU64::new(0);

/// Recursively copy `src` into `dst`, creating `dst` if needed.
pub fn copy_dir_recursive(src: &Path, dst: &Path) -> io::Result<()> {
    fs::create_dir_all(dst)?;

    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());

        if entry.file_type()?.is_dir() {
            copy_dir_recursive(&src_path, &dst_path)?;
        } else {
            fs::copy(&src_path, &dst_path)?;
        }
    }

    Ok(())
}

/// A directory that is removed on drop unless persisted.
#[derive(Debug)]
pub struct Workspace {
    path: PathBuf,
    persisted: bool,
}

impl Workspace {
    /// Create an empty uniquely named directory under `root`.
    pub fn create(root: &Path, label: &str) -> io::Result<Self> {
        let name = format!(
            "{label}_{}_{}_{}",
            Utc::now().format("%Y%m%d%H%M%S%3f"),
            std::process::id(),
            WORKSPACE_SEQ.fetch_add(1, Ordering::Relaxed)
        );
        let path = root.join(name);
        fs::create_dir_all(&path)?;
        Ok(Self {
            path,
            persisted: false,
        })
    }

    /// Create a workspace holding a copy of `source`.
    pub fn copy_of(root: &Path, label: &str, source: &Path) -> io::Result<Self> {
        let ws = Self::create(root, label)?;
        copy_dir_recursive(source, &ws.path)?;
        Ok(ws)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Move the directory to `dest`; after this the workspace no longer
    /// deletes anything on drop.
    pub fn persist_to(&mut self, dest: &Path) -> io::Result<()> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        if fs::rename(&self.path, dest).is_err() {
            // Different filesystem: fall back to copy + remove.
            copy_dir_recursive(&self.path, dest)?;
            let _ = fs::remove_dir_all(&self.path);
        }
        self.path = dest.to_path_buf();
        self.persisted = true;
        Ok(())
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if !self.persisted {
            if let Err(e) = fs::remove_dir_all(&self.path) {
                if e.kind() != io::ErrorKind::NotFound {
                    tracing::warn!(path = %self.path.display(), error = %e, "failed to remove workspace");
                }
            }
        }
    }
}

/// File-level difference between two codebase directories.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CodebaseDiff {
    pub added: Vec<PathBuf>,
    pub modified: Vec<PathBuf>,
    pub removed: Vec<PathBuf>,
}

impl CodebaseDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.removed.is_empty()
    }

    pub fn changed_files(&self) -> usize {
        self.added.len() + self.modified.len() + self.removed.len()
    }
}

fn list_files(root: &Path, rel: &Path, out: &mut BTreeSet<PathBuf>) -> io::Result<()> {
    for entry in fs::read_dir(root.join(rel))? {
        let entry = entry?;
        let rel_path = rel.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            list_files(root, &rel_path, out)?;
        } else {
            out.insert(rel_path);
        }
    }
    Ok(())
}

/// Compare `after` to `before` file by file.
pub fn diff_dirs(before: &Path, after: &Path) -> io::Result<CodebaseDiff> {
    let mut old = BTreeSet::new();
    let mut new = BTreeSet::new();
    list_files(before, Path::new(""), &mut old)?;
    list_files(after, Path::new(""), &mut new)?;

    let mut diff = CodebaseDiff::default();
    for path in &new {
        if !old.contains(path) {
            diff.added.push(path.clone());
        } else if fs::read(before.join(path))? != fs::read(after.join(path))? {
            diff.modified.push(path.clone());
        }
    }
    diff.removed = old.difference(&new).cloned().collect();
    Ok(diff)
}

/// An unvalidated child codebase produced by self-modification.
#[derive(Debug)]
pub struct CandidateCodebase {
    workspace: Workspace,
    pub parent: AgentId,
    /// Feature description of the proposal that produced this candidate.
    pub summary: String,
    pub diff: CodebaseDiff,
}

impl CandidateCodebase {
    pub fn new(workspace: Workspace, parent: AgentId, summary: String, diff: CodebaseDiff) -> Self {
        Self {
            workspace,
            parent,
            summary,
            diff,
        }
    }

    pub fn path(&self) -> &Path {
        self.workspace.path()
    }

    pub(crate) fn workspace_mut(&mut self) -> &mut Workspace {
        &mut self.workspace
    }
}
