//! Richer, task-aware bookkeeping layered on top of [`WorktreeManager`].
//!
//! `WorktreeManager` is the low-level git driver: `add`/`remove`/`list
//! --porcelain`. `WorktreeRegistry` adds the ownership and lifecycle
//! contract the scheduler needs: one active worktree per branch, rebinding
//! to whichever task currently owns that branch, idle-age based pruning,
//! and a JSON-persisted view that survives process restarts.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;
use tracing::warn;

use super::{WorktreeError, WorktreeManager};

/// Lifecycle state of a registered worktree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorktreeStatus {
    /// In active use by `owner`.
    Active,
    /// Release has been requested but not yet confirmed.
    Releasing,
    /// Idle past its threshold; eligible for pruning.
    Stale,
    /// Release failed by every means; needs a maintenance sweep to retry.
    Zombie,
}

/// A worktree tracked by the registry, independent of the low-level git
/// state (which remains authoritative — see [`WorktreeRegistry::find_for_branch`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisteredWorktree {
    pub path: PathBuf,
    pub branch: String,
    pub task_key: String,
    pub owner: String,
    pub base_branch: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub status: WorktreeStatus,
    /// True if this worktree follows the dated legacy naming convention
    /// (7-day idle threshold) rather than the VK-style convention (12h).
    pub legacy_dated: bool,
}

impl RegisteredWorktree {
    fn idle_threshold(&self) -> Duration {
        if self.legacy_dated {
            Duration::days(7)
        } else {
            Duration::hours(12)
        }
    }

    fn is_idle(&self, now: DateTime<Utc>) -> bool {
        now - self.last_used_at > self.idle_threshold()
    }
}

#[derive(Default, Serialize, Deserialize)]
struct RegistryFile {
    worktrees: HashMap<String, RegisteredWorktree>,
}

/// Outcome of a [`WorktreeRegistry::prune`] pass.
#[derive(Debug, Default, Clone, Serialize)]
pub struct PruneReport {
    pub idle_removed: Vec<String>,
    pub orphans_removed: Vec<PathBuf>,
    pub vanished_evicted: Vec<String>,
    pub dry_run: bool,
}

/// Task-keyed registry of worktrees, backed by the shared git driver.
pub struct WorktreeRegistry {
    manager: WorktreeManager,
    path: PathBuf,
    entries: Mutex<HashMap<String, RegisteredWorktree>>,
    branch_locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl WorktreeRegistry {
    /// Load (or initialize) a registry backed by `manager`, persisting to
    /// `path`.
    pub fn load(manager: WorktreeManager, path: PathBuf) -> Self {
        let entries = if path.exists() {
            std::fs::read_to_string(&path)
                .ok()
                .and_then(|contents| serde_json::from_str::<RegistryFile>(&contents).ok())
                .map(|f| f.worktrees)
                .unwrap_or_default()
        } else {
            HashMap::new()
        };

        Self {
            manager,
            path,
            entries: Mutex::new(entries),
            branch_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Convenience constructor using the default state-dir location.
    pub fn load_default(manager: WorktreeManager) -> Self {
        Self::load(manager, crate::paths::worktree_registry_path())
    }

    fn persist(&self) {
        let entries = self.entries.lock().expect("worktree registry lock poisoned");
        let file = RegistryFile {
            worktrees: entries.clone(),
        };
        drop(entries);

        if let Some(parent) = self.path.parent() {
            if let Err(err) = std::fs::create_dir_all(parent) {
                warn!(error = %err, path = %parent.display(), "failed to create worktree registry directory");
                return;
            }
        }
        match serde_json::to_string_pretty(&file) {
            Ok(contents) => {
                if let Err(err) = std::fs::write(&self.path, contents) {
                    warn!(error = %err, path = %self.path.display(), "failed to persist worktree registry");
                }
            }
            Err(err) => warn!(error = %err, "failed to serialize worktree registry"),
        }
    }

    fn branch_lock(&self, branch: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.branch_locks.lock().expect("branch lock map poisoned");
        locks
            .entry(branch.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Authoritative discovery of a branch's worktree via `git worktree
    /// list --porcelain`, independent of the registry's own bookkeeping.
    pub fn find_for_branch(&self, branch: &str) -> Result<Option<PathBuf>, WorktreeError> {
        let worktrees = self.manager.list_worktrees()?;
        Ok(worktrees
            .into_iter()
            .find(|w| w.branch.as_deref() == Some(branch))
            .map(|w| w.path))
    }

    /// Acquire the worktree for `branch`, rebinding it to `task_key` if one
    /// already exists, or creating a new one under the manager's base dir.
    pub async fn acquire(
        &self,
        branch: &str,
        task_key: &str,
        owner: &str,
        base_branch: Option<&str>,
    ) -> Result<RegisteredWorktree, WorktreeError> {
        let lock = self.branch_lock(branch);
        let _guard = lock.lock().await;

        if let Some(path) = self.find_for_branch(branch)? {
            let now = Utc::now();
            let mut entries = self.entries.lock().expect("worktree registry lock poisoned");
            let entry = entries
                .entry(task_key.to_string())
                .and_modify(|e| {
                    e.owner = owner.to_string();
                    e.last_used_at = now;
                    e.status = WorktreeStatus::Active;
                })
                .or_insert_with(|| RegisteredWorktree {
                    path: path.clone(),
                    branch: branch.to_string(),
                    task_key: task_key.to_string(),
                    owner: owner.to_string(),
                    base_branch: base_branch.map(|s| s.to_string()),
                    created_at: now,
                    last_used_at: now,
                    status: WorktreeStatus::Active,
                    legacy_dated: false,
                })
                .clone();
            drop(entries);
            self.persist();
            return Ok(entry);
        }

        let info = self.manager.create_worktree(branch)?;
        let now = Utc::now();
        let registered = RegisteredWorktree {
            path: info.path,
            branch: branch.to_string(),
            task_key: task_key.to_string(),
            owner: owner.to_string(),
            base_branch: base_branch.map(|s| s.to_string()),
            created_at: now,
            last_used_at: now,
            status: WorktreeStatus::Active,
            legacy_dated: false,
        };

        let mut entries = self.entries.lock().expect("worktree registry lock poisoned");
        entries.insert(task_key.to_string(), registered.clone());
        drop(entries);
        self.persist();
        Ok(registered)
    }

    fn release_inner(&self, task_key: &str, path: &Path) -> Result<(), WorktreeError> {
        {
            let mut entries = self.entries.lock().expect("worktree registry lock poisoned");
            if let Some(entry) = entries.get_mut(task_key) {
                entry.status = WorktreeStatus::Releasing;
            }
        }
        self.persist();

        let removed = self.manager.remove_worktree(path);
        match removed {
            Ok(()) => {
                let mut entries = self.entries.lock().expect("worktree registry lock poisoned");
                entries.remove(task_key);
                drop(entries);
                self.persist();
                Ok(())
            }
            Err(err) => {
                warn!(task_key, error = %err, "git worktree remove failed, falling back to filesystem removal");
                let fs_removed = std::fs::remove_dir_all(path).is_ok();
                let _ = self.manager.cleanup_stale();
                let mut entries = self.entries.lock().expect("worktree registry lock poisoned");
                if fs_removed {
                    entries.remove(task_key);
                } else if let Some(entry) = entries.get_mut(task_key) {
                    entry.status = WorktreeStatus::Zombie;
                    warn!(task_key, path = %path.display(), "worktree release failed by every means, marking zombie for next sweep");
                }
                drop(entries);
                self.persist();
                Ok(())
            }
        }
    }

    /// Release the worktree owned by `task_key`.
    pub async fn release(&self, task_key: &str) -> Result<(), WorktreeError> {
        let path = {
            let entries = self.entries.lock().expect("worktree registry lock poisoned");
            entries.get(task_key).map(|e| (e.branch.clone(), e.path.clone()))
        };
        let Some((branch, path)) = path else {
            return Ok(());
        };
        let lock = self.branch_lock(&branch);
        let _guard = lock.lock().await;
        self.release_inner(task_key, &path)
    }

    /// Release by branch name, looking up whichever task currently owns it.
    pub async fn release_by_branch(&self, branch: &str) -> Result<(), WorktreeError> {
        let task_key = {
            let entries = self.entries.lock().expect("worktree registry lock poisoned");
            entries
                .values()
                .find(|e| e.branch == branch)
                .map(|e| e.task_key.clone())
        };
        match task_key {
            Some(task_key) => self.release(&task_key).await,
            None => Ok(()),
        }
    }

    /// Release by worktree path, looking up whichever task currently owns it.
    pub async fn release_by_path(&self, path: &Path) -> Result<(), WorktreeError> {
        let task_key = {
            let entries = self.entries.lock().expect("worktree registry lock poisoned");
            entries
                .values()
                .find(|e| e.path == path)
                .map(|e| e.task_key.clone())
        };
        match task_key {
            Some(task_key) => self.release(&task_key).await,
            None => Ok(()),
        }
    }

    /// Sweep for worktrees that should be reclaimed: idle past their
    /// threshold, registry entries whose path vanished, orphan directories
    /// under the base dir untracked by git. `dry_run` reports without
    /// mutating anything.
    pub fn prune(&self, dry_run: bool) -> Result<PruneReport, WorktreeError> {
        let mut report = PruneReport {
            dry_run,
            ..Default::default()
        };

        if !dry_run {
            let _ = self.manager.cleanup_stale();
        }

        let now = Utc::now();
        let idle_candidates: Vec<(String, PathBuf)> = {
            let entries = self.entries.lock().expect("worktree registry lock poisoned");
            entries
                .values()
                .filter(|e| e.status == WorktreeStatus::Active && e.is_idle(now))
                .map(|e| (e.task_key.clone(), e.path.clone()))
                .collect()
        };

        for (task_key, path) in idle_candidates {
            report.idle_removed.push(task_key.clone());
            if !dry_run {
                let _ = self.release_inner(&task_key, &path);
            }
        }

        // Registry entries whose path vanished out from under us (e.g.
        // removed by an operator, or a crash mid-release).
        let vanished: Vec<String> = {
            let entries = self.entries.lock().expect("worktree registry lock poisoned");
            entries
                .values()
                .filter(|e| !e.path.exists())
                .map(|e| e.task_key.clone())
                .collect()
        };
        for task_key in &vanished {
            report.vanished_evicted.push(task_key.clone());
        }
        if !dry_run && !vanished.is_empty() {
            let mut entries = self.entries.lock().expect("worktree registry lock poisoned");
            for task_key in &vanished {
                entries.remove(task_key);
            }
            drop(entries);
            self.persist();
        }

        // Orphan directories directly under the base dir that git no
        // longer tracks as a worktree.
        if let Ok(tracked) = self.manager.list_worktrees() {
            let tracked_paths: std::collections::HashSet<PathBuf> =
                tracked.into_iter().map(|w| w.path).collect();
            if let Ok(read_dir) = std::fs::read_dir(self.manager.worktree_base()) {
                for entry in read_dir.flatten() {
                    let path = entry.path();
                    if path.is_dir() && !tracked_paths.contains(&path) {
                        report.orphans_removed.push(path.clone());
                        if !dry_run {
                            let _ = std::fs::remove_dir_all(&path);
                        }
                    }
                }
            }
        }

        Ok(report)
    }

    /// Return every registered entry (for inspection/diagnostics).
    pub fn list(&self) -> Vec<RegisteredWorktree> {
        let entries = self.entries.lock().expect("worktree registry lock poisoned");
        entries.values().cloned().collect()
    }
}
