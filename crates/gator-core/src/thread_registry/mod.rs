//! Persistent registry of per-task agent SDK threads/sessions.
//!
//! Harness SDKs that support resumable sessions (thread IDs) let an attempt
//! continue a conversation across multiple turns instead of re-establishing
//! context from scratch. The registry tracks one [`AgentThread`] per
//! `task_key` and enforces the invariants that keep a long-lived session
//! from silently degrading: a cap on turn count, a maximum wall-clock age,
//! and a maximum idle gap.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Maximum number of turns a thread may be resumed for before it is retired.
pub const MAX_TURN_COUNT: u32 = 30;

/// Maximum wall-clock age of a thread, regardless of activity.
fn max_wall_age() -> Duration {
    Duration::hours(8)
}

/// Maximum time a thread may sit idle before it is considered stale.
fn max_idle_age() -> Duration {
    Duration::hours(4)
}

/// A single agent SDK session bound to a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentThread {
    /// SDK-assigned session/thread identifier. `None` if the SDK has not
    /// yet produced one (e.g. the first turn hasn't completed).
    pub thread_id: Option<String>,
    /// Name of the harness SDK this thread belongs to (e.g. "claude-code").
    pub sdk: String,
    /// Task this thread is bound to.
    pub task_key: String,
    /// Working directory (worktree path) the thread was created in.
    pub working_dir: PathBuf,
    /// Number of turns resumed on this thread so far.
    pub turn_count: u32,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub last_error: Option<String>,
    /// Whether this thread is still eligible to be resumed.
    pub alive: bool,
}

impl AgentThread {
    fn new(task_key: &str, sdk: &str, working_dir: PathBuf) -> Self {
        let now = Utc::now();
        Self {
            thread_id: None,
            sdk: sdk.to_string(),
            task_key: task_key.to_string(),
            working_dir,
            turn_count: 0,
            created_at: now,
            last_used_at: now,
            last_error: None,
            alive: true,
        }
    }

    /// Check the §3 invariants (turn count, wall age, idle age) and flip
    /// `alive` to false if any is violated. Returns `true` if the thread
    /// is still usable.
    fn enforce_invariants(&mut self, now: DateTime<Utc>) -> bool {
        if !self.alive {
            return false;
        }
        if self.turn_count > MAX_TURN_COUNT {
            self.alive = false;
        } else if now - self.created_at > max_wall_age() {
            self.alive = false;
        } else if now - self.last_used_at > max_idle_age() {
            self.alive = false;
        }
        self.alive
    }
}

#[derive(Default, Serialize, Deserialize)]
struct RegistryFile {
    threads: HashMap<String, AgentThread>,
}

/// Persistent, invariant-enforcing store of [`AgentThread`]s keyed by
/// `task_key`.
pub struct ThreadRegistry {
    path: PathBuf,
    threads: Mutex<HashMap<String, AgentThread>>,
}

impl ThreadRegistry {
    /// Load the registry from `path`, dropping (and persisting the removal
    /// of) any record that already violates the invariants.
    pub fn load(path: PathBuf) -> Self {
        let mut file = if path.exists() {
            std::fs::read_to_string(&path)
                .ok()
                .and_then(|contents| serde_json::from_str::<RegistryFile>(&contents).ok())
                .unwrap_or_default()
        } else {
            RegistryFile::default()
        };

        let now = Utc::now();
        file.threads.retain(|task_key, thread| {
            let keep = thread.enforce_invariants(now);
            if !keep {
                warn!(task_key, "dropping stale agent thread on load");
            }
            keep
        });

        let registry = Self {
            path,
            threads: Mutex::new(file.threads),
        };
        registry.persist();
        registry
    }

    /// Convenience constructor using the default state-dir location.
    pub fn load_default() -> Self {
        Self::load(crate::paths::thread_registry_path())
    }

    fn persist(&self) {
        let threads = self.threads.lock().expect("thread registry lock poisoned");
        let file = RegistryFile {
            threads: threads.clone(),
        };
        drop(threads);

        if let Some(parent) = self.path.parent() {
            if let Err(err) = std::fs::create_dir_all(parent) {
                warn!(error = %err, path = %parent.display(), "failed to create thread registry directory");
                return;
            }
        }
        match serde_json::to_string_pretty(&file) {
            Ok(contents) => {
                if let Err(err) = std::fs::write(&self.path, contents) {
                    warn!(error = %err, path = %self.path.display(), "failed to persist thread registry");
                }
            }
            Err(err) => warn!(error = %err, "failed to serialize thread registry"),
        }
    }

    /// Return a still-alive thread for `task_key`, if one exists and still
    /// satisfies the invariants. A violating thread is invalidated as a
    /// side effect.
    pub fn get(&self, task_key: &str) -> Option<AgentThread> {
        let mut threads = self.threads.lock().expect("thread registry lock poisoned");
        let now = Utc::now();
        let alive = threads
            .get_mut(task_key)
            .map(|t| t.enforce_invariants(now))
            .unwrap_or(false);
        let result = if alive {
            threads.get(task_key).cloned()
        } else {
            None
        };
        drop(threads);
        self.persist();
        result
    }

    /// Record a turn against `task_key`'s thread, creating one if absent.
    pub fn record_turn(
        &self,
        task_key: &str,
        sdk: &str,
        working_dir: PathBuf,
        thread_id: Option<String>,
    ) {
        let mut threads = self.threads.lock().expect("thread registry lock poisoned");
        let entry = threads
            .entry(task_key.to_string())
            .or_insert_with(|| AgentThread::new(task_key, sdk, working_dir.clone()));
        entry.turn_count += 1;
        entry.last_used_at = Utc::now();
        if thread_id.is_some() {
            entry.thread_id = thread_id;
        }
        entry.enforce_invariants(Utc::now());
        drop(threads);
        self.persist();
    }

    /// Record an error against a thread without necessarily killing it.
    pub fn record_error(&self, task_key: &str, error: impl Into<String>) {
        let mut threads = self.threads.lock().expect("thread registry lock poisoned");
        if let Some(thread) = threads.get_mut(task_key) {
            thread.last_error = Some(error.into());
        }
        drop(threads);
        self.persist();
    }

    /// Mark a thread dead without deleting its record (keeps the audit
    /// trail of why it was retired).
    pub fn invalidate(&self, task_key: &str) {
        let mut threads = self.threads.lock().expect("thread registry lock poisoned");
        if let Some(thread) = threads.get_mut(task_key) {
            thread.alive = false;
        }
        drop(threads);
        self.persist();
    }

    /// Abandon a still-alive thread and force the next resume to start a
    /// fresh session. This is the only sanctioned way to do so outside the
    /// invariant checks, because skipping those checks needs an explicit
    /// audit trail.
    pub fn force_new(&self, task_key: &str, reason: &str) {
        warn!(task_key, reason, "forcing new agent thread");
        self.invalidate(task_key);
    }

    /// Remove a task's thread record entirely.
    pub fn clear(&self, task_key: &str) {
        let mut threads = self.threads.lock().expect("thread registry lock poisoned");
        threads.remove(task_key);
        drop(threads);
        self.persist();
    }

    /// Drop every thread that currently violates the invariants. Returns
    /// the number of threads removed.
    pub fn prune(&self) -> usize {
        let mut threads = self.threads.lock().expect("thread registry lock poisoned");
        let now = Utc::now();
        let before = threads.len();
        threads.retain(|_, thread| thread.enforce_invariants(now));
        let removed = before - threads.len();
        drop(threads);
        if removed > 0 {
            self.persist();
        }
        removed
    }

    /// List every thread still marked alive.
    pub fn list_active(&self) -> Vec<AgentThread> {
        let threads = self.threads.lock().expect("thread registry lock poisoned");
        threads.values().filter(|t| t.alive).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn registry_path(dir: &TempDir) -> PathBuf {
        dir.path().join("thread-registry.json")
    }

    #[test]
    fn record_turn_creates_and_persists_thread() {
        let dir = TempDir::new().unwrap();
        let path = registry_path(&dir);
        let registry = ThreadRegistry::load(path.clone());

        registry.record_turn(
            "task-1",
            "claude-code",
            PathBuf::from("/tmp/wt"),
            Some("sdk-thread-abc".to_string()),
        );

        let thread = registry.get("task-1").expect("thread should exist");
        assert_eq!(thread.turn_count, 1);
        assert_eq!(thread.thread_id.as_deref(), Some("sdk-thread-abc"));
        assert!(path.exists());

        let reloaded = ThreadRegistry::load(path);
        let thread = reloaded.get("task-1").expect("thread should survive reload");
        assert_eq!(thread.turn_count, 1);
    }

    #[test]
    fn turn_count_over_max_kills_thread() {
        let dir = TempDir::new().unwrap();
        let registry = ThreadRegistry::load(registry_path(&dir));

        for _ in 0..=MAX_TURN_COUNT {
            registry.record_turn("task-2", "claude-code", PathBuf::from("/tmp/wt"), None);
        }

        assert!(registry.get("task-2").is_none());
    }

    #[test]
    fn stale_thread_dropped_on_load() {
        let dir = TempDir::new().unwrap();
        let path = registry_path(&dir);

        let mut stale = AgentThread::new("task-3", "claude-code", PathBuf::from("/tmp/wt"));
        stale.created_at = Utc::now() - Duration::hours(9);
        stale.last_used_at = stale.created_at;

        let mut file = RegistryFile::default();
        file.threads.insert("task-3".to_string(), stale);
        std::fs::write(&path, serde_json::to_string(&file).unwrap()).unwrap();

        let registry = ThreadRegistry::load(path);
        assert!(registry.get("task-3").is_none());
    }

    #[test]
    fn force_new_invalidates_without_deleting() {
        let dir = TempDir::new().unwrap();
        let registry = ThreadRegistry::load(registry_path(&dir));
        registry.record_turn("task-4", "claude-code", PathBuf::from("/tmp/wt"), None);

        registry.force_new("task-4", "thread corrupted mid-turn");

        assert!(registry.get("task-4").is_none());
        let active = registry.list_active();
        assert!(active.is_empty());
    }

    #[test]
    fn prune_removes_only_violating_threads() {
        let dir = TempDir::new().unwrap();
        let registry = ThreadRegistry::load(registry_path(&dir));
        registry.record_turn("fresh", "claude-code", PathBuf::from("/tmp/wt"), None);
        registry.record_turn("stale", "claude-code", PathBuf::from("/tmp/wt"), None);
        {
            let mut threads = registry.threads.lock().unwrap();
            threads.get_mut("stale").unwrap().last_used_at = Utc::now() - Duration::hours(5);
        }

        let removed = registry.prune();
        assert_eq!(removed, 1);
        assert!(registry.get("stale").is_none());
        assert!(registry.get("fresh").is_some());
    }
}
