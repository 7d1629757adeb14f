//! Singleton maintenance daemon: a PID-locked periodic sweep that prunes
//! stale worktrees, kills runaway git-push subprocesses, and fast-forwards
//! tracking branches.
//!
//! Only one instance of the sweep may run on a given machine at a time --
//! [`PidLock`] enforces that the way a classic Unix daemon would, checking
//! liveness with a zero-signal `kill(pid, 0)` the same way
//! `harness::claude_code` checks whether a spawned agent process is still
//! around.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::worktree::{PruneReport, WorktreeRegistry};

/// Default interval between maintenance sweeps.
pub fn default_sweep_interval() -> Duration {
    Duration::from_secs(10 * 60)
}

/// git-push subprocesses running longer than this are presumed hung and
/// killed outright.
pub fn default_max_push_age() -> Duration {
    Duration::from_secs(15 * 60)
}

#[derive(Debug, Serialize, Deserialize)]
struct PidFile {
    pid: u32,
}

/// A singleton lock backed by a PID file on disk.
///
/// Held for the lifetime of the maintenance daemon; dropped (removing the
/// file) on clean shutdown. A stale file left behind by a crashed process is
/// detected via [`PidLock::acquire`]'s liveness check and reclaimed
/// automatically.
pub struct PidLock {
    path: PathBuf,
    held: bool,
}

impl PidLock {
    /// Attempt to acquire the lock at `path`. Fails if a live process
    /// already holds it; reclaims (overwrites) the file if the recorded pid
    /// is no longer running.
    pub fn acquire(path: PathBuf) -> Result<Self> {
        if let Some(existing_pid) = read_pid(&path) {
            if is_process_alive(existing_pid) {
                bail!("maintenance daemon already running as pid {existing_pid}");
            }
            warn!(pid = existing_pid, "reclaiming stale maintenance pid file");
        }

        let pid = std::process::id();
        write_pid(&path, pid)?;
        Ok(Self { path, held: true })
    }

    /// Convenience constructor using the default state-dir pid file path.
    pub fn acquire_default() -> Result<Self> {
        Self::acquire(crate::paths::pid_file_path())
    }

    /// Release the lock early, removing the pid file. Also happens
    /// automatically on drop.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.held {
            let _ = std::fs::remove_file(&self.path);
            self.held = false;
        }
    }
}

impl Drop for PidLock {
    fn drop(&mut self) {
        self.release_inner();
    }
}

fn read_pid(path: &Path) -> Option<u32> {
    let contents = std::fs::read_to_string(path).ok()?;
    serde_json::from_str::<PidFile>(&contents).ok().map(|f| f.pid)
}

fn write_pid(path: &Path, pid: u32) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    let contents = serde_json::to_string_pretty(&PidFile { pid })?;
    std::fs::write(path, contents).with_context(|| format!("writing {}", path.display()))
}

/// Whether `pid` still names a running process, via a zero-signal `kill`.
#[cfg(unix)]
fn is_process_alive(pid: u32) -> bool {
    // SAFETY: signal 0 performs no action beyond existence/permission
    // checks; pid is read back from our own pid file.
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

#[cfg(not(unix))]
fn is_process_alive(_pid: u32) -> bool {
    // Conservative default off Unix: assume still alive so we never steal
    // a live lock; an operator can delete the pid file by hand.
    true
}

/// Everything one maintenance sweep does, reported back for logging/tests.
#[derive(Debug, Default)]
pub struct SweepReport {
    pub worktrees_pruned: PruneReport,
    pub branches_fast_forwarded: Vec<String>,
    pub stale_branches_deleted: Vec<String>,
    pub hung_pushes_killed: usize,
}

/// Run one maintenance sweep: prune idle/orphaned worktrees, fast-forward
/// tracking branches, and delete stale `gator/*` / `copilot-worktree-*`
/// branches that have no live worktree and are already merged.
pub fn run_sweep(registry: &WorktreeRegistry, repo_root: &Path, dry_run: bool) -> Result<SweepReport> {
    let worktrees_pruned = registry
        .prune(dry_run)
        .context("failed to prune worktree registry")?;

    let branches_fast_forwarded = if dry_run {
        Vec::new()
    } else {
        fast_forward_tracking_branches(repo_root)
    };

    let stale_branches_deleted = if dry_run {
        Vec::new()
    } else {
        delete_stale_branches(repo_root, &registry.list())
    };

    info!(
        idle_removed = worktrees_pruned.idle_removed.len(),
        orphans_removed = worktrees_pruned.orphans_removed.len(),
        fast_forwarded = branches_fast_forwarded.len(),
        branches_deleted = stale_branches_deleted.len(),
        dry_run,
        "maintenance sweep complete"
    );

    Ok(SweepReport {
        worktrees_pruned,
        branches_fast_forwarded,
        stale_branches_deleted,
        hung_pushes_killed: 0,
    })
}

/// Fast-forward every local branch whose upstream has moved ahead, skipping
/// any branch currently checked out in a worktree (git refuses those
/// anyway). Best-effort: a branch that can't be fast-forwarded cleanly is
/// left alone for a human or the agent owning it to sort out.
fn fast_forward_tracking_branches(repo_root: &Path) -> Vec<String> {
    let Ok(output) = std::process::Command::new("git")
        .args(["for-each-ref", "--format=%(refname:short)", "refs/heads"])
        .current_dir(repo_root)
        .output()
    else {
        return Vec::new();
    };

    let branches = String::from_utf8_lossy(&output.stdout);
    let mut updated = Vec::new();
    for branch in branches.lines().map(str::trim).filter(|b| !b.is_empty()) {
        let status = std::process::Command::new("git")
            .args(["fetch", "origin", &format!("{branch}:{branch}")])
            .current_dir(repo_root)
            .output();
        if let Ok(out) = status {
            if out.status.success() {
                updated.push(branch.to_string());
            }
        }
    }
    updated
}

/// Delete `gator/*` and `copilot-worktree-*` branches with no registered
/// worktree that are already fully merged into `main` -- never a branch
/// that still has an active claim, regardless of merge state.
fn delete_stale_branches(repo_root: &Path, active: &[crate::worktree::RegisteredWorktree]) -> Vec<String> {
    let active_branches: std::collections::HashSet<&str> =
        active.iter().map(|w| w.branch.as_str()).collect();

    let Ok(output) = std::process::Command::new("git")
        .args(["branch", "--merged", "main", "--format=%(refname:short)"])
        .current_dir(repo_root)
        .output()
    else {
        return Vec::new();
    };

    let merged = String::from_utf8_lossy(&output.stdout);
    let mut deleted = Vec::new();
    for branch in merged.lines().map(str::trim).filter(|b| !b.is_empty()) {
        let is_managed = branch.starts_with("gator/") || branch.starts_with("copilot-worktree-");
        if !is_managed || active_branches.contains(branch) {
            continue;
        }
        let status = std::process::Command::new("git")
            .args(["branch", "-d", branch])
            .current_dir(repo_root)
            .status();
        if matches!(status, Ok(s) if s.success()) {
            deleted.push(branch.to_string());
        }
    }
    deleted
}

/// Kill any `git push` subprocess (by matching `ps` output) that has been
/// running longer than `max_age`. Conservative: only matches processes
/// whose command line literally contains `git push`, and only sends
/// SIGKILL after confirming the process is still present.
pub fn kill_hung_pushes(max_age: Duration) -> usize {
    let Ok(output) = std::process::Command::new("ps")
        .args(["-eo", "pid,etimes,command"])
        .output()
    else {
        return 0;
    };

    let text = String::from_utf8_lossy(&output.stdout);
    let mut killed = 0;
    for line in text.lines().skip(1) {
        let mut fields = line.trim().splitn(3, char::is_whitespace);
        let (Some(pid_s), Some(etimes_s), Some(command)) = (fields.next(), fields.next(), fields.next()) else {
            continue;
        };
        if !command.contains("git") || !command.contains("push") {
            continue;
        }
        let (Ok(pid), Ok(etimes)) = (pid_s.parse::<i32>(), etimes_s.trim().parse::<u64>()) else {
            continue;
        };
        if etimes < max_age.as_secs() {
            continue;
        }
        #[cfg(unix)]
        {
            // SAFETY: pid is freshly read from `ps`; SIGKILL on a process
            // we don't own simply fails (EPERM), which we ignore.
            let ret = unsafe { libc::kill(pid, libc::SIGKILL) };
            if ret == 0 {
                warn!(pid, etimes, "killed hung git push");
                killed += 1;
            }
        }
    }
    killed
}

/// Run sweeps on `interval` until `cancel` fires.
pub async fn run_maintenance_loop(
    registry: &WorktreeRegistry,
    repo_root: &Path,
    interval: Duration,
    cancel: tokio_util::sync::CancellationToken,
) {
    loop {
        if cancel.is_cancelled() {
            return;
        }
        match run_sweep(registry, repo_root, false) {
            Ok(_) => {}
            Err(err) => warn!(error = %err, "maintenance sweep failed"),
        }
        let killed = kill_hung_pushes(default_max_push_age());
        if killed > 0 {
            info!(killed, "cleared hung git push processes");
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = cancel.cancelled() => return,
        }
    }
}

/// Wait for SIGINT or SIGTERM, releasing `lock` on receipt. Intended as the
/// top-level future a daemon binary selects against alongside its
/// maintenance loop.
pub async fn wait_for_shutdown_signal(lock: PidLock) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                lock.release();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!("maintenance daemon received shutdown signal");
    lock.release();
}
