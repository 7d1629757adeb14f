//! Filesystem locations for gator's persistent state files.
//!
//! All state (thread registry, worktree registry, fleet presence, the
//! singleton PID file, audit logs) lives under a single state directory,
//! XDG-aware like the CLI's config directory.

use std::path::PathBuf;

/// Return the gator state directory.
///
/// Uses `$XDG_STATE_HOME/gator` if set, else `~/.local/state/gator`.
pub fn state_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_STATE_HOME") {
        return PathBuf::from(xdg).join("gator");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".local")
        .join("state")
        .join("gator")
}

/// Path to the thread registry JSON file.
pub fn thread_registry_path() -> PathBuf {
    state_dir().join("thread-registry.json")
}

/// Path to the worktree registry JSON file.
pub fn worktree_registry_path() -> PathBuf {
    state_dir().join("worktree-registry.json")
}

/// Path to the fleet presence JSON file.
pub fn presence_path() -> PathBuf {
    state_dir().join("presence.json")
}

/// Path to the per-machine instance identity file.
pub fn instance_id_path() -> PathBuf {
    state_dir().join("instance-id.json")
}

/// Path to the singleton maintenance daemon PID file.
pub fn pid_file_path() -> PathBuf {
    state_dir().join("codex-monitor.pid")
}

/// Directory under the state dir where audit logs are written.
pub fn log_dir() -> PathBuf {
    state_dir().join("logs")
}
