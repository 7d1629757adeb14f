//! Shared test helpers for the CLI crate.
//!
//! Tests across `config.rs` (and elsewhere) mutate process-global env vars
//! (`GATOR_DATABASE_URL`, `HOME`, `XDG_CONFIG_HOME`, ...) to exercise the
//! resolution chain. `cargo test` runs tests in the same process
//! concurrently by default, so without serialization two such tests racing
//! each other would stomp on each other's env vars. `lock_env` gives every
//! env-mutating test a single shared mutex to hold for its duration.

use std::sync::{Mutex, MutexGuard};

static ENV_LOCK: Mutex<()> = Mutex::new(());

/// Acquire the shared env-var test lock, clearing a poisoned lock from a
/// prior panicking test rather than poisoning every test after it.
pub fn lock_env() -> MutexGuard<'static, ()> {
    ENV_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
