//! Agent pool: the layer between the orchestrator and a raw [`Harness`].
//!
//! Where [`crate::harness`] knows how to spawn one process and normalize its
//! event stream, the agent pool knows *which* SDK to spawn, whether to
//! resume a prior conversation via the thread registry, and how to retry a
//! failed attempt with an error-recovery preamble instead of giving up after
//! one try.

use std::sync::Mutex;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::harness::{AgentHandle, Harness, HarnessRegistry, MaterializedTask};
use crate::thread_registry::ThreadRegistry;

/// Env var naming the primary agent SDK, consulted below `AGENT_POOL_SDK`
/// (which pins the pool outright) but above a task's own `requested_harness`.
pub const PRIMARY_AGENT_ENV: &str = "PRIMARY_AGENT";

/// The `[agent_pool]` config-file section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentPoolFileConfig {
    /// Equivalent to calling [`AgentPool::set_sdk`] at startup.
    pub pinned_sdk: Option<String>,
}

/// Resolve the SDK the pool should start pinned to, if any: `AGENT_POOL_SDK`
/// env > `PRIMARY_AGENT` env > config-file `pinned_sdk` > unset (falls
/// through to [`AgentPool::resolve_sdk`]'s per-task chain).
pub fn resolve_startup_sdk(file: Option<&AgentPoolFileConfig>) -> Option<String> {
    std::env::var(AGENT_POOL_SDK_ENV)
        .ok()
        .filter(|s| !s.is_empty())
        .or_else(|| std::env::var(PRIMARY_AGENT_ENV).ok().filter(|s| !s.is_empty()))
        .or_else(|| file.and_then(|f| f.pinned_sdk.clone()))
}

/// Env var that overrides SDK selection fleet-wide, below an explicit
/// caller-supplied choice but above a task's own `requested_harness`.
pub const AGENT_POOL_SDK_ENV: &str = "AGENT_POOL_SDK";

/// Env var [`crate::harness::claude_code::ClaudeCodeAdapter::spawn`] reads to
/// resume a prior session instead of starting a fresh conversation.
pub const RESUME_THREAD_ID_ENV: &str = "GATOR_RESUME_THREAD_ID";

/// Default SDK preference order when nothing else decides.
const DEFAULT_SDK_CHAIN: &[&str] = &["codex", "copilot", "claude-code"];

/// Env var checked per entry of [`DEFAULT_SDK_CHAIN`] before it is allowed to
/// win the fallback walk. `"1"` disables that SDK fleet-wide regardless of
/// whether a harness for it happens to be registered.
fn disable_env_for(sdk: &str) -> Option<&'static str> {
    match sdk {
        "codex" => Some("CODEX_SDK_DISABLED"),
        "copilot" => Some("COPILOT_SDK_DISABLED"),
        "claude-code" => Some("CLAUDE_SDK_DISABLED"),
        _ => None,
    }
}

fn sdk_disabled(sdk: &str) -> bool {
    disable_env_for(sdk)
        .and_then(|var| std::env::var(var).ok())
        .is_some_and(|v| v == "1")
}

/// Preamble prepended to a retried task's prompt so the agent knows it is
/// continuing from a failed attempt rather than starting fresh.
const ERROR_RECOVERY_PREAMBLE: &str = "The previous attempt at this task failed its verification \
gate. Review what was left in the working tree, fix the issues that caused the failure, and \
avoid repeating the same mistake.";

/// Wraps a [`HarnessRegistry`] and [`ThreadRegistry`] to provide SDK
/// selection, session resumption, and retry-with-recovery on top of raw
/// process spawning.
pub struct AgentPool {
    harnesses: HarnessRegistry,
    threads: ThreadRegistry,
    /// Sticky SDK override, set via [`AgentPool::set_sdk`]. Takes priority
    /// over everything except an explicit per-call `requested` argument.
    sdk_cache: Mutex<Option<String>>,
}

impl AgentPool {
    pub fn new(harnesses: HarnessRegistry, threads: ThreadRegistry) -> Self {
        Self {
            harnesses,
            threads,
            sdk_cache: Mutex::new(None),
        }
    }

    /// Pin the pool to a specific SDK until [`AgentPool::reset_cache`] is
    /// called.
    pub fn set_sdk(&self, sdk: Option<String>) {
        *self.sdk_cache.lock().expect("sdk cache lock poisoned") = sdk;
    }

    /// The currently pinned SDK, if any.
    pub fn get_sdk(&self) -> Option<String> {
        self.sdk_cache.lock().expect("sdk cache lock poisoned").clone()
    }

    /// Clear the pinned SDK, falling back to the env/task/default chain.
    pub fn reset_cache(&self) {
        *self.sdk_cache.lock().expect("sdk cache lock poisoned") = None;
    }

    /// Every SDK name with a registered harness.
    pub fn available_sdks(&self) -> Vec<String> {
        self.harnesses.list().into_iter().map(str::to_string).collect()
    }

    /// Resolve which SDK to use, in priority order:
    /// explicit `requested` argument > pinned [`AgentPool::set_sdk`] value >
    /// `AGENT_POOL_SDK` env var > the task's own `requested_harness` >
    /// the first entry of the default chain that has a registered harness.
    pub fn resolve_sdk(&self, requested: Option<&str>, task_requested_harness: Option<&str>) -> Result<String> {
        if let Some(sdk) = requested {
            return Ok(sdk.to_string());
        }
        if let Some(sdk) = self.get_sdk() {
            return Ok(sdk);
        }
        if let Ok(sdk) = std::env::var(AGENT_POOL_SDK_ENV) {
            if !sdk.is_empty() {
                return Ok(sdk);
            }
        }
        if let Some(sdk) = task_requested_harness {
            return Ok(sdk.to_string());
        }
        for candidate in DEFAULT_SDK_CHAIN {
            if sdk_disabled(candidate) {
                continue;
            }
            if self.harnesses.get(candidate).is_some() {
                return Ok(candidate.to_string());
            }
        }
        bail!("no SDK could be resolved: no harness in the default chain is registered");
    }

    fn harness(&self, sdk: &str) -> Result<&dyn Harness> {
        self.harnesses
            .get(sdk)
            .with_context(|| format!("no harness registered for SDK {sdk:?}"))
    }

    /// Spawn a one-shot agent run with no session continuity.
    pub async fn launch_ephemeral(&self, sdk: &str, task: &MaterializedTask) -> Result<AgentHandle> {
        self.harness(sdk)?.spawn(task).await
    }

    /// The event stream for a handle spawned through this pool under `sdk`.
    /// Returns `None` if `sdk` isn't registered (should not happen for a
    /// handle this pool itself spawned).
    pub fn events(
        &self,
        sdk: &str,
        handle: &AgentHandle,
    ) -> Option<std::pin::Pin<Box<dyn futures::Stream<Item = crate::harness::AgentEvent> + Send>>> {
        self.harnesses.get(sdk).map(|h| h.events(handle))
    }

    /// Spawn an agent run for `task_key`, resuming its thread if the thread
    /// registry still has a live one, or starting fresh otherwise. Advances
    /// the thread registry's turn counter regardless.
    pub async fn launch_or_resume(
        &self,
        task_key: &str,
        sdk: &str,
        mut task: MaterializedTask,
    ) -> Result<AgentHandle> {
        let existing = self.threads.get(task_key);
        if let Some(thread) = &existing {
            if let Some(thread_id) = &thread.thread_id {
                task.env_vars
                    .insert(RESUME_THREAD_ID_ENV.to_string(), thread_id.clone());
            }
        }

        let handle = self.harness(sdk)?.spawn(&task).await?;

        self.threads.record_turn(
            task_key,
            sdk,
            task.working_dir.clone(),
            existing.and_then(|t| t.thread_id),
        );

        Ok(handle)
    }

    /// Run `attempt` up to `1 + max_retries` times.
    ///
    /// `attempt` is handed the thread-registry key to run under and the
    /// task to execute, and returns `(value, should_retry)`. As soon as
    /// `should_retry` is `false`, or an `Err` occurs, that's the final
    /// result. Between retries the original task's thread is invalidated
    /// and the task gets the standard error-recovery preamble, and runs
    /// under `"{origin}-reattempt"` so a resumed thread from the failed
    /// run can't leak into the fresh attempt.
    pub async fn exec_with_retry<F, Fut, T>(
        &self,
        origin_task_key: &str,
        max_retries: u32,
        base_task: MaterializedTask,
        mut attempt: F,
    ) -> Result<T>
    where
        F: FnMut(String, MaterializedTask) -> Fut,
        Fut: std::future::Future<Output = Result<(T, bool)>>,
    {
        let mut task_key = origin_task_key.to_string();
        let mut task = base_task;

        for attempt_number in 0..=max_retries {
            let (value, should_retry) = attempt(task_key.clone(), task.clone()).await?;
            if !should_retry || attempt_number == max_retries {
                return Ok(value);
            }

            self.threads.force_new(&task_key, "retrying after failed attempt");
            task_key = prepare_retry(origin_task_key, &mut task);
        }

        unreachable!("loop always returns by the final iteration")
    }
}

/// Build the retried task description: original description plus the
/// standard error-recovery preamble, and the `"{origin}-reattempt"` thread
/// key it should be resumed under.
pub fn prepare_retry(origin_task_key: &str, task: &mut MaterializedTask) -> String {
    task.description = format!("{ERROR_RECOVERY_PREAMBLE}\n\n{}", task.description);
    format!("{origin_task_key}-reattempt")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::AgentEvent;
    use async_trait::async_trait;
    use futures::Stream;
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::pin::Pin;
    use uuid::Uuid;

    struct FakeHarness(&'static str);

    #[async_trait]
    impl Harness for FakeHarness {
        fn name(&self) -> &str {
            self.0
        }

        async fn spawn(&self, task: &MaterializedTask) -> Result<AgentHandle> {
            Ok(AgentHandle {
                pid: 1,
                stdin: None,
                task_id: task.task_id,
                attempt: 0,
                harness_name: self.0.to_string(),
            })
        }

        fn events(&self, _handle: &AgentHandle) -> Pin<Box<dyn Stream<Item = AgentEvent> + Send>> {
            Box::pin(futures::stream::empty())
        }

        async fn send(&self, _handle: &AgentHandle, _message: &str) -> Result<()> {
            Ok(())
        }

        async fn kill(&self, _handle: &AgentHandle) -> Result<()> {
            Ok(())
        }

        async fn is_running(&self, _handle: &AgentHandle) -> bool {
            false
        }
    }

    fn pool_with(sdks: &[&'static str]) -> AgentPool {
        let mut registry = HarnessRegistry::new();
        for sdk in sdks {
            registry.register(FakeHarness(sdk));
        }
        AgentPool::new(registry, ThreadRegistry::load(std::env::temp_dir().join(format!(
            "gator-test-threads-{}.json",
            Uuid::new_v4()
        ))))
    }

    fn task() -> MaterializedTask {
        MaterializedTask {
            task_id: Uuid::new_v4(),
            name: "t".to_string(),
            description: "do the thing".to_string(),
            invariant_commands: vec![],
            working_dir: PathBuf::from("/tmp"),
            env_vars: HashMap::new(),
        }
    }

    #[test]
    fn resolve_sdk_prefers_explicit_argument() {
        let pool = pool_with(&["codex", "claude-code"]);
        pool.set_sdk(Some("claude-code".to_string()));
        assert_eq!(pool.resolve_sdk(Some("codex"), None).unwrap(), "codex");
    }

    #[test]
    fn resolve_sdk_falls_back_to_pinned_value() {
        let pool = pool_with(&["codex", "claude-code"]);
        pool.set_sdk(Some("claude-code".to_string()));
        assert_eq!(pool.resolve_sdk(None, None).unwrap(), "claude-code");
    }

    #[test]
    fn resolve_sdk_falls_back_to_task_requested_harness() {
        let pool = pool_with(&["codex", "claude-code"]);
        assert_eq!(
            pool.resolve_sdk(None, Some("claude-code")).unwrap(),
            "claude-code"
        );
    }

    #[test]
    fn resolve_sdk_falls_back_to_default_chain() {
        let pool = pool_with(&["claude-code"]);
        assert_eq!(pool.resolve_sdk(None, None).unwrap(), "claude-code");
    }

    #[test]
    fn resolve_sdk_errors_when_nothing_registered() {
        let pool = pool_with(&[]);
        assert!(pool.resolve_sdk(None, None).is_err());
    }

    #[test]
    fn resolve_sdk_skips_disabled_entries_in_default_chain() {
        let pool = pool_with(&["codex", "copilot", "claude-code"]);
        unsafe { std::env::set_var("CODEX_SDK_DISABLED", "1") };
        unsafe { std::env::set_var("COPILOT_SDK_DISABLED", "1") };
        let resolved = pool.resolve_sdk(None, None);
        unsafe { std::env::remove_var("CODEX_SDK_DISABLED") };
        unsafe { std::env::remove_var("COPILOT_SDK_DISABLED") };
        assert_eq!(resolved.unwrap(), "claude-code");
    }

    #[test]
    fn resolve_sdk_errors_when_entire_chain_disabled() {
        let pool = pool_with(&["claude-code"]);
        unsafe { std::env::set_var("CLAUDE_SDK_DISABLED", "1") };
        let resolved = pool.resolve_sdk(None, None);
        unsafe { std::env::remove_var("CLAUDE_SDK_DISABLED") };
        assert!(resolved.is_err());
    }

    #[tokio::test]
    async fn launch_ephemeral_spawns_via_named_harness() {
        let pool = pool_with(&["claude-code"]);
        let handle = pool.launch_ephemeral("claude-code", &task()).await.unwrap();
        assert_eq!(handle.harness_name, "claude-code");
    }

    #[tokio::test]
    async fn launch_or_resume_sets_resume_env_when_thread_exists() {
        let pool = pool_with(&["claude-code"]);
        pool.threads.record_turn(
            "task-key-1",
            "claude-code",
            PathBuf::from("/tmp/wt"),
            Some("thread-abc".to_string()),
        );

        let handle = pool
            .launch_or_resume("task-key-1", "claude-code", task())
            .await
            .unwrap();
        assert_eq!(handle.harness_name, "claude-code");

        let thread = pool.threads.get("task-key-1").unwrap();
        assert_eq!(thread.turn_count, 2);
    }

    #[test]
    fn prepare_retry_adds_preamble_and_reattempt_key() {
        let mut t = task();
        let key = prepare_retry("task-1", &mut t);
        assert_eq!(key, "task-1-reattempt");
        assert!(t.description.contains("previous attempt"));
        assert!(t.description.contains("do the thing"));
    }

    #[tokio::test]
    async fn exec_with_retry_stops_on_first_non_retry() {
        let pool = pool_with(&["claude-code"]);
        let calls = std::sync::atomic::AtomicU32::new(0);

        let result = pool
            .exec_with_retry("origin", 3, task(), |_key, _task| {
                let n = calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                async move { Ok::<_, anyhow::Error>((n, false)) }
            })
            .await
            .unwrap();

        assert_eq!(result, 0);
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exec_with_retry_exhausts_max_retries() {
        let pool = pool_with(&["claude-code"]);
        let calls = std::sync::atomic::AtomicU32::new(0);

        let result = pool
            .exec_with_retry("origin", 2, task(), |key, task| {
                let n = calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                assert!(task.description.len() >= "do the thing".len());
                let _ = key;
                async move { Ok::<_, anyhow::Error>((n, true)) }
            })
            .await
            .unwrap();

        assert_eq!(result, 2);
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exec_with_retry_uses_reattempt_key_on_second_call() {
        let pool = pool_with(&["claude-code"]);
        let seen_keys = std::sync::Mutex::new(Vec::new());

        pool.exec_with_retry("origin", 1, task(), |key, _task| {
            seen_keys.lock().unwrap().push(key);
            async move { Ok::<_, anyhow::Error>(((), true)) }
        })
        .await
        .unwrap();

        let keys = seen_keys.into_inner().unwrap();
        assert_eq!(keys, vec!["origin".to_string(), "origin-reattempt".to_string()]);
    }
}
