//! Lifecycle hooks: user-configurable commands run around agent and git
//! events, plus a handful of built-in hooks gator always runs.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration as StdDuration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::warn;

/// Output captured from a hook beyond this size is truncated, matching the
/// limit applied to invariant stderr snippets and agent log capture.
const MAX_HOOK_OUTPUT_BYTES: usize = 64 * 1024;

/// Points in the agent/git lifecycle a hook can be attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookEvent {
    SessionStart,
    SessionStop,
    PreToolUse,
    PostToolUse,
    SubagentStart,
    SubagentStop,
    PreCommit,
    PostCommit,
    PrePush,
    PostPush,
    PrePR,
    PostPR,
    TaskComplete,
}

impl std::fmt::Display for HookEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HookEvent::SessionStart => "session_start",
            HookEvent::SessionStop => "session_stop",
            HookEvent::PreToolUse => "pre_tool_use",
            HookEvent::PostToolUse => "post_tool_use",
            HookEvent::SubagentStart => "subagent_start",
            HookEvent::SubagentStop => "subagent_stop",
            HookEvent::PreCommit => "pre_commit",
            HookEvent::PostCommit => "post_commit",
            HookEvent::PrePush => "pre_push",
            HookEvent::PostPush => "post_push",
            HookEvent::PrePR => "pre_pr",
            HookEvent::PostPR => "post_pr",
            HookEvent::TaskComplete => "task_complete",
        };
        f.write_str(s)
    }
}

/// A single configured hook.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Hook {
    pub id: String,
    pub command: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Blocking hooks run sequentially and a failure stops the lifecycle
    /// step that triggered them; non-blocking hooks fire concurrently and
    /// only log their outcome.
    #[serde(default)]
    pub blocking: bool,
    /// Restrict this hook to specific harness SDKs; empty means all.
    #[serde(default)]
    pub sdks: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

fn default_timeout_secs() -> u64 {
    60
}

/// The `[hooks]` config-file section: hooks are declarative, so there is no
/// env-var layer for this one -- `hooks.toml`'s `[[hooks.hooks]]` entries
/// are the only source besides the built-ins.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct HooksFileConfig {
    #[serde(default)]
    pub hooks: Vec<Hook>,
}

/// Context passed to every hook invocation as `VE_*` environment variables.
#[derive(Debug, Clone, Default)]
pub struct HookContext {
    pub task_id: String,
    pub task_title: String,
    pub branch_name: String,
    pub worktree_path: String,
    pub sdk: String,
    pub repo_root: String,
    pub extra: HashMap<String, String>,
}

/// Outcome of a single hook run.
#[derive(Debug, Clone)]
pub struct HookOutcome {
    pub hook_id: String,
    pub success: bool,
    pub exit_code: Option<i32>,
    pub output: String,
}

/// Result of running every hook bound to an event.
#[derive(Debug, Clone, Default)]
pub struct HookRunReport {
    pub outcomes: Vec<HookOutcome>,
}

impl HookRunReport {
    /// `true` if every blocking hook in the batch succeeded. Non-blocking
    /// hooks never fail the batch.
    pub fn all_blocking_passed(&self) -> bool {
        self.outcomes.iter().all(|o| o.success)
    }
}

fn applies_to_sdk(hook: &Hook, sdk: &str) -> bool {
    hook.sdks.is_empty()
        || hook.sdks.iter().any(|s| s == "*" || s.eq_ignore_ascii_case(sdk))
}

fn truncate(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_owned();
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    let mut out = s[..end].to_owned();
    out.push_str("... [truncated]");
    out
}

async fn run_one(hook: &Hook, ctx: &HookContext, event: HookEvent) -> HookOutcome {
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(&hook.command)
        .env("VE_HOOK_EVENT", event.to_string())
        .env("VE_TASK_ID", &ctx.task_id)
        .env("VE_TASK_TITLE", &ctx.task_title)
        .env("VE_BRANCH_NAME", &ctx.branch_name)
        .env("VE_WORKTREE_PATH", &ctx.worktree_path)
        .env("VE_SDK", &ctx.sdk)
        .env("VE_REPO_ROOT", &ctx.repo_root)
        .env("VE_HOOK_BLOCKING", if hook.blocking { "1" } else { "0" });

    if !ctx.worktree_path.is_empty() {
        cmd.current_dir(&ctx.worktree_path);
    }
    for (k, v) in &ctx.extra {
        cmd.env(format!("VE_HOOK_{k}"), v);
    }
    for (k, v) in &hook.env {
        cmd.env(k, v);
    }

    let run = tokio::time::timeout(StdDuration::from_secs(hook.timeout_secs), cmd.output()).await;

    match run {
        Ok(Ok(output)) => {
            let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
            combined.push_str(&String::from_utf8_lossy(&output.stderr));
            HookOutcome {
                hook_id: hook.id.clone(),
                success: output.status.success(),
                exit_code: output.status.code(),
                output: truncate(&combined, MAX_HOOK_OUTPUT_BYTES),
            }
        }
        Ok(Err(err)) => HookOutcome {
            hook_id: hook.id.clone(),
            success: false,
            exit_code: None,
            output: format!("failed to spawn hook: {err}"),
        },
        Err(_) => HookOutcome {
            hook_id: hook.id.clone(),
            success: false,
            exit_code: None,
            output: format!("hook timed out after {}s", hook.timeout_secs),
        },
    }
}

/// Run every hook bound to `event` for the given context.
///
/// Blocking hooks run sequentially in configured order and stop at the
/// first failure (later blocking hooks in the batch are skipped; the
/// failure is still reported). Non-blocking hooks all fire concurrently
/// regardless of blocking-hook outcomes, and failures are logged but never
/// propagated.
pub async fn execute_hooks(event: HookEvent, hooks: &[Hook], ctx: &HookContext) -> HookRunReport {
    let applicable: Vec<&Hook> = hooks.iter().filter(|h| applies_to_sdk(h, &ctx.sdk)).collect();

    let mut outcomes = Vec::new();

    for hook in applicable.iter().filter(|h| h.blocking) {
        let outcome = run_one(hook, ctx, event).await;
        let failed = !outcome.success;
        outcomes.push(outcome);
        if failed {
            warn!(hook_id = %hooks_last_id(&outcomes), event = %event, "blocking hook failed, stopping batch");
            break;
        }
    }

    let non_blocking: Vec<&&Hook> = applicable.iter().filter(|h| !h.blocking).collect();
    if !non_blocking.is_empty() {
        let futures = non_blocking.iter().map(|h| run_one(h, ctx, event));
        let results = futures::future::join_all(futures).await;
        for outcome in results {
            if !outcome.success {
                warn!(hook_id = %outcome.hook_id, event = %event, "non-blocking hook failed");
            }
            outcomes.push(outcome);
        }
    }

    HookRunReport { outcomes }
}

fn hooks_last_id(outcomes: &[HookOutcome]) -> String {
    outcomes.last().map(|o| o.hook_id.clone()).unwrap_or_default()
}

/// Built-in hook run before every `git push`: a five-minute blocking check.
pub fn pre_push_builtin(command: &str) -> Hook {
    Hook {
        id: "builtin-pre-push".to_string(),
        command: command.to_string(),
        timeout_secs: 300,
        blocking: true,
        sdks: Vec::new(),
        env: HashMap::new(),
    }
}

/// Whether the worktree at `path` has at least one commit ahead of
/// `origin/main`, the condition the built-in `TaskComplete` hook checks
/// before running user-configured completion hooks.
pub async fn has_unpushed_commits(path: &Path) -> Result<bool> {
    let output = Command::new("git")
        .args(["rev-list", "--count", "origin/main..HEAD"])
        .current_dir(path)
        .output()
        .await?;
    let count: u64 = String::from_utf8_lossy(&output.stdout).trim().parse().unwrap_or(0);
    Ok(count >= 1)
}
