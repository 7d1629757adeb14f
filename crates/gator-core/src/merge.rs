//! Decision executor: turns a persisted [`Decision`] into the external
//! action it names -- merging or closing a PR, resuming a conversation, or
//! spinning up a brand new attempt.
//!
//! Parsing `Decision::action` back into [`DecisionAction`] is a cascade of
//! total parsers ending in [`DecisionAction::ManualReview`], the same shape
//! [`crate::gate::evaluator`] uses for gate policy: an unrecognized or
//! malformed value never panics or propagates an error, it just asks a
//! human to look.

use std::io::Write as _;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use gator_db::models::Decision;
use tokio::process::Command;
use uuid::Uuid;

/// The concrete action a [`Decision`] row resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecisionAction {
    /// `gh pr merge <n> --auto --squash` once CI is green.
    MergeAfterCiPass { pr_number: u64 },
    /// Resume the existing conversation with a follow-up prompt.
    Prompt { message: String },
    /// Abandon the existing thread and start a new session with the same
    /// prompt.
    PromptNewSession { message: String },
    /// Invalidate the thread and launch a brand new attempt under a new
    /// task key.
    ReAttempt,
    /// Defer and re-check after `seconds`.
    Wait { seconds: u32 },
    /// Escalate to a human; also the fallback for anything unparseable.
    ManualReview { reason: String },
    /// Close the PR and stop working this task.
    ClosePr { pr_number: u64, reason: String },
    /// Nothing to do.
    Noop,
}

/// Parse a `Decision` row's `action`/`reason`/`prompt` fields into a
/// [`DecisionAction`]. `pr_number` is passed in separately since it isn't a
/// column on `decisions` -- callers resolve it from the task's tracked PR
/// before calling this.
pub fn parse_decision(decision: &Decision, pr_number: Option<u64>) -> DecisionAction {
    match decision.action.as_str() {
        "merge_after_ci_pass" => match pr_number {
            Some(n) => DecisionAction::MergeAfterCiPass { pr_number: n },
            None => DecisionAction::ManualReview {
                reason: "merge_after_ci_pass decision has no associated PR number".to_string(),
            },
        },
        "prompt" => DecisionAction::Prompt {
            message: decision.prompt.clone().unwrap_or_default(),
        },
        "prompt_new_session" => DecisionAction::PromptNewSession {
            message: decision.prompt.clone().unwrap_or_default(),
        },
        "re_attempt" => DecisionAction::ReAttempt,
        "wait" => DecisionAction::Wait {
            seconds: decision.wait_seconds.unwrap_or(60).max(0) as u32,
        },
        "close_pr" => match pr_number {
            Some(n) => DecisionAction::ClosePr {
                pr_number: n,
                reason: decision.reason.clone(),
            },
            None => DecisionAction::ManualReview {
                reason: "close_pr decision has no associated PR number".to_string(),
            },
        },
        "noop" => DecisionAction::Noop,
        "manual_review" => DecisionAction::ManualReview {
            reason: decision.reason.clone(),
        },
        other => DecisionAction::ManualReview {
            reason: format!("unrecognized decision action {other:?}, defaulting to manual review"),
        },
    }
}

/// Outcome of enacting a [`DecisionAction`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnactOutcome {
    Merged { pr_number: u64 },
    Closed { pr_number: u64 },
    Resumed,
    NewAttemptQueued,
    Waiting { seconds: u32 },
    EscalatedToHuman { reason: String },
    DidNothing,
}

/// Enact a [`DecisionAction`] using the `gh` CLI for PR-level actions.
/// `repo_dir` is the git working directory `gh` should run in (so it picks
/// up the right repo context via its own remote detection).
pub async fn enact(action: &DecisionAction, repo_dir: &Path) -> Result<EnactOutcome> {
    match action {
        DecisionAction::MergeAfterCiPass { pr_number } => {
            run_gh(repo_dir, &["pr", "merge", &pr_number.to_string(), "--auto", "--squash"]).await?;
            Ok(EnactOutcome::Merged { pr_number: *pr_number })
        }
        DecisionAction::ClosePr { pr_number, reason } => {
            let escaped = reason.replace('"', "\\\"");
            let comment = format!("--comment={escaped}");
            run_gh(repo_dir, &["pr", "close", &pr_number.to_string(), &comment]).await?;
            Ok(EnactOutcome::Closed { pr_number: *pr_number })
        }
        DecisionAction::Prompt { .. } | DecisionAction::PromptNewSession { .. } => {
            // Actually resuming/re-prompting the agent is the caller's
            // responsibility (it needs the agent pool and task context);
            // this function only reports what the decision calls for.
            Ok(EnactOutcome::Resumed)
        }
        DecisionAction::ReAttempt => Ok(EnactOutcome::NewAttemptQueued),
        DecisionAction::Wait { seconds } => Ok(EnactOutcome::Waiting { seconds: *seconds }),
        DecisionAction::ManualReview { reason } => Ok(EnactOutcome::EscalatedToHuman {
            reason: reason.clone(),
        }),
        DecisionAction::Noop => Ok(EnactOutcome::DidNothing),
    }
}

async fn run_gh(repo_dir: &Path, args: &[&str]) -> Result<()> {
    let output = tokio::time::timeout(
        Duration::from_secs(60),
        Command::new("gh").args(args).current_dir(repo_dir).output(),
    )
    .await
    .context("gh command timed out")?
    .with_context(|| format!("failed to spawn gh {args:?}"))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!("gh {args:?} failed: {stderr}");
    }
    Ok(())
}

/// First 8 hex characters of a UUID's simple form, used in audit log
/// filenames so they stay short but still traceable back to the task.
fn short_id(id: Uuid) -> String {
    id.simple().to_string()[..8].to_string()
}

/// Write a `merge-exec-<short_id>-<ts>.log` audit entry under `log_dir`.
pub fn write_audit_log(log_dir: &Path, task_id: Uuid, ts_unix: i64, body: &str) -> Result<()> {
    std::fs::create_dir_all(log_dir)?;
    let path = log_dir.join(format!("merge-exec-{}-{}.log", short_id(task_id), ts_unix));
    let mut file = std::fs::File::create(&path)?;
    file.write_all(body.as_bytes())?;
    Ok(())
}
