//! Convenience dispatch helpers that wrap [`super::TaskStateMachine`]
//! transitions with semantic names.

use std::path::Path;

use anyhow::{bail, Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use gator_db::models::TaskStatus;
use gator_db::queries::tasks as db;

use super::TaskStateMachine;

/// Assign a task to a harness and worktree.
///
/// Validates that all dependencies are `passed`, sets metadata,
/// and transitions `pending -> assigned`.
pub async fn assign_task(
    pool: &PgPool,
    task_id: Uuid,
    harness: &str,
    worktree_path: &Path,
) -> Result<()> {
    TaskStateMachine::assign_task(pool, task_id, harness, worktree_path).await
}

/// Start a task: transition `assigned -> running`.
///
/// Sets `started_at` to the current timestamp.
pub async fn start_task(pool: &PgPool, task_id: Uuid) -> Result<()> {
    TaskStateMachine::transition(pool, task_id, TaskStatus::Assigned, TaskStatus::Running).await
}

/// Begin checking a task's invariants: transition `running -> checking`.
pub async fn begin_checking(pool: &PgPool, task_id: Uuid) -> Result<()> {
    TaskStateMachine::transition(pool, task_id, TaskStatus::Running, TaskStatus::Checking).await
}

/// Mark a task as passed: transition `checking -> passed`.
///
/// Sets `completed_at` to the current timestamp.
pub async fn pass_task(pool: &PgPool, task_id: Uuid) -> Result<()> {
    TaskStateMachine::transition(pool, task_id, TaskStatus::Checking, TaskStatus::Passed).await
}

/// Mark a task as failed: transition `checking -> failed`.
///
/// Sets `completed_at` to the current timestamp.
pub async fn fail_task(pool: &PgPool, task_id: Uuid) -> Result<()> {
    TaskStateMachine::transition(pool, task_id, TaskStatus::Checking, TaskStatus::Failed).await
}

/// Retry a failed task: transition `failed -> assigned`.
///
/// Increments the attempt counter. Fails if `attempt >= retry_max`.
pub async fn retry_task(pool: &PgPool, task_id: Uuid) -> Result<()> {
    TaskStateMachine::transition(pool, task_id, TaskStatus::Failed, TaskStatus::Assigned).await
}

/// Escalate a failed task: transition `failed -> escalated`.
///
/// Sets `completed_at` to the current timestamp.
pub async fn escalate_task(pool: &PgPool, task_id: Uuid) -> Result<()> {
    TaskStateMachine::transition(pool, task_id, TaskStatus::Failed, TaskStatus::Escalated).await
}

/// Operator approval of a task awaiting human review: `checking -> passed`.
pub async fn approve_task(pool: &PgPool, task_id: Uuid) -> Result<()> {
    TaskStateMachine::transition(pool, task_id, TaskStatus::Checking, TaskStatus::Passed).await
}

/// Operator rejection of a task awaiting human review: `checking -> failed`.
pub async fn reject_task(pool: &PgPool, task_id: Uuid) -> Result<()> {
    TaskStateMachine::transition(pool, task_id, TaskStatus::Checking, TaskStatus::Failed).await
}

/// Operator-initiated retry of a failed or escalated task.
///
/// A `failed` task normally respects `retry_max`; passing `force = true`
/// bypasses that check. An `escalated` task is always eligible, since
/// escalation already means the automatic retry budget was exhausted and
/// a human is choosing to override it.
pub async fn operator_retry_task(pool: &PgPool, task_id: Uuid, force: bool) -> Result<()> {
    let task = db::get_task(pool, task_id)
        .await?
        .with_context(|| format!("task {} not found", task_id))?;

    match task.status {
        TaskStatus::Failed => {
            if !force && task.attempt >= task.retry_max {
                bail!(
                    "cannot retry task {}: attempt {} >= retry_max {} (use --force to override)",
                    task_id,
                    task.attempt,
                    task.retry_max
                );
            }
            let rows = db::retry_task_to_pending(pool, task_id, task.attempt).await?;
            if rows == 0 {
                bail!(
                    "optimistic lock failed on retry for task {} (attempt {})",
                    task_id,
                    task.attempt
                );
            }
            Ok(())
        }
        TaskStatus::Escalated => {
            TaskStateMachine::transition(pool, task_id, TaskStatus::Escalated, TaskStatus::Pending)
                .await
        }
        other => bail!(
            "cannot retry task {}: current status is {}, expected failed or escalated",
            task_id,
            other
        ),
    }
}
