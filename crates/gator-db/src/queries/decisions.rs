//! Database query functions for the `decisions` table.
//!
//! A `Decision` row is the durable, queryable counterpart of the plain-text
//! `assessment-*.log` / `merge-exec-*.log` audit files: one row per
//! assessor or merge-strategy verdict.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::Decision;

/// Parameters for inserting a new decision row.
#[derive(Debug, Clone)]
pub struct NewDecision<'a> {
    pub task_id: Uuid,
    pub attempt: i32,
    pub trigger: &'a str,
    pub action: &'a str,
    pub reason: &'a str,
    pub prompt: Option<&'a str>,
    pub wait_seconds: Option<i32>,
}

/// Insert a new decision row. Returns the inserted row with
/// server-generated defaults (id, created_at).
pub async fn insert_decision(pool: &PgPool, new: &NewDecision<'_>) -> Result<Decision> {
    let decision = sqlx::query_as::<_, Decision>(
        "INSERT INTO decisions (task_id, attempt, trigger, action, reason, prompt, wait_seconds) \
         VALUES ($1, $2, $3, $4, $5, $6, $7) \
         RETURNING *",
    )
    .bind(new.task_id)
    .bind(new.attempt)
    .bind(new.trigger)
    .bind(new.action)
    .bind(new.reason)
    .bind(new.prompt)
    .bind(new.wait_seconds)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to insert decision for task {}", new.task_id))?;

    Ok(decision)
}

/// List all decisions for a task, oldest first.
pub async fn list_decisions_for_task(pool: &PgPool, task_id: Uuid) -> Result<Vec<Decision>> {
    let decisions = sqlx::query_as::<_, Decision>(
        "SELECT * FROM decisions WHERE task_id = $1 ORDER BY created_at ASC",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .with_context(|| format!("failed to list decisions for task {task_id}"))?;

    Ok(decisions)
}

/// The most recent decision for a task, if any.
pub async fn latest_decision_for_task(pool: &PgPool, task_id: Uuid) -> Result<Option<Decision>> {
    let decision = sqlx::query_as::<_, Decision>(
        "SELECT * FROM decisions WHERE task_id = $1 ORDER BY created_at DESC LIMIT 1",
    )
    .bind(task_id)
    .fetch_optional(pool)
    .await
    .with_context(|| format!("failed to fetch latest decision for task {task_id}"))?;

    Ok(decision)
}
