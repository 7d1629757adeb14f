//! Database query functions for the `executor_state` table.
//!
//! This persists the in-memory `ExecutorScheduler`'s health bookkeeping
//! (failure counters, cooldowns) across process restarts. Git and the
//! agent SDKs remain the source of truth for whether an executor actually
//! works; this table only remembers recent failure history.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{ExecutorRole, ExecutorState};

/// Parameters for registering (or re-registering) an executor.
#[derive(Debug, Clone)]
pub struct NewExecutor<'a> {
    pub name: &'a str,
    pub sdk: &'a str,
    pub variant: &'a str,
    pub weight: i32,
    pub role: ExecutorRole,
}

/// Insert an executor row, or update its config fields if one with the
/// same name already exists (failure/cooldown state is left untouched).
pub async fn upsert_executor(pool: &PgPool, new: &NewExecutor<'_>) -> Result<ExecutorState> {
    let row = sqlx::query_as::<_, ExecutorState>(
        "INSERT INTO executor_state (name, sdk, variant, weight, role) \
         VALUES ($1, $2, $3, $4, $5) \
         ON CONFLICT (name) DO UPDATE \
         SET sdk = EXCLUDED.sdk, variant = EXCLUDED.variant, \
             weight = EXCLUDED.weight, role = EXCLUDED.role, \
             updated_at = now() \
         RETURNING *",
    )
    .bind(new.name)
    .bind(new.sdk)
    .bind(new.variant)
    .bind(new.weight)
    .bind(new.role)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to upsert executor {:?}", new.name))?;

    Ok(row)
}

/// List all executors, ordered by name.
pub async fn list_executors(pool: &PgPool) -> Result<Vec<ExecutorState>> {
    let rows = sqlx::query_as::<_, ExecutorState>("SELECT * FROM executor_state ORDER BY name")
        .fetch_all(pool)
        .await
        .context("failed to list executors")?;

    Ok(rows)
}

/// Record a failure: increment the counter, and if it reaches
/// `disable_threshold`, place the executor in cooldown until `cooldown_until`
/// and reset the counter to zero.
pub async fn record_failure(
    pool: &PgPool,
    id: Uuid,
    disable_threshold: i32,
    cooldown_until: DateTime<Utc>,
) -> Result<ExecutorState> {
    let row = sqlx::query_as::<_, ExecutorState>(
        "UPDATE executor_state \
         SET consecutive_failures = consecutive_failures + 1, \
             cooldown_until = CASE \
                 WHEN consecutive_failures + 1 >= $2 THEN $3 \
                 ELSE cooldown_until \
             END, \
             consecutive_failures = CASE \
                 WHEN consecutive_failures + 1 >= $2 THEN 0 \
                 ELSE consecutive_failures + 1 \
             END, \
             updated_at = now() \
         WHERE id = $1 \
         RETURNING *",
    )
    .bind(id)
    .bind(disable_threshold)
    .bind(cooldown_until)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to record failure for executor {id}"))?;

    Ok(row)
}

/// Record a success: reset the failure counter and clear any cooldown.
pub async fn record_success(pool: &PgPool, id: Uuid) -> Result<ExecutorState> {
    let row = sqlx::query_as::<_, ExecutorState>(
        "UPDATE executor_state \
         SET consecutive_failures = 0, cooldown_until = NULL, updated_at = now() \
         WHERE id = $1 \
         RETURNING *",
    )
    .bind(id)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to record success for executor {id}"))?;

    Ok(row)
}
