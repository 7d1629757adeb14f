//! The task board: the interface multiple gator instances poll and claim
//! work through.
//!
//! Task claims are always fenced by the board's atomic compare-and-swap on
//! `owner_instance_id`/`attempt_token` -- coordinator election in
//! [`crate::fleet`] decides who runs maintenance and the scheduler loop, but
//! it never gates whether a claim succeeds. Any instance may attempt a
//! claim at any time; the database is the only arbiter.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use gator_db::models::{Task, TaskStatus};
use gator_db::queries::tasks as db;

/// The portion of a task's state a board claim cares about, independent of
/// the backing store's column layout.
#[derive(Debug, Clone)]
pub struct SharedState {
    pub owner_id: Option<String>,
    pub attempt_token: Option<String>,
    pub attempt_started: Option<DateTime<Utc>>,
    pub heartbeat: Option<DateTime<Utc>>,
    pub status: TaskStatus,
    pub retry_count: i32,
}

impl From<&Task> for SharedState {
    fn from(task: &Task) -> Self {
        Self {
            owner_id: task.owner_instance_id.clone(),
            attempt_token: task.attempt_token.clone(),
            attempt_started: task.started_at,
            heartbeat: task.heartbeat_at,
            status: task.status,
            retry_count: task.attempt,
        }
    }
}

/// Interface to a shared backlog of claimable work.
///
/// Implementations may back this with Postgres (the only one gator ships),
/// or in principle with an external tracker like Jira or GitHub Issues --
/// [`PostgresBoard`] is the only concrete adapter; external trackers are a
/// trait-and-DTO surface for future work, not something gator talks to
/// today.
#[async_trait]
pub trait Board: Send + Sync {
    async fn list_tasks(&self, status: TaskStatus, limit: i64) -> anyhow::Result<Vec<Task>>;
    async fn get_task(&self, id: Uuid) -> anyhow::Result<Option<Task>>;
    /// Attempt to claim `id` for `owner_id`. Returns `true` if the claim was
    /// acquired (the task was unowned or already owned by `owner_id`).
    async fn claim_task(&self, id: Uuid, owner_id: &str, attempt_token: &str) -> anyhow::Result<bool>;
    async fn update_heartbeat(&self, id: Uuid, attempt_token: &str, ts: DateTime<Utc>) -> anyhow::Result<bool>;
    async fn transition(&self, id: Uuid, from: TaskStatus, to: TaskStatus) -> anyhow::Result<bool>;
    async fn persist_shared_state(&self, id: Uuid, state: &SharedState) -> anyhow::Result<()>;
    async fn read_shared_state(&self, id: Uuid) -> anyhow::Result<Option<SharedState>>;
    async fn mark_ignored(&self, id: Uuid, reason: &str) -> anyhow::Result<()>;
}

/// The board backed by gator's own Postgres schema: the `tasks` row itself
/// is the shared-state record, claimed via a CAS on `owner_instance_id`.
pub struct PostgresBoard {
    pool: PgPool,
}

impl PostgresBoard {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Board for PostgresBoard {
    async fn list_tasks(&self, status: TaskStatus, limit: i64) -> anyhow::Result<Vec<Task>> {
        db::list_tasks_by_status(&self.pool, status, limit).await
    }

    async fn get_task(&self, id: Uuid) -> anyhow::Result<Option<Task>> {
        db::get_task(&self.pool, id).await
    }

    async fn claim_task(&self, id: Uuid, owner_id: &str, attempt_token: &str) -> anyhow::Result<bool> {
        let rows = db::claim_task(&self.pool, id, owner_id, attempt_token).await?;
        Ok(rows > 0)
    }

    async fn update_heartbeat(&self, id: Uuid, attempt_token: &str, _ts: DateTime<Utc>) -> anyhow::Result<bool> {
        let rows = db::update_heartbeat(&self.pool, id, attempt_token).await?;
        Ok(rows > 0)
    }

    async fn transition(&self, id: Uuid, from: TaskStatus, to: TaskStatus) -> anyhow::Result<bool> {
        let rows = db::transition_task_status(&self.pool, id, from, to, None, None).await?;
        Ok(rows > 0)
    }

    async fn persist_shared_state(&self, id: Uuid, state: &SharedState) -> anyhow::Result<()> {
        if let (Some(owner), Some(token)) = (&state.owner_id, &state.attempt_token) {
            db::claim_task(&self.pool, id, owner, token).await?;
        }
        Ok(())
    }

    async fn read_shared_state(&self, id: Uuid) -> anyhow::Result<Option<SharedState>> {
        Ok(db::get_task(&self.pool, id).await?.as_ref().map(SharedState::from))
    }

    async fn mark_ignored(&self, id: Uuid, reason: &str) -> anyhow::Result<()> {
        db::mark_ignored(&self.pool, id, reason).await?;
        Ok(())
    }
}
