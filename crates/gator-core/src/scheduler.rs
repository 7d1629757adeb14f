//! Fleet-wide scheduler: polls the [`crate::board::Board`] for claimable
//! work, hands each claim to the [`crate::executor::ExecutorScheduler`] to
//! pick an executor, and launches the attempt through the
//! [`crate::agent_pool::AgentPool`].
//!
//! This sits above [`crate::orchestrator`], which already knows how to run
//! one plan's DAG to completion on a single instance. The scheduler's job
//! is the fleet-wide piece: deciding which instance gets to work a given
//! task next, via the board's atomic claim, not how that instance then
//! drives the task through its lifecycle.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use gator_db::models::{ExecutorState, Task, TaskStatus};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::board::Board;
use crate::executor::ExecutorScheduler;

/// Default cadence at which the scheduler polls the board for new work.
pub fn default_poll_interval() -> Duration {
    Duration::from_secs(30)
}

/// Default interval between heartbeats for an in-progress claim.
pub fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(60)
}

/// A claim is considered abandoned once its heartbeat is this old.
pub fn default_stale_threshold() -> Duration {
    Duration::from_secs(600)
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    pub stale_threshold: Duration,
    /// Maximum tasks claimed per poll tick.
    pub max_claims_per_tick: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            heartbeat_interval: default_heartbeat_interval(),
            stale_threshold: default_stale_threshold(),
            max_claims_per_tick: 16,
        }
    }
}

/// The `[fleet]` config-file section's scheduler knobs. All seconds-based so
/// the TOML doesn't need to know about `Duration`'s serde representation.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct SchedulerFileConfig {
    pub poll_interval_secs: Option<u64>,
    pub heartbeat_interval_secs: Option<u64>,
    pub stale_threshold_secs: Option<u64>,
    pub max_claims_per_tick: Option<i64>,
}

impl SchedulerConfig {
    /// Resolve via env var > config-file section > built-in default.
    pub fn from_env_and_file(file: Option<&SchedulerFileConfig>) -> Self {
        let default = Self::default();

        let poll_interval = env_secs("GATOR_SCHEDULER_POLL_INTERVAL_SECS")
            .or_else(|| file.and_then(|f| f.poll_interval_secs).map(Duration::from_secs))
            .unwrap_or(default.poll_interval);

        let heartbeat_interval = env_secs("GATOR_SCHEDULER_HEARTBEAT_INTERVAL_SECS")
            .or_else(|| file.and_then(|f| f.heartbeat_interval_secs).map(Duration::from_secs))
            .unwrap_or(default.heartbeat_interval);

        let stale_threshold = env_secs("GATOR_SCHEDULER_STALE_THRESHOLD_SECS")
            .or_else(|| file.and_then(|f| f.stale_threshold_secs).map(Duration::from_secs))
            .unwrap_or(default.stale_threshold);

        let max_claims_per_tick = std::env::var("GATOR_SCHEDULER_MAX_CLAIMS_PER_TICK")
            .ok()
            .and_then(|v| v.parse().ok())
            .or_else(|| file.and_then(|f| f.max_claims_per_tick))
            .unwrap_or(default.max_claims_per_tick);

        Self {
            poll_interval,
            heartbeat_interval,
            stale_threshold,
            max_claims_per_tick,
        }
    }
}

fn env_secs(var: &str) -> Option<Duration> {
    std::env::var(var).ok().and_then(|v| v.parse().ok()).map(Duration::from_secs)
}

/// A task successfully claimed this tick, with the executor allocated to
/// run it.
#[derive(Debug, Clone)]
pub struct ClaimedTask {
    pub task: Task,
    pub executor: ExecutorState,
    pub attempt_token: String,
}

pub struct Scheduler {
    board: Arc<dyn Board>,
    executors: Arc<ExecutorScheduler>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(board: Arc<dyn Board>, executors: Arc<ExecutorScheduler>, config: SchedulerConfig) -> Self {
        Self {
            board,
            executors,
            config,
        }
    }

    /// One polling pass: claim as many pending tasks as possible (up to
    /// `max_claims_per_tick`), each paired with an allocated executor.
    /// A task whose claim fails (another instance got there first) is
    /// silently skipped -- that's the normal, expected outcome of two
    /// instances racing the same board.
    pub async fn poll_once(&self, db_pool: &sqlx::PgPool, instance_id: &str) -> Result<Vec<ClaimedTask>> {
        let candidates = self
            .board
            .list_tasks(TaskStatus::Pending, self.config.max_claims_per_tick)
            .await?;

        let mut claimed = Vec::new();
        for task in candidates {
            let attempt_token = Uuid::new_v4().to_string();
            match self.board.claim_task(task.id, instance_id, &attempt_token).await {
                Ok(true) => {
                    let executor = match self.executors.select(db_pool).await {
                        Ok(e) => e,
                        Err(err) => {
                            warn!(task_id = %task.id, error = %err, "no executor available for claimed task");
                            let _ = self.board.mark_ignored(task.id, "no executor available").await;
                            continue;
                        }
                    };
                    info!(task_id = %task.id, executor = %executor.name, "claimed task");
                    claimed.push(ClaimedTask {
                        task,
                        executor,
                        attempt_token,
                    });
                }
                Ok(false) => {
                    // Lost the race to another instance; not an error.
                }
                Err(err) => {
                    warn!(task_id = %task.id, error = %err, "failed to claim task");
                }
            }
        }

        Ok(claimed)
    }

    /// Refresh the heartbeat for an in-progress claim.
    pub async fn heartbeat(&self, task_id: Uuid, attempt_token: &str) -> Result<bool> {
        self.board
            .update_heartbeat(task_id, attempt_token, chrono::Utc::now())
            .await
    }

    /// Release claims whose heartbeat is older than `stale_threshold`,
    /// freeing the task for another instance to pick up. The task's own
    /// `TaskStatus` is left untouched -- recovering a stuck intermediate
    /// status (assigned/running/checking) back to a retryable one is
    /// `orchestrator::run_orchestrator`'s `reset_orphaned_tasks` step, run
    /// independently by whichever instance next works that task's plan.
    pub async fn reclaim_stale(&self, db_pool: &sqlx::PgPool) -> Result<usize> {
        let now = chrono::Utc::now();
        let mut reclaimed = 0;

        for status in [TaskStatus::Assigned, TaskStatus::Running, TaskStatus::Checking] {
            let owned = self.board.list_tasks(status, 256).await?;
            for task in owned {
                let Some(state) = self.board.read_shared_state(task.id).await? else {
                    continue;
                };
                let Some(heartbeat) = state.heartbeat else {
                    continue;
                };
                let age = now - heartbeat;
                if age.to_std().unwrap_or_default() > self.config.stale_threshold {
                    if let Some(token) = &state.attempt_token {
                        warn!(task_id = %task.id, owner = ?state.owner_id, "reclaiming stale board claim");
                        let rows = gator_db::queries::tasks::release_claim(db_pool, task.id, token).await?;
                        if rows > 0 {
                            reclaimed += 1;
                        }
                    }
                }
            }
        }

        Ok(reclaimed)
    }
}

/// Run the scheduler loop until `cancel` fires, calling `on_claims` with
/// every batch of tasks claimed each tick.
pub async fn run_scheduler_loop<F, Fut>(
    scheduler: &Scheduler,
    db_pool: &sqlx::PgPool,
    instance_id: &str,
    cancel: CancellationToken,
    mut on_claims: F,
) -> Result<()>
where
    F: FnMut(Vec<ClaimedTask>) -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    loop {
        if cancel.is_cancelled() {
            return Ok(());
        }

        match scheduler.poll_once(db_pool, instance_id).await {
            Ok(claimed) if !claimed.is_empty() => on_claims(claimed).await,
            Ok(_) => {}
            Err(err) => warn!(error = %err, "scheduler poll tick failed"),
        }

        if let Err(err) = scheduler.reclaim_stale(db_pool).await {
            warn!(error = %err, "failed to reclaim stale board claims");
        }

        tokio::select! {
            _ = tokio::time::sleep(scheduler.config.poll_interval) => {}
            _ = cancel.cancelled() => return Ok(()),
        }
    }
}
