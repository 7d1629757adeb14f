//! The `gator serve` daemon: runs the HTTP dashboard alongside the
//! fleet-wide scheduler, heartbeat, and maintenance loops.
//!
//! Each loop is its own `tokio::spawn`ed task sharing one
//! `CancellationToken`, per SPEC_FULL's "independent loops, never one
//! monolithic loop" design note; Ctrl-C cancels all of them and waits for
//! the in-flight sweep/poll tick to notice before exiting.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use gator_core::agent_pool::{AgentPool, AgentPoolFileConfig};
use gator_core::attempt::FleetExecutor;
use gator_core::board::PostgresBoard;
use gator_core::branch_routing::BranchRouting;
use gator_core::executor::{ExecutorScheduler, ExecutorSchedulerConfig};
use gator_core::fleet::{FleetRegistry, InstanceRole, load_or_create_instance_id};
use gator_core::harness::{ClaudeCodeAdapter, HarnessRegistry};
use gator_core::hooks::Hook;
use gator_core::maintenance::{self, PidLock};
use gator_core::paths;
use gator_core::scheduler::{self, Scheduler, SchedulerConfig};
use gator_core::thread_registry::ThreadRegistry;
use gator_core::token::TokenConfig;
use gator_core::worktree::{WorktreeManager, WorktreeRegistry};

/// Default wall-clock budget for a single fleet attempt before it's killed
/// as timed out, matching `gator dispatch`'s default task timeout.
const DEFAULT_AGENT_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Options for the combined daemon, distinct from the plain `serve`
/// dashboard-only path so an operator without a single canonical repo
/// checkout can still run the scheduler against the board.
pub struct DaemonOptions {
    pub bind: String,
    pub port: u16,
    /// Repo checkout the maintenance sweep prunes worktrees/branches in.
    /// Maintenance is skipped entirely if not set, and so is task
    /// execution: a fleet attempt needs a repo to check worktrees out of.
    pub repo_root: Option<PathBuf>,
    pub coordinator_eligible: bool,
    pub priority: i32,
    pub executor_scheduler: ExecutorSchedulerConfig,
    pub scheduler: SchedulerConfig,
    pub branch_routing: BranchRouting,
    pub hooks: Vec<Hook>,
    pub agent_pool: AgentPoolFileConfig,
}

pub async fn run_daemon(db_pool: PgPool, token_config: TokenConfig, opts: DaemonOptions) -> Result<()> {
    let instance_id = load_or_create_instance_id(&paths::instance_id_path());
    info!(instance_id = %instance_id, "starting gator daemon");

    let fleet = FleetRegistry::load_default();
    fleet.heartbeat(&instance_id, InstanceRole::Worker, opts.coordinator_eligible, opts.priority);

    let board = Arc::new(PostgresBoard::new(db_pool.clone()));
    let executors = Arc::new(ExecutorScheduler::new(opts.executor_scheduler.clone()));
    let scheduler = Scheduler::new(board, executors, opts.scheduler.clone());

    let cancel = CancellationToken::new();

    let mut tasks = Vec::new();

    // A fleet attempt needs a worktree registry over a real repo checkout,
    // so task execution (not just the maintenance sweep) is gated on
    // `--repo-root` being set. Without it the daemon still claims and
    // heartbeats the board for visibility, but claimed tasks are left
    // untouched for an instance that does have a checkout to pick up.
    let pid_lock = if let Some(repo_root) = opts.repo_root.clone() {
        match PidLock::acquire_default() {
            Ok(lock) => {
                let manager = WorktreeManager::new(repo_root.clone(), None)?;
                let worktrees = Arc::new(WorktreeRegistry::load_default(manager));

                {
                    let registry = Arc::clone(&worktrees);
                    let repo_root = repo_root.clone();
                    let cancel = cancel.clone();
                    tasks.push(tokio::spawn(async move {
                        maintenance::run_maintenance_loop(
                            &registry,
                            &repo_root,
                            maintenance::default_sweep_interval(),
                            cancel,
                        )
                        .await;
                    }));
                }

                let mut harnesses = HarnessRegistry::new();
                harnesses.register(ClaudeCodeAdapter::new());
                let agents = AgentPool::new(harnesses, ThreadRegistry::load_default());
                if let Some(sdk) = gator_core::agent_pool::resolve_startup_sdk(Some(&opts.agent_pool)) {
                    agents.set_sdk(Some(sdk));
                }

                let executor = Arc::new(FleetExecutor {
                    worktrees,
                    agents,
                    hooks: opts.hooks.clone(),
                    branch_routing: opts.branch_routing.clone(),
                    repo_root: repo_root.clone(),
                    log_dir: paths::log_dir(),
                    instance_id: instance_id.clone(),
                    agent_timeout: DEFAULT_AGENT_TIMEOUT,
                    token_config: token_config.clone(),
                });

                tasks.push(tokio::spawn({
                    let pool = db_pool.clone();
                    let instance_id = instance_id.clone();
                    let cancel = cancel.clone();
                    async move {
                        let result = scheduler::run_scheduler_loop(&scheduler, &pool, &instance_id, cancel, |claimed| {
                            let pool = pool.clone();
                            let executor = Arc::clone(&executor);
                            async move {
                                for c in claimed {
                                    info!(task_id = %c.task.id, executor = %c.executor.name, "scheduler claimed task, starting fleet attempt");
                                    match executor.execute(&pool, &c.task, &c.executor).await {
                                        Ok(outcome) => {
                                            info!(task_id = %c.task.id, outcome = ?outcome, "fleet attempt finished");
                                        }
                                        Err(err) => {
                                            warn!(task_id = %c.task.id, error = %err, "fleet attempt failed");
                                        }
                                    }
                                }
                            }
                        })
                        .await;
                        if let Err(err) = result {
                            warn!(error = %err, "scheduler loop exited with error");
                        }
                    }
                }));

                Some(lock)
            }
            Err(err) => {
                warn!(error = %err, "skipping maintenance and task execution: failed to acquire pid lock");
                spawn_claim_only_scheduler(&mut tasks, scheduler, db_pool.clone(), instance_id.clone(), cancel.clone());
                None
            }
        }
    } else {
        info!("no --repo-root given; maintenance sweep and fleet task execution disabled for this instance");
        spawn_claim_only_scheduler(&mut tasks, scheduler, db_pool.clone(), instance_id.clone(), cancel.clone());
        None
    };

    tasks.push(tokio::spawn({
        let fleet_path = paths::presence_path();
        let instance_id = instance_id.clone();
        let coordinator_eligible = opts.coordinator_eligible;
        let priority = opts.priority;
        let cancel = cancel.clone();
        async move {
            let fleet = FleetRegistry::new(fleet_path);
            loop {
                if cancel.is_cancelled() {
                    return;
                }
                fleet.heartbeat(&instance_id, InstanceRole::Worker, coordinator_eligible, priority);
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(60)) => {}
                    _ = cancel.cancelled() => return,
                }
            }
        }
    }));

    let serve_fut = crate::serve_cmd::run_serve(db_pool.clone(), &opts.bind, opts.port);

    tokio::select! {
        result = serve_fut => {
            cancel.cancel();
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received ctrl-c, shutting down daemon");
            cancel.cancel();
        }
    }

    for task in tasks {
        let _ = task.await;
    }

    fleet.deregister(&instance_id);
    if let Some(lock) = pid_lock {
        lock.release();
    }

    Ok(())
}

/// Scheduler loop for an instance with no usable repo checkout: it still
/// claims and heartbeats tasks for visibility in the dashboard, but leaves
/// claims it cannot execute for another instance to pick up rather than
/// attempting work with no worktree to run it in.
fn spawn_claim_only_scheduler(
    tasks: &mut Vec<tokio::task::JoinHandle<()>>,
    scheduler: Scheduler,
    pool: PgPool,
    instance_id: String,
    cancel: CancellationToken,
) {
    tasks.push(tokio::spawn(async move {
        let result = scheduler::run_scheduler_loop(&scheduler, &pool, &instance_id, cancel, |claimed| async move {
            for c in claimed {
                warn!(
                    task_id = %c.task.id,
                    executor = %c.executor.name,
                    "claimed task but this instance has no repo checkout to execute it in"
                );
            }
        })
        .await;
        if let Err(err) = result {
            warn!(error = %err, "scheduler loop exited with error");
        }
    }));
}
