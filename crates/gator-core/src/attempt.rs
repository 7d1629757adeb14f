//! Fleet attempt executor: the `gator serve` counterpart to
//! [`crate::lifecycle::run_agent_lifecycle`].
//!
//! `lifecycle::run_agent_lifecycle` is `gator dispatch`'s single-plan path:
//! it spawns a raw [`crate::harness::Harness`] against an [`crate::isolation::Isolation`]
//! workspace with no fleet concerns at all. A daemon claiming tasks off a
//! shared [`crate::board::Board`] needs more: a worktree that survives
//! across attempts and is shared with every other instance, hooks around
//! the attempt, SDK fallback/resumption via [`crate::agent_pool::AgentPool`],
//! and a decision about what happens next via [`crate::assessor`] and
//! [`crate::merge`] instead of a flat pass/fail. [`FleetExecutor::execute`]
//! is that path.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::StreamExt;
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use gator_db::models::{ExecutorState, Task};
use gator_db::queries::agent_events::{self, NewAgentEvent};
use gator_db::queries::decisions;
use gator_db::queries::invariants as inv_db;
use gator_db::queries::tasks as task_db;

use crate::agent_pool::AgentPool;
use crate::assessor::{self, AssessedDecision, TaskAssessmentContext, Trigger};
use crate::branch_routing::BranchRouting;
use crate::gate::GateRunner;
use crate::gate::evaluator::{GateAction, evaluate_verdict};
use crate::harness::{AgentEvent, MaterializedTask};
use crate::hooks::{self, Hook, HookContext, HookEvent};
use crate::merge;
use crate::plan::materialize_task;
use crate::state::dispatch;
use crate::token::{self, TokenConfig};
use crate::worktree::WorktreeRegistry;

/// Outcome of running one fleet attempt through to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// Gate passed, work committed, decision enacted.
    Passed,
    /// Gate failed and the task is eligible for another attempt.
    FailedCanRetry,
    /// Gate failed with no retries left.
    FailedNoRetry,
    /// The task's gate policy requires a human before it proceeds further.
    HumanRequired,
    /// The agent didn't finish within `agent_timeout`.
    TimedOut,
}

/// Everything a fleet attempt needs that isn't on the claim itself: the
/// shared worktree registry, the agent pool, configured hooks, and the
/// paths/identity every hook invocation and audit log is stamped with.
pub struct FleetExecutor {
    pub worktrees: WorktreeRegistry,
    pub agents: AgentPool,
    pub hooks: Vec<Hook>,
    pub branch_routing: BranchRouting,
    pub repo_root: PathBuf,
    pub log_dir: PathBuf,
    pub instance_id: String,
    pub agent_timeout: Duration,
    pub token_config: TokenConfig,
}

impl FleetExecutor {
    /// Run a single claimed task through worktree acquisition, hooks, the
    /// agent, gate evaluation, assessment, and the resulting merge
    /// decision.
    pub async fn execute(&self, pool: &PgPool, task: &Task, executor: &ExecutorState) -> Result<AttemptOutcome> {
        let task_id = task.id;
        let attempt = task.attempt as u32;
        let task_key = task_id.to_string();
        let branch = format!("gator/{}", task.name);
        let base_branch = self.branch_routing.base_branch_for(&task.name).to_string();

        let worktree = self
            .worktrees
            .acquire(&branch, &task_key, &self.instance_id, Some(&base_branch))
            .await
            .with_context(|| format!("failed to acquire worktree for task {}", task.name))?;

        let ctx = HookContext {
            task_id: task_id.to_string(),
            task_title: task.name.clone(),
            branch_name: branch.clone(),
            worktree_path: worktree.path.display().to_string(),
            sdk: executor.sdk.clone(),
            repo_root: self.repo_root.display().to_string(),
            extra: HashMap::new(),
        };

        hooks::execute_hooks(HookEvent::SessionStart, &self.hooks, &ctx).await;

        dispatch::assign_task(pool, task_id, &executor.sdk, &worktree.path)
            .await
            .with_context(|| format!("failed to assign task {}", task.name))?;

        let task_description = materialize_task(pool, task_id)
            .await
            .with_context(|| format!("failed to materialize task {}", task.name))?;

        let invariants = inv_db::get_invariants_for_task(pool, task_id).await?;
        let invariant_commands: Vec<String> = invariants
            .iter()
            .map(|inv| {
                if inv.args.is_empty() {
                    inv.command.clone()
                } else {
                    format!("{} {}", inv.command, inv.args.join(" "))
                }
            })
            .collect();

        let agent_token = token::generate_token(&self.token_config, task_id, attempt);
        let mut env_vars = HashMap::new();
        env_vars.insert("GATOR_AGENT_TOKEN".to_string(), agent_token);
        env_vars.insert(
            "GATOR_TOKEN_SECRET".to_string(),
            hex::encode(&self.token_config.secret),
        );

        let materialized = MaterializedTask {
            task_id,
            name: task.name.clone(),
            description: task_description,
            invariant_commands,
            working_dir: worktree.path.clone(),
            env_vars,
        };

        let handle = self
            .agents
            .launch_or_resume(&task_key, &executor.sdk, materialized)
            .await
            .with_context(|| format!("failed to launch agent for task {}", task.name))?;

        dispatch::start_task(pool, task_id)
            .await
            .with_context(|| format!("failed to start task {}", task.name))?;

        let stream = self
            .agents
            .events(&executor.sdk, &handle)
            .context("agent pool has no event stream for the SDK it just spawned under")?;

        let collected = tokio::time::timeout(
            self.agent_timeout,
            collect_events(pool, task_id, task.attempt, stream),
        )
        .await;

        let last_message = match collected {
            Ok(Ok(msg)) => msg,
            Ok(Err(err)) => {
                warn!(task_id = %task_id, error = %err, "error collecting fleet attempt events");
                None
            }
            Err(_elapsed) => {
                warn!(task_id = %task_id, "fleet attempt timed out, failing task");
                dispatch::begin_checking(pool, task_id).await?;
                dispatch::fail_task(pool, task_id).await?;
                return Ok(AttemptOutcome::TimedOut);
            }
        };

        hooks::execute_hooks(HookEvent::SessionStop, &self.hooks, &ctx).await;

        let gate_runner = GateRunner::new(pool);
        let verdict = gate_runner
            .run_gate(task_id)
            .await
            .with_context(|| format!("gate check failed for task {}", task.name))?;
        let action = evaluate_verdict(pool, task_id, &verdict)
            .await
            .with_context(|| format!("failed to evaluate verdict for task {}", task.name))?;

        let outcome = match action {
            GateAction::AutoPassed => {
                hooks::execute_hooks(HookEvent::PreCommit, &self.hooks, &ctx).await;
                match crate::lifecycle::commit_agent_work(&worktree.path, &task.name, attempt) {
                    Ok(true) => info!(task_id = %task_id, "committed fleet attempt work"),
                    Ok(false) => info!(task_id = %task_id, "no changes to commit"),
                    Err(err) => warn!(task_id = %task_id, error = %err, "failed to commit fleet attempt work (non-fatal)"),
                }
                hooks::execute_hooks(HookEvent::PostCommit, &self.hooks, &ctx).await;
                AttemptOutcome::Passed
            }
            GateAction::AutoFailed { can_retry: true } => AttemptOutcome::FailedCanRetry,
            GateAction::AutoFailed { can_retry: false } => AttemptOutcome::FailedNoRetry,
            GateAction::HumanRequired => AttemptOutcome::HumanRequired,
        };

        let trigger = match outcome {
            AttemptOutcome::Passed => Trigger::AgentCompleted,
            AttemptOutcome::FailedCanRetry | AttemptOutcome::FailedNoRetry | AttemptOutcome::HumanRequired => {
                Trigger::AgentFailed
            }
            AttemptOutcome::TimedOut => unreachable!("timed out returns above"),
        };

        if let Err(err) = self
            .assess_and_enact(pool, task_id, task.attempt, &worktree.path, &executor.sdk, trigger, last_message)
            .await
        {
            warn!(task_id = %task_id, error = %err, "assessment/merge step failed for fleet attempt (non-fatal)");
        }

        match outcome {
            AttemptOutcome::Passed | AttemptOutcome::FailedNoRetry => {
                hooks::execute_hooks(HookEvent::TaskComplete, &self.hooks, &ctx).await;
                if let Err(err) = self.worktrees.release(&task_key).await {
                    warn!(task_id = %task_id, error = %err, "failed to release worktree after attempt");
                }
            }
            AttemptOutcome::FailedCanRetry => {
                if let Err(err) = task_db::retry_task_to_pending(pool, task_id, task.attempt).await {
                    warn!(task_id = %task_id, error = %err, "failed to requeue retryable task");
                }
            }
            AttemptOutcome::HumanRequired => {
                // Worktree stays checked out for whoever resolves the human review.
            }
            AttemptOutcome::TimedOut => unreachable!("timed out returns above"),
        }

        Ok(outcome)
    }

    /// Ask the assessor what should happen next and enact its decision.
    /// Errors here are non-fatal to the attempt: the gate already decided
    /// the task's terminal state, this only handles the PR/prompt-level
    /// follow-up.
    async fn assess_and_enact(
        &self,
        pool: &PgPool,
        task_id: Uuid,
        attempt: i32,
        worktree_path: &std::path::Path,
        sdk: &str,
        trigger: Trigger,
        last_agent_message: Option<String>,
    ) -> Result<()> {
        let task = task_db::get_task(pool, task_id)
            .await?
            .with_context(|| format!("task {task_id} vanished mid-attempt"))?;
        let decision_history = decisions::list_decisions_for_task(pool, task_id)
            .await
            .unwrap_or_default();

        let assessment_ctx = TaskAssessmentContext {
            trigger,
            task,
            decision_history,
            pr_stats: None,
            changed_files: Vec::new(),
            last_agent_message,
        };

        let decision = match assessor::quick_assess(&assessment_ctx) {
            Some(d) => d,
            None if self.branch_routing.sdk_assisted_assessment => {
                assessor::assess_task(&self.agents, sdk, &assessment_ctx).await?
            }
            None => AssessedDecision {
                action: "manual_review".to_string(),
                reason: "sdk-assisted assessment disabled; no heuristic matched".to_string(),
                prompt: None,
                wait_seconds: None,
            },
        };

        let ts_unix = now_unix();
        let decision_row = assessor::record_decision(
            pool,
            &self.log_dir,
            task_id,
            attempt,
            trigger,
            &decision,
            ts_unix,
        )
        .await
        .with_context(|| format!("failed to record assessment decision for task {task_id}"))?;

        let action = merge::parse_decision(&decision_row, None);
        let enact_outcome = merge::enact(&action, worktree_path).await?;
        if let Err(err) = merge::write_audit_log(&self.log_dir, task_id, ts_unix, &format!("{enact_outcome:?}")) {
            warn!(task_id = %task_id, error = %err, "failed to write merge audit log");
        }
        Ok(())
    }
}

fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Collect events from an agent's event stream, persisting each to the DB
/// and returning the text of the last `Message` event seen (fed to the
/// assessor as `last_agent_message`). Mirrors
/// [`crate::lifecycle`]'s private `collect_events`, but threads the last
/// message back out instead of discarding it.
async fn collect_events(
    pool: &PgPool,
    task_id: Uuid,
    attempt: i32,
    mut stream: std::pin::Pin<Box<dyn futures::Stream<Item = AgentEvent> + Send>>,
) -> Result<Option<String>> {
    let mut last_message = None;

    while let Some(event) = stream.next().await {
        let is_completed = matches!(event, AgentEvent::Completed);
        if let AgentEvent::Message { ref content, .. } = event {
            last_message = Some(content.clone());
        }

        let (event_type, payload) = serialize_agent_event(&event);
        let new_event = NewAgentEvent {
            task_id,
            attempt,
            event_type,
            payload,
        };

        if let Err(err) = agent_events::insert_agent_event(pool, &new_event).await {
            warn!(task_id = %task_id, error = %err, "failed to persist agent event (best-effort)");
        }

        if is_completed {
            break;
        }
    }

    Ok(last_message)
}

fn serialize_agent_event(event: &AgentEvent) -> (String, serde_json::Value) {
    match event {
        AgentEvent::Message { role, content } => (
            "message".to_string(),
            serde_json::json!({"role": role, "content": content}),
        ),
        AgentEvent::ToolCall { tool, input } => (
            "tool_call".to_string(),
            serde_json::json!({"tool": tool, "input": input}),
        ),
        AgentEvent::ToolResult { tool, output } => (
            "tool_result".to_string(),
            serde_json::json!({"tool": tool, "output": output}),
        ),
        AgentEvent::TokenUsage { input_tokens, output_tokens } => (
            "token_usage".to_string(),
            serde_json::json!({"input_tokens": input_tokens, "output_tokens": output_tokens}),
        ),
        AgentEvent::Error { message } => ("error".to_string(), serde_json::json!({"message": message})),
        AgentEvent::Completed => ("completed".to_string(), serde_json::json!({})),
    }
}
