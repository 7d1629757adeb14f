//! Lifecycle assessor: decides what should happen next to a task whenever
//! something interesting happens to it -- an agent finished, a rebase
//! failed, CI went red, a PR got merged out from under it.
//!
//! Two tiers feed the same [`Decision`] shape: [`quick_assess`] is pure,
//! synchronous pattern matching over the trigger and recent history, cheap
//! enough to run on every event; [`assess_task`] is the fallback when the
//! heuristics don't have a confident answer, and asks an agent to read the
//! situation and hand back a decision as JSON. Parsing that JSON is a
//! cascade of total parsers ending in [`AssessedDecision::manual_review`],
//! mirroring [`crate::gate::evaluator`] and [`crate::merge::parse_decision`].

use std::collections::HashMap;
use std::io::Write as _;
use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::Result;
use gator_db::models::{Decision, Task};
use gator_db::queries::decisions::{self, NewDecision};
use serde::Deserialize;
use sqlx::PgPool;
use tracing::warn;
use uuid::Uuid;

use crate::agent_pool::AgentPool;
use crate::harness::{AgentEvent, MaterializedTask};

/// Window within which a repeat trigger for the same task is deduplicated
/// rather than re-assessed.
const DEDUP_WINDOW: Duration = Duration::from_secs(5 * 60);

/// What caused this assessment to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    AgentCompleted,
    AgentFailed,
    RebaseFailed,
    IdleDetected,
    PrMergedDownstream,
    CiFailed,
    ConflictDetected,
    ManualRequest,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::AgentCompleted => "agent_completed",
            Trigger::AgentFailed => "agent_failed",
            Trigger::RebaseFailed => "rebase_failed",
            Trigger::IdleDetected => "idle_detected",
            Trigger::PrMergedDownstream => "pr_merged_downstream",
            Trigger::CiFailed => "ci_failed",
            Trigger::ConflictDetected => "conflict_detected",
            Trigger::ManualRequest => "manual_request",
        }
    }
}

/// Basic CI/PR stats the assessor can use without calling an agent.
#[derive(Debug, Clone, Default)]
pub struct PrStats {
    pub pr_number: Option<u64>,
    pub ci_passing: Option<bool>,
    pub mergeable: Option<bool>,
}

/// Everything an assessment needs to decide what happens next.
#[derive(Debug, Clone)]
pub struct TaskAssessmentContext {
    pub trigger: Trigger,
    pub task: Task,
    pub decision_history: Vec<Decision>,
    pub pr_stats: Option<PrStats>,
    pub changed_files: Vec<String>,
    pub last_agent_message: Option<String>,
}

/// The decision an assessment arrives at, independent of whether it came
/// from the quick heuristics or the AI fallback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssessedDecision {
    pub action: String,
    pub reason: String,
    pub prompt: Option<String>,
    pub wait_seconds: Option<i32>,
}

impl AssessedDecision {
    fn manual_review(reason: impl Into<String>) -> Self {
        Self {
            action: "manual_review".to_string(),
            reason: reason.into(),
            prompt: None,
            wait_seconds: None,
        }
    }

    fn merge() -> Self {
        Self {
            action: "merge_after_ci_pass".to_string(),
            reason: "CI is green and the change is mergeable".to_string(),
            prompt: None,
            wait_seconds: None,
        }
    }

    fn wait(seconds: i32, reason: impl Into<String>) -> Self {
        Self {
            action: "wait".to_string(),
            reason: reason.into(),
            prompt: None,
            wait_seconds: Some(seconds),
        }
    }

    fn re_attempt(reason: impl Into<String>) -> Self {
        Self {
            action: "re_attempt".to_string(),
            reason: reason.into(),
            prompt: None,
            wait_seconds: None,
        }
    }

    fn prompt(message: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            action: "prompt".to_string(),
            reason: reason.into(),
            prompt: Some(message.into()),
            wait_seconds: None,
        }
    }
}

/// Pure, synchronous heuristics. Returns `None` when no rule confidently
/// applies, signaling the caller should fall back to [`assess_task`].
pub fn quick_assess(ctx: &TaskAssessmentContext) -> Option<AssessedDecision> {
    match ctx.trigger {
        Trigger::PrMergedDownstream => Some(AssessedDecision {
            action: "noop".to_string(),
            reason: "PR already merged downstream, nothing left to do".to_string(),
            prompt: None,
            wait_seconds: None,
        }),
        Trigger::CiFailed => {
            let repeated_ci_failure = ctx
                .decision_history
                .iter()
                .filter(|d| d.trigger == Trigger::CiFailed.as_str())
                .count()
                >= 2;
            if repeated_ci_failure {
                Some(AssessedDecision::manual_review(
                    "CI has failed repeatedly on this task; needs a human look",
                ))
            } else {
                Some(AssessedDecision::re_attempt("CI failed, retrying the task from scratch"))
            }
        }
        Trigger::RebaseFailed | Trigger::ConflictDetected => {
            Some(AssessedDecision::manual_review("merge conflict requires human resolution"))
        }
        Trigger::IdleDetected => Some(AssessedDecision::prompt(
            "Are you still working on this task? Please continue or report status.",
            "agent went idle, nudging it to continue",
        )),
        Trigger::AgentCompleted => {
            if let Some(stats) = &ctx.pr_stats {
                if stats.ci_passing == Some(true) && stats.mergeable == Some(true) {
                    return Some(AssessedDecision::merge());
                }
                if stats.ci_passing == Some(false) {
                    return Some(AssessedDecision::wait(120, "CI still running or just failed, waiting"));
                }
            }
            None
        }
        Trigger::AgentFailed | Trigger::ManualRequest => None,
    }
}

/// Decide deterministically whether a repeat trigger for `task_id` should
/// be skipped as a duplicate of one already assessed within
/// [`DEDUP_WINDOW`].
pub struct Deduplicator {
    last_seen: Mutex<HashMap<Uuid, Instant>>,
}

impl Default for Deduplicator {
    fn default() -> Self {
        Self::new()
    }
}

impl Deduplicator {
    pub fn new() -> Self {
        Self {
            last_seen: Mutex::new(HashMap::new()),
        }
    }

    /// Returns `true` if this task was already assessed within the dedup
    /// window and should be skipped; otherwise records `now` and returns
    /// `false`.
    pub fn should_skip(&self, task_id: Uuid, now: Instant) -> bool {
        let mut map = self.last_seen.lock().expect("dedup lock poisoned");
        if let Some(last) = map.get(&task_id) {
            if now.duration_since(*last) < DEDUP_WINDOW {
                return true;
            }
        }
        map.insert(task_id, now);
        false
    }
}

/// Raw JSON shape the assessment agent is asked to return.
#[derive(Debug, Deserialize)]
struct RawAssessmentResponse {
    action: Option<String>,
    reason: Option<String>,
    prompt: Option<String>,
    wait_seconds: Option<i32>,
}

/// Parse an agent's raw text response into an [`AssessedDecision`],
/// defaulting to manual review for anything that doesn't parse cleanly.
fn parse_assessment_response(raw: &str) -> AssessedDecision {
    let json_start = raw.find('{');
    let json_end = raw.rfind('}');
    let (Some(start), Some(end)) = (json_start, json_end) else {
        return AssessedDecision::manual_review("assessment response contained no JSON object");
    };
    if end < start {
        return AssessedDecision::manual_review("assessment response had malformed JSON bounds");
    }

    match serde_json::from_str::<RawAssessmentResponse>(&raw[start..=end]) {
        Ok(parsed) => {
            let Some(action) = parsed.action else {
                return AssessedDecision::manual_review("assessment response missing action field");
            };
            AssessedDecision {
                action,
                reason: parsed.reason.unwrap_or_else(|| "no reason given".to_string()),
                prompt: parsed.prompt,
                wait_seconds: parsed.wait_seconds,
            }
        }
        Err(err) => AssessedDecision::manual_review(format!("failed to parse assessment JSON: {err}")),
    }
}

const ASSESSMENT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Ask an agent to read the situation and return a decision. Used only
/// when [`quick_assess`] returns `None`.
pub async fn assess_task(
    pool: &AgentPool,
    sdk: &str,
    ctx: &TaskAssessmentContext,
) -> Result<AssessedDecision> {
    let prompt = build_assessment_prompt(ctx);
    let task = MaterializedTask {
        task_id: ctx.task.id,
        name: format!("assess-{}", ctx.task.name),
        description: prompt,
        invariant_commands: vec![],
        working_dir: std::path::PathBuf::from(
            ctx.task.worktree_path.clone().unwrap_or_else(|| "/tmp".to_string()),
        ),
        env_vars: HashMap::new(),
    };

    let run = tokio::time::timeout(ASSESSMENT_TIMEOUT, run_and_collect(pool, sdk, task)).await;

    match run {
        Ok(Ok(text)) => Ok(parse_assessment_response(&text)),
        Ok(Err(err)) => Ok(AssessedDecision::manual_review(format!("assessment agent failed: {err}"))),
        Err(_) => Ok(AssessedDecision::manual_review("assessment agent timed out")),
    }
}

async fn run_and_collect(pool: &AgentPool, sdk: &str, task: MaterializedTask) -> Result<String> {
    use futures::StreamExt;

    let handle = pool.launch_ephemeral(sdk, &task).await?;

    // Collecting events directly here (rather than through lifecycle::
    // collect_events, which persists to the DB) because an assessment run
    // isn't a task attempt -- it doesn't get its own agent_events rows.
    let mut messages = String::new();
    if let Some(mut stream) = pool.events(sdk, &handle) {
        while let Some(event) = stream.next().await {
            match event {
                AgentEvent::Message { content, .. } => {
                    messages.push_str(&content);
                    messages.push('\n');
                }
                AgentEvent::Completed => break,
                _ => {}
            }
        }
    }
    Ok(messages)
}

fn build_assessment_prompt(ctx: &TaskAssessmentContext) -> String {
    let mut prompt = format!(
        "Task {:?} triggered assessment: {}.\n",
        ctx.task.name,
        ctx.trigger.as_str()
    );
    if let Some(msg) = &ctx.last_agent_message {
        prompt.push_str(&format!("Last agent message:\n{msg}\n"));
    }
    if !ctx.changed_files.is_empty() {
        prompt.push_str(&format!("Changed files: {}\n", ctx.changed_files.join(", ")));
    }
    prompt.push_str(
        "Respond with a single JSON object: \
         {\"action\": one of merge_after_ci_pass|prompt|prompt_new_session|re_attempt|wait|manual_review|close_pr|noop, \
         \"reason\": string, \"prompt\": optional string, \"wait_seconds\": optional integer}.",
    );
    prompt
}

/// Persist an assessment as both a `Decision` row and a plain-text audit
/// log under `log_dir`.
pub async fn record_decision(
    pool: &PgPool,
    log_dir: &Path,
    task_id: Uuid,
    attempt: i32,
    trigger: Trigger,
    decision: &AssessedDecision,
    ts_unix: i64,
) -> Result<Decision> {
    let row = decisions::insert_decision(
        pool,
        &NewDecision {
            task_id,
            attempt,
            trigger: trigger.as_str(),
            action: &decision.action,
            reason: &decision.reason,
            prompt: decision.prompt.as_deref(),
            wait_seconds: decision.wait_seconds,
        },
    )
    .await?;

    if let Err(err) = write_assessment_log(log_dir, task_id, trigger, ts_unix, decision) {
        warn!(task_id = %task_id, error = %err, "failed to write assessment audit log");
    }

    Ok(row)
}

fn write_assessment_log(
    log_dir: &Path,
    task_id: Uuid,
    trigger: Trigger,
    ts_unix: i64,
    decision: &AssessedDecision,
) -> Result<()> {
    std::fs::create_dir_all(log_dir)?;
    let short = task_id.simple().to_string()[..8].to_string();
    let path = log_dir.join(format!(
        "assessment-{short}-{}-{ts_unix}.log",
        trigger.as_str()
    ));
    let mut file = std::fs::File::create(&path)?;
    writeln!(file, "action={}", decision.action)?;
    writeln!(file, "reason={}", decision.reason)?;
    if let Some(p) = &decision.prompt {
        writeln!(file, "prompt={p}")?;
    }
    if let Some(w) = decision.wait_seconds {
        writeln!(file, "wait_seconds={w}")?;
    }
    Ok(())
}
