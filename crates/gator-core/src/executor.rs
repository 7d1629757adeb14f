//! Executor scheduler: picks which configured SDK/variant pair handles the
//! next attempt, and tracks per-executor health across restarts via
//! `gator_db::queries::executors`.

use std::sync::Mutex;

use anyhow::{Context, Result, bail};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use gator_db::models::{ExecutorRole, ExecutorState};
use gator_db::queries::executors as db;

/// How the scheduler picks among the available executors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailoverStrategy {
    /// Always return the primary; never fails over automatically.
    PrimaryOnly,
    /// Cycle through enabled executors in role order.
    RoundRobin,
    /// Pick proportionally to each executor's configured weight.
    Weighted,
}

impl FailoverStrategy {
    /// Parse from the `FAILOVER_STRATEGY` env var convention
    /// (`next_in_line` -> round robin, `weighted_random` -> weighted).
    pub fn parse(s: &str) -> Self {
        match s {
            "weighted_random" => Self::Weighted,
            "primary_only" => Self::PrimaryOnly,
            _ => Self::RoundRobin,
        }
    }
}

/// Health/cooldown configuration for the scheduler.
#[derive(Debug, Clone)]
pub struct ExecutorSchedulerConfig {
    pub strategy: FailoverStrategy,
    pub disable_after_consecutive_failures: i32,
    pub cooldown_minutes: i64,
}

impl Default for ExecutorSchedulerConfig {
    fn default() -> Self {
        Self {
            strategy: FailoverStrategy::RoundRobin,
            disable_after_consecutive_failures: 3,
            cooldown_minutes: 15,
        }
    }
}

/// The `[executors]` config-file section's failover knobs, mirrored here
/// (rather than in `gator-cli`) so `ExecutorSchedulerConfig::from_env_and_file`
/// can depend on the shape without `gator-core` depending on `gator-cli`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutorsFileConfig {
    pub executors: Option<String>,
    pub failover_strategy: Option<String>,
    pub failover_max_retries: Option<i32>,
    pub failover_cooldown_min: Option<i64>,
    pub failover_disable_after: Option<i32>,
}

impl ExecutorSchedulerConfig {
    /// Resolve via the standard chain: env var > config-file section >
    /// built-in default. There is no CLI flag for these -- failover policy
    /// is fleet-wide, not per-invocation.
    pub fn from_env_and_file(file: Option<&ExecutorsFileConfig>) -> Self {
        let default = Self::default();

        let strategy = std::env::var("FAILOVER_STRATEGY")
            .ok()
            .map(|s| FailoverStrategy::parse(&s))
            .or_else(|| file.and_then(|f| f.failover_strategy.as_deref()).map(FailoverStrategy::parse))
            .unwrap_or(default.strategy);

        let disable_after_consecutive_failures = env_parse::<i32>("FAILOVER_DISABLE_AFTER")
            .or_else(|| file.and_then(|f| f.failover_disable_after))
            .unwrap_or(default.disable_after_consecutive_failures);

        let cooldown_minutes = env_parse::<i64>("FAILOVER_COOLDOWN_MIN")
            .or_else(|| file.and_then(|f| f.failover_cooldown_min))
            .unwrap_or(default.cooldown_minutes);

        Self {
            strategy,
            disable_after_consecutive_failures,
            cooldown_minutes,
        }
    }
}

fn env_parse<T: std::str::FromStr>(var: &str) -> Option<T> {
    std::env::var(var).ok().and_then(|v| v.parse().ok())
}

/// In-memory executor health/selection layer, backed by the `executor_state`
/// table for durability across restarts.
///
/// The round-robin cursor is the only purely in-memory state; everything
/// else (weights, roles, cooldowns) is re-read from the database on every
/// call, so multiple gator instances converge on the same view.
pub struct ExecutorScheduler {
    config: ExecutorSchedulerConfig,
    round_robin_cursor: Mutex<usize>,
}

impl ExecutorScheduler {
    pub fn new(config: ExecutorSchedulerConfig) -> Self {
        Self {
            config,
            round_robin_cursor: Mutex::new(0),
        }
    }

    /// Register or update an executor's configuration (idempotent).
    pub async fn register(
        &self,
        pool: &PgPool,
        name: &str,
        sdk: &str,
        variant: &str,
        weight: i32,
        role: ExecutorRole,
    ) -> Result<ExecutorState> {
        db::upsert_executor(
            pool,
            &db::NewExecutor {
                name,
                sdk,
                variant,
                weight,
                role,
            },
        )
        .await
    }

    /// Whether an executor is currently usable: enabled and not in cooldown.
    fn is_available(executor: &ExecutorState) -> bool {
        executor.enabled
            && executor
                .cooldown_until
                .map(|until| Utc::now() >= until)
                .unwrap_or(true)
    }

    /// Pick the next executor to use for a dispatch, per the configured
    /// strategy. Returns an error only if no executors are registered at all.
    pub async fn select(&self, pool: &PgPool) -> Result<ExecutorState> {
        let all = db::list_executors(pool).await?;
        if all.is_empty() {
            bail!("no executors registered");
        }

        let available: Vec<&ExecutorState> = all.iter().filter(|e| Self::is_available(e)).collect();

        // Never stall the fleet entirely: if everything is disabled, reset
        // the round-robin cursor and hand back the primary regardless.
        if available.is_empty() {
            *self.round_robin_cursor.lock().expect("cursor lock poisoned") = 0;
            return primary_of(&all).cloned().with_context(|| "no primary executor configured");
        }

        match self.config.strategy {
            FailoverStrategy::PrimaryOnly => primary_of(&available)
                .or_else(|| available.first().copied())
                .cloned()
                .context("no executor available"),
            FailoverStrategy::RoundRobin => {
                let mut cursor = self.round_robin_cursor.lock().expect("cursor lock poisoned");
                let mut ordered = available.clone();
                ordered.sort_by_key(|e| role_priority(e.role));
                let pick = ordered[*cursor % ordered.len()].clone();
                *cursor = (*cursor + 1) % ordered.len();
                Ok(pick)
            }
            FailoverStrategy::Weighted => Ok(weighted_pick(&available).clone()),
        }
    }

    /// Return the next executor to fail over to, excluding `current`.
    /// Never returns an executor with the same id as `current`.
    pub async fn get_failover(&self, pool: &PgPool, current: &ExecutorState) -> Result<ExecutorState> {
        let all = db::list_executors(pool).await?;
        let candidates: Vec<&ExecutorState> = all
            .iter()
            .filter(|e| e.id != current.id && Self::is_available(e))
            .collect();

        if candidates.is_empty() {
            // Fall back to the primary even if disabled, as long as it
            // isn't `current` -- the alternative is returning nothing at
            // all, which would stop the fleet.
            return all
                .iter()
                .find(|e| e.id != current.id)
                .cloned()
                .context("no other executor configured to fail over to");
        }

        let picked = match self.config.strategy {
            FailoverStrategy::Weighted => weighted_pick(&candidates),
            _ => {
                let mut ordered = candidates.clone();
                ordered.sort_by_key(|e| role_priority(e.role));
                ordered[0]
            }
        };
        Ok(picked.clone())
    }

    /// Record a failed attempt for `executor`, placing it in cooldown once
    /// `disable_after_consecutive_failures` is reached.
    pub async fn record_failure(&self, pool: &PgPool, executor: &ExecutorState) -> Result<()> {
        let cooldown_until = Utc::now() + Duration::minutes(self.config.cooldown_minutes);
        db::record_failure(
            pool,
            executor.id,
            self.config.disable_after_consecutive_failures,
            cooldown_until,
        )
        .await?;
        Ok(())
    }

    /// Record a successful attempt, clearing failure/cooldown state.
    pub async fn record_success(&self, pool: &PgPool, executor: &ExecutorState) -> Result<()> {
        db::record_success(pool, executor.id).await?;
        Ok(())
    }
}

fn role_priority(role: ExecutorRole) -> u8 {
    match role {
        ExecutorRole::Primary => 0,
        ExecutorRole::Backup => 1,
        ExecutorRole::Tertiary => 2,
    }
}

fn primary_of<'a>(executors: &[&'a ExecutorState]) -> Option<&'a ExecutorState> {
    executors
        .iter()
        .find(|e| e.role == ExecutorRole::Primary)
        .copied()
}

/// Pick proportionally to weight using a deterministic accumulator keyed by
/// a counter derived from the current time, rather than a full RNG -- the
/// distribution only needs to be roughly proportional across many calls.
fn weighted_pick<'a>(executors: &[&'a ExecutorState]) -> &'a ExecutorState {
    use rand::Rng;
    let total: i64 = executors.iter().map(|e| e.weight.max(0) as i64).sum();
    if total <= 0 {
        return executors[0];
    }
    let mut roll = rand::rng().random_range(0..total);
    for e in executors {
        let w = e.weight.max(0) as i64;
        if roll < w {
            return e;
        }
        roll -= w;
    }
    executors[executors.len() - 1]
}

/// Parse the `EXECUTORS` env var convention: comma-separated
/// `SDK:VARIANT:WEIGHT` triples, e.g. `CODEX:DEFAULT:50,COPILOT:VARIANT:50`.
/// Role is assigned by position: first entry is primary, second backup,
/// remaining tertiary.
pub fn parse_executors_env(value: &str) -> Result<Vec<(String, String, i32, ExecutorRole)>> {
    let mut out = Vec::new();
    for (idx, entry) in value.split(',').map(str::trim).filter(|s| !s.is_empty()).enumerate() {
        let parts: Vec<&str> = entry.split(':').collect();
        if parts.len() != 3 {
            bail!("invalid EXECUTORS entry {entry:?}: expected SDK:VARIANT:WEIGHT");
        }
        let weight: i32 = parts[2]
            .parse()
            .with_context(|| format!("invalid weight in EXECUTORS entry {entry:?}"))?;
        let role = match idx {
            0 => ExecutorRole::Primary,
            1 => ExecutorRole::Backup,
            _ => ExecutorRole::Tertiary,
        };
        out.push((parts[0].to_lowercase(), parts[1].to_lowercase(), weight, role));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn strategy_parse() {
        assert_eq!(FailoverStrategy::parse("next_in_line"), FailoverStrategy::RoundRobin);
        assert_eq!(FailoverStrategy::parse("weighted_random"), FailoverStrategy::Weighted);
        assert_eq!(FailoverStrategy::parse("primary_only"), FailoverStrategy::PrimaryOnly);
        assert_eq!(FailoverStrategy::parse("bogus"), FailoverStrategy::RoundRobin);
    }

    #[test]
    fn parse_executors_env_assigns_roles_by_position() {
        let parsed = parse_executors_env("CODEX:DEFAULT:50,COPILOT:VARIANT:50,CLAUDE:X:10").unwrap();
        assert_eq!(parsed.len(), 3);
        assert_eq!(parsed[0].3, ExecutorRole::Primary);
        assert_eq!(parsed[1].3, ExecutorRole::Backup);
        assert_eq!(parsed[2].3, ExecutorRole::Tertiary);
        assert_eq!(parsed[0].0, "codex");
        assert_eq!(parsed[0].2, 50);
    }

    #[test]
    fn parse_executors_env_rejects_malformed_entry() {
        assert!(parse_executors_env("CODEX:DEFAULT").is_err());
        assert!(parse_executors_env("CODEX:DEFAULT:abc").is_err());
    }

    fn fake_executor(role: ExecutorRole, enabled: bool) -> ExecutorState {
        ExecutorState {
            id: Uuid::new_v4(),
            name: format!("{role}"),
            sdk: "claude-code".to_string(),
            variant: "default".to_string(),
            weight: 1,
            role,
            enabled,
            consecutive_failures: 0,
            cooldown_until: None,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn is_available_respects_cooldown() {
        let mut e = fake_executor(ExecutorRole::Primary, true);
        assert!(ExecutorScheduler::is_available(&e));
        e.cooldown_until = Some(Utc::now() + Duration::minutes(5));
        assert!(!ExecutorScheduler::is_available(&e));
        e.cooldown_until = Some(Utc::now() - Duration::minutes(5));
        assert!(ExecutorScheduler::is_available(&e));
    }

    #[test]
    fn is_available_respects_enabled_flag() {
        let e = fake_executor(ExecutorRole::Primary, false);
        assert!(!ExecutorScheduler::is_available(&e));
    }

    #[test]
    fn role_priority_orders_primary_first() {
        assert!(role_priority(ExecutorRole::Primary) < role_priority(ExecutorRole::Backup));
        assert!(role_priority(ExecutorRole::Backup) < role_priority(ExecutorRole::Tertiary));
    }

    #[test]
    fn weighted_pick_returns_first_when_total_zero() {
        let a = fake_executor(ExecutorRole::Primary, true);
        let mut b = fake_executor(ExecutorRole::Backup, true);
        let refs_owned = vec![a.clone(), b.clone()];
        let _ = &mut b;
        let refs: Vec<&ExecutorState> = refs_owned.iter().collect();
        // Zero-out weights to exercise the degenerate branch.
        let zeroed: Vec<ExecutorState> = refs
            .iter()
            .map(|e| {
                let mut e = (*e).clone();
                e.weight = 0;
                e
            })
            .collect();
        let zeroed_refs: Vec<&ExecutorState> = zeroed.iter().collect();
        let picked = weighted_pick(&zeroed_refs);
        assert_eq!(picked.id, zeroed[0].id);
    }
}
