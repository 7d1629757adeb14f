//! Multi-instance presence and coordinator election.
//!
//! Several gator instances can share one Postgres backlog (see
//! [`crate::board`]); this module tracks which instances are alive and picks
//! one of them as the coordinator responsible for running maintenance and
//! the scheduler's poll loop. Coordinator status is advisory only -- task
//! claims are always fenced by the board's atomic compare-and-swap, never by
//! whoever currently holds coordinator status.

use std::collections::HashMap;
use std::fs;

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

/// How long an instance's presence record is considered active without a
/// fresh heartbeat.
fn active_ttl() -> Duration {
    Duration::minutes(5)
}

/// Role an instance advertises itself as willing to play.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceRole {
    Coordinator,
    Worker,
}

/// A single gator instance's last-known presence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Presence {
    pub instance_id: String,
    pub hostname: String,
    pub role: InstanceRole,
    pub coordinator_eligible: bool,
    /// Lower priority values win coordinator elections.
    pub priority: i32,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

impl Presence {
    fn is_active(&self, now: DateTime<Utc>) -> bool {
        now - self.last_heartbeat <= active_ttl()
    }
}

#[derive(Default, Serialize, Deserialize)]
struct PresenceFile {
    instances: HashMap<String, Presence>,
}

#[derive(Serialize, Deserialize)]
struct InstanceIdFile {
    instance_id: String,
}

/// Load this machine's instance id, synthesizing and persisting a new one
/// (`<hostname>-<8 hex chars>`) on first run.
pub fn load_or_create_instance_id(path: &std::path::Path) -> String {
    if let Ok(contents) = fs::read_to_string(path) {
        if let Ok(file) = serde_json::from_str::<InstanceIdFile>(&contents) {
            return file.instance_id;
        }
    }

    let hostname = hostname_string();
    let suffix: u32 = rand::rng().random_range(0..0xFFFF_FFFFu32);
    let instance_id = format!("{hostname}-{suffix:08x}");

    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    let file = InstanceIdFile {
        instance_id: instance_id.clone(),
    };
    if let Ok(contents) = serde_json::to_string_pretty(&file) {
        if let Err(err) = fs::write(path, contents) {
            warn!(error = %err, "failed to persist instance id");
        }
    }
    instance_id
}

fn hostname_string() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| {
            std::process::Command::new("hostname")
                .output()
                .ok()
                .and_then(|out| String::from_utf8(out.stdout).ok())
                .map(|s| s.trim().to_string())
        })
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "unknown-host".to_string())
}

/// The `[fleet]` config-file section. Mirrors the `FLEET_*` env vars so an
/// operator who doesn't want to pass `--coordinator-eligible`/`--priority`
/// on every `gator serve` invocation can pin them once. The scheduler's own
/// poll/heartbeat/claim knobs live here too, under `[fleet.scheduler]` --
/// they're fleet-wide settings, not per-instance ones, so they belong next
/// to coordinator election rather than a section of their own.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FleetFileConfig {
    pub coordinator_eligible: Option<bool>,
    pub priority: Option<i32>,
    #[serde(default)]
    pub scheduler: crate::scheduler::SchedulerFileConfig,
}

/// Resolved fleet-membership settings for this instance.
#[derive(Debug, Clone, Copy)]
pub struct FleetSettings {
    pub coordinator_eligible: bool,
    pub priority: i32,
}

impl FleetSettings {
    /// Resolve via CLI flag > env var > config-file section > default
    /// (eligible, priority 0). `cli_*` are `None` when the flag wasn't
    /// passed, so the chain can fall through to env/file/default.
    pub fn from_env_and_file(
        cli_coordinator_eligible: Option<bool>,
        cli_priority: Option<i32>,
        file: Option<&FleetFileConfig>,
    ) -> Self {
        let coordinator_eligible = cli_coordinator_eligible
            .or_else(|| std::env::var("FLEET_COORDINATOR_ELIGIBLE").ok().and_then(|v| v.parse().ok()))
            .or_else(|| file.and_then(|f| f.coordinator_eligible))
            .unwrap_or(true);

        let priority = cli_priority
            .or_else(|| std::env::var("FLEET_PRIORITY").ok().and_then(|v| v.parse().ok()))
            .or_else(|| file.and_then(|f| f.priority))
            .unwrap_or(0);

        Self {
            coordinator_eligible,
            priority,
        }
    }
}

/// Tracks presence of every gator instance sharing this backlog and decides
/// who coordinates.
pub struct FleetRegistry {
    path: std::path::PathBuf,
}

impl FleetRegistry {
    pub fn new(path: std::path::PathBuf) -> Self {
        Self { path }
    }

    pub fn load_default() -> Self {
        Self::new(crate::paths::presence_path())
    }

    fn read(&self) -> PresenceFile {
        fs::read_to_string(&self.path)
            .ok()
            .and_then(|c| serde_json::from_str(&c).ok())
            .unwrap_or_default()
    }

    fn write(&self, file: &PresenceFile) {
        if let Some(parent) = self.path.parent() {
            if let Err(err) = fs::create_dir_all(parent) {
                warn!(error = %err, "failed to create presence directory");
                return;
            }
        }
        match serde_json::to_string_pretty(file) {
            Ok(contents) => {
                if let Err(err) = fs::write(&self.path, contents) {
                    warn!(error = %err, "failed to persist presence file");
                }
            }
            Err(err) => warn!(error = %err, "failed to serialize presence file"),
        }
    }

    /// Record (or refresh) this instance's heartbeat.
    pub fn heartbeat(
        &self,
        instance_id: &str,
        role: InstanceRole,
        coordinator_eligible: bool,
        priority: i32,
    ) {
        let mut file = self.read();
        let now = Utc::now();
        let entry = file
            .instances
            .entry(instance_id.to_string())
            .or_insert_with(|| Presence {
                instance_id: instance_id.to_string(),
                hostname: hostname_string(),
                role,
                coordinator_eligible,
                priority,
                started_at: now,
                last_heartbeat: now,
            });
        entry.role = role;
        entry.coordinator_eligible = coordinator_eligible;
        entry.priority = priority;
        entry.last_heartbeat = now;
        self.write(&file);
    }

    /// Drop this instance's presence record (clean shutdown).
    pub fn deregister(&self, instance_id: &str) {
        let mut file = self.read();
        file.instances.remove(instance_id);
        self.write(&file);
    }

    /// List presence records still within the active TTL.
    pub fn list_active(&self) -> Vec<Presence> {
        let now = Utc::now();
        self.read()
            .instances
            .into_values()
            .filter(|p| p.is_active(now))
            .collect()
    }

    /// Pick the coordinator among active instances.
    ///
    /// Prefers instances advertising `coordinator_eligible && role ==
    /// Coordinator`; if none qualify, falls back to all active instances so
    /// the fleet always has *someone* running maintenance. Ties are broken
    /// by ascending priority, then earliest `started_at`, then
    /// `instance_id` for full determinism.
    pub fn select_coordinator(&self) -> Option<String> {
        let active = self.list_active();
        let mut eligible: Vec<&Presence> = active
            .iter()
            .filter(|p| p.coordinator_eligible && p.role == InstanceRole::Coordinator)
            .collect();

        if eligible.is_empty() {
            eligible = active.iter().collect();
        }

        eligible
            .into_iter()
            .min_by(|a, b| {
                a.priority
                    .cmp(&b.priority)
                    .then(a.started_at.cmp(&b.started_at))
                    .then(a.instance_id.cmp(&b.instance_id))
            })
            .map(|p| p.instance_id.clone())
    }

    /// Whether `instance_id` is currently the elected coordinator.
    pub fn is_coordinator(&self, instance_id: &str) -> bool {
        self.select_coordinator().as_deref() == Some(instance_id)
    }
}
