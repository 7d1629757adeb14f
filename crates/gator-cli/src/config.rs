//! Configuration file management for gator.
//!
//! Provides a TOML-based config file at `~/.config/gator/config.toml` and a
//! resolution chain: CLI flag > env var > config file > default.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use gator_core::agent_pool::AgentPoolFileConfig;
use gator_core::branch_routing::{BranchRouting, BranchRoutingFileConfig};
use gator_core::executor::{ExecutorSchedulerConfig, ExecutorsFileConfig};
use gator_core::fleet::{FleetFileConfig, FleetSettings};
use gator_core::hooks::HooksFileConfig;
use gator_core::scheduler::SchedulerConfig;
use gator_core::token::TokenConfig;
use gator_db::config::DbConfig;

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigFile {
    pub database: DatabaseSection,
    pub auth: AuthSection,
    #[serde(default)]
    pub agent_pool: AgentPoolFileConfig,
    #[serde(default)]
    pub executors: ExecutorsFileConfig,
    #[serde(default)]
    pub fleet: FleetFileConfig,
    #[serde(default)]
    pub hooks: HooksFileConfig,
    #[serde(default)]
    pub branch_routing: BranchRoutingFileConfig,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DatabaseSection {
    pub url: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AuthSection {
    /// Hex-encoded token secret (64 hex chars = 32 bytes).
    pub token_secret: String,
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the gator config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/gator` or `~/.config/gator`.
/// We intentionally ignore the platform-specific `dirs::config_dir()`
/// (which returns `~/Library/Application Support` on macOS).
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("gator");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("gator")
}

/// Return the path to the gator config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load and parse the config file. Returns an error if it does not exist.
pub fn load_config() -> Result<ConfigFile> {
    let path = config_path();
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents).context("failed to parse config file")?;
    Ok(config)
}

/// Serialize and write the config file, creating parent dirs as needed.
/// Sets file permissions to 0600 on Unix.
pub fn save_config(config: &ConfigFile) -> Result<()> {
    let path = config_path();
    let dir = config_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create config directory {}", dir.display()))?;

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    // Set permissions to 0600 (owner read/write only) on Unix.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(&path, perms)
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

// -----------------------------------------------------------------------
// Token secret generation
// -----------------------------------------------------------------------

/// Generate a random token secret: 32 random bytes, hex-encoded (64 chars).
pub fn generate_token_secret() -> String {
    use rand::Rng;
    let mut bytes = [0u8; 32];
    rand::rng().fill(&mut bytes);
    hex::encode(bytes)
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Fully resolved configuration, ready for use.
#[derive(Debug)]
pub struct GatorConfig {
    pub db_config: DbConfig,
    pub token_config: TokenConfig,
    pub agent_pool: AgentPoolFileConfig,
    pub executor_scheduler: ExecutorSchedulerConfig,
    pub scheduler: SchedulerConfig,
    pub fleet_settings: FleetSettings,
    pub branch_routing: BranchRouting,
    pub hooks: HooksFileConfig,
}

impl GatorConfig {
    /// Resolve configuration using the chain: CLI flag > env var > config file > default.
    ///
    /// - DB URL: `cli_db_url` > `GATOR_DATABASE_URL` env > `config_file.database.url` > `DbConfig::DEFAULT_URL`
    /// - Token secret: `GATOR_TOKEN_SECRET` env > `config_file.auth.token_secret` (hex-decoded) > error
    /// - Everything else (`[agent_pool]`, `[executors]`, `[fleet]`, `[hooks]`,
    ///   `[branch_routing]`) follows each module's own `from_env_and_file`.
    pub fn resolve(cli_db_url: Option<&str>) -> Result<Self> {
        let file_config = load_config().ok();

        // DB URL resolution.
        let db_url = if let Some(url) = cli_db_url {
            url.to_string()
        } else if let Ok(url) = std::env::var("GATOR_DATABASE_URL") {
            url
        } else if let Some(ref cfg) = file_config {
            cfg.database.url.clone()
        } else {
            DbConfig::DEFAULT_URL.to_string()
        };
        let db_config = DbConfig::new(db_url);

        // Token secret resolution.
        let token_config = if let Ok(secret_hex) = std::env::var("GATOR_TOKEN_SECRET") {
            let bytes = hex::decode(&secret_hex)
                .context("GATOR_TOKEN_SECRET env var is not valid hex")?;
            TokenConfig::new(bytes)
        } else if let Some(ref cfg) = file_config {
            let bytes = hex::decode(&cfg.auth.token_secret)
                .context("invalid hex in config file token_secret")?;
            TokenConfig::new(bytes)
        } else {
            bail!(
                "token secret not found; set GATOR_TOKEN_SECRET or run `gator init` to create a config file"
            );
        };

        let agent_pool = file_config.as_ref().map(|c| c.agent_pool.clone()).unwrap_or_default();
        let executor_scheduler = ExecutorSchedulerConfig::from_env_and_file(file_config.as_ref().map(|c| &c.executors));
        let scheduler = SchedulerConfig::from_env_and_file(file_config.as_ref().map(|c| &c.fleet.scheduler));
        let fleet_settings = FleetSettings::from_env_and_file(None, None, file_config.as_ref().map(|c| &c.fleet));
        let branch_routing = BranchRouting::from_env_and_file(file_config.as_ref().map(|c| &c.branch_routing));
        let hooks = file_config.as_ref().map(|c| c.hooks.clone()).unwrap_or_default();

        Ok(Self {
            db_config,
            token_config,
            agent_pool,
            executor_scheduler,
            scheduler,
            fleet_settings,
            branch_routing,
            hooks,
        })
    }
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------
