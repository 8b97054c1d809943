//! Configuration file management for verdict.
//!
//! Provides a TOML-based config file at `~/.config/verdict/config.toml` and
//! a resolution chain: CLI flag > env var > config file > default.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use verdict_core::log::LogConfig;
use verdict_core::service::ServiceConfig;
use verdict_core::tail::TailConfig;
use verdict_db::config::DbConfig;

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigFile {
    pub database: DatabaseSection,
    #[serde(default)]
    pub agent: AgentSection,
    #[serde(default)]
    pub relay: RelaySection,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DatabaseSection {
    pub url: String,
    /// Pool size. SSE readers poll through this pool.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<u32>,
}

/// The external agent process that produces a check's messages.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// Kill the agent after this many seconds. Unset means no limit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogBackend {
    #[default]
    Postgres,
    Memory,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaySection {
    pub poll_interval_ms: u64,
    pub retention_secs: u64,
    pub max_events: usize,
    pub max_input_chars: usize,
    pub log_backend: LogBackend,
}

impl Default for RelaySection {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            retention_secs: 24 * 60 * 60,
            max_events: 1000,
            max_input_chars: 5000,
            log_backend: LogBackend::Postgres,
        }
    }
}

impl RelaySection {
    pub fn log_config(&self) -> LogConfig {
        LogConfig {
            retention: Duration::from_secs(self.retention_secs),
            max_events: self.max_events.max(1),
        }
    }

    pub fn service_config(&self) -> ServiceConfig {
        ServiceConfig {
            max_input_chars: self.max_input_chars,
            tail: TailConfig {
                poll_interval: Duration::from_millis(self.poll_interval_ms.max(1)),
            },
        }
    }
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the verdict config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/verdict` or
/// `~/.config/verdict`, never the platform-specific `dirs::config_dir()`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("verdict");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("verdict")
}

/// Return the path to the verdict config file.
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
    parse_config(&contents)
}

fn parse_config(contents: &str) -> Result<ConfigFile> {
    toml::from_str(contents).context("failed to parse config file")
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
// Resolved config
// -----------------------------------------------------------------------

/// Fully resolved configuration, ready for use.
#[derive(Debug)]
pub struct VerdictConfig {
    pub db_config: DbConfig,
    pub agent: AgentSection,
    pub relay: RelaySection,
}

impl VerdictConfig {
    /// Resolve configuration using the chain: CLI flag > env var > config file > default.
    ///
    /// - DB URL: `cli_db_url` > `VERDICT_DATABASE_URL` > `[database] url` > `DbConfig::DEFAULT_URL`
    /// - Agent command: `VERDICT_AGENT_COMMAND` > `[agent] command`
    /// - Relay settings: `[relay]` > defaults
    ///
    /// A config file that exists but cannot be parsed is an error.
    pub fn resolve(cli_db_url: Option<&str>) -> Result<Self> {
        let path = config_path();
        let file_config = if path.exists() {
            Some(load_config()?)
        } else {
            None
        };
        Self::resolve_with(cli_db_url, file_config)
    }

    fn resolve_with(cli_db_url: Option<&str>, file_config: Option<ConfigFile>) -> Result<Self> {
        let (file_db_url, max_connections, mut agent, relay) = match file_config {
            Some(cfg) => (
                Some(cfg.database.url),
                cfg.database.max_connections,
                cfg.agent,
                cfg.relay,
            ),
            None => (None, None, AgentSection::default(), RelaySection::default()),
        };

        let db_url = if let Some(url) = cli_db_url {
            url.to_string()
        } else if let Ok(url) = std::env::var("VERDICT_DATABASE_URL") {
            url
        } else if let Some(url) = file_db_url {
            url
        } else {
            DbConfig::DEFAULT_URL.to_string()
        };

        if let Ok(command) = std::env::var("VERDICT_AGENT_COMMAND") {
            if command.trim().is_empty() {
                bail!("VERDICT_AGENT_COMMAND is set but empty");
            }
            agent.command = Some(command);
        }

        let mut db_config = DbConfig::new(db_url);
        if let Some(max_connections) = max_connections {
            db_config = db_config.with_max_connections(max_connections);
        }

        Ok(Self {
            db_config,
            agent,
            relay,
        })
    }

    /// Agent timeout, if one is configured.
    pub fn agent_timeout(&self) -> Option<Duration> {
        self.agent.timeout_secs.map(Duration::from_secs)
    }
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------
