//! Configuration Management
//!
//! Loads the authority and client tuning from TOML files.
//! Configuration includes:
//! - Server settings (bind address)
//! - Authority behavior (heartbeats, cursor throttling, autosave, lifecycle)
//! - Reconnection budget for clients
//! - Identity secret and token lifetime
//! - Diagram store selection

use crate::errors::SyncError;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub authority: AuthorityConfig,

    #[serde(default)]
    pub reconnect: ReconnectConfig,

    #[serde(default)]
    pub identity: IdentityConfig,

    #[serde(default)]
    pub store: StoreConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Messages queued per connection before its participant is dropped
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,
    /// Longest accepted inbound line; longer lines close the connection
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            outbound_queue: default_outbound_queue(),
            max_line_bytes: default_max_line_bytes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorityConfig {
    /// Expected interval between client pings
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Consecutive missed heartbeats before a participant is treated as gone
    #[serde(default = "default_missed_heartbeats")]
    pub missed_heartbeats: u32,
    /// Minimum spacing between fanned-out cursor updates per participant
    #[serde(default = "default_cursor_throttle_ms")]
    pub cursor_throttle_ms: u64,
    /// Keep a document's state after its last participant leaves
    #[serde(default)]
    pub retain_empty_documents: bool,
    /// Quiet period after the last mutation before the graph is saved
    #[serde(default = "default_autosave_debounce_ms")]
    pub autosave_debounce_ms: u64,
    /// Bounded command queue per document actor
    #[serde(default = "default_mailbox_capacity")]
    pub mailbox_capacity: usize,
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            missed_heartbeats: default_missed_heartbeats(),
            cursor_throttle_ms: default_cursor_throttle_ms(),
            retain_empty_documents: false,
            autosave_debounce_ms: default_autosave_debounce_ms(),
            mailbox_capacity: default_mailbox_capacity(),
        }
    }
}

impl AuthorityConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Silence longer than this counts as an implicit leave.
    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_interval() * self.missed_heartbeats
    }

    pub fn cursor_throttle(&self) -> Duration {
        Duration::from_millis(self.cursor_throttle_ms)
    }

    pub fn autosave_debounce(&self) -> Duration {
        Duration::from_millis(self.autosave_debounce_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default = "default_token_ttl_secs")]
    pub token_ttl_secs: u64,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            secret: None,
            token_ttl_secs: default_token_ttl_secs(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    /// Keep diagrams in process memory only
    #[default]
    Memory,
    /// One JSON file per diagram under `store.path`
    File,
}

impl std::fmt::Display for StoreKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreKind::Memory => write!(f, "memory"),
            StoreKind::File => write!(f, "file"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub kind: StoreKind,
    #[serde(default)]
    pub path: Option<PathBuf>,
}

fn default_bind() -> String {
    "127.0.0.1:3001".to_string()
}
fn default_outbound_queue() -> usize {
    1_024
}
fn default_max_line_bytes() -> usize {
    1024 * 1024
}
fn default_heartbeat_interval_ms() -> u64 {
    30_000
}
fn default_missed_heartbeats() -> u32 {
    3
}
fn default_cursor_throttle_ms() -> u64 {
    100
}
fn default_autosave_debounce_ms() -> u64 {
    2_000
}
fn default_mailbox_capacity() -> usize {
    256
}
fn default_max_attempts() -> u32 {
    5
}
fn default_base_delay_ms() -> u64 {
    1_000
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_token_ttl_secs() -> u64 {
    3_600
}

impl Config {
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut config = match path {
            Some(p) => {
                let content = std::fs::read_to_string(p)
                    .with_context(|| format!("Failed to read config from {}", p))?;
                Self::from_toml(&content)?
            }
            None => {
                let home_config = dirs::home_dir().map(|h| h.join(".config/diagramsync/config.toml"));

                let mut default_paths = vec![PathBuf::from("diagramsync.toml")];
                if let Some(hc) = home_config {
                    default_paths.push(hc);
                }

                let mut loaded = None;
                for p in &default_paths {
                    if let Ok(content) = std::fs::read_to_string(p) {
                        tracing::debug!(path = %p.display(), "Loaded config file");
                        loaded = Some(Self::from_toml(&content)?);
                        break;
                    }
                }
                loaded.unwrap_or_else(|| {
                    tracing::debug!("No config file found, using defaults");
                    Self::default()
                })
            }
        };

        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse config")
    }

    /// Override file settings from `DIAGRAMSYNC_*` variables.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(bind) = lookup("DIAGRAMSYNC_BIND") {
            self.server.bind = bind;
        }
        if let Some(secret) = lookup("DIAGRAMSYNC_SECRET") {
            self.identity.secret = Some(secret);
        }
        if let Some(path) = lookup("DIAGRAMSYNC_STORE_PATH") {
            self.store.kind = StoreKind::File;
            self.store.path = Some(PathBuf::from(path));
        }
        if let Some(ms) = lookup("DIAGRAMSYNC_HEARTBEAT_MS") {
            if let Ok(ms) = ms.parse::<u64>() {
                self.authority.heartbeat_interval_ms = ms;
            }
        }
    }

    pub fn validate(&self) -> std::result::Result<(), SyncError> {
        if self.server.outbound_queue == 0 || self.server.max_line_bytes == 0 {
            return Err(SyncError::Config(
                "server.outbound_queue and server.max_line_bytes must be > 0".into(),
            ));
        }
        let a = &self.authority;
        if a.heartbeat_interval_ms == 0 {
            return Err(SyncError::Config("authority.heartbeat_interval_ms must be > 0".into()));
        }
        if a.missed_heartbeats == 0 {
            return Err(SyncError::Config("authority.missed_heartbeats must be > 0".into()));
        }
        if a.mailbox_capacity == 0 {
            return Err(SyncError::Config("authority.mailbox_capacity must be > 0".into()));
        }
        if self.reconnect.base_delay_ms == 0 || self.reconnect.max_delay_ms < self.reconnect.base_delay_ms {
            return Err(SyncError::Config(
                "reconnect delays must satisfy 0 < base_delay_ms <= max_delay_ms".into(),
            ));
        }
        if self.store.kind == StoreKind::File && self.store.path.is_none() {
            return Err(SyncError::Config("store.path is required for the file store".into()));
        }
        Ok(())
    }

    /// Stricter check used before serving: tokens cannot be verified without a secret.
    pub fn validate_for_serving(&self) -> std::result::Result<(), SyncError> {
        self.validate()?;
        match self.identity.secret.as_deref() {
            Some(s) if !s.is_empty() => Ok(()),
            _ => Err(SyncError::Config(
                "identity.secret (or DIAGRAMSYNC_SECRET) is required to serve".into(),
            )),
        }
    }
}
