//! Configuration system for the socialchat client.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/socialchat/config.toml`)
//! 4. Compiled defaults
//!
//! Missing config file is not an error (defaults are used). An explicit
//! `--config` path that doesn't exist is an error.

use std::path::PathBuf;
use std::time::Duration;

use socialchat_proto::id::UserId;

use crate::client::ChatSettings;
use crate::transport::websocket::DEFAULT_CONNECT_TIMEOUT;

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the TOML configuration.
    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    backend: BackendFileConfig,
    session: SessionFileConfig,
    reconnect: ReconnectFileConfig,
    history: HistoryFileConfig,
    client: ClientFileConfig,
}

/// `[backend]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct BackendFileConfig {
    url: Option<String>,
    connect_timeout_secs: Option<u64>,
}

/// `[session]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct SessionFileConfig {
    token: Option<String>,
    user_id: Option<String>,
    peer_id: Option<String>,
}

/// `[reconnect]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ReconnectFileConfig {
    initial_delay_ms: Option<u64>,
    backoff_multiplier: Option<u32>,
    max_delay_ms: Option<u64>,
    max_attempts: Option<u32>,
}

/// `[history]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct HistoryFileConfig {
    page_size: Option<u32>,
    marker_ttl_secs: Option<u64>,
}

/// `[client]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ClientFileConfig {
    event_buffer: Option<usize>,
}

// ---------------------------------------------------------------------------
// Resolved configuration (concrete types, all fields populated)
// ---------------------------------------------------------------------------

/// When and how often to reconnect after an unclean close.
///
/// The default retries every 3 seconds for as long as a token is retained.
/// A multiplier above 1 turns this into exponential backoff capped at
/// `max_delay`; `max_attempts` bounds the number of consecutive retries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectConfig {
    /// Delay before the first reconnect attempt.
    pub initial_delay: Duration,
    /// Factor applied to the delay after each failed attempt.
    pub backoff_multiplier: u32,
    /// Upper bound on the delay.
    pub max_delay: Duration,
    /// Consecutive attempts before giving up. `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(3),
            backoff_multiplier: 1,
            max_delay: Duration::from_secs(60),
            max_attempts: None,
        }
    }
}

impl ReconnectConfig {
    /// Delay before consecutive attempt number `attempt` (1-based), or
    /// `None` once the attempt budget is exhausted.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || self.max_attempts.is_some_and(|max| attempt > max) {
            return None;
        }
        let factor = self.backoff_multiplier.max(1).saturating_pow(attempt - 1);
        Some(
            self.initial_delay
                .saturating_mul(factor)
                .min(self.max_delay.max(self.initial_delay)),
        )
    }
}

/// Identity and credentials for one chat session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Bearer token handed to the WebSocket endpoint.
    pub token: String,
    /// The logged-in user.
    pub user_id: UserId,
    /// The user to chat with.
    pub peer_id: UserId,
}

/// Fully resolved client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    // -- Backend --
    /// Backend origin, e.g. `https://api.example.com`.
    pub backend_url: Option<String>,
    /// Timeout for the WebSocket handshake.
    pub connect_timeout: Duration,

    // -- Session --
    /// Session token.
    pub token: Option<String>,
    /// Local user ID.
    pub user_id: Option<String>,
    /// Peer user ID.
    pub peer_id: Option<String>,

    // -- Reconnect --
    /// Reconnect policy.
    pub reconnect: ReconnectConfig,

    // -- History --
    /// Page size for history requests.
    pub history_page_size: u32,
    /// Lifetime of history request markers.
    pub history_marker_ttl: Option<Duration>,

    // -- Client --
    /// Buffer size for the client event channel.
    pub event_buffer: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            backend_url: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            token: None,
            user_id: None,
            peer_id: None,
            reconnect: ReconnectConfig::default(),
            history_page_size: 50,
            history_marker_ttl: None,
            event_buffer: 256,
        }
    }
}

impl ClientConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// CLI args and env vars are parsed via `clap`. If `--config` is given
    /// and the file does not exist, returns an error. If no `--config` is
    /// given, the default path (`~/.config/socialchat/config.toml`) is tried
    /// and silently ignored if missing.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the config file cannot be read or parsed.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Ok(Self::resolve(cli, &file))
    }

    /// Resolve from CLI args and env vars alone, as if no config file existed.
    ///
    /// Used when the config file is unreadable so the flags still apply.
    #[must_use]
    pub fn from_cli(cli: &CliArgs) -> Self {
        Self::resolve(cli, &ConfigFile::default())
    }

    /// Resolve a `ClientConfig` from CLI args and a parsed config file.
    ///
    /// Priority: CLI > file > default.
    #[must_use]
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Self {
        let defaults = Self::default();

        Self {
            backend_url: cli
                .backend_url
                .clone()
                .or_else(|| file.backend.url.clone()),
            connect_timeout: file
                .backend
                .connect_timeout_secs
                .map_or(defaults.connect_timeout, Duration::from_secs),
            token: cli.token.clone().or_else(|| file.session.token.clone()),
            user_id: cli
                .user_id
                .clone()
                .or_else(|| file.session.user_id.clone()),
            peer_id: cli.peer.clone().or_else(|| file.session.peer_id.clone()),
            reconnect: ReconnectConfig {
                initial_delay: file
                    .reconnect
                    .initial_delay_ms
                    .map_or(defaults.reconnect.initial_delay, Duration::from_millis),
                backoff_multiplier: file
                    .reconnect
                    .backoff_multiplier
                    .unwrap_or(defaults.reconnect.backoff_multiplier),
                max_delay: file
                    .reconnect
                    .max_delay_ms
                    .map_or(defaults.reconnect.max_delay, Duration::from_millis),
                max_attempts: file.reconnect.max_attempts,
            },
            history_page_size: cli
                .page_size
                .or(file.history.page_size)
                .unwrap_or(defaults.history_page_size),
            history_marker_ttl: file.history.marker_ttl_secs.map(Duration::from_secs),
            event_buffer: file
                .client
                .event_buffer
                .unwrap_or(defaults.event_buffer),
        }
    }

    /// Settings for [`crate::client::ChatClient`].
    #[must_use]
    pub fn chat_settings(&self) -> ChatSettings {
        ChatSettings {
            backend_origin: self.backend_url.clone(),
            reconnect: self.reconnect.clone(),
            history_marker_ttl: self.history_marker_ttl,
            event_buffer: self.event_buffer,
        }
    }

    /// Build a [`SessionConfig`] if token, user and peer are all present.
    ///
    /// Returns `None` if any of them is missing or blank.
    #[must_use]
    pub fn session(&self) -> Option<SessionConfig> {
        let token = self.token.clone().filter(|t| !t.trim().is_empty())?;
        let user_id = UserId::new(self.user_id.clone()?);
        let peer_id = UserId::new(self.peer_id.clone()?);

        if user_id.is_blank() || peer_id.is_blank() {
            return None;
        }

        Some(SessionConfig {
            token,
            user_id,
            peer_id,
        })
    }
}

/// CLI arguments parsed by clap.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Real-time chat client for the social feed backend")]
pub struct CliArgs {
    /// Backend origin (http:// or https://).
    #[arg(long, env = "SOCIALCHAT_BACKEND_URL")]
    pub backend_url: Option<String>,

    /// Session token issued by the backend.
    #[arg(long, env = "SOCIALCHAT_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Your user ID.
    #[arg(long, env = "SOCIALCHAT_USER_ID")]
    pub user_id: Option<String>,

    /// User to chat with.
    #[arg(long, env = "SOCIALCHAT_PEER")]
    pub peer: Option<String>,

    /// Messages per history page.
    #[arg(long)]
    pub page_size: Option<u32>,

    /// Path to config file (default: `~/.config/socialchat/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "SOCIALCHAT_LOG")]
    pub log_level: String,

    /// Path to log file (default: `$TMPDIR/socialchat.log`).
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Load and parse a TOML config file.
///
/// If `explicit_path` is `Some`, the file must exist (error if not).
/// If `explicit_path` is `None`, the default path is tried and missing file
/// is treated as empty config.
fn load_config_file(explicit_path: Option<&std::path::Path>) -> Result<ConfigFile, ConfigError> {
    let path = if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    } else {
        let Some(config_dir) = dirs::config_dir() else {
            return Ok(ConfigFile::default());
        };
        config_dir.join("socialchat").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
