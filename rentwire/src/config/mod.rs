//! Configuration system for the `RentWire` client.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/rentwire/config.toml`)
//! 4. Compiled defaults
//!
//! Missing config file is not an error (defaults are used). An explicit
//! `--config` path that doesn't exist is an error.

use std::path::PathBuf;
use std::time::Duration;

use rentwire_proto::message::{ConversationId, UserId};

use crate::client::SyncConfig;
use crate::connection::ConnectionConfig;
use crate::typing::TypingConfig;

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
    server: ServerFileConfig,
    session: SessionFileConfig,
    sync: SyncFileConfig,
    typing: TypingFileConfig,
}

/// `[server]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ServerFileConfig {
    url: Option<String>,
    token: Option<String>,
}

/// `[session]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct SessionFileConfig {
    user: Option<String>,
    rooms: Option<Vec<String>>,
}

/// `[sync]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct SyncFileConfig {
    handshake_timeout_secs: Option<u64>,
    reconnect_base_ms: Option<u64>,
    max_reconnect_attempts: Option<u32>,
    bus_capacity: Option<usize>,
}

/// `[typing]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct TypingFileConfig {
    auto_stop_ms: Option<u64>,
    ttl_ms: Option<u64>,
    sweep_interval_ms: Option<u64>,
}

// ---------------------------------------------------------------------------
// Resolved configuration (concrete types, all fields populated)
// ---------------------------------------------------------------------------

/// Fully resolved client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    // -- Server --
    /// Backend WebSocket URL.
    pub url: Option<String>,
    /// Bearer token presented on connect.
    pub token: Option<String>,

    // -- Session --
    /// Local user id, if known before authentication.
    pub user: Option<String>,
    /// Rooms to join on startup.
    pub rooms: Vec<String>,

    // -- Sync --
    /// Connect attempt timeout, handshake included.
    pub handshake_timeout: Duration,
    /// Reconnect delay unit.
    pub reconnect_base: Duration,
    /// Reconnect attempts before giving up.
    pub max_reconnect_attempts: u32,
    /// Events buffered per bus subscriber.
    pub bus_capacity: usize,

    // -- Typing --
    /// Outbound typing auto-stop.
    pub typing_auto_stop: Duration,
    /// Inbound typing entry lifetime.
    pub typing_ttl: Duration,
    /// Inbound typing sweep period.
    pub typing_sweep_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let sync = SyncConfig::default();
        Self {
            url: None,
            token: None,
            user: None,
            rooms: Vec::new(),
            handshake_timeout: sync.connection.handshake_timeout,
            reconnect_base: sync.connection.base_delay,
            max_reconnect_attempts: sync.connection.max_attempts,
            bus_capacity: sync.bus_capacity,
            typing_auto_stop: sync.typing.auto_stop,
            typing_ttl: sync.typing.ttl,
            typing_sweep_interval: sync.typing.sweep_interval,
        }
    }
}

impl ClientConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// If `--config` is given and the file does not exist, returns an
    /// error. Otherwise the default path (`~/.config/rentwire/config.toml`)
    /// is tried and silently ignored if missing.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the config file cannot be read or parsed.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Ok(Self::resolve(cli, &file))
    }

    /// Resolve a `ClientConfig` from CLI args and a parsed config file.
    ///
    /// Priority: CLI > file > default.
    #[must_use]
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Self {
        let defaults = Self::default();

        Self {
            url: cli.url.clone().or_else(|| file.server.url.clone()),
            token: cli.token.clone().or_else(|| file.server.token.clone()),
            user: cli.user.clone().or_else(|| file.session.user.clone()),
            rooms: if cli.rooms.is_empty() {
                file.session.rooms.clone().unwrap_or_default()
            } else {
                cli.rooms.clone()
            },
            handshake_timeout: file
                .sync
                .handshake_timeout_secs
                .map_or(defaults.handshake_timeout, Duration::from_secs),
            reconnect_base: file
                .sync
                .reconnect_base_ms
                .map_or(defaults.reconnect_base, Duration::from_millis),
            max_reconnect_attempts: file
                .sync
                .max_reconnect_attempts
                .unwrap_or(defaults.max_reconnect_attempts),
            bus_capacity: file.sync.bus_capacity.unwrap_or(defaults.bus_capacity),
            typing_auto_stop: file
                .typing
                .auto_stop_ms
                .map_or(defaults.typing_auto_stop, Duration::from_millis),
            typing_ttl: file
                .typing
                .ttl_ms
                .map_or(defaults.typing_ttl, Duration::from_millis),
            typing_sweep_interval: file
                .typing
                .sweep_interval_ms
                .map_or(defaults.typing_sweep_interval, Duration::from_millis),
        }
    }

    /// Engine settings derived from this configuration.
    #[must_use]
    pub fn to_sync_config(&self) -> SyncConfig {
        SyncConfig {
            connection: ConnectionConfig {
                handshake_timeout: self.handshake_timeout,
                base_delay: self.reconnect_base,
                max_attempts: self.max_reconnect_attempts,
            },
            typing: TypingConfig {
                auto_stop: self.typing_auto_stop,
                ttl: self.typing_ttl,
                sweep_interval: self.typing_sweep_interval,
            },
            bus_capacity: self.bus_capacity,
            local_user: self.user.clone().map(UserId::from),
        }
    }

    /// Startup rooms as typed ids.
    #[must_use]
    pub fn room_ids(&self) -> Vec<ConversationId> {
        self.rooms.iter().map(|r| ConversationId::new(r.as_str())).collect()
    }
}

/// CLI arguments parsed by clap.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Headless RentWire conversation client")]
pub struct CliArgs {
    /// WebSocket URL of the messaging backend.
    #[arg(long, env = "RENTWIRE_URL")]
    pub url: Option<String>,

    /// Bearer token used to authenticate.
    #[arg(long, env = "RENTWIRE_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Local user id, used until the backend reports one.
    #[arg(long, env = "RENTWIRE_USER")]
    pub user: Option<String>,

    /// Conversation to join on startup (repeatable).
    #[arg(long = "join", value_name = "CONVERSATION")]
    pub rooms: Vec<String>,

    /// Path to config file (default: `~/.config/rentwire/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "RENTWIRE_LOG")]
    pub log_level: String,

    /// Path to log file (default: `$TMPDIR/rentwire.log`).
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
        config_dir.join("rentwire").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_engine_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.handshake_timeout, Duration::from_secs(10));
        assert_eq!(config.reconnect_base, Duration::from_millis(1_000));
        assert_eq!(config.max_reconnect_attempts, 5);
        assert_eq!(config.typing_auto_stop, Duration::from_secs(3));
        assert_eq!(config.typing_ttl, Duration::from_secs(5));
        assert!(config.url.is_none());
        assert!(config.rooms.is_empty());
    }

    #[test]
    fn toml_parsing_full() {
        let toml_str = r#"
[server]
url = "wss://chat.example.com/ws"
token = "tok-123"

[session]
user = "alice"
rooms = ["listing-1", "listing-2"]

[sync]
handshake_timeout_secs = 20
reconnect_base_ms = 500
max_reconnect_attempts = 8
bus_capacity = 1024

[typing]
auto_stop_ms = 2000
ttl_ms = 6000
sweep_interval_ms = 250
"#;
        let file: ConfigFile = toml::from_str(toml_str).unwrap();
        let config = ClientConfig::resolve(&CliArgs::default(), &file);

        assert_eq!(config.url.as_deref(), Some("wss://chat.example.com/ws"));
        assert_eq!(config.token.as_deref(), Some("tok-123"));
        assert_eq!(config.user.as_deref(), Some("alice"));
        assert_eq!(config.rooms, vec!["listing-1", "listing-2"]);
        assert_eq!(config.handshake_timeout, Duration::from_secs(20));
        assert_eq!(config.reconnect_base, Duration::from_millis(500));
        assert_eq!(config.max_reconnect_attempts, 8);
        assert_eq!(config.bus_capacity, 1024);
        assert_eq!(config.typing_auto_stop, Duration::from_secs(2));
        assert_eq!(config.typing_ttl, Duration::from_secs(6));
        assert_eq!(config.typing_sweep_interval, Duration::from_millis(250));
    }

    #[test]
    fn toml_parsing_partial() {
        let toml_str = r#"
[server]
url = "ws://custom:9000/ws"
"#;
        let file: ConfigFile = toml::from_str(toml_str).unwrap();
        let config = ClientConfig::resolve(&CliArgs::default(), &file);

        assert_eq!(config.url.as_deref(), Some("ws://custom:9000/ws"));
        assert_eq!(config.handshake_timeout, Duration::from_secs(10));
        assert_eq!(config.max_reconnect_attempts, 5);
    }

    #[test]
    fn cli_overrides_file() {
        let toml_str = r#"
[server]
url = "ws://file:9000/ws"
token = "file-token"

[session]
rooms = ["from-file"]
"#;
        let file: ConfigFile = toml::from_str(toml_str).unwrap();
        let cli = CliArgs {
            url: Some("ws://cli:9000/ws".to_string()),
            rooms: vec!["from-cli".to_string()],
            ..Default::default()
        };
        let config = ClientConfig::resolve(&cli, &file);

        assert_eq!(config.url.as_deref(), Some("ws://cli:9000/ws"));
        assert_eq!(config.token.as_deref(), Some("file-token"));
        assert_eq!(config.rooms, vec!["from-cli"]);
    }

    #[test]
    fn sync_config_carries_resolved_values() {
        let config = ClientConfig {
            user: Some("alice".into()),
            max_reconnect_attempts: 3,
            typing_ttl: Duration::from_secs(9),
            ..Default::default()
        };
        let sync = config.to_sync_config();
        assert_eq!(sync.connection.max_attempts, 3);
        assert_eq!(sync.typing.ttl, Duration::from_secs(9));
        assert_eq!(sync.local_user, Some(UserId::new("alice")));
    }

    #[test]
    fn missing_config_file_returns_defaults() {
        assert!(load_config_file(None).is_ok());
    }

    #[test]
    fn explicit_missing_config_file_returns_error() {
        let result = load_config_file(Some(std::path::Path::new("/nonexistent/config.toml")));
        assert!(matches!(result, Err(ConfigError::ReadFile { .. })));
    }

    #[test]
    fn malformed_toml_is_an_error() {
        let result: Result<ConfigFile, _> = toml::from_str("[sync]\nmax_reconnect_attempts = \"many\"");
        assert!(result.is_err());
    }
}
