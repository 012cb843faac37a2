//! Backend configuration.
//!
//! Every setting resolves from the CLI flag (or its environment variable),
//! then `~/.config/rentwire-backend/config.toml`, then the compiled default.
//! The resolved [`BackendConfig`] builds the [`BackendState`] the server
//! runs with.
//!
//! ```toml
//! [server]
//! bind_addr = "127.0.0.1:9000"
//! max_frame_size = 65536
//!
//! [auth]
//! allowed_tokens = ["renter-1", "owner-7"]
//! timeout_secs = 5
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use rentwire_proto::codec::MAX_FRAME_SIZE;

use crate::server::{BackendState, ServerSettings};

/// Errors that can occur when loading backend configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The config file exists but could not be read, or an explicit
    /// `--config` path is missing.
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The config file is not valid TOML for this schema.
    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),

    /// A setting is out of range.
    #[error("invalid {setting}: {reason}")]
    Invalid {
        /// Name of the offending setting.
        setting: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct BackendConfigFile {
    server: ServerSection,
    auth: AuthSection,
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ServerSection {
    bind_addr: Option<String>,
    max_frame_size: Option<usize>,
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct AuthSection {
    allowed_tokens: Option<Vec<String>>,
    timeout_secs: Option<u64>,
}

/// CLI arguments for the backend.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "RentWire development backend")]
pub struct BackendCliArgs {
    /// Address to bind the backend to.
    #[arg(short, long, env = "RENTWIRE_BACKEND_ADDR")]
    pub bind: Option<String>,

    /// Path to config file (default: `~/.config/rentwire-backend/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Token accepted by the handshake (repeatable). With none, any
    /// non-empty token is accepted.
    #[arg(long = "allow-token", value_name = "TOKEN")]
    pub allowed_tokens: Vec<String>,

    /// Seconds a new socket may wait before sending `authenticate`.
    #[arg(long = "auth-timeout", value_name = "SECS", env = "RENTWIRE_BACKEND_AUTH_TIMEOUT")]
    pub auth_timeout_secs: Option<u64>,

    /// Largest client frame in bytes.
    #[arg(long, value_name = "BYTES")]
    pub max_frame_size: Option<usize>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "RENTWIRE_BACKEND_LOG")]
    pub log_level: String,
}

/// Fully resolved backend configuration.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// Address to bind the server to (e.g., `0.0.0.0:9000`).
    pub bind_addr: String,
    /// Tokens accepted by the handshake. Empty accepts any non-empty token.
    pub allowed_tokens: Vec<String>,
    /// Per-connection limits.
    pub settings: ServerSettings,
    /// Log level filter string.
    pub log_level: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:9000".to_string(),
            allowed_tokens: Vec::new(),
            settings: ServerSettings::default(),
            log_level: "info".to_string(),
        }
    }
}

impl BackendConfig {
    /// Reads the config file and resolves it against `cli`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if an explicit config file is missing, any
    /// config file cannot be read or parsed, or a limit is out of range.
    pub fn load(cli: &BackendCliArgs) -> Result<Self, ConfigError> {
        let file = read_config_file(cli.config.as_deref())?;
        Self::resolve(cli, file)
    }

    fn resolve(cli: &BackendCliArgs, file: BackendConfigFile) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let auth_timeout = match cli.auth_timeout_secs.or(file.auth.timeout_secs) {
            Some(0) => {
                return Err(ConfigError::Invalid {
                    setting: "auth timeout",
                    reason: "must be at least one second".to_string(),
                });
            }
            Some(secs) => Duration::from_secs(secs),
            None => defaults.settings.auth_timeout,
        };
        let max_frame_size = cli
            .max_frame_size
            .or(file.server.max_frame_size)
            .unwrap_or(defaults.settings.max_frame_size);
        if max_frame_size == 0 || max_frame_size > MAX_FRAME_SIZE {
            return Err(ConfigError::Invalid {
                setting: "max frame size",
                reason: format!("{max_frame_size} is outside 1..={MAX_FRAME_SIZE}"),
            });
        }

        let allowed_tokens = if cli.allowed_tokens.is_empty() {
            file.auth.allowed_tokens.unwrap_or_default()
        } else {
            cli.allowed_tokens.clone()
        };

        Ok(Self {
            bind_addr: cli
                .bind
                .clone()
                .or(file.server.bind_addr)
                .unwrap_or(defaults.bind_addr),
            allowed_tokens,
            settings: ServerSettings {
                auth_timeout,
                max_frame_size,
            },
            log_level: cli.log_level.clone(),
        })
    }

    /// Backend state with this configuration's allow-list and limits.
    #[must_use]
    pub fn build_state(&self) -> BackendState {
        let state = if self.allowed_tokens.is_empty() {
            BackendState::new()
        } else {
            BackendState::with_allowed_tokens(self.allowed_tokens.iter().cloned())
        };
        state.with_settings(self.settings)
    }
}

/// Reads the explicit config file, or the default one if it exists.
fn read_config_file(explicit: Option<&Path>) -> Result<BackendConfigFile, ConfigError> {
    let (path, required) = match explicit {
        Some(path) => (path.to_path_buf(), true),
        None => match dirs::config_dir() {
            Some(dir) => (dir.join("rentwire-backend").join("config.toml"), false),
            None => return Ok(BackendConfigFile::default()),
        },
    };
    let contents = match std::fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(e) if !required && e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(BackendConfigFile::default());
        }
        Err(source) => return Err(ConfigError::ReadFile { path, source }),
    };
    Ok(toml::from_str(&contents)?)
}
