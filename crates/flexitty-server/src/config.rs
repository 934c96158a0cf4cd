//! Server configuration: TOML file + CLI overrides.

use crate::session::BrokerOptions;
use flexitty_core::{FlexiError, FlexiResult};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub session: SessionSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_address")]
    pub address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
    #[serde(default = "default_true")]
    pub replay_on_attach: bool,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            address: default_address(),
            port: default_port(),
            send_timeout_ms: default_send_timeout_ms(),
            replay_on_attach: true,
        }
    }
}

/// `[session]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionSection {
    #[serde(default = "default_command")]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
    #[serde(default = "default_cols")]
    pub cols: u16,
    #[serde(default = "default_rows")]
    pub rows: u16,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            command: default_command(),
            args: Vec::new(),
            buffer_capacity: default_buffer_capacity(),
            cols: default_cols(),
            rows: default_rows(),
        }
    }
}

fn default_address() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8000
}
fn default_send_timeout_ms() -> u64 {
    5000
}
fn default_command() -> String {
    std::env::var("SHELL").unwrap_or_else(|_| "bash".to_string())
}
fn default_buffer_capacity() -> usize {
    crate::session::ring_buffer::DEFAULT_CAPACITY
}
fn default_cols() -> u16 {
    80
}
fn default_rows() -> u16 {
    24
}
fn default_true() -> bool {
    true
}

/// Values given on the command line; `None` means "use the file/default".
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub address: Option<String>,
    pub port: Option<u16>,
    pub command: Option<String>,
    pub args: Vec<String>,
    pub buffer_capacity: Option<usize>,
}

/// Resolved server configuration (file loaded, CLI overrides applied, validated).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub command: String,
    pub args: Vec<String>,
    pub broker: BrokerOptions,
}

impl ServerConfig {
    /// Load config from a TOML file (if it exists), then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, cli: CliOverrides) -> FlexiResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    parse(&content)?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };
        Self::resolve(file_config, cli)
    }

    /// Merge CLI overrides over file values and validate the result.
    pub fn resolve(file: ConfigFile, cli: CliOverrides) -> FlexiResult<Self> {
        let address = cli.address.unwrap_or(file.server.address);
        let port = cli.port.unwrap_or(file.server.port);
        let listen: SocketAddr = format!("{address}:{port}")
            .parse()
            .map_err(|e| FlexiError::Config(format!("invalid listen address {address}:{port}: {e}")))?;

        // Arguments only make sense together with the command they belong to.
        let (command, args) = match cli.command {
            Some(command) => (command, cli.args),
            None => (file.session.command, file.session.args),
        };
        if command.trim().is_empty() {
            return Err(FlexiError::Config("session command must not be empty".into()));
        }

        let buffer_capacity = cli.buffer_capacity.unwrap_or(file.session.buffer_capacity);
        if buffer_capacity == 0 {
            return Err(FlexiError::Config("buffer_capacity must be greater than zero".into()));
        }
        if file.session.cols == 0 || file.session.rows == 0 {
            return Err(FlexiError::Config(format!(
                "invalid terminal size {}x{}",
                file.session.cols, file.session.rows
            )));
        }
        if file.server.send_timeout_ms == 0 {
            return Err(FlexiError::Config("send_timeout_ms must be greater than zero".into()));
        }

        Ok(Self {
            listen,
            command,
            args,
            broker: BrokerOptions {
                buffer_capacity,
                cols: file.session.cols,
                rows: file.session.rows,
                send_timeout: Duration::from_millis(file.server.send_timeout_ms),
                replay_on_attach: file.server.replay_on_attach,
            },
        })
    }
}

fn parse(content: &str) -> FlexiResult<ConfigFile> {
    toml::from_str::<ConfigFile>(content)
        .map_err(|e| FlexiError::Config(format!("config parse error: {e}")))
}

/// Expand `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
