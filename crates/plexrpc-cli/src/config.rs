//! CLI configuration.
//!
//! All settings live in a single `config.toml` file at
//! `~/.config/plexrpc/config.toml` by default. Every key is optional;
//! command-line flags override the file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use plexrpc_core::{TracingConfig, TracingOutputFormat};
use plexrpc_runtime::{ConnectionConfig, ServerConfig, default_socket_path};

use crate::error::{CliError, CliResult};

/// Configuration for the `plexrpc` binary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Socket server settings.
    pub server: ServerSettings,

    /// Per-connection settings, shared by `serve` and `call`.
    pub connection: ConnectionSettings,

    /// Log output.
    pub logging: LoggingSettings,
}

/// `[server]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Path to the server socket.
    pub socket_path: Option<PathBuf>,

    /// Maximum concurrent client connections.
    pub max_connections: usize,

    /// Remove a leftover socket file nobody listens on.
    pub cleanup_stale_socket: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        let defaults = ServerConfig::default();
        Self {
            socket_path: None,
            max_connections: defaults.max_connections,
            cleanup_stale_socket: defaults.cleanup_stale_socket,
        }
    }
}

/// `[connection]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    pub initial_window: u32,
    pub max_message_size: usize,
    pub max_concurrent_streams: usize,
    pub incoming_backlog: usize,
    pub cancel_grace_ms: u64,
    pub rearm_window_ms: u64,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        let defaults = ConnectionConfig::default();
        Self {
            initial_window: defaults.initial_window,
            max_message_size: defaults.max_message_size,
            max_concurrent_streams: defaults.max_concurrent_streams,
            incoming_backlog: defaults.incoming_backlog,
            cancel_grace_ms: millis(defaults.cancel_grace),
            rearm_window_ms: millis(defaults.rearm_window),
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// `[logging]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// `trace`, `debug`, `info`, `warn` or `error`.
    pub level: String,

    /// `pretty`, `compact` or `json`.
    pub format: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
            format: "compact".to_string(),
        }
    }
}

impl CliConfig {
    /// Loads configuration from the default path, or defaults if the file
    /// does not exist.
    pub fn load() -> CliResult<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Loads configuration from a specific path.
    pub fn load_from(path: &Path) -> CliResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            CliError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        toml::from_str(&content).map_err(|e| {
            CliError::Config(format!("failed to parse {}: {}", path.display(), e))
        })
    }

    /// Returns the default configuration file path.
    pub fn default_path() -> PathBuf {
        Self::default_config_dir().join("config.toml")
    }

    /// Returns the default configuration directory.
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("plexrpc")
    }

    /// Socket path: the flag, then the file, then the runtime default.
    pub fn socket_path(&self, flag: Option<&Path>) -> PathBuf {
        flag.map(Path::to_path_buf)
            .or_else(|| self.server.socket_path.clone())
            .unwrap_or_else(default_socket_path)
    }

    pub fn connection_config(&self) -> ConnectionConfig {
        let settings = &self.connection;
        ConnectionConfig::default()
            .with_initial_window(settings.initial_window)
            .with_max_message_size(settings.max_message_size)
            .with_max_concurrent_streams(settings.max_concurrent_streams)
            .with_incoming_backlog(settings.incoming_backlog)
            .with_cancel_grace(Duration::from_millis(settings.cancel_grace_ms))
            .with_rearm_window(Duration::from_millis(settings.rearm_window_ms))
    }

    pub fn server_config(&self, socket_path: PathBuf) -> ServerConfig {
        ServerConfig::new(socket_path)
            .with_max_connections(self.server.max_connections)
            .with_cleanup_stale_socket(self.server.cleanup_stale_socket)
            .with_connection(self.connection_config())
    }

    /// Log setup; `--debug` wins over the file.
    pub fn tracing_config(&self, debug: bool) -> CliResult<TracingConfig> {
        if debug {
            return Ok(TracingConfig::cli_debug());
        }
        let config = TracingConfig::from_settings(&self.logging.level, &self.logging.format)
            .map_err(|e| CliError::Config(e.to_string()))?;
        Ok(TracingConfig {
            include_timestamp: config.output_format == TracingOutputFormat::Json,
            ..config
        })
    }

    /// Checks every section without starting anything.
    pub fn validate(&self) -> CliResult<()> {
        self.server_config(self.socket_path(None)).validate()?;
        self.tracing_config(false)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn empty_file_gives_defaults() {
        let config: CliConfig = toml::from_str("").unwrap();
        assert_eq!(config, CliConfig::default());
        assert_eq!(config.connection_config(), ConnectionConfig::default());
    }

    #[test]
    fn sections_map_onto_runtime_config() {
        let config: CliConfig = toml::from_str(
            r#"
[server]
socket_path = "/run/user/1000/demo.sock"
max_connections = 8

[connection]
initial_window = 65536
max_message_size = 65000
cancel_grace_ms = 50

[logging]
level = "debug"
format = "json"
"#,
        )
        .unwrap();

        let server = config.server_config(config.socket_path(None));
        assert_eq!(server.socket_path, PathBuf::from("/run/user/1000/demo.sock"));
        assert_eq!(server.max_connections, 8);
        assert_eq!(server.connection.initial_window, 65536);
        assert_eq!(server.connection.cancel_grace, Duration::from_millis(50));
        assert_eq!(
            server.connection.max_concurrent_streams,
            ConnectionConfig::default().max_concurrent_streams
        );
        config.validate().unwrap();

        let tracing = config.tracing_config(false).unwrap();
        assert_eq!(tracing.output_format, TracingOutputFormat::Json);
        assert!(tracing.include_timestamp);
    }

    #[test]
    fn flag_overrides_socket_path() {
        let mut config = CliConfig::default();
        config.server.socket_path = Some(PathBuf::from("/from/file.sock"));
        assert_eq!(
            config.socket_path(Some(Path::new("/from/flag.sock"))),
            PathBuf::from("/from/flag.sock")
        );
        assert_eq!(config.socket_path(None), PathBuf::from("/from/file.sock"));
    }

    #[test]
    fn validate_rejects_a_message_larger_than_the_window() {
        let mut config = CliConfig::default();
        config.connection.initial_window = 1024;
        config.connection.max_message_size = 1024;
        assert!(matches!(config.validate(), Err(CliError::Runtime(_))));
    }

    #[test]
    fn validate_rejects_unknown_log_format() {
        let mut config = CliConfig::default();
        config.logging.format = "xml".into();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("xml"));
    }

    #[test]
    fn load_from_reports_parse_errors() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[connection]\ninitial_window = \"big\"\n").unwrap();
        let err = CliConfig::load_from(&path).unwrap_err();
        assert!(err.to_string().contains("failed to parse"));
    }

    #[test]
    fn config_round_trips_through_toml() {
        let config = CliConfig::default();
        let text = toml::to_string_pretty(&config).unwrap();
        assert_eq!(toml::from_str::<CliConfig>(&text).unwrap(), config);
    }
}
