//! Connection and server configuration.

use std::path::PathBuf;
use std::time::Duration;

use plexrpc_protocol::{MAX_FRAME_OVERHEAD, MAX_FRAME_PAYLOAD};

use crate::error::{RuntimeError, RuntimeResult};

/// Initial flow-control window per stream and direction, in bytes.
pub const DEFAULT_INITIAL_WINDOW: u32 = 1024 * 1024;

/// Largest message payload that fits a default window with its frame overhead.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = DEFAULT_INITIAL_WINDOW as usize - MAX_FRAME_OVERHEAD;

/// Per-connection settings shared by clients and servers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Bytes a sender may have unacknowledged on one stream.
    pub initial_window: u32,

    /// Largest message payload accepted or sent.
    pub max_message_size: usize,

    /// Calls that may be live at once on one connection.
    pub max_concurrent_streams: usize,

    /// Incoming calls waiting for dispatch before new ones are refused.
    pub incoming_backlog: usize,

    /// How long a cancelled handler may keep running before it is dropped.
    pub cancel_grace: Duration,

    /// How long a finished stream id remembers its trailer.
    pub rearm_window: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            initial_window: DEFAULT_INITIAL_WINDOW,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_concurrent_streams: 100,
            incoming_backlog: 64,
            cancel_grace: Duration::from_millis(250),
            rearm_window: Duration::from_secs(2),
        }
    }
}

impl ConnectionConfig {
    /// Builder: set the initial window.
    pub fn with_initial_window(mut self, window: u32) -> Self {
        self.initial_window = window;
        self
    }

    /// Builder: set the maximum message size.
    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    /// Builder: set the concurrent stream limit.
    pub fn with_max_concurrent_streams(mut self, max: usize) -> Self {
        self.max_concurrent_streams = max;
        self
    }

    /// Builder: set the incoming call backlog.
    pub fn with_incoming_backlog(mut self, backlog: usize) -> Self {
        self.incoming_backlog = backlog;
        self
    }

    /// Builder: set the cancellation grace period.
    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    /// Builder: set the duplicate-trailer rearm window.
    pub fn with_rearm_window(mut self, window: Duration) -> Self {
        self.rearm_window = window;
        self
    }

    /// Checks that the settings can make progress together.
    ///
    /// The largest message plus its frame overhead must fit one window,
    /// otherwise a sender could park forever.
    pub fn validate(&self) -> RuntimeResult<()> {
        if self.initial_window == 0 {
            return Err(RuntimeError::config("initial_window must be positive"));
        }
        if self.max_message_size > MAX_FRAME_PAYLOAD as usize {
            return Err(RuntimeError::config(format!(
                "max_message_size {} exceeds the frame payload limit {MAX_FRAME_PAYLOAD}",
                self.max_message_size
            )));
        }
        if self.max_message_size + MAX_FRAME_OVERHEAD > self.initial_window as usize {
            return Err(RuntimeError::config(format!(
                "max_message_size {} plus {MAX_FRAME_OVERHEAD} bytes of framing does not fit initial_window {}",
                self.max_message_size, self.initial_window
            )));
        }
        if self.max_concurrent_streams == 0 {
            return Err(RuntimeError::config("max_concurrent_streams must be positive"));
        }
        if self.incoming_backlog == 0 {
            return Err(RuntimeError::config("incoming_backlog must be positive"));
        }
        Ok(())
    }
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Path to the Unix socket.
    pub socket_path: PathBuf,

    /// Maximum concurrent connections.
    pub max_connections: usize,

    /// Whether to remove stale socket on startup.
    pub cleanup_stale_socket: bool,

    /// Settings applied to every accepted connection.
    pub connection: ConnectionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            max_connections: 100,
            cleanup_stale_socket: true,
            connection: ConnectionConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Creates a new server configuration with the given socket path.
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            ..Default::default()
        }
    }

    /// Builder: set max connections.
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Builder: set cleanup stale socket.
    pub fn with_cleanup_stale_socket(mut self, cleanup: bool) -> Self {
        self.cleanup_stale_socket = cleanup;
        self
    }

    /// Builder: set the per-connection settings.
    pub fn with_connection(mut self, connection: ConnectionConfig) -> Self {
        self.connection = connection;
        self
    }

    pub fn validate(&self) -> RuntimeResult<()> {
        if self.max_connections == 0 {
            return Err(RuntimeError::config("max_connections must be positive"));
        }
        self.connection.validate()
    }
}

/// Returns the default socket path.
///
/// Uses `$XDG_RUNTIME_DIR/plexrpc.sock` if available,
/// otherwise falls back to `/tmp/plexrpc-$UID.sock`.
pub fn default_socket_path() -> PathBuf {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        PathBuf::from(runtime_dir).join("plexrpc.sock")
    } else {
        #[cfg(unix)]
        let uid = unsafe { libc::getuid() };
        #[cfg(not(unix))]
        let uid = 0;
        PathBuf::from(format!("/tmp/plexrpc-{}.sock", uid))
    }
}
