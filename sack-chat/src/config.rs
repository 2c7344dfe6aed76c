use std::{net::SocketAddr, time::Duration};

use crate::protocol::DEFAULT_MAX_FRAME_LEN;

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Frames a client may fall behind by before it is evicted.
pub const DEFAULT_OUTBOX_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind. Port 0 picks an ephemeral port.
    pub listen: SocketAddr,
    /// Upper bound on a single write to one client, for join replies and
    /// broadcast delivery alike. A client that exceeds it is evicted. Also
    /// the grace period for flushing queued frames on stop.
    pub write_timeout: Duration,
    pub outbox_capacity: usize,
    /// Largest frame body accepted from a client.
    pub max_frame_len: usize,
}

impl ServerConfig {
    pub fn new(listen: SocketAddr) -> Self {
        Self {
            listen,
            ..Self::default()
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)),
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            outbox_capacity: DEFAULT_OUTBOX_CAPACITY,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// `host:port` of the server; host names are resolved on connect.
    pub server: String,
    pub connect_timeout: Duration,
    /// Largest frame body accepted from the server, and the largest text
    /// frame `send_text` will write.
    pub max_frame_len: usize,
}

impl SessionConfig {
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            ..Self::default()
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            server: format!("localhost:{DEFAULT_PORT}"),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}
