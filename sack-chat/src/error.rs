use std::io;

use thiserror::Error;

use crate::{protocol::Username, session::SessionState};

/// Failures while framing or parsing the wire protocol.
///
/// The server treats every variant as a disconnect of the offending
/// connection; it is never reported to other clients.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },

    #[error("stream ended inside a frame ({buffered} bytes buffered)")]
    TruncatedFrame { buffered: usize },

    #[error("malformed frame body: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("username must be 1 to 15 characters, got {name:?}")]
    InvalidUsername { name: String },

    #[error("unknown join status token {token:?}")]
    UnknownStatus { token: [u8; 2] },

    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("server at {addr} is unreachable")]
    ServerUnreachable {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("username '{username}' is already in use")]
    UsernameTaken { username: Username },

    #[error("server closed the connection")]
    ServerDown,

    #[error("cannot {operation} while the session is {state}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },

    #[error("text must not be empty")]
    EmptyText,

    #[error("text encodes to {len} bytes, over the {max} byte frame limit")]
    TextTooLong { len: usize, max: usize },

    #[error("session was closed locally")]
    Closed,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl SessionError {
    /// Folds transport failures on an established link into `ServerDown`.
    pub(crate) fn from_link(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Io(ref io_err) if is_disconnect(io_err.kind()) => Self::ServerDown,
            ProtocolError::TruncatedFrame { .. } => Self::ServerDown,
            other => Self::Protocol(other),
        }
    }
}

fn is_disconnect(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
    )
}
