//! Client side of the protocol.
//!
//! A [`ClientSession`] walks `Disconnected → Connected → Joined → Closed`.
//! The `OK` join token is taken as proof of admission; the server's own
//! broadcast of our `CONNECT` arrives later as an ordinary event, which
//! [`ClientSession::receive_from_others`] filters out along with everything
//! else we sent.

use std::{
    fmt, io,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use futures::StreamExt;
use tokio::{
    io::AsyncWriteExt,
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    time::timeout,
};
use tokio_util::codec::FramedRead;
use tracing::{debug, info, warn};

use crate::{
    config::SessionConfig,
    error::{ProtocolError, SessionError},
    protocol::{ChatCodec, ChatEvent, JoinStatus, LENGTH_PREFIX_LEN, Username, encode, read_status, write_event},
};

type FrameReader = FramedRead<OwnedReadHalf, ChatCodec>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connected,
    Joined,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connected => "connected",
            Self::Joined => "joined",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

struct Link {
    reader: FrameReader,
    writer: OwnedWriteHalf,
}

pub struct ClientSession {
    config: SessionConfig,
    state: SessionState,
    username: Option<Username>,
    link: Option<Link>,
    closed_locally: Arc<AtomicBool>,
}

impl ClientSession {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            state: SessionState::Disconnected,
            username: None,
            link: None,
            closed_locally: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn username(&self) -> Option<&Username> {
        self.username.as_ref()
    }

    /// Opens the socket, giving up after `connect_timeout`.
    pub async fn connect(&mut self) -> Result<(), SessionError> {
        self.require("connect", &[SessionState::Disconnected])?;

        let addr = self.config.server.clone();
        let stream = match timeout(self.config.connect_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => return Err(SessionError::ServerUnreachable { addr, source }),
            Err(_) => {
                let source = io::Error::new(io::ErrorKind::TimedOut, "connect timed out");
                return Err(SessionError::ServerUnreachable { addr, source });
            }
        };
        if let Err(err) = stream.set_nodelay(true) {
            debug!(error = ?err, "failed to set TCP_NODELAY");
        }

        let (reader, writer) = stream.into_split();
        let codec = ChatCodec::with_max_frame_len(self.config.max_frame_len);
        self.link = Some(Link {
            reader: FramedRead::new(reader, codec),
            writer,
        });
        self.closed_locally = Arc::new(AtomicBool::new(false));
        self.state = SessionState::Connected;
        info!(server = %addr, "connected");
        Ok(())
    }

    /// Asks to join as `username`. On rejection the socket is closed and the
    /// session is back to `Disconnected`, ready for another `connect`.
    pub async fn join_request(&mut self, username: &str) -> Result<(), SessionError> {
        self.require("join", &[SessionState::Connected])?;
        let username = Username::new(username)?;

        let link = self.link_mut()?;
        let status = handshake(link, &username).await;
        match status {
            Ok(JoinStatus::Accepted) => {
                info!(%username, "joined");
                self.username = Some(username);
                self.state = SessionState::Joined;
                Ok(())
            }
            Ok(JoinStatus::Rejected) => {
                info!(%username, "username rejected");
                self.reset().await;
                Err(SessionError::UsernameTaken { username })
            }
            Err(err) => {
                self.reset().await;
                Err(err)
            }
        }
    }

    /// Sends one TEXT frame. Text whose frame would exceed `max_frame_len`
    /// is refused with `TextTooLong` before anything is written, since the
    /// server would drop the connection over it.
    pub async fn send_text(&mut self, text: &str) -> Result<(), SessionError> {
        self.require("send text", &[SessionState::Joined])?;
        let username = self.joined_as("send text")?;
        let max_frame_len = self.config.max_frame_len;
        let link = self.link_mut()?;
        send_text(&mut link.writer, username, text, max_frame_len).await
    }

    /// Waits for the next event, including our own echoes.
    ///
    /// An unexpected close yields `ServerDown` and resets the session to
    /// `Disconnected`; after [`disconnect`](Self::disconnect) it yields `Closed`.
    pub async fn receive(&mut self) -> Result<ChatEvent, SessionError> {
        if self.state == SessionState::Closed {
            return Err(SessionError::Closed);
        }
        self.require("receive", &[SessionState::Connected, SessionState::Joined])?;

        let closed_locally = Arc::clone(&self.closed_locally);
        let result = {
            let link = self.link_mut()?;
            next_event(&mut link.reader, &closed_locally).await
        };
        if matches!(result, Err(SessionError::ServerDown)) {
            self.reset().await;
        }
        result
    }

    /// Like [`receive`](Self::receive), skipping events about ourselves.
    pub async fn receive_from_others(&mut self) -> Result<ChatEvent, SessionError> {
        loop {
            let event = self.receive().await?;
            if !self.is_own(&event) {
                return Ok(event);
            }
        }
    }

    /// Half-closes, then closes the socket. Safe to call repeatedly.
    pub async fn disconnect(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.closed_locally.store(true, Ordering::Release);
        if let Some(Link { reader, mut writer }) = self.link.take() {
            shutdown_writer(&mut writer).await;
            drop(reader);
        }
        self.state = SessionState::Closed;
        info!("disconnected");
    }

    /// Splits a joined session so reads and writes can run on separate tasks.
    pub fn into_split(mut self) -> Result<(SessionReader, SessionWriter), SessionError> {
        self.require("split", &[SessionState::Joined])?;
        let username = self.joined_as("split")?;
        let Some(Link { reader, writer }) = self.link.take() else {
            return Err(self.invalid("split"));
        };

        let reader = SessionReader {
            reader,
            username: username.clone(),
            closed_locally: Arc::clone(&self.closed_locally),
        };
        let writer = SessionWriter {
            writer: Some(writer),
            username,
            max_frame_len: self.config.max_frame_len,
            closed_locally: Arc::clone(&self.closed_locally),
        };
        Ok((reader, writer))
    }

    fn is_own(&self, event: &ChatEvent) -> bool {
        self.username
            .as_ref()
            .is_some_and(|username| event.is_from(username))
    }

    /// Drops the link after a failure or rejection so `connect` can run again.
    async fn reset(&mut self) {
        if let Some(Link { reader, mut writer }) = self.link.take() {
            shutdown_writer(&mut writer).await;
            drop(reader);
        }
        self.username = None;
        self.state = SessionState::Disconnected;
    }

    fn require(&self, operation: &'static str, allowed: &[SessionState]) -> Result<(), SessionError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(self.invalid(operation))
        }
    }

    fn invalid(&self, operation: &'static str) -> SessionError {
        SessionError::InvalidState {
            operation,
            state: self.state,
        }
    }

    fn joined_as(&self, operation: &'static str) -> Result<Username, SessionError> {
        self.username.clone().ok_or_else(|| self.invalid(operation))
    }

    fn link_mut(&mut self) -> Result<&mut Link, SessionError> {
        let state = self.state;
        self.link.as_mut().ok_or(SessionError::InvalidState {
            operation: "use the connection",
            state,
        })
    }
}

/// Receiving half of a split session.
pub struct SessionReader {
    reader: FrameReader,
    username: Username,
    closed_locally: Arc<AtomicBool>,
}

impl SessionReader {
    pub async fn receive(&mut self) -> Result<ChatEvent, SessionError> {
        next_event(&mut self.reader, &self.closed_locally).await
    }

    pub async fn receive_from_others(&mut self) -> Result<ChatEvent, SessionError> {
        loop {
            let event = self.receive().await?;
            if !event.is_from(&self.username) {
                return Ok(event);
            }
        }
    }
}

/// Sending half of a split session.
pub struct SessionWriter {
    writer: Option<OwnedWriteHalf>,
    username: Username,
    max_frame_len: usize,
    closed_locally: Arc<AtomicBool>,
}

impl SessionWriter {
    pub async fn send_text(&mut self, text: &str) -> Result<(), SessionError> {
        let Some(writer) = self.writer.as_mut() else {
            return Err(SessionError::Closed);
        };
        send_text(writer, self.username.clone(), text, self.max_frame_len).await
    }

    /// Half-closes the socket. The paired reader then reports `Closed`
    /// rather than `ServerDown`.
    pub async fn disconnect(&mut self) {
        self.closed_locally.store(true, Ordering::Release);
        if let Some(mut writer) = self.writer.take() {
            shutdown_writer(&mut writer).await;
        }
    }
}

impl Drop for SessionWriter {
    fn drop(&mut self) {
        self.closed_locally.store(true, Ordering::Release);
    }
}

async fn handshake(link: &mut Link, username: &Username) -> Result<JoinStatus, SessionError> {
    write_event(&mut link.writer, &ChatEvent::connect(username.clone()))
        .await
        .map_err(SessionError::from_link)?;
    read_status(&mut link.reader)
        .await
        .map_err(SessionError::from_link)
}

async fn send_text(
    writer: &mut OwnedWriteHalf,
    username: Username,
    text: &str,
    max_frame_len: usize,
) -> Result<(), SessionError> {
    if text.is_empty() {
        return Err(SessionError::EmptyText);
    }
    let frame = encode(&ChatEvent::text(username, text))?;
    let len = frame.len() - LENGTH_PREFIX_LEN;
    if len > max_frame_len {
        return Err(SessionError::TextTooLong { len, max: max_frame_len });
    }
    write_frame(writer, &frame)
        .await
        .map_err(|err| SessionError::from_link(ProtocolError::from(err)))
}

async fn write_frame(writer: &mut OwnedWriteHalf, frame: &[u8]) -> io::Result<()> {
    writer.write_all(frame).await?;
    writer.flush().await
}

async fn next_event(reader: &mut FrameReader, closed_locally: &AtomicBool) -> Result<ChatEvent, SessionError> {
    let frame = reader.next().await;
    if closed_locally.load(Ordering::Acquire) {
        return match frame {
            Some(Ok(event)) => Ok(event),
            _ => Err(SessionError::Closed),
        };
    }
    match frame {
        Some(Ok(event)) => Ok(event),
        Some(Err(err)) => {
            warn!(error = %err, "lost connection to server");
            Err(SessionError::ServerDown)
        }
        None => Err(SessionError::ServerDown),
    }
}

async fn shutdown_writer(writer: &mut OwnedWriteHalf) {
    if let Err(error) = writer.shutdown().await {
        debug!(?error, "failed to shut down connection cleanly");
    }
}
