//! Wire protocol: length-prefixed JSON frames plus the two-byte join token.
//!
//! Every frame is a 4-byte big-endian body length followed by that many bytes
//! of UTF-8 JSON:
//!
//! ```text
//! [len: u32 BE]{"type":"TEXT","username":"alice","text":"hi"}
//! ```
//!
//! The length prefix lets a reader reassemble events from partial or merged
//! TCP reads. The join reply is not framed: the server answers a `CONNECT`
//! with exactly `OK` or `NO` before anything else is written to that socket.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder, FramedRead};

use crate::error::ProtocolError;

pub const LENGTH_PREFIX_LEN: usize = 4;
/// Largest frame body a decoder accepts unless configured otherwise. Encoding
/// is not limited by it.
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;
pub const MAX_USERNAME_CHARS: usize = 15;

/// A validated chat handle: 1 to [`MAX_USERNAME_CHARS`] characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Username(String);

impl Username {
    pub fn new(name: impl Into<String>) -> Result<Self, ProtocolError> {
        let name = name.into();
        let chars = name.chars().count();
        if chars == 0 || chars > MAX_USERNAME_CHARS {
            return Err(ProtocolError::InvalidUsername { name });
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Username {
    type Error = ProtocolError;

    fn try_from(name: String) -> Result<Self, Self::Error> {
        Self::new(name)
    }
}

impl From<Username> for String {
    fn from(username: Username) -> Self {
        username.0
    }
}

impl fmt::Display for Username {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl PartialEq<str> for Username {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for Username {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

/// One discrete chat event. Only `Text` carries a body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(try_from = "WireEvent", into = "WireEvent")]
pub enum ChatEvent {
    Connect { username: Username },
    Disconnect { username: Username },
    Text { username: Username, text: String },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
enum EventKind {
    Connect,
    Disconnect,
    Text,
}

/// Flat JSON shape of a [`ChatEvent`]. Unknown fields are refused and
/// `text` must be present exactly when the kind is `TEXT`.
#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct WireEvent {
    #[serde(rename = "type")]
    kind: EventKind,
    username: Username,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
}

impl TryFrom<WireEvent> for ChatEvent {
    type Error = String;

    fn try_from(wire: WireEvent) -> Result<Self, Self::Error> {
        let WireEvent {
            kind,
            username,
            text,
        } = wire;
        match (kind, text) {
            (EventKind::Connect, None) => Ok(Self::Connect { username }),
            (EventKind::Disconnect, None) => Ok(Self::Disconnect { username }),
            (EventKind::Text, Some(text)) => Ok(Self::Text { username, text }),
            (EventKind::Text, None) => Err("TEXT event without a text field".to_string()),
            (kind, Some(_)) => Err(format!("{kind:?} event must not carry text")),
        }
    }
}

impl From<ChatEvent> for WireEvent {
    fn from(event: ChatEvent) -> Self {
        match event {
            ChatEvent::Connect { username } => Self {
                kind: EventKind::Connect,
                username,
                text: None,
            },
            ChatEvent::Disconnect { username } => Self {
                kind: EventKind::Disconnect,
                username,
                text: None,
            },
            ChatEvent::Text { username, text } => Self {
                kind: EventKind::Text,
                username,
                text: Some(text),
            },
        }
    }
}

impl ChatEvent {
    pub fn connect(username: Username) -> Self {
        Self::Connect { username }
    }

    pub fn disconnect(username: Username) -> Self {
        Self::Disconnect { username }
    }

    pub fn text(username: Username, text: impl Into<String>) -> Self {
        Self::Text {
            username,
            text: text.into(),
        }
    }

    pub fn username(&self) -> &Username {
        match self {
            Self::Connect { username }
            | Self::Disconnect { username }
            | Self::Text { username, .. } => username,
        }
    }

    pub fn is_from(&self, username: &Username) -> bool {
        self.username() == username
    }
}

/// Point-to-point answer to a join request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinStatus {
    Accepted,
    Rejected,
}

impl JoinStatus {
    pub const TOKEN_LEN: usize = 2;

    pub const fn token(self) -> &'static [u8; 2] {
        match self {
            Self::Accepted => b"OK",
            Self::Rejected => b"NO",
        }
    }

    pub fn from_token(token: [u8; 2]) -> Result<Self, ProtocolError> {
        match &token {
            b"OK" => Ok(Self::Accepted),
            b"NO" => Ok(Self::Rejected),
            _ => Err(ProtocolError::UnknownStatus { token }),
        }
    }
}

/// Length-prefixed JSON codec for [`ChatEvent`].
///
/// `max_frame_len` bounds what the decoder will buffer for one frame. The
/// encoder accepts every event whose body fits the 32-bit length prefix.
#[derive(Debug, Clone)]
pub struct ChatCodec {
    max_frame_len: usize,
}

impl ChatCodec {
    pub fn new() -> Self {
        Self::with_max_frame_len(DEFAULT_MAX_FRAME_LEN)
    }

    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        Self { max_frame_len }
    }
}

impl Default for ChatCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for ChatCodec {
    type Item = ChatEvent;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<ChatEvent>, ProtocolError> {
        if src.len() < LENGTH_PREFIX_LEN {
            return Ok(None);
        }

        let mut prefix = [0u8; LENGTH_PREFIX_LEN];
        prefix.copy_from_slice(&src[..LENGTH_PREFIX_LEN]);
        let len = u32::from_be_bytes(prefix) as usize;
        if len > self.max_frame_len {
            return Err(ProtocolError::FrameTooLarge {
                len,
                max: self.max_frame_len,
            });
        }

        let frame_len = LENGTH_PREFIX_LEN + len;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX_LEN);
        let body = src.split_to(len);
        let event = serde_json::from_slice(&body)?;
        Ok(Some(event))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<ChatEvent>, ProtocolError> {
        match self.decode(src)? {
            Some(event) => Ok(Some(event)),
            None if src.is_empty() => Ok(None),
            None => Err(ProtocolError::TruncatedFrame {
                buffered: src.len(),
            }),
        }
    }
}

impl Encoder<&ChatEvent> for ChatCodec {
    type Error = ProtocolError;

    fn encode(&mut self, event: &ChatEvent, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let body = serde_json::to_vec(event)?;
        let len = u32::try_from(body.len()).map_err(|_| ProtocolError::FrameTooLarge {
            len: body.len(),
            max: u32::MAX as usize,
        })?;

        dst.reserve(LENGTH_PREFIX_LEN + body.len());
        dst.put_u32(len);
        dst.extend_from_slice(&body);
        Ok(())
    }
}

/// Encodes one event into a self-contained frame.
pub fn encode(event: &ChatEvent) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::new();
    ChatCodec::new().encode(event, &mut buf)?;
    Ok(buf.freeze())
}

/// Reads the next event, or `None` once the peer closed cleanly between frames.
pub async fn read_event<R>(reader: &mut FramedRead<R, ChatCodec>) -> Result<Option<ChatEvent>, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    reader.next().await.transpose()
}

pub async fn write_event<W>(writer: &mut W, event: &ChatEvent) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode(event)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads the join token that precedes all framed traffic on a socket.
///
/// Bytes the framed reader already pulled off the socket are consumed first,
/// so the token is never lost to read-ahead.
pub async fn read_status<R>(reader: &mut FramedRead<R, ChatCodec>) -> Result<JoinStatus, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut token = [0u8; JoinStatus::TOKEN_LEN];

    let buffered = reader.read_buffer_mut();
    let taken = buffered.len().min(JoinStatus::TOKEN_LEN);
    token[..taken].copy_from_slice(&buffered[..taken]);
    buffered.advance(taken);

    reader.get_mut().read_exact(&mut token[taken..]).await?;
    JoinStatus::from_token(token)
}
