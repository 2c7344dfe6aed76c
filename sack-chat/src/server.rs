//! The chat server's event loop.
//!
//! One task owns the listener, the control channel and the read half of every
//! connection, and waits on all of them in a single `select!`. Connection
//! reads are kept in a `FuturesUnordered`, each future yielding the next frame
//! together with its reader so the loop can re-arm it. Writes never happen on
//! this task: every connection has an [`Outbox`](crate::outbox::Outbox), and
//! fan-out goes through the [`Broadcaster`]. Connections whose outbox gives up
//! come back on the eviction channel and are closed here.

use std::{future::Future, io, net::SocketAddr};

use anyhow::{Context, Result};
use bytes::Bytes;
use futures::{
    FutureExt, StreamExt,
    future::{AbortHandle, Abortable, Aborted, BoxFuture},
    stream::FuturesUnordered,
};
use tokio::{
    net::{TcpListener, TcpStream, tcp::OwnedReadHalf},
    select,
};
use tokio_util::codec::FramedRead;
use tracing::{debug, info, warn};

use crate::{
    broadcaster::Broadcaster,
    config::ServerConfig,
    control::{ControlChannel, StopHandle, control_channel},
    error::ProtocolError,
    outbox::{OutboxSpawner, eviction_channel},
    protocol::{ChatCodec, ChatEvent, JoinStatus, Username},
    registry::{ConnectionId, MemberSnapshot, Registry},
};

type FrameReader = FramedRead<OwnedReadHalf, ChatCodec>;

/// Result of one pending read: the frame (or end of stream) plus the reader,
/// handed back so the loop can wait on it again.
struct ReadOutcome {
    id: ConnectionId,
    reader: FrameReader,
    frame: Option<Result<ChatEvent, ProtocolError>>,
}

type PendingReads = FuturesUnordered<Abortable<BoxFuture<'static, ReadOutcome>>>;

pub struct ChatServer {
    listener: TcpListener,
    config: ServerConfig,
    stop: StopHandle,
    control: ControlChannel,
    registry: Registry,
}

impl ChatServer {
    /// Binds the listening socket. Failure here is the only fatal server error.
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        let listener = TcpListener::bind(config.listen)
            .await
            .with_context(|| format!("failed to bind {}", config.listen))?;
        Ok(Self::from_listener(listener, config))
    }

    pub fn from_listener(listener: TcpListener, config: ServerConfig) -> Self {
        let (stop, control) = control_channel();
        Self {
            listener,
            config,
            stop,
            control,
            registry: Registry::new(),
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Live view of joined users, usable while [`serve`](Self::serve) runs.
    pub fn members(&self) -> MemberSnapshot {
        self.registry.members()
    }

    /// Runs until a [`StopHandle`] fires. On return the broadcaster has
    /// stopped and every connection is closed. Queued frames get one
    /// `write_timeout` to reach their sockets.
    pub async fn serve(self) -> Result<()> {
        let ChatServer {
            listener,
            config,
            stop: _stop,
            mut control,
            mut registry,
        } = self;

        let codec = ChatCodec::with_max_frame_len(config.max_frame_len);
        let (evict_tx, mut evictions) = eviction_channel();
        let outboxes = OutboxSpawner::new(config.outbox_capacity, config.write_timeout, evict_tx.clone());
        let broadcaster = Broadcaster::spawn(registry.members(), evict_tx);
        let mut reads = PendingReads::new();

        info!(addr = ?listener.local_addr().ok(), "server started");

        loop {
            select! {
                biased;
                _ = control.signalled() => {
                    let extra = control.drain();
                    info!(extra_signals = extra, "stopping server");
                    break;
                }
                Some(id) = evictions.recv() => {
                    if registry.is_open(id) {
                        warn!(connection = id, username = ?registry.username(id), "evicting connection that stopped keeping up");
                        handle_disconnect(id, &mut registry, &broadcaster).await;
                    }
                }
                accepted = listener.accept() => {
                    handle_accept(accepted, &mut registry, &mut reads, &outboxes, &codec);
                }
                Some(outcome) = reads.next(), if !reads.is_empty() => {
                    match outcome {
                        Ok(outcome) => handle_read(outcome, &mut registry, &mut reads, &broadcaster).await,
                        Err(Aborted) => {}
                    }
                }
            }
        }

        let frames = broadcaster.shutdown().await;
        drop(reads);
        let closed = registry.close_all(config.write_timeout).await;
        drop(listener);
        info!(frames, closed, "server stopped");

        Ok(())
    }

    /// Serves until `shutdown` resolves, then stops through the control channel.
    pub async fn serve_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let stop = self.stop_handle();
        let serve = self.serve();
        tokio::pin!(serve);
        tokio::pin!(shutdown);

        select! {
            result = &mut serve => return result,
            _ = &mut shutdown => {
                stop.stop();
            }
        }
        serve.await
    }

    pub async fn serve_until_ctrl_c(self) -> Result<()> {
        self.stop.stop_on_ctrl_c();
        self.serve().await
    }
}

fn handle_accept(
    result: io::Result<(TcpStream, SocketAddr)>,
    registry: &mut Registry,
    reads: &mut PendingReads,
    outboxes: &OutboxSpawner,
    codec: &ChatCodec,
) {
    match result {
        Ok((stream, peer)) => {
            if let Err(err) = stream.set_nodelay(true) {
                debug!(%peer, error = ?err, "failed to set TCP_NODELAY");
            }
            let (reader, writer) = stream.into_split();
            let id = registry.open(peer, |id| outboxes.spawn(id, writer));
            arm_read(id, FramedRead::new(reader, codec.clone()), registry, reads);
            info!(%peer, connection = id, open = registry.connection_count(), "accepted connection");
        }
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

/// Waits for the connection's next frame; the registry keeps the handle that
/// cancels the wait when the connection is closed from elsewhere.
fn arm_read(id: ConnectionId, mut reader: FrameReader, registry: &mut Registry, reads: &mut PendingReads) {
    let read = async move {
        let frame = reader.next().await;
        ReadOutcome { id, reader, frame }
    }
    .boxed();
    let (abort, registration) = AbortHandle::new_pair();
    reads.push(Abortable::new(read, registration));
    registry.track_read(id, abort);
}

async fn handle_read(
    outcome: ReadOutcome,
    registry: &mut Registry,
    reads: &mut PendingReads,
    broadcaster: &Broadcaster,
) {
    let ReadOutcome { id, reader, frame } = outcome;
    if !registry.is_open(id) {
        return;
    }

    let keep_open = match frame {
        Some(Ok(event)) => handle_event(id, event, registry, broadcaster).await,
        Some(Err(err)) => {
            debug!(connection = id, error = %err, "dropping connection after protocol error");
            false
        }
        None => false,
    };

    if keep_open {
        arm_read(id, reader, registry, reads);
    } else {
        drop(reader);
        handle_disconnect(id, registry, broadcaster).await;
    }
}

/// Returns whether the connection stays open.
async fn handle_event(
    id: ConnectionId,
    event: ChatEvent,
    registry: &mut Registry,
    broadcaster: &Broadcaster,
) -> bool {
    match event {
        ChatEvent::Connect { username } => handle_join(id, username, registry, broadcaster).await,
        ChatEvent::Text { .. } => {
            if registry.username(id).is_some() {
                enqueue(broadcaster, &event);
            } else {
                warn!(connection = id, "dropping text from a connection that has not joined");
            }
            true
        }
        ChatEvent::Disconnect { .. } => false,
    }
}

async fn handle_join(
    id: ConnectionId,
    username: Username,
    registry: &mut Registry,
    broadcaster: &Broadcaster,
) -> bool {
    // Framed broadcasts already flow to a joined connection; an unframed
    // token now would break its framing.
    if let Some(current) = registry.username(id) {
        warn!(connection = id, %current, requested = %username, "closing connection after repeated join");
        return false;
    }

    let status = registry.check_join(id, &username);
    let Some(outbox) = registry.outbox(id) else {
        return false;
    };
    // Queued ahead of any broadcast frame, since the connection only becomes
    // a member below.
    if !outbox.push(Bytes::from_static(status.token())) {
        debug!(connection = id, "failed to queue join reply");
        return false;
    }

    match status {
        JoinStatus::Rejected => {
            info!(connection = id, %username, "rejected join: username taken");
            true
        }
        JoinStatus::Accepted => {
            if !registry.admit(id, username.clone()).await {
                return false;
            }
            info!(connection = id, peer = ?registry.peer(id), %username, users = registry.user_count(), "user joined");
            enqueue(broadcaster, &ChatEvent::connect(username));
            true
        }
    }
}

async fn handle_disconnect(id: ConnectionId, registry: &mut Registry, broadcaster: &Broadcaster) {
    let Some(closed) = registry.close(id).await else {
        return;
    };

    match closed.username {
        Some(username) => {
            info!(peer = %closed.peer, %username, "user disconnected");
            enqueue(broadcaster, &ChatEvent::disconnect(username));
        }
        None => debug!(peer = %closed.peer, connection = closed.id, "connection closed before joining"),
    }
}

fn enqueue(broadcaster: &Broadcaster, event: &ChatEvent) {
    if let Err(err) = broadcaster.broadcast_event(event) {
        warn!(username = %event.username(), error = %err, "failed to encode broadcast");
    }
}
