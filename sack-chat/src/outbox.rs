//! Per-connection outbound queue.
//!
//! Every accepted connection gets a bounded frame queue drained by its own
//! writer task, so a peer that stops reading only ever stalls itself. The
//! first failed or timed-out write ends the task without writing anything
//! further: a frame cut short is followed by EOF, never by another frame.
//! The connection id is then reported on the eviction channel so the event
//! loop can close it.

use std::time::Duration;

use bytes::Bytes;
use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::mpsc,
    task::JoinHandle,
    time::timeout,
};
use tracing::debug;

use crate::registry::ConnectionId;

pub type EvictionSender = mpsc::UnboundedSender<ConnectionId>;
pub type EvictionReceiver = mpsc::UnboundedReceiver<ConnectionId>;

pub fn eviction_channel() -> (EvictionSender, EvictionReceiver) {
    mpsc::unbounded_channel()
}

/// Sending side of one connection's queue. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Outbox {
    frames: mpsc::Sender<Bytes>,
}

impl Outbox {
    /// Queues raw bytes without waiting. `false` means the connection is too
    /// far behind or its writer already stopped, and it should be evicted.
    pub fn push(&self, frame: Bytes) -> bool {
        self.frames.try_send(frame).is_ok()
    }
}

/// Spawns writer tasks with shared limits.
#[derive(Debug, Clone)]
pub struct OutboxSpawner {
    capacity: usize,
    write_timeout: Duration,
    evictions: EvictionSender,
}

impl OutboxSpawner {
    pub fn new(capacity: usize, write_timeout: Duration, evictions: EvictionSender) -> Self {
        Self {
            capacity: capacity.max(1),
            write_timeout,
            evictions,
        }
    }

    pub fn spawn<W>(&self, id: ConnectionId, writer: W) -> (Outbox, JoinHandle<()>)
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (frames, queue) = mpsc::channel(self.capacity);
        let task = tokio::spawn(run_writer(
            id,
            writer,
            queue,
            self.write_timeout,
            self.evictions.clone(),
        ));
        (Outbox { frames }, task)
    }
}

async fn run_writer<W>(
    id: ConnectionId,
    mut writer: W,
    mut queue: mpsc::Receiver<Bytes>,
    write_timeout: Duration,
    evictions: EvictionSender,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = queue.recv().await {
        let failure = match timeout(write_timeout, write_frame(&mut writer, &frame)).await {
            Ok(Ok(())) => continue,
            Ok(Err(err)) => format!("write failed: {err}"),
            Err(_) => "write timed out".to_string(),
        };
        debug!(connection = id, reason = %failure, "stopping writer");
        let _ = evictions.send(id);
        return;
    }

    // Every sender is gone: the connection is being closed in an orderly way.
    if let Ok(Err(err)) = timeout(write_timeout, writer.shutdown()).await {
        debug!(connection = id, error = ?err, "failed to shut down writer");
    }
}

async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(frame).await?;
    writer.flush().await
}
