//! Fan-out of encoded frames on a dedicated worker task.
//!
//! The event loop only enqueues; the worker hands each frame to every
//! member's [`Outbox`](crate::outbox::Outbox) without waiting on any socket.
//! A member whose outbox refuses the frame is reported on the eviction
//! channel and skipped, so one stalled client never delays the others.

use bytes::Bytes;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, warn};

use crate::{
    error::ProtocolError,
    outbox::EvictionSender,
    protocol::{ChatEvent, encode},
    registry::{Member, MemberSnapshot},
};

enum Command {
    Deliver(Bytes),
    Stop,
}

pub struct Broadcaster {
    queue: mpsc::UnboundedSender<Command>,
    worker: JoinHandle<u64>,
}

impl Broadcaster {
    pub fn spawn(members: MemberSnapshot, evictions: EvictionSender) -> Self {
        let (queue, commands) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run_worker(commands, members, evictions));
        Self { queue, worker }
    }

    /// Queues a pre-encoded frame and returns immediately.
    pub fn broadcast(&self, frame: Bytes) {
        if self.queue.send(Command::Deliver(frame)).is_err() {
            warn!("broadcast worker is gone; dropping frame");
        }
    }

    pub fn broadcast_event(&self, event: &ChatEvent) -> Result<(), ProtocolError> {
        self.broadcast(encode(event)?);
        Ok(())
    }

    /// Hands everything queued so far to the member outboxes, then stops the
    /// worker. Nothing is enqueued after this returns. Yields the number of
    /// frames processed.
    pub async fn shutdown(self) -> u64 {
        let _ = self.queue.send(Command::Stop);
        match self.worker.await {
            Ok(frames) => frames,
            Err(err) => {
                warn!(error = ?err, "broadcast worker panicked");
                0
            }
        }
    }
}

async fn run_worker(
    mut commands: mpsc::UnboundedReceiver<Command>,
    members: MemberSnapshot,
    evictions: EvictionSender,
) -> u64 {
    let mut frames = 0;
    while let Some(command) = commands.recv().await {
        match command {
            Command::Deliver(frame) => {
                let recipients = members.members().await;
                deliver(&frame, &recipients, &evictions);
                frames += 1;
            }
            Command::Stop => break,
        }
    }
    debug!(frames, "broadcast worker stopped");
    frames
}

fn deliver(frame: &Bytes, recipients: &[Member], evictions: &EvictionSender) {
    for member in recipients {
        if !member.outbox.push(frame.clone()) {
            debug!(connection = member.id, username = %member.username, "member cannot keep up");
            let _ = evictions.send(member.id);
        }
    }
}
