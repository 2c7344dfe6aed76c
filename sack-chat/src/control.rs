//! Out-of-band stop signal for the event loop.
//!
//! The receiving end sits in the same `select!` as the listener and the
//! connection reads, so a single message wakes the blocked wait no matter
//! how many sockets are open. [`StopHandle::stop`] is synchronous and can be
//! called from any thread or from a signal-handling task.

use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct StopHandle {
    tx: mpsc::UnboundedSender<()>,
}

impl StopHandle {
    /// Asks the server to stop. Returns `false` if the server is already gone.
    pub fn stop(&self) -> bool {
        self.tx.send(()).is_ok()
    }

    /// Routes SIGINT into this handle.
    pub fn stop_on_ctrl_c(&self) {
        let handle = self.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    debug!("received ctrl-c");
                    handle.stop();
                }
                Err(err) => warn!(error = ?err, "failed to install ctrl-c handler"),
            }
        });
    }
}

pub struct ControlChannel {
    rx: mpsc::UnboundedReceiver<()>,
}

impl ControlChannel {
    /// Resolves on the first stop request. Cancel safe.
    pub async fn signalled(&mut self) {
        // A closed channel cannot happen while the server holds its own handle.
        let _ = self.rx.recv().await;
    }

    /// Discards queued stop requests, returning how many there were.
    pub fn drain(&mut self) -> usize {
        let mut drained = 0;
        while self.rx.try_recv().is_ok() {
            drained += 1;
        }
        drained
    }
}

pub fn control_channel() -> (StopHandle, ControlChannel) {
    let (tx, rx) = mpsc::unbounded_channel();
    (StopHandle { tx }, ControlChannel { rx })
}
