//! Networking core of the `sack` terminal chat.
//!
//! A single-task event loop multiplexes the listening socket, a stop channel
//! and every client connection; a second task fans accepted events out to all
//! joined clients in queue order.
//!
//! - [`protocol`] frames [`ChatEvent`](protocol::ChatEvent)s as length-prefixed
//!   JSON and defines the two-byte `OK`/`NO` join reply.
//! - [`registry`] tracks connections and usernames for the event loop and
//!   exposes joined members through a read-only snapshot.
//! - [`control`] is the out-of-band stop signal that wakes the loop.
//! - [`outbox`] gives every connection its own bounded send queue and writer
//!   task, and reports connections that stop keeping up.
//! - [`broadcaster`] owns the delivery queue and its worker task.
//! - [`server`] is the event loop itself.
//! - [`session`] is the client state machine used by front ends.
//! - [`cli`] and [`client`] make up the bundled terminal front end.

pub mod broadcaster;
pub mod cli;
pub mod client;
pub mod config;
pub mod control;
pub mod error;
pub mod outbox;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
