//! Connection bookkeeping owned by the event loop.
//!
//! [`Registry`] keeps open connections and claimed usernames in plain maps.
//! Only the event loop touches it, so it needs no lock. Joined connections are
//! mirrored into a [`MemberSnapshot`], the one piece of state shared with the
//! broadcaster. The loop writes to it, everyone else only reads.

use std::{
    collections::{BTreeMap, HashMap},
    net::SocketAddr,
    sync::Arc,
    time::Duration,
};

use futures::future::{AbortHandle, join_all};
use tokio::{sync::RwLock, task::JoinHandle, time::timeout};

use crate::{
    outbox::Outbox,
    protocol::{JoinStatus, Username},
};

pub type ConnectionId = u64;

/// A joined connection as seen by the broadcaster.
#[derive(Debug, Clone)]
pub struct Member {
    pub id: ConnectionId,
    pub username: Username,
    pub outbox: Outbox,
}

/// Read-only view of the joined connections, safe to query while the event
/// loop admits and removes members.
#[derive(Clone, Default)]
pub struct MemberSnapshot {
    members: Arc<RwLock<BTreeMap<ConnectionId, Member>>>,
}

impl MemberSnapshot {
    /// Members in connection order, as of this call.
    pub async fn members(&self) -> Vec<Member> {
        self.members.read().await.values().cloned().collect()
    }

    pub async fn usernames(&self) -> Vec<Username> {
        self.members
            .read()
            .await
            .values()
            .map(|member| member.username.clone())
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.members.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.members.read().await.is_empty()
    }

    async fn insert(&self, member: Member) {
        self.members.write().await.insert(member.id, member);
    }

    async fn remove(&self, id: ConnectionId) {
        self.members.write().await.remove(&id);
    }

    async fn clear(&self) {
        self.members.write().await.clear();
    }
}

struct Connection {
    peer: SocketAddr,
    outbox: Outbox,
    writer_task: JoinHandle<()>,
    pending_read: Option<AbortHandle>,
    username: Option<Username>,
}

impl Connection {
    fn abort(&self) {
        if let Some(read) = &self.pending_read {
            read.abort();
        }
        self.writer_task.abort();
    }
}

/// What remains of a connection after [`Registry::close`].
#[derive(Debug)]
pub struct ClosedConnection {
    pub id: ConnectionId,
    pub peer: SocketAddr,
    pub username: Option<Username>,
}

#[derive(Default)]
pub struct Registry {
    connections: HashMap<ConnectionId, Connection>,
    usernames: HashMap<Username, ConnectionId>,
    members: MemberSnapshot,
    next_id: ConnectionId,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn members(&self) -> MemberSnapshot {
        self.members.clone()
    }

    /// Tracks a freshly accepted connection. It is not yet a member.
    /// `spawn_outbox` receives the new id and starts the connection's writer.
    pub fn open<F>(&mut self, peer: SocketAddr, spawn_outbox: F) -> ConnectionId
    where
        F: FnOnce(ConnectionId) -> (Outbox, JoinHandle<()>),
    {
        self.next_id += 1;
        let id = self.next_id;
        let (outbox, writer_task) = spawn_outbox(id);
        self.connections.insert(
            id,
            Connection {
                peer,
                outbox,
                writer_task,
                pending_read: None,
                username: None,
            },
        );
        id
    }

    pub fn is_open(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    /// Remembers how to cancel the connection's in-flight read.
    pub fn track_read(&mut self, id: ConnectionId, read: AbortHandle) {
        match self.connections.get_mut(&id) {
            Some(connection) => connection.pending_read = Some(read),
            None => read.abort(),
        }
    }

    pub fn outbox(&self, id: ConnectionId) -> Option<Outbox> {
        self.connections
            .get(&id)
            .map(|connection| connection.outbox.clone())
    }

    pub fn peer(&self, id: ConnectionId) -> Option<SocketAddr> {
        self.connections.get(&id).map(|connection| connection.peer)
    }

    pub fn username(&self, id: ConnectionId) -> Option<&Username> {
        self.connections
            .get(&id)
            .and_then(|connection| connection.username.as_ref())
    }

    /// Decides a join without changing any state. A connection that already
    /// joined, or a name held by anyone, is rejected.
    pub fn check_join(&self, id: ConnectionId, username: &Username) -> JoinStatus {
        let already_joined = self.username(id).is_some();
        if already_joined || self.usernames.contains_key(username) {
            JoinStatus::Rejected
        } else {
            JoinStatus::Accepted
        }
    }

    /// Records the name and exposes the connection to the broadcaster.
    /// Returns `false` when the join is no longer valid.
    pub async fn admit(&mut self, id: ConnectionId, username: Username) -> bool {
        if self.check_join(id, &username) == JoinStatus::Rejected {
            return false;
        }
        let Some(connection) = self.connections.get_mut(&id) else {
            return false;
        };

        connection.username = Some(username.clone());
        let outbox = connection.outbox.clone();
        self.usernames.insert(username.clone(), id);
        self.members
            .insert(Member {
                id,
                username,
                outbox,
            })
            .await;
        true
    }

    /// Forgets a connection everywhere and cancels its reader and writer.
    /// Returns `None` if it was already gone, so callers act on each
    /// disconnect exactly once.
    pub async fn close(&mut self, id: ConnectionId) -> Option<ClosedConnection> {
        let connection = self.connections.remove(&id)?;
        connection.abort();
        if let Some(username) = &connection.username {
            self.usernames.remove(username);
            self.members.remove(id).await;
        }
        Some(ClosedConnection {
            id,
            peer: connection.peer,
            username: connection.username,
        })
    }

    /// Closes every connection. Writers get up to `grace` to flush what is
    /// already queued and are aborted after that. Returns how many
    /// connections were open.
    pub async fn close_all(&mut self, grace: Duration) -> usize {
        let open = self.connections.len();
        self.usernames.clear();
        self.members.clear().await;

        let mut writers = Vec::with_capacity(open);
        for (_, connection) in self.connections.drain() {
            if let Some(read) = &connection.pending_read {
                read.abort();
            }
            // Dropping the outbox lets the writer finish its queue and exit.
            writers.push(connection.writer_task);
        }

        let _ = timeout(grace, join_all(writers.iter_mut())).await;
        for writer in &writers {
            writer.abort();
        }
        open
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn user_count(&self) -> usize {
        self.usernames.len()
    }
}
