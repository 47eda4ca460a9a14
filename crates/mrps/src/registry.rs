use crate::store::User;
use mrp_common::Message;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Notify};

/// Handle held in the registry, used to reach a connection's worker.
#[derive(Clone, Debug)]
pub struct ConnHandle {
    /// Outbound queue drained by the connection's writer task.
    pub tx: mpsc::Sender<Message>,
    /// Wakes the connection's reader so it closes at the next opportunity.
    pub closer: Arc<Notify>,
}

impl ConnHandle {
    /// Creates a handle plus the receiving half of its outbound queue.
    #[must_use]
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(capacity);
        let handle = Self {
            tx,
            closer: Arc::new(Notify::new()),
        };
        (handle, rx)
    }
}

/// Protocol state of a connection. Transitions only move forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnState {
    /// Handshake done, nothing received yet.
    Connected = 0,
    /// A well-formed LogIn or Register preamble was received.
    SecureEstablished = 1,
    /// A user is bound to the connection.
    LoggedIn = 2,
}

/// Reasons [`Registry::bind_user`] refuses to bind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BindError {
    /// No connection with that id.
    #[error("unknown connection")]
    UnknownConnection,
    /// The connection already has a user.
    #[error("connection already bound")]
    ConnectionBound,
    /// The user has a live session on another connection.
    #[error("user already connected")]
    UserConnected,
}

#[derive(Debug)]
struct Connection {
    handle: ConnHandle,
    user: Option<User>,
    state: ConnState,
    connected_at: Instant,
}

#[derive(Debug, Default)]
struct Inner {
    connections: HashMap<u32, Connection>,
    users: HashMap<u32, u32>,
}

/// Live connections keyed by connection id, with a reverse index from
/// authenticated user id to connection id.
///
/// Both maps sit under one lock so a user id is in the reverse index exactly
/// when its connection's bound user has that id.
#[derive(Debug)]
pub struct Registry {
    inner: RwLock<Inner>,
    max_lifetime: Duration,
}

impl Registry {
    /// Creates an empty registry that reports connections older than
    /// `max_lifetime` from [`Registry::check_connection_timeouts`].
    #[must_use]
    pub fn new(max_lifetime: Duration) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            max_lifetime,
        }
    }

    /// Inserts a fresh connection in [`ConnState::Connected`].
    ///
    /// # Panics
    ///
    /// Panics if `id` is already registered. Ids come from the pool, so a
    /// collision is a bug.
    pub fn add_connection(&self, id: u32, handle: ConnHandle) {
        let mut inner = self.write();
        let previous = inner.connections.insert(
            id,
            Connection {
                handle,
                user: None,
                state: ConnState::Connected,
                connected_at: Instant::now(),
            },
        );
        assert!(previous.is_none(), "connection {id} registered twice");
    }

    /// Looks up the handle of a connection.
    #[must_use]
    pub fn get_connection(&self, id: u32) -> Option<ConnHandle> {
        self.read().connections.get(&id).map(|c| c.handle.clone())
    }

    /// Looks up the state of a connection.
    #[must_use]
    pub fn get_state(&self, id: u32) -> Option<ConnState> {
        self.read().connections.get(&id).map(|c| c.state)
    }

    /// Advances the state of a connection. Returns `false` if the
    /// connection is unknown or `state` would move it backwards.
    pub fn set_state(&self, id: u32, state: ConnState) -> bool {
        let mut inner = self.write();
        match inner.connections.get_mut(&id) {
            Some(c) if c.state <= state => {
                c.state = state;
                true
            }
            _ => false,
        }
    }

    /// Looks up the user bound to a connection.
    #[must_use]
    pub fn get_user(&self, id: u32) -> Option<User> {
        self.read().connections.get(&id).and_then(|c| c.user.clone())
    }

    /// Binds `user` to connection `id` and indexes it, unless the user is
    /// already live elsewhere. Check and bind happen under one write lock.
    ///
    /// # Errors
    ///
    /// Returns a [`BindError`] describing why nothing was bound.
    pub fn bind_user(&self, id: u32, user: User) -> Result<(), BindError> {
        let mut inner = self.write();
        if inner.users.contains_key(&user.id) {
            return Err(BindError::UserConnected);
        }
        let conn = inner
            .connections
            .get_mut(&id)
            .ok_or(BindError::UnknownConnection)?;
        if conn.user.is_some() {
            return Err(BindError::ConnectionBound);
        }
        let user_id = user.id;
        conn.user = Some(user);
        inner.users.insert(user_id, id);
        Ok(())
    }

    /// Finds the live connection of an authenticated user.
    #[must_use]
    pub fn get_authorized_connected_user(&self, user_id: u32) -> Option<(u32, ConnHandle)> {
        let inner = self.read();
        let conn_id = *inner.users.get(&user_id)?;
        let conn = inner.connections.get(&conn_id)?;
        Some((conn_id, conn.handle.clone()))
    }

    /// Returns `true` if the user has a live authenticated connection.
    #[must_use]
    pub fn is_user_connected(&self, user_id: u32) -> bool {
        self.read().users.contains_key(&user_id)
    }

    /// Snapshot of every authenticated connection as `(user id, handle)`.
    #[must_use]
    pub fn authorized_connections(&self) -> Vec<(u32, ConnHandle)> {
        let inner = self.read();
        inner
            .users
            .iter()
            .filter_map(|(user_id, conn_id)| {
                inner
                    .connections
                    .get(conn_id)
                    .map(|c| (*user_id, c.handle.clone()))
            })
            .collect()
    }

    /// Calls `on_expired` for every connection older than the lifetime
    /// ceiling. Returns how many were reported.
    pub fn check_connection_timeouts(&self, mut on_expired: impl FnMut(u32, &ConnHandle)) -> usize {
        let inner = self.read();
        let mut expired = 0;
        for (id, conn) in &inner.connections {
            if conn.connected_at.elapsed() > self.max_lifetime {
                on_expired(*id, &conn.handle);
                expired += 1;
            }
        }
        expired
    }

    /// Removes a connection and its reverse entry. Idempotent.
    pub fn delete_connection(&self, id: u32) -> bool {
        let mut inner = self.write();
        let Some(conn) = inner.connections.remove(&id) else {
            return false;
        };
        if let Some(user) = conn.user {
            inner.users.remove(&user.id);
        }
        true
    }

    /// Number of live connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.read().connections.len()
    }

    /// Returns `true` if no connection is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read().connections.is_empty()
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}
