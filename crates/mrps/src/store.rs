//! Persistence of users and buffered messages.
//!
//! The server talks to storage only through the [`Store`] trait. The
//! in-memory [`MemoryStore`] backs the binary and the tests.

use crate::id_pool::IdPool;
use crate::password::PasswordHasher;
use async_trait::async_trait;
use mrp_common::frame::padded;
use mrp_common::types::{ADMIN_ID, PASSWORD_SIZE, USERNAME_SIZE};
use std::collections::BTreeMap;
use thiserror::Error;
use tokio::sync::RwLock;

/// Fixed-width username as carried on the wire.
pub type Username = [u8; USERNAME_SIZE];

/// Fixed-width password as carried on the wire.
pub type Password = [u8; PASSWORD_SIZE];

/// A registered user as seen by the protocol engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    /// Directory id, in `0..max_users`.
    pub id: u32,
    /// Zero-padded username.
    pub name: Username,
}

/// A buffered message awaiting fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    /// Store-assigned id, used for deletion.
    pub id: u64,
    /// Sender's timestamp in milliseconds.
    pub timestamp: u64,
    /// Author.
    pub from: u32,
    /// Recipient.
    pub to: u32,
    /// Opaque body.
    pub body: Vec<u8>,
}

/// Which buffered messages a fetch selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageQuery {
    /// Messages addressed to `user` newer than `after`.
    AddressedTo {
        /// Recipient.
        user: u32,
        /// Exclusive timestamp watermark.
        after: u64,
    },
    /// Messages written by `author` that `viewer` is party to, newer than
    /// `after`.
    AuthoredBy {
        /// Author.
        author: u32,
        /// Requesting user; must be the author or the recipient.
        viewer: u32,
        /// Exclusive timestamp watermark.
        after: u64,
    },
}

impl MessageQuery {
    fn matches(&self, m: &StoredMessage) -> bool {
        match *self {
            Self::AddressedTo { user, after } => m.to == user && m.timestamp > after,
            Self::AuthoredBy {
                author,
                viewer,
                after,
            } => {
                m.from == author && (m.to == viewer || author == viewer) && m.timestamp > after
            }
        }
    }
}

/// Errors returned by a [`Store`].
#[derive(Debug, Error)]
pub enum StoreError {
    /// Every user id is taken.
    #[error("user directory is full")]
    DirectoryFull,
    /// A user with that name already exists.
    #[error("username already taken")]
    NameTaken,
    /// Password hashing failed.
    #[error("password hashing failed: {0}")]
    Hash(String),
    /// A blocking hashing task was cancelled or panicked.
    #[error("hashing task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Storage for the user directory and buffered messages.
#[async_trait]
pub trait Store: Send + Sync {
    /// Returns the user whose name and password both match.
    async fn find_user(&self, name: &Username, password: &Password) -> Result<Option<User>, StoreError>;

    /// Creates a user with the lowest free id.
    async fn add_user(&self, name: &Username, password: &Password) -> Result<User, StoreError>;

    /// Every registered user, ordered by id.
    async fn users(&self) -> Result<Vec<User>, StoreError>;

    /// Number of registered users, admin included.
    async fn users_count(&self) -> Result<u32, StoreError>;

    /// Returns `true` if a user with `id` is registered.
    async fn user_exists(&self, id: u32) -> Result<bool, StoreError>;

    /// Returns `true` if `id` is the administrator.
    async fn is_admin(&self, id: u32) -> Result<bool, StoreError> {
        Ok(id == ADMIN_ID)
    }

    /// Buffers a message and returns its id.
    async fn add_message(&self, timestamp: u64, from: u32, to: u32, body: &[u8]) -> Result<u64, StoreError>;

    /// Messages matching `query`, oldest first.
    async fn messages(&self, query: MessageQuery) -> Result<Vec<StoredMessage>, StoreError>;

    /// Deletes the given messages; unknown ids are ignored.
    async fn delete_messages(&self, ids: &[u64]) -> Result<(), StoreError>;

    /// Deletes every buffered message.
    async fn delete_all_messages(&self) -> Result<(), StoreError>;
}

struct UserRecord {
    user: User,
    password_hash: String,
}

#[derive(Default)]
struct Messages {
    next_id: u64,
    by_id: BTreeMap<u64, StoredMessage>,
}

/// In-memory [`Store`] with Argon2id password hashes.
pub struct MemoryStore {
    hasher: PasswordHasher,
    ids: IdPool,
    users: RwLock<BTreeMap<u32, UserRecord>>,
    messages: RwLock<Messages>,
}

impl MemoryStore {
    /// Creates a store holding only the admin account (id 0, named `admin`).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DirectoryFull`] if `max_users` is zero, or
    /// [`StoreError::Hash`] if the admin password cannot be hashed.
    pub fn new(max_users: u32, hasher: PasswordHasher, admin_password: &[u8]) -> Result<Self, StoreError> {
        if max_users == 0 {
            return Err(StoreError::DirectoryFull);
        }
        let ids = IdPool::new(max_users);
        ids.set_taken(ADMIN_ID, true);

        let password: Password = padded(admin_password);
        let password_hash = hasher.hash(&password).map_err(StoreError::Hash)?;
        let admin = UserRecord {
            user: User {
                id: ADMIN_ID,
                name: padded(b"admin"),
            },
            password_hash,
        };

        Ok(Self {
            hasher,
            ids,
            users: RwLock::new(BTreeMap::from([(ADMIN_ID, admin)])),
            messages: RwLock::new(Messages::default()),
        })
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn find_user(&self, name: &Username, password: &Password) -> Result<Option<User>, StoreError> {
        let candidate = {
            let users = self.users.read().await;
            users
                .values()
                .find(|r| &r.user.name == name)
                .map(|r| (r.user.clone(), r.password_hash.clone()))
        };
        let Some((user, hash)) = candidate else {
            return Ok(None);
        };

        let hasher = self.hasher.clone();
        let password = *password;
        let valid = tokio::task::spawn_blocking(move || hasher.verify(&password, &hash)).await?;
        Ok(valid.then_some(user))
    }

    async fn add_user(&self, name: &Username, password: &Password) -> Result<User, StoreError> {
        let hasher = self.hasher.clone();
        let password = *password;
        let password_hash = tokio::task::spawn_blocking(move || hasher.hash(&password))
            .await?
            .map_err(StoreError::Hash)?;

        let mut users = self.users.write().await;
        if users.values().any(|r| &r.user.name == name) {
            return Err(StoreError::NameTaken);
        }
        let id = self.ids.take().ok_or(StoreError::DirectoryFull)?;
        let user = User { id, name: *name };
        users.insert(
            id,
            UserRecord {
                user: user.clone(),
                password_hash,
            },
        );
        Ok(user)
    }

    async fn users(&self) -> Result<Vec<User>, StoreError> {
        Ok(self.users.read().await.values().map(|r| r.user.clone()).collect())
    }

    #[allow(clippy::cast_possible_truncation)]
    async fn users_count(&self) -> Result<u32, StoreError> {
        Ok(self.users.read().await.len() as u32)
    }

    async fn user_exists(&self, id: u32) -> Result<bool, StoreError> {
        Ok(self.users.read().await.contains_key(&id))
    }

    async fn add_message(&self, timestamp: u64, from: u32, to: u32, body: &[u8]) -> Result<u64, StoreError> {
        let mut messages = self.messages.write().await;
        let id = messages.next_id;
        messages.next_id += 1;
        messages.by_id.insert(
            id,
            StoredMessage {
                id,
                timestamp,
                from,
                to,
                body: body.to_vec(),
            },
        );
        Ok(id)
    }

    async fn messages(&self, query: MessageQuery) -> Result<Vec<StoredMessage>, StoreError> {
        let messages = self.messages.read().await;
        let mut found: Vec<StoredMessage> = messages
            .by_id
            .values()
            .filter(|m| query.matches(m))
            .cloned()
            .collect();
        // Ids follow insertion order; the sort is stable, so equal
        // timestamps keep it.
        found.sort_by_key(|m| m.timestamp);
        Ok(found)
    }

    async fn delete_messages(&self, ids: &[u64]) -> Result<(), StoreError> {
        let mut messages = self.messages.write().await;
        for id in ids {
            messages.by_id.remove(id);
        }
        Ok(())
    }

    async fn delete_all_messages(&self) -> Result<(), StoreError> {
        self.messages.write().await.by_id.clear();
        Ok(())
    }
}
