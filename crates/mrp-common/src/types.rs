//! Core type definitions and protocol constants for MRP.

/// Opaque fixed-size authenticator carried by every message.
pub type Token = [u8; TOKEN_SIZE];

/// Size of a [`Token`] in bytes.
pub const TOKEN_SIZE: usize = 64;

/// The all-zero token an anonymous client presents before logging in.
pub const EMPTY_TOKEN: Token = [0u8; TOKEN_SIZE];

/// Fixed width of the username field in credentials and user info records.
pub const USERNAME_SIZE: usize = 16;

/// Fixed width of the (unhashed) password field in credentials.
pub const PASSWORD_SIZE: usize = 16;

/// Minimum number of non-blank bytes a username or password must carry.
pub const MIN_CREDENTIAL_SIZE: usize = 4;

/// Id of the administrator account, seeded at startup.
pub const ADMIN_ID: u32 = 0;

/// Operation codes carried in the `flag` field of a message.
pub mod flag {
    /// Relay a message to another user (persisted for offline delivery).
    pub const PROCEED: i32 = 0x0000_0000;
    /// Admin broadcast to every authenticated connection.
    pub const BROADCAST: i32 = 0x1000_0000;
    /// Graceful close requested by the client.
    pub const FINISH: i32 = 0x0000_0001;
    /// Connection closed after an error reply.
    pub const FINISH_WITH_ERROR: i32 = 0x0000_0002;
    /// Connection closed after registration; client must reconnect and log in.
    pub const FINISH_TO_RECONNECT: i32 = 0x0000_0003;
    /// Log in with credentials.
    pub const LOG_IN: i32 = 0x0000_0004;
    /// Login succeeded; body carries the session token.
    pub const LOGGED_IN: i32 = 0x0000_0005;
    /// Register a new account.
    pub const REGISTER: i32 = 0x0000_0006;
    /// Registration succeeded; `to` carries the new user id.
    pub const REGISTERED: i32 = 0x0000_0007;
    /// Generic success.
    pub const SUCCESS: i32 = 0x0000_0008;
    /// Generic error; body carries the offending flag.
    pub const ERROR: i32 = 0x0000_0009;
    /// Credentials or session token rejected.
    pub const UNAUTHENTICATED: i32 = 0x0000_000a;
    /// Caller lacks the privileges for the requested operation.
    pub const ACCESS_DENIED: i32 = 0x0000_000b;
    /// Page through the user directory.
    pub const FETCH_USERS: i32 = 0x0000_000c;
    /// Fetch (and consume) buffered messages.
    pub const FETCH_MESSAGES: i32 = 0x0000_000d;
    /// Client-to-client end-to-end key exchange, relayed opaquely.
    pub const EXCHANGE_KEYS: i32 = 0x0000_00a0;
    /// Client-to-client key exchange acknowledgement.
    pub const EXCHANGE_KEYS_DONE: i32 = 0x0000_00b0;
    /// Client-to-client stream header exchange.
    pub const EXCHANGE_HEADERS: i32 = 0x0000_00c0;
    /// Client-to-client stream header acknowledgement.
    pub const EXCHANGE_HEADERS_DONE: i32 = 0x0000_00d0;
    /// File transfer offer.
    pub const FILE_ASK: i32 = 0x0000_00e0;
    /// File transfer chunk.
    pub const FILE: i32 = 0x0000_00f0;
    /// Admin request to shut the server down.
    pub const SHUTDOWN: i32 = 0x7fff_ffff;

    /// Returns `true` for flags relayed verbatim between users.
    #[must_use]
    pub const fn is_relayed(flag: i32) -> bool {
        matches!(
            flag,
            PROCEED
                | EXCHANGE_KEYS
                | EXCHANGE_KEYS_DONE
                | EXCHANGE_HEADERS
                | EXCHANGE_HEADERS_DONE
                | FILE_ASK
                | FILE
        )
    }
}

/// Reserved user ids used as sender/recipient sentinels.
pub mod sentinel {
    /// Recipient of server replies sent before the user is known.
    pub const TO_ANONYMOUS: u32 = 0x7fff_ffff;
    /// Recipient of client requests addressed to the server itself.
    pub const TO_SERVER: u32 = 0x7fff_fffe;
    /// Sender of client requests made before logging in.
    pub const FROM_ANONYMOUS: u32 = 0xffff_ffff;
    /// Sender of every server-originated message.
    pub const FROM_SERVER: u32 = 0x7fff_ffff;
}
