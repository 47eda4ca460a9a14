//! MRP message serialization and parsing.
//!
//! A message is a fixed 96-byte header followed by an optional body:
//!
//! ```text
//! flag(4) ‖ timestamp(8) ‖ size(4) ‖ index(4) ‖ count(4) ‖ from(4) ‖ to(4) ‖ token(64) ‖ body(size)
//! ```
//!
//! All integers are little-endian. The packed message is what gets encrypted
//! into a single length-prefixed frame on the wire.

use crate::types::{Token, TOKEN_SIZE, USERNAME_SIZE};
use thiserror::Error;

/// Maximum size of a packed (plaintext) message.
pub const MAX_MESSAGE_SIZE: usize = 256;

/// Size of the fixed message header.
pub const HEAD_SIZE: usize = 4 * 6 + 8 + TOKEN_SIZE; // 96 bytes

/// Maximum body size that fits into one message.
pub const MAX_BODY_SIZE: usize = MAX_MESSAGE_SIZE - HEAD_SIZE; // 160 bytes

/// Size of one packed [`UserInfo`] record.
pub const USER_INFO_SIZE: usize = 4 + 1 + USERNAME_SIZE; // 21 bytes

/// Number of [`UserInfo`] records that fit into one message body.
pub const USER_INFOS_PER_MESSAGE: usize = MAX_BODY_SIZE / USER_INFO_SIZE; // 7

const FLAG: usize = 0;
const TIMESTAMP: usize = 4;
const SIZE: usize = 12;
const INDEX: usize = 16;
const COUNT: usize = 20;
const FROM: usize = 24;
const TO: usize = 28;
const TOKEN: usize = 32;

/// A protocol message.
///
/// The wire `size` field is not stored; it is always `body.len()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Operation code, see [`crate::types::flag`].
    pub flag: i32,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    /// Position of this message in a multi-message reply.
    pub index: u32,
    /// Total number of messages in a multi-message reply.
    pub count: u32,
    /// Sender user id or sentinel.
    pub from: u32,
    /// Recipient user id or sentinel.
    pub to: u32,
    /// Session or server token.
    pub token: Token,
    /// Message payload, at most [`MAX_BODY_SIZE`] bytes.
    pub body: Vec<u8>,
}

/// Errors that can occur during message packing and parsing.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    /// The input is shorter than the fixed header.
    #[error("message too short")]
    TooShort {
        /// Minimum expected byte count.
        expected: usize,
        /// Actual byte count received.
        actual: usize,
    },
    /// The body exceeds the maximum allowed size.
    #[error("body too large: max {max}, got {actual}")]
    BodyTooLarge {
        /// Maximum allowed body size.
        max: usize,
        /// Actual body size.
        actual: usize,
    },
    /// The declared body size does not match the bytes that follow the header.
    #[error("size mismatch: header declares {declared}, found {actual}")]
    SizeMismatch {
        /// Body size from the header.
        declared: usize,
        /// Bytes present after the header.
        actual: usize,
    },
}

fn read_u32(data: &[u8], at: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&data[at..at + 4]);
    u32::from_le_bytes(buf)
}

fn read_u64(data: &[u8], at: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&data[at..at + 8]);
    u64::from_le_bytes(buf)
}

impl Message {
    /// Creates a body-less message with `index = 0` and `count = 1`.
    #[must_use]
    pub const fn new(flag: i32, timestamp: u64, from: u32, to: u32, token: Token) -> Self {
        Self {
            flag,
            timestamp,
            index: 0,
            count: 1,
            from,
            to,
            token,
            body: Vec::new(),
        }
    }

    /// Replaces the body.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Sets the position of this message within a multi-message reply.
    #[must_use]
    pub const fn with_position(mut self, index: u32, count: u32) -> Self {
        self.index = index;
        self.count = count;
        self
    }

    /// Body length as carried in the header.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn size(&self) -> u32 {
        self.body.len() as u32
    }

    /// Serializes this message into its fixed little-endian layout.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::BodyTooLarge`] if the body exceeds
    /// [`MAX_BODY_SIZE`].
    ///
    /// # Examples
    ///
    /// ```
    /// use mrp_common::frame::{Message, HEAD_SIZE};
    /// use mrp_common::types::{flag, EMPTY_TOKEN};
    /// let msg = Message::new(flag::PROCEED, 1, 2, 3, EMPTY_TOKEN).with_body(b"hi".to_vec());
    /// let bytes = msg.pack().unwrap();
    /// assert_eq!(bytes.len(), HEAD_SIZE + 2);
    /// ```
    pub fn pack(&self) -> Result<Vec<u8>, FrameError> {
        if self.body.len() > MAX_BODY_SIZE {
            return Err(FrameError::BodyTooLarge {
                max: MAX_BODY_SIZE,
                actual: self.body.len(),
            });
        }
        let mut v = Vec::with_capacity(HEAD_SIZE + self.body.len());
        v.extend_from_slice(&self.flag.to_le_bytes());
        v.extend_from_slice(&self.timestamp.to_le_bytes());
        v.extend_from_slice(&self.size().to_le_bytes());
        v.extend_from_slice(&self.index.to_le_bytes());
        v.extend_from_slice(&self.count.to_le_bytes());
        v.extend_from_slice(&self.from.to_le_bytes());
        v.extend_from_slice(&self.to.to_le_bytes());
        v.extend_from_slice(&self.token);
        v.extend_from_slice(&self.body);
        Ok(v)
    }

    /// Parses a packed message.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError`] if the data is shorter than the header, the
    /// declared size exceeds [`MAX_BODY_SIZE`], or the declared size does not
    /// match the trailing bytes.
    ///
    /// # Examples
    ///
    /// ```
    /// use mrp_common::frame::Message;
    /// use mrp_common::types::{flag, EMPTY_TOKEN};
    /// let msg = Message::new(flag::FINISH, 42, 1, 2, EMPTY_TOKEN);
    /// let parsed = Message::unpack(&msg.pack().unwrap()).unwrap();
    /// assert_eq!(msg, parsed);
    /// ```
    pub fn unpack(data: &[u8]) -> Result<Self, FrameError> {
        if data.len() < HEAD_SIZE {
            return Err(FrameError::TooShort {
                expected: HEAD_SIZE,
                actual: data.len(),
            });
        }
        let declared = read_u32(data, SIZE) as usize;
        if declared > MAX_BODY_SIZE {
            return Err(FrameError::BodyTooLarge {
                max: MAX_BODY_SIZE,
                actual: declared,
            });
        }
        let actual = data.len() - HEAD_SIZE;
        if declared != actual {
            return Err(FrameError::SizeMismatch { declared, actual });
        }

        let mut token = [0u8; TOKEN_SIZE];
        token.copy_from_slice(&data[TOKEN..TOKEN + TOKEN_SIZE]);

        Ok(Self {
            flag: i32::from_le_bytes(read_u32(data, FLAG).to_le_bytes()),
            timestamp: read_u64(data, TIMESTAMP),
            index: read_u32(data, INDEX),
            count: read_u32(data, COUNT),
            from: read_u32(data, FROM),
            to: read_u32(data, TO),
            token,
            body: data[HEAD_SIZE..].to_vec(),
        })
    }
}

/// One record of a paginated user directory listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserInfo {
    /// User id.
    pub id: u32,
    /// Whether the user currently has an authenticated session.
    pub connected: bool,
    /// Zero-padded username.
    pub name: [u8; USERNAME_SIZE],
}

impl UserInfo {
    /// Appends the fixed 21-byte encoding of this record to `out`.
    pub fn pack_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.id.to_le_bytes());
        out.push(u8::from(self.connected));
        out.extend_from_slice(&self.name);
    }

    /// Parses one record from exactly [`USER_INFO_SIZE`] bytes.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::TooShort`] if `data` is shorter than a record.
    pub fn unpack(data: &[u8]) -> Result<Self, FrameError> {
        if data.len() < USER_INFO_SIZE {
            return Err(FrameError::TooShort {
                expected: USER_INFO_SIZE,
                actual: data.len(),
            });
        }
        let mut name = [0u8; USERNAME_SIZE];
        name.copy_from_slice(&data[5..USER_INFO_SIZE]);
        Ok(Self {
            id: read_u32(data, 0),
            connected: data[4] != 0,
            name,
        })
    }
}

/// Copies `name` into a zero-padded `N`-byte field, truncating anything
/// longer.
#[must_use]
pub fn padded<const N: usize>(name: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    let len = name.len().min(N);
    out[..len].copy_from_slice(&name[..len]);
    out
}
