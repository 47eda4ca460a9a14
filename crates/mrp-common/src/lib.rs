//! Common types and utilities shared across the MRP protocol stack.
//!
//! This crate provides:
//! - Message and user-info serialization ([`frame`])
//! - Handshake signatures, key exchange and session streams ([`crypto`])
//! - Protocol flags, sentinels and sizes ([`types`])

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod crypto;
pub mod frame;
pub mod types;

pub use crypto::CryptoError;
pub use frame::{FrameError, Message, UserInfo};
pub use types::Token;
