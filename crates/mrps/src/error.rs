use thiserror::Error;

/// Errors that can occur while serving a connection.
#[derive(Error, Debug)]
pub enum MrpsError {
    /// The peer stopped sending before the handshake completed.
    #[error("handshake failed: {0}")]
    Handshake(&'static str),
    /// A read or write did not finish before its deadline.
    #[error("{0} timed out")]
    Timeout(&'static str),
    /// The length prefix announced a frame outside the accepted range.
    #[error("invalid frame length {0}")]
    InvalidLength(u32),
    /// Underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Plaintext message encoding or decoding error.
    #[error("frame error: {0}")]
    Frame(#[from] mrp_common::frame::FrameError),
    /// Key exchange or stream cipher failure.
    #[error("crypto error: {0}")]
    Crypto(#[from] mrp_common::crypto::CryptoError),
    /// Persistence layer failure.
    #[error("store error: {0}")]
    Store(#[from] crate::store::StoreError),
    /// The connection was closed by the remote peer or by the server.
    #[error("connection closed")]
    ConnectionClosed,
}
