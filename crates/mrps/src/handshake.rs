use crate::error::MrpsError;
use crate::transport::{read_exact_within, write_all_within};
use ed25519_dalek::SigningKey;
use mrp_common::crypto::{self, KeyPair, StreamDecoder, StreamEncoder, HEADER_SIZE, KEY_SIZE};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};

/// Both directions of an established session.
pub struct Session {
    /// Encrypts server → client frames.
    pub encoder: StreamEncoder,
    /// Decrypts client → server frames.
    pub decoder: StreamDecoder,
}

/// Runs the server side of the handshake:
///
/// 1. send the signed server key exchange public key
/// 2. receive the client public key and derive session keys
/// 3. send the signed header of the server → client stream
/// 4. receive the client → server stream header
///
/// Every step is bounded by `limit`. Nothing is sent back on failure.
///
/// # Errors
///
/// Returns transport errors, or [`MrpsError::Crypto`] if the client key or
/// header is unusable.
pub async fn perform<S>(
    stream: &mut S,
    signing_key: &SigningKey,
    kx: &KeyPair,
    limit: Duration,
) -> Result<Session, MrpsError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let hello = crypto::sign(signing_key, &kx.public_bytes());
    write_all_within(stream, &hello, limit, "server key write").await?;

    let mut client_public = [0u8; KEY_SIZE];
    read_exact_within(stream, &mut client_public, limit, "client key read").await?;
    let keys = kx.server_session_keys(&client_public)?;

    let (encoder, header) = StreamEncoder::new(&keys.tx)?;
    let signed_header = crypto::sign(signing_key, &header);
    write_all_within(stream, &signed_header, limit, "server header write").await?;

    let mut client_header = [0u8; HEADER_SIZE];
    read_exact_within(stream, &mut client_header, limit, "client header read").await?;
    let decoder = StreamDecoder::new(&keys.rx, &client_header)?;

    Ok(Session { encoder, decoder })
}

/// Tells a client the server is full: a signed all-zero key in place of the
/// real one.
///
/// # Errors
///
/// Returns transport errors.
pub async fn reject<S>(stream: &mut S, signing_key: &SigningKey, limit: Duration) -> Result<(), MrpsError>
where
    S: AsyncWrite + Unpin,
{
    let refusal = crypto::sign(signing_key, &[0u8; KEY_SIZE]);
    write_all_within(stream, &refusal, limit, "rejection write").await
}
