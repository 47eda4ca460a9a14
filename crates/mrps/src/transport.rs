//! Length-prefixed framing with layered deadlines.
//!
//! Every frame is a 4-byte little-endian ciphertext length followed by the
//! ciphertext. The length is awaited under the idle deadline; once it has
//! arrived the body must follow within the shorter part deadline.

use crate::error::MrpsError;
use mrp_common::crypto::{encrypted_size, StreamDecoder, StreamEncoder};
use mrp_common::frame::MAX_MESSAGE_SIZE;
use mrp_common::Message;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

/// Largest ciphertext a peer may announce.
pub const MAX_FRAME_SIZE: usize = encrypted_size(MAX_MESSAGE_SIZE);

/// Reads exactly `buf.len()` bytes or fails once `limit` elapses.
///
/// # Errors
///
/// Returns [`MrpsError::Timeout`] on deadline, [`MrpsError::ConnectionClosed`]
/// on EOF, or the underlying I/O error.
pub async fn read_exact_within<R>(
    reader: &mut R,
    buf: &mut [u8],
    limit: Duration,
    what: &'static str,
) -> Result<(), MrpsError>
where
    R: AsyncRead + Unpin,
{
    match timeout(limit, reader.read_exact(buf)).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(MrpsError::ConnectionClosed)
        }
        Ok(Err(e)) => Err(MrpsError::Io(e)),
        Err(_) => Err(MrpsError::Timeout(what)),
    }
}

/// Writes all of `data` or fails once `limit` elapses.
///
/// # Errors
///
/// Returns [`MrpsError::Timeout`] on deadline or the underlying I/O error.
pub async fn write_all_within<W>(
    writer: &mut W,
    data: &[u8],
    limit: Duration,
    what: &'static str,
) -> Result<(), MrpsError>
where
    W: AsyncWrite + Unpin,
{
    match timeout(limit, writer.write_all(data)).await {
        Ok(result) => result.map_err(MrpsError::Io),
        Err(_) => Err(MrpsError::Timeout(what)),
    }
}

/// Reads one ciphertext frame.
///
/// # Errors
///
/// Returns [`MrpsError::InvalidLength`] if the announced length is zero or
/// above [`MAX_FRAME_SIZE`], plus any error of [`read_exact_within`].
pub async fn read_frame<R>(reader: &mut R, idle: Duration, part: Duration) -> Result<Vec<u8>, MrpsError>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; 4];
    read_exact_within(reader, &mut prefix, idle, "frame length read").await?;
    let len = u32::from_le_bytes(prefix);
    if len == 0 || len as usize > MAX_FRAME_SIZE {
        return Err(MrpsError::InvalidLength(len));
    }

    let mut body = vec![0u8; len as usize];
    read_exact_within(reader, &mut body, part, "frame body read").await?;
    Ok(body)
}

/// Writes one ciphertext frame: the length under `idle`, the body under `part`.
///
/// # Errors
///
/// Returns any error of [`write_all_within`].
#[allow(clippy::cast_possible_truncation)]
pub async fn write_frame<W>(writer: &mut W, data: &[u8], idle: Duration, part: Duration) -> Result<(), MrpsError>
where
    W: AsyncWrite + Unpin,
{
    let prefix = (data.len() as u32).to_le_bytes();
    write_all_within(writer, &prefix, idle, "frame length write").await?;
    write_all_within(writer, data, part, "frame body write").await?;
    writer.flush().await.map_err(MrpsError::Io)
}

/// Reads, decrypts and unpacks the next message.
///
/// # Errors
///
/// Returns transport, cipher or codec errors.
pub async fn receive<R>(
    reader: &mut R,
    decoder: &mut StreamDecoder,
    idle: Duration,
    part: Duration,
) -> Result<Message, MrpsError>
where
    R: AsyncRead + Unpin,
{
    let frame = read_frame(reader, idle, part).await?;
    let plain = decoder.decrypt(&frame)?;
    Ok(Message::unpack(&plain)?)
}

/// Packs, encrypts and writes a message.
///
/// # Errors
///
/// Returns codec, cipher or transport errors.
pub async fn send<W>(
    writer: &mut W,
    encoder: &mut StreamEncoder,
    message: &Message,
    idle: Duration,
    part: Duration,
) -> Result<(), MrpsError>
where
    W: AsyncWrite + Unpin,
{
    let plain = message.pack()?;
    let frame = encoder.encrypt(&plain)?;
    write_frame(writer, &frame, idle, part).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use mrp_common::crypto::KeyPair;
    use mrp_common::types::{flag, EMPTY_TOKEN};

    const IDLE: Duration = Duration::from_secs(5);
    const PART: Duration = Duration::from_millis(200);

    #[tokio::test]
    async fn frame_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, &[7u8; 40], IDLE, PART).await.unwrap();
        let got = read_frame(&mut b, IDLE, PART).await.unwrap();
        assert_eq!(got, vec![7u8; 40]);
    }

    #[tokio::test]
    async fn zero_length_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&0u32.to_le_bytes()).await.unwrap();
        assert!(matches!(
            read_frame(&mut b, IDLE, PART).await,
            Err(MrpsError::InvalidLength(0))
        ));
    }

    #[tokio::test]
    async fn oversized_length_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let len = MAX_FRAME_SIZE as u32 + 1;
        a.write_all(&len.to_le_bytes()).await.unwrap();
        assert!(matches!(
            read_frame(&mut b, IDLE, PART).await,
            Err(MrpsError::InvalidLength(l)) if l == len
        ));
    }

    #[tokio::test]
    async fn stalled_body_times_out() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&10u32.to_le_bytes()).await.unwrap();
        a.write_all(&[1, 2, 3]).await.unwrap();
        assert!(matches!(
            read_frame(&mut b, IDLE, PART).await,
            Err(MrpsError::Timeout("frame body read"))
        ));
    }

    #[tokio::test]
    async fn eof_is_connection_closed() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);
        assert!(matches!(
            read_frame(&mut b, IDLE, PART).await,
            Err(MrpsError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn encrypted_message_round_trip() {
        let server = KeyPair::generate();
        let client = KeyPair::generate();
        let keys = server.server_session_keys(&client.public_bytes()).unwrap();
        let peer = client.client_session_keys(&server.public_bytes()).unwrap();
        let (mut encoder, header) = StreamEncoder::new(&keys.tx).unwrap();
        let mut decoder = StreamDecoder::new(&peer.rx, &header).unwrap();

        let (mut a, mut b) = tokio::io::duplex(4096);
        let message = Message::new(flag::PROCEED, 42, 1, 2, EMPTY_TOKEN).with_body(b"hi".to_vec());
        send(&mut a, &mut encoder, &message, IDLE, PART).await.unwrap();
        let got = receive(&mut b, &mut decoder, IDLE, PART).await.unwrap();
        assert_eq!(got, message);
    }
}
