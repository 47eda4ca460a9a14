//! Cryptographic contracts for the MRP handshake and session streams.
//!
//! - Ed25519 signatures over handshake payloads (`signature ‖ payload`)
//! - X25519 key exchange with HKDF-SHA256 session key derivation
//! - AES-256-GCM streams keyed per direction, with an implicit message
//!   counter so frames only decrypt in the order they were sent

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use ed25519_dalek::{Signature, SigningKey, VerifyingKey};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

/// Size of an X25519 public key and of every symmetric key.
pub const KEY_SIZE: usize = 32;

/// Size of an Ed25519 signature.
pub const SIGNATURE_SIZE: usize = 64;

/// Size of the header that seeds a stream.
pub const HEADER_SIZE: usize = 24;

/// Bytes added to every plaintext by the stream cipher.
pub const ENCRYPTED_OVERHEAD: usize = 16;

/// The constant the server signs to produce its token.
pub const SERVER_TOKEN_SEED: [u8; 8] = [0xFF; 8];

const SESSION_INFO: &[u8] = b"mrp session keys v1";
const STREAM_INFO: &[u8] = b"mrp stream v1";

/// Errors from key exchange and stream operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    /// The peer's public key produced a non-contributory shared secret.
    #[error("key exchange failed")]
    KeyExchange,
    /// A fixed-size input had the wrong length.
    #[error("invalid length: expected {expected}, got {actual}")]
    InvalidLength {
        /// Expected byte count.
        expected: usize,
        /// Actual byte count.
        actual: usize,
    },
    /// Authentication failed: tampered, reordered or foreign ciphertext.
    #[error("decryption failed")]
    Decrypt,
    /// The AEAD refused to encrypt (stream exhausted).
    #[error("encryption failed")]
    Encrypt,
}

/// Returns the current Unix time in milliseconds.
///
/// Returns 0 if the system clock is before the Unix epoch.
///
/// # Examples
///
/// ```
/// let now = mrp_common::crypto::unix_now_millis();
/// assert!(now > 1_700_000_000_000);
/// ```
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn unix_now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Signs `payload`, returning `signature ‖ payload`.
///
/// # Examples
///
/// ```
/// use ed25519_dalek::SigningKey;
/// use mrp_common::crypto;
///
/// let key = SigningKey::from_bytes(&[1u8; 32]);
/// let signed = crypto::sign(&key, b"hello");
/// assert_eq!(crypto::open_signed(&key.verifying_key(), &signed), Some(&b"hello"[..]));
/// ```
#[must_use]
pub fn sign(signing_key: &SigningKey, payload: &[u8]) -> Vec<u8> {
    use ed25519_dalek::Signer;
    let signature = signing_key.sign(payload);
    let mut v = Vec::with_capacity(SIGNATURE_SIZE + payload.len());
    v.extend_from_slice(&signature.to_bytes());
    v.extend_from_slice(payload);
    v
}

/// Verifies a `signature ‖ payload` blob and returns the payload.
#[must_use]
pub fn open_signed<'a>(verifying_key: &VerifyingKey, signed: &'a [u8]) -> Option<&'a [u8]> {
    use ed25519_dalek::Verifier;
    if signed.len() < SIGNATURE_SIZE {
        return None;
    }
    let (sig, payload) = signed.split_at(SIGNATURE_SIZE);
    let sig = Signature::from_bytes(sig.try_into().ok()?);
    verifying_key.verify(payload, &sig).ok()?;
    Some(payload)
}

/// Returns the server token: the signature over [`SERVER_TOKEN_SEED`].
#[must_use]
pub fn server_token(signing_key: &SigningKey) -> [u8; SIGNATURE_SIZE] {
    use ed25519_dalek::Signer;
    signing_key.sign(&SERVER_TOKEN_SEED).to_bytes()
}

/// Checks that `token` is the server token of `verifying_key`.
#[must_use]
pub fn verify_server_token(verifying_key: &VerifyingKey, token: &[u8; SIGNATURE_SIZE]) -> bool {
    use ed25519_dalek::Verifier;
    verifying_key
        .verify(&SERVER_TOKEN_SEED, &Signature::from_bytes(token))
        .is_ok()
}

/// A long-lived X25519 key pair.
pub struct KeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl KeyPair {
    /// Generates a key pair from OS randomness.
    #[must_use]
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Public key bytes for transmission.
    #[must_use]
    pub fn public_bytes(&self) -> [u8; KEY_SIZE] {
        self.public.to_bytes()
    }

    /// Derives session keys as the server side of the exchange.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::KeyExchange`] for a low-order client key.
    pub fn server_session_keys(&self, client_public: &[u8; KEY_SIZE]) -> Result<SessionKeys, CryptoError> {
        let (c2s, s2c) = self.derive(client_public, client_public, &self.public_bytes())?;
        Ok(SessionKeys { rx: c2s, tx: s2c })
    }

    /// Derives session keys as the client side of the exchange.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::KeyExchange`] for a low-order server key.
    pub fn client_session_keys(&self, server_public: &[u8; KEY_SIZE]) -> Result<SessionKeys, CryptoError> {
        let (c2s, s2c) = self.derive(server_public, &self.public_bytes(), server_public)?;
        Ok(SessionKeys { rx: s2c, tx: c2s })
    }

    fn derive(
        &self,
        peer: &[u8; KEY_SIZE],
        client_public: &[u8; KEY_SIZE],
        server_public: &[u8; KEY_SIZE],
    ) -> Result<(Zeroizing<[u8; KEY_SIZE]>, Zeroizing<[u8; KEY_SIZE]>), CryptoError> {
        let shared = self.secret.diffie_hellman(&PublicKey::from(*peer));
        if !shared.was_contributory() {
            return Err(CryptoError::KeyExchange);
        }

        let mut salt = [0u8; 2 * KEY_SIZE];
        salt[..KEY_SIZE].copy_from_slice(client_public);
        salt[KEY_SIZE..].copy_from_slice(server_public);

        let hk = Hkdf::<Sha256>::new(Some(&salt), shared.as_bytes());
        let mut okm = Zeroizing::new([0u8; 2 * KEY_SIZE]);
        hk.expand(SESSION_INFO, okm.as_mut())
            .map_err(|_| CryptoError::KeyExchange)?;

        let mut c2s = Zeroizing::new([0u8; KEY_SIZE]);
        let mut s2c = Zeroizing::new([0u8; KEY_SIZE]);
        c2s.copy_from_slice(&okm[..KEY_SIZE]);
        s2c.copy_from_slice(&okm[KEY_SIZE..]);
        Ok((c2s, s2c))
    }
}

/// Per-direction keys produced by the key exchange.
pub struct SessionKeys {
    /// Key for decrypting what the peer sends.
    pub rx: Zeroizing<[u8; KEY_SIZE]>,
    /// Key for encrypting what this side sends.
    pub tx: Zeroizing<[u8; KEY_SIZE]>,
}

fn stream_cipher(key: &[u8; KEY_SIZE], header: &[u8; HEADER_SIZE]) -> Result<Aes256Gcm, CryptoError> {
    let hk = Hkdf::<Sha256>::new(Some(header), key);
    let mut subkey = Zeroizing::new([0u8; KEY_SIZE]);
    hk.expand(STREAM_INFO, subkey.as_mut())
        .map_err(|_| CryptoError::KeyExchange)?;
    Aes256Gcm::new_from_slice(subkey.as_ref()).map_err(|_| CryptoError::InvalidLength {
        expected: KEY_SIZE,
        actual: subkey.len(),
    })
}

fn nonce_for(counter: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[4..].copy_from_slice(&counter.to_be_bytes());
    nonce
}

/// Encrypting half of a session stream.
pub struct StreamEncoder {
    cipher: Aes256Gcm,
    counter: u64,
}

impl StreamEncoder {
    /// Starts a new stream under `key`, returning it with the header the
    /// peer needs to attach a [`StreamDecoder`].
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError`] if the stream subkey cannot be derived.
    pub fn new(key: &[u8; KEY_SIZE]) -> Result<(Self, [u8; HEADER_SIZE]), CryptoError> {
        let mut header = [0u8; HEADER_SIZE];
        OsRng.fill_bytes(&mut header);
        let cipher = stream_cipher(key, &header)?;
        Ok((Self { cipher, counter: 0 }, header))
    }

    /// Encrypts the next message of the stream.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Encrypt`] if the AEAD rejects the input.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce = nonce_for(self.counter);
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| CryptoError::Encrypt)?;
        self.counter = self.counter.checked_add(1).ok_or(CryptoError::Encrypt)?;
        Ok(ciphertext)
    }
}

/// Decrypting half of a session stream.
pub struct StreamDecoder {
    cipher: Aes256Gcm,
    counter: u64,
}

impl StreamDecoder {
    /// Attaches to a peer's stream from its key and header.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidLength`] if `header` is not
    /// [`HEADER_SIZE`] bytes.
    pub fn new(key: &[u8; KEY_SIZE], header: &[u8]) -> Result<Self, CryptoError> {
        let header: &[u8; HEADER_SIZE] =
            header.try_into().map_err(|_| CryptoError::InvalidLength {
                expected: HEADER_SIZE,
                actual: header.len(),
            })?;
        let cipher = stream_cipher(key, header)?;
        Ok(Self { cipher, counter: 0 })
    }

    /// Decrypts the next message of the stream.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Decrypt`] if the ciphertext was tampered with,
    /// replayed, reordered, or sealed under another stream.
    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce = nonce_for(self.counter);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext)
            .map_err(|_| CryptoError::Decrypt)?;
        self.counter += 1;
        Ok(plaintext)
    }
}

/// Size of a ciphertext produced from `plaintext_len` bytes.
#[must_use]
pub const fn encrypted_size(plaintext_len: usize) -> usize {
    plaintext_len + ENCRYPTED_OVERHEAD
}
