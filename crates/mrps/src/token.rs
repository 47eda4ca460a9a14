use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use mrp_common::types::{Token, TOKEN_SIZE};
use rand::rngs::OsRng;
use rand::RngCore;

const PLAIN_SIZE: usize = 8;
const SEALED_SIZE: usize = PLAIN_SIZE + 16;
const NONCE_SIZE: usize = 12;

/// Mints and opens client session tokens.
///
/// A token seals `connection id ‖ user id` (little-endian) under a key that
/// lives only as long as the process, laid out as
/// `ciphertext+tag (24) ‖ nonce (12) ‖ zero padding (28)`.
pub struct TokenCipher {
    cipher: Aes256Gcm,
}

impl TokenCipher {
    /// Creates a cipher with a fresh random key.
    #[must_use]
    pub fn generate() -> Self {
        let mut key = zeroize::Zeroizing::new([0u8; 32]);
        OsRng.fill_bytes(key.as_mut());
        Self {
            cipher: Aes256Gcm::new(aes_gcm::Key::<Aes256Gcm>::from_slice(key.as_ref())),
        }
    }

    /// Seals `(connection_id, user_id)` into a token.
    #[must_use]
    pub fn mint(&self, connection_id: u32, user_id: u32) -> Option<Token> {
        let mut plain = [0u8; PLAIN_SIZE];
        plain[..4].copy_from_slice(&connection_id.to_le_bytes());
        plain[4..].copy_from_slice(&user_id.to_le_bytes());

        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);
        let sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plain.as_slice())
            .ok()?;

        let mut token = [0u8; TOKEN_SIZE];
        token[..SEALED_SIZE].copy_from_slice(&sealed);
        token[SEALED_SIZE..SEALED_SIZE + NONCE_SIZE].copy_from_slice(&nonce);
        Some(token)
    }

    /// Opens a token, returning `(connection_id, user_id)` if it is authentic.
    #[must_use]
    pub fn open(&self, token: &Token) -> Option<(u32, u32)> {
        if token[SEALED_SIZE + NONCE_SIZE..].iter().any(|b| *b != 0) {
            return None;
        }
        let nonce = Nonce::from_slice(&token[SEALED_SIZE..SEALED_SIZE + NONCE_SIZE]);
        let plain = self.cipher.decrypt(nonce, &token[..SEALED_SIZE]).ok()?;
        let connection_id = u32::from_le_bytes(plain.get(..4)?.try_into().ok()?);
        let user_id = u32::from_le_bytes(plain.get(4..8)?.try_into().ok()?);
        Some((connection_id, user_id))
    }
}
