use argon2::password_hash::{PasswordHash, PasswordHasher as _, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};
use rand::rngs::OsRng;
use rand::RngCore;

/// Argon2id password hashing with configurable cost.
///
/// Hashes are PHC strings, so verification reads the cost back from the
/// stored hash and keeps working after the configured cost changes.
#[derive(Clone, Debug)]
pub struct PasswordHasher {
    params: Params,
}

impl PasswordHasher {
    /// Creates a hasher with the given memory cost (KiB) and iteration count.
    ///
    /// # Errors
    ///
    /// Returns an error if the parameters are outside Argon2's limits.
    pub fn new(memory_kib: u32, iterations: u32) -> Result<Self, argon2::Error> {
        let params = Params::new(memory_kib, iterations, 1, None)?;
        Ok(Self { params })
    }

    /// Hashes `password` under a fresh random salt.
    ///
    /// # Errors
    ///
    /// Returns a description of the failure if hashing is rejected.
    pub fn hash(&self, password: &[u8]) -> Result<String, String> {
        let mut salt = [0u8; 16];
        OsRng.fill_bytes(&mut salt);
        let salt = SaltString::encode_b64(&salt).map_err(|e| e.to_string())?;
        Argon2::new(Algorithm::Argon2id, Version::V0x13, self.params.clone())
            .hash_password(password, &salt)
            .map(|hash| hash.to_string())
            .map_err(|e| e.to_string())
    }

    /// Checks `password` against a PHC hash produced by [`Self::hash`].
    #[must_use]
    pub fn verify(&self, password: &[u8], phc: &str) -> bool {
        let Ok(parsed) = PasswordHash::new(phc) else {
            return false;
        };
        Argon2::default().verify_password(password, &parsed).is_ok()
    }
}
