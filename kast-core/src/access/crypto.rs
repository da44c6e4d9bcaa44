use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use rand::{TryRngCore, rngs::OsRng};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::error::{Result, ScanError};

type HmacSha256 = Hmac<Sha256>;

/// HMAC-SHA-256 digests for opaque bearer secrets (share-link tokens and API
/// keys). Only the hex digest is ever persisted.
#[derive(Clone)]
pub struct TokenHasher {
    mac: HmacSha256,
}

impl std::fmt::Debug for TokenHasher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenHasher").finish_non_exhaustive()
    }
}

impl TokenHasher {
    /// Bytes of entropy in a generated token.
    pub const TOKEN_BYTES: usize = 32;

    /// Fails when `key` is empty.
    pub fn new(key: impl AsRef<[u8]>) -> Result<Self> {
        let key = key.as_ref();
        if key.is_empty() {
            return Err(ScanError::InvalidInput(
                "token HMAC key must not be empty".into(),
            ));
        }
        let mac = HmacSha256::new_from_slice(key)
            .map_err(|e| ScanError::InvalidInput(format!("invalid token HMAC key: {e}")))?;
        Ok(Self { mac })
    }

    /// Keyed digest of `token`, hex encoded. Only digests are stored.
    pub fn hash(&self, token: &str) -> String {
        let mut mac = self.mac.clone();
        mac.update(token.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Constant-time comparison of a presented token against a stored digest.
    pub fn matches(&self, token: &str, digest: &str) -> bool {
        digests_equal(&self.hash(token), digest)
    }

    /// A fresh URL-safe token. The caller shows it once and stores the digest.
    pub fn generate_token() -> Result<String> {
        let mut bytes = Zeroizing::new([0u8; Self::TOKEN_BYTES]);
        OsRng
            .try_fill_bytes(bytes.as_mut_slice())
            .map_err(|e| ScanError::Internal(format!("failed to generate token: {e}")))?;
        Ok(URL_SAFE_NO_PAD.encode(bytes.as_slice()))
    }
}

pub(crate) fn digests_equal(a: &str, b: &str) -> bool {
    constant_time_eq::constant_time_eq(a.as_bytes(), b.as_bytes())
}
