//! Content hashing for cache keys and fingerprints.
//!
//! All hashes in cairn are SHA-256 rendered as `sha256:<hex>`. The
//! prefix makes the algorithm explicit in stored keys so that a future
//! algorithm migration can distinguish old entries from new ones.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Prefix identifying the hash algorithm in rendered form.
const HASH_PREFIX: &str = "sha256:";

/// A SHA-256 content hash, rendered as `sha256:<64 hex chars>`.
///
/// Used both as cache-store keys (hash of an artifact's bytes) and as
/// the representation of target fingerprints (hash of a canonical
/// fingerprint document).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(String);

impl ContentHash {
    /// Computes the hash of the given bytes.
    #[must_use]
    pub fn of(bytes: &[u8]) -> Self {
        let digest = Sha256::digest(bytes);
        Self(format!("{HASH_PREFIX}{}", hex::encode(digest)))
    }

    /// Returns the rendered `sha256:<hex>` string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the hex digest without the algorithm prefix.
    ///
    /// Suitable for use as a filesystem path component.
    #[must_use]
    pub fn hex(&self) -> &str {
        // The prefix is validated at construction, so this split is total.
        self.0.strip_prefix(HASH_PREFIX).unwrap_or(&self.0)
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ContentHash {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let Some(hex_part) = s.strip_prefix(HASH_PREFIX) else {
            return Err(Error::InvalidHash {
                message: format!("missing '{HASH_PREFIX}' prefix: {s}"),
            });
        };
        if hex_part.len() != 64 || !hex_part.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(Error::InvalidHash {
                message: format!("expected 64 hex characters after prefix: {s}"),
            });
        }
        Ok(Self(s.to_string()))
    }
}
