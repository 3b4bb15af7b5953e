//! Content hashing for cheap change detection.
//!
//! The journal stores a digest of every task line (and of every remote task's
//! content) so a sync cycle can tell "nothing changed" apart from "re-derive
//! the completion state" without keeping the text itself around.

use sha2::{Digest, Sha256};

/// Digest of a text fragment at the time it was observed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContentHash(String);

impl ContentHash {
    /// Compute the hash of a text fragment.
    pub fn from_content(content: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(content.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

/// Hash a text fragment straight to the string form stored in the journal.
pub fn hash_content(content: &str) -> String {
    ContentHash::from_content(content).into_string()
}
