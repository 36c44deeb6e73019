//! Dedup key derivation.
//!
//! Two requests merge only when their keys match, so the derivation must be
//! deterministic and collision-resistant: SHA-256 over method, URL and full
//! body, each field length-prefixed so adjacent fields cannot alias.
//! Headers are excluded unless the policy names them.

use sha2::{Digest, Sha256};

use crate::transport::{HttpRequest, MergeHint};

/// Identity of a mergeable request shape. At most one underlying call per
/// distinct key is in flight at any time.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct DedupKey([u8; 32]);

impl DedupKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Display for DedupKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short prefix is enough to correlate log lines.
        f.write_str(&hex::encode(&self.0[..8]))
    }
}

impl std::fmt::Debug for DedupKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DedupKey({})", hex::encode(self.0))
    }
}

/// Controls which request fields participate in the dedup key.
#[derive(Debug, Clone, Default)]
pub struct KeyPolicy {
    /// Header names (case-insensitive) folded into the key. Name a header
    /// here when its value changes the response, e.g. `Authorization` for
    /// per-user results.
    pub include_headers: Vec<String>,
}

impl KeyPolicy {
    /// Derive the dedup key for a request, or `None` when the request is
    /// not mergeable and must dispatch on its own.
    pub fn key_for(&self, request: &HttpRequest) -> Option<DedupKey> {
        if request.merge_hint == MergeHint::Never {
            return None;
        }

        let mut hasher = Sha256::new();
        update_field(&mut hasher, request.method.as_str().as_bytes());
        update_field(&mut hasher, request.url.as_bytes());
        update_field(&mut hasher, request.body.as_deref().unwrap_or_default());
        for name in &self.include_headers {
            // Presence tag keeps a missing header distinct from an empty one.
            match request.header(name) {
                Some(value) => {
                    hasher.update([1u8]);
                    update_field(&mut hasher, value.as_bytes());
                }
                None => hasher.update([0u8]),
            }
        }
        Some(DedupKey(hasher.finalize().into()))
    }
}

fn update_field(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}
