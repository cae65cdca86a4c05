//! Identifier generation for responses and results.
//!
//! Two flavours: [`stable`] hashes its parts so the same finding always gets
//! the same ID, and [`random`] produces a fresh ID for responses and clone
//! directories.

use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use sha2::{Digest, Sha256};

const ID_LENGTH: usize = 16;

static COUNTER: AtomicU64 = AtomicU64::new(0);

/// Returns a deterministic hex ID derived from `parts`.
///
/// The parts are length-prefixed before hashing so `["ab", "c"]` and
/// `["a", "bc"]` produce different IDs.
#[must_use]
pub fn stable<S: AsRef<str>>(parts: &[S]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        let bytes = part.as_ref().as_bytes();
        hasher.update((bytes.len() as u64).to_le_bytes());
        hasher.update(bytes);
    }
    hex::encode(&hasher.finalize()[..ID_LENGTH / 2])
}

/// Returns a fresh process-unique hex ID.
#[must_use]
pub fn random() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.subsec_nanos() as u128 + d.as_secs() as u128 * 1_000_000_000);
    let count = COUNTER.fetch_add(1, Ordering::Relaxed);

    let mut hasher = Sha256::new();
    hasher.update(nanos.to_le_bytes());
    hasher.update(process::id().to_le_bytes());
    hasher.update(count.to_le_bytes());
    hex::encode(&hasher.finalize()[..ID_LENGTH / 2])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_ids_differ() {
        assert_ne!(random(), random());
    }

    #[test]
    fn ids_are_fixed_length_hex() {
        for id in [random(), stable(&["foo"]), stable(&["foo", "bar"])] {
            assert_eq!(id.len(), ID_LENGTH);
            assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        }
    }

    #[test]
    fn stable_is_deterministic() {
        assert_eq!(stable(&["a", "b", "c"]), stable(&["a", "b", "c"]));
    }

    #[test]
    fn stable_respects_part_boundaries() {
        assert_ne!(stable(&["ab", "c"]), stable(&["a", "bc"]));
    }
}
