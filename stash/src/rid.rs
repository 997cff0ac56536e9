//! Random public identifiers.
//!
//! Attachments and fragments are addressed externally by a random
//! identifier that cannot be derived from the numeric database ID.
//! Chunks of a fragment get shorter identifiers of the same alphabet.

use rand::distributions::{Distribution, Uniform};
use rand::Rng;

use crate::error::{StashError, StashResult};

/// Length of the public identifier of attachments and fragments.
pub const RID_LENGTH: usize = 16;

/// Length of the identifier of a chunk within a fragment.
pub const CHUNK_ID_LENGTH: usize = 8;

const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Generates a random string of ASCII letters.
pub fn random_string(len: usize) -> String {
    random_string_with(&mut rand::thread_rng(), len)
}

/// Generates a random string of ASCII letters with a specific RNG.
pub fn random_string_with<R: Rng + ?Sized>(rng: &mut R, len: usize) -> String {
    let range = Uniform::from(0..ALPHABET.len());

    range
        .sample_iter(rng)
        .take(len)
        .map(|idx| ALPHABET[idx] as char)
        .collect()
}

/// Generates a new public identifier.
pub fn new_rid() -> String {
    random_string(RID_LENGTH)
}

/// Generates a new chunk identifier.
pub fn new_chunk_id() -> String {
    random_string(CHUNK_ID_LENGTH)
}

/// Returns whether a string looks like an identifier of the given length.
pub fn is_valid_id(s: &str, len: usize) -> bool {
    s.len() == len && s.bytes().all(|b| b.is_ascii_alphabetic())
}

/// Validates a public identifier supplied by a caller.
pub fn validate_rid(rid: &str) -> StashResult<()> {
    if is_valid_id(rid, RID_LENGTH) {
        Ok(())
    } else {
        Err(StashError::InvalidIdentifier {
            id: rid.to_owned(),
            reason: "must be 16 ASCII letters",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashSet;

    #[test]
    fn test_random_string() {
        let rid = new_rid();
        assert!(is_valid_id(&rid, RID_LENGTH));

        let chunk = new_chunk_id();
        assert!(is_valid_id(&chunk, CHUNK_ID_LENGTH));

        assert!(!is_valid_id("abc", RID_LENGTH));
        assert!(!is_valid_id("abcdefg1", CHUNK_ID_LENGTH));
    }

    #[test]
    fn test_validate_rid() {
        validate_rid(&new_rid()).unwrap();

        assert!(matches!(
            validate_rid("../../etc/passwd"),
            Err(StashError::InvalidIdentifier { .. })
        ));
        assert!(validate_rid("").is_err());
    }

    #[test]
    fn test_uniqueness() {
        let ids: HashSet<String> = (0..1000).map(|_| new_rid()).collect();
        assert_eq!(1000, ids.len());
    }
}
