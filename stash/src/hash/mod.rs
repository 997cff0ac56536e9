//! Hashing utilities.
//!
//! Content hashes are the durable deduplication key of the engine. They
//! are always computed over the full contents of an object with SHA-256
//! and stored in the typed hexadecimal form (`sha256:<hex>`). Changing
//! the algorithm would silently stop matching historical duplicates.

#[cfg(test)]
mod tests;

use std::fmt;

use displaydoc::Display;
use serde::{de, ser, Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::StashResult;

/// A hash.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Hash {
    /// An SHA-256 hash.
    Sha256([u8; 32]),
}

/// A hashing error.
#[derive(Debug, Display)]
pub enum Error {
    /// The string lacks a colon separator.
    NoColonSeparator,

    /// Hash algorithm {0} is not supported.
    UnsupportedHashAlgorithm(String),

    /// Invalid base16 hash: {0}
    InvalidBase16Hash(hex::FromHexError),

    /// Invalid length for {typ} string: Must be {expected}, got {actual}.
    InvalidHashStringLength {
        typ: &'static str,
        expected: usize,
        actual: usize,
    },
}

impl Hash {
    /// Convenience function to generate a SHA-256 hash from a slice.
    pub fn sha256_from_bytes(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Self::Sha256(hasher.finalize().into())
    }

    /// Creates a SHA-256 hash from a finalized digest.
    pub fn from_sha256_digest(digest: &[u8]) -> StashResult<Self> {
        let data: [u8; 32] = digest.try_into().map_err(|_| Error::InvalidHashStringLength {
            typ: "SHA-256",
            expected: 32,
            actual: digest.len(),
        })?;

        Ok(Self::Sha256(data))
    }

    /// Parses a typed representation of a hash.
    pub fn from_typed(s: &str) -> StashResult<Self> {
        let colon = s.find(':').ok_or(Error::NoColonSeparator)?;

        let (typ, rest) = s.split_at(colon);
        let hash = &rest[1..];

        match typ {
            "sha256" => {
                let v = decode_hash(hash, "SHA-256", 32)?;
                Self::from_sha256_digest(&v)
            }
            _ => Err(Error::UnsupportedHashAlgorithm(typ.to_owned()).into()),
        }
    }

    /// Returns the hash in hexadecimal format, with the hash type prepended.
    ///
    /// This is the canonical representation of hashes in the database.
    pub fn to_typed_base16(&self) -> String {
        format!("{}:{}", self.hash_type(), hex::encode(self.data()))
    }

    fn data(&self) -> &[u8] {
        match self {
            Self::Sha256(d) => d,
        }
    }

    fn hash_type(&self) -> &'static str {
        match self {
            Self::Sha256(_) => "sha256",
        }
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_typed_base16())
    }
}

impl<'de> Deserialize<'de> for Hash {
    /// Deserializes a typed hash string.
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: de::Deserializer<'de>,
    {
        use de::Error;

        String::deserialize(deserializer)
            .and_then(|s| Self::from_typed(&s).map_err(|e| Error::custom(e.to_string())))
    }
}

impl Serialize for Hash {
    /// Serializes a hash into a hexadecimal hash string.
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: ser::Serializer,
    {
        serializer.serialize_str(&self.to_typed_base16())
    }
}

/// Decodes a base16 encoded hash containing a specified number of bytes.
fn decode_hash(s: &str, typ: &'static str, expected_bytes: usize) -> StashResult<Vec<u8>> {
    let expected = expected_bytes * 2;

    if s.len() != expected {
        return Err(Error::InvalidHashStringLength {
            typ,
            expected,
            actual: s.len(),
        }
        .into());
    }

    let v = hex::decode(s).map_err(Error::InvalidBase16Hash)?;

    Ok(v)
}
