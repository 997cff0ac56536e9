//! Attachment pools.
//!
//! ## Pool Aliases
//!
//! Pool aliases are slugs of up to 50 characters and can only consist of
//! ASCII alphanumeric characters (A-Za-z0-9), dashes ('-') and underscores
//! ('_'). They must also start with an alphanumeric character (e.g.,
//! "_avatars" is _not_ a valid alias).
use std::fmt;
use std::str::FromStr;

use lazy_static::lazy_static;
use regex::Regex;
use serde::{de, Deserialize, Serialize};

use crate::error::{StashError, StashResult};

/// The maximum allowable length of a pool alias.
pub const MAX_ALIAS_LENGTH: usize = 50;

lazy_static! {
    static ref POOL_ALIAS_REGEX: Regex = Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]{0,49}$").unwrap();
}

/// The alias of an attachment pool.
#[derive(Serialize, Deserialize, Clone, Debug, Hash, Eq, PartialEq)]
#[serde(transparent)]
pub struct PoolAlias(#[serde(deserialize_with = "PoolAlias::deserialize")] String);

impl PoolAlias {
    /// Creates a pool alias from a String.
    pub fn new(alias: String) -> StashResult<Self> {
        validate_pool_alias(&alias)?;
        Ok(Self(alias))
    }

    /// Returns the string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Deserializes a potentially-invalid pool alias.
    fn deserialize<'de, D>(deserializer: D) -> Result<String, D::Error>
    where
        D: de::Deserializer<'de>,
    {
        use de::Error;
        String::deserialize(deserializer).and_then(|s| {
            validate_pool_alias(&s).map_err(|e| Error::custom(e.to_string()))?;
            Ok(s)
        })
    }
}

impl FromStr for PoolAlias {
    type Err = StashError;

    fn from_str(alias: &str) -> StashResult<Self> {
        Self::new(alias.to_owned())
    }
}

impl fmt::Display for PoolAlias {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn validate_pool_alias(alias: &str) -> StashResult<()> {
    if POOL_ALIAS_REGEX.is_match(alias) {
        Ok(())
    } else {
        Err(StashError::InvalidPoolAlias {
            name: alias.to_owned(),
        })
    }
}
