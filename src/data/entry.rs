//! Dictionary entries: interned (environment, material) pairs.

use std::fmt;

use crate::core::error::{Error, Result};

/// Separator used in the serialized string form of an entry
pub const ENTRY_SEPARATOR: char = '|';

/// Immutable (environment tag, material state) pair
///
/// Compared and hashed by value. Obtain shared instances through
/// [`crate::data::EntryPool::intern`] so equal pairs share one allocation.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DictionaryEntry {
    environment: String,
    material: String,
}

impl DictionaryEntry {
    pub fn new(environment: impl Into<String>, material: impl Into<String>) -> Self {
        Self {
            environment: environment.into(),
            material: material.into(),
        }
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn material(&self) -> &str {
        &self.material
    }

    /// Serialized form: `environment|material`
    ///
    /// The environment must not contain the separator, or it would not parse
    /// back to the same pair. Materials may.
    pub fn serialize(&self) -> Result<String> {
        if self.environment.contains(ENTRY_SEPARATOR) {
            return Err(Error::Serialization(format!(
                "environment {:?} contains {:?}",
                self.environment, ENTRY_SEPARATOR
            )));
        }
        Ok(format!("{}{}{}", self.environment, ENTRY_SEPARATOR, self.material))
    }

    /// Split a serialized entry back into its parts
    pub fn parse(serialized: &str) -> Result<(&str, &str)> {
        serialized
            .split_once(ENTRY_SEPARATOR)
            .ok_or_else(|| Error::Corrupted(format!("dictionary entry without separator: {:?}", serialized)))
    }
}

impl fmt::Display for DictionaryEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.environment, ENTRY_SEPARATOR, self.material)
    }
}
