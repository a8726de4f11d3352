//! Key/value side-channel data attached to calls as headers and trailers.
//!
//! [`Metadata`] is an ordered multimap: keys are case-insensitive (stored
//! lowercased), a key may carry several values, and iteration yields entries
//! in insertion order.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised when building metadata.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MetadataError {
    /// Key is empty.
    #[error("metadata key is empty")]
    EmptyKey,

    /// Key contains a character outside `[a-z0-9-_.]`.
    #[error("invalid character {ch:?} in metadata key {key:?}")]
    InvalidKey { key: String, ch: char },
}

/// A validated, lowercased metadata key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MetadataKey(String);

impl MetadataKey {
    /// Parses and normalises a key.
    pub fn new(key: impl AsRef<str>) -> Result<Self, MetadataError> {
        let key = key.as_ref();
        if key.is_empty() {
            return Err(MetadataError::EmptyKey);
        }
        let lowered = key.to_ascii_lowercase();
        if let Some(ch) = lowered
            .chars()
            .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '-' | '_' | '.')))
        {
            return Err(MetadataError::InvalidKey {
                key: key.to_string(),
                ch,
            });
        }
        Ok(Self(lowered))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for MetadataKey {
    type Error = MetadataError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<MetadataKey> for String {
    fn from(key: MetadataKey) -> Self {
        key.0
    }
}

impl fmt::Display for MetadataKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A metadata value: text or opaque bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Text(String),
    Binary(Vec<u8>),
}

impl MetadataValue {
    /// Returns the text form, if this is a text value.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            Self::Binary(_) => None,
        }
    }

    /// Returns the raw bytes of either variant.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Text(s) => s.as_bytes(),
            Self::Binary(b) => b,
        }
    }
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<Vec<u8>> for MetadataValue {
    fn from(value: Vec<u8>) -> Self {
        Self::Binary(value)
    }
}

impl From<&[u8]> for MetadataValue {
    fn from(value: &[u8]) -> Self {
        Self::Binary(value.to_vec())
    }
}

/// Ordered multimap of metadata entries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    entries: Vec<(MetadataKey, MetadataValue)>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a value, keeping any existing values for the key.
    pub fn append(
        &mut self,
        key: impl AsRef<str>,
        value: impl Into<MetadataValue>,
    ) -> Result<(), MetadataError> {
        let key = MetadataKey::new(key)?;
        self.entries.push((key, value.into()));
        Ok(())
    }

    /// Replaces every value of the key with a single value.
    ///
    /// The new entry takes the position of the first replaced one, or goes
    /// last if the key was absent.
    pub fn insert(
        &mut self,
        key: impl AsRef<str>,
        value: impl Into<MetadataValue>,
    ) -> Result<(), MetadataError> {
        let key = MetadataKey::new(key)?;
        let value = value.into();
        match self.entries.iter().position(|(k, _)| *k == key) {
            Some(first) => {
                self.entries[first].1 = value;
                let mut index = 0;
                self.entries.retain(|(k, _)| {
                    let keep = *k != key || index == first;
                    index += 1;
                    keep
                });
            }
            None => self.entries.push((key, value)),
        }
        Ok(())
    }

    /// Appends an already validated entry.
    pub fn push(&mut self, key: MetadataKey, value: MetadataValue) {
        self.entries.push((key, value));
    }

    /// Returns the first value for a key.
    pub fn get(&self, key: &str) -> Option<&MetadataValue> {
        let key = key.to_ascii_lowercase();
        self.entries
            .iter()
            .find(|(k, _)| k.as_str() == key)
            .map(|(_, v)| v)
    }

    /// Returns the first value for a key as text.
    pub fn get_text(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(MetadataValue::as_text)
    }

    /// Returns every value for a key, in insertion order.
    pub fn get_all<'a>(&'a self, key: &str) -> impl Iterator<Item = &'a MetadataValue> + 'a {
        let key = key.to_ascii_lowercase();
        self.entries
            .iter()
            .filter(move |(k, _)| k.as_str() == key)
            .map(|(_, v)| v)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Removes every value of a key, returning them in order.
    pub fn remove(&mut self, key: &str) -> Vec<MetadataValue> {
        let key = key.to_ascii_lowercase();
        let mut removed = Vec::new();
        let mut kept = Vec::with_capacity(self.entries.len());
        for (k, v) in self.entries.drain(..) {
            if k.as_str() == key {
                removed.push(v);
            } else {
                kept.push((k, v));
            }
        }
        self.entries = kept;
        removed
    }

    /// Appends every entry of `other`.
    pub fn extend(&mut self, other: Metadata) {
        self.entries.extend(other.entries);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&MetadataKey, &MetadataValue)> {
        self.entries.iter().map(|(k, v)| (k, v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl IntoIterator for Metadata {
    type Item = (MetadataKey, MetadataValue);
    type IntoIter = std::vec::IntoIter<(MetadataKey, MetadataValue)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}
