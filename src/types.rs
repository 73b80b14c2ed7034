//! Core types for the last-value cache.

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

/// Instrument identifier.
///
/// Cheap to clone; hashes and compares like the underlying string so maps
/// keyed by `Key` can be queried with a plain `&str`.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Key(Arc<str>);

impl Key {
    pub fn new(key: impl AsRef<str>) -> Self {
        Key(Arc::from(key.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for Key {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key::new(s)
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Key(Arc::from(s))
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({})", self.0)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-key version assigned by the store. Version 1 is the first update.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Version(pub u64);

impl Version {
    /// Sentinel for "nothing seen yet".
    pub const ZERO: Version = Version(0);

    /// The following version, or `None` on overflow.
    pub fn next(self) -> Option<Self> {
        self.0.checked_add(1).map(Version)
    }
}

impl fmt::Debug for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Nanoseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Nanoseconds elapsed from `earlier` to `self`, clamped at zero.
    pub fn nanos_since(self, earlier: Timestamp) -> u64 {
        self.0.saturating_sub(earlier.0).max(0) as u64
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// Immutable snapshot of one key's state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueRecord {
    /// Instrument this value belongs to.
    pub key: Key,

    /// Opaque producer payload.
    pub payload: Vec<u8>,

    /// Store-assigned version, strictly increasing per key.
    pub version: Version,

    /// Store ingestion time.
    pub observed_at: Timestamp,

    /// Time claimed by the producer. Metadata only, never used for ordering.
    pub claimed_at: Timestamp,
}

/// Shared handle to a record. Records are never mutated after construction.
pub type SharedRecord = Arc<ValueRecord>;

/// Which keys a subscriber is interested in.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyFilter {
    /// Every key, including keys first published after subscribing.
    All,
    /// An explicit set of keys.
    Keys(BTreeSet<Key>),
}

impl KeyFilter {
    /// Filter over an explicit list of keys.
    pub fn keys<I, K>(keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<Key>,
    {
        KeyFilter::Keys(keys.into_iter().map(Into::into).collect())
    }

    pub fn matches(&self, key: &str) -> bool {
        match self {
            KeyFilter::All => true,
            KeyFilter::Keys(keys) => keys.contains(key),
        }
    }
}

/// Identifier of an attached consumer.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubscriberId(pub u64);

impl fmt::Debug for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SubscriberId({})", self.0)
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier a producer presents at ingress.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProducerId(pub String);

impl ProducerId {
    pub fn new(id: impl Into<String>) -> Self {
        ProducerId(id.into())
    }
}

impl fmt::Display for ProducerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a batch run.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BatchRunId(pub u64);

impl fmt::Debug for BatchRunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BatchRunId({})", self.0)
    }
}

impl fmt::Display for BatchRunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How an update reached the consumer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateOrigin {
    /// Part of the initial image taken at attach time.
    Snapshot,
    /// Live fan-out after attach.
    Live,
}

/// One value handed to an egress sink.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Update {
    pub record: SharedRecord,
    pub origin: UpdateOrigin,
}

impl Update {
    pub fn key(&self) -> &Key {
        &self.record.key
    }

    pub fn version(&self) -> Version {
        self.record.version
    }

    pub fn payload(&self) -> &[u8] {
        &self.record.payload
    }
}

/// A price staged by a producer (ingress or batch upload).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceInput {
    pub key: Key,
    pub payload: Vec<u8>,
    pub claimed_at: Timestamp,
}

impl PriceInput {
    pub fn new(key: impl Into<Key>, payload: impl Into<Vec<u8>>, claimed_at: Timestamp) -> Self {
        Self {
            key: key.into(),
            payload: payload.into(),
            claimed_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_key_lookup_by_str() {
        let mut map = HashMap::new();
        map.insert(Key::new("AAPL"), 1);
        assert_eq!(map.get("AAPL"), Some(&1));
        assert_eq!(map.get("MSFT"), None);
    }

    #[test]
    fn test_version_next_overflow() {
        assert_eq!(Version::ZERO.next(), Some(Version(1)));
        assert_eq!(Version(u64::MAX).next(), None);
    }

    #[test]
    fn test_filter_matches() {
        let filter = KeyFilter::keys(["AIR", "VOW"]);
        assert!(filter.matches("AIR"));
        assert!(!filter.matches("NEE"));
        assert!(KeyFilter::All.matches("NEE"));
    }

    #[test]
    fn test_nanos_since_clamps() {
        assert_eq!(Timestamp(150).nanos_since(Timestamp(100)), 50);
        assert_eq!(Timestamp(100).nanos_since(Timestamp(150)), 0);
    }
}
