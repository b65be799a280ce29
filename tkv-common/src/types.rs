//! # Record Type Definitions
//!
//! Core data types shared by the request encoder, the wire decoder, and the
//! application-facing API.
//!
//! ## Design Principles
//!
//! 1. **Digest Routing**: A `Key` carries its 20-byte digest; every routing
//!    decision (partition, node) is derived from the digest alone.
//!
//! 2. **Immutable Results**: `Record` is built once by the decoder and never
//!    mutated afterwards, so it can be handed to listeners by value.
//!
//! 3. **Absence As Data**: `ReadOutcome::Absent` models a missing key as a
//!    successful outcome rather than an error path.
//!
//! 4. **Opaque Collections**: Lists and maps stay in their packed server
//!    encoding; unpacking them is a caller concern.
//!
//! ## Digest Layout
//!
//! ```text
//! Key digest (20 bytes):
//! +-----------------+-------------------------------+
//! | bytes 0..4 (LE) | bytes 4..20                   |
//! +-----------------+-------------------------------+
//! partition_id = (u32_le(bytes 0..4) & 0xFFFF) % PARTITIONS
//! ```

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Digest size in bytes.
pub const DIGEST_SIZE: usize = 20;

/// Number of partitions per namespace.
pub const PARTITIONS: u32 = 4096;

/// Server epoch (2010-01-01T00:00:00Z) in seconds since the Unix epoch.
pub const SERVER_EPOCH_SECS: u64 = 1_262_304_000;

/// Record identity: namespace, set, and the digest computed from the user key.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Key {
    namespace: String,
    set_name: String,
    digest: [u8; DIGEST_SIZE],
    user_key: Option<String>,
}

impl Key {
    /// Creates a key from a precomputed digest.
    pub fn from_digest(
        namespace: impl Into<String>,
        set_name: impl Into<String>,
        digest: [u8; DIGEST_SIZE],
    ) -> Self {
        Key {
            namespace: namespace.into(),
            set_name: set_name.into(),
            digest,
            user_key: None,
        }
    }

    /// Attaches the original user key for display and diagnostics.
    pub fn with_user_key(mut self, user_key: impl Into<String>) -> Self {
        self.user_key = Some(user_key.into());
        self
    }

    #[inline]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    #[inline]
    pub fn set_name(&self) -> &str {
        &self.set_name
    }

    #[inline]
    pub fn digest(&self) -> &[u8; DIGEST_SIZE] {
        &self.digest
    }

    #[inline]
    pub fn user_key(&self) -> Option<&str> {
        self.user_key.as_deref()
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({}:{}:", self.namespace, self.set_name)?;
        match &self.user_key {
            Some(user_key) => write!(f, "{:?})", user_key),
            None => {
                for byte in &self.digest {
                    write!(f, "{:02x}", byte)?;
                }
                write!(f, ")")
            }
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Routing coordinate for a key: namespace plus partition id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Partition {
    pub namespace: String,
    pub partition_id: u32,
}

impl Partition {
    /// Computes the partition owning `key`.
    pub fn new(key: &Key) -> Self {
        let d = key.digest();
        let low = u32::from_le_bytes([d[0], d[1], d[2], d[3]]);
        Partition {
            namespace: key.namespace().to_string(),
            partition_id: (low & 0xFFFF) % PARTITIONS,
        }
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.partition_id)
    }
}

/// A single decoded bin value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Nil,
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
    Blob(Vec<u8>),
    /// Packed list, left in server encoding.
    List(Vec<u8>),
    /// Packed map, left in server encoding.
    Map(Vec<u8>),
    /// Particle type this client does not interpret.
    Other { particle_type: u8, bytes: Vec<u8> },
}

impl Value {
    /// Returns the string payload, if this is a string value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the integer payload, if this is an integer value.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(value.to_string())
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

/// Record returned by a successful read.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    /// Bin name to value. Empty for header-only reads.
    pub bins: HashMap<String, Value>,
    /// Per-key version counter, incremented on every write.
    pub generation: u32,
    /// Expiration in seconds since the server epoch; 0 means never.
    pub expiration: u32,
}

impl Record {
    pub fn new(bins: HashMap<String, Value>, generation: u32, expiration: u32) -> Self {
        Record {
            bins,
            generation,
            expiration,
        }
    }

    /// Looks up a bin by name.
    pub fn bin(&self, name: &str) -> Option<&Value> {
        self.bins.get(name)
    }

    /// Remaining lifetime relative to now.
    ///
    /// Returns `None` for records that never expire and `Some(ZERO)` for
    /// records whose expiration already passed.
    pub fn time_to_live(&self) -> Option<Duration> {
        if self.expiration == 0 {
            return None;
        }
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_secs();
        let expires_at = SERVER_EPOCH_SECS + u64::from(self.expiration);
        Some(Duration::from_secs(expires_at.saturating_sub(now)))
    }
}

/// Outcome of a single-record read.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadOutcome {
    /// The key does not exist.
    Absent,
    /// The key exists.
    Found(Record),
}

impl ReadOutcome {
    /// Converts into the `Option` form handed to listeners.
    pub fn into_record(self) -> Option<Record> {
        match self {
            ReadOutcome::Absent => None,
            ReadOutcome::Found(record) => Some(record),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest_with_prefix(prefix: [u8; 4]) -> [u8; DIGEST_SIZE] {
        let mut digest = [0u8; DIGEST_SIZE];
        digest[..4].copy_from_slice(&prefix);
        digest
    }

    #[test]
    fn test_partition_from_digest() {
        let key = Key::from_digest("test", "users", digest_with_prefix([0x01, 0x02, 0xFF, 0xFF]));
        let partition = Partition::new(&key);
        assert_eq!(partition.namespace, "test");
        // 0x0201 masked to 16 bits, mod 4096.
        assert_eq!(partition.partition_id, 0x0201 % PARTITIONS);
    }

    #[test]
    fn test_partition_wraps_at_partition_count() {
        let key = Key::from_digest("test", "", digest_with_prefix([0xFF, 0xFF, 0x00, 0x00]));
        assert_eq!(Partition::new(&key).partition_id, 0xFFFF % PARTITIONS);
    }

    #[test]
    fn test_key_debug_prefers_user_key() {
        let key = Key::from_digest("ns", "set", [0xAB; DIGEST_SIZE]);
        assert!(format!("{:?}", key).contains("abab"));

        let key = key.with_user_key("alice");
        assert_eq!(format!("{:?}", key), "Key(ns:set:\"alice\")");
    }

    #[test]
    fn test_record_time_to_live() {
        let record = Record::new(HashMap::new(), 1, 0);
        assert_eq!(record.time_to_live(), None);

        // Long past: clamps to zero.
        let record = Record::new(HashMap::new(), 1, 1);
        assert_eq!(record.time_to_live(), Some(Duration::ZERO));

        let record = Record::new(HashMap::new(), 1, u32::MAX);
        assert!(record.time_to_live().unwrap() > Duration::from_secs(3600));
    }

    #[test]
    fn test_read_outcome_into_record() {
        assert_eq!(ReadOutcome::Absent.into_record(), None);
        let record = Record::new(HashMap::new(), 7, 100);
        assert_eq!(ReadOutcome::Found(record.clone()).into_record(), Some(record));
    }
}
