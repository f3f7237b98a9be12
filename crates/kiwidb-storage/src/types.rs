//! Column families and key layout.

use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};
use serde::{Deserialize, Serialize};

/// Engine-assigned sequence number of a single mutation.
pub type SequenceNumber = u64;

/// Number of column families in every shard.
pub const CF_COUNT: usize = 2;

/// Column families of a shard.
///
/// Every key in a shard belongs to exactly one column family; the family
/// byte is the first byte of the stored key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum ColumnFamily {
    /// Plain string values.
    Strings = 0,
    /// Hash fields.
    Hashes = 1,
}

impl ColumnFamily {
    /// All column families in index order.
    pub const ALL: [ColumnFamily; CF_COUNT] = [ColumnFamily::Strings, ColumnFamily::Hashes];

    /// Index of this family.
    pub fn index(self) -> usize {
        self as usize
    }

    /// Look up a family by its index.
    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    /// Name used in logs and table properties.
    pub fn name(self) -> &'static str {
        match self {
            ColumnFamily::Strings => "strings",
            ColumnFamily::Hashes => "hashes",
        }
    }
}

/// Data-type discriminant carried by a log entry.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Archive, RkyvSerialize, RkyvDeserialize,
)]
pub enum DataType {
    /// String commands (SET, DEL).
    String,
    /// Hash commands (HSET, HDEL).
    Hash,
}

/// Build the stored key of a hash field.
///
/// Layout: `len(key) as u32 BE | key | field`, so all fields of one hash
/// share a prefix and sort together.
pub fn hash_field_key(key: &[u8], field: &[u8]) -> Vec<u8> {
    let mut out = hash_prefix(key);
    out.extend_from_slice(field);
    out
}

/// Prefix shared by all fields of a hash.
pub fn hash_prefix(key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + key.len());
    out.extend_from_slice(&(key.len() as u32).to_be_bytes());
    out.extend_from_slice(key);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_column_family_index() {
        for (i, cf) in ColumnFamily::ALL.iter().enumerate() {
            assert_eq!(cf.index(), i);
            assert_eq!(ColumnFamily::from_index(i), Some(*cf));
        }
        assert_eq!(ColumnFamily::from_index(CF_COUNT), None);
    }

    #[test]
    fn test_hash_keys_share_prefix() {
        let a = hash_field_key(b"user", b"name");
        let b = hash_field_key(b"user", b"age");
        let other = hash_field_key(b"users", b"name");

        let prefix = hash_prefix(b"user");
        assert!(a.starts_with(&prefix));
        assert!(b.starts_with(&prefix));
        assert!(!other.starts_with(&prefix));
    }
}
