//! Property values and their record encoding
//!
//! Booleans, integers and floats are stored inline in the property record.
//! Strings are split into 32-byte dynamic blocks in strings.store; the
//! property record holds the first block id.

use crate::storage::record::{DYNAMIC_BLOCK_DATA, DynamicRecord, NULL_REFERENCE, Record};
use crate::storage::record_store::RecordStore;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Value type tag for booleans
pub const TYPE_BOOL: u32 = 1;
/// Value type tag for 64-bit integers
pub const TYPE_INT: u32 = 2;
/// Value type tag for 64-bit floats
pub const TYPE_FLOAT: u32 = 3;
/// Value type tag for strings
pub const TYPE_STRING: u32 = 4;

/// A property value
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PropertyValue {
    /// Boolean
    Bool(bool),
    /// Signed integer
    Int(i64),
    /// Floating point
    Float(f64),
    /// UTF-8 string
    String(String),
}

impl PropertyValue {
    /// Type tag stored in the property record
    pub fn type_tag(&self) -> u32 {
        match self {
            PropertyValue::Bool(_) => TYPE_BOOL,
            PropertyValue::Int(_) => TYPE_INT,
            PropertyValue::Float(_) => TYPE_FLOAT,
            PropertyValue::String(_) => TYPE_STRING,
        }
    }

    /// Inline encoding for non-string values
    pub fn inline_bits(&self) -> Option<u64> {
        match self {
            PropertyValue::Bool(b) => Some(*b as u64),
            PropertyValue::Int(i) => Some(*i as u64),
            PropertyValue::Float(f) => Some(f.to_bits()),
            PropertyValue::String(_) => None,
        }
    }

    /// Decode an inline value
    pub fn from_inline(value_type: u32, bits: u64) -> Result<Self> {
        match value_type {
            TYPE_BOOL => Ok(PropertyValue::Bool(bits != 0)),
            TYPE_INT => Ok(PropertyValue::Int(bits as i64)),
            TYPE_FLOAT => Ok(PropertyValue::Float(f64::from_bits(bits))),
            other => Err(Error::storage(format!("unknown inline value type {}", other))),
        }
    }

    /// Stable byte form used for hashing index entries
    pub fn to_key_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(9);
        bytes.push(self.type_tag() as u8);
        match self {
            PropertyValue::String(s) => bytes.extend_from_slice(s.as_bytes()),
            other => {
                if let Some(bits) = other.inline_bits() {
                    bytes.extend_from_slice(&bits.to_le_bytes());
                }
            }
        }
        bytes
    }

    fn rank(&self) -> u8 {
        self.type_tag() as u8
    }
}

impl PartialEq for PropertyValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for PropertyValue {}

impl PartialOrd for PropertyValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PropertyValue {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (PropertyValue::Bool(a), PropertyValue::Bool(b)) => a.cmp(b),
            (PropertyValue::Int(a), PropertyValue::Int(b)) => a.cmp(b),
            (PropertyValue::Float(a), PropertyValue::Float(b)) => a.total_cmp(b),
            (PropertyValue::String(a), PropertyValue::String(b)) => a.cmp(b),
            (a, b) => a.rank().cmp(&b.rank()),
        }
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Bool(b) => write!(f, "{}", b),
            PropertyValue::Int(i) => write!(f, "{}", i),
            PropertyValue::Float(x) => write!(f, "{}", x),
            PropertyValue::String(s) => write!(f, "\"{}\"", s),
        }
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        PropertyValue::Bool(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        PropertyValue::Int(value)
    }
}

impl From<f64> for PropertyValue {
    fn from(value: f64) -> Self {
        PropertyValue::Float(value)
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::String(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        PropertyValue::String(value)
    }
}

/// Number of dynamic blocks a string of `len` bytes needs (at least one)
pub fn blocks_needed(len: usize) -> usize {
    len.div_ceil(DYNAMIC_BLOCK_DATA).max(1)
}

/// Split string bytes into linked blocks using the given ids, in order
pub fn encode_string_blocks(value: &str, ids: &[u64]) -> Vec<(u64, DynamicRecord)> {
    let bytes = value.as_bytes();
    let chunks: Vec<&[u8]> = if bytes.is_empty() {
        vec![&[][..]]
    } else {
        bytes.chunks(DYNAMIC_BLOCK_DATA).collect()
    };
    chunks
        .iter()
        .zip(ids.iter())
        .enumerate()
        .map(|(i, (chunk, id))| {
            let next = if i + 1 < chunks.len() {
                ids.get(i + 1).copied().unwrap_or(NULL_REFERENCE)
            } else {
                NULL_REFERENCE
            };
            (*id, DynamicRecord::new_in_use(chunk, next))
        })
        .collect()
}

/// Block ids of the string starting at `first_block`
pub fn string_block_ids(strings: &RecordStore<DynamicRecord>, first_block: u64) -> Result<Vec<u64>> {
    let mut ids = Vec::new();
    let mut current = first_block;
    let limit = strings.high_id();
    while current != NULL_REFERENCE {
        if ids.len() as u64 > limit {
            return Err(Error::storage(format!(
                "cycle in string block chain starting at {}",
                first_block
            )));
        }
        let block = strings.read(current)?;
        if !block.in_use() {
            return Err(Error::storage(format!("string block {} not in use", current)));
        }
        ids.push(current);
        current = block.next_block;
    }
    Ok(ids)
}

/// Read the string starting at `first_block`
pub fn read_string(strings: &RecordStore<DynamicRecord>, first_block: u64) -> Result<String> {
    let mut bytes = Vec::new();
    for id in string_block_ids(strings, first_block)? {
        bytes.extend_from_slice(strings.read(id)?.payload());
    }
    String::from_utf8(bytes).map_err(|e| Error::storage(format!("invalid UTF-8 in string store: {}", e)))
}

/// Decode the value held by a property record
pub fn read_value(
    strings: &RecordStore<DynamicRecord>,
    value_type: u32,
    value: u64,
) -> Result<PropertyValue> {
    if value_type == TYPE_STRING {
        Ok(PropertyValue::String(read_string(strings, value)?))
    } else {
        PropertyValue::from_inline(value_type, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_ordering_across_types() {
        let mut values = vec![
            PropertyValue::from("b"),
            PropertyValue::Int(3),
            PropertyValue::Bool(true),
            PropertyValue::Float(1.5),
            PropertyValue::Int(-1),
            PropertyValue::from("a"),
        ];
        values.sort();
        assert_eq!(
            values,
            vec![
                PropertyValue::Bool(true),
                PropertyValue::Int(-1),
                PropertyValue::Int(3),
                PropertyValue::Float(1.5),
                PropertyValue::from("a"),
                PropertyValue::from("b"),
            ]
        );
    }

    #[test]
    fn test_nan_equals_itself() {
        assert_eq!(PropertyValue::Float(f64::NAN), PropertyValue::Float(f64::NAN));
        assert_ne!(PropertyValue::Int(1), PropertyValue::Float(1.0));
    }

    #[test]
    fn test_inline_decode() {
        for value in [
            PropertyValue::Bool(false),
            PropertyValue::Int(i64::MIN),
            PropertyValue::Float(-0.25),
        ] {
            let bits = value.inline_bits().unwrap();
            assert_eq!(PropertyValue::from_inline(value.type_tag(), bits).unwrap(), value);
        }
        assert!(PropertyValue::from_inline(99, 0).is_err());
    }

    #[test]
    fn test_string_blocks() {
        let dir = TempDir::new().unwrap();
        let strings: RecordStore<DynamicRecord> =
            RecordStore::open(dir.path().join("strings.store"), 1024, true).unwrap();

        let text = "a fairly long string value that spans more than one block";
        let needed = blocks_needed(text.len());
        assert_eq!(needed, 2);
        let ids: Vec<u64> = (0..needed).map(|_| strings.ids().next_id()).collect();
        for (id, block) in encode_string_blocks(text, &ids) {
            strings.write(id, &block).unwrap();
        }

        assert_eq!(read_string(&strings, ids[0]).unwrap(), text);
        assert_eq!(string_block_ids(&strings, ids[0]).unwrap(), ids);
    }

    #[test]
    fn test_empty_string_uses_one_block() {
        assert_eq!(blocks_needed(0), 1);
        let blocks = encode_string_blocks("", &[7]);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].1.len, 0);
        assert_eq!(blocks[0].1.next_block, NULL_REFERENCE);
    }
}
