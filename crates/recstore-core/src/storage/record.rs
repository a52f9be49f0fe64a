//! Fixed-size record layouts
//!
//! - `NodeRecord`: 32 bytes (next_rel: 8, next_prop: 8, label_bits: 8, flags: 4, padding: 4)
//! - `RelationshipRecord`: 64 bytes (first_node, second_node, first_prev, first_next,
//!   second_prev, second_next, next_prop: 8 each, type_id: 4, flags: 4)
//! - `PropertyRecord`: 40 bytes (key_id: 4, value_type: 4, value: 8, next_prop: 8,
//!   prev_prop: 8, flags: 4, padding: 4)
//! - `DynamicRecord`: 48 bytes (flags: 4, len: 4, next_block: 8, data: 32)
//!
//! A relationship sits in two doubly-linked chains, one per endpoint. For a
//! self-loop both chains are the same chain and the `second_*` pointers mirror
//! the `first_*` pointers.

use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// Pointer value meaning "no record"
pub const NULL_REFERENCE: u64 = u64::MAX;

/// Number of labels that fit in a node's inline label bitmap
pub const MAX_INLINE_LABELS: u32 = 64;

const IN_USE: u32 = 0x01;

/// Common behaviour of fixed-size store records
pub trait Record: Pod + Default + PartialEq + Debug + Send + Sync + 'static {
    /// Size of the record on disk
    const SIZE: usize;
    /// Human readable record kind used in errors and logs
    const KIND: &'static str;

    /// Whether the record slot is occupied
    fn in_use(&self) -> bool;

    /// Mark the record slot occupied or free
    fn set_in_use(&mut self, in_use: bool);
}

/// Node record in nodes.store
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable, Serialize, Deserialize)]
pub struct NodeRecord {
    /// Head of the relationship chain
    pub next_rel: u64,
    /// Head of the property chain
    pub next_prop: u64,
    /// Bitmap of label ids (up to 64 labels)
    pub label_bits: u64,
    /// Flags (bit 0: in use)
    pub flags: u32,
    #[serde(skip)]
    _padding: u32,
}

impl Default for NodeRecord {
    fn default() -> Self {
        Self {
            next_rel: NULL_REFERENCE,
            next_prop: NULL_REFERENCE,
            label_bits: 0,
            flags: 0,
            _padding: 0,
        }
    }
}

impl NodeRecord {
    /// A fresh, in-use node with no relationships, properties or labels
    pub fn new_in_use() -> Self {
        Self {
            flags: IN_USE,
            ..Self::default()
        }
    }

    /// Check if node has a specific label
    pub fn has_label(&self, label_id: u32) -> bool {
        label_id < MAX_INLINE_LABELS && (self.label_bits & (1u64 << label_id)) != 0
    }

    /// Add a label to the node
    pub fn add_label(&mut self, label_id: u32) {
        if label_id < MAX_INLINE_LABELS {
            self.label_bits |= 1u64 << label_id;
        }
    }

    /// Remove a label from the node
    pub fn remove_label(&mut self, label_id: u32) {
        if label_id < MAX_INLINE_LABELS {
            self.label_bits &= !(1u64 << label_id);
        }
    }

    /// Label ids in ascending order
    pub fn labels(&self) -> Vec<u32> {
        (0..MAX_INLINE_LABELS).filter(|l| self.has_label(*l)).collect()
    }
}

impl Record for NodeRecord {
    const SIZE: usize = 32;
    const KIND: &'static str = "node";

    fn in_use(&self) -> bool {
        self.flags & IN_USE != 0
    }

    fn set_in_use(&mut self, in_use: bool) {
        if in_use {
            self.flags |= IN_USE;
        } else {
            self.flags &= !IN_USE;
        }
    }
}

/// Relationship record in rels.store
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable, Serialize, Deserialize)]
pub struct RelationshipRecord {
    /// Start node
    pub first_node: u64,
    /// End node
    pub second_node: u64,
    /// Previous relationship in the start node's chain
    pub first_prev: u64,
    /// Next relationship in the start node's chain
    pub first_next: u64,
    /// Previous relationship in the end node's chain
    pub second_prev: u64,
    /// Next relationship in the end node's chain
    pub second_next: u64,
    /// Head of the property chain
    pub next_prop: u64,
    /// Relationship type id
    pub type_id: u32,
    /// Flags (bit 0: in use)
    pub flags: u32,
}

impl Default for RelationshipRecord {
    fn default() -> Self {
        Self {
            first_node: NULL_REFERENCE,
            second_node: NULL_REFERENCE,
            first_prev: NULL_REFERENCE,
            first_next: NULL_REFERENCE,
            second_prev: NULL_REFERENCE,
            second_next: NULL_REFERENCE,
            next_prop: NULL_REFERENCE,
            type_id: 0,
            flags: 0,
        }
    }
}

impl RelationshipRecord {
    /// A fresh, in-use relationship with unlinked chain pointers
    pub fn new_in_use(first_node: u64, second_node: u64, type_id: u32) -> Self {
        Self {
            first_node,
            second_node,
            type_id,
            flags: IN_USE,
            ..Self::default()
        }
    }

    /// Whether start and end node are the same
    pub fn is_loop(&self) -> bool {
        self.first_node == self.second_node
    }

    /// Previous pointer in `node`'s chain
    pub fn prev_for(&self, node: u64) -> u64 {
        if self.first_node == node {
            self.first_prev
        } else {
            self.second_prev
        }
    }

    /// Next pointer in `node`'s chain
    pub fn next_for(&self, node: u64) -> u64 {
        if self.first_node == node {
            self.first_next
        } else {
            self.second_next
        }
    }

    /// Set the previous pointer in `node`'s chain (both sides for a loop)
    pub fn set_prev_for(&mut self, node: u64, prev: u64) {
        if self.first_node == node {
            self.first_prev = prev;
        }
        if self.second_node == node {
            self.second_prev = prev;
        }
    }

    /// Set the next pointer in `node`'s chain (both sides for a loop)
    pub fn set_next_for(&mut self, node: u64, next: u64) {
        if self.first_node == node {
            self.first_next = next;
        }
        if self.second_node == node {
            self.second_next = next;
        }
    }

    /// The endpoint that is not `node`; `node` itself for a loop
    pub fn other_node(&self, node: u64) -> u64 {
        if self.first_node == node {
            self.second_node
        } else {
            self.first_node
        }
    }

    /// Whether `node` is one of the endpoints
    pub fn touches(&self, node: u64) -> bool {
        self.first_node == node || self.second_node == node
    }
}

impl Record for RelationshipRecord {
    const SIZE: usize = 64;
    const KIND: &'static str = "relationship";

    fn in_use(&self) -> bool {
        self.flags & IN_USE != 0
    }

    fn set_in_use(&mut self, in_use: bool) {
        if in_use {
            self.flags |= IN_USE;
        } else {
            self.flags &= !IN_USE;
        }
    }
}

/// Property record in props.store; one key/value per record, chained per owner
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable, Serialize, Deserialize)]
pub struct PropertyRecord {
    /// Property key token id
    pub key_id: u32,
    /// Value type tag (see `PropertyValue`)
    pub value_type: u32,
    /// Inline value, or first dynamic block id for strings
    pub value: u64,
    /// Next property of the same owner
    pub next_prop: u64,
    /// Previous property of the same owner
    pub prev_prop: u64,
    /// Flags (bit 0: in use)
    pub flags: u32,
    #[serde(skip)]
    _padding: u32,
}

impl Default for PropertyRecord {
    fn default() -> Self {
        Self {
            key_id: 0,
            value_type: 0,
            value: 0,
            next_prop: NULL_REFERENCE,
            prev_prop: NULL_REFERENCE,
            flags: 0,
            _padding: 0,
        }
    }
}

impl PropertyRecord {
    /// A fresh, in-use property record
    pub fn new_in_use(key_id: u32, value_type: u32, value: u64) -> Self {
        Self {
            key_id,
            value_type,
            value,
            flags: IN_USE,
            ..Self::default()
        }
    }
}

impl Record for PropertyRecord {
    const SIZE: usize = 40;
    const KIND: &'static str = "property";

    fn in_use(&self) -> bool {
        self.flags & IN_USE != 0
    }

    fn set_in_use(&mut self, in_use: bool) {
        if in_use {
            self.flags |= IN_USE;
        } else {
            self.flags &= !IN_USE;
        }
    }
}

/// Payload bytes carried by one dynamic block
pub const DYNAMIC_BLOCK_DATA: usize = 32;

/// Block of a string value in strings.store
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable, Serialize, Deserialize)]
pub struct DynamicRecord {
    /// Flags (bit 0: in use)
    pub flags: u32,
    /// Bytes of `data` used
    pub len: u32,
    /// Next block of the same value
    pub next_block: u64,
    /// Payload
    pub data: [u8; DYNAMIC_BLOCK_DATA],
}

impl Default for DynamicRecord {
    fn default() -> Self {
        Self {
            flags: 0,
            len: 0,
            next_block: NULL_REFERENCE,
            data: [0; DYNAMIC_BLOCK_DATA],
        }
    }
}

impl DynamicRecord {
    /// An in-use block holding `chunk` (at most `DYNAMIC_BLOCK_DATA` bytes)
    pub fn new_in_use(chunk: &[u8], next_block: u64) -> Self {
        let mut data = [0u8; DYNAMIC_BLOCK_DATA];
        let len = chunk.len().min(DYNAMIC_BLOCK_DATA);
        data[..len].copy_from_slice(&chunk[..len]);
        Self {
            flags: IN_USE,
            len: len as u32,
            next_block,
            data,
        }
    }

    /// Used payload bytes
    pub fn payload(&self) -> &[u8] {
        let len = (self.len as usize).min(DYNAMIC_BLOCK_DATA);
        &self.data[..len]
    }
}

impl Record for DynamicRecord {
    const SIZE: usize = 48;
    const KIND: &'static str = "dynamic";

    fn in_use(&self) -> bool {
        self.flags & IN_USE != 0
    }

    fn set_in_use(&mut self, in_use: bool) {
        if in_use {
            self.flags |= IN_USE;
        } else {
            self.flags &= !IN_USE;
        }
    }
}
