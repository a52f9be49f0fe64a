//! Index layer
//!
//! - Label scan store: label id → node ids (roaring treemaps, persisted)
//! - Schema indexes: (label, key) → value → node ids, in memory
//! - [`WorkSync`]: coalesces updates from concurrent committers into single
//!   writer calls

pub mod indexing;
pub mod label_scan;
pub mod work_sync;

pub use indexing::{
    IndexActivator, IndexState, IndexUpdate, IndexUpdateWork, IndexingService, PropertyIndex,
};
pub use label_scan::{LABEL_SCAN_STORE, LabelScanStore, LabelUpdateWork, NodeLabelUpdate};
pub use work_sync::{Work, WorkSync};
