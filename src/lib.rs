//! `ramlog` is a log-structured in-memory key-value storage engine.
//!
//! Records are addressed by a 64-bit table id plus a binary string key and
//! stored as append-only entries in fixed-size segments, which are carved
//! from a pooled set of seglets and replicated to an external backup as
//! they close. The crate is intentionally opinionated about correctness
//! first:
//! - Appends are single-writer; readers resolve opaque references without
//!   blocking on the cleaner.
//! - Deletes are tombstones, live until the segment they reference has been
//!   cleaned off disk.
//! - A two-level cleaner (in-memory compaction + on-disk cleaning) bounds
//!   memory and disk utilization; compaction targets are chosen so the disk
//!   cleaner always keeps making forward progress.
//! - Survivor segments are durable on backups before any cleaned replica is
//!   forgotten.

mod backup;
mod cleaner;
mod entry;
mod key;
mod log;
mod options;
mod registry;
mod seglet;
mod segment;
mod segment_manager;

pub use backup::{BackupClient, BackupEvent, InMemoryBackup, NullBackup};
pub use cleaner::metrics::{
    CleanerMetricsSnapshot, InMemoryMetricsSnapshot, OnDiskMetricsSnapshot, ScanCountersSnapshot,
};
pub use entry::{
    DecodeError, EntryType, Object, SegmentFooter, SegmentHeader, Tombstone, ENTRY_HEADER_SIZE,
    ENTRY_TYPE_COUNT,
};
pub use key::{key_hash, Key};
pub use crate::log::{AppendError, EntryHandlers, Log, LogMetricsSnapshot};
pub use options::{CleanerTuning, LogOptions};
pub use registry::HashRegistry;
pub use seglet::{Seglet, SegletAllocator};
pub use segment::{Reference, Segment, SegmentIterator};
pub use segment_manager::{SegmentManager, SegmentState, SideSegmentFlags};
