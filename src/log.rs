//! Public log surface: single-writer append, O(1) free, reference reads.
//!
//! The log stores opaque OBJECT and TOMBSTONE entries in fixed-size
//! append-only segments. Callers publish returned references in their key
//! registry; the cleaner keeps those references meaningful across
//! relocation through the [`EntryHandlers`] callbacks, which are the only
//! coupling between the cleaner and external state.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::backup::BackupClient;
use crate::cleaner::metrics::CleanerMetricsSnapshot;
use crate::cleaner::LogCleaner;
use crate::entry::{EntryType, ENTRY_HEADER_SIZE};
use crate::options::LogOptions;
use crate::seglet::SegletAllocator;
use crate::segment::{Reference, FOOTER_RESERVE};
use crate::segment_manager::{Resolution, SegmentManager, HEADER_ENTRY_TOTAL};

/// Callbacks the embedding system (the key -> reference registry) provides
/// so the cleaner can decide liveness and retarget references.
///
/// Implementations must be fast, non-blocking, and must not depend on locks
/// the cleaner might hold. `is_live` must be monotonic for a given
/// reference: once an entry reports dead it may never report live again
/// (new appends produce new references).
pub trait EntryHandlers: Send + Sync {
    /// Is the entry still needed? Invoked before any relocation.
    fn is_live(&self, ty: EntryType, reference: Reference, entry: &[u8]) -> bool;

    /// The entry moved. Must atomically retarget the external registry so
    /// the entry is resolvable through `new` before any reader can fail to
    /// find it through `old`.
    fn relocated(&self, ty: EntryType, old: Reference, new: Reference, entry: &[u8]);

    /// Creation timestamp of the entry, in wall seconds. The disk cleaner
    /// sorts survivor data by it.
    fn timestamp(&self, ty: EntryType, entry: &[u8]) -> u32;
}

#[derive(Debug, thiserror::Error)]
pub enum AppendError {
    /// The entry can never fit a segment; this is permanent, not a rollover
    /// trigger.
    #[error("entry of {size} bytes exceeds the per-segment maximum of {max}")]
    EntryTooLarge { size: usize, max: u32 },

    /// Segment header and footer entries belong to the log itself.
    #[error("cannot append segment metadata entry type {0:?}")]
    MetadataType(EntryType),

    /// The backup link rejected replication during head rollover. Nothing
    /// was appended; the append may be retried once the backup recovers.
    #[error("backup rejected segment replication during head rollover")]
    Backup(#[source] anyhow::Error),
}

/// Log-wide counters surfaced next to the cleaner metrics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogMetricsSnapshot {
    pub appended_entries: u64,
    pub appended_bytes: u64,
    pub freed_entries: u64,
    pub freed_bytes: u64,
    pub head_rollovers: u64,
    pub memory_utilization: u32,
    pub segment_utilization: u32,
    pub cleaner: CleanerMetricsSnapshot,
}

struct WriterCounters {
    appended_entries: u64,
    appended_bytes: u64,
    head_rollovers: u64,
}

/// A log-structured in-memory store of `(type, payload)` entries.
pub struct Log {
    options: LogOptions,
    manager: Arc<SegmentManager>,
    cleaner: LogCleaner,
    head: Mutex<HeadState>,
    freed: Mutex<(u64, u64)>, // (entries, bytes)
    max_entry_payload: u32,
}

struct HeadState {
    segment: Arc<crate::segment::Segment>,
    counters: WriterCounters,
}

impl Log {
    /// Open a log over `backup`, with `handlers` implementing the embedding
    /// registry. Fails on invalid configuration or when the survivor
    /// reserve cannot be carved out of the configured memory.
    pub fn open(
        options: LogOptions,
        backup: Arc<dyn BackupClient>,
        handlers: Arc<dyn EntryHandlers>,
    ) -> anyhow::Result<Self> {
        use anyhow::Context;

        options.validate().context("invalid log options")?;

        let allocator = Arc::new(SegletAllocator::new(
            options.seglet_size,
            options.total_seglets(),
        ));
        let manager = Arc::new(SegmentManager::new(&options, allocator, backup.clone()));

        let reserve_segments = options.cleaner_threads * options.survivor_segments_per_thread;
        let reserve_seglets = reserve_segments * options.seglets_per_segment();
        // The reserve plus at least one head segment must fit, or the first
        // append would wait forever on memory no cleaner can ever free.
        if reserve_seglets + options.seglets_per_segment() > options.total_seglets()
            || !manager.initialize_survivor_reserve(reserve_segments)
        {
            anyhow::bail!(
                "could not reserve {reserve_segments} survivor segments out of {} bytes of log memory",
                options.memory_bytes
            );
        }

        let cleaner = LogCleaner::new(&options, manager.clone(), backup, handlers);

        let head = manager
            .alloc_head_segment()
            .context("allocate initial head segment")?;

        let max_entry_payload =
            options.segment_size - HEADER_ENTRY_TOTAL - FOOTER_RESERVE - ENTRY_HEADER_SIZE;

        Ok(Self {
            options,
            manager,
            cleaner,
            head: Mutex::new(HeadState {
                segment: head,
                counters: WriterCounters {
                    appended_entries: 0,
                    appended_bytes: 0,
                    head_rollovers: 0,
                },
            }),
            freed: Mutex::new((0, 0)),
            max_entry_payload,
        })
    }

    pub fn options(&self) -> &LogOptions {
        &self.options
    }

    pub fn segment_manager(&self) -> &Arc<SegmentManager> {
        &self.manager
    }

    /// Largest payload `append` will ever accept: a fresh segment minus its
    /// own header entry, the footer reserve, and the entry frame.
    pub fn max_entry_payload(&self) -> u32 {
        self.max_entry_payload
    }

    /// Append an OBJECT or TOMBSTONE entry and return its reference.
    ///
    /// The caller must publish the reference in its registry before
    /// surfacing the write. Rolls the head segment when the entry does not
    /// fit, blocking while no free segment is available; an entry that can
    /// never fit any segment is rejected outright, and a backup rejection
    /// during rollover surfaces as [`AppendError::Backup`] with the append
    /// left retryable.
    pub fn append(&self, ty: EntryType, payload: &[u8]) -> Result<Reference, AppendError> {
        if ty.is_segment_metadata() {
            return Err(AppendError::MetadataType(ty));
        }
        if payload.len() > self.max_entry_payload as usize {
            return Err(AppendError::EntryTooLarge {
                size: payload.len(),
                max: self.max_entry_payload,
            });
        }

        let mut head = self.head.lock();
        loop {
            if let Some(offset) = head.segment.append(ty, payload) {
                let total = ENTRY_HEADER_SIZE as u64 + payload.len() as u64;
                head.segment.add_live_bytes(total);
                head.counters.appended_entries += 1;
                head.counters.appended_bytes += total;
                return Ok(head.segment.reference(offset));
            }
            self.roll_head(&mut head).map_err(AppendError::Backup)?;
        }
    }

    fn roll_head(&self, head: &mut HeadState) -> anyhow::Result<()> {
        // A retried rollover may find the old head already closed and handed
        // to the cleaner; only the new-head allocation remains then.
        if !head.segment.is_closed() {
            self.manager.close_head_segment(&head.segment)?;
        }
        head.segment = self.manager.alloc_head_segment()?;
        head.counters.head_rollovers += 1;
        Ok(())
    }

    /// Drop the liveness hint for an appended entry: O(1), decrements the
    /// owning segment's live byte count. Every reference may be freed at
    /// most once; a double free corrupts cleaner accounting and panics.
    pub fn free(&self, reference: Reference) {
        let segment = match self.manager.resolve_minted(reference) {
            Resolution::Current(segment) => segment,
            // Compaction already dropped the entry this hint targets; its
            // accounting went with the retired incarnation.
            Resolution::Retired => return,
            Resolution::Gone => panic!(
                "free of reference into freed segment {}",
                reference.segment_id()
            ),
        };
        let total = segment
            .entry_total_len(reference.offset())
            .expect("freed reference points at a corrupt entry");
        segment.sub_live_bytes(u64::from(total));
        let mut freed = self.freed.lock();
        freed.0 += 1;
        freed.1 += u64::from(total);
    }

    /// Resolve a reference to the exact bytes appended.
    ///
    /// References fetched from the registry resolve correctly at any time;
    /// a reference cached across cleaner passes may name a segment that has
    /// since been cleaned, which is a fatal invariant violation.
    pub fn get_entry(&self, reference: Reference) -> anyhow::Result<(EntryType, Bytes)> {
        let segment = match self.manager.resolve_minted(reference) {
            Resolution::Current(segment) => segment,
            Resolution::Retired => anyhow::bail!(
                "reference into segment {} predates its compaction; re-fetch it from the registry",
                reference.segment_id()
            ),
            Resolution::Gone => panic!(
                "reference resolves to freed segment {}",
                reference.segment_id()
            ),
        };
        let (ty, bytes) = segment.get_entry(reference.offset())?;
        Ok((ty, bytes))
    }

    /// True while `id` names a segment that has not been freed. Tombstones
    /// referencing a cleaned segment are dead by this test.
    pub fn segment_exists(&self, id: u64) -> bool {
        self.manager.segment_exists(id)
    }

    /// Start the cleaner worker pool. Safe to call repeatedly, but not
    /// concurrently with `stop_cleaner`.
    pub fn start_cleaner(&self) {
        self.cleaner.start();
    }

    /// Stop and join every cleaner worker. Idempotent; ongoing relocations
    /// run to completion first.
    pub fn stop_cleaner(&self) {
        self.cleaner.stop();
    }

    /// Run one in-memory compaction pass on the calling thread. Returns
    /// true if a segment was compacted.
    pub fn compact_memory_once(&self) -> bool {
        self.cleaner.compact_memory_once()
    }

    /// Run one disk cleaning pass on the calling thread. Returns the number
    /// of segments cleaned.
    pub fn clean_disk_once(&self) -> usize {
        self.cleaner.clean_disk_once()
    }

    pub fn metrics(&self) -> LogMetricsSnapshot {
        let head = self.head.lock();
        let freed = *self.freed.lock();
        LogMetricsSnapshot {
            appended_entries: head.counters.appended_entries,
            appended_bytes: head.counters.appended_bytes,
            freed_entries: freed.0,
            freed_bytes: freed.1,
            head_rollovers: head.counters.head_rollovers,
            memory_utilization: self.manager.memory_utilization(),
            segment_utilization: self.manager.segment_utilization(),
            cleaner: self.cleaner.metrics(),
        }
    }

    /// Sum of live bytes across every tracked segment; equals appended
    /// minus freed entry bytes (segment metadata excluded).
    pub fn total_live_bytes(&self) -> u64 {
        let mut total = 0;
        let mut id = 0;
        while let Some(segment) = self.next_segment_after(id) {
            id = segment.id();
            total += segment.live_bytes();
        }
        total
    }

    fn next_segment_after(&self, id: u64) -> Option<Arc<crate::segment::Segment>> {
        self.manager.segment_after(id)
    }
}

impl Drop for Log {
    fn drop(&mut self) {
        self.cleaner.stop();
    }
}
