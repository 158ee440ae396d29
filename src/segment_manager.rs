//! Segment population and lifecycle.
//!
//! The manager owns every segment in the log and drives the state machine
//!
//! ```text
//!  OPEN -> CLOSED -> CLEANABLE -> CLEANING -> FREEABLE -> FREED
//!                       ^
//!                   COMPACTING (in-memory, returns to CLEANABLE)
//! ```
//!
//! The id -> segment table is a lock-free skip map so readers resolve
//! references without touching the manager lock; state bookkeeping sits
//! under one coarse mutex, which is fine because transitions are rare
//! relative to appends.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crossbeam_skiplist::SkipMap;
use parking_lot::Mutex;

use crate::backup::BackupClient;
use crate::entry::{EntryType, SegmentHeader, ENTRY_HEADER_SIZE};
use crate::options::LogOptions;
use crate::seglet::{ReserveGrant, SegletAllocator};
use crate::segment::{Reference, Segment};

/// Framed size of the segment header entry every segment starts with.
pub const HEADER_ENTRY_TOTAL: u32 = ENTRY_HEADER_SIZE + SegmentHeader::ENCODED_LEN as u32;

/// Current wall time in whole seconds. Entry timestamps and segment ages are
/// second-granular, as on the wire.
pub(crate) fn wall_seconds() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_secs() as u32
}

/// Outcome of resolving a reference against the segment population.
#[derive(Debug)]
pub(crate) enum Resolution {
    /// The incarnation the reference was minted against.
    Current(Arc<Segment>),
    /// The minted incarnation was replaced by in-place compaction; the
    /// registry already points at the relocated copy.
    Retired,
    /// No segment with this id exists any more.
    Gone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentState {
    Open,
    Closed,
    Cleanable,
    Compacting,
    Cleaning,
    Freeable,
}

/// Flags for [`SegmentManager::alloc_side_segment`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SideSegmentFlags {
    /// Draw seglets from the survivor reserve instead of the general pool.
    pub for_cleaning: bool,
    /// Block until seglets are available instead of returning `None`.
    pub must_not_fail: bool,
}

impl SideSegmentFlags {
    pub const FOR_CLEANING: Self = Self {
        for_cleaning: true,
        must_not_fail: false,
    };

    pub const FOR_CLEANING_MUST_NOT_FAIL: Self = Self {
        for_cleaning: true,
        must_not_fail: true,
    };
}

#[derive(Debug, Default)]
struct ManagerInner {
    states: HashMap<u64, SegmentState>,
    head_id: Option<u64>,
    /// Segments that became cleanable since the last drain. Each id enters
    /// at most once per transition, so the cleaner's candidate set stays
    /// duplicate-free.
    newly_cleanable: Vec<u64>,
}

impl ManagerInner {
    fn push_cleanable(&mut self, id: u64) {
        self.states.insert(id, SegmentState::Cleanable);
        if !self.newly_cleanable.contains(&id) {
            self.newly_cleanable.push(id);
        }
    }
}

pub struct SegmentManager {
    segment_size: u32,
    seglets_per_segment: u32,
    max_disk_segments: u32,
    allocator: Arc<SegletAllocator>,
    backup: Arc<dyn BackupClient>,
    segments: SkipMap<u64, Arc<Segment>>,
    /// Compaction survivors under construction, keyed by segment id. While
    /// a pass runs, two incarnations of one id exist; references carry a
    /// generation parity bit that selects between them (see
    /// [`Self::resolve_minted`]).
    side_table: Mutex<HashMap<u64, Arc<Segment>>>,
    inner: Mutex<ManagerInner>,
    next_id: AtomicU64,
    reserve_grant: Mutex<Option<ReserveGrant>>,
}

impl SegmentManager {
    pub fn new(
        options: &LogOptions,
        allocator: Arc<SegletAllocator>,
        backup: Arc<dyn BackupClient>,
    ) -> Self {
        Self {
            segment_size: options.segment_size,
            seglets_per_segment: options.seglets_per_segment(),
            max_disk_segments: options.max_disk_segments,
            allocator,
            backup,
            segments: SkipMap::new(),
            side_table: Mutex::new(HashMap::new()),
            inner: Mutex::new(ManagerInner::default()),
            next_id: AtomicU64::new(1),
            reserve_grant: Mutex::new(None),
        }
    }

    pub fn allocator(&self) -> &Arc<SegletAllocator> {
        &self.allocator
    }

    pub fn segment_size(&self) -> u32 {
        self.segment_size
    }

    /// Percent of seglet memory unavailable to the writer.
    pub fn memory_utilization(&self) -> u32 {
        self.allocator.utilization()
    }

    /// Percent of backup segment slots in use. Every segment that has not
    /// been freed occupies one slot (compaction reuses its slot in place).
    pub fn segment_utilization(&self) -> u32 {
        let used = self.inner.lock().states.len() as u64;
        (100 * used / u64::from(self.max_disk_segments)) as u32
    }

    /// True while `id` resolves to a live (or freeable-but-not-yet-freed)
    /// segment. Tombstone liveness is built on this.
    pub fn segment_exists(&self, id: u64) -> bool {
        self.segments.contains_key(&id)
    }

    pub fn get_segment(&self, id: u64) -> Option<Arc<Segment>> {
        self.segments.get(&id).map(|entry| entry.value().clone())
    }

    /// Resolve a reference to the incarnation it was minted against.
    ///
    /// Normally that is the table entry. During an in-place compaction,
    /// references already retargeted to the survivor carry the bumped
    /// generation parity and resolve through the side table until the swap
    /// publishes the survivor; references minted against the source keep
    /// resolving the source. A reference whose incarnation has been swapped
    /// out resolves `Retired` rather than reading the replacement's bytes
    /// at a meaningless offset.
    pub(crate) fn resolve_minted(&self, reference: Reference) -> Resolution {
        let id = reference.segment_id();
        let Some(primary) = self.get_segment(id) else {
            return Resolution::Gone;
        };
        if primary.generation_parity() == reference.generation_parity() {
            return Resolution::Current(primary);
        }
        if let Some(side) = self.side_table.lock().get(&id) {
            return Resolution::Current(side.clone());
        }
        // The swap may have landed between the two lookups above; a re-read
        // tells that apart from a genuinely retired incarnation.
        match self.get_segment(id) {
            Some(again) if again.generation_parity() == reference.generation_parity() => {
                Resolution::Current(again)
            }
            Some(_) => Resolution::Retired,
            None => Resolution::Gone,
        }
    }

    /// Smallest-id segment with id strictly greater than `id`; lets callers
    /// walk the population without holding any lock.
    pub fn segment_after(&self, id: u64) -> Option<Arc<Segment>> {
        self.segments
            .lower_bound(std::ops::Bound::Excluded(&id))
            .map(|entry| entry.value().clone())
    }

    pub fn state_of(&self, id: u64) -> Option<SegmentState> {
        self.inner.lock().states.get(&id).copied()
    }

    /// Number of segments currently tracked (any state before FREED).
    pub fn segment_count(&self) -> usize {
        self.inner.lock().states.len()
    }

    /// One-time survivor reservation, sized in whole segments. The cleaner
    /// refuses to run without it.
    pub fn initialize_survivor_reserve(&self, num_segments: u32) -> bool {
        let mut grant = self.reserve_grant.lock();
        if grant.is_some() {
            return false;
        }
        match self.allocator.reserve(num_segments * self.seglets_per_segment) {
            Some(g) => {
                *grant = Some(g);
                true
            }
            None => false,
        }
    }

    pub fn has_survivor_reserve(&self) -> bool {
        self.reserve_grant.lock().is_some()
    }

    fn new_segment(
        &self,
        id: u64,
        seglets: Vec<crate::seglet::Seglet>,
        created_at: u32,
        generation: u32,
    ) -> Arc<Segment> {
        let segment = Arc::new(Segment::with_generation(
            id,
            seglets,
            self.allocator.clone(),
            created_at,
            generation,
        ));
        let header = SegmentHeader {
            segment_id: id,
            creation_ts: created_at,
            segment_size: self.segment_size,
        };
        let mut payload = Vec::with_capacity(SegmentHeader::ENCODED_LEN);
        header.encode_into(&mut payload);
        segment
            .append(EntryType::SegmentHeader, &payload)
            .expect("segment header must fit an empty segment");
        segment
    }

    /// Allocate and install a new head segment, blocking while no segment's
    /// worth of seglets is free. The writer stalls here under memory
    /// pressure until the cleaner frees seglets.
    pub fn alloc_head_segment(&self) -> anyhow::Result<Arc<Segment>> {
        let seglets = self.allocator.alloc_many_blocking(self.seglets_per_segment);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let segment = self.new_segment(id, seglets, wall_seconds(), 0);

        // A rejected declaration must not leak the seglets: hand them back
        // so a retried rollover can allocate again.
        if let Err(err) = self
            .backup
            .open(id, &segment.read_bytes(0, segment.appended_len()))
        {
            segment.release_seglets();
            return Err(err);
        }

        let mut inner = self.inner.lock();
        debug_assert!(inner.head_id.is_none(), "two open head segments");
        inner.states.insert(id, SegmentState::Open);
        inner.head_id = Some(id);
        drop(inner);

        self.segments.insert(id, segment.clone());
        Ok(segment)
    }

    /// Close the head: write its footer, finish replicating it, and hand it
    /// to the cleaner as a candidate.
    ///
    /// The in-memory transition happens before the replica I/O, so a backup
    /// rejection leaves the segment closed and cleanable; the caller sees
    /// the error but can retry against a fresh head.
    pub fn close_head_segment(&self, segment: &Arc<Segment>) -> anyhow::Result<()> {
        let appended = segment.close();

        {
            let mut inner = self.inner.lock();
            debug_assert_eq!(inner.head_id, Some(segment.id()));
            inner.head_id = None;
            inner.push_cleanable(segment.id());
        }

        self.backup.append(
            segment.id(),
            &segment.read_bytes(HEADER_ENTRY_TOTAL, appended - HEADER_ENTRY_TOTAL),
        )?;
        self.backup.close(segment.id())
    }

    /// Drain segments that became cleanable since the last call into the
    /// cleaner's candidate vector. A segment is delivered exactly once per
    /// transition into CLEANABLE.
    pub fn cleanable_segments(&self, out: &mut Vec<Arc<Segment>>) {
        let ids: Vec<u64> = {
            let mut inner = self.inner.lock();
            std::mem::take(&mut inner.newly_cleanable)
        };
        for id in ids {
            if let Some(segment) = self.get_segment(id) {
                out.push(segment);
            }
        }
    }

    /// Allocate a survivor segment for the cleaner.
    ///
    /// `replacing` selects in-place compaction: the survivor inherits the
    /// source's id and creation timestamp and performs no backup I/O (the
    /// disk replica is untouched by in-memory compaction). Fresh-id
    /// survivors are declared to the backup and installed in the segment
    /// table immediately so relocated references resolve from the first
    /// `relocated` callback onward.
    pub fn alloc_side_segment(
        &self,
        flags: SideSegmentFlags,
        replacing: Option<&Segment>,
    ) -> Option<Arc<Segment>> {
        let seglets = if flags.for_cleaning {
            let grant = self.reserve_grant.lock();
            let grant = grant.as_ref()?;
            if flags.must_not_fail {
                self.allocator
                    .alloc_reserved_blocking(self.seglets_per_segment, grant)
            } else {
                self.allocator.alloc_reserved(self.seglets_per_segment, grant)?
            }
        } else if flags.must_not_fail {
            self.allocator.alloc_many_blocking(self.seglets_per_segment)
        } else {
            self.allocator.alloc_many(self.seglets_per_segment)?
        };

        let segment = match replacing {
            Some(source) => {
                let survivor = self.new_segment(
                    source.id(),
                    seglets,
                    source.created_at(),
                    source.generation() + 1,
                );
                // Resolvable through the side table from the first
                // relocated reference onward.
                self.side_table
                    .lock()
                    .insert(survivor.id(), survivor.clone());
                survivor
            }
            None => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let segment = self.new_segment(id, seglets, wall_seconds(), 0);
                self.backup
                    .open(id, &segment.read_bytes(0, segment.appended_len()))
                    .expect("backup rejected survivor segment open");
                self.inner.lock().states.insert(id, SegmentState::Cleaning);
                self.segments.insert(id, segment.clone());
                segment
            }
        };
        Some(segment)
    }

    /// Note that the cleaner selected `id` for in-memory compaction.
    pub fn note_compacting(&self, id: u64) {
        self.inner.lock().states.insert(id, SegmentState::Compacting);
    }

    /// Note that the cleaner committed `id` to a disk cleaning pass.
    pub fn note_cleaning(&self, id: u64) {
        self.inner.lock().states.insert(id, SegmentState::Cleaning);
    }

    /// Atomically swap a compacted segment for its survivor (same id). The
    /// registry was retargeted entry by entry before this point, so the
    /// table swap is the only remaining step; the old incarnation's seglets
    /// go back to the allocator.
    pub fn compaction_complete(&self, old: &Arc<Segment>, new: Arc<Segment>) {
        debug_assert_eq!(old.id(), new.id());
        new.note_compacted(wall_seconds());

        // Publish the survivor before retiring its side-table entry, so
        // every parity resolves to it throughout the swap.
        self.segments.insert(new.id(), new.clone());
        self.side_table.lock().remove(&new.id());
        old.release_seglets();

        self.inner.lock().push_cleanable(new.id());
    }

    /// Retire a disk cleaning pass: survivors join the candidate population,
    /// cleaned segments become freeable and are then freed. The caller has
    /// already synced every survivor, so the cleaned segments' backups may
    /// be told to forget.
    pub fn cleaning_complete(&self, cleaned: &[Arc<Segment>], survivors: &[Arc<Segment>]) {
        {
            let mut inner = self.inner.lock();
            for survivor in survivors {
                inner.push_cleanable(survivor.id());
            }
            for segment in cleaned {
                inner.states.insert(segment.id(), SegmentState::Freeable);
            }
        }

        for segment in cleaned {
            self.free_segment(segment);
        }
    }

    /// FREEABLE -> FREED: drop the segment from the table, return its
    /// seglets, and let the backup discard its replica.
    fn free_segment(&self, segment: &Arc<Segment>) {
        self.segments.remove(&segment.id());
        segment.release_seglets();
        self.inner.lock().states.remove(&segment.id());
        if let Err(err) = self.backup.free(segment.id()) {
            log::warn!("backup refused to free segment {}: {err:#}", segment.id());
        }
    }

    /// Finish replicating a cleaner survivor and signal end of appends.
    /// Called by the cleaner as each survivor closes so backup writes
    /// overlap with filling the next survivor.
    pub fn replicate_survivor_close(&self, survivor: &Segment) -> anyhow::Result<()> {
        let appended = survivor.appended_len();
        self.backup.append(
            survivor.id(),
            &survivor.read_bytes(HEADER_ENTRY_TOTAL, appended - HEADER_ENTRY_TOTAL),
        )?;
        self.backup.close(survivor.id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::{BackupEvent, InMemoryBackup};

    fn small_options() -> LogOptions {
        LogOptions {
            memory_bytes: 16 * 1024,
            segment_size: 2 * 1024,
            seglet_size: 512,
            max_disk_segments: 16,
            ..Default::default()
        }
    }

    fn manager() -> (Arc<SegmentManager>, Arc<InMemoryBackup>) {
        let options = small_options();
        let allocator = Arc::new(SegletAllocator::new(
            options.seglet_size,
            options.total_seglets(),
        ));
        let backup = Arc::new(InMemoryBackup::new());
        (
            Arc::new(SegmentManager::new(&options, allocator, backup.clone())),
            backup,
        )
    }

    #[test]
    fn head_lifecycle_reaches_cleanable() {
        let (manager, backup) = manager();
        let head = manager.alloc_head_segment().unwrap();
        assert_eq!(manager.state_of(head.id()), Some(SegmentState::Open));
        assert!(manager.segment_exists(head.id()));

        head.append(EntryType::Object, b"payload").unwrap();
        manager.close_head_segment(&head).unwrap();
        assert_eq!(manager.state_of(head.id()), Some(SegmentState::Cleanable));

        let mut candidates = Vec::new();
        manager.cleanable_segments(&mut candidates);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].id(), head.id());

        // Drained once; a second drain yields nothing.
        let mut again = Vec::new();
        manager.cleanable_segments(&mut again);
        assert!(again.is_empty());

        // Backup saw the whole closed segment.
        let bytes = backup.segment_bytes(head.id()).unwrap();
        assert_eq!(bytes.len() as u32, head.appended_len());
    }

    #[test]
    fn side_segments_need_reserve() {
        let (manager, _backup) = manager();
        assert!(manager
            .alloc_side_segment(SideSegmentFlags::FOR_CLEANING, None)
            .is_none());

        assert!(manager.initialize_survivor_reserve(2));
        assert!(!manager.initialize_survivor_reserve(1));

        let survivor = manager
            .alloc_side_segment(SideSegmentFlags::FOR_CLEANING, None)
            .expect("survivor from reserve");
        assert!(manager.segment_exists(survivor.id()));
        assert_eq!(manager.state_of(survivor.id()), Some(SegmentState::Cleaning));
    }

    #[test]
    fn compaction_survivor_keeps_identity() {
        let (manager, _backup) = manager();
        assert!(manager.initialize_survivor_reserve(2));
        let head = manager.alloc_head_segment().unwrap();
        head.append(EntryType::Object, b"x").unwrap();
        manager.close_head_segment(&head).unwrap();

        let survivor = manager
            .alloc_side_segment(SideSegmentFlags::FOR_CLEANING_MUST_NOT_FAIL, Some(&*head))
            .unwrap();
        assert_eq!(survivor.id(), head.id());
        assert_eq!(survivor.created_at(), head.created_at());

        survivor.close();
        manager.compaction_complete(&head, survivor.clone());
        assert_eq!(manager.state_of(head.id()), Some(SegmentState::Cleanable));
        assert!(Arc::ptr_eq(
            &manager.get_segment(head.id()).unwrap(),
            &survivor
        ));
        assert_eq!(head.seglets_allocated(), 0);
    }

    #[test]
    fn cleaning_complete_frees_and_forgets() {
        let (manager, backup) = manager();
        assert!(manager.initialize_survivor_reserve(2));
        let head = manager.alloc_head_segment().unwrap();
        manager.close_head_segment(&head).unwrap();

        let survivor = manager
            .alloc_side_segment(SideSegmentFlags::FOR_CLEANING_MUST_NOT_FAIL, None)
            .unwrap();
        survivor.close();
        manager.replicate_survivor_close(&survivor).unwrap();

        let before = manager.segment_utilization();
        manager.cleaning_complete(&[head.clone()], &[survivor.clone()]);

        assert!(!manager.segment_exists(head.id()));
        assert!(manager.segment_exists(survivor.id()));
        assert!(manager.segment_utilization() <= before);
        assert!(backup.is_freed(head.id()));
        assert_eq!(
            manager.state_of(survivor.id()),
            Some(SegmentState::Cleanable)
        );

        // The cleaned head was still queued as newly cleanable but has been
        // freed since; the drain silently skips it and delivers the
        // survivor only.
        let mut candidates = Vec::new();
        manager.cleanable_segments(&mut candidates);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].id(), survivor.id());
    }

    #[test]
    fn backup_sees_open_then_append_then_close() {
        let (manager, backup) = manager();
        let head = manager.alloc_head_segment().unwrap();
        head.append(EntryType::Object, b"abc").unwrap();
        manager.close_head_segment(&head).unwrap();

        let events = backup.events();
        assert_eq!(events[0], BackupEvent::Open(head.id()));
        assert!(matches!(events[1], BackupEvent::Append(_, _)));
        assert_eq!(events[2], BackupEvent::Close(head.id()));
    }
}
