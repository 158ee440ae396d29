//! Append-only segments laid out across pooled seglets.
//!
//! A segment owns a vector of seglets and an append cursor. Entries may span
//! seglet boundaries; the iterator and `read_bytes` stitch them back
//! together. The cursor is published with release stores so readers that
//! acquire-load it only ever see fully written entries.
//!
//! Counter ownership: `live_bytes` takes per-entry atomic decrements on the
//! `free` path, but bulk additions during compaction and cleaning are done
//! in one batched step while the segment is exclusively held by the cleaner
//! (COMPACTING/CLEANING states), not per relocated entry.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;

use crate::entry::{
    DecodeError, EntryType, SegmentFooter, ENTRY_HEADER_SIZE, ENTRY_TYPE_COUNT,
};
use crate::seglet::{Seglet, SegletAllocator};

/// Space held back from normal appends so the footer always fits.
pub const FOOTER_RESERVE: u32 = ENTRY_HEADER_SIZE + SegmentFooter::ENCODED_LEN as u32;

/// Opaque handle to one entry: `(segment_id << 32) | parity << 31 | offset`.
///
/// References stay valid across relocation because the cleaner retargets the
/// external registry before the old bytes disappear; the registry, not the
/// reference, is the source of truth for which handle is current.
///
/// The parity bit carries the low bit of the owning incarnation's
/// generation. In-place compaction briefly leaves two incarnations of one
/// segment id alive (the source and its survivor); the parity bit lets
/// resolution pick the incarnation a reference was actually minted against,
/// so a reference retargeted mid-pass never reads the other incarnation's
/// bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Reference(u64);

const PARITY_BIT: u32 = 1 << 31;

impl Reference {
    pub fn new(segment_id: u64, offset: u32) -> Self {
        Self::with_generation(segment_id, offset, 0)
    }

    pub(crate) fn with_generation(segment_id: u64, offset: u32, generation: u32) -> Self {
        debug_assert!(segment_id < (1 << 32), "segment id overflows reference");
        debug_assert!(offset < PARITY_BIT, "offset overflows reference");
        let low = offset | ((generation & 1) << 31);
        Self((segment_id << 32) | u64::from(low))
    }

    pub fn segment_id(self) -> u64 {
        self.0 >> 32
    }

    pub fn offset(self) -> u32 {
        (self.0 as u32) & !PARITY_BIT
    }

    pub(crate) fn generation_parity(self) -> u32 {
        ((self.0 as u32) & PARITY_BIT) >> 31
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    pub fn from_u64(raw: u64) -> Self {
        Self(raw)
    }
}

/// One append-only segment.
#[derive(Debug)]
pub struct Segment {
    id: u64,
    /// Incarnation counter: bumped each time in-place compaction replaces
    /// this segment id's seglets. Its low bit rides in every [`Reference`].
    generation: u32,
    seglet_size: u32,
    /// Size this segment occupies on a backup; fixed at creation even after
    /// trailing seglets are freed.
    disk_size: u32,
    created_at: u32,
    allocator: Arc<SegletAllocator>,
    seglets: RwLock<Vec<Seglet>>,
    head: AtomicU32,
    closed: AtomicBool,
    live_bytes: AtomicU64,
    entry_counts: [AtomicU64; ENTRY_TYPE_COUNT],
    last_compaction_at: AtomicU32,
    // Cost-benefit cache: (value, sort-pass version). See cleaner sorting.
    cost_benefit: AtomicU64,
    cost_benefit_version: AtomicU64,
}

impl Segment {
    pub fn new(
        id: u64,
        seglets: Vec<Seglet>,
        allocator: Arc<SegletAllocator>,
        created_at: u32,
    ) -> Self {
        Self::with_generation(id, seglets, allocator, created_at, 0)
    }

    pub(crate) fn with_generation(
        id: u64,
        seglets: Vec<Seglet>,
        allocator: Arc<SegletAllocator>,
        created_at: u32,
        generation: u32,
    ) -> Self {
        let seglet_size = allocator.seglet_size();
        let disk_size = seglets.len() as u32 * seglet_size;
        Self {
            id,
            generation,
            seglet_size,
            disk_size,
            created_at,
            allocator,
            seglets: RwLock::new(seglets),
            head: AtomicU32::new(0),
            closed: AtomicBool::new(false),
            live_bytes: AtomicU64::new(0),
            entry_counts: Default::default(),
            last_compaction_at: AtomicU32::new(created_at),
            cost_benefit: AtomicU64::new(0),
            cost_benefit_version: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub(crate) fn generation_parity(&self) -> u32 {
        self.generation & 1
    }

    pub fn created_at(&self) -> u32 {
        self.created_at
    }

    pub fn seglets_allocated(&self) -> u32 {
        self.seglets.read().len() as u32
    }

    /// Seglets touched by appended bytes.
    pub fn seglets_in_use(&self) -> u32 {
        self.appended_len().div_ceil(self.seglet_size)
    }

    pub fn appended_len(&self) -> u32 {
        self.head.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn capacity(&self) -> u32 {
        self.seglets.read().len() as u32 * self.seglet_size
    }

    /// Append one entry. Returns the entry's offset, or `None` when the
    /// remaining capacity (net of the footer reserve) cannot hold it.
    ///
    /// Single-writer: either the log's writer (head segment) or one cleaner
    /// worker (survivor segment) owns the append side at any time.
    pub fn append(&self, ty: EntryType, payload: &[u8]) -> Option<u32> {
        if self.is_closed() {
            return None;
        }
        let offset = self.head.load(Ordering::Relaxed);
        let total = ENTRY_HEADER_SIZE + payload.len() as u32;
        let limit = self.capacity().saturating_sub(FOOTER_RESERVE);
        if offset + total > limit {
            return None;
        }
        self.write_entry(offset, ty, payload);
        self.entry_counts[ty as usize].fetch_add(1, Ordering::Relaxed);
        self.head.store(offset + total, Ordering::Release);
        Some(offset)
    }

    fn write_entry(&self, offset: u32, ty: EntryType, payload: &[u8]) {
        let mut frame = [0u8; ENTRY_HEADER_SIZE as usize];
        frame[0] = ty as u8;
        frame[1..5].copy_from_slice(&(payload.len() as u32).to_le_bytes());
        self.write_bytes(offset, &frame);
        self.write_bytes(offset + ENTRY_HEADER_SIZE, payload);
    }

    fn write_bytes(&self, mut offset: u32, mut data: &[u8]) {
        let seglets = self.seglets.read();
        while !data.is_empty() {
            let index = (offset / self.seglet_size) as usize;
            let within = (offset % self.seglet_size) as usize;
            let room = self.seglet_size as usize - within;
            let take = room.min(data.len());
            seglets[index].write(within, &data[..take]);
            offset += take as u32;
            data = &data[take..];
        }
    }

    /// Copy `len` bytes starting at `offset` out of the seglets.
    pub fn read_bytes(&self, mut offset: u32, len: u32) -> Bytes {
        let mut out = vec![0u8; len as usize];
        let mut filled = 0usize;
        let seglets = self.seglets.read();
        while filled < out.len() {
            let index = (offset / self.seglet_size) as usize;
            let within = (offset % self.seglet_size) as usize;
            let room = self.seglet_size as usize - within;
            let take = room.min(out.len() - filled);
            seglets[index].read_into(within, &mut out[filled..filled + take]);
            offset += take as u32;
            filled += take;
        }
        Bytes::from(out)
    }

    /// Appended bytes still covered by seglets. Falls below `appended_len`
    /// only on a retired incarnation whose seglets went back to the pool.
    fn covered_len(&self) -> u32 {
        (self.seglets.read().len() as u32 * self.seglet_size).min(self.appended_len())
    }

    /// Resolve the entry at `offset`, which must have been returned by
    /// `append` on this segment (possibly via a [`Reference`]).
    pub fn get_entry(&self, offset: u32) -> Result<(EntryType, Bytes), DecodeError> {
        let covered = self.covered_len();
        if offset + ENTRY_HEADER_SIZE > covered {
            return Err(DecodeError::Truncated);
        }
        let frame = self.read_bytes(offset, ENTRY_HEADER_SIZE);
        let ty = EntryType::from_u8(frame[0])?;
        let len = u32::from_le_bytes(frame[1..5].try_into().unwrap());
        if offset + ENTRY_HEADER_SIZE + len > covered {
            return Err(DecodeError::Truncated);
        }
        Ok((ty, self.read_bytes(offset + ENTRY_HEADER_SIZE, len)))
    }

    /// Total framed length of the entry at `offset`.
    pub fn entry_total_len(&self, offset: u32) -> Result<u32, DecodeError> {
        if offset + ENTRY_HEADER_SIZE > self.covered_len() {
            return Err(DecodeError::Truncated);
        }
        let frame = self.read_bytes(offset, ENTRY_HEADER_SIZE);
        EntryType::from_u8(frame[0])?;
        let len = u32::from_le_bytes(frame[1..5].try_into().unwrap());
        Ok(ENTRY_HEADER_SIZE + len)
    }

    pub fn reference(&self, offset: u32) -> Reference {
        Reference::with_generation(self.id, offset, self.generation)
    }

    pub fn iter(&self) -> SegmentIterator<'_> {
        SegmentIterator {
            segment: self,
            offset: 0,
            limit: self.appended_len(),
            done: false,
        }
    }

    /// Close the segment: checksum everything appended so far, write the
    /// footer, and refuse all further appends.
    pub fn close(&self) -> u32 {
        assert!(!self.is_closed(), "segment {} closed twice", self.id);
        let offset = self.head.load(Ordering::Relaxed);
        let footer = SegmentFooter {
            checksum: u64::from(self.compute_checksum()),
        };
        let mut payload = Vec::with_capacity(SegmentFooter::ENCODED_LEN);
        footer.encode_into(&mut payload);
        self.write_entry(offset, EntryType::SegmentFooter, &payload);
        self.entry_counts[EntryType::SegmentFooter as usize].fetch_add(1, Ordering::Relaxed);
        self.head.store(offset + FOOTER_RESERVE, Ordering::Release);
        self.closed.store(true, Ordering::Release);
        offset + FOOTER_RESERVE
    }

    /// crc32c over all appended bytes (start of the header entry through the
    /// current cursor, i.e. the start of the footer once closed).
    pub fn compute_checksum(&self) -> u32 {
        let appended = if self.is_closed() {
            self.appended_len() - FOOTER_RESERVE
        } else {
            self.appended_len()
        };
        let mut crc = 0u32;
        let mut offset = 0u32;
        while offset < appended {
            let chunk = (appended - offset).min(self.seglet_size);
            let bytes = self.read_bytes(offset, chunk);
            crc = crc32c::crc32c_append(crc, &bytes);
            offset += chunk;
        }
        crc
    }

    /// Return the trailing `n` seglets to the allocator. Only valid on a
    /// closed segment, and only for seglets the caller knows are unused;
    /// returns false (touching nothing) if `n` exceeds the unused tail.
    pub fn free_unused_seglets(&self, n: u32) -> bool {
        if !self.is_closed() {
            return false;
        }
        let mut seglets = self.seglets.write();
        let in_use = self.appended_len().div_ceil(self.seglet_size) as usize;
        if n as usize > seglets.len() - in_use {
            return false;
        }
        let at = seglets.len() - n as usize;
        self.allocator.free_all(seglets.drain(at..));
        true
    }

    /// Drain every seglet back to the allocator. Called by the segment
    /// manager once nothing can reach this incarnation any more.
    pub(crate) fn release_seglets(&self) {
        let mut seglets = self.seglets.write();
        self.allocator.free_all(seglets.drain(..));
    }

    pub fn live_bytes(&self) -> u64 {
        self.live_bytes.load(Ordering::Relaxed)
    }

    pub fn add_live_bytes(&self, delta: u64) {
        self.live_bytes.fetch_add(delta, Ordering::Relaxed);
    }

    /// Decrement `live_bytes`. Underflow means an entry was freed twice,
    /// which corrupts cleaner accounting beyond repair.
    pub fn sub_live_bytes(&self, delta: u64) {
        let prev = self.live_bytes.fetch_sub(delta, Ordering::Relaxed);
        assert!(
            prev >= delta,
            "segment {}: live bytes underflow ({} - {}); entry freed twice?",
            self.id,
            prev,
            delta
        );
    }

    /// Entries of `ty` ever appended to this segment.
    pub fn entry_count(&self, ty: EntryType) -> u64 {
        self.entry_counts[ty as usize].load(Ordering::Relaxed)
    }

    /// Percent of allocated seglet memory holding live bytes.
    pub fn memory_utilization(&self) -> u32 {
        let allocated = u64::from(self.seglets_allocated()) * u64::from(self.seglet_size);
        if allocated == 0 {
            return 0;
        }
        (100 * self.live_bytes() / allocated) as u32
    }

    /// Percent of the on-disk segment holding live bytes.
    pub fn disk_utilization(&self) -> u32 {
        (100 * self.live_bytes() / u64::from(self.disk_size)) as u32
    }

    pub fn last_compaction_at(&self) -> u32 {
        self.last_compaction_at.load(Ordering::Relaxed)
    }

    pub fn note_compacted(&self, now: u32) {
        self.last_compaction_at.store(now, Ordering::Relaxed);
    }

    pub(crate) fn cached_cost_benefit(&self, version: u64) -> Option<u64> {
        if self.cost_benefit_version.load(Ordering::Relaxed) == version {
            Some(self.cost_benefit.load(Ordering::Relaxed))
        } else {
            None
        }
    }

    pub(crate) fn cache_cost_benefit(&self, value: u64, version: u64) {
        self.cost_benefit.store(value, Ordering::Relaxed);
        self.cost_benefit_version.store(version, Ordering::Relaxed);
    }
}

/// Yields `(type, offset, payload)` in append order, stopping at the footer
/// (the footer itself is not yielded).
pub struct SegmentIterator<'a> {
    segment: &'a Segment,
    offset: u32,
    limit: u32,
    done: bool,
}

impl Iterator for SegmentIterator<'_> {
    type Item = (EntryType, u32, Bytes);

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.offset + ENTRY_HEADER_SIZE > self.limit {
            return None;
        }
        let (ty, payload) = self
            .segment
            .get_entry(self.offset)
            .expect("segment entry corrupt during iteration");
        if ty == EntryType::SegmentFooter {
            self.done = true;
            return None;
        }
        let offset = self.offset;
        self.offset += ENTRY_HEADER_SIZE + payload.len() as u32;
        Some((ty, offset, payload))
    }
}
