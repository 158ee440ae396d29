//! Two-level log cleaner.
//!
//! Level one (in-memory compaction) rewrites a single segment's live
//! entries into a survivor with the same identity, shrinking its seglet
//! footprint without touching its disk replica. Level two (disk cleaning)
//! rewrites many segments' live entries into fresh survivor segments,
//! freeing whole backup replicas.
//!
//! Worker 0 owns disk cleaning whenever disk pressure (or a writer losing
//! the memory race) demands it; every worker compacts, with staggered
//! memory thresholds so helpers are recruited by pressure rather than all
//! at once.

pub mod metrics;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use rand::Rng;

use crate::backup::BackupClient;
use crate::entry::{EntryType, ENTRY_HEADER_SIZE, ENTRY_TYPE_COUNT};
use crate::log::EntryHandlers;
use crate::options::{CleanerTuning, LogOptions};
use crate::segment::{Reference, Segment, FOOTER_RESERVE};
use crate::segment_manager::{
    wall_seconds, SegmentManager, SideSegmentFlags, HEADER_ENTRY_TOTAL,
};
use metrics::{CleanerMetrics, CleanerMetricsSnapshot, PhaseTimer};

/// What a worker does with its cleaning time, fixed at spawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CleanerRole {
    /// Worker 0: disk cleaning under disk pressure, compaction otherwise.
    Disk,
    /// Workers >= 1: compaction only, once memory utilization reaches
    /// `min(99, 90 + 2 * tier)`.
    MemoryTier(u32),
}

impl CleanerRole {
    fn compaction_threshold(self) -> u32 {
        match self {
            CleanerRole::Disk => 0,
            CleanerRole::MemoryTier(tier) => (90 + 2 * tier).min(99),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RelocStatus {
    Relocated,
    NotNeeded,
    Failed,
}

pub(crate) struct LogCleaner {
    shared: Arc<CleanerShared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

struct CleanerShared {
    manager: Arc<SegmentManager>,
    backup: Arc<dyn BackupClient>,
    handlers: Arc<dyn EntryHandlers>,
    tuning: CleanerTuning,
    seglet_size: u32,
    segment_size: u32,
    num_threads: u32,
    disable_in_memory: bool,
    /// Live bytes one disk pass may move. Capped so a pass never needs more
    /// survivor segments than the reserve holds; otherwise a pass could
    /// block waiting for seglets only its own completion would free.
    disk_pass_live_budget: u64,
    candidates: Mutex<Vec<Arc<Segment>>>,
    threads_should_exit: AtomicBool,
    /// Version token for the cost-benefit cache; bumped once per sort so
    /// the comparator stays strictly weakly ordered while segment
    /// statistics keep moving underneath it.
    sort_version: AtomicU64,
    metrics: CleanerMetrics,
}

impl LogCleaner {
    pub fn new(
        options: &LogOptions,
        manager: Arc<SegmentManager>,
        backup: Arc<dyn BackupClient>,
        handlers: Arc<dyn EntryHandlers>,
    ) -> Self {
        assert!(
            manager.has_survivor_reserve(),
            "cleaner constructed without a survivor reserve"
        );
        let disable_in_memory =
            options.disable_in_memory_cleaning || options.write_cost_threshold == 0;
        let reserve_segments = options.cleaner_threads * options.survivor_segments_per_thread;
        let survivor_usable =
            u64::from(options.segment_size - HEADER_ENTRY_TOTAL - FOOTER_RESERVE);
        let disk_pass_live_budget = u64::from(
            options
                .cleaner
                .max_live_segments_per_disk_pass
                .min(reserve_segments),
        ) * survivor_usable;
        Self {
            shared: Arc::new(CleanerShared {
                manager,
                backup,
                handlers,
                tuning: options.cleaner.clone(),
                seglet_size: options.seglet_size,
                segment_size: options.segment_size,
                num_threads: options.cleaner_threads,
                disable_in_memory,
                disk_pass_live_budget,
                candidates: Mutex::new(Vec::new()),
                threads_should_exit: AtomicBool::new(false),
                sort_version: AtomicU64::new(0),
                metrics: CleanerMetrics::new(options.cleaner_threads as usize),
            }),
            threads: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the worker pool if it is not already running. Not safe to call
    /// concurrently with `stop` on the same cleaner.
    pub fn start(&self) {
        let mut threads = self.threads.lock();
        if !threads.is_empty() {
            return;
        }
        self.shared.threads_should_exit.store(false, Ordering::SeqCst);
        for index in 0..self.shared.num_threads {
            let role = if index == 0 {
                CleanerRole::Disk
            } else {
                CleanerRole::MemoryTier(index)
            };
            let shared = self.shared.clone();
            let handle = std::thread::Builder::new()
                .name(format!("ramlog-cleaner-{index}"))
                .spawn(move || shared.thread_main(index as usize, role))
                .expect("spawn cleaner thread");
            threads.push(handle);
        }
    }

    /// Signal every worker and join it. Idempotent; in-flight relocations
    /// finish before their thread exits (abandoning one mid-way would
    /// corrupt references).
    pub fn stop(&self) {
        let mut threads = self.threads.lock();
        self.shared.threads_should_exit.store(true, Ordering::SeqCst);
        for handle in threads.drain(..) {
            handle.join().expect("cleaner thread panicked");
        }
        self.shared.threads_should_exit.store(false, Ordering::SeqCst);
    }

    /// One synchronous compaction pass; used by embedders that schedule
    /// cleaning themselves and by tests.
    pub fn compact_memory_once(&self) -> bool {
        self.shared.refresh_candidates();
        self.shared.do_memory_cleaning()
    }

    /// One synchronous disk pass; returns segments cleaned.
    pub fn clean_disk_once(&self) -> usize {
        self.shared.refresh_candidates();
        self.shared.do_disk_cleaning(false)
    }

    pub fn metrics(&self) -> CleanerMetricsSnapshot {
        self.shared.metrics.snapshot()
    }
}

impl CleanerShared {
    fn thread_main(self: Arc<Self>, index: usize, role: CleanerRole) {
        log::info!("cleaner thread {index} started with role {role:?}");
        loop {
            if self.threads_should_exit.load(Ordering::Acquire) {
                break;
            }
            self.do_work(index, role);
        }
        log::info!("cleaner thread {index} stopping");
    }

    fn refresh_candidates(&self) {
        let mut candidates = self.candidates.lock();
        self.manager.cleanable_segments(&mut candidates);
    }

    fn do_work(&self, index: usize, role: CleanerRole) {
        let _total = PhaseTimer::new(&self.metrics.do_work_nanos);

        // Refresh whether we clean or not; deferring this only delays work
        // until pressure is already high.
        self.refresh_candidates();

        let mem_util = self.manager.memory_utilization();
        let disk_util = self.manager.segment_utilization();
        let low_on_memory = mem_util >= self.tuning.min_memory_utilization;
        let not_keeping_up = mem_util >= self.tuning.memory_depleted_utilization;
        let low_on_disk = disk_util >= self.tuning.min_disk_utilization;
        let mut have_work = low_on_memory || low_on_disk;

        if have_work {
            let _active = PhaseTimer::new(&self.metrics.thread_active_nanos[index]);
            // Sleep when a pass made no progress (e.g. the candidate set is
            // empty under pressure), not merely when thresholds are quiet.
            match role {
                CleanerRole::Disk => {
                    if low_on_disk || not_keeping_up {
                        have_work = self.do_disk_cleaning(low_on_disk) > 0;
                    } else {
                        have_work = self.do_memory_cleaning();
                    }
                }
                CleanerRole::MemoryTier(_) => {
                    have_work =
                        mem_util >= role.compaction_threshold() && self.do_memory_cleaning();
                }
            }
        }

        if !have_work {
            let _sleep = PhaseTimer::new(&self.metrics.do_work_sleep_nanos);
            // Jitter the poll a little so idle workers do not caravan and
            // make the candidates lock look contended.
            let poll_us = self.tuning.poll_interval.as_micros() as u64;
            let jitter_us = rand::thread_rng().gen_range(0..=poll_us / 10);
            std::thread::sleep(Duration::from_micros(poll_us + jitter_us));
        }
    }

    /// In-memory compaction: rewrite one segment's live entries into a
    /// survivor with the same id, then swap it in place.
    fn do_memory_cleaning(&self) -> bool {
        let _total = PhaseTimer::new(&self.metrics.in_memory.total_nanos);

        if self.disable_in_memory {
            return false;
        }

        let Some((segment, freeable_seglets)) = self.get_segment_to_compact() else {
            return false;
        };
        self.manager.note_compacting(segment.id());

        let wait = PhaseTimer::new(&self.metrics.in_memory.wait_for_survivor_nanos);
        let survivor = self
            .manager
            .alloc_side_segment(
                SideSegmentFlags::FOR_CLEANING_MUST_NOT_FAIL,
                Some(&*segment),
            )
            .expect("MUST_NOT_FAIL survivor allocation returned none");
        wait.stop();

        // Credit the survivor with the source's live bytes up front and
        // correct downward in one batched step at the end. Writers may free
        // relocated entries (decrementing the survivor) the moment the
        // registry is retargeted, and the counter must never read less than
        // those decrements in between.
        let survivor_credit = segment.live_bytes();
        survivor.add_live_bytes(survivor_credit);

        self.metrics.in_memory.total_bytes_in_compacted_segments.fetch_add(
            u64::from(segment.seglets_allocated()) * u64::from(self.seglet_size),
            Ordering::Relaxed,
        );

        let mut scanned = [0u64; ENTRY_TYPE_COUNT];
        let mut live_scanned = [0u64; ENTRY_TYPE_COUNT];
        let mut scanned_lengths = [0u64; ENTRY_TYPE_COUNT];
        let mut live_lengths = [0u64; ENTRY_TYPE_COUNT];
        let mut bytes_appended = 0u64;

        for (ty, offset, payload) in segment.iter() {
            let reference = segment.reference(offset);
            let status =
                self.relocate_entry(ty, &payload, reference, Some(&*survivor), &mut bytes_appended);
            if status == RelocStatus::Failed {
                // The survivor is freshly allocated and sized to hold the
                // source's live data by construction.
                panic!(
                    "live entry from segment {} did not fit its compaction survivor",
                    segment.id()
                );
            }
            let total = u64::from(ENTRY_HEADER_SIZE) + payload.len() as u64;
            scanned[ty as usize] += 1;
            scanned_lengths[ty as usize] += total;
            if status == RelocStatus::Relocated {
                live_scanned[ty as usize] += 1;
                live_lengths[ty as usize] += total;
            }
        }

        // The batched correction: one update instead of a per-entry atomic
        // pair. Entries can only go dead, so the credit never undershoots.
        survivor.sub_live_bytes(survivor_credit - bytes_appended);

        let scans = &self.metrics.in_memory.scans;
        scans.entries_scanned.add_all(&scanned);
        scans.live_entries_scanned.add_all(&live_scanned);
        scans.scanned_entry_lengths.add_all(&scanned_lengths);
        scans.live_scanned_entry_lengths.add_all(&live_lengths);

        // The survivor was allocated at full size, so freeing the
        // difference yields net-zero memory change, plus whatever
        // getSegmentToCompact calculated as safely freeable.
        let seglets_to_free =
            survivor.seglets_allocated() - segment.seglets_allocated() + freeable_seglets;
        survivor.close();
        assert!(
            survivor.free_unused_seglets(seglets_to_free),
            "compaction survivor for segment {} retained fewer seglets than promised",
            segment.id()
        );

        let bytes_freed = u64::from(freeable_seglets) * u64::from(self.seglet_size);
        self.metrics
            .in_memory
            .total_bytes_freed
            .fetch_add(bytes_freed, Ordering::Relaxed);
        self.metrics
            .in_memory
            .total_bytes_appended_to_survivors
            .fetch_add(u64::from(survivor.appended_len()), Ordering::Relaxed);
        self.metrics
            .in_memory
            .total_segments_compacted
            .fetch_add(1, Ordering::Relaxed);

        log::debug!(
            "compacted segment {}: freed {} seglets ({} bytes)",
            segment.id(),
            freeable_seglets,
            bytes_freed
        );

        let _complete = PhaseTimer::new(&self.metrics.in_memory.compaction_complete_nanos);
        self.manager.compaction_complete(&segment, survivor);
        true
    }

    /// Pick the best compaction candidate and how many seglets may safely
    /// be freed from it.
    ///
    /// The primary pass greedily maximizes freeable seglets while keeping
    /// the compacted result under the maximum cleanable utilization, which
    /// guarantees the disk cleaner can still take it later. When nothing
    /// qualifies, the apparent fullness may be dead tombstones inflating
    /// `liveBytes` (tombstones are presumed live until the segment they
    /// reference is cleaned), so fall back to the candidate with the most
    /// tombstone-seconds and compact it for a net-zero gain this pass.
    fn get_segment_to_compact(&self) -> Option<(Arc<Segment>, u32)> {
        let _t = PhaseTimer::new(&self.metrics.in_memory.get_segment_to_compact_nanos);
        let mut candidates = self.candidates.lock();

        let seglet_size = u64::from(self.seglet_size);
        let max_util = u64::from(self.tuning.max_cleanable_memory_utilization);
        let mut best: Option<(usize, u32)> = None;
        for (index, candidate) in candidates.iter().enumerate() {
            let live = candidate.live_bytes();
            let seglets_needed = ((100 * (live + seglet_size - 1)) / seglet_size / max_util) as u32;
            let allocated = candidate.seglets_allocated();
            if seglets_needed < allocated {
                let delta = allocated - seglets_needed;
                if best.map_or(true, |(_, best_delta)| delta > best_delta) {
                    best = Some((index, delta));
                }
            }
        }

        let (index, freeable) = match best {
            Some(found) => found,
            None => {
                let now = wall_seconds();
                let mut best_goodness = 0u128;
                let mut best_index = None;
                for (index, candidate) in candidates.iter().enumerate() {
                    let tombstones = candidate.entry_count(EntryType::Tombstone);
                    let idle = u64::from(now.saturating_sub(candidate.last_compaction_at()));
                    let goodness = u128::from(tombstones) * u128::from(idle);
                    if goodness > best_goodness {
                        best_goodness = goodness;
                        best_index = Some(index);
                    }
                }
                // Freeing anything on this pass could leave the segment too
                // full to disk-clean; take the net-zero compaction and let a
                // later pass reclaim whatever the dead tombstones gave back.
                (best_index?, 0)
            }
        };

        Some((candidates.swap_remove(index), freeable))
    }

    /// Disk cleaning: relocate the live entries of many segments into fresh
    /// survivors, then retire the cleaned segments and their replicas.
    fn do_disk_cleaning(&self, low_on_disk: bool) -> usize {
        let _total = PhaseTimer::new(&self.metrics.on_disk.total_nanos);

        let segments_to_clean = self.get_segments_to_clean();
        if segments_to_clean.is_empty() {
            return 0;
        }

        let entries = self.get_sorted_entries(&segments_to_clean);

        let mut max_live_bytes = 0u64;
        let mut seglets_before = 0u32;
        for segment in &segments_to_clean {
            let live = segment.live_bytes();
            if live == 0 {
                self.metrics
                    .on_disk
                    .total_empty_segments_cleaned
                    .fetch_add(1, Ordering::Relaxed);
            }
            max_live_bytes += live;
            seglets_before += segment.seglets_allocated();
            self.metrics
                .on_disk
                .total_memory_bytes_in_cleaned_segments
                .fetch_add(
                    u64::from(segment.seglets_allocated()) * u64::from(self.seglet_size),
                    Ordering::Relaxed,
                );
            self.metrics
                .on_disk
                .total_disk_bytes_in_cleaned_segments
                .fetch_add(u64::from(self.segment_size), Ordering::Relaxed);
        }

        let (survivors, entry_bytes_appended) = self.relocate_live_entries(entries);

        // If these do not hold our statistics are wrong: someone freed an
        // entry but left its reference in the registry, or the reverse.
        assert!(
            entry_bytes_appended <= max_live_bytes,
            "relocated {entry_bytes_appended} bytes out of {max_live_bytes} live"
        );
        let seglets_after: u32 = survivors.iter().map(|s| s.seglets_allocated()).sum();
        assert!(seglets_after <= seglets_before);
        assert!(survivors.len() <= segments_to_clean.len());

        let memory_bytes_freed =
            u64::from(seglets_before - seglets_after) * u64::from(self.seglet_size);
        let disk_bytes_freed = (segments_to_clean.len() - survivors.len()) as u64
            * u64::from(self.segment_size);
        let on_disk = &self.metrics.on_disk;
        on_disk
            .total_memory_bytes_freed
            .fetch_add(memory_bytes_freed, Ordering::Relaxed);
        on_disk
            .total_disk_bytes_freed
            .fetch_add(disk_bytes_freed, Ordering::Relaxed);
        on_disk
            .total_segments_cleaned
            .fetch_add(segments_to_clean.len() as u64, Ordering::Relaxed);
        on_disk
            .total_survivors_created
            .fetch_add(survivors.len() as u64, Ordering::Relaxed);
        on_disk.total_runs.fetch_add(1, Ordering::Relaxed);
        if low_on_disk {
            on_disk
                .total_low_disk_space_runs
                .fetch_add(1, Ordering::Relaxed);
        }

        log::debug!(
            "disk pass cleaned {} segments into {} survivors; freed {} memory bytes, {} disk bytes",
            segments_to_clean.len(),
            survivors.len(),
            memory_bytes_freed,
            disk_bytes_freed
        );

        let _complete = PhaseTimer::new(&self.metrics.on_disk.cleaning_complete_nanos);
        self.manager.cleaning_complete(&segments_to_clean, &survivors);
        segments_to_clean.len()
    }

    /// Choose disk cleaning candidates by cost-benefit, committing to no
    /// more live data than one pass may move.
    fn get_segments_to_clean(&self) -> Vec<Arc<Segment>> {
        let _t = PhaseTimer::new(&self.metrics.on_disk.get_segments_to_clean_nanos);
        let mut candidates = self.candidates.lock();

        {
            let _sort = PhaseTimer::new(&self.metrics.on_disk.cost_benefit_sort_nanos);
            let version = self.sort_version.fetch_add(1, Ordering::Relaxed) + 1;
            let now = wall_seconds();
            candidates.sort_by(|a, b| {
                cost_benefit(b, now, version).cmp(&cost_benefit(a, now, version))
            });
        }

        let max_live_bytes = self.disk_pass_live_budget;
        let mut total_live_bytes = 0u64;
        let mut chosen_indices = Vec::new();
        for (index, candidate) in candidates.iter().enumerate() {
            if candidate.memory_utilization() > self.tuning.max_cleanable_memory_utilization {
                continue;
            }
            let live = candidate.live_bytes();
            if total_live_bytes + live > max_live_bytes {
                break;
            }
            total_live_bytes += live;
            chosen_indices.push(index);
        }

        // Removing back to front keeps earlier indices stable. Once removed
        // we are committed: the reserve guarantees the resources to finish.
        let mut chosen = Vec::with_capacity(chosen_indices.len());
        for index in chosen_indices.into_iter().rev() {
            chosen.push(candidates.swap_remove(index));
        }
        chosen.reverse();

        for segment in &chosen {
            self.manager.note_cleaning(segment.id());
        }
        chosen
    }

    /// Extract every entry of the segments being cleaned, annotated with its
    /// timestamp, ordered oldest-first. Clustering by age segregates data
    /// with similar lifetimes into the same survivors, which keeps future
    /// cleaning cheap.
    fn get_sorted_entries(&self, segments: &[Arc<Segment>]) -> Vec<(Arc<Segment>, u32, u32)> {
        let _t = PhaseTimer::new(&self.metrics.on_disk.get_sorted_entries_nanos);

        let mut entries = Vec::new();
        for segment in segments {
            for (ty, offset, payload) in segment.iter() {
                let timestamp = self.handlers.timestamp(ty, &payload);
                entries.push((segment.clone(), offset, timestamp));
            }
        }

        let _sort = PhaseTimer::new(&self.metrics.on_disk.timestamp_sort_nanos);
        entries.sort_by_key(|(_, _, timestamp)| *timestamp);
        entries
    }

    /// Stream sorted entries into survivor segments, closing each survivor
    /// as it fills so backup replication overlaps with filling the next.
    fn relocate_live_entries(
        &self,
        entries: Vec<(Arc<Segment>, u32, u32)>,
    ) -> (Vec<Arc<Segment>>, u64) {
        let _t = PhaseTimer::new(&self.metrics.on_disk.relocate_live_entries_nanos);

        // Fresh survivors are credited with a full segment of live bytes and
        // corrected down in one batched step when they close, so concurrent
        // frees of just-relocated entries can never drive the counter below
        // zero. See the same dance in `do_memory_cleaning`.
        let survivor_credit = u64::from(self.segment_size);
        let mut survivors: Vec<Arc<Segment>> = Vec::new();
        let mut survivor: Option<Arc<Segment>> = None;
        let mut survivor_bytes = 0u64;
        let mut entry_bytes_appended = 0u64;
        let mut scanned = [0u64; ENTRY_TYPE_COUNT];
        let mut live_scanned = [0u64; ENTRY_TYPE_COUNT];
        let mut scanned_lengths = [0u64; ENTRY_TYPE_COUNT];
        let mut live_lengths = [0u64; ENTRY_TYPE_COUNT];

        for (segment, offset, _timestamp) in entries {
            let (ty, payload) = segment
                .get_entry(offset)
                .expect("entry vanished from a segment being cleaned");
            let reference = segment.reference(offset);

            let mut appended_now = 0u64;
            let mut status = self.relocate_entry(
                ty,
                &payload,
                reference,
                survivor.as_deref(),
                &mut appended_now,
            );
            if status == RelocStatus::Failed {
                if let Some(full) = survivor.take() {
                    full.sub_live_bytes(survivor_credit - survivor_bytes);
                    survivor_bytes = 0;
                    self.close_survivor(&full);
                }

                let wait = PhaseTimer::new(&self.metrics.on_disk.wait_for_survivor_nanos);
                let fresh = self
                    .manager
                    .alloc_side_segment(SideSegmentFlags::FOR_CLEANING_MUST_NOT_FAIL, None)
                    .expect("MUST_NOT_FAIL survivor allocation returned none");
                wait.stop();
                fresh.add_live_bytes(survivor_credit);
                survivors.push(fresh.clone());
                survivor = Some(fresh);

                status = self.relocate_entry(
                    ty,
                    &payload,
                    reference,
                    survivor.as_deref(),
                    &mut appended_now,
                );
                if status == RelocStatus::Failed {
                    panic!(
                        "live entry of {} bytes did not fit an empty survivor segment",
                        payload.len()
                    );
                }
            }

            let total = u64::from(ENTRY_HEADER_SIZE) + payload.len() as u64;
            scanned[ty as usize] += 1;
            scanned_lengths[ty as usize] += total;
            if status == RelocStatus::Relocated {
                live_scanned[ty as usize] += 1;
                live_lengths[ty as usize] += total;
                survivor_bytes += appended_now;
                entry_bytes_appended += appended_now;
            }
        }

        if let Some(last) = survivor {
            last.sub_live_bytes(survivor_credit - survivor_bytes);
            self.close_survivor(&last);
        }

        // The pass is not done until every survivor is durable: a reader
        // must never resolve into a survivor whose bytes could still be
        // lost, and cleaned replicas must outlive that window.
        for survivor in &survivors {
            let _sync = PhaseTimer::new(&self.metrics.on_disk.survivor_sync_nanos);
            self.sync_with_backoff(survivor.id(), survivor.appended_len());
        }

        let scans = &self.metrics.on_disk.scans;
        scans.entries_scanned.add_all(&scanned);
        scans.live_entries_scanned.add_all(&live_scanned);
        scans.scanned_entry_lengths.add_all(&scanned_lengths);
        scans.live_scanned_entry_lengths.add_all(&live_lengths);

        (survivors, entry_bytes_appended)
    }

    /// The relocation protocol: liveness check, tentative append, registry
    /// retarget. Nothing is written when the survivor has no room, so the
    /// caller may retry the same entry against a fresh survivor.
    fn relocate_entry(
        &self,
        ty: EntryType,
        payload: &Bytes,
        reference: Reference,
        survivor: Option<&Segment>,
        bytes_appended: &mut u64,
    ) -> RelocStatus {
        if !self.handlers.is_live(ty, reference, payload) {
            return RelocStatus::NotNeeded;
        }
        let Some(survivor) = survivor else {
            return RelocStatus::Failed;
        };
        let Some(offset) = survivor.append(ty, payload) else {
            return RelocStatus::Failed;
        };
        self.handlers
            .relocated(ty, reference, survivor.reference(offset), payload);
        *bytes_appended += u64::from(ENTRY_HEADER_SIZE) + payload.len() as u64;
        RelocStatus::Relocated
    }

    /// Close a filled survivor, finish its replication, and return its
    /// unused seglet tail so the next survivor can be cut from it.
    fn close_survivor(&self, survivor: &Arc<Segment>) {
        let _t = PhaseTimer::new(&self.metrics.on_disk.close_survivor_nanos);
        self.metrics
            .on_disk
            .total_bytes_appended_to_survivors
            .fetch_add(u64::from(survivor.appended_len()), Ordering::Relaxed);

        survivor.close();
        self.manager
            .replicate_survivor_close(survivor)
            .expect("backup rejected survivor replication");

        let unused = survivor.seglets_allocated() - survivor.seglets_in_use();
        assert!(survivor.free_unused_seglets(unused));
    }

    /// Survivor syncs must eventually succeed; transient backup failures
    /// are retried with capped exponential backoff.
    fn sync_with_backoff(&self, segment_id: u64, offset: u32) {
        let mut backoff = Duration::from_millis(1);
        loop {
            match self.backup.sync(segment_id, offset) {
                Ok(()) => return,
                Err(err) => {
                    log::warn!(
                        "survivor sync({segment_id}, {offset}) failed, retrying in {backoff:?}: {err:#}"
                    );
                    std::thread::sleep(backoff);
                    backoff = (backoff * 2).min(Duration::from_millis(100));
                }
            }
        }
    }
}

/// Benefit/cost of cleaning a segment: old, mostly-dead segments first; an
/// empty segment is infinitely attractive. The value is cached per sort
/// pass so the comparator never sees two different answers for one segment
/// within a single sort.
fn cost_benefit(segment: &Segment, now: u32, version: u64) -> u64 {
    if let Some(cached) = segment.cached_cost_benefit(version) {
        return cached;
    }
    let utilization = u64::from(segment.disk_utilization());
    let value = if utilization == 0 {
        u64::MAX
    } else {
        let age = u64::from(now.saturating_sub(segment.created_at()));
        ((100 - utilization) * age) / utilization
    };
    segment.cache_cost_benefit(value, version);
    value
}
