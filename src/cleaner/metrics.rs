//! Cleaner metrics: cumulative counters and phase timers.
//!
//! Counters are plain relaxed atomics; `snapshot()` clones them into the
//! value types surfaced through `Log::metrics()`. Phase timers follow the
//! guard pattern: construct at phase entry, drop (or `stop`) at exit.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::entry::ENTRY_TYPE_COUNT;

/// Adds elapsed nanoseconds to a counter when dropped.
pub(crate) struct PhaseTimer<'a> {
    counter: &'a AtomicU64,
    start: Instant,
    stopped: bool,
}

impl<'a> PhaseTimer<'a> {
    pub fn new(counter: &'a AtomicU64) -> Self {
        Self {
            counter,
            start: Instant::now(),
            stopped: false,
        }
    }

    /// Stop early and record now instead of at drop.
    pub fn stop(mut self) {
        self.record();
    }

    fn record(&mut self) {
        if !self.stopped {
            self.stopped = true;
            self.counter
                .fetch_add(self.start.elapsed().as_nanos() as u64, Ordering::Relaxed);
        }
    }
}

impl Drop for PhaseTimer<'_> {
    fn drop(&mut self) {
        self.record();
    }
}

/// One counter per entry type.
#[derive(Debug, Default)]
pub(crate) struct TypeCounters {
    counts: [AtomicU64; ENTRY_TYPE_COUNT],
}

impl TypeCounters {
    pub fn add_all(&self, values: &[u64; ENTRY_TYPE_COUNT]) {
        for (counter, value) in self.counts.iter().zip(values) {
            counter.fetch_add(*value, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> [u64; ENTRY_TYPE_COUNT] {
        std::array::from_fn(|i| self.counts[i].load(Ordering::Relaxed))
    }
}

/// Per-entry-type scan statistics shared by both cleaning levels.
#[derive(Debug, Default)]
pub(crate) struct ScanCounters {
    pub entries_scanned: TypeCounters,
    pub live_entries_scanned: TypeCounters,
    pub scanned_entry_lengths: TypeCounters,
    pub live_scanned_entry_lengths: TypeCounters,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanCountersSnapshot {
    pub entries_scanned: [u64; ENTRY_TYPE_COUNT],
    pub live_entries_scanned: [u64; ENTRY_TYPE_COUNT],
    pub scanned_entry_lengths: [u64; ENTRY_TYPE_COUNT],
    pub live_scanned_entry_lengths: [u64; ENTRY_TYPE_COUNT],
}

impl ScanCounters {
    pub fn snapshot(&self) -> ScanCountersSnapshot {
        ScanCountersSnapshot {
            entries_scanned: self.entries_scanned.snapshot(),
            live_entries_scanned: self.live_entries_scanned.snapshot(),
            scanned_entry_lengths: self.scanned_entry_lengths.snapshot(),
            live_scanned_entry_lengths: self.live_scanned_entry_lengths.snapshot(),
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct InMemoryMetrics {
    pub total_segments_compacted: AtomicU64,
    pub total_bytes_freed: AtomicU64,
    pub total_bytes_in_compacted_segments: AtomicU64,
    pub total_bytes_appended_to_survivors: AtomicU64,
    pub scans: ScanCounters,
    pub get_segment_to_compact_nanos: AtomicU64,
    pub wait_for_survivor_nanos: AtomicU64,
    pub compaction_complete_nanos: AtomicU64,
    pub total_nanos: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InMemoryMetricsSnapshot {
    pub total_segments_compacted: u64,
    pub total_bytes_freed: u64,
    pub total_bytes_in_compacted_segments: u64,
    pub total_bytes_appended_to_survivors: u64,
    pub scans: ScanCountersSnapshot,
    pub get_segment_to_compact_nanos: u64,
    pub wait_for_survivor_nanos: u64,
    pub compaction_complete_nanos: u64,
    pub total_nanos: u64,
}

impl InMemoryMetrics {
    pub fn snapshot(&self) -> InMemoryMetricsSnapshot {
        InMemoryMetricsSnapshot {
            total_segments_compacted: self.total_segments_compacted.load(Ordering::Relaxed),
            total_bytes_freed: self.total_bytes_freed.load(Ordering::Relaxed),
            total_bytes_in_compacted_segments: self
                .total_bytes_in_compacted_segments
                .load(Ordering::Relaxed),
            total_bytes_appended_to_survivors: self
                .total_bytes_appended_to_survivors
                .load(Ordering::Relaxed),
            scans: self.scans.snapshot(),
            get_segment_to_compact_nanos: self.get_segment_to_compact_nanos.load(Ordering::Relaxed),
            wait_for_survivor_nanos: self.wait_for_survivor_nanos.load(Ordering::Relaxed),
            compaction_complete_nanos: self.compaction_complete_nanos.load(Ordering::Relaxed),
            total_nanos: self.total_nanos.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct OnDiskMetrics {
    pub total_segments_cleaned: AtomicU64,
    pub total_survivors_created: AtomicU64,
    pub total_empty_segments_cleaned: AtomicU64,
    pub total_memory_bytes_freed: AtomicU64,
    pub total_disk_bytes_freed: AtomicU64,
    pub total_memory_bytes_in_cleaned_segments: AtomicU64,
    pub total_disk_bytes_in_cleaned_segments: AtomicU64,
    pub total_bytes_appended_to_survivors: AtomicU64,
    pub total_runs: AtomicU64,
    pub total_low_disk_space_runs: AtomicU64,
    pub scans: ScanCounters,
    pub get_segments_to_clean_nanos: AtomicU64,
    pub cost_benefit_sort_nanos: AtomicU64,
    pub get_sorted_entries_nanos: AtomicU64,
    pub timestamp_sort_nanos: AtomicU64,
    pub relocate_live_entries_nanos: AtomicU64,
    pub wait_for_survivor_nanos: AtomicU64,
    pub close_survivor_nanos: AtomicU64,
    pub survivor_sync_nanos: AtomicU64,
    pub cleaning_complete_nanos: AtomicU64,
    pub total_nanos: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OnDiskMetricsSnapshot {
    pub total_segments_cleaned: u64,
    pub total_survivors_created: u64,
    pub total_empty_segments_cleaned: u64,
    pub total_memory_bytes_freed: u64,
    pub total_disk_bytes_freed: u64,
    pub total_memory_bytes_in_cleaned_segments: u64,
    pub total_disk_bytes_in_cleaned_segments: u64,
    pub total_bytes_appended_to_survivors: u64,
    pub total_runs: u64,
    pub total_low_disk_space_runs: u64,
    pub scans: ScanCountersSnapshot,
    pub get_segments_to_clean_nanos: u64,
    pub cost_benefit_sort_nanos: u64,
    pub get_sorted_entries_nanos: u64,
    pub timestamp_sort_nanos: u64,
    pub relocate_live_entries_nanos: u64,
    pub wait_for_survivor_nanos: u64,
    pub close_survivor_nanos: u64,
    pub survivor_sync_nanos: u64,
    pub cleaning_complete_nanos: u64,
    pub total_nanos: u64,
}

impl OnDiskMetrics {
    pub fn snapshot(&self) -> OnDiskMetricsSnapshot {
        OnDiskMetricsSnapshot {
            total_segments_cleaned: self.total_segments_cleaned.load(Ordering::Relaxed),
            total_survivors_created: self.total_survivors_created.load(Ordering::Relaxed),
            total_empty_segments_cleaned: self.total_empty_segments_cleaned.load(Ordering::Relaxed),
            total_memory_bytes_freed: self.total_memory_bytes_freed.load(Ordering::Relaxed),
            total_disk_bytes_freed: self.total_disk_bytes_freed.load(Ordering::Relaxed),
            total_memory_bytes_in_cleaned_segments: self
                .total_memory_bytes_in_cleaned_segments
                .load(Ordering::Relaxed),
            total_disk_bytes_in_cleaned_segments: self
                .total_disk_bytes_in_cleaned_segments
                .load(Ordering::Relaxed),
            total_bytes_appended_to_survivors: self
                .total_bytes_appended_to_survivors
                .load(Ordering::Relaxed),
            total_runs: self.total_runs.load(Ordering::Relaxed),
            total_low_disk_space_runs: self.total_low_disk_space_runs.load(Ordering::Relaxed),
            scans: self.scans.snapshot(),
            get_segments_to_clean_nanos: self.get_segments_to_clean_nanos.load(Ordering::Relaxed),
            cost_benefit_sort_nanos: self.cost_benefit_sort_nanos.load(Ordering::Relaxed),
            get_sorted_entries_nanos: self.get_sorted_entries_nanos.load(Ordering::Relaxed),
            timestamp_sort_nanos: self.timestamp_sort_nanos.load(Ordering::Relaxed),
            relocate_live_entries_nanos: self.relocate_live_entries_nanos.load(Ordering::Relaxed),
            wait_for_survivor_nanos: self.wait_for_survivor_nanos.load(Ordering::Relaxed),
            close_survivor_nanos: self.close_survivor_nanos.load(Ordering::Relaxed),
            survivor_sync_nanos: self.survivor_sync_nanos.load(Ordering::Relaxed),
            cleaning_complete_nanos: self.cleaning_complete_nanos.load(Ordering::Relaxed),
            total_nanos: self.total_nanos.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug)]
pub(crate) struct CleanerMetrics {
    pub in_memory: InMemoryMetrics,
    pub on_disk: OnDiskMetrics,
    pub do_work_nanos: AtomicU64,
    pub do_work_sleep_nanos: AtomicU64,
    /// Time each worker spent actively cleaning (indexed by worker).
    pub thread_active_nanos: Vec<AtomicU64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanerMetricsSnapshot {
    pub in_memory: InMemoryMetricsSnapshot,
    pub on_disk: OnDiskMetricsSnapshot,
    pub do_work_nanos: u64,
    pub do_work_sleep_nanos: u64,
    pub thread_active_nanos: Vec<u64>,
}

impl CleanerMetrics {
    pub fn new(threads: usize) -> Self {
        Self {
            in_memory: InMemoryMetrics::default(),
            on_disk: OnDiskMetrics::default(),
            do_work_nanos: AtomicU64::new(0),
            do_work_sleep_nanos: AtomicU64::new(0),
            thread_active_nanos: (0..threads).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    pub fn snapshot(&self) -> CleanerMetricsSnapshot {
        CleanerMetricsSnapshot {
            in_memory: self.in_memory.snapshot(),
            on_disk: self.on_disk.snapshot(),
            do_work_nanos: self.do_work_nanos.load(Ordering::Relaxed),
            do_work_sleep_nanos: self.do_work_sleep_nanos.load(Ordering::Relaxed),
            thread_active_nanos: self
                .thread_active_nanos
                .iter()
                .map(|n| n.load(Ordering::Relaxed))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::EntryType;

    #[test]
    fn phase_timer_records_on_drop_and_stop() {
        let counter = AtomicU64::new(0);
        {
            let _t = PhaseTimer::new(&counter);
        }
        let after_drop = counter.load(Ordering::Relaxed);
        // Nanosecond clocks can legitimately read 0 elapsed; just check the
        // explicit-stop path records exactly once.
        PhaseTimer::new(&counter).stop();
        assert!(counter.load(Ordering::Relaxed) >= after_drop);
    }

    #[test]
    fn type_counters_accumulate_per_type() {
        let counters = TypeCounters::default();
        let mut batch = [0u64; ENTRY_TYPE_COUNT];
        batch[EntryType::Object as usize] = 2;
        batch[EntryType::Tombstone as usize] = 3;
        counters.add_all(&batch);
        counters.add_all(&[1, 0, 0, 1]);
        assert_eq!(counters.snapshot(), [1, 2, 3, 1]);
    }
}
