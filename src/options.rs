use std::time::Duration;

/// Tunables for the two-level cleaner.
///
/// Utilization values are integer percentages. The defaults reproduce the
/// balance the engine was tuned for: compact aggressively enough that every
/// candidate stays disk-cleanable, and only burn disk bandwidth when disk
/// space (or a writer losing the race for memory) forces it.
#[derive(Debug, Clone)]
pub struct CleanerTuning {
    /// Start in-memory compaction at this memory utilization.
    pub min_memory_utilization: u32,
    /// Memory utilization at which the writer is considered to be losing the
    /// race; worker 0 switches to disk cleaning to free whole segments.
    pub memory_depleted_utilization: u32,
    /// Start disk cleaning at this segment-slot utilization.
    pub min_disk_utilization: u32,
    /// Upper bound on the memory utilization a segment may present and still
    /// be selected for disk cleaning. Compaction targets keep segments below
    /// this value so the disk cleaner always has viable candidates.
    pub max_cleanable_memory_utilization: u32,
    /// Cap on live data moved in one disk pass, in units of `segment_size`.
    pub max_live_segments_per_disk_pass: u32,
    /// Idle sleep between cleaner polls (jittered up to +10%).
    pub poll_interval: Duration,
}

impl Default for CleanerTuning {
    fn default() -> Self {
        Self {
            min_memory_utilization: 90,
            memory_depleted_utilization: 98,
            min_disk_utilization: 95,
            max_cleanable_memory_utilization: 90,
            max_live_segments_per_disk_pass: 10,
            poll_interval: Duration::from_millis(10),
        }
    }
}

/// Configuration for a [`Log`](crate::Log).
#[derive(Debug, Clone)]
pub struct LogOptions {
    /// Total bytes of seglet memory backing the log.
    pub memory_bytes: u64,
    /// Bytes per segment. Segments are the unit of backup replication.
    pub segment_size: u32,
    /// Bytes per seglet. Must be a power of two and divide `segment_size`.
    pub seglet_size: u32,
    /// Number of backup segment slots available to this log.
    pub max_disk_segments: u32,
    /// Number of cleaner worker threads. Worker 0 owns disk cleaning.
    pub cleaner_threads: u32,
    /// Target cleaner write cost. 0 disables in-memory compaction.
    pub write_cost_threshold: u32,
    /// Force-disable in-memory compaction regardless of the write cost.
    pub disable_in_memory_cleaning: bool,
    /// Survivor segments reserved per cleaner thread at startup.
    pub survivor_segments_per_thread: u32,
    pub cleaner: CleanerTuning,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            memory_bytes: 1024 * 1024 * 1024,
            segment_size: 8 * 1024 * 1024,
            seglet_size: 64 * 1024,
            max_disk_segments: 256,
            cleaner_threads: 1,
            write_cost_threshold: 8,
            disable_in_memory_cleaning: false,
            survivor_segments_per_thread: 3,
            cleaner: CleanerTuning::default(),
        }
    }
}

impl LogOptions {
    pub fn seglets_per_segment(&self) -> u32 {
        self.segment_size / self.seglet_size
    }

    pub fn total_seglets(&self) -> u32 {
        (self.memory_bytes / u64::from(self.seglet_size)) as u32
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.seglet_size == 0 || !self.seglet_size.is_power_of_two() {
            anyhow::bail!("seglet_size {} must be a power of two", self.seglet_size);
        }
        if self.segment_size == 0 || self.segment_size % self.seglet_size != 0 {
            anyhow::bail!(
                "segment_size {} must be a non-zero multiple of seglet_size {}",
                self.segment_size,
                self.seglet_size
            );
        }
        if self.memory_bytes < u64::from(self.segment_size) {
            anyhow::bail!(
                "memory_bytes {} cannot hold a single {}-byte segment",
                self.memory_bytes,
                self.segment_size
            );
        }
        if self.memory_bytes % u64::from(self.seglet_size) != 0 {
            anyhow::bail!(
                "memory_bytes {} must be a multiple of seglet_size {}",
                self.memory_bytes,
                self.seglet_size
            );
        }
        if self.max_disk_segments == 0 {
            anyhow::bail!("max_disk_segments must be at least 1");
        }
        if self.cleaner_threads == 0 {
            anyhow::bail!("cleaner_threads must be at least 1");
        }
        let tuning = &self.cleaner;
        for (name, value) in [
            ("min_memory_utilization", tuning.min_memory_utilization),
            (
                "memory_depleted_utilization",
                tuning.memory_depleted_utilization,
            ),
            ("min_disk_utilization", tuning.min_disk_utilization),
            (
                "max_cleanable_memory_utilization",
                tuning.max_cleanable_memory_utilization,
            ),
        ] {
            if value == 0 || value > 100 {
                anyhow::bail!("{name} must be a percentage in 1..=100, got {value}");
            }
        }
        if tuning.max_live_segments_per_disk_pass == 0 {
            anyhow::bail!("max_live_segments_per_disk_pass must be at least 1");
        }
        Ok(())
    }
}
