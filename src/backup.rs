//! Backup link: asynchronous replication of closed segments.
//!
//! The log consumes an external backup collaborator through this trait only.
//! Replication is append-only at segment granularity; `sync` is the one
//! durability barrier the cleaner relies on for its ordering guarantee
//! (survivors durable before cleaned segments are forgotten).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

pub trait BackupClient: Send + Sync {
    /// Declare a new segment, with whatever bytes exist at declaration time.
    fn open(&self, segment_id: u64, initial: &[u8]) -> anyhow::Result<()>;

    /// Append bytes to a declared segment. Implementations must tolerate a
    /// re-send of an already-stored prefix.
    fn append(&self, segment_id: u64, bytes: &[u8]) -> anyhow::Result<()>;

    /// No more appends will follow for this segment.
    fn close(&self, segment_id: u64) -> anyhow::Result<()>;

    /// Block until all bytes at offsets `<= offset` are durable on the
    /// configured replication factor of backups.
    fn sync(&self, segment_id: u64, offset: u32) -> anyhow::Result<()>;

    /// The backup may discard the segment. Only called once the segment is
    /// freeable and, for cleaner survivors, after their own sync has acked.
    fn free(&self, segment_id: u64) -> anyhow::Result<()>;
}

/// Backup that accepts everything and stores nothing.
#[derive(Debug, Default)]
pub struct NullBackup;

impl BackupClient for NullBackup {
    fn open(&self, _segment_id: u64, _initial: &[u8]) -> anyhow::Result<()> {
        Ok(())
    }

    fn append(&self, _segment_id: u64, _bytes: &[u8]) -> anyhow::Result<()> {
        Ok(())
    }

    fn close(&self, _segment_id: u64) -> anyhow::Result<()> {
        Ok(())
    }

    fn sync(&self, _segment_id: u64, _offset: u32) -> anyhow::Result<()> {
        Ok(())
    }

    fn free(&self, _segment_id: u64) -> anyhow::Result<()> {
        Ok(())
    }
}

/// One observable backup operation, in acknowledgement order. `Sync` is
/// recorded after its (possibly delayed) ack, so event order is the order
/// the log observed completions in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackupEvent {
    Open(u64),
    Append(u64, usize),
    Close(u64),
    Sync(u64, u32),
    Free(u64),
}

#[derive(Debug, Default)]
struct StoredSegment {
    bytes: Vec<u8>,
    closed: bool,
    freed: bool,
}

/// In-process backup for embedding and tests: stores replicated bytes,
/// records an ordered event trace, and can inject sync latency or failures.
#[derive(Debug, Default)]
pub struct InMemoryBackup {
    segments: Mutex<HashMap<u64, StoredSegment>>,
    events: Mutex<Vec<BackupEvent>>,
    sync_delay: Duration,
    syncs_to_fail: AtomicU32,
}

impl InMemoryBackup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `sync` sleeps this long before acking.
    pub fn with_sync_delay(delay: Duration) -> Self {
        Self {
            sync_delay: delay,
            ..Default::default()
        }
    }

    /// Make the next `n` sync calls fail (then succeed again); exercises the
    /// cleaner's retry-with-backoff path.
    pub fn fail_next_syncs(&self, n: u32) {
        self.syncs_to_fail.store(n, Ordering::Relaxed);
    }

    pub fn events(&self) -> Vec<BackupEvent> {
        self.events.lock().clone()
    }

    pub fn segment_bytes(&self, segment_id: u64) -> Option<Vec<u8>> {
        self.segments
            .lock()
            .get(&segment_id)
            .filter(|s| !s.freed)
            .map(|s| s.bytes.clone())
    }

    pub fn is_freed(&self, segment_id: u64) -> bool {
        self.segments
            .lock()
            .get(&segment_id)
            .is_some_and(|s| s.freed)
    }

    fn record(&self, event: BackupEvent) {
        self.events.lock().push(event);
    }
}

impl BackupClient for InMemoryBackup {
    fn open(&self, segment_id: u64, initial: &[u8]) -> anyhow::Result<()> {
        let mut segments = self.segments.lock();
        if segments.contains_key(&segment_id) {
            anyhow::bail!("backup segment {segment_id} opened twice");
        }
        segments.insert(
            segment_id,
            StoredSegment {
                bytes: initial.to_vec(),
                ..Default::default()
            },
        );
        drop(segments);
        self.record(BackupEvent::Open(segment_id));
        Ok(())
    }

    fn append(&self, segment_id: u64, bytes: &[u8]) -> anyhow::Result<()> {
        let mut segments = self.segments.lock();
        let segment = segments
            .get_mut(&segment_id)
            .ok_or_else(|| anyhow::anyhow!("append to unknown backup segment {segment_id}"))?;
        if segment.closed {
            anyhow::bail!("append to closed backup segment {segment_id}");
        }
        segment.bytes.extend_from_slice(bytes);
        drop(segments);
        self.record(BackupEvent::Append(segment_id, bytes.len()));
        Ok(())
    }

    fn close(&self, segment_id: u64) -> anyhow::Result<()> {
        let mut segments = self.segments.lock();
        let segment = segments
            .get_mut(&segment_id)
            .ok_or_else(|| anyhow::anyhow!("close of unknown backup segment {segment_id}"))?;
        segment.closed = true;
        drop(segments);
        self.record(BackupEvent::Close(segment_id));
        Ok(())
    }

    fn sync(&self, segment_id: u64, offset: u32) -> anyhow::Result<()> {
        if !self.sync_delay.is_zero() {
            std::thread::sleep(self.sync_delay);
        }
        if self
            .syncs_to_fail
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok()
        {
            anyhow::bail!("injected sync timeout for segment {segment_id}");
        }
        let stored = self
            .segments
            .lock()
            .get(&segment_id)
            .map(|s| s.bytes.len() as u32)
            .ok_or_else(|| anyhow::anyhow!("sync of unknown backup segment {segment_id}"))?;
        if stored < offset {
            anyhow::bail!(
                "sync({segment_id}, {offset}) beyond replicated length {stored}"
            );
        }
        self.record(BackupEvent::Sync(segment_id, offset));
        Ok(())
    }

    fn free(&self, segment_id: u64) -> anyhow::Result<()> {
        let mut segments = self.segments.lock();
        let segment = segments
            .get_mut(&segment_id)
            .ok_or_else(|| anyhow::anyhow!("free of unknown backup segment {segment_id}"))?;
        segment.freed = true;
        segment.bytes.clear();
        drop(segments);
        self.record(BackupEvent::Free(segment_id));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_events_in_order() {
        let backup = InMemoryBackup::new();
        backup.open(1, b"head").unwrap();
        backup.append(1, b" body").unwrap();
        backup.close(1).unwrap();
        backup.sync(1, 9).unwrap();
        backup.free(1).unwrap();

        assert_eq!(
            backup.events(),
            vec![
                BackupEvent::Open(1),
                BackupEvent::Append(1, 5),
                BackupEvent::Close(1),
                BackupEvent::Sync(1, 9),
                BackupEvent::Free(1),
            ]
        );
        assert!(backup.is_freed(1));
        assert_eq!(backup.segment_bytes(1), None);
    }

    #[test]
    fn stores_replicated_bytes() {
        let backup = InMemoryBackup::new();
        backup.open(3, b"abc").unwrap();
        backup.append(3, b"def").unwrap();
        assert_eq!(backup.segment_bytes(3).unwrap(), b"abcdef");
        assert!(backup.sync(3, 7).is_err());
        backup.sync(3, 6).unwrap();
    }

    #[test]
    fn injected_sync_failures_expire() {
        let backup = InMemoryBackup::new();
        backup.open(1, b"x").unwrap();
        backup.fail_next_syncs(2);
        assert!(backup.sync(1, 1).is_err());
        assert!(backup.sync(1, 1).is_err());
        backup.sync(1, 1).unwrap();
    }
}
