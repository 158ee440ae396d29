use std::sync::Arc;
use std::time::Duration;

use ramlog::{
    BackupEvent, EntryType, HashRegistry, InMemoryBackup, Key, Log, LogOptions, Object,
    SegmentState,
};

fn small_options() -> LogOptions {
    LogOptions {
        memory_bytes: 512 * 1024,
        segment_size: 8 * 1024,
        seglet_size: 1024,
        max_disk_segments: 128,
        cleaner_threads: 1,
        survivor_segments_per_thread: 2,
        ..Default::default()
    }
}

fn open_log_with(
    options: LogOptions,
    backup: Arc<InMemoryBackup>,
) -> (Log, Arc<HashRegistry>) {
    let registry = Arc::new(HashRegistry::new());
    let log = Log::open(options, backup, registry.clone()).unwrap();
    registry.bind(log.segment_manager().clone());
    (log, registry)
}

fn put(log: &Log, registry: &HashRegistry, table: u64, key: &str, value: &[u8], ts: u32) {
    let key = Key::new(table, key.as_bytes().to_vec());
    let object = Object::new(table, key.key_bytes(), value.to_vec(), ts).encode_to_vec();
    let reference = log.append(EntryType::Object, &object).unwrap();
    if let Some(old) = registry.insert(&key, reference) {
        log.free(old);
    }
}

fn delete(log: &Log, registry: &HashRegistry, table: u64, key: &str) {
    let key = Key::new(table, key.as_bytes().to_vec());
    let reference = registry.remove(&key).unwrap();
    log.free(reference);
}

/// Fill several segments to roughly 45% live with interleaved timestamps,
/// returning the ids of the closed sparse segments.
fn build_sparse_segments(log: &Log, registry: &HashRegistry, segments: u32, t0: u32) -> Vec<u64> {
    let rollovers_before = log.metrics().head_rollovers;
    let mut key_no = 0u32;
    let mut live_keys: Vec<String> = Vec::new();

    while log.metrics().head_rollovers < rollovers_before + u64::from(segments) {
        // Timestamps sweep [t0, t0 + 100) repeatedly, so age-sorting has to
        // interleave entries from different source segments.
        let ts = t0 + (key_no % 100);
        let key = format!("obj-{key_no}");
        put(log, registry, 5, &key, &[0xc4u8; 450], ts);
        // Kill slightly more than half so four sources fit two survivors.
        if key_no % 16 < 9 {
            delete(log, registry, 5, &key);
        } else {
            live_keys.push(key);
        }
        key_no += 1;
    }

    let mut ids: Vec<u64> = live_keys
        .iter()
        .filter_map(|key| registry.lookup(&Key::new(5, key.clone().into_bytes())))
        .map(|reference| reference.segment_id())
        .collect();
    ids.sort_unstable();
    ids.dedup();
    // Everything in the still-open head does not count as sparse.
    let manager = log.segment_manager();
    ids.retain(|id| {
        manager
            .get_segment(*id)
            .map(|segment| segment.is_closed())
            .unwrap_or(false)
    });
    ids
}

#[test]
fn disk_cleaning_merges_sparse_segments_by_age() {
    let backup = Arc::new(InMemoryBackup::new());
    let (log, registry) = open_log_with(small_options(), backup);

    let sparse = build_sparse_segments(&log, &registry, 4, 1000);
    assert!(sparse.len() >= 4, "expected at least 4 sparse segments");
    let max_id_before = {
        let mut id = 0;
        while let Some(segment) = log.segment_manager().segment_after(id) {
            id = segment.id();
        }
        id
    };

    let cleaned = log.clean_disk_once();
    assert_eq!(cleaned, sparse.len());
    for id in &sparse {
        assert!(!log.segment_exists(*id));
    }

    let metrics = log.metrics().cleaner.on_disk;
    assert_eq!(metrics.total_segments_cleaned, sparse.len() as u64);
    // ~45% live each: four sources fit two survivors.
    assert!(
        metrics.total_survivors_created <= 2,
        "{} survivors for {} sparse segments",
        metrics.total_survivors_created,
        sparse.len()
    );
    assert_eq!(
        metrics.total_disk_bytes_freed,
        (sparse.len() as u64 - metrics.total_survivors_created) * 8 * 1024
    );
    assert!(metrics.total_memory_bytes_freed > 0);

    // Survivors carry fresh ids and their entries are age-ordered.
    let mut survivors_seen = 0;
    let mut id = max_id_before;
    while let Some(segment) = log.segment_manager().segment_after(id) {
        id = segment.id();
        if !segment.is_closed() {
            continue;
        }
        survivors_seen += 1;
        let mut last_ts = 0u32;
        let mut entries = 0;
        for (ty, _offset, payload) in segment.iter() {
            if ty != EntryType::Object {
                continue;
            }
            let object = Object::decode(&payload).unwrap();
            assert!(
                object.timestamp >= last_ts,
                "survivor {} breaks timestamp order",
                segment.id()
            );
            last_ts = object.timestamp;
            entries += 1;
        }
        assert!(entries > 0);
    }
    assert_eq!(survivors_seen as u64, metrics.total_survivors_created);

    // Every surviving key still resolves.
    for key_no in 0..1000u32 {
        let key = Key::new(5, format!("obj-{key_no}").into_bytes());
        if registry.lookup(&key).is_some() {
            assert!(registry.lookup_object(&log, &key).is_some());
        }
    }
}

#[test]
fn cleaned_backups_are_freed_only_after_survivor_syncs() {
    let backup = Arc::new(InMemoryBackup::with_sync_delay(Duration::from_millis(50)));
    let (log, registry) = open_log_with(small_options(), backup.clone());

    let sparse = build_sparse_segments(&log, &registry, 2, 500);
    assert!(!sparse.is_empty());

    let cleaned = log.clean_disk_once();
    assert_eq!(cleaned, sparse.len());

    let events = backup.events();
    let last_sync = events
        .iter()
        .rposition(|event| matches!(event, BackupEvent::Sync(_, _)))
        .expect("survivors must sync");
    for id in &sparse {
        let free_at = events
            .iter()
            .position(|event| *event == BackupEvent::Free(*id))
            .expect("cleaned segment must be freed on the backup");
        assert!(
            free_at > last_sync,
            "backup.free({id}) at {free_at} preceded the last survivor sync at {last_sync}"
        );
    }
    assert!(log.metrics().cleaner.on_disk.survivor_sync_nanos >= 50_000_000);
}

#[test]
fn fully_dead_segments_clean_without_survivors() {
    let backup = Arc::new(InMemoryBackup::new());
    let (log, registry) = open_log_with(small_options(), backup);

    let rollovers_before = log.metrics().head_rollovers;
    let mut key_no = 0;
    while log.metrics().head_rollovers < rollovers_before + 2 {
        let key = format!("dead-{key_no}");
        put(&log, &registry, 6, &key, &[1u8; 300], 1);
        delete(&log, &registry, 6, &key);
        key_no += 1;
    }

    let cleaned = log.clean_disk_once();
    assert!(cleaned >= 2);
    let metrics = log.metrics().cleaner.on_disk;
    assert_eq!(metrics.total_survivors_created, 0);
    assert!(metrics.total_empty_segments_cleaned >= 2);
    assert_eq!(
        metrics.total_disk_bytes_freed,
        cleaned as u64 * 8 * 1024
    );
}

#[test]
fn survivor_sync_retries_transient_backup_failures() {
    let backup = Arc::new(InMemoryBackup::new());
    let (log, registry) = open_log_with(small_options(), backup.clone());

    let sparse = build_sparse_segments(&log, &registry, 2, 500);
    assert!(!sparse.is_empty());

    backup.fail_next_syncs(2);
    let cleaned = log.clean_disk_once();
    assert_eq!(cleaned, sparse.len());

    // The sync eventually succeeded and the pass completed in order.
    assert!(backup
        .events()
        .iter()
        .any(|event| matches!(event, BackupEvent::Sync(_, _))));
    for id in &sparse {
        assert!(backup.is_freed(*id));
    }
}

#[test]
fn survivors_enter_the_candidate_population() {
    let backup = Arc::new(InMemoryBackup::new());
    let (log, registry) = open_log_with(small_options(), backup);

    let sparse = build_sparse_segments(&log, &registry, 3, 100);
    let max_id_before = sparse.iter().copied().max().unwrap();
    log.clean_disk_once();

    let manager = log.segment_manager();
    let mut id = max_id_before;
    let mut survivors = 0;
    while let Some(segment) = manager.segment_after(id) {
        id = segment.id();
        if segment.is_closed() {
            assert_eq!(manager.state_of(segment.id()), Some(SegmentState::Cleanable));
            survivors += 1;
        }
    }
    assert!(survivors > 0);
}
