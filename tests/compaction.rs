use std::sync::Arc;
use std::time::Duration;

use ramlog::{
    EntryType, HashRegistry, InMemoryBackup, Key, Log, LogOptions, Object, Tombstone,
};

fn small_options() -> LogOptions {
    LogOptions {
        memory_bytes: 512 * 1024,
        segment_size: 16 * 1024,
        seglet_size: 2 * 1024,
        max_disk_segments: 128,
        cleaner_threads: 1,
        survivor_segments_per_thread: 2,
        ..Default::default()
    }
}

fn open_log(options: LogOptions) -> (Log, Arc<HashRegistry>) {
    let registry = Arc::new(HashRegistry::new());
    let log = Log::open(options, Arc::new(InMemoryBackup::new()), registry.clone()).unwrap();
    registry.bind(log.segment_manager().clone());
    (log, registry)
}

/// Append an object, publish it, and free the reference it displaced.
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

fn lookup(registry: &HashRegistry, table: u64, key: &str) -> Option<ramlog::Reference> {
    registry.lookup(&Key::new(table, key.as_bytes().to_vec()))
}

/// Fill the current head with throwaway objects until the log rolls over.
fn force_rollover(log: &Log, registry: &HashRegistry) {
    let before = log.metrics().head_rollovers;
    let mut i = 0;
    while log.metrics().head_rollovers == before {
        put(log, registry, 999, &format!("filler-{i}"), &[0u8; 512], 1);
        i += 1;
    }
}

/// Close the current head by appending an entry sized to exactly fill a
/// fresh segment: it cannot fit the (non-empty) head, so the head closes
/// with only its prior content, and the big entry fills the new head.
fn roll_head_with_big_entry(log: &Log, registry: &HashRegistry, i: u32) {
    let key = format!("big-{i}");
    let value_len = log.max_entry_payload() as usize - 14 - key.len();
    put(log, registry, 999, &key, &vec![0u8; value_len], 1);
}

#[test]
fn overwrite_then_compaction_reclaims_seglets() {
    let (log, registry) = open_log(small_options());

    put(&log, &registry, 7, "k", b"A", 1);
    let r1 = lookup(&registry, 7, "k").unwrap();
    put(&log, &registry, 7, "k", b"B", 2);
    let r2 = lookup(&registry, 7, "k").unwrap();
    assert_ne!(r1, r2);

    // Bulk up the segment with data that immediately dies, then close it.
    for i in 0..20 {
        put(&log, &registry, 8, &format!("bulk-{i}"), &[7u8; 400], 1);
    }
    for i in 0..20 {
        delete(&log, &registry, 8, &format!("bulk-{i}"));
    }
    force_rollover(&log, &registry);

    let segment_id = r2.segment_id();
    let before = log
        .segment_manager()
        .get_segment(segment_id)
        .unwrap()
        .seglets_allocated();

    assert!(log.compact_memory_once());

    // The key still resolves through the registry, the dead overwrite is
    // gone, and the segment kept its identity with a smaller footprint.
    let key = Key::new(7, &b"k"[..]);
    assert_eq!(registry.lookup_object(&log, &key).unwrap().value, "B");
    assert_ne!(registry.lookup(&key).unwrap(), r2);
    assert_eq!(registry.lookup(&key).unwrap().segment_id(), segment_id);

    let after = log
        .segment_manager()
        .get_segment(segment_id)
        .unwrap()
        .seglets_allocated();
    assert!(after < before, "compaction kept {after} of {before} seglets");

    let metrics = log.metrics().cleaner.in_memory;
    assert_eq!(metrics.total_segments_compacted, 1);
    assert!(metrics.total_bytes_freed > 0);
}

#[test]
fn compacted_segment_stays_disk_cleanable() {
    let options = small_options();
    let max_cleanable = options.cleaner.max_cleanable_memory_utilization;
    let (log, registry) = open_log(options);

    for i in 0..24 {
        put(&log, &registry, 1, &format!("k{i}"), &[1u8; 400], 1);
    }
    // Kill most of them so compaction has something to squeeze out.
    for i in 0..18 {
        delete(&log, &registry, 1, &format!("k{i}"));
    }
    force_rollover(&log, &registry);

    assert!(log.compact_memory_once());

    // Forward-progress guarantee: the compacted segment is still below the
    // utilization ceiling for disk cleaning.
    let mut checked = 0;
    let mut id = 0;
    while let Some(segment) = log.segment_manager().segment_after(id) {
        id = segment.id();
        if segment.is_closed() {
            assert!(
                segment.memory_utilization() <= max_cleanable,
                "segment {} at {}% exceeds the cleanable ceiling",
                segment.id(),
                segment.memory_utilization()
            );
            checked += 1;
        }
    }
    assert!(checked > 0);
}

#[test]
fn dead_tombstones_compact_via_fallback() {
    let (log, registry) = open_log(small_options());

    // Segment A: objects (with fat keys) that will all be killed.
    let keys: Vec<String> = (0..66).map(|i| format!("{i:0>200}")).collect();
    for key in &keys {
        put(&log, &registry, 3, key, &[9u8; 1], 1);
    }
    let segment_a = lookup(&registry, 3, &keys[0]).unwrap().segment_id();
    roll_head_with_big_entry(&log, &registry, 0);

    // Segment B: nothing but tombstones for segment A's objects. The fat
    // keys make the tombstones fill most of the segment, and every one
    // counts as live until A is cleaned off disk.
    for key in &keys {
        let typed = Key::new(3, key.as_bytes().to_vec());
        let old = registry.remove(&typed).unwrap();
        assert_eq!(old.segment_id(), segment_a);
        log.free(old);
        let tombstone = Tombstone::new(3, typed.key_bytes(), segment_a, 2).encode_to_vec();
        log.append(EntryType::Tombstone, &tombstone).unwrap();
    }
    roll_head_with_big_entry(&log, &registry, 1);

    // Disk-clean A (now fully dead). The tombstone segment presents more
    // than the cleanable utilization ceiling, so only A goes; its id
    // disappearing is what kills the tombstones.
    assert_eq!(log.clean_disk_once(), 1);
    assert!(!log.segment_exists(segment_a));

    // Tombstone ages are whole seconds; let the fallback's idle factor
    // become non-zero.
    std::thread::sleep(Duration::from_millis(1100));

    // First pass: ordinary selection sees a segment full of (apparently
    // live) tombstones and falls back to tombstone-goodness, compacting
    // for zero net gain.
    let tomb_segment = {
        let mut found = None;
        let mut id = 0;
        while let Some(segment) = log.segment_manager().segment_after(id) {
            id = segment.id();
            if segment.entry_count(EntryType::Tombstone) > 0 {
                found = Some(segment);
            }
        }
        found.expect("tombstone segment still tracked")
    };
    let allocated_before = tomb_segment.seglets_allocated();
    assert!(log.compact_memory_once());
    let after_first = log
        .segment_manager()
        .get_segment(tomb_segment.id())
        .unwrap()
        .seglets_allocated();
    assert_eq!(after_first, allocated_before, "first pass is net-zero");

    // Second pass: the relocation discovered every tombstone dead, so
    // ordinary selection now sees a nearly empty segment and shrinks it.
    assert!(log.compact_memory_once());
    let after_second = log
        .segment_manager()
        .get_segment(tomb_segment.id())
        .unwrap()
        .seglets_allocated();
    assert!(
        after_second < allocated_before,
        "two passes left {after_second} of {allocated_before} seglets"
    );
}

#[test]
fn in_memory_cleaning_can_be_disabled() {
    let options = LogOptions {
        write_cost_threshold: 0,
        ..small_options()
    };
    let (log, registry) = open_log(options);

    for i in 0..20 {
        put(&log, &registry, 8, &format!("bulk-{i}"), &[7u8; 400], 1);
    }
    for i in 0..20 {
        delete(&log, &registry, 8, &format!("bulk-{i}"));
    }
    force_rollover(&log, &registry);

    assert!(!log.compact_memory_once());
    assert_eq!(log.metrics().cleaner.in_memory.total_segments_compacted, 0);
}
