use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ramlog::{EntryType, HashRegistry, InMemoryBackup, Key, Log, LogOptions, Object};

fn threaded_options() -> LogOptions {
    LogOptions {
        memory_bytes: 256 * 1024,
        segment_size: 8 * 1024,
        seglet_size: 1024,
        max_disk_segments: 4096,
        cleaner_threads: 4,
        survivor_segments_per_thread: 1,
        ..Default::default()
    }
}

fn open_log(options: LogOptions) -> (Arc<Log>, Arc<HashRegistry>) {
    let registry = Arc::new(HashRegistry::new());
    let log = Arc::new(
        Log::open(options, Arc::new(InMemoryBackup::new()), registry.clone()).unwrap(),
    );
    registry.bind(log.segment_manager().clone());
    (log, registry)
}

#[test]
fn shutdown_under_load_joins_quickly_and_keeps_references_valid() {
    let (log, registry) = open_log(threaded_options());
    log.start_cleaner();

    // Steady overwrite workload: a bounded key set whose older versions die
    // immediately, so roughly a third of each closed segment stays live and
    // the cleaner has constant work.
    let mut expected: HashMap<String, Vec<u8>> = HashMap::new();
    let deadline = Instant::now() + Duration::from_secs(2);
    let mut round = 0u32;
    while Instant::now() < deadline {
        for i in 0..96u32 {
            let key = format!("key-{i}");
            let typed = Key::new(2, key.clone().into_bytes());
            let value = vec![(round % 251) as u8; 64 + (i as usize % 32)];
            let object = Object::new(2, typed.key_bytes(), value.clone(), round).encode_to_vec();
            let reference = log.append(EntryType::Object, &object).unwrap();
            if let Some(old) = registry.insert(&typed, reference) {
                log.free(old);
            }
            expected.insert(key, value);
        }
        round += 1;
    }

    let stop_started = Instant::now();
    log.stop_cleaner();
    let stop_took = stop_started.elapsed();
    assert!(
        stop_took < Duration::from_millis(500),
        "stop() took {stop_took:?}"
    );

    // No relocation was abandoned mid-way: every key resolves to its last
    // written value through the registry.
    for (key, value) in &expected {
        let typed = Key::new(2, key.clone().into_bytes());
        let object = registry
            .lookup_object(&log, &typed)
            .unwrap_or_else(|| panic!("key {key} lost after shutdown"));
        assert_eq!(&object.value[..], &value[..], "key {key} corrupted");
    }

    // The pool actually did something while it ran.
    let cleaner = log.metrics().cleaner;
    assert!(cleaner.do_work_nanos > 0);
    assert_eq!(cleaner.thread_active_nanos.len(), 4);
}

#[test]
fn stop_start_stop_is_safe() {
    let (log, _registry) = open_log(threaded_options());

    // stop before start is a no-op.
    log.stop_cleaner();

    log.start_cleaner();
    // start is idempotent while running.
    log.start_cleaner();
    std::thread::sleep(Duration::from_millis(50));
    log.stop_cleaner();
    log.stop_cleaner();

    log.start_cleaner();
    std::thread::sleep(Duration::from_millis(20));
    log.stop_cleaner();
}

#[test]
fn idle_cleaner_sleeps_and_accounts_for_it() {
    let (log, _registry) = open_log(threaded_options());
    log.start_cleaner();
    std::thread::sleep(Duration::from_millis(120));
    log.stop_cleaner();

    let cleaner = log.metrics().cleaner;
    assert!(
        cleaner.do_work_sleep_nanos > 0,
        "an idle cleaner should be sleeping, not spinning"
    );
    // Nothing to clean: no passes ran.
    assert_eq!(cleaner.in_memory.total_segments_compacted, 0);
    assert_eq!(cleaner.on_disk.total_runs, 0);
}

#[test]
fn dropping_the_log_stops_the_cleaner() {
    let (log, registry) = open_log(threaded_options());
    log.start_cleaner();
    for i in 0..32u32 {
        let key = Key::new(1, format!("k{i}").into_bytes());
        let object = Object::new(1, key.key_bytes(), vec![0u8; 64], i).encode_to_vec();
        let reference = log.append(EntryType::Object, &object).unwrap();
        registry.insert(&key, reference);
    }
    drop(log);
}
