//! End-to-end behaviour of named maps across independent handles

use melshare::{MapConfig, MapError, MapRegistry, NamedMap, Payload, PayloadKind};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

fn unique_name(prefix: &str) -> String {
    static NEXT: AtomicUsize = AtomicUsize::new(0);
    format!(
        "melshare_it_{}_{}_{}",
        prefix,
        std::process::id(),
        NEXT.fetch_add(1, Ordering::Relaxed)
    )
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("melshare=warn")),
        )
        .with_test_writer()
        .try_init();
}

#[test]
fn doubles_round_trip() {
    init_tracing();
    let map = NamedMap::try_open(&unique_name("m"), MapConfig::with_capacity(64)).unwrap();
    map.write_doubles(&[1.0, 2.0, 3.0]).unwrap();
    assert_eq!(map.read_doubles().unwrap(), vec![1.0, 2.0, 3.0]);
}

#[test]
fn text_round_trip_in_small_map() {
    init_tracing();
    let map = NamedMap::try_open(&unique_name("m2"), MapConfig::with_capacity(16)).unwrap();
    map.write_text("hi").unwrap();
    assert_eq!(map.size().unwrap(), 3);
    assert_eq!(map.read_text().unwrap(), "hi");
}

#[test]
fn independent_handles_share_contents() {
    init_tracing();
    let name = unique_name("shared");

    // Either actor may create the map; the other attaches
    for creator_writes in [true, false] {
        let (writer, reader) = if creator_writes {
            let w = NamedMap::open_or_create(&name, 64);
            let r = NamedMap::open_or_create(&name, 64);
            (w, r)
        } else {
            let r = NamedMap::open_or_create(&name, 64);
            let w = NamedMap::open_or_create(&name, 64);
            (w, r)
        };

        writer.write_ints(&[42]).unwrap();
        assert_eq!(reader.read_ints().unwrap(), vec![42]);

        writer.close().unwrap();
        reader.close().unwrap();
    }
}

#[test]
fn handles_on_other_threads_see_writes() {
    init_tracing();
    let name = unique_name("threads");
    let writer = NamedMap::open_or_create(&name, 64);
    writer.write_text("from main").unwrap();

    let seen = thread::spawn({
        let name = name.clone();
        move || NamedMap::open_or_create(&name, 64).read_text()
    })
    .join()
    .unwrap();

    assert_eq!(seen.unwrap(), "from main");
}

#[test]
fn payload_round_trip_up_to_capacity() {
    init_tracing();
    let capacity = 64;
    let map = NamedMap::try_open(&unique_name("sizes"), MapConfig::with_capacity(capacity)).unwrap();

    for len in [0usize, 1, 7, 31, capacity - 4] {
        let payload: Vec<u8> = (0..len).map(|i| (i * 7 + len) as u8).collect();
        map.write_bytes(&payload).unwrap();
        assert_eq!(map.read_bytes().unwrap(), payload, "len {}", len);
    }

    let err = map.write_bytes(&vec![0u8; capacity - 3]).unwrap_err();
    assert!(matches!(err, MapError::PayloadTooLarge { .. }));
    assert_eq!(map.read_bytes().unwrap().len(), capacity - 4);
}

#[test]
fn contended_writers_read_their_own_value() {
    init_tracing();
    const THREADS: usize = 8;
    const ROUNDS: usize = 200;

    let name = unique_name("contention");
    let config = MapConfig {
        capacity: 256,
        lock_timeout: Duration::from_secs(2),
        ..MapConfig::default()
    };
    // Keep the map alive while the workers attach and detach
    let _anchor = NamedMap::try_open(&name, config.clone()).unwrap();
    let barrier = Arc::new(Barrier::new(THREADS));

    let workers: Vec<_> = (0..THREADS)
        .map(|id| {
            let name = name.clone();
            let config = config.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let map = NamedMap::try_open(&name, config).unwrap();
                barrier.wait();
                let mut torn = 0;
                for round in 0..ROUNDS {
                    let value = (id * ROUNDS + round) as f64;
                    let frame = vec![value; 1 + (id + round) % 16];
                    map.write_doubles(&frame).unwrap();
                    // Every read must be some writer's complete frame
                    let read = map.read_doubles().unwrap();
                    if read.is_empty() || read.iter().any(|v| *v != read[0]) {
                        torn += 1;
                    }
                }
                torn
            })
        })
        .collect();

    for worker in workers {
        assert_eq!(worker.join().unwrap(), 0);
    }
}

#[test]
fn serialized_write_then_read_returns_own_value() {
    init_tracing();
    const THREADS: usize = 4;
    let name = unique_name("own_value");
    let map = Arc::new(NamedMap::open_or_create(&name, 128));

    // A single write-then-read pair per actor, serialized by a process-local
    // mutex so no other writer can slip between them
    let turn = Arc::new(parking_lot::Mutex::new(()));
    let workers: Vec<_> = (0..THREADS as i32)
        .map(|id| {
            let map = Arc::clone(&map);
            let turn = Arc::clone(&turn);
            thread::spawn(move || {
                for round in 0..100 {
                    let _turn = turn.lock();
                    let value = vec![id, round, id * round];
                    map.write_ints(&value).unwrap();
                    assert_eq!(map.read_ints().unwrap(), value);
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }
}

#[test]
fn mismatched_reader_gets_corrupt_frame() {
    init_tracing();
    let map = NamedMap::open_or_create(&unique_name("mismatch"), 64);
    map.write(&Payload::Doubles(vec![1.0, 2.0, 3.0])).unwrap();
    assert!(matches!(
        map.read(PayloadKind::Text),
        Err(MapError::CorruptFrame { .. })
    ));
    // The frame itself is untouched by the failed interpretation
    assert_eq!(map.read_doubles().unwrap(), vec![1.0, 2.0, 3.0]);
}

#[test]
fn registry_shares_segment_with_direct_handles() {
    init_tracing();
    let name = unique_name("registry");
    let registry = MapRegistry::new();
    registry.open_or_create(&name, 64).unwrap();

    let direct = NamedMap::open_or_create(&name, 64);
    direct.write_floats(&[1.5, 2.5]).unwrap();
    assert_eq!(registry.read_floats(&name).unwrap(), vec![1.5, 2.5]);

    registry.close(&name).unwrap();
    assert_eq!(direct.read_floats().unwrap(), vec![1.5, 2.5]);
}
