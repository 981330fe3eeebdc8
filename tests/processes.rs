//! Named maps shared between separate processes
//!
//! Each test re-runs this test binary filtered to `child_process_entry`,
//! with the role and map name passed through the environment.

use melshare::lock::NamedLock;
use melshare::{MapConfig, MapError, NamedMap, OpenMode};
use std::process::{Child, Command};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

const ROLE_VAR: &str = "MELSHARE_CHILD_ROLE";
const NAME_VAR: &str = "MELSHARE_CHILD_MAP";
const ID_VAR: &str = "MELSHARE_CHILD_ID";

const CONTENDERS: usize = 4;
const ROUNDS: usize = 200;

fn unique_name(prefix: &str) -> String {
    static NEXT: AtomicUsize = AtomicUsize::new(0);
    format!(
        "melshare_proc_{}_{}_{}",
        prefix,
        std::process::id(),
        NEXT.fetch_add(1, Ordering::Relaxed)
    )
}

fn spawn_child(role: &str, name: &str, id: usize) -> Child {
    Command::new(std::env::current_exe().unwrap())
        .args(["child_process_entry", "--exact", "--nocapture", "--test-threads=1"])
        .env(ROLE_VAR, role)
        .env(NAME_VAR, name)
        .env(ID_VAR, id.to_string())
        .spawn()
        .unwrap()
}

fn run_child(role: &str, name: &str) {
    let status = spawn_child(role, name, 0).wait().unwrap();
    assert!(status.success(), "child '{}' exited with {}", role, status);
}

fn attach_existing(name: &str) -> NamedMap {
    let config = MapConfig {
        mode: OpenMode::OpenOnly,
        lock_timeout: Duration::from_secs(2),
        ..MapConfig::default()
    };
    NamedMap::try_open(name, config).unwrap()
}

/// Runs a child role when spawned by one of the tests below; a no-op otherwise
#[test]
fn child_process_entry() {
    let Ok(role) = std::env::var(ROLE_VAR) else {
        return;
    };
    let name = std::env::var(NAME_VAR).unwrap();
    let id: usize = std::env::var(ID_VAR).unwrap().parse().unwrap();

    match role.as_str() {
        "write" => {
            let map = attach_existing(&name);
            map.write_ints(&[7]).unwrap();
            map.close().unwrap();
        }
        "abandon" => {
            let lock = NamedLock::open_only(&name).unwrap();
            let guard = lock.acquire(Duration::from_secs(2)).unwrap();
            // Die holding the lock
            std::mem::forget(guard);
            std::process::exit(0);
        }
        "contend" => {
            let map = attach_existing(&name);
            for round in 0..ROUNDS {
                let value = (id * ROUNDS + round) as f64;
                map.write_doubles(&vec![value; 1 + (id + round) % 16]).unwrap();
                let read = map.read_doubles().unwrap();
                assert!(!read.is_empty() && read.iter().all(|v| *v == read[0]));
            }
            map.close().unwrap();
        }
        other => panic!("unknown child role {}", other),
    }
}

#[test]
fn child_write_is_seen_by_parent() {
    let name = unique_name("write");
    let map = NamedMap::try_open(&name, MapConfig::with_capacity(64)).unwrap();
    map.write_ints(&[1]).unwrap();

    run_child("write", &name);

    assert_eq!(map.read_ints().unwrap(), vec![7]);
}

#[test]
fn holder_exiting_mid_operation_reports_abandoned_once() {
    let name = unique_name("abandon");
    let map = NamedMap::try_open(&name, MapConfig::with_capacity(64)).unwrap();
    map.write_ints(&[7]).unwrap();

    run_child("abandon", &name);

    assert!(matches!(map.read_ints(), Err(MapError::LockAbandoned { .. })));
    assert_eq!(map.read_ints().unwrap(), vec![7]);
    map.write_ints(&[8]).unwrap();
    assert_eq!(map.read_ints().unwrap(), vec![8]);
}

#[test]
fn contending_processes_never_see_torn_frames() {
    let name = unique_name("contend");
    // Keeps the map alive while children attach and detach
    let map = NamedMap::try_open(&name, MapConfig::with_capacity(256)).unwrap();

    let children: Vec<Child> = (0..CONTENDERS)
        .map(|id| spawn_child("contend", &name, id))
        .collect();
    for mut child in children {
        let status = child.wait().unwrap();
        assert!(status.success(), "contending child exited with {}", status);
    }

    let last = map.read_doubles().unwrap();
    assert!(!last.is_empty() && last.iter().all(|v| *v == last[0]));
    map.close().unwrap();
}
