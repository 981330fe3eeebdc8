//! Demo reader (consumer)
//!
//! Attaches to maps published by `writer` and prints the latest values.
//! Only the most recent write is ever visible; intermediate values are lost.

use melshare::{MapConfig, MapError, NamedMap, OpenMode};
use std::time::Duration;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("melshare=info")),
        )
        .init();

    let name = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "melshare_demo".to_string());
    let config = MapConfig {
        mode: OpenMode::OpenOnly,
        ..MapConfig::default()
    };

    let data = match NamedMap::try_open(&name, config.clone()) {
        Ok(map) => map,
        Err(e) => {
            eprintln!("[Reader] Failed to open '{}': {}", name, e);
            eprintln!("[Reader] Make sure the writer is running first!");
            std::process::exit(1);
        }
    };
    let status = NamedMap::open(&format!("{}_status", name), config);

    loop {
        match data.read_doubles() {
            Ok(values) if values.is_empty() => println!("[Reader] no data yet"),
            Ok(values) => println!("[Reader] {:?}", values),
            Err(MapError::LockTimeout { .. }) => println!("[Reader] busy, retrying"),
            Err(e) => {
                eprintln!("[Reader] Read failed: {}", e);
                break;
            }
        }
        if let Ok(message) = status.read_text() {
            println!("[Reader] status: {}", message);
        }
        std::thread::sleep(Duration::from_millis(250));
    }
}
