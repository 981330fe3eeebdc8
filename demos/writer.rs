//! Demo writer (producer)
//!
//! Creates a named map and publishes a slowly changing vector of doubles,
//! plus a status message on a second map. Run `reader` in another terminal
//! with the same name to watch the values.

use melshare::{MapConfig, NamedMap};
use std::time::{Duration, Instant};

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
    let status_name = format!("{}_status", name);

    println!("[Writer] Publishing doubles on '{}' and text on '{}'", name, status_name);

    let data = match NamedMap::try_open(&name, MapConfig::with_capacity(256)) {
        Ok(map) => map,
        Err(e) => {
            eprintln!("[Writer] Failed to open map: {}", e);
            std::process::exit(1);
        }
    };
    let status = NamedMap::open_or_create(&status_name, 128);

    let start = Instant::now();
    for tick in 0u64.. {
        let t = start.elapsed().as_secs_f64();
        let values = [t, t.sin(), t.cos()];

        if let Err(e) = data.write_doubles(&values) {
            eprintln!("[Writer] Write failed: {}", e);
        }
        if tick % 10 == 0 {
            let message = format!("tick {} at {:.1}s", tick, t);
            if let Err(e) = status.write_text(&message) {
                eprintln!("[Writer] Status write failed: {}", e);
            }
        }

        std::thread::sleep(Duration::from_millis(100));
    }
}
