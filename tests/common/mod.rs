use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

use razorfs::Settings;

static COUNTER: AtomicU32 = AtomicU32::new(0);

/// A region name unique across tests and concurrent test binaries.
pub fn unique_region_name(tag: &str) -> String {
    let n = COUNTER.fetch_add(1, Ordering::SeqCst);
    format!("razorfs-it-{}-{tag}-{n}", std::process::id())
}

/// Small-geometry settings for fast tests.
pub fn small_settings(region_name: &str) -> Settings {
    Settings {
        region_name: region_name.to_string(),
        node_capacity: 256,
        string_capacity: 64 * 1024,
        data_capacity: 8 * 1024 * 1024,
        wal_path: None,
        compression_threshold: 65536,
        rebalance_interval: 0,
    }
}
