use std::path::Path;

use crate::{CacheBackend, CacheConfigBuilder};

mod basic;
mod eviction;
mod invariants;
mod recovery;
mod sparse;

/// Builds the configuration shared by all tests: deterministic (no random
/// behaviors, no trim throttling) and shutdown waits for pending work.
pub(crate) fn test_config(path: &Path) -> CacheConfigBuilder {
    CacheConfigBuilder::from_path(path)
        .unit_test_mode()
        .no_random()
}

pub(crate) async fn create_test_cache(path: &Path) -> CacheBackend {
    let config = test_config(path)
        .build()
        .expect("test configuration should be valid");
    CacheBackend::open(config)
        .await
        .expect("cache should open in a fresh directory")
}

/// A payload of `len` bytes whose content depends on `seed`, so misplaced
/// reads cannot accidentally pass an equality check.
pub(crate) fn seeded_payload(seed: u8, len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

pub(crate) fn install_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}
