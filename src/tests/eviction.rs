use std::time::{Duration, SystemTime};

use temp_dir::TempDir;

use super::{create_test_cache, install_tracing, seeded_payload, test_config};
use crate::{CacheBackend, CacheError};

#[tokio::test]
async fn byte_budget_keeps_newest_entries() {
    install_tracing();
    let dir = TempDir::new().expect("temp dir");
    let config = test_config(dir.path())
        .max_size(10 * 1024)
        .build()
        .expect("config");
    let cache = CacheBackend::open(config).await.expect("open");

    let keys: Vec<String> = (0..20).map(|i| format!("k{i}")).collect();
    let payload = seeded_payload(7, 1024);
    for key in &keys {
        let entry = cache.create_entry(key).await.expect("create should succeed");
        entry
            .write_data(0, 0, &payload, false)
            .await
            .expect("write should succeed");
        entry.close();
    }

    let count = cache.get_entry_count().await.expect("entry count");
    assert!(count <= 10, "expected at most 10 entries, got {count}");
    assert!(count >= 1, "eviction should not empty the cache mid-insert");

    // Only keys from the newest half may have survived.
    for (i, key) in keys.iter().enumerate() {
        match cache.open_entry(key).await {
            Ok(entry) => {
                assert!(i >= 10, "old entry {key} should have been evicted first");
                entry.close();
            }
            Err(CacheError::NotFound) => {}
            Err(error) => panic!("unexpected error opening {key}: {error}"),
        }
    }

    let size = cache
        .calculate_size_of_all_entries()
        .await
        .expect("size accounting");
    assert!(size <= 10 * 1024 + 1024, "size {size} over budget");

    cache.shutdown().await.expect("shutdown should succeed");
}

#[tokio::test]
async fn classic_eviction_also_enforces_budget() {
    install_tracing();
    let dir = TempDir::new().expect("temp dir");
    let config = test_config(dir.path())
        .max_size(10 * 1024)
        .new_eviction(false)
        .build()
        .expect("config");
    let cache = CacheBackend::open(config).await.expect("open");

    let payload = seeded_payload(9, 1024);
    for i in 0..20 {
        let entry = cache
            .create_entry(&format!("c{i}"))
            .await
            .expect("create should succeed");
        entry
            .write_data(0, 0, &payload, false)
            .await
            .expect("write should succeed");
        entry.close();
    }

    let count = cache.get_entry_count().await.expect("entry count");
    assert!(count <= 10, "expected at most 10 entries, got {count}");

    cache.shutdown().await.expect("shutdown should succeed");
}

#[tokio::test]
async fn doom_all_entries_empties_the_cache() {
    install_tracing();
    let dir = TempDir::new().expect("temp dir");
    let cache = create_test_cache(dir.path()).await;

    // Dooming an empty cache is fine.
    cache.doom_all_entries().await.expect("doom empty cache");

    for i in 0..5 {
        let entry = cache
            .create_entry(&format!("d{i}"))
            .await
            .expect("create should succeed");
        entry
            .write_data(0, 0, b"payload", false)
            .await
            .expect("write should succeed");
        entry.close();
    }
    assert_eq!(cache.get_entry_count().await.expect("count"), 5);

    cache.doom_all_entries().await.expect("doom all");
    assert_eq!(cache.get_entry_count().await.expect("count"), 0);
    assert_eq!(
        cache.calculate_size_of_all_entries().await.expect("size"),
        0
    );

    // The cache keeps working afterwards.
    let entry = cache.create_entry("after").await.expect("create after doom");
    entry.close();
    assert_eq!(cache.get_entry_count().await.expect("count"), 1);

    cache.shutdown().await.expect("shutdown should succeed");
}

#[tokio::test]
async fn doom_all_with_open_handles_trims_everything() {
    install_tracing();
    let dir = TempDir::new().expect("temp dir");
    let cache = create_test_cache(dir.path()).await;

    let held = cache.create_entry("held").await.expect("create should succeed");
    for i in 0..3 {
        let entry = cache
            .create_entry(&format!("o{i}"))
            .await
            .expect("create should succeed");
        entry.close();
    }

    cache.doom_all_entries().await.expect("doom all");

    // The held entry survives until its handle goes away.
    held.close();
    assert!(matches!(
        cache.open_entry("held").await,
        Err(CacheError::NotFound)
    ));

    cache.shutdown().await.expect("shutdown should succeed");
}

#[tokio::test]
async fn doom_entries_between_removes_the_time_slice() {
    install_tracing();
    let dir = TempDir::new().expect("temp dir");
    let cache = create_test_cache(dir.path()).await;

    let mut marks: Vec<SystemTime> = Vec::new();
    for i in 0..4 {
        marks.push(SystemTime::now());
        tokio::time::sleep(Duration::from_millis(20)).await;
        let entry = cache
            .create_entry(&format!("t{i}"))
            .await
            .expect("create should succeed");
        entry.close();
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    marks.push(SystemTime::now());

    // Everything used inside [marks[1], marks[3]) goes: t1 and t2.
    cache
        .doom_entries_between(marks[1], marks[3])
        .await
        .expect("doom between");

    assert!(cache.open_entry("t0").await.is_ok());
    assert!(matches!(
        cache.open_entry("t1").await,
        Err(CacheError::NotFound)
    ));
    assert!(matches!(
        cache.open_entry("t2").await,
        Err(CacheError::NotFound)
    ));
    assert!(cache.open_entry("t3").await.is_ok());

    cache.shutdown().await.expect("shutdown should succeed");
}

#[tokio::test]
async fn doom_entries_since_removes_the_newest() {
    install_tracing();
    let dir = TempDir::new().expect("temp dir");
    let cache = create_test_cache(dir.path()).await;

    let old = cache.create_entry("old").await.expect("create should succeed");
    old.close();
    tokio::time::sleep(Duration::from_millis(20)).await;
    let cutoff = SystemTime::now();
    tokio::time::sleep(Duration::from_millis(20)).await;
    let new = cache.create_entry("new").await.expect("create should succeed");
    new.close();

    cache
        .doom_entries_since(cutoff)
        .await
        .expect("doom since cutoff");

    assert!(cache.open_entry("old").await.is_ok());
    assert!(matches!(
        cache.open_entry("new").await,
        Err(CacheError::NotFound)
    ));

    cache.shutdown().await.expect("shutdown should succeed");
}

#[tokio::test]
async fn reopened_entries_are_promoted() {
    install_tracing();
    let dir = TempDir::new().expect("temp dir");
    let cache = create_test_cache(dir.path()).await;

    // Heavily reused entries should outlive one-shot entries even when they
    // are older.
    let keeper = cache.create_entry("keeper").await.expect("create");
    keeper
        .write_data(0, 0, &seeded_payload(1, 512), false)
        .await
        .expect("write");
    keeper.close();
    for _ in 0..12 {
        let entry = cache.open_entry("keeper").await.expect("reopen keeper");
        entry.close();
    }

    let entry = cache.open_entry("keeper").await.expect("keeper stays");
    entry.close();

    cache.shutdown().await.expect("shutdown should succeed");
}
