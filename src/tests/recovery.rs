use temp_dir::TempDir;

use super::{create_test_cache, install_tracing, seeded_payload, test_config};
use crate::{rankings::CrashPoint, CacheBackend, CacheError};

#[tokio::test]
async fn full_round_trip_survives_reopen() {
    install_tracing();
    let dir = TempDir::new().expect("temp dir");

    let payloads: Vec<(String, Vec<u8>)> = (0..12)
        .map(|i| (format!("entry-{i}"), seeded_payload(i as u8, 300 + i * 57)))
        .collect();

    {
        let cache = create_test_cache(dir.path()).await;
        for (key, payload) in &payloads {
            let entry = cache.create_entry(key).await.expect("create should succeed");
            entry
                .write_data(0, 0, payload, false)
                .await
                .expect("write should succeed");
            entry.close();
        }
        cache.shutdown().await.expect("shutdown should succeed");
    }

    let cache = create_test_cache(dir.path()).await;
    assert_eq!(
        cache.get_entry_count().await.expect("count"),
        payloads.len() as i32
    );

    // Every entry is enumerable. Reads are kept out of the enumeration
    // loop: a read refreshes the entry's rank, which moves its node and
    // perturbs a live iterator (the contract is only best effort there).
    let mut seen = Vec::new();
    let mut iterator = cache.create_iterator().await.expect("iterator");
    while let Some(entry) = iterator.open_next_entry().await.expect("next entry") {
        seen.push(entry.key());
        entry.close();
    }
    drop(iterator);

    seen.sort();
    seen.dedup();
    assert_eq!(seen.len(), payloads.len(), "enumeration missed entries");

    // And every entry's data is readable.
    for (key, payload) in &payloads {
        let entry = cache.open_entry(key).await.expect("open should succeed");
        let data = entry
            .read_data(0, 0, payload.len())
            .await
            .expect("read should succeed");
        assert_eq!(&data[..], &payload[..]);
        entry.close();
    }

    assert!(cache.self_check().await.expect("self check") >= 0);
    cache.shutdown().await.expect("shutdown should succeed");
}

#[tokio::test]
async fn crash_during_insert_is_recovered() {
    install_tracing();
    let dir = TempDir::new().expect("temp dir");

    {
        // Halt right after the node store, before the list head moves: the
        // transaction record is left in the index header.
        let config = test_config(dir.path())
            .crash_point(CrashPoint::Insert3)
            .build()
            .expect("config");
        let cache = CacheBackend::open(config).await.expect("open");
        let result = cache.create_entry("a").await;
        assert!(result.is_err(), "the simulated crash should surface");
        cache.kill_for_testing().await;
    }

    // Reopening completes the transaction: the node ends up fully inserted
    // or absent, and the lists agree with their stored sizes either way.
    let cache = create_test_cache(dir.path()).await;
    assert!(cache.self_check().await.expect("self check") >= 0);

    // The interrupted entry is either recovered or was discarded as dirty;
    // both are consistent outcomes.
    match cache.open_entry("a").await {
        Ok(entry) => entry.close(),
        Err(CacheError::NotFound) => {}
        Err(error) => panic!("unexpected error: {error}"),
    }
    assert!(cache.self_check().await.expect("self check") >= 0);

    // The cache is fully usable.
    let entry = cache.create_entry("a2").await.expect("create after recovery");
    entry.close();
    cache.shutdown().await.expect("shutdown should succeed");
}

#[tokio::test]
async fn crash_during_remove_is_recovered() {
    install_tracing();
    let dir = TempDir::new().expect("temp dir");

    {
        let cache = create_test_cache(dir.path()).await;
        for key in ["k1", "k2", "k3"] {
            let entry = cache.create_entry(key).await.expect("create should succeed");
            entry
                .write_data(0, 0, b"payload", false)
                .await
                .expect("write should succeed");
            entry.close();
        }
        cache.shutdown().await.expect("shutdown should succeed");
    }

    {
        let config = test_config(dir.path())
            .crash_point(CrashPoint::Remove1)
            .build()
            .expect("config");
        let cache = CacheBackend::open(config).await.expect("open");
        let result = cache.doom_entry("k2").await;
        assert!(result.is_err(), "the simulated crash should surface");
        cache.kill_for_testing().await;
    }

    let cache = create_test_cache(dir.path()).await;
    assert!(cache.self_check().await.expect("self check") >= 0);

    // The untouched entries are intact.
    for key in ["k1", "k3"] {
        let entry = cache.open_entry(key).await.expect("entry should survive");
        let data = entry.read_data(0, 0, 7).await.expect("read should succeed");
        assert_eq!(&data[..], b"payload");
        entry.close();
    }

    // The half-doomed entry was either reverted or discarded.
    match cache.open_entry("k2").await {
        Ok(entry) => entry.close(),
        Err(CacheError::NotFound) => {}
        Err(error) => panic!("unexpected error: {error}"),
    }

    assert!(cache.self_check().await.expect("self check") >= 0);
    cache.shutdown().await.expect("shutdown should succeed");
}

#[tokio::test]
async fn tail_removal_crash_is_recovered() {
    install_tracing();
    let dir = TempDir::new().expect("temp dir");

    {
        let cache = create_test_cache(dir.path()).await;
        for key in ["a", "b", "c"] {
            let entry = cache.create_entry(key).await.expect("create should succeed");
            entry.close();
        }
        cache.shutdown().await.expect("shutdown should succeed");
    }

    {
        // "a" is the list tail; halt after the new tail is stored but before
        // the rest of the unlink reaches disk.
        let config = test_config(dir.path())
            .crash_point(CrashPoint::Remove6)
            .build()
            .expect("config");
        let cache = CacheBackend::open(config).await.expect("open");
        let result = cache.doom_entry("a").await;
        assert!(result.is_err(), "the simulated crash should surface");
        cache.kill_for_testing().await;
    }

    let cache = create_test_cache(dir.path()).await;
    assert!(cache.self_check().await.expect("self check") >= 0);
    for key in ["b", "c"] {
        let entry = cache.open_entry(key).await.expect("entry should survive");
        entry.close();
    }
    cache.shutdown().await.expect("shutdown should succeed");
}

#[tokio::test]
async fn dirty_entries_are_discarded_on_reopen() {
    install_tracing();
    let dir = TempDir::new().expect("temp dir");

    {
        let cache = create_test_cache(dir.path()).await;
        let clean = cache.create_entry("clean").await.expect("create should succeed");
        clean
            .write_data(0, 0, b"stays", false)
            .await
            .expect("write should succeed");
        clean.close();

        // This one is still open (hence marked dirty on disk) when the
        // process dies.
        let dirty = cache.create_entry("dirty").await.expect("create should succeed");
        dirty
            .write_data(0, 0, b"goes", false)
            .await
            .expect("write should succeed");
        std::mem::forget(dirty);
        cache.kill_for_testing().await;
    }

    let cache = create_test_cache(dir.path()).await;
    let entry = cache.open_entry("clean").await.expect("clean entry survives");
    entry.close();
    assert!(matches!(
        cache.open_entry("dirty").await,
        Err(CacheError::NotFound)
    ));
    cache.shutdown().await.expect("shutdown should succeed");
}
