use temp_dir::TempDir;

use super::{create_test_cache, install_tracing, seeded_payload, test_config};
use crate::{CacheBackend, CacheError};

#[tokio::test]
async fn self_check_passes_through_a_mixed_workload() {
    install_tracing();
    let dir = TempDir::new().expect("temp dir");
    let cache = create_test_cache(dir.path()).await;

    for i in 0..30 {
        let entry = cache
            .create_entry(&format!("mixed-{i}"))
            .await
            .expect("create should succeed");
        entry
            .write_data(0, 0, &seeded_payload(i as u8, 64 + i * 13), false)
            .await
            .expect("write should succeed");
        entry.close();
    }
    assert!(cache.self_check().await.expect("self check") >= 0);

    // Re-open a third of them (promotions), doom another third.
    for i in (0..30).step_by(3) {
        let entry = cache
            .open_entry(&format!("mixed-{i}"))
            .await
            .expect("open should succeed");
        entry.close();
    }
    for i in (1..30).step_by(3) {
        cache
            .doom_entry(&format!("mixed-{i}"))
            .await
            .expect("doom should succeed");
    }

    assert!(cache.self_check().await.expect("self check") >= 0);
    assert_eq!(cache.get_entry_count().await.expect("count"), 20);

    cache.shutdown().await.expect("shutdown should succeed");
}

#[tokio::test]
async fn colliding_buckets_keep_every_entry_reachable() {
    install_tracing();
    let dir = TempDir::new().expect("temp dir");
    // A tiny mask forces long bucket chains.
    let config = test_config(dir.path()).mask(0xf).build().expect("config");
    let cache = CacheBackend::open(config).await.expect("open");

    let keys: Vec<String> = (0..64).map(|i| format!("chain/{i}")).collect();
    for key in &keys {
        let entry = cache.create_entry(key).await.expect("create should succeed");
        entry
            .write_data(0, 0, key.as_bytes(), false)
            .await
            .expect("write should succeed");
        entry.close();
    }

    // Every entry is reachable through its (crowded) chain.
    for key in &keys {
        let entry = cache.open_entry(key).await.expect("open should succeed");
        let data = entry
            .read_data(0, 0, key.len())
            .await
            .expect("read should succeed");
        assert_eq!(&data[..], key.as_bytes());
        entry.close();
    }

    // Dooming from the middle of chains keeps the rest linked.
    for key in keys.iter().step_by(2) {
        cache.doom_entry(key).await.expect("doom should succeed");
    }
    for (i, key) in keys.iter().enumerate() {
        let result = cache.open_entry(key).await;
        if i % 2 == 0 {
            assert!(matches!(result, Err(CacheError::NotFound)), "{key} should be gone");
        } else {
            result.expect("odd entries should remain").close();
        }
    }

    assert!(cache.self_check().await.expect("self check") >= 0);
    cache.shutdown().await.expect("shutdown should succeed");
}

#[tokio::test]
async fn read_after_write_is_byte_identical() {
    install_tracing();
    let dir = TempDir::new().expect("temp dir");
    let cache = create_test_cache(dir.path()).await;
    let entry = cache.create_entry("raw").await.expect("create should succeed");

    // Overlapping writes at assorted offsets; the final state is what the
    // last writer left at each position.
    let mut model = vec![0u8; 6000];
    let writes = [
        (0usize, seeded_payload(1, 1000)),
        (500, seeded_payload(2, 2000)),
        (2000, seeded_payload(3, 4000)),
        (100, seeded_payload(4, 50)),
    ];
    for (offset, payload) in &writes {
        entry
            .write_data(0, *offset as i64, payload, false)
            .await
            .expect("write should succeed");
        model[*offset..*offset + payload.len()].copy_from_slice(payload);
    }

    assert_eq!(entry.data_size(0), 6000);
    let data = entry.read_data(0, 0, 6000).await.expect("read should succeed");
    assert_eq!(&data[..], &model[..]);

    // Partial reads see the same bytes.
    let data = entry.read_data(0, 450, 200).await.expect("partial read");
    assert_eq!(&data[..], &model[450..650]);

    entry.close();
    cache.shutdown().await.expect("shutdown should succeed");
}

#[tokio::test]
async fn byte_accounting_tracks_stored_data() {
    install_tracing();
    let dir = TempDir::new().expect("temp dir");
    let cache = create_test_cache(dir.path()).await;

    assert_eq!(cache.calculate_size_of_all_entries().await.expect("size"), 0);

    let entry = cache.create_entry("acct").await.expect("create should succeed");
    entry
        .write_data(0, 0, &seeded_payload(1, 4096), false)
        .await
        .expect("write should succeed");
    entry.close();

    // After the close everything is reported: key bytes plus stream bytes.
    let size = cache.calculate_size_of_all_entries().await.expect("size");
    assert_eq!(size, 4096 + "acct".len() as i64);

    cache.doom_entry("acct").await.expect("doom should succeed");
    assert_eq!(cache.calculate_size_of_all_entries().await.expect("size"), 0);

    cache.shutdown().await.expect("shutdown should succeed");
}

#[tokio::test]
async fn enumeration_is_ordered_by_recency() {
    install_tracing();
    let dir = TempDir::new().expect("temp dir");
    let cache = create_test_cache(dir.path()).await;

    for key in ["first", "second", "third"] {
        let entry = cache.create_entry(key).await.expect("create should succeed");
        entry.close();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    // Touch "first" so it becomes the most recent.
    cache
        .open_entry("first")
        .await
        .expect("open should succeed")
        .close();

    let mut order = Vec::new();
    let mut iterator = cache.create_iterator().await.expect("iterator");
    while let Some(entry) = iterator.open_next_entry().await.expect("next entry") {
        order.push(entry.key());
        entry.close();
    }
    assert_eq!(order, ["first", "third", "second"]);

    cache.shutdown().await.expect("shutdown should succeed");
}
