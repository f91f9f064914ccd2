use temp_dir::TempDir;

use super::{create_test_cache, install_tracing, seeded_payload};
use crate::CacheError;

#[tokio::test]
async fn write_close_reopen_read() {
    install_tracing();
    let dir = TempDir::new().expect("temp dir");

    {
        let cache = create_test_cache(dir.path()).await;
        let entry = cache.create_entry("a").await.expect("create should succeed");
        let written = entry
            .write_data(0, 0, b"hello", false)
            .await
            .expect("write should succeed");
        assert_eq!(written, 5);
        entry.close();
        cache.shutdown().await.expect("shutdown should succeed");
    }

    let cache = create_test_cache(dir.path()).await;
    let entry = cache.open_entry("a").await.expect("entry should survive reopen");
    assert_eq!(entry.data_size(0), 5);
    let data = entry.read_data(0, 0, 5).await.expect("read should succeed");
    assert_eq!(&data[..], b"hello");
    cache.shutdown().await.expect("shutdown should succeed");
}

#[tokio::test]
async fn create_then_open_conflicts() {
    install_tracing();
    let dir = TempDir::new().expect("temp dir");
    let cache = create_test_cache(dir.path()).await;

    assert!(matches!(
        cache.open_entry("missing").await,
        Err(CacheError::NotFound)
    ));

    let entry = cache.create_entry("k").await.expect("create should succeed");
    entry.close();

    assert!(matches!(
        cache.create_entry("k").await,
        Err(CacheError::AlreadyExists)
    ));

    let entry = cache
        .open_or_create_entry("k")
        .await
        .expect("open_or_create should find the entry");
    assert_eq!(entry.key(), "k");
    entry.close();

    let entry = cache
        .open_or_create_entry("fresh")
        .await
        .expect("open_or_create should create a missing entry");
    entry.close();

    cache.shutdown().await.expect("shutdown should succeed");
}

#[tokio::test]
async fn doomed_entry_stays_readable_until_closed() {
    install_tracing();
    let dir = TempDir::new().expect("temp dir");
    let cache = create_test_cache(dir.path()).await;

    let entry = cache.create_entry("y").await.expect("create should succeed");
    entry
        .write_data(0, 0, b"still here", false)
        .await
        .expect("write should succeed");

    cache.doom_entry("y").await.expect("doom should succeed");
    assert!(entry.is_doomed());

    // The open handle keeps serving data.
    let data = entry.read_data(0, 0, 10).await.expect("read should succeed");
    assert_eq!(&data[..], b"still here");

    entry.close();
    assert!(matches!(
        cache.open_entry("y").await,
        Err(CacheError::NotFound)
    ));

    cache.shutdown().await.expect("shutdown should succeed");
}

#[tokio::test]
async fn stream_boundaries() {
    install_tracing();
    let dir = TempDir::new().expect("temp dir");
    let cache = create_test_cache(dir.path()).await;
    let entry = cache.create_entry("sizes").await.expect("create should succeed");

    // A zero-length write at offset zero is a no-op, not an error.
    assert_eq!(
        entry.write_data(0, 0, b"", false).await.expect("empty write"),
        0
    );
    assert_eq!(entry.data_size(0), 0);

    // Exactly one block-file maximum record.
    let block_sized = seeded_payload(1, 16 * 1024);
    entry
        .write_data(0, 0, &block_sized, false)
        .await
        .expect("16 KiB write");
    assert_eq!(entry.data_size(0), 16 * 1024);

    // Extending past 16 KiB moves the stream to an external file.
    let tail = seeded_payload(2, 8 * 1024);
    entry
        .write_data(0, 16 * 1024, &tail, false)
        .await
        .expect("extending write");
    assert_eq!(entry.data_size(0), 24 * 1024);

    let head = entry.read_data(0, 0, 16 * 1024).await.expect("read head");
    assert_eq!(&head[..], &block_sized[..]);
    let read_tail = entry
        .read_data(0, 16 * 1024, 8 * 1024)
        .await
        .expect("read tail");
    assert_eq!(&read_tail[..], &tail[..]);

    // Reads are clipped at the end of the stream.
    let clipped = entry
        .read_data(0, 20 * 1024, 64 * 1024)
        .await
        .expect("clipped read");
    assert_eq!(clipped.len(), 4 * 1024);

    // Truncating to zero releases the storage.
    entry
        .write_data(0, 0, b"", true)
        .await
        .expect("truncate to zero");
    assert_eq!(entry.data_size(0), 0);

    entry.close();
    cache.shutdown().await.expect("shutdown should succeed");
}

#[tokio::test]
async fn shrinking_truncate_reallocates() {
    install_tracing();
    let dir = TempDir::new().expect("temp dir");
    let cache = create_test_cache(dir.path()).await;
    let entry = cache.create_entry("shrink").await.expect("create should succeed");

    let big = seeded_payload(3, 40 * 1024);
    entry
        .write_data(1, 0, &big, false)
        .await
        .expect("external write");
    assert_eq!(entry.data_size(1), 40 * 1024);

    // Shrink below the block-file threshold.
    entry
        .write_data(1, 1024, &big[1024..2048], true)
        .await
        .expect("shrinking write");
    assert_eq!(entry.data_size(1), 2048);

    let data = entry.read_data(1, 0, 2048).await.expect("read after shrink");
    assert_eq!(&data[..], &big[..2048]);

    entry.close();
    cache.shutdown().await.expect("shutdown should succeed");
}

#[tokio::test]
async fn streams_are_independent() {
    install_tracing();
    let dir = TempDir::new().expect("temp dir");
    let cache = create_test_cache(dir.path()).await;
    let entry = cache.create_entry("multi").await.expect("create should succeed");

    let payloads = [
        seeded_payload(10, 100),
        seeded_payload(11, 3000),
        seeded_payload(12, 700),
    ];
    for (stream, payload) in payloads.iter().enumerate() {
        entry
            .write_data(stream, 0, payload, false)
            .await
            .expect("stream write");
    }
    for (stream, payload) in payloads.iter().enumerate() {
        let data = entry
            .read_data(stream, 0, payload.len())
            .await
            .expect("stream read");
        assert_eq!(&data[..], &payload[..], "stream {stream} mismatch");
    }

    assert!(matches!(
        entry.read_data(7, 0, 10).await,
        Err(CacheError::InvalidArgument { .. })
    ));

    entry.close();
    cache.shutdown().await.expect("shutdown should succeed");
}

#[tokio::test]
async fn key_length_boundaries() {
    install_tracing();
    let dir = TempDir::new().expect("temp dir");

    // One character, the single-slot boundary, the multi-slot inline
    // maximum, just past it, and a key too big for any block record.
    let keys: Vec<String> = [1usize, 159, 160, 927, 928, 20_000]
        .iter()
        .map(|len| "k".repeat(*len))
        .collect();

    {
        let cache = create_test_cache(dir.path()).await;
        for (i, key) in keys.iter().enumerate() {
            let entry = cache.create_entry(key).await.expect("create should succeed");
            entry
                .write_data(0, 0, &seeded_payload(i as u8, 64), false)
                .await
                .expect("write should succeed");
            entry.close();
        }
        cache.shutdown().await.expect("shutdown should succeed");
    }

    let cache = create_test_cache(dir.path()).await;
    for (i, key) in keys.iter().enumerate() {
        let entry = cache.open_entry(key).await.expect("key should survive reopen");
        assert_eq!(entry.key(), *key);
        let data = entry.read_data(0, 0, 64).await.expect("read should succeed");
        assert_eq!(&data[..], &seeded_payload(i as u8, 64)[..]);
        entry.close();
    }
    cache.shutdown().await.expect("shutdown should succeed");
}

#[tokio::test]
async fn write_at_offset_fills_gap_with_zeros() {
    install_tracing();
    let dir = TempDir::new().expect("temp dir");
    let cache = create_test_cache(dir.path()).await;
    let entry = cache.create_entry("gap").await.expect("create should succeed");

    entry
        .write_data(0, 1024, b"tail", false)
        .await
        .expect("offset write");
    assert_eq!(entry.data_size(0), 1028);

    let data = entry.read_data(0, 0, 1028).await.expect("read should succeed");
    assert!(data[..1024].iter().all(|byte| *byte == 0));
    assert_eq!(&data[1024..], b"tail");

    entry.close();
    cache.shutdown().await.expect("shutdown should succeed");
}

#[tokio::test]
async fn per_entry_size_limit_is_enforced() {
    install_tracing();
    let dir = TempDir::new().expect("temp dir");
    let config = super::test_config(dir.path())
        .max_size(8 * 1024 * 1024)
        .build()
        .expect("config");
    let cache = crate::CacheBackend::open(config).await.expect("open");

    let entry = cache.create_entry("big").await.expect("create should succeed");
    // The per-entry limit is max_size / 8 = 1 MiB.
    let result = entry
        .write_data(0, 1024 * 1024, b"over the line", false)
        .await;
    assert!(matches!(result, Err(CacheError::InvalidArgument { .. })));

    entry.close();
    cache.shutdown().await.expect("shutdown should succeed");
}
