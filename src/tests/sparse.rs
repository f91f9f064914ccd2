use temp_dir::TempDir;

use super::{create_test_cache, install_tracing, seeded_payload};

const MIB: i64 = 1024 * 1024;

#[tokio::test]
async fn available_range_reports_the_written_slice() {
    install_tracing();
    let dir = TempDir::new().expect("temp dir");
    let cache = create_test_cache(dir.path()).await;

    let entry = cache.create_entry("x").await.expect("create should succeed");
    let payload = seeded_payload(5, 4096);
    entry
        .write_sparse_data(MIB, &payload)
        .await
        .expect("sparse write");

    let (start, available) = entry
        .get_available_range(0, (2 * MIB) as i32)
        .await
        .expect("range query");
    assert_eq!(start, MIB);
    assert_eq!(available, 4096);

    // A range past the data comes back empty, anchored at the query offset.
    let (start, available) = entry
        .get_available_range(MIB + 8192, 1024)
        .await
        .expect("range query");
    assert_eq!(start, MIB + 8192);
    assert_eq!(available, 0);

    entry.close();
    cache.shutdown().await.expect("shutdown should succeed");
}

#[tokio::test]
async fn sparse_round_trip_and_zero_fill() {
    install_tracing();
    let dir = TempDir::new().expect("temp dir");
    let cache = create_test_cache(dir.path()).await;

    let entry = cache.create_entry("rt").await.expect("create should succeed");
    let payload = seeded_payload(6, 8192);
    entry
        .write_sparse_data(0, &payload)
        .await
        .expect("sparse write");

    let data = entry.read_sparse_data(0, 8192).await.expect("sparse read");
    assert_eq!(&data[..], &payload[..]);

    // Never-written ranges read back as zeros.
    let data = entry
        .read_sparse_data(64 * 1024, 2048)
        .await
        .expect("sparse read of a hole");
    assert!(data.iter().all(|byte| *byte == 0));

    // A read straddling data and hole sees the data then zeros.
    let data = entry
        .read_sparse_data(4096, 8192)
        .await
        .expect("straddling read");
    assert_eq!(&data[..4096], &payload[4096..]);
    assert!(data[4096..].iter().all(|byte| *byte == 0));

    entry.close();
    cache.shutdown().await.expect("shutdown should succeed");
}

#[tokio::test]
async fn writes_spanning_children() {
    install_tracing();
    let dir = TempDir::new().expect("temp dir");
    let cache = create_test_cache(dir.path()).await;

    let entry = cache.create_entry("span").await.expect("create should succeed");

    // Two children: the last KiB of child 0 plus the first KiB of child 1.
    let payload = seeded_payload(7, 2048);
    let offset = MIB - 1024;
    entry
        .write_sparse_data(offset, &payload)
        .await
        .expect("boundary write");

    let data = entry
        .read_sparse_data(offset, 2048)
        .await
        .expect("boundary read");
    assert_eq!(&data[..], &payload[..]);

    // The run is contiguous across the child boundary.
    let (start, available) = entry
        .get_available_range(offset, 4096)
        .await
        .expect("range query");
    assert_eq!(start, offset);
    assert_eq!(available, 2048);

    // Three children: 1 MiB starting in the middle of child 2.
    let big = seeded_payload(8, (2 * MIB) as usize);
    let offset = 2 * MIB + 512 * 1024;
    entry
        .write_sparse_data(offset, &big)
        .await
        .expect("three-child write");
    let data = entry
        .read_sparse_data(offset, big.len())
        .await
        .expect("three-child read");
    assert_eq!(&data[..], &big[..]);

    entry.close();
    cache.shutdown().await.expect("shutdown should succeed");
}

#[tokio::test]
async fn sparse_data_at_the_four_gigabyte_mark() {
    install_tracing();
    let dir = TempDir::new().expect("temp dir");
    let cache = create_test_cache(dir.path()).await;

    let entry = cache.create_entry("far").await.expect("create should succeed");
    let payload = seeded_payload(9, 4096);
    let offset = 4 * 1024 * MIB;
    entry
        .write_sparse_data(offset, &payload)
        .await
        .expect("far write");

    let data = entry
        .read_sparse_data(offset, 4096)
        .await
        .expect("far read");
    assert_eq!(&data[..], &payload[..]);

    let (start, available) = entry
        .get_available_range(offset - MIB, (2 * MIB) as i32)
        .await
        .expect("range query");
    assert_eq!(start, offset);
    assert_eq!(available, 4096);

    entry.close();
    cache.shutdown().await.expect("shutdown should succeed");
}

#[tokio::test]
async fn sparse_state_survives_reopen() {
    install_tracing();
    let dir = TempDir::new().expect("temp dir");
    let payload = seeded_payload(10, 16 * 1024);

    {
        let cache = create_test_cache(dir.path()).await;
        let entry = cache.create_entry("persist").await.expect("create should succeed");
        entry
            .write_sparse_data(3 * MIB, &payload)
            .await
            .expect("sparse write");
        entry.close();
        cache.shutdown().await.expect("shutdown should succeed");
    }

    let cache = create_test_cache(dir.path()).await;
    let entry = cache.open_entry("persist").await.expect("open should succeed");
    let data = entry
        .read_sparse_data(3 * MIB, payload.len())
        .await
        .expect("sparse read after reopen");
    assert_eq!(&data[..], &payload[..]);

    let (start, available) = entry
        .get_available_range(0, (8 * MIB) as i32)
        .await
        .expect("range query");
    assert_eq!(start, 3 * MIB);
    assert_eq!(available, payload.len() as i32);

    entry.close();
    cache.shutdown().await.expect("shutdown should succeed");
}

#[tokio::test]
async fn dooming_a_parent_removes_its_children() {
    install_tracing();
    let dir = TempDir::new().expect("temp dir");
    let cache = create_test_cache(dir.path()).await;

    let entry = cache.create_entry("parent").await.expect("create should succeed");
    entry
        .write_sparse_data(0, &seeded_payload(11, 4096))
        .await
        .expect("sparse write");
    entry
        .write_sparse_data(5 * MIB, &seeded_payload(12, 4096))
        .await
        .expect("sparse write");

    // The parent plus two children.
    assert!(cache.get_entry_count().await.expect("count") >= 3);

    cache.doom_entry("parent").await.expect("doom parent");
    entry.close();

    assert_eq!(cache.get_entry_count().await.expect("count"), 0);
    assert!(cache.self_check().await.expect("self check") >= 0);

    cache.shutdown().await.expect("shutdown should succeed");
}

#[tokio::test]
async fn mixing_regular_and_sparse_data_is_rejected() {
    install_tracing();
    let dir = TempDir::new().expect("temp dir");
    let cache = create_test_cache(dir.path()).await;

    let entry = cache.create_entry("mixed").await.expect("create should succeed");
    entry
        .write_data(1, 0, b"regular stream data", false)
        .await
        .expect("regular write");

    let result = entry.write_sparse_data(0, b"sparse now").await;
    assert!(result.is_err(), "sparse I/O over stream data must fail");

    entry.close();
    cache.shutdown().await.expect("shutdown should succeed");
}
