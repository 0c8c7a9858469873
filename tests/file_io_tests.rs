#![allow(clippy::unwrap_used, clippy::expect_used, missing_docs)]

mod common;

use std::collections::HashMap;
use std::sync::atomic::Ordering;

use blobfs::fs::FsConfig;
use bytes::Bytes;

use common::{mount, pattern};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn write_then_read_returns_the_bytes() {
    let h = mount(FsConfig::default()).await;
    let root = h.fs.root().await;
    let inode = h.fs.create_file(&root, "f", 0o644).await.expect("create");

    inode.write(0, b"hello world").await.expect("write");
    assert_eq!(&inode.read(0, 1024).await.expect("read")[..], b"hello world");

    // Still true after the flusher has had its way with the file.
    inode.sync().await.expect("flush");
    assert_eq!(&inode.read(0, 1024).await.expect("read")[..], b"hello world");
    assert_eq!(h.backend.blob_bytes("f").as_deref(), Some(&b"hello world"[..]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn overlapping_writes_resolve_to_program_order() {
    let h = mount(FsConfig::default()).await;
    let root = h.fs.root().await;
    let inode = h.fs.create_file(&root, "f", 0o644).await.expect("create");

    inode.write(0, b"aaaaaaaaaa").await.expect("write");
    inode.write(2, b"bbbb").await.expect("write");
    inode.write(4, b"cc").await.expect("write");
    assert_eq!(&inode.read(0, 10).await.expect("read")[..], b"aabbccbbaa");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn write_past_the_end_reads_back_a_zero_gap() {
    let h = mount(FsConfig::default()).await;
    let root = h.fs.root().await;
    let inode = h.fs.create_file(&root, "f", 0o644).await.expect("create");

    inode.write(0, b"ab").await.expect("write");
    inode.write(6, b"z").await.expect("write");

    let data = inode.read(0, 16).await.expect("read");
    assert_eq!(&data[..], b"ab\0\0\0\0z");
    assert_eq!(inode.getattr().await.size, 7);

    inode.sync().await.expect("flush");
    assert_eq!(h.backend.blob_bytes("f").as_deref(), Some(&b"ab\0\0\0\0z"[..]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reads_of_remote_objects_fetch_and_cache() {
    let h = mount(FsConfig::default()).await;
    let body = pattern(10_000);
    h.backend.insert_blob("big", body.clone(), HashMap::new());

    let root = h.fs.root().await;
    let inode = h.fs.lookup(&root, "big").await.expect("lookup");

    let slice = inode.read(4000, 100).await.expect("read");
    assert_eq!(&slice[..], &body[4000..4100]);
    let gets_after_first = h.backend.calls.get.load(Ordering::Relaxed);
    assert!(gets_after_first >= 1);

    // The same range again is served from the buffer cache.
    let again = inode.read(4000, 100).await.expect("read again");
    assert_eq!(&again[..], &body[4000..4100]);
    assert_eq!(
        h.backend.calls.get.load(Ordering::Relaxed),
        gets_after_first,
        "a cached range must not refetch"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reads_clamp_to_file_size() {
    let h = mount(FsConfig::default()).await;
    h.backend
        .insert_blob("short", Bytes::from_static(b"abc"), HashMap::new());
    let root = h.fs.root().await;
    let inode = h.fs.lookup(&root, "short").await.expect("lookup");

    assert_eq!(&inode.read(0, 1024).await.expect("read")[..], b"abc");
    assert!(inode.read(3, 10).await.expect("read at eof").is_empty());
    assert!(inode.read(100, 10).await.expect("read past eof").is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn truncate_shrinks_and_extends_with_zeros() {
    let h = mount(FsConfig::default()).await;
    let root = h.fs.root().await;
    let inode = h.fs.create_file(&root, "f", 0o644).await.expect("create");
    inode.write(0, b"0123456789").await.expect("write");

    inode.truncate(4).await.expect("shrink");
    assert_eq!(inode.getattr().await.size, 4);
    assert_eq!(&inode.read(0, 16).await.expect("read")[..], b"0123");

    inode.truncate(8).await.expect("extend");
    assert_eq!(&inode.read(0, 16).await.expect("read")[..], b"0123\0\0\0\0");

    inode.sync().await.expect("flush");
    assert_eq!(
        h.backend.blob_bytes("f").as_deref(),
        Some(&b"0123\0\0\0\0"[..])
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn truncate_to_zero_releases_everything() {
    let h = mount(FsConfig::default()).await;
    let root = h.fs.root().await;
    let inode = h.fs.create_file(&root, "f", 0o644).await.expect("create");
    inode.write(0, b"data").await.expect("write");

    inode.truncate(0).await.expect("truncate");
    assert_eq!(inode.getattr().await.size, 0);
    assert!(inode.read(0, 16).await.expect("read").is_empty());

    inode.sync().await.expect("flush");
    assert_eq!(h.backend.blob_bytes("f").as_deref(), Some(&b""[..]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_writers_and_flushes_converge() {
    let h = mount(FsConfig::default()).await;
    let root = h.fs.root().await;
    let inode = h.fs.create_file(&root, "f", 0o644).await.expect("create");

    // Interleave writes with the background flusher's PUTs; the final
    // content must reflect every write.
    for round in 0u8..20 {
        let chunk = vec![round; 64];
        inode
            .write(u64::from(round) * 64, &chunk)
            .await
            .expect("write");
        if round % 5 == 0 {
            tokio::task::yield_now().await;
        }
    }
    inode.sync().await.expect("final flush");

    let stored = h.backend.blob_bytes("f").expect("object exists");
    assert_eq!(stored.len(), 20 * 64);
    for round in 0u8..20 {
        let start = usize::from(round) * 64;
        assert!(
            stored[start..start + 64].iter().all(|&b| b == round),
            "round {round} bytes must survive flush interleaving"
        );
    }
}
