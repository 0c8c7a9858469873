#![allow(clippy::unwrap_used, clippy::expect_used, missing_docs)]

mod common;

use std::collections::HashMap;
use std::sync::atomic::Ordering;

use blobfs::fs::buffer::BufferState;
use blobfs::fs::{CacheState, FsConfig};
use bytes::Bytes;

use common::{eventually, mount, pattern, remount, tiny_multipart_config};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn created_files_reach_the_store_without_an_explicit_sync() {
    let h = mount(FsConfig::default()).await;
    let root = h.fs.root().await;
    let inode = h.fs.create_file(&root, "f", 0o644).await.expect("create");
    inode.write(0, b"payload").await.expect("write");

    eventually("background flush lands", || {
        h.backend.blob_bytes("f").as_deref() == Some(&b"payload"[..])
    })
    .await;
    eventually("state settles", || {
        inode.cache_state() == CacheState::Cached
    })
    .await;

    // The accepted ETag is recorded on the inode.
    let st = inode.lock_state().await;
    assert!(st.known_etag.is_some());
    assert_eq!(st.known_size, 7);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn flush_errors_surface_on_sync_and_clear_on_retry() {
    let h = mount(FsConfig::default()).await;
    let root = h.fs.root().await;
    let inode = h.fs.create_file(&root, "f", 0o644).await.expect("create");
    eventually("create flushed", || inode.cache_state() == CacheState::Cached).await;

    h.backend.set_fail_writes(true);
    inode.write(0, b"doomed").await.expect("write");
    inode
        .sync()
        .await
        .expect_err("a failing upload must surface on sync");

    // The store recovers; the retry succeeds and the error stays gone.
    // The first write may still surface an error the flusher posted just
    // before recovery, so allow a bounded number of attempts.
    h.backend.set_fail_writes(false);
    let mut wrote = false;
    for _ in 0..10 {
        if inode.write(0, b"healed").await.is_ok() {
            wrote = true;
            break;
        }
    }
    assert!(wrote, "writes must succeed once the store recovers");
    inode.sync().await.expect("retry succeeds");
    assert_eq!(h.backend.blob_bytes("f").as_deref(), Some(&b"healed"[..]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn large_files_go_through_multipart() {
    let h = mount(tiny_multipart_config()).await;
    let root = h.fs.root().await;
    let inode = h.fs.create_file(&root, "big", 0o644).await.expect("create");

    let body = pattern(35);
    inode.write(0, &body).await.expect("write");
    inode.sync().await.expect("flush");

    assert_eq!(h.backend.blob_bytes("big").as_deref(), Some(&body[..]));
    assert!(
        h.backend.calls.upload_part.load(Ordering::Relaxed) >= 5,
        "35 bytes at 8-byte parts is four full parts plus a tail"
    );
    assert_eq!(h.backend.calls.complete.load(Ordering::Relaxed), 1);
    assert_eq!(h.backend.open_uploads(), 0, "no upload left dangling");

    // Another client reads the assembled object.
    let other = remount(tiny_multipart_config(), &h.backend).await;
    let root2 = other.fs.root().await;
    let inode2 = other.fs.lookup(&root2, "big").await.expect("lookup");
    assert_eq!(&inode2.read(0, 64).await.expect("read")[..], &body[..]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dirtying_an_uploaded_part_reuploads_it() {
    let h = mount(tiny_multipart_config()).await;
    let root = h.fs.root().await;
    let inode = h.fs.create_file(&root, "big", 0o644).await.expect("create");

    // Keep a handle open so the flusher uploads full parts but does not
    // finalize.
    let handle = inode.open().await.expect("open");
    let body = pattern(35);
    inode.write(0, &body).await.expect("write");

    eventually("full parts uploaded", || {
        h.backend.calls.upload_part.load(Ordering::Relaxed) >= 4
    })
    .await;
    let parts_before = h.backend.calls.upload_part.load(Ordering::Relaxed);

    // Overwrite bytes inside the first (already uploaded) part.
    inode.write(2, b"XYZ").await.expect("overwrite");
    handle.release().await;
    inode.sync().await.expect("finalize");

    let mut expected = body.to_vec();
    expected[2..5].copy_from_slice(b"XYZ");
    assert_eq!(h.backend.blob_bytes("big").as_deref(), Some(&expected[..]));
    assert!(
        h.backend.calls.upload_part.load(Ordering::Relaxed) > parts_before,
        "the dirtied part must be uploaded again"
    );
    assert_eq!(h.backend.open_uploads(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn memory_pressure_clears_flushed_full_parts() {
    let cache_dir = tempfile::tempdir().expect("tempdir");
    let config = FsConfig {
        memory_limit: 16,
        cache_dir: Some(cache_dir.path().to_path_buf()),
        ..tiny_multipart_config()
    };
    let h = mount(config).await;
    let root = h.fs.root().await;
    let inode = h.fs.create_file(&root, "big", 0o644).await.expect("create");

    let handle = inode.open().await.expect("open");
    let body = pattern(32);
    inode.write(0, &body).await.expect("write");

    eventually("parts uploaded", || {
        h.backend.calls.upload_part.load(Ordering::Relaxed) >= 4
    })
    .await;

    let mut cleared = false;
    for _ in 0..400 {
        {
            let st = inode.lock_state().await;
            if st
                .buffers
                .iter()
                .any(|b| b.state == BufferState::FlCleared)
            {
                cleared = true;
                break;
            }
        }
        h.fs.maybe_reclaim();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert!(cleared, "flushed parts should shed their memory under pressure");

    // The cleared bytes are still readable (disk cache or store).
    handle.release().await;
    inode.sync().await.expect("finalize");
    assert_eq!(h.backend.blob_bytes("big").as_deref(), Some(&body[..]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn directories_flush_as_explicit_markers() {
    let h = mount(FsConfig::default()).await;
    let root = h.fs.root().await;
    let dir = h.fs.mkdir(&root, "docs", 0o755).await.expect("mkdir");
    dir.sync().await.expect("flush");
    assert!(h.backend.contains("docs/"), "directories become `/` keys");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn mount_prefix_scopes_every_key() {
    let config = FsConfig {
        mount_prefix: "team/scratch/".to_string(),
        ..FsConfig::default()
    };
    let h = mount(config).await;
    let root = h.fs.root().await;
    let inode = h.fs.create_file(&root, "note", 0o644).await.expect("create");
    inode.write(0, b"hi").await.expect("write");
    inode.sync().await.expect("flush");

    assert!(h.backend.contains("team/scratch/note"));
    assert!(!h.backend.contains("note"));
}
