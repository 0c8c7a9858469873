#![allow(clippy::unwrap_used, clippy::expect_used, missing_docs)]

mod common;

use std::collections::HashMap;

use blobfs::fs::{FileMode, FsConfig};
use bytes::Bytes;

use common::{eventually, mount};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn forgetting_a_cached_inode_releases_it() {
    let h = mount(FsConfig::default()).await;
    h.backend
        .insert_blob("file", Bytes::from_static(b"some cached bytes"), HashMap::new());
    let root = h.fs.root().await;
    let inode = h.fs.lookup(&root, "file").await.expect("lookup");
    let ino = inode.id();

    // Populate buffers so the release actually has something to drop.
    let _ = inode.read(0, 64).await.expect("read");
    assert!(!inode.lock_state().await.buffers.is_empty());
    assert_eq!(inode.refcount(), 2, "kernel + child table");

    h.fs.forget(ino, 2).await;

    assert!(
        h.fs.get_inode(ino).await.is_none(),
        "a cached inode with no references leaves the table"
    );
    assert_eq!(h.fs.forgotten(), 1);
    assert!(
        inode.lock_state().await.buffers.is_empty(),
        "buffers are released with the inode"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn forgetting_a_dirty_inode_defers_to_the_flusher() {
    let h = mount(FsConfig::default()).await;
    let root = h.fs.root().await;

    h.backend.set_fail_writes(true);
    let inode = h.fs.create_file(&root, "f", 0o644).await.expect("create");
    // The failing create flush may have posted an error already; a surfaced
    // error clears, so at most one retry is needed.
    if inode.write(0, b"pending").await.is_err() {
        inode.write(0, b"pending").await.expect("write after surfacing");
    }
    let ino = inode.id();

    h.fs.forget(ino, 2).await;
    assert_eq!(inode.refcount(), 0);
    assert!(
        h.fs.get_inode(ino).await.is_some(),
        "an inode with unflushed changes must survive its last forget"
    );

    // Once the store recovers, the flusher uploads and reaps.
    h.backend.set_fail_writes(false);
    h.fs.wakeup_flusher();
    eventually("flusher uploads and reaps", || {
        h.backend.blob_bytes("f").as_deref() == Some(&b"pending"[..])
    })
    .await;
    eventually("inode reaped", || {
        // The table read is async; probe through the forget counter.
        h.fs.forgotten() >= 1
    })
    .await;
    assert!(h.fs.get_inode(ino).await.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn mode_changes_round_trip_through_metadata() {
    let config = FsConfig {
        enable_perms: true,
        enable_specials: true,
        ..FsConfig::default()
    };
    let h = mount(config).await;
    let root = h.fs.root().await;
    let inode = h.fs.create_file(&root, "bin", 0o644).await.expect("create");

    let changed = inode
        .set_file_mode(FileMode::from_bits(libc::S_IFREG | 0o755))
        .await
        .expect("chmod");
    assert!(changed);

    let st = inode.lock_state().await;
    assert_eq!(st.attrs.mode.perm(), 0o755);
    let stored = st
        .user_metadata
        .as_ref()
        .and_then(|m| m.get("mode"))
        .expect("mode attribute recorded");
    assert_eq!(
        std::str::from_utf8(stored).unwrap(),
        format!("{}", 0o755),
        "the mode is persisted as a decimal integer"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn chmod_to_the_default_clears_the_attribute() {
    let config = FsConfig {
        enable_perms: true,
        ..FsConfig::default()
    };
    let h = mount(config).await;
    let root = h.fs.root().await;
    let inode = h.fs.create_file(&root, "f", 0o644).await.expect("create");

    inode
        .set_file_mode(FileMode::from_bits(0o600))
        .await
        .expect("chmod away");
    inode
        .set_file_mode(FileMode::from_bits(0o644))
        .await
        .expect("chmod back");

    let st = inode.lock_state().await;
    assert!(
        st.user_metadata
            .as_ref()
            .is_none_or(|m| !m.contains_key("mode")),
        "the default mode needs no attribute"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn mode_type_flips_are_rejected() {
    let config = FsConfig {
        enable_specials: true,
        ..FsConfig::default()
    };
    let h = mount(config).await;
    let root = h.fs.root().await;
    let dir = h.fs.mkdir(&root, "d", 0o755).await.expect("mkdir");
    let file = h.fs.create_file(&root, "f", 0o644).await.expect("create");

    assert!(
        dir.set_file_mode(FileMode::from_bits(libc::S_IFREG | 0o644))
            .await
            .is_err(),
        "a directory cannot become a file"
    );
    assert!(
        file.set_file_mode(FileMode::from_bits(libc::S_IFDIR | 0o755))
            .await
            .is_err(),
        "a file cannot become a directory"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unlink_deletes_remotely_and_reaps() {
    let h = mount(FsConfig::default()).await;
    let root = h.fs.root().await;
    let inode = h.fs.create_file(&root, "f", 0o644).await.expect("create");
    inode.write(0, b"x").await.expect("write");
    inode.sync().await.expect("flush");
    assert!(h.backend.contains("f"));
    let ino = inode.id();

    h.fs.unlink(&root, "f").await.expect("unlink");
    eventually("remote delete lands", || !h.backend.contains("f")).await;

    // The kernel still holds its lookup reference; dropping it releases
    // the inode.
    h.fs.forget(ino, 1).await;
    eventually("inode reaped", || h.fs.forgotten() >= 1).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rename_keeps_data_readable_and_commits_remotely() {
    let h = mount(FsConfig::default()).await;
    h.backend
        .insert_blob("old-name", Bytes::from_static(b"the payload"), HashMap::new());
    let root = h.fs.root().await;
    let inode = h.fs.lookup(&root, "old-name").await.expect("lookup");

    h.fs
        .rename(&root, "old-name", &root, "new-name")
        .await
        .expect("rename");

    // The data stays readable while the move is staged.
    assert_eq!(&inode.read(0, 64).await.expect("read")[..], b"the payload");

    inode.sync().await.expect("rename commits");
    eventually("destination exists", || h.backend.contains("new-name")).await;
    eventually("source removed", || !h.backend.contains("old-name")).await;
    assert_eq!(
        h.backend.blob_bytes("new-name").as_deref(),
        Some(&b"the payload"[..])
    );

    // Post-commit reads resolve through the new key.
    assert_eq!(&inode.read(0, 64).await.expect("read")[..], b"the payload");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn symlinks_round_trip_through_the_reserved_attribute() {
    let h = mount(FsConfig::default()).await;
    let root = h.fs.root().await;
    let link = h
        .fs
        .symlink(&root, "link", "target/file.txt")
        .await
        .expect("symlink");

    assert_eq!(link.getattr().await.kind, fuser::FileType::Symlink);
    assert_eq!(
        link.readlink().await.expect("readlink"),
        b"target/file.txt".to_vec()
    );

    link.sync().await.expect("flush");

    // A second client resolves the link from blob metadata.
    let other = common::remount(FsConfig::default(), &h.backend).await;
    let root2 = other.fs.root().await;
    let link2 = other.fs.lookup(&root2, "link").await.expect("lookup");
    assert_eq!(link2.getattr().await.kind, fuser::FileType::Symlink);
    assert_eq!(
        link2.readlink().await.expect("readlink after round trip"),
        b"target/file.txt".to_vec()
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn readdir_serves_the_local_child_table() {
    let h = mount(FsConfig::default()).await;
    let root = h.fs.root().await;
    h.fs.mkdir(&root, "sub", 0o755).await.expect("mkdir");
    h.fs.create_file(&root, "b.txt", 0o644).await.expect("create");
    h.fs.create_file(&root, "a.txt", 0o644).await.expect("create");

    let entries = h.fs.readdir_local(&root).await.expect("readdir");
    let names: Vec<&str> = entries.iter().map(|(n, _, _)| n.as_str()).collect();
    assert_eq!(names, vec!["a.txt", "b.txt", "sub"], "sorted by name");
    let (_, _, sub_is_dir) = &entries[2];
    assert!(sub_is_dir);

    h.fs.unlink(&root, "a.txt").await.expect("unlink");
    let after = h.fs.readdir_local(&root).await.expect("readdir");
    assert_eq!(after.len(), 2, "tombstoned children disappear");
}
