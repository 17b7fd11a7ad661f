//! End-to-end runs of the relay coordination protocol, with several clients
//! sharing one directory-backed store.

use std::path::Path;
use std::time::Duration;

use ferry_relay::{
    local::LocalStore,
    lock::{LockInfo, LockMode},
    store::BlobStore,
    Accessor, Relay,
};

async fn relay_for(client: &str, root: &Path) -> Relay {
    let store = LocalStore::new(root).await.expect("failed to open store");
    Relay::new(Box::new(store), client.parse().expect("bad client name"))
        .expect("failed to build relay")
        .with_poll_interval(Duration::from_millis(50))
}

async fn raw_store(root: &Path) -> LocalStore {
    LocalStore::new(root).await.expect("failed to open store")
}

async fn relay_names(root: &Path) -> Vec<String> {
    let mut names: Vec<String> = raw_store(root)
        .await
        .list("", true)
        .await
        .expect("failed to list relay")
        .into_iter()
        .map(|entry| entry.name)
        .collect();
    names.sort();
    names
}

#[tokio::test]
async fn single_pusher_single_puller() {
    let relay_dir = tempfile::tempdir().expect("failed to create tempdir");
    let work = tempfile::tempdir().expect("failed to create tempdir");
    let alice = relay_for("alice", relay_dir.path()).await;
    let bravo = relay_for("bravo", relay_dir.path()).await;

    let src = work.path().join("hello.txt");
    std::fs::write(&src, "hi\n").expect("failed to write source");
    assert!(alice
        .push(&src, "hello.txt", Some("1700000000"), true)
        .await
        .expect("push failed"));

    let ready = bravo.list_ready("", true).await.expect("list_ready failed");
    assert_eq!(ready, ["hello.txt"]);

    let dst = work.path().join("incoming/hello.txt");
    assert!(bravo
        .pop("hello.txt", &dst, 1, true)
        .await
        .expect("pop failed"));
    assert_eq!(std::fs::read_to_string(&dst).expect("missing copy"), "hi\n");

    // The single expected puller has the file: nothing stays behind.
    assert!(relay_names(relay_dir.path()).await.is_empty());
}

#[tokio::test]
async fn two_pullers_share_one_push() {
    let relay_dir = tempfile::tempdir().expect("failed to create tempdir");
    let work = tempfile::tempdir().expect("failed to create tempdir");
    let alice = relay_for("alice", relay_dir.path()).await;
    let bravo = relay_for("bravo", relay_dir.path()).await;
    let charlie = relay_for("charlie", relay_dir.path()).await;

    let src = work.path().join("x");
    std::fs::write(&src, "payload").expect("failed to write source");
    assert!(alice
        .push(&src, "x", Some("1700000000"), true)
        .await
        .expect("push failed"));

    // First puller leaves the file in place and signs the placeholder.
    let b_dst = work.path().join("b/x");
    assert!(bravo.pop("x", &b_dst, 2, true).await.expect("pop failed"));
    let placeholder = raw_store(relay_dir.path())
        .await
        .get_bytes(".x.placeholder")
        .await
        .expect("placeholder should survive the first pull");
    assert_eq!(placeholder, b"1700000000\nbravo");
    assert!(relay_names(relay_dir.path()).await.contains(&"x".to_owned()));

    // Second puller completes delivery and clears the relay.
    let c_dst = work.path().join("c/x");
    assert!(charlie.pop("x", &c_dst, 2, true).await.expect("pop failed"));
    assert_eq!(
        std::fs::read_to_string(&c_dst).expect("missing copy"),
        "payload"
    );
    assert!(relay_names(relay_dir.path()).await.is_empty());
}

#[tokio::test]
async fn crashed_push_is_repaired_after_timeout() {
    let relay_dir = tempfile::tempdir().expect("failed to create tempdir");
    let store = raw_store(relay_dir.path()).await;
    // A peer claimed the lock and wrote the placeholder, then died before
    // the file itself arrived; the lock body never made it either.
    store
        .put_bytes(".y.lock", b"")
        .await
        .expect("failed to plant lock");
    store
        .put_bytes(".y.placeholder", b"1700000000")
        .await
        .expect("failed to plant placeholder");

    let bravo = relay_for("bravo", relay_dir.path())
        .await
        .with_lock_timeout(Some(Duration::ZERO));

    // Let the listing mtime age past the (zero) timeout.
    tokio::time::sleep(Duration::from_millis(1200)).await;
    let corrupted = bravo
        .list_corrupted("", true)
        .await
        .expect("list_corrupted failed");
    assert_eq!(corrupted.len(), 1);
    let lock = &corrupted[0];
    assert_eq!(lock.owner, None);
    assert_eq!(lock.target, "y");

    let missing_local = Accessor::new(relay_dir.path().join("nowhere/y"), true);
    bravo
        .repair(lock, &missing_local)
        .await
        .expect("repair failed");
    assert!(relay_names(relay_dir.path()).await.is_empty());
}

#[tokio::test]
async fn own_locks_are_always_corrupted() {
    let relay_dir = tempfile::tempdir().expect("failed to create tempdir");
    let alice = relay_for("alice", relay_dir.path()).await;
    let bravo = relay_for("bravo", relay_dir.path()).await;

    assert!(alice
        .acquire_lock("q", LockMode::Write, false)
        .await
        .expect("acquire failed"));

    // Fresh, but owned by this client: reclaimable immediately.
    let own = alice
        .list_corrupted("", true)
        .await
        .expect("list_corrupted failed");
    assert_eq!(own.len(), 1);
    assert_eq!(own[0].owner, Some("alice".parse().expect("bad name")));
    assert_eq!(own[0].mode, Some(LockMode::Write));

    // Owned by a peer and fresh: not reclaimable by anyone else.
    assert!(bravo
        .list_corrupted("", true)
        .await
        .expect("list_corrupted failed")
        .is_empty());
}

#[tokio::test]
async fn blocking_pop_waits_for_release() {
    let relay_dir = tempfile::tempdir().expect("failed to create tempdir");
    let work = tempfile::tempdir().expect("failed to create tempdir");
    let alice = relay_for("alice", relay_dir.path()).await;
    let bravo = relay_for("bravo", relay_dir.path()).await;

    raw_store(relay_dir.path())
        .await
        .put_bytes("q", b"queued")
        .await
        .expect("failed to seed file");
    assert!(alice
        .acquire_lock("q", LockMode::Write, false)
        .await
        .expect("acquire failed"));

    // A non-blocking attempt reports the contention instead of raising.
    let dst = work.path().join("q");
    assert!(!bravo
        .pop("q", &dst, 1, false)
        .await
        .expect("non-blocking pop failed"));

    let blocked = {
        let dst = dst.clone();
        tokio::spawn(async move { bravo.pop("q", &dst, 1, true).await })
    };
    tokio::time::sleep(Duration::from_millis(150)).await;
    alice.release_lock("q").await.expect("release failed");

    let popped = tokio::time::timeout(Duration::from_secs(5), blocked)
        .await
        .expect("blocking pop never completed")
        .expect("pop task panicked")
        .expect("pop failed");
    assert!(popped);
    assert_eq!(std::fs::read_to_string(&dst).expect("missing copy"), "queued");
}

#[tokio::test]
async fn ready_listing_skips_markers_and_locked_files() {
    let relay_dir = tempfile::tempdir().expect("failed to create tempdir");
    let store = raw_store(relay_dir.path()).await;
    store.put_bytes("free", b"1").await.expect("seed failed");
    store.put_bytes("held", b"2").await.expect("seed failed");
    store
        .put_bytes(".held.lock", b"owner: alice\nmode: w\n")
        .await
        .expect("seed failed");
    store
        .put_bytes(".gone.placeholder", b"1700000000")
        .await
        .expect("seed failed");
    store
        .put_bytes(".note.message", b"")
        .await
        .expect("seed failed");

    let bravo = relay_for("bravo", relay_dir.path()).await;
    assert_eq!(
        bravo.list_ready("", true).await.expect("list_ready failed"),
        ["free"]
    );

    let transfered = bravo
        .list_transfered("", true, true)
        .await
        .expect("list_transfered failed");
    assert_eq!(transfered, ["gone"]);
}

#[tokio::test]
async fn repair_of_dead_write_lock_clears_remote_file() {
    let relay_dir = tempfile::tempdir().expect("failed to create tempdir");
    let work = tempfile::tempdir().expect("failed to create tempdir");
    let store = raw_store(relay_dir.path()).await;
    store.put_bytes("z", b"half-written").await.expect("seed failed");
    store
        .put_bytes(".z.placeholder", b"1700000000")
        .await
        .expect("seed failed");
    store
        .put_bytes(".z.lock", b"owner: alice\nmode: w\n")
        .await
        .expect("seed failed");

    let alice = relay_for("alice", relay_dir.path()).await;
    let local = work.path().join("z");
    std::fs::write(&local, "the real content").expect("failed to write local");

    let corrupted = alice
        .list_corrupted("", true)
        .await
        .expect("list_corrupted failed");
    assert_eq!(corrupted.len(), 1);
    alice
        .repair(&corrupted[0], &Accessor::new(&local, true))
        .await
        .expect("repair failed");

    // Remote file, placeholder and lock all cleared; the local source is
    // untouched and will be re-sent.
    assert!(relay_names(relay_dir.path()).await.is_empty());
    assert!(local.exists());
}

#[tokio::test]
async fn repair_of_dead_read_lock_discards_local_copy() {
    let relay_dir = tempfile::tempdir().expect("failed to create tempdir");
    let work = tempfile::tempdir().expect("failed to create tempdir");
    let store = raw_store(relay_dir.path()).await;
    // The remote copy is gone (the pop deleted it) but the download died.
    store
        .put_bytes(".w.placeholder", b"1700000000\nbravo")
        .await
        .expect("seed failed");
    store
        .put_bytes(".w.lock", b"owner: bravo\nmode: r\n")
        .await
        .expect("seed failed");

    let bravo = relay_for("bravo", relay_dir.path()).await;
    let local = work.path().join("w");
    std::fs::write(&local, "truncated").expect("failed to write local");

    let lock = LockInfo::parse("owner: bravo\nmode: r\n", "w");
    bravo
        .repair(&lock, &Accessor::new(&local, true))
        .await
        .expect("repair failed");

    assert!(!local.exists());
    // Placeholder released so the file is requested again.
    assert!(relay_names(relay_dir.path()).await.is_empty());
}

#[tokio::test]
async fn reserved_names_are_refused_at_ingest() {
    let relay_dir = tempfile::tempdir().expect("failed to create tempdir");
    let work = tempfile::tempdir().expect("failed to create tempdir");
    let alice = relay_for("alice", relay_dir.path()).await;

    let src = work.path().join("data");
    std::fs::write(&src, "data").expect("failed to write source");
    let err = alice
        .push(&src, "docs/.foo.lock", None, true)
        .await
        .expect_err("marker-shaped names must be refused");
    assert!(matches!(err, ferry_relay::Error::ReservedName(_)));
    assert!(relay_names(relay_dir.path()).await.is_empty());
}

#[tokio::test]
async fn delete_records_the_read() {
    let relay_dir = tempfile::tempdir().expect("failed to create tempdir");
    let work = tempfile::tempdir().expect("failed to create tempdir");
    let alice = relay_for("alice", relay_dir.path()).await;
    let bravo = relay_for("bravo", relay_dir.path()).await;

    let src = work.path().join("junk");
    std::fs::write(&src, "junk").expect("failed to write source");
    assert!(alice
        .push(&src, "junk", Some("1700000000"), true)
        .await
        .expect("push failed"));

    assert!(bravo.delete("junk", true).await.expect("delete failed"));
    let names = relay_names(relay_dir.path()).await;
    assert_eq!(names, [".junk.placeholder"]);
    let body = raw_store(relay_dir.path())
        .await
        .get_bytes(".junk.placeholder")
        .await
        .expect("placeholder should remain");
    assert_eq!(body, b"1700000000\nbravo");
}

#[tokio::test]
async fn nested_paths_keep_markers_alongside() {
    let relay_dir = tempfile::tempdir().expect("failed to create tempdir");
    let work = tempfile::tempdir().expect("failed to create tempdir");
    let alice = relay_for("alice", relay_dir.path()).await;
    let bravo = relay_for("bravo", relay_dir.path()).await;

    let src = work.path().join("f.txt");
    std::fs::write(&src, "nested").expect("failed to write source");
    assert!(alice
        .push(&src, "sub/dir/f.txt", Some("1700000000"), true)
        .await
        .expect("push failed"));
    assert_eq!(
        relay_names(relay_dir.path()).await,
        ["sub/dir/.f.txt.placeholder", "sub/dir/f.txt"]
    );

    let dst = work.path().join("mirror/sub/dir/f.txt");
    assert!(bravo
        .pop("sub/dir/f.txt", &dst, 1, true)
        .await
        .expect("pop failed"));
    assert_eq!(
        std::fs::read_to_string(&dst).expect("missing copy"),
        "nested"
    );
    assert!(relay_names(relay_dir.path()).await.is_empty());
}

#[tokio::test]
async fn get_keeps_the_remote_copy() {
    let relay_dir = tempfile::tempdir().expect("failed to create tempdir");
    let work = tempfile::tempdir().expect("failed to create tempdir");
    let alice = relay_for("alice", relay_dir.path()).await;
    let bravo = relay_for("bravo", relay_dir.path()).await;

    let src = work.path().join("keep");
    std::fs::write(&src, "keep").expect("failed to write source");
    assert!(alice
        .push(&src, "keep", Some("1700000000"), true)
        .await
        .expect("push failed"));

    let dst = work.path().join("copy");
    assert!(bravo.get("keep", &dst, true).await.expect("get failed"));
    let names = relay_names(relay_dir.path()).await;
    assert_eq!(names, [".keep.placeholder", "keep"]);
    let meta = bravo
        .meta_info("keep")
        .await
        .expect("meta_info failed")
        .expect("placeholder expected");
    assert!(meta.has_reader("bravo"));
}
