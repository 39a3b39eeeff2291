//! Invariants 1-8 of spec.md §8, each as a standalone scenario distinct
//! from the concrete S1-S6 scenarios in `tests/scenarios.rs`.

mod common;

use common::Fixture;
use dirserve::error::Kind;
use dirserve::event::WATCH_START;
use dirserve::path;
use dirserve::store::entry::SEQ_IGNORE;
use dirserve::store::Outcome;

#[tokio::test]
async fn sequence_monotonicity_across_successive_mutations() {
    let fx = Fixture::new("dir@example.com").await;
    fx.server.make_root("u@x.com").await.unwrap();

    let mut prev = fx.lookup_ok("u@x.com/", "u@x.com").await.sequence;
    for i in 0..5 {
        fx.put(&format!("u@x.com/f{i}"), "u@x.com", b"x", dirserve::store::entry::SEQ_NOT_EXIST)
            .await
            .unwrap();
        let root = fx.lookup_ok("u@x.com/", "u@x.com").await;
        assert_eq!(root.sequence, prev + 1);
        prev = root.sequence;
    }
}

#[tokio::test]
async fn sequence_propagates_to_every_ancestor() {
    let fx = Fixture::new("dir@example.com").await;
    fx.server.make_root("u@x.com").await.unwrap();
    fx.make_directory("u@x.com/a", "u@x.com").await;
    fx.make_directory("u@x.com/a/b", "u@x.com").await;
    fx.make_directory("u@x.com/a/b/c", "u@x.com").await;
    fx.put_ok("u@x.com/a/b/c/d", "u@x.com", b"x").await;

    let seq_d = fx.lookup_ok("u@x.com/a/b/c/d", "u@x.com").await.sequence;
    for ancestor in ["u@x.com/a", "u@x.com/a/b", "u@x.com/a/b/c"] {
        assert_eq!(fx.lookup_ok(ancestor, "u@x.com").await.sequence, seq_d);
    }
}

#[tokio::test]
async fn incomplete_masking_hides_blocks_but_not_existence() {
    let fx = Fixture::new("dir@example.com").await;
    fx.server.make_root("u@x.com").await.unwrap();
    fx.put_ok("u@x.com/Access", "u@x.com", b"list: r@y.com\n").await;
    fx.put_ok("u@x.com/secret", "u@x.com", b"s").await;

    let entry = fx.lookup_ok("u@x.com/secret", "r@y.com").await;
    assert!(entry.is_incomplete());
    assert!(entry.blocks.is_empty());
}

#[tokio::test]
async fn access_control_file_is_never_masked_incomplete() {
    let fx = Fixture::new("dir@example.com").await;
    fx.server.make_root("u@x.com").await.unwrap();
    fx.put_ok("u@x.com/Access", "u@x.com", b"list: r@y.com\n").await;

    let entry = fx.lookup_ok("u@x.com/Access", "r@y.com").await;
    assert!(!entry.is_incomplete());
}

#[tokio::test]
async fn no_disclosure_for_callers_with_no_right_at_all() {
    let fx = Fixture::new("dir@example.com").await;
    fx.server.make_root("u@x.com").await.unwrap();
    fx.put_ok("u@x.com/Access", "u@x.com", b"any: u@x.com\n").await;

    let err = fx.server.lookup("stranger@y.com", fx.name("u@x.com/does-not-exist"), true).await.unwrap_err();
    assert_eq!(err.kind(), Kind::Private);

    // Glob never errors per-entry (spec.md §4.3.4 "silent skip, not leak");
    // a caller with no list right on the root simply sees nothing.
    let result = fx.server.glob("stranger@y.com", fx.name("u@x.com/*")).await.unwrap();
    assert!(result.entries.is_empty());
    assert!(result.links.is_empty());

    let err = fx.server.which_access("stranger@y.com", fx.name("u@x.com/does-not-exist")).await.unwrap_err();
    assert_eq!(err.kind(), Kind::Private);
}

#[tokio::test]
async fn link_traversal_never_resolves_server_side() {
    let fx = Fixture::new("dir@example.com").await;
    fx.server.make_root("u@x.com").await.unwrap();
    fx.server.make_root("other@z.com").await.unwrap();
    fx.put_ok("other@z.com/target", "other@z.com", b"t").await;
    fx.server
        .make_link("u@x.com", fx.name("u@x.com/link"), fx.name("other@z.com/target"), dirserve::store::entry::SEQ_NOT_EXIST)
        .await
        .unwrap();

    let outcome = fx.server.lookup("u@x.com", fx.name("u@x.com/link"), true).await.unwrap();
    assert!(matches!(outcome, Outcome::FollowLink(_)));

    // a path traversing through the link (not naming it directly) also
    // yields follow-link rather than resolving into `other@z.com`.
    let outcome = fx.server.lookup("u@x.com", fx.name("u@x.com/link/residual"), true).await.unwrap();
    assert!(matches!(outcome, Outcome::FollowLink(_)));
}

#[tokio::test]
async fn watch_from_start_replays_in_commit_order() {
    let fx = Fixture::new("dir@example.com").await;
    fx.server.make_root("u@x.com").await.unwrap();
    fx.put_ok("u@x.com/a", "u@x.com", b"1").await;
    fx.put_ok("u@x.com/b", "u@x.com", b"2").await;

    let mut sub = fx.server.watch("u@x.com".to_string(), fx.name("u@x.com/"), WATCH_START).await.unwrap();
    let first = sub.recv().await.unwrap();
    let second = sub.recv().await.unwrap();
    let third = sub.recv().await.unwrap();
    assert_eq!(first.entry.name, fx.name("u@x.com/"));
    assert_eq!(second.entry.name, fx.name("u@x.com/a"));
    assert_eq!(third.entry.name, fx.name("u@x.com/b"));
}

#[tokio::test]
async fn slow_consumer_is_evicted_after_the_deadline() {
    // A short deadline and a fresh store/event-manager pair (not the shared
    // fixture, which uses a 5s deadline) so this test runs quickly while
    // still exercising the real bounded-channel send timeout.
    let store = std::sync::Arc::new(dirserve::store::Store::new(
        std::sync::Arc::new(dirserve::content::MemoryContentStore::new()),
        dirserve::event::EventManager::spawn(std::time::Duration::from_millis(20)),
    ));
    let server = dirserve::server::Server::start(store, "dir@example.com".to_string(), std::time::Duration::from_millis(20))
        .await
        .unwrap();
    server.make_root("u@x.com").await.unwrap();

    let mut sub = server.watch("u@x.com".to_string(), path::parse("u@x.com/").unwrap(), dirserve::event::WATCH_NEW).await.unwrap();

    // Never drain `sub`. The per-subscriber channel is bounded, so once its
    // 16-slot buffer is full, a subsequent send blocks until either `sub`
    // reads or the 20ms deadline elapses and the event manager evicts it.
    for i in 0..32 {
        server
            .put_control_file(
                path::parse(&format!("u@x.com/f{i}")).unwrap(),
                "u@x.com",
                b"x",
                dirserve::store::entry::SEQ_NOT_EXIST,
            )
            .await
            .unwrap();
    }

    // The listener was evicted partway through, so the stream ends: once
    // whatever was already queued is drained, `recv` reports the channel
    // closed rather than hanging forever waiting for event 32.
    let drain = tokio::time::timeout(std::time::Duration::from_secs(1), async {
        let mut count = 0;
        while sub.recv().await.is_some() {
            count += 1;
        }
        count
    })
    .await
    .expect("evicted subscription's queued events must drain promptly, not hang");
    assert!(drain < 32, "expected eviction to cut the stream short, got all {drain} events");
}

#[tokio::test]
async fn put_with_seq_ignore_accepts_any_existing_sequence() {
    let fx = Fixture::new("dir@example.com").await;
    fx.server.make_root("u@x.com").await.unwrap();
    fx.put_ok("u@x.com/f", "u@x.com", b"1").await;

    let Outcome::Value(entry) = fx.put("u@x.com/f", "u@x.com", b"2", SEQ_IGNORE).await.unwrap() else {
        panic!("expected value")
    };
    assert_eq!(entry.sequence, 3);
}

#[tokio::test]
async fn glob_skips_entries_without_list_right_silently() {
    let fx = Fixture::new("dir@example.com").await;
    fx.server.make_root("u@x.com").await.unwrap();
    fx.put_ok("u@x.com/Access", "u@x.com", b"read: r@y.com\n").await;
    fx.put_ok("u@x.com/a", "u@x.com", b"1").await;

    let result = fx.server.glob("r@y.com", path::parse("u@x.com/*").unwrap()).await.unwrap();
    assert!(result.entries.is_empty());
}
