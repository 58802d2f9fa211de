use super::*;

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn put_get_delete_roundtrip() {
    let store = KvStore::open_in_memory().await.expect("opens");

    store
        .put("leafCursors", "did:key:stream-a", b"42".to_vec())
        .await
        .expect("puts");
    assert_eq!(
        store.get("leafCursors", "did:key:stream-a").await.expect("gets"),
        Some(b"42".to_vec())
    );

    store
        .delete("leafCursors", "did:key:stream-a")
        .await
        .expect("deletes");
    assert_eq!(
        store.get("leafCursors", "did:key:stream-a").await.expect("gets"),
        None
    );
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn sublevels_do_not_bleed() {
    let store = KvStore::open_in_memory().await.expect("opens");
    store
        .put("syncedProfiles:g:s", "user-1", b"hash-a".to_vec())
        .await
        .expect("puts");
    assert_eq!(
        store.get("syncedEdits:g:s", "user-1").await.expect("gets"),
        None
    );
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn json_accessors_roundtrip() {
    #[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
    struct EditMarker {
        edited_timestamp: u64,
        content_hash: String,
    }

    let store = KvStore::open_in_memory().await.expect("opens");
    let marker = EditMarker {
        edited_timestamp: 1_699_999_000_123,
        content_hash: "abc123".into(),
    };
    store
        .put_json("syncedEdits:g:s", "msg-1", &marker)
        .await
        .expect("puts");
    assert_eq!(
        store
            .get_json::<EditMarker>("syncedEdits:g:s", "msg-1")
            .await
            .expect("gets"),
        Some(marker)
    );
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn get_json_surfaces_malformed_values() {
    let store = KvStore::open_in_memory().await.expect("opens");
    store
        .put("meta", "broken", b"{not json".to_vec())
        .await
        .expect("puts");
    assert!(store.get_json::<u64>("meta", "broken").await.is_err());
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn prefix_iteration_is_ordered_and_bounded() {
    let store = KvStore::open_in_memory().await.expect("opens");
    for (key, value) in [
        ("discord_message_100", "m100"),
        ("discord_message_200", "m200"),
        ("discord_user_300", "u300"),
        ("roomy_01J00000000000000000000000", "r1"),
    ] {
        store
            .put("syncedIds:g:s", key, value.as_bytes().to_vec())
            .await
            .expect("puts");
    }

    let messages = store
        .iter_prefix("syncedIds:g:s", "discord_message_")
        .await
        .expect("iterates");
    assert_eq!(
        messages,
        vec![
            ("discord_message_100".to_owned(), b"m100".to_vec()),
            ("discord_message_200".to_owned(), b"m200".to_vec()),
        ]
    );

    let all = store.iter_prefix("syncedIds:g:s", "").await.expect("iterates");
    assert_eq!(all.len(), 4);
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn batch_is_atomic_across_sublevels() {
    let store = KvStore::open_in_memory().await.expect("opens");
    store
        .put("syncedIds:g:s", "stale", b"old".to_vec())
        .await
        .expect("puts");

    store
        .batch(vec![
            BatchOp::put("syncedIds:g:s", "discord_message_1", b"roomy-1".to_vec()),
            BatchOp::put("syncedIds:g:s", "roomy-1", b"discord_message_1".to_vec()),
            BatchOp::put_json("syncedEdits:g:s", "1", &7u64),
            BatchOp::delete("syncedIds:g:s", "stale"),
        ])
        .await
        .expect("batches");

    assert_eq!(
        store.get("syncedIds:g:s", "discord_message_1").await.expect("gets"),
        Some(b"roomy-1".to_vec())
    );
    assert_eq!(
        store.get("syncedIds:g:s", "roomy-1").await.expect("gets"),
        Some(b"discord_message_1".to_vec())
    );
    assert_eq!(
        store.get_json::<u64>("syncedEdits:g:s", "1").await.expect("gets"),
        Some(7)
    );
    assert_eq!(store.get("syncedIds:g:s", "stale").await.expect("gets"), None);
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn clear_sublevel_leaves_others_alone() {
    let store = KvStore::open_in_memory().await.expect("opens");
    store
        .put("streamCursors", "did:key:a", b"10".to_vec())
        .await
        .expect("puts");
    store
        .put("streamCursors", "did:key:b", b"20".to_vec())
        .await
        .expect("puts");
    store
        .put("meta", "schema_version", b"v2".to_vec())
        .await
        .expect("puts");

    let removed = store.clear_sublevel("streamCursors").await.expect("clears");
    assert_eq!(removed, 2);
    assert!(store
        .iter_prefix("streamCursors", "")
        .await
        .expect("iterates")
        .is_empty());
    assert_eq!(
        store.get("meta", "schema_version").await.expect("gets"),
        Some(b"v2".to_vec())
    );
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn on_commit_hooks_run_after_commit() {
    let store = KvStore::open_in_memory().await.expect("opens");
    let (hook_tx, hook_rx) = std::sync::mpsc::channel();

    store
        .write_with(move |tx| {
            let mut table = tx.open_table(&kv::TABLE)?;
            table.insert(&("meta".to_owned(), "k".to_owned()), &b"v".to_vec())?;
            tx.on_commit(move || {
                hook_tx.send(()).expect("hook channel");
            });
            Ok(())
        })
        .await
        .expect("writes");

    hook_rx.recv().expect("hook ran after commit");
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn persists_across_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("bridge.redb");

    {
        let store = KvStore::open(&path).await.expect("opens");
        store
            .put("registeredBridges", "guildId_1", b"did:key:space".to_vec())
            .await
            .expect("puts");
    }

    let store = KvStore::open(&path).await.expect("reopens");
    assert_eq!(
        store
            .get("registeredBridges", "guildId_1")
            .await
            .expect("gets"),
        Some(b"did:key:space".to_vec())
    );
}
