use roomy_util_lock::LockManager;

use super::*;

fn test_store() -> Store {
    Store::open_in_memory(LockManager::new()).expect("opens")
}

async fn setup_messages(store: &Store) {
    store
        .execute(&Statement::new(
            "CREATE TABLE messages (id TEXT PRIMARY KEY, body BLOB, edited INTEGER DEFAULT 0)",
            vec![],
        ))
        .await
        .expect("creates");
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn execute_and_query_roundtrip() {
    let store = test_store();
    setup_messages(&store).await;

    let inserted = store
        .execute(&Statement::new(
            "INSERT INTO messages (id, body) VALUES (?1, ?2)",
            vec!["msg-1".into(), b"hello".to_vec().into()],
        ))
        .await
        .expect("inserts");
    assert_eq!(inserted.rows_affected, 1);

    let result = store
        .query(&Statement::new(
            "SELECT id, text(body) AS body FROM messages",
            vec![],
        ))
        .await
        .expect("queries");
    assert_eq!(result.len(), 1);
    let row = result.first().expect("one row");
    assert_eq!(row.text("id"), Some("msg-1"));
    assert_eq!(row.text("body"), Some("hello"));
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn ulid_udfs() {
    let store = test_store();
    let result = store
        .query(&Statement::new(
            "SELECT is_ulid(?1) AS valid, is_ulid('nope') AS invalid, \
             ulid_timestamp(?1) AS ts, timestamp_to_ulid(0) AS zero",
            vec!["01ARZ3NDEKTSV4RRFFQ69G5FAV".into()],
        ))
        .await
        .expect("queries");
    let row = result.first().expect("one row");
    assert_eq!(row.integer("valid"), Some(1));
    assert_eq!(row.integer("invalid"), Some(0));
    assert!(row.integer("ts").is_some_and(|ts| 0 < ts));
    assert_eq!(row.text("zero"), Some("00000000000000000000000000"));
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn apply_dmp_patch_udf() {
    let store = test_store();
    setup_messages(&store).await;
    store
        .execute(&Statement::new(
            "INSERT INTO messages (id, body) VALUES ('m', ?1)",
            vec![b"hello world".to_vec().into()],
        ))
        .await
        .expect("inserts");

    store
        .execute(&Statement::new(
            "UPDATE messages SET body = apply_dmp_patch(text(body), ?1), edited = 1 \
             WHERE id = 'm'",
            vec!["@@ -2,9 +2,16 @@\n ello\n+,%20brave\n  wor\n".into()],
        ))
        .await
        .expect("patches");

    let result = store
        .query(&Statement::new(
            "SELECT text(body) AS body FROM messages WHERE id = 'm'",
            vec![],
        ))
        .await
        .expect("queries");
    assert_eq!(
        result.first().expect("row").text("body"),
        Some("hello, brave world")
    );
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn custom_udf() {
    let store = test_store();
    store
        .register_udf("shout", 1, |args| {
            let text = args[0].as_text().unwrap_or_default();
            Ok(SqlValue::Text(text.to_uppercase()))
        })
        .expect("registers");

    let result = store
        .query(&Statement::new("SELECT shout('quiet') AS loud", vec![]))
        .await
        .expect("queries");
    assert_eq!(result.first().expect("row").text("loud"), Some("QUIET"));
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn savepoint_rollback_isolates_failures() {
    let store = test_store();
    setup_messages(&store).await;

    store
        .with_write(|tx| {
            tx.savepoint("outer", |tx| {
                tx.execute(&Statement::new(
                    "INSERT INTO messages (id, body) VALUES ('keep', x'00')",
                    vec![],
                ))?;

                // Inner scope violates the primary key; only it rolls back
                let inner = tx.savepoint("inner", |tx| {
                    tx.execute(&Statement::new(
                        "INSERT INTO messages (id, body) VALUES ('gone', x'00')",
                        vec![],
                    ))?;
                    tx.execute(&Statement::new(
                        "INSERT INTO messages (id, body) VALUES ('keep', x'00')",
                        vec![],
                    ))?;
                    Ok(())
                });
                assert!(inner.is_err());
                Ok(())
            })
        })
        .await
        .expect("outer survives");

    let result = store
        .query(&Statement::new("SELECT id FROM messages ORDER BY id", vec![]))
        .await
        .expect("queries");
    let ids: Vec<&str> = result.rows.iter().filter_map(|r| r.text("id")).collect();
    assert_eq!(ids, vec!["keep"]);
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn savepoint_rejects_hostile_names() {
    let store = test_store();
    let res = store
        .with_write(|tx| tx.savepoint("bad; DROP TABLE x", |_| Ok(())))
        .await;
    assert!(matches!(res, Err(StoreError::SavepointName { .. })));
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn live_query_fires_on_matching_write_only() {
    let store = test_store();
    setup_messages(&store).await;
    store
        .execute(&Statement::new(
            "CREATE TABLE unrelated (id INTEGER PRIMARY KEY)",
            vec![],
        ))
        .await
        .expect("creates");

    let (sink, mut updates) = tokio::sync::mpsc::unbounded_channel();
    store
        .register_live_query(
            "messages-all",
            &["messages"],
            Statement::new("SELECT id FROM messages ORDER BY id", vec![]),
            sink,
        )
        .await
        .expect("registers");

    // Initial result is pushed at registration
    let initial = updates.recv().await.expect("initial");
    assert!(initial.is_empty());

    store
        .execute(&Statement::new(
            "INSERT INTO messages (id, body) VALUES ('a', x'00')",
            vec![],
        ))
        .await
        .expect("inserts");
    let update = updates.recv().await.expect("update");
    assert_eq!(update.len(), 1);

    // A write to an unrelated table must not re-run the query
    store
        .execute(&Statement::new(
            "INSERT INTO unrelated (id) VALUES (1)",
            vec![],
        ))
        .await
        .expect("inserts");
    assert!(updates.try_recv().is_err());
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn suspended_notifications_flush_once_on_resume() {
    let store = test_store();
    setup_messages(&store).await;

    let (sink, mut updates) = tokio::sync::mpsc::unbounded_channel();
    store
        .register_live_query(
            "messages-all",
            &["messages"],
            Statement::new("SELECT id FROM messages ORDER BY id", vec![]),
            sink,
        )
        .await
        .expect("registers");
    let _initial = updates.recv().await.expect("initial");

    store.suspend_notifications();
    for id in ["a", "b", "c"] {
        store
            .execute(&Statement::new(
                "INSERT INTO messages (id, body) VALUES (?1, x'00')",
                vec![id.into()],
            ))
            .await
            .expect("inserts");
    }
    assert!(updates.try_recv().is_err());

    store.resume_notifications().await;
    let update = updates.recv().await.expect("flush");
    assert_eq!(update.len(), 3);
    assert!(updates.try_recv().is_err());
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn remove_live_query_stops_updates() {
    let store = test_store();
    setup_messages(&store).await;

    let (sink, mut updates) = tokio::sync::mpsc::unbounded_channel();
    store
        .register_live_query(
            "short-lived",
            &["messages"],
            Statement::new("SELECT id FROM messages", vec![]),
            sink,
        )
        .await
        .expect("registers");
    let _initial = updates.recv().await.expect("initial");

    assert!(store.remove_live_query("short-lived"));
    store
        .execute(&Statement::new(
            "INSERT INTO messages (id, body) VALUES ('x', x'00')",
            vec![],
        ))
        .await
        .expect("inserts");
    assert!(updates.try_recv().is_err());
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn malformed_patch_surfaces_as_statement_error() {
    let store = test_store();
    let res = store
        .query(&Statement::new(
            "SELECT apply_dmp_patch('abc', '@@ broken @@')",
            vec![],
        ))
        .await;
    assert!(matches!(res, Err(StoreError::Sqlite { .. })));
}
