use std::str::FromStr as _;
use std::sync::Arc;
use std::time::Duration;

use roomy_client_db::{Database, NullProfileFetcher, STREAM_SCHEMA_VERSION};
use roomy_core::event::{Content, CreateMessage, EventKind, JoinSpace, LeaveSpace};
use roomy_core::{EntityId, Event, StreamId, UserDid};
use roomy_kv::KvStore;
use roomy_store::Store;
use roomy_util_lock::LockManager;

use super::*;

fn alice() -> UserDid {
    UserDid::from_str("did:plc:alice").expect("valid")
}

fn personal_stream() -> StreamId {
    StreamId::from_str("did:memory:personal").expect("valid")
}

fn space_stream() -> StreamId {
    StreamId::from_str("did:memory:space-one").expect("valid")
}

fn message(text: &str) -> Event {
    Event::new(
        EntityId::now(),
        EventKind::CreateMessage(CreateMessage {
            body: Content::text(text),
            reply: None,
            attachments: vec![],
            link: None,
            comment: None,
            author_override: None,
            timestamp_override: None,
        }),
    )
}

async fn open_db() -> Arc<Database> {
    let store = Store::open_in_memory(LockManager::new()).expect("store opens");
    let kv = Arc::new(KvStore::open_in_memory().await.expect("kv opens"));
    Database::open(store, kv, Arc::new(NullProfileFetcher), STREAM_SCHEMA_VERSION)
        .await
        .expect("db opens")
}

async fn connect(db: Arc<Database>, transport: Arc<MemoryTransport>) -> Arc<Client> {
    Client::connect(
        db,
        transport,
        Arc::new(StaticTokenProvider("service-token".into())),
        "did:web:leaf.example",
    )
    .await
    .expect("connects")
}

async fn wait_for(mut condition: impl AsyncFnMut() -> bool) {
    for _ in 0..200 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn empty_token_is_identity_expired() {
    let db = open_db().await;
    let transport = Arc::new(MemoryTransport::new(alice()));
    let result = Client::connect(
        db,
        transport,
        Arc::new(StaticTokenProvider(String::new())),
        "did:web:leaf.example",
    )
    .await;
    assert!(matches!(result, Err(ClientError::IdentityExpired)));
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn backfill_drains_in_windows_until_empty() {
    let db = open_db().await;
    let transport = Arc::new(MemoryTransport::new(alice()));
    let stream = space_stream();
    transport.register_stream(stream.clone());
    for at in 0..10 {
        transport.push_external(&stream, alice(), message(&format!("m{at}")).encode());
    }

    let client = connect(db.clone(), transport.clone()).await;
    let total = client.backfill(&stream).await.expect("backfills");
    assert_eq!(total, 10);
    assert_eq!(db.cursor(&stream).await.expect("queries"), 10);

    // Nothing new: one empty window, no re-ingest
    let total = client.backfill(&stream).await.expect("backfills");
    assert_eq!(total, 0);
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn open_stream_catches_backfill_and_live_events() {
    let db = open_db().await;
    let transport = Arc::new(MemoryTransport::new(alice()));
    let stream = space_stream();
    transport.register_stream(stream.clone());
    transport.push_external(&stream, alice(), message("before open").encode());

    let client = connect(db.clone(), transport.clone()).await;
    client.open_stream(stream.clone()).await.expect("opens");
    assert!(transport.is_subscribed(&stream));

    {
        let db = db.clone();
        let stream = stream.clone();
        wait_for(async || db.cursor(&stream).await.expect("queries") == 1).await;
    }

    transport.push_external(&stream, alice(), message("live one").encode());
    transport.push_external(&stream, alice(), message("live two").encode());
    {
        let db = db.clone();
        let stream = stream.clone();
        wait_for(async || db.cursor(&stream).await.expect("queries") == 3).await;
    }

    client.close_stream(&stream).await.expect("closes");
    assert!(!transport.is_subscribed(&stream));
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn send_event_appends_to_the_stream() {
    let db = open_db().await;
    let transport = Arc::new(MemoryTransport::new(alice()));
    let stream = space_stream();
    transport.register_stream(stream.clone());

    let client = connect(db, transport.clone()).await;
    let idx = client
        .send_event(&stream, &message("outgoing"))
        .await
        .expect("sends");
    assert_eq!(idx, 1);
    assert_eq!(transport.entry_count(&stream), 1);
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn space_manager_follows_comp_space_rows() {
    let db = open_db().await;
    let transport = Arc::new(MemoryTransport::new(alice()));
    let personal = personal_stream();
    let space = space_stream();
    transport.register_stream(personal.clone());
    transport.register_stream(space.clone());

    // The space already has history the manager should pick up
    transport.push_external(&space, alice(), message("existing history").encode());

    let client = connect(db.clone(), transport.clone()).await;
    client.open_stream(personal.clone()).await.expect("opens");
    let _manager = client.spawn_space_manager().expect("spawns");

    // Joining the space from the personal stream subscribes it
    let join = Event::new(
        EntityId::now(),
        EventKind::JoinSpace(JoinSpace {
            space: space.clone(),
            hidden: false,
        }),
    );
    transport.push_external(&personal, alice(), join.encode());

    {
        let transport = transport.clone();
        let space = space.clone();
        wait_for(async || transport.is_subscribed(&space)).await;
    }
    {
        let db = db.clone();
        let space = space.clone();
        wait_for(async || db.cursor(&space).await.expect("queries") == 1).await;
    }

    // Leaving the space unsubscribes it again
    let leave = Event::new(
        EntityId::now(),
        EventKind::LeaveSpace(LeaveSpace {
            space: space.clone(),
        }),
    );
    transport.push_external(&personal, alice(), leave.encode());
    {
        let transport = transport.clone();
        let space = space.clone();
        wait_for(async || !transport.is_subscribed(&space)).await;
    }
    // The personal stream stays open throughout
    assert!(transport.is_subscribed(&personal));
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn hidden_spaces_are_not_subscribed() {
    let db = open_db().await;
    let transport = Arc::new(MemoryTransport::new(alice()));
    let personal = personal_stream();
    let space = space_stream();
    transport.register_stream(personal.clone());
    transport.register_stream(space.clone());

    let client = connect(db.clone(), transport.clone()).await;
    client.open_stream(personal.clone()).await.expect("opens");
    let _manager = client.spawn_space_manager().expect("spawns");

    let join_hidden = Event::new(
        EntityId::now(),
        EventKind::JoinSpace(JoinSpace {
            space: space.clone(),
            hidden: true,
        }),
    );
    transport.push_external(&personal, alice(), join_hidden.encode());

    {
        let db = db.clone();
        wait_for(async || db.spaces(true).await.expect("queries").len() == 1).await;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!transport.is_subscribed(&space));
}
