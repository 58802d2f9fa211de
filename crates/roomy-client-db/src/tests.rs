use std::collections::HashMap;
use std::str::FromStr as _;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use roomy_core::event::{
    Content, CreateMessage, CreateRoom, EditMessage, EventKind, JoinSpace, Move, RoomKind,
};
use roomy_core::{EntityId, Event, StreamEntry, StreamId, UserDid};
use roomy_kv::KvStore;
use roomy_store::Store;
use roomy_util::BoxedError;
use roomy_util_lock::LockManager;

use super::*;

fn space_stream() -> StreamId {
    StreamId::from_str("did:key:z6MkspaceAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA").expect("valid")
}

fn personal_stream() -> StreamId {
    StreamId::from_str("did:key:z6MkpersonalAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA").expect("valid")
}

fn alice() -> UserDid {
    UserDid::from_str("did:plc:alice").expect("valid")
}

fn message(id: EntityId, text: &str) -> Event {
    Event::new(
        id,
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

fn reply(id: EntityId, text: &str, to: EntityId) -> Event {
    let mut event = message(id, text);
    if let EventKind::CreateMessage(fields) = &mut event.kind {
        fields.reply = Some(to);
    }
    event
}

fn entry(idx: u64, event: &Event) -> StreamEntry {
    StreamEntry {
        idx,
        user: alice(),
        payload: event.encode(),
    }
}

struct StaticProfiles(HashMap<UserDid, Profile>);

#[async_trait]
impl ProfileFetcher for StaticProfiles {
    async fn get_profile(&self, did: &UserDid) -> Result<Option<Profile>, BoxedError> {
        Ok(self.0.get(did).cloned())
    }
}

async fn open_db() -> Arc<Database> {
    open_db_with(Arc::new(NullProfileFetcher), STREAM_SCHEMA_VERSION).await
}

async fn open_db_with(
    fetcher: Arc<dyn ProfileFetcher>,
    schema_version: &str,
) -> Arc<Database> {
    let store = Store::open_in_memory(LockManager::new()).expect("store opens");
    let kv = Arc::new(KvStore::open_in_memory().await.expect("kv opens"));
    Database::open(store, kv, fetcher, schema_version)
        .await
        .expect("db opens")
}

async fn wait_for(mut condition: impl AsyncFnMut() -> bool) {
    for _ in 0..100 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached in time");
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn stashed_reply_applies_after_target() {
    let db = open_db().await;
    let stream = space_stream();

    let id_a = EntityId::now();
    let id_b = EntityId::now();

    // The reply arrives before the message it replies to
    let report = db
        .ingest_events(
            stream.clone(),
            vec![entry(1, &reply(id_b, "re: hi", id_a))],
            Class::Background,
        )
        .await
        .expect("ingests");
    assert_eq!(report.stashed_count(), 1);
    assert_eq!(
        db.event_status(&stream, 1).await.expect("queries"),
        Some((false, None))
    );
    assert!(!db.entity_exists(id_b).await.expect("queries"));

    let report = db
        .ingest_events(
            stream.clone(),
            vec![entry(2, &message(id_a, "hi"))],
            Class::Background,
        )
        .await
        .expect("ingests");
    assert_eq!(report.applied_count(), 1);

    // The unstash batch runs asynchronously at priority class
    let db_for_wait = db.clone();
    let stream_for_wait = stream.clone();
    wait_for(async || {
        db_for_wait
            .event_status(&stream_for_wait, 1)
            .await
            .expect("queries")
            == Some((true, None))
    })
    .await;

    assert_eq!(
        db.event_status(&stream, 2).await.expect("queries"),
        Some((true, None))
    );
    assert_eq!(db.edge_count(id_b, id_a, "reply").await.expect("queries"), 1);
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn dmp_patch_edit_rewrites_content() {
    let db = open_db().await;
    let stream = space_stream();

    let msg = EntityId::now();
    let edit_id = EntityId::now();
    let edit = Event::new(
        edit_id,
        EventKind::EditMessage(EditMessage {
            target: msg,
            body: Content::dmp_patch("@@ -2,9 +2,16 @@\n ello\n+,%20brave\n  wor\n"),
        }),
    );

    let report = db
        .ingest_events(
            stream.clone(),
            vec![entry(1, &message(msg, "hello world")), entry(2, &edit)],
            Class::Background,
        )
        .await
        .expect("ingests");
    assert_eq!(report.applied_count(), 2);

    assert_eq!(
        db.content_text(msg).await.expect("queries"),
        Some("hello, brave world".to_owned())
    );
    assert_eq!(
        db.event_status(&stream, 2).await.expect("queries"),
        Some((true, None))
    );
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn full_content_edit_replaces() {
    let db = open_db().await;
    let stream = space_stream();

    let msg = EntityId::now();
    let edit = Event::new(
        EntityId::now(),
        EventKind::EditMessage(EditMessage {
            target: msg,
            body: Content::text("rewritten"),
        }),
    );

    db.ingest_events(
        stream.clone(),
        vec![entry(1, &message(msg, "original")), entry(2, &edit)],
        Class::Background,
    )
    .await
    .expect("ingests");

    assert_eq!(
        db.content_text(msg).await.expect("queries"),
        Some("rewritten".to_owned())
    );
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn fractional_sort_move_is_idempotent() {
    let db = open_db().await;
    let stream = space_stream();

    let x = EntityId::now();
    let y = EntityId::now();
    let z = EntityId::now();

    db.ingest_events(
        stream.clone(),
        vec![
            entry(1, &message(x, "one")),
            entry(2, &message(y, "two")),
            entry(3, &message(z, "three")),
        ],
        Class::Background,
    )
    .await
    .expect("ingests");

    let order_of = |ids: Vec<String>| -> Vec<EntityId> {
        ids.iter()
            .filter_map(|id| id.parse().ok())
            .filter(|id| [x, y, z].contains(id))
            .collect()
    };
    assert_eq!(
        order_of(db.sorted_entities(&stream).await.expect("queries")),
        vec![x, y, z]
    );

    let mv = Event::new(
        EntityId::now(),
        EventKind::Move(Move {
            entity: z,
            after: Some(x),
        }),
    );
    db.ingest_events(stream.clone(), vec![entry(4, &mv)], Class::Background)
        .await
        .expect("ingests");
    assert_eq!(
        order_of(db.sorted_entities(&stream).await.expect("queries")),
        vec![x, z, y]
    );

    let y_idx_before = db.sort_idx_of(y).await.expect("queries");
    let z_idx_before = db.sort_idx_of(z).await.expect("queries");

    // The same move again: idempotent, no churn of anyone's sort_idx
    let mv_again = Event::new(
        EntityId::now(),
        EventKind::Move(Move {
            entity: z,
            after: Some(x),
        }),
    );
    db.ingest_events(stream.clone(), vec![entry(5, &mv_again)], Class::Background)
        .await
        .expect("ingests");

    assert_eq!(
        order_of(db.sorted_entities(&stream).await.expect("queries")),
        vec![x, z, y]
    );
    assert_eq!(db.sort_idx_of(y).await.expect("queries"), y_idx_before);
    assert_eq!(db.sort_idx_of(z).await.expect("queries"), z_idx_before);
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn repeated_moves_of_one_entity_converge() {
    let db = open_db().await;
    let stream = space_stream();

    let a = EntityId::now();
    let b = EntityId::now();
    let c = EntityId::now();

    db.ingest_events(
        stream.clone(),
        vec![
            entry(1, &message(a, "a")),
            entry(2, &message(b, "b")),
            entry(3, &message(c, "c")),
        ],
        Class::Background,
    )
    .await
    .expect("ingests");

    // Bounce `c` between anchors repeatedly; order must always settle to
    // exactly what the last move dictates.
    let mut idx = 4;
    for (anchor, expected) in [
        (a, vec![a, c, b]),
        (b, vec![a, b, c]),
        (a, vec![a, c, b]),
        (b, vec![a, b, c]),
    ] {
        let mv = Event::new(
            EntityId::now(),
            EventKind::Move(Move {
                entity: c,
                after: Some(anchor),
            }),
        );
        db.ingest_events(stream.clone(), vec![entry(idx, &mv)], Class::Background)
            .await
            .expect("ingests");
        idx += 1;

        let order: Vec<EntityId> = db
            .sorted_entities(&stream)
            .await
            .expect("queries")
            .iter()
            .filter_map(|id| id.parse().ok())
            .filter(|id| [a, b, c].contains(id))
            .collect();
        assert_eq!(order, expected, "after moving c after {anchor}");
    }
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn reingest_of_applied_prefix_is_a_noop() {
    let db = open_db().await;
    let stream = space_stream();

    let msg = EntityId::now();
    let entries = vec![entry(1, &message(msg, "once"))];

    let first = db
        .ingest_events(stream.clone(), entries.clone(), Class::Background)
        .await
        .expect("ingests");
    assert_eq!(first.applied_count(), 1);

    let second = db
        .ingest_events(stream.clone(), entries, Class::Background)
        .await
        .expect("ingests");
    assert_eq!(second.applied_count(), 0);
    assert!(matches!(
        second.results.as_slice(),
        [ApplyResult::AlreadyApplied { idx: 1 }]
    ));
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn split_ingest_matches_whole_ingest() {
    let x = EntityId::now();
    let y = EntityId::now();
    let z = EntityId::now();
    let events = vec![
        entry(1, &message(x, "one")),
        entry(2, &reply(y, "two", x)),
        entry(3, &reply(z, "three", y)),
    ];

    let whole = open_db().await;
    whole
        .ingest_events(space_stream(), events.clone(), Class::Background)
        .await
        .expect("ingests");

    let split = open_db().await;
    split
        .ingest_events(space_stream(), events[..1].to_vec(), Class::Background)
        .await
        .expect("ingests");
    split
        .ingest_events(space_stream(), events[1..].to_vec(), Class::Background)
        .await
        .expect("ingests");

    let stream = space_stream();
    assert_eq!(
        whole.sorted_entities(&stream).await.expect("queries"),
        split.sorted_entities(&stream).await.expect("queries"),
    );
    for (head, tail) in [(y, x), (z, y)] {
        assert_eq!(
            whole.edge_count(head, tail, "reply").await.expect("queries"),
            split.edge_count(head, tail, "reply").await.expect("queries"),
        );
    }
    assert_eq!(
        whole.cursor(&stream).await.expect("queries"),
        split.cursor(&stream).await.expect("queries"),
    );
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn unknown_and_undecodable_events_advance_cursor() {
    let db = open_db().await;
    let stream = space_stream();

    let unknown = Event::new(
        EntityId::now(),
        EventKind::Unknown {
            kind: "space.roomy.future.v9".into(),
        },
    );
    let report = db
        .ingest_events(
            stream.clone(),
            vec![
                entry(1, &unknown),
                StreamEntry {
                    idx: 2,
                    user: alice(),
                    payload: vec![0xff, 0x13, 0x37],
                },
            ],
            Class::Background,
        )
        .await
        .expect("ingests");
    assert!(report.results.is_empty());
    assert_eq!(db.cursor(&stream).await.expect("queries"), 2);
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn profile_enrichment_materializes_users() {
    let mut profiles = HashMap::new();
    profiles.insert(
        alice(),
        Profile {
            username: Some("alice".into()),
            display_name: Some("Alice".into()),
            avatar: None,
        },
    );
    let db = open_db_with(Arc::new(StaticProfiles(profiles)), STREAM_SCHEMA_VERSION).await;
    let stream = space_stream();

    db.ingest_events(
        stream.clone(),
        vec![entry(1, &message(EntityId::now(), "hello"))],
        Class::Background,
    )
    .await
    .expect("ingests");

    assert_eq!(
        db.user_handle(&stream, &alice()).await.expect("queries"),
        Some("alice".to_owned())
    );
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn backfilled_to_is_monotone() {
    let db = open_db().await;
    let personal = personal_stream();
    let space = space_stream();

    let join = Event::new(
        EntityId::now(),
        EventKind::JoinSpace(JoinSpace {
            space: space.clone(),
            hidden: false,
        }),
    );
    db.ingest_events(personal.clone(), vec![entry(1, &join)], Class::Background)
        .await
        .expect("ingests");

    db.ingest_events(
        space.clone(),
        vec![entry(5, &message(EntityId::now(), "hi"))],
        Class::Background,
    )
    .await
    .expect("ingests");
    let spaces = db.spaces(false).await.expect("queries");
    assert_eq!(spaces.len(), 1);
    assert_eq!(spaces[0].backfilled_to, 5);

    db.ingest_events(
        space.clone(),
        vec![entry(7, &message(EntityId::now(), "again"))],
        Class::Background,
    )
    .await
    .expect("ingests");
    assert_eq!(db.spaces(false).await.expect("queries")[0].backfilled_to, 7);

    // A replayed old window must not regress it
    db.ingest_events(
        space.clone(),
        vec![entry(5, &message(EntityId::now(), "dup"))],
        Class::Background,
    )
    .await
    .expect("ingests");
    assert_eq!(db.spaces(false).await.expect("queries")[0].backfilled_to, 7);
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn schema_version_mismatch_wipes_local_caches() {
    let store = Store::open_in_memory(LockManager::new()).expect("store opens");
    let kv = Arc::new(KvStore::open_in_memory().await.expect("kv opens"));

    let db_v1 = Database::open(
        store.clone(),
        kv.clone(),
        Arc::new(NullProfileFetcher),
        "v1",
    )
    .await
    .expect("opens");
    let stream = space_stream();
    db_v1
        .ingest_events(
            stream.clone(),
            vec![entry(1, &message(EntityId::now(), "old world"))],
            Class::Background,
        )
        .await
        .expect("ingests");
    assert_eq!(db_v1.cursor(&stream).await.expect("queries"), 1);
    assert!(!db_v1.sorted_entities(&stream).await.expect("queries").is_empty());

    // Same store + kv, new schema version: stream-local caches truncated
    let db_v2 = Database::open(store, kv.clone(), Arc::new(NullProfileFetcher), "v2")
        .await
        .expect("opens");
    assert!(db_v2.sorted_entities(&stream).await.expect("queries").is_empty());
    assert_eq!(db_v2.cursor(&stream).await.expect("queries"), 0);
    assert_eq!(
        kv.get_json::<String>(META_SUBLEVEL, "schema_version")
            .await
            .expect("gets"),
        Some("v2".to_owned())
    );
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn room_create_and_delete_soft_deletes() {
    let db = open_db().await;
    let stream = space_stream();

    let room = EntityId::now();
    let create = Event::new(
        room,
        EventKind::CreateRoom(CreateRoom {
            kind: RoomKind::Channel,
            name: Some("general".into()),
        }),
    );
    let delete = Event::new(
        EntityId::now(),
        EventKind::DeleteRoom(roomy_core::event::DeleteRoom { room }),
    );
    db.ingest_events(
        stream.clone(),
        vec![entry(1, &create), entry(2, &delete)],
        Class::Background,
    )
    .await
    .expect("ingests");

    let deleted = db
        .store()
        .query(&Statement::new(
            "SELECT deleted FROM comp_room WHERE entity = ?1",
            vec![room.to_string().into()],
        ))
        .await
        .expect("queries");
    assert_eq!(deleted.first().and_then(|r| r.integer("deleted")), Some(1));
    // Soft delete: the entity row survives
    assert!(db.entity_exists(room).await.expect("queries"));
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn reaction_add_and_remove_cascades() {
    let db = open_db().await;
    let stream = space_stream();

    let msg = EntityId::now();
    let reaction = EntityId::now();
    let add = Event::new(
        reaction,
        EventKind::AddReaction(roomy_core::event::AddReaction {
            target: msg,
            emoji: "👍".into(),
        }),
    );
    let remove = Event::new(
        EntityId::now(),
        EventKind::RemoveReaction(roomy_core::event::RemoveReaction { reaction }),
    );

    db.ingest_events(
        stream.clone(),
        vec![entry(1, &message(msg, "hi")), entry(2, &add)],
        Class::Background,
    )
    .await
    .expect("ingests");
    let count = db
        .store()
        .query(&Statement::new(
            "SELECT COUNT(*) AS n FROM comp_reaction WHERE target = ?1",
            vec![msg.to_string().into()],
        ))
        .await
        .expect("queries");
    assert_eq!(count.first().and_then(|r| r.integer("n")), Some(1));

    db.ingest_events(stream.clone(), vec![entry(3, &remove)], Class::Background)
        .await
        .expect("ingests");
    let count = db
        .store()
        .query(&Statement::new(
            "SELECT COUNT(*) AS n FROM comp_reaction WHERE target = ?1",
            vec![msg.to_string().into()],
        ))
        .await
        .expect("queries");
    assert_eq!(count.first().and_then(|r| r.integer("n")), Some(0));
    assert!(!db.entity_exists(reaction).await.expect("queries"));
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn statement_error_isolated_to_its_bundle() {
    let db = open_db().await;
    let stream = space_stream();

    // An edit whose DMP patch cannot apply fails its own bundle only
    let msg = EntityId::now();
    let bad_edit = Event::new(
        EntityId::now(),
        EventKind::EditMessage(EditMessage {
            target: msg,
            body: Content::dmp_patch("@@ -2,9 +2,16 @@\n nomatch\n+x\n"),
        }),
    );
    let after = EntityId::now();

    let report = db
        .ingest_events(
            stream.clone(),
            vec![
                entry(1, &message(msg, "hello world")),
                entry(2, &bad_edit),
                entry(3, &message(after, "still fine")),
            ],
            Class::Background,
        )
        .await
        .expect("ingests");

    assert_eq!(report.applied_count(), 2);
    assert_eq!(report.errors().count(), 1);
    assert_eq!(
        db.event_status(&stream, 2)
            .await
            .expect("queries")
            .map(|(applied, err)| (applied, err.is_some())),
        Some((false, true))
    );
    // Later bundle in the same batch landed untouched
    assert!(db.entity_exists(after).await.expect("queries"));
    assert_eq!(
        db.content_text(msg).await.expect("queries"),
        Some("hello world".to_owned())
    );
    assert_eq!(db.cursor(&stream).await.expect("queries"), 3);
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn writer_heartbeat_claim_and_steal() {
    let kv = Arc::new(KvStore::open_in_memory().await.expect("kv opens"));

    let first = WriterHeartbeat::try_claim(kv.clone(), "tab-1")
        .await
        .expect("claims")
        .expect("free writership");
    assert_eq!(first.writer_id(), "tab-1");

    // A live heartbeat blocks other claimants
    assert!(WriterHeartbeat::try_claim(kv.clone(), "tab-2")
        .await
        .expect("claims")
        .is_none());

    // A stale record authorizes the steal
    drop(first);
    let stale = HeartbeatRecord {
        writer_id: "tab-1".into(),
        at: roomy_core::Timestamp::from(0u64),
    };
    kv.put_json(HEARTBEAT_SUBLEVEL, HEARTBEAT_KEY, &stale)
        .await
        .expect("puts");
    let second = WriterHeartbeat::try_claim(kv.clone(), "tab-2")
        .await
        .expect("claims")
        .expect("steals stale writership");
    assert_eq!(second.writer_id(), "tab-2");
}
