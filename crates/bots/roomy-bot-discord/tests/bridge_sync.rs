//! End-to-end bridge behavior against the mock Discord API and the
//! in-memory stream transport.

use std::str::FromStr as _;
use std::sync::Arc;
use std::time::{Duration, Instant};

use roomy_bot_discord::discord::{
    DiscordApiError, DiscordAttachment, DiscordChannel, DiscordChannelKind, DiscordMessage,
    DiscordReaction, DiscordUser, RecordedCall,
};
use roomy_bot_discord::stores::IdKind;
use roomy_bot_discord::{Bridge, BridgeConfig, DiscordEvent, MockDiscord};
use roomy_client::{MemoryTransport, Transport as _};
use roomy_core::event::{AddReaction, Content, CreateMessage, EventKind, RemoveReaction};
use roomy_core::{EntityId, Event, StreamId, UserDid};
use roomy_kv::KvStore;

fn space_stream() -> StreamId {
    StreamId::from_str("did:memory:bridged-space").expect("valid")
}

fn bot_did() -> UserDid {
    UserDid::from_str("did:web:bridge.roomy.space").expect("valid")
}

fn alice_discord() -> DiscordUser {
    DiscordUser {
        id: "100".into(),
        username: "alice".into(),
        global_name: Some("Alice".into()),
        avatar_url: Some("https://cdn.example/alice.png".into()),
        bot: false,
    }
}

fn discord_message(id: &str, channel_id: &str, content: &str) -> DiscordMessage {
    DiscordMessage {
        id: id.into(),
        channel_id: channel_id.into(),
        guild_id: Some("g1".into()),
        author: alice_discord(),
        content: content.into(),
        attachments: vec![],
        referenced_message_id: None,
        edited_timestamp_ms: None,
    }
}

fn seeded_channel(id: &str, name: &str) -> DiscordChannel {
    DiscordChannel {
        id: id.into(),
        name: name.into(),
        kind: DiscordChannelKind::Text,
        topic: None,
        parent_id: None,
    }
}

struct Harness {
    bridge: Arc<Bridge>,
    discord: Arc<MockDiscord>,
    transport: Arc<MemoryTransport>,
    space: StreamId,
}

async fn harness() -> Harness {
    let space = space_stream();
    let kv = Arc::new(KvStore::open_in_memory().await.expect("kv opens"));
    let discord = Arc::new(MockDiscord::new());
    let transport = Arc::new(MemoryTransport::new(bot_did()));
    transport.register_stream(space.clone());

    let bridge = Arc::new(Bridge::new(
        BridgeConfig {
            guild_id: "g1".into(),
            space_stream: space.clone(),
            bot_user_id: "555".into(),
            bot_did: bot_did(),
        },
        kv,
        discord.clone(),
        transport.clone(),
    ));
    Harness {
        bridge,
        discord,
        transport,
        space,
    }
}

async fn appended_events(harness: &Harness) -> Vec<Event> {
    harness
        .transport
        .fetch_events(&harness.space, 0, 1000)
        .await
        .expect("fetches")
        .iter()
        .map(|entry| Event::decode(&entry.payload).expect("decodes"))
        .collect()
}

fn roomy_message(room: Option<EntityId>, text: &str) -> Event {
    let mut event = Event::new(
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
    );
    if let Some(room) = room {
        event = event.in_room(room);
    }
    event
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn discord_message_bridges_once() {
    let harness = harness().await;
    harness.discord.seed_channel(seeded_channel("c1", "general"));

    harness
        .bridge
        .handle_discord_event(DiscordEvent::MessageCreate(discord_message(
            "m1", "c1", "hello from discord",
        )))
        .await
        .expect("handles");

    let events = appended_events(&harness).await;
    // createRoom for the channel, updateSidebar, and the message
    assert!(events
        .iter()
        .any(|event| matches!(event.kind, EventKind::CreateRoom(_))));
    let message = events
        .iter()
        .find(|event| matches!(event.kind, EventKind::CreateMessage(_)))
        .expect("message bridged");
    assert!(message.has_discord_origin());
    assert_eq!(
        message.discord_origin().expect("origin").snowflake,
        "m1"
    );
    let EventKind::CreateMessage(fields) = &message.kind else {
        unreachable!()
    };
    assert_eq!(fields.body.data, b"hello from discord");
    assert_eq!(
        fields.author_override.as_ref().map(|a| a.name.as_str()),
        Some("Alice")
    );
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn replaying_discord_events_is_idempotent() {
    let harness = harness().await;
    harness.discord.seed_channel(seeded_channel("c1", "general"));

    let create = DiscordEvent::MessageCreate(discord_message("m1", "c1", "hello"));
    let reaction = DiscordEvent::MessageReactionAdd(DiscordReaction {
        channel_id: "c1".into(),
        message_id: "m1".into(),
        user_id: "100".into(),
        emoji: "👍".into(),
    });

    harness.bridge.handle_discord_event(create.clone()).await.expect("handles");
    harness.bridge.handle_discord_event(reaction.clone()).await.expect("handles");
    let baseline = harness.transport.entry_count(&harness.space);

    // Crash replay: the same window of gateway events again
    harness.bridge.handle_discord_event(create).await.expect("handles");
    harness.bridge.handle_discord_event(reaction).await.expect("handles");
    assert_eq!(harness.transport.entry_count(&harness.space), baseline);
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn self_originated_events_cause_no_rest_calls() {
    let harness = harness().await;
    harness.discord.seed_channel(seeded_channel("c1", "general"));

    // Bridge a Discord message; the emitted event carries its origin
    harness
        .bridge
        .handle_discord_event(DiscordEvent::MessageCreate(discord_message(
            "m1", "c1", "round and round",
        )))
        .await
        .expect("handles");
    let events = appended_events(&harness).await;
    let entries = harness
        .transport
        .fetch_events(&harness.space, 0, 1000)
        .await
        .expect("fetches");

    let calls_before = harness.discord.call_count();
    let appended_before = harness.transport.entry_count(&harness.space);

    // The subscription loop now delivers every bridged event back
    for entry in &entries {
        harness
            .bridge
            .handle_stream_event(&entry.user, &entry.payload)
            .await
            .expect("handles");
    }

    assert_eq!(harness.discord.call_count(), calls_before, "echo caused a REST call");
    assert_eq!(
        harness.transport.entry_count(&harness.space),
        appended_before
    );
    assert!(events.iter().all(|event| event.has_discord_origin()));
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn webhook_rate_limit_is_retried() {
    let harness = harness().await;
    harness
        .discord
        .script_webhook_failures(vec![DiscordApiError::RateLimited {
            retry_after_secs: 0.1,
        }]);

    let room = EntityId::now();
    let event = roomy_message(Some(room), "over the limit");
    let started = Instant::now();
    harness
        .bridge
        .handle_stream_event(&bot_did(), &event.encode())
        .await
        .expect("handles");
    let elapsed = started.elapsed();

    let executes = harness
        .discord
        .calls()
        .into_iter()
        .filter(|call| matches!(call, RecordedCall::ExecuteWebhook { .. }))
        .count();
    assert_eq!(executes, 2);
    assert!(
        Duration::from_millis(100) <= elapsed,
        "retry_after was not honoured: {elapsed:?}"
    );
    // Delivered in the end: the message mapping exists
    assert!(harness
        .bridge
        .stores()
        .roomy_to_discord(event.id)
        .await
        .expect("queries")
        .is_some());
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn dead_webhook_is_recreated_once() {
    let harness = harness().await;
    harness
        .discord
        .script_webhook_failures(vec![DiscordApiError::NotFound]);

    let event = roomy_message(Some(EntityId::now()), "hook is gone");
    harness
        .bridge
        .handle_stream_event(&bot_did(), &event.encode())
        .await
        .expect("handles");

    // First attempt 404s, the cache is cleared, the webhook is resolved
    // afresh, and the second attempt delivers.
    let calls = harness.discord.calls();
    let executes = calls
        .iter()
        .filter(|call| matches!(call, RecordedCall::ExecuteWebhook { .. }))
        .count();
    let lookups = calls
        .iter()
        .filter(|call| matches!(call, RecordedCall::GetChannelWebhooks { .. }))
        .count();
    assert_eq!(executes, 2);
    assert_eq!(lookups, 2);
    assert!(harness
        .bridge
        .stores()
        .roomy_to_discord(event.id)
        .await
        .expect("queries")
        .is_some());
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn stream_message_replay_is_idempotent() {
    let harness = harness().await;
    let event = roomy_message(Some(EntityId::now()), "deliver once");

    harness
        .bridge
        .handle_stream_event(&bot_did(), &event.encode())
        .await
        .expect("handles");
    let executes_before = harness
        .discord
        .calls()
        .into_iter()
        .filter(|call| matches!(call, RecordedCall::ExecuteWebhook { .. }))
        .count();

    harness
        .bridge
        .handle_stream_event(&bot_did(), &event.encode())
        .await
        .expect("handles");
    let executes_after = harness
        .discord
        .calls()
        .into_iter()
        .filter(|call| matches!(call, RecordedCall::ExecuteWebhook { .. }))
        .count();
    assert_eq!(executes_before, executes_after);
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn edit_idempotence_is_timestamp_primary_hash_secondary() {
    let harness = harness().await;
    harness.discord.seed_channel(seeded_channel("c1", "general"));

    harness
        .bridge
        .handle_discord_event(DiscordEvent::MessageCreate(discord_message(
            "m1", "c1", "original",
        )))
        .await
        .expect("handles");
    let baseline = harness.transport.entry_count(&harness.space);

    // A real edit with a newer timestamp
    let mut edit = discord_message("m1", "c1", "edited");
    edit.edited_timestamp_ms = Some(2_000_000_000_000);
    harness
        .bridge
        .handle_discord_event(DiscordEvent::MessageUpdate(edit.clone()))
        .await
        .expect("handles");
    assert_eq!(harness.transport.entry_count(&harness.space), baseline + 1);

    // Same timestamp, same content: duplicate, skipped
    harness
        .bridge
        .handle_discord_event(DiscordEvent::MessageUpdate(edit.clone()))
        .await
        .expect("handles");
    assert_eq!(harness.transport.entry_count(&harness.space), baseline + 1);

    // Same timestamp, different content: conflict, Discord wins
    let mut conflict = edit.clone();
    conflict.content = "edited differently".into();
    harness
        .bridge
        .handle_discord_event(DiscordEvent::MessageUpdate(conflict))
        .await
        .expect("handles");
    assert_eq!(harness.transport.entry_count(&harness.space), baseline + 2);

    // An older edit arriving late: skipped
    let mut stale = edit;
    stale.edited_timestamp_ms = Some(1_000_000_000_000);
    stale.content = "from the past".into();
    harness
        .bridge
        .handle_discord_event(DiscordEvent::MessageUpdate(stale))
        .await
        .expect("handles");
    assert_eq!(harness.transport.entry_count(&harness.space), baseline + 2);
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn reaction_removal_resolves_reverse_mapping() {
    let harness = harness().await;

    // A roomy-native reaction on a bridged message
    let message = roomy_message(Some(EntityId::now()), "react to me");
    harness
        .bridge
        .handle_stream_event(&bot_did(), &message.encode())
        .await
        .expect("handles");

    let add = Event::new(
        EntityId::now(),
        EventKind::AddReaction(AddReaction {
            target: message.id,
            emoji: "🎉".into(),
        }),
    );
    harness
        .bridge
        .handle_stream_event(&bot_did(), &add.encode())
        .await
        .expect("handles");
    assert!(harness
        .discord
        .calls()
        .iter()
        .any(|call| matches!(call, RecordedCall::AddReaction { emoji, .. } if emoji == "🎉")));

    // Removal finds the Discord coordinates through the reverse entry
    let remove = Event::new(
        EntityId::now(),
        EventKind::RemoveReaction(RemoveReaction { reaction: add.id }),
    );
    harness
        .bridge
        .handle_stream_event(&bot_did(), &remove.encode())
        .await
        .expect("handles");
    assert!(harness
        .discord
        .calls()
        .iter()
        .any(|call| matches!(call, RecordedCall::RemoveReaction { emoji, .. } if emoji == "🎉")));
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn discord_thread_becomes_room_plus_creation_link() {
    let harness = harness().await;
    harness.discord.seed_channel(seeded_channel("c1", "general"));

    harness
        .bridge
        .handle_discord_event(DiscordEvent::ThreadCreate(DiscordChannel {
            id: "t1".into(),
            name: "a thread".into(),
            kind: DiscordChannelKind::PublicThread,
            topic: None,
            parent_id: Some("c1".into()),
        }))
        .await
        .expect("handles");

    let events = appended_events(&harness).await;
    let room = events
        .iter()
        .find_map(|event| match &event.kind {
            EventKind::CreateRoom(fields)
                if fields.kind == roomy_core::event::RoomKind::Thread =>
            {
                Some(event.id)
            }
            _ => None,
        })
        .expect("thread room event");
    let link = events
        .iter()
        .find_map(|event| match &event.kind {
            EventKind::CreateRoomLink(fields) => Some(fields.clone()),
            _ => None,
        })
        .expect("creation link event");
    assert_eq!(link.link_to_room, room);
    assert!(link.is_creation_link);
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn sidebar_hash_skips_noop_updates() {
    let harness = harness().await;
    harness.discord.seed_channel(seeded_channel("c1", "general"));
    harness
        .bridge
        .handle_discord_event(DiscordEvent::ChannelCreate(seeded_channel("c1", "general")))
        .await
        .expect("handles");

    let baseline = harness.transport.entry_count(&harness.space);
    // Nothing changed on Discord: the normalized hash matches, no event
    let wrote = harness.bridge.sync_sidebar().await.expect("syncs");
    assert!(!wrote);
    assert_eq!(harness.transport.entry_count(&harness.space), baseline);
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn channel_recovery_rebuilds_map_without_events() {
    let harness = harness().await;
    let room = EntityId::now();
    harness.discord.seed_channel(DiscordChannel {
        id: "c9".into(),
        name: "restored".into(),
        kind: DiscordChannelKind::Text,
        topic: Some(format!("roomy-bridge:{}:{room}", harness.space)),
        parent_id: None,
    });
    harness.discord.seed_channel(seeded_channel("c10", "unmarked"));

    let recovered = harness.bridge.recover_channels().await.expect("recovers");
    assert_eq!(recovered, 1);
    assert_eq!(harness.transport.entry_count(&harness.space), 0);
    assert_eq!(
        harness
            .bridge
            .stores()
            .discord_to_roomy(IdKind::Channel, "c9")
            .await
            .expect("queries"),
        Some(room)
    );

    // A message in the recovered channel lands in the mapped room
    harness
        .bridge
        .handle_discord_event(DiscordEvent::MessageCreate(discord_message(
            "m1", "c9", "back again",
        )))
        .await
        .expect("handles");
    let events = appended_events(&harness).await;
    let message = events
        .iter()
        .find(|event| matches!(event.kind, EventKind::CreateMessage(_)))
        .expect("message bridged");
    assert_eq!(message.room, Some(room));
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn message_delete_becomes_tombstone_edit() {
    let harness = harness().await;
    harness.discord.seed_channel(seeded_channel("c1", "general"));
    harness
        .bridge
        .handle_discord_event(DiscordEvent::MessageCreate(discord_message(
            "m1", "c1", "soon gone",
        )))
        .await
        .expect("handles");

    harness
        .bridge
        .handle_discord_event(DiscordEvent::MessageDelete {
            channel_id: "c1".into(),
            message_id: "m1".into(),
        })
        .await
        .expect("handles");

    let events = appended_events(&harness).await;
    let edit = events
        .iter()
        .find_map(|event| match &event.kind {
            EventKind::EditMessage(fields) => Some(fields.clone()),
            _ => None,
        })
        .expect("tombstone edit");
    assert!(edit.body.data.is_empty());

    // Replay of the delete is a no-op
    let baseline = harness.transport.entry_count(&harness.space);
    harness
        .bridge
        .handle_discord_event(DiscordEvent::MessageDelete {
            channel_id: "c1".into(),
            message_id: "m1".into(),
        })
        .await
        .expect("handles");
    assert_eq!(harness.transport.entry_count(&harness.space), baseline);
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn attachments_classify_by_mime_prefix() {
    let harness = harness().await;
    harness.discord.seed_channel(seeded_channel("c1", "media"));

    let mut message = discord_message("m1", "c1", "look at these");
    message.attachments = vec![
        DiscordAttachment {
            url: "https://cdn.example/a.png".into(),
            filename: "a.png".into(),
            content_type: Some("image/png".into()),
            size: Some(1234),
            width: Some(640),
            height: Some(480),
        },
        DiscordAttachment {
            url: "https://cdn.example/b.mp4".into(),
            filename: "b.mp4".into(),
            content_type: Some("video/mp4".into()),
            size: Some(99999),
            width: None,
            height: None,
        },
        DiscordAttachment {
            url: "https://cdn.example/c.pdf".into(),
            filename: "c.pdf".into(),
            content_type: Some("application/pdf".into()),
            size: Some(4321),
            width: None,
            height: None,
        },
    ];
    harness
        .bridge
        .handle_discord_event(DiscordEvent::MessageCreate(message))
        .await
        .expect("handles");

    let events = appended_events(&harness).await;
    let fields = events
        .iter()
        .find_map(|event| match &event.kind {
            EventKind::CreateMessage(fields) => Some(fields.clone()),
            _ => None,
        })
        .expect("message bridged");
    let mimes: Vec<&str> = fields
        .attachments
        .iter()
        .map(|attachment| attachment.mime_type.as_str())
        .collect();
    assert_eq!(mimes, vec!["image/png", "video/mp4", "application/pdf"]);
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn catch_up_advances_cursor_and_survives_replay() {
    let harness = harness().await;

    // Two roomy events already in the stream before the bridge wakes up
    let m1 = roomy_message(Some(EntityId::now()), "first");
    let m2 = roomy_message(Some(EntityId::now()), "second");
    harness
        .transport
        .push_external(&harness.space, bot_did(), m1.encode());
    harness
        .transport
        .push_external(&harness.space, bot_did(), m2.encode());

    let handled = harness.bridge.catch_up().await.expect("catches up");
    assert_eq!(handled, 2);
    assert_eq!(
        harness
            .bridge
            .stores()
            .cursor(harness.space.as_str())
            .await
            .expect("queries"),
        2
    );

    let executes_before = harness
        .discord
        .calls()
        .into_iter()
        .filter(|call| matches!(call, RecordedCall::ExecuteWebhook { .. }))
        .count();
    assert_eq!(executes_before, 2);

    // A second catch-up from the durable cursor does nothing
    let handled = harness.bridge.catch_up().await.expect("catches up");
    assert_eq!(handled, 0);
}
