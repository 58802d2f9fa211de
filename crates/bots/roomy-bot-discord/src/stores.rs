//! Durable bridge state on the shared KV store.
//!
//! Sublevel layout (all scoped per `(guild, space)` pair unless noted):
//!
//! - `registeredBridges` (global) - `guildId_<id> → spaceId`,
//!   `spaceId_<id> → guildId`
//! - `syncedIds:<g>:<s>` - bidirectional discord↔roomy id map,
//!   snowflake keys prefixed with their kind
//! - `syncedProfiles:<g>:<s>` - discord user id → profile hash (and the
//!   cached profile for author overrides)
//! - `syncedReactions:<g>:<s>` - `<msg>:<user>:<emoji> → reaction event
//!   id`, plus `rev:<event id> → reaction triple` for the reverse path
//! - `syncedEdits:<g>:<s>` - message id → `{editedTimestamp,
//!   contentHash}`
//! - `syncedSidebarHash:<g>:<s>` - `sidebar → hash`
//! - `discordWebhookTokens:<g>:<s>` - channel id → `webhookId:token`
//! - `leafCursors` (global) - stream id → last applied idx
//!
//! Mapping registration plus its idempotency fingerprints always land in
//! ONE atomic batch, so a crash between "sent the event" and "remembered
//! it" can only lose the whole step, never half of it.

use std::collections::HashSet;
use std::sync::Arc;

use roomy_core::EntityId;
use roomy_kv::{BatchOp, KvResult, KvStore};
use serde::{Deserialize, Serialize};

pub const REGISTERED_BRIDGES_SUBLEVEL: &str = "registeredBridges";
pub const LEAF_CURSORS_SUBLEVEL: &str = "leafCursors";

pub const BRIDGE_WEBHOOK_NAME: &str = "Roomy Bridge";
/// Discord caps webhooks per channel at 15.
pub const MAX_WEBHOOKS_PER_CHANNEL: usize = 15;

/// Kinds of Discord objects in the id map; the prefix disambiguates
/// snowflakes that could otherwise collide across object kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdKind {
    Channel,
    Thread,
    Message,
    User,
    Role,
}

impl IdKind {
    fn prefix(self) -> &'static str {
        match self {
            IdKind::Channel => "discord_channel_",
            IdKind::Thread => "discord_thread_",
            IdKind::Message => "discord_message_",
            IdKind::User => "discord_user_",
            IdKind::Role => "discord_role_",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditMarker {
    pub edited_timestamp: u64,
    pub content_hash: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedProfile {
    pub hash: String,
    pub username: String,
    #[serde(default)]
    pub global_name: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReactionTriple {
    pub channel_id: String,
    pub message_id: String,
    pub user_id: String,
    pub emoji: String,
}

pub fn profile_fingerprint(
    username: &str,
    global_name: Option<&str>,
    avatar_url: Option<&str>,
) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(username.as_bytes());
    hasher.update(b"\x00");
    hasher.update(global_name.unwrap_or_default().as_bytes());
    hasher.update(b"\x00");
    hasher.update(avatar_url.unwrap_or_default().as_bytes());
    data_encoding::HEXLOWER.encode(hasher.finalize().as_bytes())
}

pub fn content_fingerprint(content: &str) -> String {
    data_encoding::HEXLOWER.encode(blake3::hash(content.as_bytes()).as_bytes())
}

/// All per-pair durable stores of one bridge.
#[derive(Clone)]
pub struct BridgeStores {
    kv: Arc<KvStore>,
    guild_id: String,
    space_id: String,
}

impl BridgeStores {
    pub fn new(kv: Arc<KvStore>, guild_id: &str, space_id: &str) -> Self {
        Self {
            kv,
            guild_id: guild_id.to_owned(),
            space_id: space_id.to_owned(),
        }
    }

    pub fn kv(&self) -> &Arc<KvStore> {
        &self.kv
    }

    fn scoped(&self, base: &str) -> String {
        format!("{base}:{}:{}", self.guild_id, self.space_id)
    }

    pub fn ids_sublevel(&self) -> String {
        self.scoped("syncedIds")
    }

    pub fn profiles_sublevel(&self) -> String {
        self.scoped("syncedProfiles")
    }

    pub fn reactions_sublevel(&self) -> String {
        self.scoped("syncedReactions")
    }

    pub fn edits_sublevel(&self) -> String {
        self.scoped("syncedEdits")
    }

    pub fn sidebar_sublevel(&self) -> String {
        self.scoped("syncedSidebarHash")
    }

    pub fn webhooks_sublevel(&self) -> String {
        self.scoped("discordWebhookTokens")
    }

    // ── registry ────────────────────────────────────────────────────

    pub async fn register_bridge(&self) -> KvResult<()> {
        self.kv
            .batch(vec![
                BatchOp::put(
                    REGISTERED_BRIDGES_SUBLEVEL,
                    format!("guildId_{}", self.guild_id),
                    self.space_id.clone().into_bytes(),
                ),
                BatchOp::put(
                    REGISTERED_BRIDGES_SUBLEVEL,
                    format!("spaceId_{}", self.space_id),
                    self.guild_id.clone().into_bytes(),
                ),
            ])
            .await
    }

    pub async fn registered_space_for_guild(&self, guild_id: &str) -> KvResult<Option<String>> {
        Ok(self
            .kv
            .get(REGISTERED_BRIDGES_SUBLEVEL, &format!("guildId_{guild_id}"))
            .await?
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    }

    // ── id map ──────────────────────────────────────────────────────

    pub fn discord_key(kind: IdKind, snowflake: &str) -> String {
        format!("{}{snowflake}", kind.prefix())
    }

    pub fn roomy_key(entity: EntityId) -> String {
        format!("roomy_{entity}")
    }

    /// Both directions of a discord↔roomy mapping as batch ops.
    pub fn mapping_ops(&self, kind: IdKind, snowflake: &str, entity: EntityId) -> Vec<BatchOp> {
        let sublevel = self.ids_sublevel();
        vec![
            BatchOp::put(
                sublevel.clone(),
                Self::discord_key(kind, snowflake),
                entity.to_string().into_bytes(),
            ),
            BatchOp::put(
                sublevel,
                Self::roomy_key(entity),
                format!("{}{snowflake}", kind.prefix()).into_bytes(),
            ),
        ]
    }

    /// Message mappings carry the channel in the reverse direction so
    /// later edits/deletes/reactions can address the REST API, which
    /// always wants `(channel, message)`.
    pub fn message_mapping_ops(
        &self,
        channel_id: &str,
        message_id: &str,
        entity: EntityId,
    ) -> Vec<BatchOp> {
        let sublevel = self.ids_sublevel();
        vec![
            BatchOp::put(
                sublevel.clone(),
                Self::discord_key(IdKind::Message, message_id),
                entity.to_string().into_bytes(),
            ),
            BatchOp::put(
                sublevel,
                Self::roomy_key(entity),
                format!(
                    "{}{channel_id}/{message_id}",
                    IdKind::Message.prefix()
                )
                .into_bytes(),
            ),
        ]
    }

    pub async fn discord_to_roomy(
        &self,
        kind: IdKind,
        snowflake: &str,
    ) -> KvResult<Option<EntityId>> {
        Ok(self
            .kv
            .get(&self.ids_sublevel(), &Self::discord_key(kind, snowflake))
            .await?
            .and_then(|bytes| String::from_utf8_lossy(&bytes).parse().ok()))
    }

    /// Reverse lookup; returns the kind-prefixed discord key.
    pub async fn roomy_to_discord(
        &self,
        entity: EntityId,
    ) -> KvResult<Option<(IdKind, String)>> {
        Ok(self
            .kv
            .get(&self.ids_sublevel(), &Self::roomy_key(entity))
            .await?
            .and_then(|bytes| {
                let value = String::from_utf8_lossy(&bytes).into_owned();
                for kind in [
                    IdKind::Channel,
                    IdKind::Thread,
                    IdKind::Message,
                    IdKind::User,
                    IdKind::Role,
                ] {
                    if let Some(snowflake) = value.strip_prefix(kind.prefix()) {
                        return Some((kind, snowflake.to_owned()));
                    }
                }
                None
            }))
    }

    pub async fn id_map_is_empty(&self) -> KvResult<bool> {
        Ok(self.kv.iter_prefix(&self.ids_sublevel(), "").await?.is_empty())
    }

    // ── profiles ────────────────────────────────────────────────────

    pub async fn cached_profile(&self, user_id: &str) -> KvResult<Option<CachedProfile>> {
        self.kv.get_json(&self.profiles_sublevel(), user_id).await
    }

    pub fn profile_ops(&self, user_id: &str, profile: &CachedProfile) -> Vec<BatchOp> {
        vec![BatchOp::put_json(
            self.profiles_sublevel(),
            user_id,
            profile,
        )]
    }

    // ── reactions ───────────────────────────────────────────────────

    pub fn reaction_key(message_id: &str, user_id: &str, emoji: &str) -> String {
        format!("{message_id}:{user_id}:{emoji}")
    }

    pub async fn reaction_event(
        &self,
        message_id: &str,
        user_id: &str,
        emoji: &str,
    ) -> KvResult<Option<EntityId>> {
        Ok(self
            .kv
            .get(
                &self.reactions_sublevel(),
                &Self::reaction_key(message_id, user_id, emoji),
            )
            .await?
            .and_then(|bytes| String::from_utf8_lossy(&bytes).parse().ok()))
    }

    /// Forward and reverse entries together; the reverse entry is what
    /// lets a later stream-side removal find its Discord coordinates.
    pub fn reaction_ops(
        &self,
        triple: &ReactionTriple,
        event_id: EntityId,
    ) -> Vec<BatchOp> {
        let sublevel = self.reactions_sublevel();
        vec![
            BatchOp::put(
                sublevel.clone(),
                Self::reaction_key(&triple.message_id, &triple.user_id, &triple.emoji),
                event_id.to_string().into_bytes(),
            ),
            BatchOp::put_json(sublevel, format!("rev:{event_id}"), triple),
        ]
    }

    pub async fn reaction_triple(&self, event_id: EntityId) -> KvResult<Option<ReactionTriple>> {
        self.kv
            .get_json(&self.reactions_sublevel(), &format!("rev:{event_id}"))
            .await
    }

    pub fn reaction_delete_ops(
        &self,
        triple: &ReactionTriple,
        event_id: EntityId,
    ) -> Vec<BatchOp> {
        let sublevel = self.reactions_sublevel();
        vec![
            BatchOp::delete(
                sublevel.clone(),
                Self::reaction_key(&triple.message_id, &triple.user_id, &triple.emoji),
            ),
            BatchOp::delete(sublevel, format!("rev:{event_id}")),
        ]
    }

    // ── edits ───────────────────────────────────────────────────────

    pub async fn edit_marker(&self, message_id: &str) -> KvResult<Option<EditMarker>> {
        self.kv.get_json(&self.edits_sublevel(), message_id).await
    }

    pub fn edit_marker_ops(&self, message_id: &str, marker: &EditMarker) -> Vec<BatchOp> {
        vec![BatchOp::put_json(self.edits_sublevel(), message_id, marker)]
    }

    // ── sidebar ─────────────────────────────────────────────────────

    pub async fn sidebar_hash(&self) -> KvResult<Option<String>> {
        Ok(self
            .kv
            .get(&self.sidebar_sublevel(), "sidebar")
            .await?
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    }

    pub async fn set_sidebar_hash(&self, hash: &str) -> KvResult<()> {
        self.kv
            .put(&self.sidebar_sublevel(), "sidebar", hash.as_bytes().to_vec())
            .await
    }

    // ── webhooks ────────────────────────────────────────────────────

    pub async fn webhook_token(&self, channel_id: &str) -> KvResult<Option<(String, String)>> {
        Ok(self
            .kv
            .get(&self.webhooks_sublevel(), channel_id)
            .await?
            .and_then(|bytes| {
                let value = String::from_utf8_lossy(&bytes).into_owned();
                value
                    .split_once(':')
                    .map(|(id, token)| (id.to_owned(), token.to_owned()))
            }))
    }

    pub async fn set_webhook_token(
        &self,
        channel_id: &str,
        webhook_id: &str,
        token: &str,
    ) -> KvResult<()> {
        self.kv
            .put(
                &self.webhooks_sublevel(),
                channel_id,
                format!("{webhook_id}:{token}").into_bytes(),
            )
            .await
    }

    pub async fn clear_webhook_token(&self, channel_id: &str) -> KvResult<()> {
        self.kv.delete(&self.webhooks_sublevel(), channel_id).await
    }

    /// Channels that currently have a bridge webhook.
    pub async fn webhook_channel_ids(&self) -> KvResult<Vec<String>> {
        Ok(self
            .kv
            .iter_prefix(&self.webhooks_sublevel(), "")
            .await?
            .into_iter()
            .map(|(channel_id, _)| channel_id)
            .collect())
    }

    /// Ids of every webhook this bridge created, across channels. Used
    /// to recognize our own messages echoing back over the gateway.
    pub async fn own_webhook_ids(&self) -> KvResult<HashSet<String>> {
        Ok(self
            .kv
            .iter_prefix(&self.webhooks_sublevel(), "")
            .await?
            .into_iter()
            .filter_map(|(_, value)| {
                let value = String::from_utf8_lossy(&value).into_owned();
                value.split_once(':').map(|(id, _)| id.to_owned())
            })
            .collect())
    }

    /// Track the newest bridged message per channel; thread creation
    /// anchors on it.
    pub async fn set_last_channel_message(
        &self,
        channel_id: &str,
        message_id: &str,
    ) -> KvResult<()> {
        self.kv
            .put(
                &self.ids_sublevel(),
                &format!("last_message_{channel_id}"),
                message_id.as_bytes().to_vec(),
            )
            .await
    }

    pub async fn last_channel_message(&self, channel_id: &str) -> KvResult<Option<String>> {
        Ok(self
            .kv
            .get(&self.ids_sublevel(), &format!("last_message_{channel_id}"))
            .await?
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    }

    // ── roles / pending threads ─────────────────────────────────────

    pub async fn admin_role(&self) -> KvResult<Option<String>> {
        Ok(self
            .kv
            .get(&self.ids_sublevel(), "admin_role")
            .await?
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    }

    pub async fn set_admin_role(&self, role_id: &str) -> KvResult<()> {
        self.kv
            .put(
                &self.ids_sublevel(),
                "admin_role",
                role_id.as_bytes().to_vec(),
            )
            .await
    }

    /// Thread rooms arrive as `createRoom` before their creation link;
    /// the name waits here until the link triggers the Discord call.
    pub async fn set_pending_thread_name(&self, room: EntityId, name: &str) -> KvResult<()> {
        self.kv
            .put(
                &self.ids_sublevel(),
                &format!("pending_thread_{room}"),
                name.as_bytes().to_vec(),
            )
            .await
    }

    pub async fn pending_thread_name(&self, room: EntityId) -> KvResult<Option<String>> {
        Ok(self
            .kv
            .get(&self.ids_sublevel(), &format!("pending_thread_{room}"))
            .await?
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    }

    // ── cursor ──────────────────────────────────────────────────────

    pub async fn cursor(&self, stream_id: &str) -> KvResult<u64> {
        Ok(self
            .kv
            .get_json::<u64>(LEAF_CURSORS_SUBLEVEL, stream_id)
            .await?
            .unwrap_or(0))
    }

    pub async fn set_cursor(&self, stream_id: &str, idx: u64) -> KvResult<()> {
        self.kv.put_json(LEAF_CURSORS_SUBLEVEL, stream_id, &idx).await
    }
}
