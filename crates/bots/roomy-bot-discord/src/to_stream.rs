//! Discord → stream synchronization.
//!
//! Every operation follows the same shape: inspect the idempotency
//! store and early-return when already satisfied, resolve related
//! mappings, refresh the (hash-guarded) profile cache, emit the event
//! with a Discord origin extension, then register mapping + fingerprint
//! in one atomic KV batch. Replaying a window of gateway events after a
//! crash therefore emits zero additional stream events.

use roomy_core::event::ext::{
    self, DiscordOrigin,
};
use roomy_core::event::{
    AddBridgedReaction, Attachment, AuthorOverride, Content, CreateMessage, CreateRoom,
    CreateRoomLink, EditMessage, EventKind, RemoveBridgedReaction, RoomKind, SidebarCategory,
    UpdateSidebar,
};
use roomy_core::{EntityId, Event, Timestamp, UserDid};
use roomy_kv::BatchOp;
use snafu::ResultExt as _;
use tracing::{debug, warn};

use crate::discord::{
    DiscordChannel, DiscordChannelKind, DiscordEvent, DiscordMessage, DiscordReaction,
    DiscordUser, snowflake_timestamp_ms,
};
use crate::stores::{
    CachedProfile, EditMarker, IdKind, ReactionTriple, content_fingerprint,
    profile_fingerprint,
};
use crate::{Bridge, BridgeResult, DiscordSnafu, LOG_TARGET};

impl Bridge {
    pub async fn handle_discord_event(&self, event: DiscordEvent) -> BridgeResult<()> {
        match event {
            DiscordEvent::MessageCreate(message) => {
                self.sync_message_create(message).await?;
            }
            DiscordEvent::MessageUpdate(message) => {
                self.sync_message_update(message).await?;
            }
            DiscordEvent::MessageDelete {
                channel_id,
                message_id,
            } => {
                self.sync_message_delete(&channel_id, &message_id).await?;
            }
            DiscordEvent::MessageReactionAdd(reaction) => {
                self.sync_reaction_add(reaction).await?;
            }
            DiscordEvent::MessageReactionRemove(reaction) => {
                self.sync_reaction_remove(reaction).await?;
            }
            DiscordEvent::ChannelCreate(channel) => {
                self.sync_channel_create(&channel).await?;
            }
            DiscordEvent::ThreadCreate(channel) => {
                self.sync_thread_create(&channel).await?;
            }
        }
        Ok(())
    }

    fn message_origin(&self, snowflake: &str, fingerprint: Option<String>) -> DiscordOrigin {
        DiscordOrigin {
            snowflake: snowflake.to_owned(),
            guild: self.config.guild_id.clone(),
            fingerprint,
        }
    }

    /// True for messages written by one of the bridge's own webhooks:
    /// those are roomy messages echoing back over the gateway.
    async fn is_own_webhook_message(&self, message: &DiscordMessage) -> BridgeResult<bool> {
        if !message.author.bot {
            return Ok(false);
        }
        Ok(self
            .stores
            .own_webhook_ids()
            .await?
            .contains(&message.author.id))
    }

    pub async fn sync_message_create(
        &self,
        message: DiscordMessage,
    ) -> BridgeResult<Option<EntityId>> {
        if self.is_own_webhook_message(&message).await? {
            debug!(target: LOG_TARGET, message = %message.id, "Skipping own webhook echo");
            return Ok(None);
        }
        if self
            .stores
            .discord_to_roomy(IdKind::Message, &message.id)
            .await?
            .is_some()
        {
            debug!(target: LOG_TARGET, message = %message.id, "Message already bridged");
            return Ok(None);
        }

        let room = self.ensure_room_for_channel(&message.channel_id).await?;
        let (profile, profile_ops) = self.ensure_profile(&message.author).await?;

        let reply = match &message.referenced_message_id {
            Some(referenced) => {
                let mapped = self
                    .stores
                    .discord_to_roomy(IdKind::Message, referenced)
                    .await?;
                if mapped.is_none() {
                    warn!(
                        target: LOG_TARGET,
                        message = %message.id,
                        referenced = %referenced,
                        "Reply target not bridged; omitting reply"
                    );
                }
                mapped
            }
            None => None,
        };

        let event_id = EntityId::now();
        let fingerprint = content_fingerprint(&message.content);
        let edited_timestamp = message
            .edited_timestamp_ms
            .or_else(|| snowflake_timestamp_ms(&message.id))
            .unwrap_or_else(|| Timestamp::now().as_millis());

        let event = Event::new(
            event_id,
            EventKind::CreateMessage(CreateMessage {
                body: Content::text(message.content.clone()),
                reply,
                attachments: message.attachments.iter().map(classify_attachment).collect(),
                link: None,
                comment: None,
                author_override: Some(AuthorOverride {
                    name: profile
                        .global_name
                        .clone()
                        .unwrap_or_else(|| profile.username.clone()),
                    avatar: profile.avatar_url.clone(),
                }),
                timestamp_override: snowflake_timestamp_ms(&message.id),
            }),
        )
        .in_room(room)
        .with_discord_origin(
            ext::DISCORD_MESSAGE_ORIGIN,
            &self.message_origin(&message.id, Some(fingerprint.clone())),
        );

        self.send_event(&event).await?;

        let mut ops = self
            .stores
            .message_mapping_ops(&message.channel_id, &message.id, event_id);
        ops.extend(profile_ops);
        ops.extend(self.stores.edit_marker_ops(
            &message.id,
            &EditMarker {
                edited_timestamp,
                content_hash: fingerprint,
            },
        ));
        ops.extend(
            self.stores
                .mapping_ops(IdKind::User, &message.author.id, user_entity_placeholder(&message.author.id)),
        );
        self.stores.kv().batch(ops).await?;

        debug!(target: LOG_TARGET, message = %message.id, event = %event_id, "Message bridged");
        Ok(Some(event_id))
    }

    /// Timestamp-primary, content-hash-secondary edit idempotence: a
    /// newer Discord `editedTimestamp` always wins; the same timestamp
    /// with a matching hash is a duplicate; the same timestamp with a
    /// different hash is a conflict and the Discord value wins.
    pub async fn sync_message_update(
        &self,
        message: DiscordMessage,
    ) -> BridgeResult<Option<EntityId>> {
        if self.is_own_webhook_message(&message).await? {
            return Ok(None);
        }
        let Some(target) = self
            .stores
            .discord_to_roomy(IdKind::Message, &message.id)
            .await?
        else {
            // An edit for a message that predates the bridge: treat the
            // current content as a fresh create.
            return self.sync_message_create(message).await;
        };

        let edited_timestamp = message
            .edited_timestamp_ms
            .or_else(|| snowflake_timestamp_ms(&message.id))
            .unwrap_or_else(|| Timestamp::now().as_millis());
        let content_hash = content_fingerprint(&message.content);

        if let Some(marker) = self.stores.edit_marker(&message.id).await? {
            if edited_timestamp < marker.edited_timestamp {
                debug!(target: LOG_TARGET, message = %message.id, "Stale edit; skipping");
                return Ok(None);
            }
            if edited_timestamp == marker.edited_timestamp {
                if content_hash == marker.content_hash {
                    debug!(target: LOG_TARGET, message = %message.id, "Duplicate edit; skipping");
                    return Ok(None);
                }
                warn!(
                    target: LOG_TARGET,
                    message = %message.id,
                    "Same-timestamp edit conflict; Discord content wins"
                );
            }
        }

        let event_id = EntityId::now();
        let event = Event::new(
            event_id,
            EventKind::EditMessage(EditMessage {
                target,
                body: Content::text(message.content.clone()),
            }),
        )
        .with_discord_origin(
            ext::DISCORD_MESSAGE_ORIGIN,
            &self.message_origin(&message.id, Some(content_hash.clone())),
        );

        self.send_event(&event).await?;
        self.stores
            .kv()
            .batch(self.stores.edit_marker_ops(
                &message.id,
                &EditMarker {
                    edited_timestamp,
                    content_hash,
                },
            ))
            .await?;
        Ok(Some(event_id))
    }

    /// Deletion travels as an edit to empty content: the materializer
    /// clears the body, and the reverse direction recognizes the empty
    /// body as a delete.
    pub async fn sync_message_delete(
        &self,
        _channel_id: &str,
        message_id: &str,
    ) -> BridgeResult<Option<EntityId>> {
        let Some(target) = self
            .stores
            .discord_to_roomy(IdKind::Message, message_id)
            .await?
        else {
            debug!(target: LOG_TARGET, message = %message_id, "Delete for unbridged message");
            return Ok(None);
        };

        let tombstone_hash = content_fingerprint("");
        if let Some(marker) = self.stores.edit_marker(message_id).await? {
            if marker.content_hash == tombstone_hash {
                return Ok(None);
            }
        }

        let event_id = EntityId::now();
        let event = Event::new(
            event_id,
            EventKind::EditMessage(EditMessage {
                target,
                body: Content::text(""),
            }),
        )
        .with_discord_origin(
            ext::DISCORD_MESSAGE_ORIGIN,
            &self.message_origin(message_id, Some(tombstone_hash.clone())),
        );
        self.send_event(&event).await?;
        self.stores
            .kv()
            .batch(self.stores.edit_marker_ops(
                message_id,
                &EditMarker {
                    edited_timestamp: Timestamp::now().as_millis(),
                    content_hash: tombstone_hash,
                },
            ))
            .await?;
        Ok(Some(event_id))
    }

    pub async fn sync_reaction_add(
        &self,
        reaction: DiscordReaction,
    ) -> BridgeResult<Option<EntityId>> {
        if self
            .stores
            .reaction_event(&reaction.message_id, &reaction.user_id, &reaction.emoji)
            .await?
            .is_some()
        {
            debug!(
                target: LOG_TARGET,
                message = %reaction.message_id,
                emoji = %reaction.emoji,
                "Reaction already bridged"
            );
            return Ok(None);
        }
        let Some(target) = self
            .stores
            .discord_to_roomy(IdKind::Message, &reaction.message_id)
            .await?
        else {
            debug!(
                target: LOG_TARGET,
                message = %reaction.message_id,
                "Reaction on unbridged message"
            );
            return Ok(None);
        };

        let reactor: UserDid = format!("did:discord:{}", reaction.user_id)
            .parse()
            .expect("did prefix present");
        let event_id = EntityId::now();
        let event = Event::new(
            event_id,
            EventKind::AddBridgedReaction(AddBridgedReaction {
                target,
                emoji: reaction.emoji.clone(),
                reactor,
            }),
        )
        .with_discord_origin(
            ext::DISCORD_REACTION_ORIGIN,
            &self.message_origin(&reaction.message_id, None),
        );

        self.send_event(&event).await?;
        let triple = ReactionTriple {
            channel_id: reaction.channel_id,
            message_id: reaction.message_id,
            user_id: reaction.user_id,
            emoji: reaction.emoji,
        };
        self.stores
            .kv()
            .batch(self.stores.reaction_ops(&triple, event_id))
            .await?;
        Ok(Some(event_id))
    }

    pub async fn sync_reaction_remove(
        &self,
        reaction: DiscordReaction,
    ) -> BridgeResult<Option<EntityId>> {
        let Some(reaction_event) = self
            .stores
            .reaction_event(&reaction.message_id, &reaction.user_id, &reaction.emoji)
            .await?
        else {
            // Never bridged. Double-check against Discord so a genuinely
            // inconsistent store shows up in the logs.
            let remaining = self
                .discord
                .get_reactions(&reaction.channel_id, &reaction.message_id, &reaction.emoji)
                .await
                .context(DiscordSnafu)?;
            if remaining.iter().any(|user| user.id == reaction.user_id) {
                warn!(
                    target: LOG_TARGET,
                    message = %reaction.message_id,
                    user = %reaction.user_id,
                    "Reaction removal for a reaction Discord still shows"
                );
            }
            return Ok(None);
        };

        let event_id = EntityId::now();
        let event = Event::new(
            event_id,
            EventKind::RemoveBridgedReaction(RemoveBridgedReaction {
                reaction: reaction_event,
            }),
        )
        .with_discord_origin(
            ext::DISCORD_REACTION_ORIGIN,
            &self.message_origin(&reaction.message_id, None),
        );
        self.send_event(&event).await?;

        let triple = ReactionTriple {
            channel_id: reaction.channel_id,
            message_id: reaction.message_id,
            user_id: reaction.user_id,
            emoji: reaction.emoji,
        };
        self.stores
            .kv()
            .batch(self.stores.reaction_delete_ops(&triple, reaction_event))
            .await?;
        Ok(Some(event_id))
    }

    pub async fn sync_channel_create(
        &self,
        channel: &DiscordChannel,
    ) -> BridgeResult<Option<EntityId>> {
        if channel.kind == DiscordChannelKind::PublicThread {
            return self.sync_thread_create(channel).await;
        }
        if self
            .stores
            .discord_to_roomy(IdKind::Channel, &channel.id)
            .await?
            .is_some()
        {
            return Ok(None);
        }

        let kind = match channel.kind {
            DiscordChannelKind::Category => RoomKind::Category,
            _ => RoomKind::Channel,
        };
        let room_id = EntityId::now();
        let mut event = Event::new(
            room_id,
            EventKind::CreateRoom(CreateRoom {
                kind,
                name: Some(channel.name.clone()),
            }),
        )
        .with_discord_origin(
            ext::DISCORD_CHANNEL_ORIGIN,
            &self.message_origin(&channel.id, None),
        );
        if let Some(parent) = &channel.parent_id {
            if let Some(parent_room) = self
                .stores
                .discord_to_roomy(IdKind::Channel, parent)
                .await?
            {
                event = event.in_room(parent_room);
            }
        }

        self.send_event(&event).await?;
        self.stores
            .kv()
            .batch(
                self.stores
                    .mapping_ops(IdKind::Channel, &channel.id, room_id),
            )
            .await?;

        self.sync_sidebar().await?;
        Ok(Some(room_id))
    }

    /// A Discord thread becomes two stream events: the thread room and a
    /// creation link from the parent room.
    pub async fn sync_thread_create(
        &self,
        channel: &DiscordChannel,
    ) -> BridgeResult<Option<EntityId>> {
        if self
            .stores
            .discord_to_roomy(IdKind::Thread, &channel.id)
            .await?
            .is_some()
        {
            return Ok(None);
        }
        let Some(parent_id) = &channel.parent_id else {
            warn!(target: LOG_TARGET, thread = %channel.id, "Thread without parent channel");
            return Ok(None);
        };
        let parent_room = Box::pin(self.ensure_room_for_channel(parent_id)).await?;

        let thread_room = EntityId::now();
        let origin = self.message_origin(&channel.id, None);
        let create = Event::new(
            thread_room,
            EventKind::CreateRoom(CreateRoom {
                kind: RoomKind::Thread,
                name: Some(channel.name.clone()),
            }),
        )
        .with_discord_origin(ext::DISCORD_THREAD_ORIGIN, &origin);
        let link = Event::new(
            EntityId::now(),
            EventKind::CreateRoomLink(CreateRoomLink {
                room: parent_room,
                link_to_room: thread_room,
                is_creation_link: true,
            }),
        )
        .with_discord_origin(ext::DISCORD_THREAD_ORIGIN, &origin);

        self.send_event(&create).await?;
        self.send_event(&link).await?;
        self.stores
            .kv()
            .batch(
                self.stores
                    .mapping_ops(IdKind::Thread, &channel.id, thread_room),
            )
            .await?;
        Ok(Some(thread_room))
    }

    /// Emit an `updateSidebar` reflecting the guild's channel layout,
    /// unless the stable hash over the normalized structure matches the
    /// last one written.
    pub async fn sync_sidebar(&self) -> BridgeResult<bool> {
        let channels = self
            .discord
            .get_channels(&self.config.guild_id)
            .await
            .context(DiscordSnafu)?;

        let mut categories: Vec<SidebarCategory> = Vec::new();
        let mut uncategorized: Vec<EntityId> = Vec::new();
        for channel in &channels {
            if channel.kind != DiscordChannelKind::Text {
                continue;
            }
            let Some(room) = self
                .stores
                .discord_to_roomy(IdKind::Channel, &channel.id)
                .await?
            else {
                continue;
            };
            let category_name = match &channel.parent_id {
                Some(parent) => channels
                    .iter()
                    .find(|candidate| &candidate.id == parent)
                    .map(|parent| parent.name.clone()),
                None => None,
            };
            match category_name {
                Some(name) => {
                    match categories.iter_mut().find(|category| category.name == name) {
                        Some(category) => category.children.push(room),
                        None => categories.push(SidebarCategory {
                            name,
                            children: vec![room],
                        }),
                    }
                }
                None => uncategorized.push(room),
            }
        }
        if !uncategorized.is_empty() {
            categories.push(SidebarCategory {
                name: String::new(),
                children: uncategorized,
            });
        }

        // Stable hash: categories by name, children sorted per category
        categories.sort_by(|a, b| a.name.cmp(&b.name));
        for category in &mut categories {
            category.children.sort();
        }
        let normalized = serde_json::to_string(&categories).expect("Can't fail");
        let hash = content_fingerprint(&normalized);
        if self.stores.sidebar_hash().await?.as_deref() == Some(hash.as_str()) {
            return Ok(false);
        }

        let event = Event::new(
            EntityId::now(),
            EventKind::UpdateSidebar(UpdateSidebar { categories }),
        )
        .with_discord_origin(
            ext::DISCORD_SIDEBAR_ORIGIN,
            &self.message_origin(&self.config.guild_id, Some(hash.clone())),
        );
        self.send_event(&event).await?;
        self.stores.set_sidebar_hash(&hash).await?;
        Ok(true)
    }

    /// Room for a channel or thread, bridging the channel on demand
    /// when the gateway never told us about it.
    pub(crate) async fn ensure_room_for_channel(
        &self,
        channel_id: &str,
    ) -> BridgeResult<EntityId> {
        if let Some(room) = self
            .stores
            .discord_to_roomy(IdKind::Channel, channel_id)
            .await?
        {
            return Ok(room);
        }
        if let Some(room) = self
            .stores
            .discord_to_roomy(IdKind::Thread, channel_id)
            .await?
        {
            return Ok(room);
        }

        let channels = self
            .discord
            .get_channels(&self.config.guild_id)
            .await
            .context(DiscordSnafu)?;
        if let Some(channel) = channels.iter().find(|channel| channel.id == channel_id) {
            if let Some(room) = self.sync_channel_create(channel).await? {
                return Ok(room);
            }
            // Raced with another create; the mapping exists now
            if let Some(room) = self
                .stores
                .discord_to_roomy(IdKind::Channel, channel_id)
                .await?
            {
                return Ok(room);
            }
            if let Some(room) = self
                .stores
                .discord_to_roomy(IdKind::Thread, channel_id)
                .await?
            {
                return Ok(room);
            }
        }

        // Unknown to the guild listing; bridge it under a fallback name
        let room_id = EntityId::now();
        let event = Event::new(
            room_id,
            EventKind::CreateRoom(CreateRoom {
                kind: RoomKind::Channel,
                name: Some(format!("discord-{channel_id}")),
            }),
        )
        .with_discord_origin(
            ext::DISCORD_CHANNEL_ORIGIN,
            &self.message_origin(channel_id, None),
        );
        self.send_event(&event).await?;
        self.stores
            .kv()
            .batch(self.stores.mapping_ops(IdKind::Channel, channel_id, room_id))
            .await?;
        Ok(room_id)
    }

    /// Profile cache refresh with hashed skip: unchanged profiles cost
    /// one KV read, nothing else.
    async fn ensure_profile(
        &self,
        user: &DiscordUser,
    ) -> BridgeResult<(CachedProfile, Vec<BatchOp>)> {
        let hash = profile_fingerprint(
            &user.username,
            user.global_name.as_deref(),
            user.avatar_url.as_deref(),
        );
        if let Some(cached) = self.stores.cached_profile(&user.id).await? {
            if cached.hash == hash {
                return Ok((cached, vec![]));
            }
        }
        let profile = CachedProfile {
            hash,
            username: user.username.clone(),
            global_name: user.global_name.clone(),
            avatar_url: user.avatar_url.clone(),
        };
        let ops = self.stores.profile_ops(&user.id, &profile);
        Ok((profile, ops))
    }
}

fn classify_attachment(attachment: &crate::discord::DiscordAttachment) -> Attachment {
    let mime_type = attachment
        .content_type
        .clone()
        .unwrap_or_else(|| "application/octet-stream".to_owned());
    Attachment {
        source: attachment.url.clone(),
        mime_type,
        name: Some(attachment.filename.clone()),
        size: attachment.size,
        width: attachment.width,
        height: attachment.height,
        alt: None,
    }
}

/// A stable roomy-side id for a Discord user within this bridge's
/// space, so the id map stays injective in both directions.
fn user_entity_placeholder(user_id: &str) -> EntityId {
    let digest = blake3::hash(format!("discord-user:{user_id}").as_bytes());
    let mut random = [0u8; 16];
    random[6..16].copy_from_slice(&digest.as_bytes()[..10]);
    EntityId::from_parts(1, u128::from_be_bytes(random))
}
