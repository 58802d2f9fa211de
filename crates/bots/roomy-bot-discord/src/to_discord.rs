//! Stream → Discord synchronization.
//!
//! The first gate is the echo break: any event carrying a Discord
//! origin extension was emitted by this bridge and must never cause a
//! REST call. Everything else maps rooms to channels (creating them
//! with a topic marker when needed), resolves the per-channel "Roomy
//! Bridge" webhook, and executes it under the webhook failure taxonomy:
//! 429 waits `retry_after` without limit, 404 recreates the webhook
//! once, 5xx/transport backs off exponentially for up to 3 attempts,
//! any other 4xx is fatal.

use std::time::Duration;

use backon::{ExponentialBuilder, Retryable as _};
use roomy_core::event::{
    AddReaction, CreateMessage, CreateRoom, CreateRoomLink, EditMessage, EventKind,
    RemoveReaction, RoomKind,
};
use roomy_core::{EntityId, Event, UserDid};
use snafu::ResultExt as _;
use tracing::{debug, warn};

use crate::discord::{DiscordApiError, PermissionOverride, Snowflake, WebhookPayload};
use crate::stores::{
    BRIDGE_WEBHOOK_NAME, EditMarker, IdKind, MAX_WEBHOOKS_PER_CHANNEL, content_fingerprint,
};
use crate::{Bridge, BridgeError, BridgeResult, DiscordSnafu, LOG_TARGET};

const SERVER_RETRY_BASE: Duration = Duration::from_secs(1);
/// Retries after the initial attempt: 3 attempts total at 1 s, 2 s.
const SERVER_RETRY_MAX_TIMES: usize = 2;

impl Bridge {
    pub async fn handle_stream_event(
        &self,
        user: &UserDid,
        payload: &[u8],
    ) -> BridgeResult<()> {
        let event = match Event::decode(payload) {
            Ok(event) => event,
            Err(err) => {
                warn!(target: LOG_TARGET, err = %err, "Undecodable stream event; skipping");
                return Ok(());
            }
        };

        if event.has_discord_origin() {
            // Echo break: our own bridged event coming back around
            debug!(target: LOG_TARGET, event = %event.id, "Suppressing self-originated event");
            return Ok(());
        }

        match &event.kind {
            EventKind::CreateMessage(fields) => self.forward_message(&event, fields, user).await,
            EventKind::EditMessage(fields) => self.forward_edit(&event, fields).await,
            EventKind::CreateRoom(fields) => self.forward_room(&event, fields).await,
            EventKind::CreateRoomLink(fields) => self.forward_room_link(fields).await,
            EventKind::AddReaction(fields) => self.forward_reaction_add(&event, fields).await,
            EventKind::RemoveReaction(fields) => self.forward_reaction_remove(fields).await,
            EventKind::AddAdmin(_) => self.ensure_admin_role().await,
            _ => {
                debug!(
                    target: LOG_TARGET,
                    kind = %event.kind.type_name(),
                    "No Discord counterpart for event kind"
                );
                Ok(())
            }
        }
    }

    async fn forward_message(
        &self,
        event: &Event,
        fields: &CreateMessage,
        user: &UserDid,
    ) -> BridgeResult<()> {
        if self.stores.roomy_to_discord(event.id).await?.is_some() {
            debug!(target: LOG_TARGET, event = %event.id, "Message already forwarded");
            return Ok(());
        }
        let Some(room) = event.room else {
            debug!(target: LOG_TARGET, event = %event.id, "Space-level message; not forwarded");
            return Ok(());
        };
        let channel_id = self.ensure_discord_channel(room, None).await?;

        let content = String::from_utf8_lossy(&fields.body.data).into_owned();
        let (username, avatar_url) = match &fields.author_override {
            Some(author) => (author.name.clone(), author.avatar.clone()),
            None => (display_name_of(user), None),
        };
        let payload = WebhookPayload {
            content: content.clone(),
            username: Some(username),
            avatar_url,
        };

        let message_id = self.execute_webhook_with_retry(&channel_id, &payload).await?;

        let mut ops = self
            .stores
            .message_mapping_ops(&channel_id, &message_id, event.id);
        ops.extend(self.stores.edit_marker_ops(
            &message_id,
            &EditMarker {
                edited_timestamp: event.id.timestamp_ms(),
                content_hash: content_fingerprint(&content),
            },
        ));
        self.stores.kv().batch(ops).await?;
        self.stores
            .set_last_channel_message(&channel_id, &message_id)
            .await?;

        debug!(target: LOG_TARGET, event = %event.id, message = %message_id, "Message forwarded");
        Ok(())
    }

    /// Edits to empty content are deletes; everything else goes through
    /// the REST edit with the same timestamp/hash guard the other
    /// direction uses, so a same-timestamp overwrite of a Discord edit
    /// is at least visible in the logs.
    async fn forward_edit(&self, event: &Event, fields: &EditMessage) -> BridgeResult<()> {
        let Some((IdKind::Message, composite)) =
            self.stores.roomy_to_discord(fields.target).await?
        else {
            warn!(
                target: LOG_TARGET,
                target = %fields.target,
                "Edit target has no Discord mapping"
            );
            return Ok(());
        };
        let Some((channel_id, message_id)) = composite.split_once('/') else {
            warn!(
                target: LOG_TARGET,
                target = %fields.target,
                "Message mapping without channel part"
            );
            return Ok(());
        };

        if fields.body.is_dmp_patch() {
            // Patch bodies need the materialized content to resolve;
            // the bridge only forwards full replacements.
            debug!(
                target: LOG_TARGET,
                target = %fields.target,
                "Patch edit not forwarded"
            );
            return Ok(());
        }

        let content = String::from_utf8_lossy(&fields.body.data).into_owned();
        if content.is_empty() {
            self.delete_message_tolerant(channel_id, message_id).await?;
            return Ok(());
        }

        let edited_timestamp = event.id.timestamp_ms();
        let content_hash = content_fingerprint(&content);
        if let Some(marker) = self.stores.edit_marker(message_id).await? {
            if edited_timestamp < marker.edited_timestamp {
                debug!(target: LOG_TARGET, message = %message_id, "Stale stream edit; skipping");
                return Ok(());
            }
            if edited_timestamp == marker.edited_timestamp {
                if content_hash == marker.content_hash {
                    return Ok(());
                }
                warn!(
                    target: LOG_TARGET,
                    message = %message_id,
                    "Same-timestamp conflict; stream edit overwrites Discord content"
                );
            }
        }

        self.discord
            .edit_message(&channel_id.to_owned(), &message_id.to_owned(), &content)
            .await
            .context(DiscordSnafu)?;
        self.stores
            .kv()
            .batch(self.stores.edit_marker_ops(
                message_id,
                &EditMarker {
                    edited_timestamp,
                    content_hash,
                },
            ))
            .await?;
        Ok(())
    }

    async fn forward_room(&self, event: &Event, fields: &CreateRoom) -> BridgeResult<()> {
        let name = fields.name.clone().unwrap_or_else(|| "room".to_owned());
        match fields.kind {
            RoomKind::Thread => {
                // The Discord thread is created when the creation link
                // arrives; remember the name until then.
                self.stores.set_pending_thread_name(event.id, &name).await?;
                Ok(())
            }
            RoomKind::Page => {
                debug!(target: LOG_TARGET, room = %event.id, "Pages have no Discord counterpart");
                Ok(())
            }
            RoomKind::Channel | RoomKind::Category => {
                self.ensure_discord_channel(event.id, Some(&name)).await?;
                Ok(())
            }
        }
    }

    /// Threads are anchored on the newest bridged message of the parent
    /// channel.
    async fn forward_room_link(&self, fields: &CreateRoomLink) -> BridgeResult<()> {
        if !fields.is_creation_link {
            return Ok(());
        }
        if self.stores.roomy_to_discord(fields.link_to_room).await?.is_some() {
            return Ok(());
        }
        let Some((IdKind::Channel, parent_channel)) =
            self.stores.roomy_to_discord(fields.room).await?
        else {
            warn!(
                target: LOG_TARGET,
                room = %fields.room,
                "Thread parent has no Discord channel"
            );
            return Ok(());
        };
        let Some(anchor) = self.stores.last_channel_message(&parent_channel).await? else {
            warn!(
                target: LOG_TARGET,
                room = %fields.room,
                "No bridged message to anchor the thread on"
            );
            return Ok(());
        };
        let name = self
            .stores
            .pending_thread_name(fields.link_to_room)
            .await?
            .unwrap_or_else(|| "thread".to_owned());

        let thread = self
            .discord
            .start_thread_with_message(&parent_channel, &anchor, &name)
            .await
            .context(DiscordSnafu)?;
        self.stores
            .kv()
            .batch(
                self.stores
                    .mapping_ops(IdKind::Thread, &thread.id, fields.link_to_room),
            )
            .await?;
        Ok(())
    }

    async fn forward_reaction_add(
        &self,
        event: &Event,
        fields: &AddReaction,
    ) -> BridgeResult<()> {
        if self.stores.reaction_triple(event.id).await?.is_some() {
            return Ok(());
        }
        let Some((IdKind::Message, composite)) =
            self.stores.roomy_to_discord(fields.target).await?
        else {
            debug!(
                target: LOG_TARGET,
                target = %fields.target,
                "Reaction target has no Discord mapping"
            );
            return Ok(());
        };
        let Some((channel_id, message_id)) = composite.split_once('/') else {
            return Ok(());
        };

        self.discord
            .add_reaction(
                &channel_id.to_owned(),
                &message_id.to_owned(),
                &fields.emoji,
            )
            .await
            .context(DiscordSnafu)?;

        // The bot's reaction echoes back over the gateway; storing the
        // key under the bot's user id makes that echo hit the
        // idempotency store.
        let triple = crate::stores::ReactionTriple {
            channel_id: channel_id.to_owned(),
            message_id: message_id.to_owned(),
            user_id: self.config.bot_user_id.clone(),
            emoji: fields.emoji.clone(),
        };
        self.stores
            .kv()
            .batch(self.stores.reaction_ops(&triple, event.id))
            .await?;
        Ok(())
    }

    /// The reverse mapping stored at insert time resolves the Discord
    /// coordinates of the reaction being removed.
    async fn forward_reaction_remove(&self, fields: &RemoveReaction) -> BridgeResult<()> {
        let Some(triple) = self.stores.reaction_triple(fields.reaction).await? else {
            debug!(
                target: LOG_TARGET,
                reaction = %fields.reaction,
                "Reaction removal without stored Discord coordinates"
            );
            return Ok(());
        };
        let user = (triple.user_id != self.config.bot_user_id).then_some(&triple.user_id);
        self.discord
            .remove_reaction(&triple.channel_id, &triple.message_id, user, &triple.emoji)
            .await
            .context(DiscordSnafu)?;
        self.stores
            .kv()
            .batch(self.stores.reaction_delete_ops(&triple, fields.reaction))
            .await?;
        Ok(())
    }

    /// A "Roomy Admin" role exists once per bridged guild; bridged
    /// channels carry a permission override for it.
    async fn ensure_admin_role(&self) -> BridgeResult<()> {
        if self.stores.admin_role().await?.is_some() {
            return Ok(());
        }
        let role_id = self
            .discord
            .create_role(&self.config.guild_id, "Roomy Admin")
            .await
            .context(DiscordSnafu)?;
        self.stores.set_admin_role(&role_id).await?;

        // Grant the role on every channel the bridge already writes to
        for channel_id in self.stores.webhook_channel_ids().await? {
            self.discord
                .edit_channel_permission_overrides(
                    &channel_id,
                    &[PermissionOverride {
                        role_id: role_id.clone(),
                        allow: (1 << 4) | (1 << 13),
                        deny: 0,
                    }],
                )
                .await
                .context(DiscordSnafu)?;
        }
        Ok(())
    }

    /// Channel for a room, creating it (topic marker included) when the
    /// mapping is missing.
    pub(crate) async fn ensure_discord_channel(
        &self,
        room: EntityId,
        name: Option<&str>,
    ) -> BridgeResult<Snowflake> {
        if let Some((kind, id_or_composite)) = self.stores.roomy_to_discord(room).await? {
            let channel = match kind {
                IdKind::Message => id_or_composite
                    .split_once('/')
                    .map(|(channel, _)| channel.to_owned())
                    .unwrap_or(id_or_composite),
                _ => id_or_composite,
            };
            return Ok(channel);
        }

        let name = name.map(str::to_owned).unwrap_or_else(|| format!("roomy-{room}"));
        let topic = self.topic_marker(room);
        let channel = self
            .discord
            .create_channel(&self.config.guild_id, &name, Some(&topic), None)
            .await
            .context(DiscordSnafu)?;

        if let Some(role_id) = self.stores.admin_role().await? {
            self.discord
                .edit_channel_permission_overrides(
                    &channel.id,
                    &[PermissionOverride {
                        role_id,
                        // MANAGE_CHANNELS | MANAGE_MESSAGES
                        allow: (1 << 4) | (1 << 13),
                        deny: 0,
                    }],
                )
                .await
                .context(DiscordSnafu)?;
        }

        self.stores
            .kv()
            .batch(self.stores.mapping_ops(IdKind::Channel, &channel.id, room))
            .await?;
        debug!(target: LOG_TARGET, %room, channel = %channel.id, "Discord channel created");
        Ok(channel.id)
    }

    /// Per-channel webhook: reuse the cached token, adopt an existing
    /// "Roomy Bridge" webhook, or create one (evicting the oldest
    /// foreign webhook at the 15-per-channel limit).
    pub(crate) async fn ensure_webhook(
        &self,
        channel_id: &str,
    ) -> BridgeResult<(Snowflake, String)> {
        if let Some(cached) = self.stores.webhook_token(channel_id).await? {
            return Ok(cached);
        }

        let channel = channel_id.to_owned();
        let webhooks = self
            .discord
            .get_channel_webhooks(&channel)
            .await
            .context(DiscordSnafu)?;
        if let Some(ours) = webhooks
            .iter()
            .find(|webhook| webhook.name == BRIDGE_WEBHOOK_NAME && webhook.token.is_some())
        {
            let token = ours.token.clone().expect("checked above");
            self.stores
                .set_webhook_token(channel_id, &ours.id, &token)
                .await?;
            return Ok((ours.id.clone(), token));
        }

        if MAX_WEBHOOKS_PER_CHANNEL <= webhooks.len() {
            if let Some(victim) = webhooks
                .iter()
                .find(|webhook| webhook.name != BRIDGE_WEBHOOK_NAME)
            {
                debug!(
                    target: LOG_TARGET,
                    channel = %channel_id,
                    webhook = %victim.id,
                    "Webhook limit reached; deleting oldest foreign webhook"
                );
                self.discord
                    .delete_webhook(&victim.id)
                    .await
                    .context(DiscordSnafu)?;
            }
        }

        let created = self
            .discord
            .create_webhook(&channel, BRIDGE_WEBHOOK_NAME)
            .await
            .context(DiscordSnafu)?;
        let Some(token) = created.token else {
            return Err(BridgeError::WebhookGone {
                channel_id: channel.clone(),
            });
        };
        self.stores
            .set_webhook_token(channel_id, &created.id, &token)
            .await?;
        Ok((created.id, token))
    }

    /// Execute under the webhook failure taxonomy. Returns the created
    /// Discord message id.
    ///
    /// 5xx/transport failures retry inside one backoff run; 429 and 404
    /// restart the outer loop, because they change what the next attempt
    /// does (wait out `retry_after`, re-resolve the webhook).
    pub(crate) async fn execute_webhook_with_retry(
        &self,
        channel_id: &str,
        payload: &WebhookPayload,
    ) -> BridgeResult<Snowflake> {
        let mut recreated = false;

        loop {
            let (webhook_id, token) = self.ensure_webhook(channel_id).await?;
            let delivery = (|| async {
                self.discord
                    .execute_webhook(&webhook_id, &token, payload)
                    .await
            })
            .retry(
                ExponentialBuilder::default()
                    .with_min_delay(SERVER_RETRY_BASE)
                    .with_max_times(SERVER_RETRY_MAX_TIMES),
            )
            .when(|err| {
                matches!(
                    err,
                    DiscordApiError::Server { .. } | DiscordApiError::Transport { .. }
                )
            })
            .notify(|err, backoff| {
                warn!(
                    target: LOG_TARGET,
                    channel = %channel_id,
                    backoff_ms = backoff.as_millis() as u64,
                    err = %err,
                    "Webhook delivery failed; backing off"
                )
            })
            .await;

            match delivery {
                Ok(message_id) => return Ok(message_id),
                Err(DiscordApiError::RateLimited { retry_after_secs }) => {
                    debug!(
                        target: LOG_TARGET,
                        channel = %channel_id,
                        retry_after_secs,
                        "Webhook rate limited"
                    );
                    tokio::time::sleep(Duration::from_secs_f64(retry_after_secs)).await;
                }
                Err(DiscordApiError::NotFound) => {
                    // Deleted externally: clear the cache so the next
                    // loop recreates it, once.
                    self.stores.clear_webhook_token(channel_id).await?;
                    if recreated {
                        return Err(BridgeError::WebhookGone {
                            channel_id: channel_id.to_owned(),
                        });
                    }
                    recreated = true;
                }
                Err(err) => {
                    // Fatal 4xx, or 5xx/transport with the backoff spent
                    return Err(BridgeError::WebhookRetriesExhausted {
                        channel_id: channel_id.to_owned(),
                        source: err,
                    });
                }
            }
        }
    }

    async fn delete_message_tolerant(
        &self,
        channel_id: &str,
        message_id: &str,
    ) -> BridgeResult<()> {
        match self
            .discord
            .delete_message(&channel_id.to_owned(), &message_id.to_owned())
            .await
        {
            Ok(()) | Err(DiscordApiError::NotFound) => Ok(()),
            Err(err) => Err(BridgeError::Discord {
                source: err,
                location: snafu::location!(),
            }),
        }
    }
}

fn display_name_of(user: &UserDid) -> String {
    user.as_str()
        .rsplit(':')
        .next()
        .unwrap_or("roomy user")
        .to_owned()
}
