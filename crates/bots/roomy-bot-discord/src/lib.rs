//! Discord ↔ stream bridge.
//!
//! A long-running service bidirectionally synchronizing one Discord
//! guild with one space stream. Strictly idempotent on both sides: every
//! sync operation consults a durable idempotency store before acting and
//! registers its mappings + fingerprints in one atomic KV batch after,
//! so retries, reconnects, and crash replays emit nothing twice. Events
//! the bridge itself emitted carry a Discord origin extension and are
//! suppressed on the way back (echo break).

pub mod discord;
mod http;
pub mod stores;
mod to_discord;
mod to_stream;

use std::sync::Arc;

use roomy_client::{Transport, TransportError};
use roomy_core::event::DecodeError;
use roomy_core::{Event, StreamId, UserDid};
use roomy_util::FmtCompact as _;
use snafu::{Location, ResultExt as _, Snafu};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub use crate::discord::{
    DiscordApi, DiscordApiError, DiscordEvent, MockDiscord, Snowflake,
};
pub use crate::http::HttpDiscordApi;
pub use crate::stores::BridgeStores;

pub const PROJECT_NAME: &str = "roomy-bot-discord";
pub(crate) const LOG_TARGET: &str = "roomy_bot_discord::bridge";

/// Channel topics of bridged channels carry this marker so a wiped
/// bridge can re-populate its id map without re-emitting create events.
pub const TOPIC_MARKER_PREFIX: &str = "roomy-bridge:";

/// Window size for catching up on the stream after (re)connect.
const STREAM_FETCH_WINDOW: u64 = 500;

#[derive(Debug, Snafu)]
pub enum BridgeError {
    #[snafu(display("Discord API failure"))]
    Discord {
        source: DiscordApiError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(transparent)]
    Store {
        source: roomy_kv::KvError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("Stream transport failure"))]
    Stream {
        source: TransportError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("Event payload failed to decode"))]
    Codec {
        source: DecodeError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("Webhook for channel {channel_id} kept disappearing"))]
    WebhookGone { channel_id: Snowflake },
    #[snafu(display("Webhook delivery to channel {channel_id} failed after retries"))]
    WebhookRetriesExhausted {
        channel_id: Snowflake,
        source: DiscordApiError,
    },
}

pub type BridgeResult<T> = std::result::Result<T, BridgeError>;

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub guild_id: Snowflake,
    pub space_stream: StreamId,
    /// The bridge bot's own Discord user id; its gateway echoes (e.g.
    /// its own reactions) are recognized through it.
    pub bot_user_id: Snowflake,
    /// The DID the bridge writes stream events under.
    pub bot_did: UserDid,
}

pub struct Bridge {
    pub(crate) config: BridgeConfig,
    pub(crate) stores: BridgeStores,
    pub(crate) discord: Arc<dyn DiscordApi>,
    pub(crate) transport: Arc<dyn Transport>,
}

impl Bridge {
    pub fn new(
        config: BridgeConfig,
        kv: Arc<roomy_kv::KvStore>,
        discord: Arc<dyn DiscordApi>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let stores = BridgeStores::new(kv, &config.guild_id, config.space_stream.as_str());
        Self {
            config,
            stores,
            discord,
            transport,
        }
    }

    pub fn stores(&self) -> &BridgeStores {
        &self.stores
    }

    pub(crate) fn topic_marker(&self, room: roomy_core::EntityId) -> String {
        format!(
            "{TOPIC_MARKER_PREFIX}{}:{room}",
            self.config.space_stream
        )
    }

    /// Append one event to the space stream.
    pub(crate) async fn send_event(&self, event: &Event) -> BridgeResult<u64> {
        self.transport
            .send_event(&self.config.space_stream, event.encode())
            .await
            .context(StreamSnafu)
    }

    /// Record the pair in the `registeredBridges` registry (both
    /// directions).
    pub async fn register(&self) -> BridgeResult<()> {
        self.stores.register_bridge().await?;
        info!(
            target: LOG_TARGET,
            guild = %self.config.guild_id,
            space = %self.config.space_stream,
            "Bridge registered"
        );
        Ok(())
    }

    /// Startup recovery: when the local id map is empty but Discord
    /// channels carry our topic marker, re-populate the map without
    /// re-emitting create events.
    pub async fn recover_channels(&self) -> BridgeResult<usize> {
        if !self.stores.id_map_is_empty().await? {
            return Ok(0);
        }
        let channels = self
            .discord
            .get_channels(&self.config.guild_id)
            .await
            .context(DiscordSnafu)?;

        let marker_prefix = format!("{TOPIC_MARKER_PREFIX}{}:", self.config.space_stream);
        let mut ops = Vec::new();
        let mut recovered = 0;
        for channel in &channels {
            let Some(topic) = &channel.topic else {
                continue;
            };
            let Some(room) = topic.strip_prefix(&marker_prefix) else {
                continue;
            };
            let Ok(room) = room.parse::<roomy_core::EntityId>() else {
                warn!(
                    target: LOG_TARGET,
                    channel = %channel.id,
                    topic = %topic,
                    "Unparsable topic marker during recovery"
                );
                continue;
            };
            ops.extend(self.stores.mapping_ops(
                stores::IdKind::Channel,
                &channel.id,
                room,
            ));
            recovered += 1;
        }
        if !ops.is_empty() {
            self.stores.kv().batch(ops).await?;
        }
        if 0 < recovered {
            info!(
                target: LOG_TARGET,
                count = recovered,
                "Recovered channel mappings from topic markers"
            );
        }
        Ok(recovered)
    }

    /// Fetch and handle stream events from the durable cursor until an
    /// empty window comes back. The cursor advances only after an entry
    /// is fully handled.
    pub async fn catch_up(&self) -> BridgeResult<u64> {
        let stream_key = self.config.space_stream.as_str().to_owned();
        let mut handled = 0;
        loop {
            let cursor = self.stores.cursor(&stream_key).await?;
            let entries = self
                .transport
                .fetch_events(&self.config.space_stream, cursor, STREAM_FETCH_WINDOW)
                .await
                .context(StreamSnafu)?;
            if entries.is_empty() {
                break;
            }
            for entry in entries {
                self.process_stream_entry(entry.idx, &entry.user, &entry.payload)
                    .await;
                self.stores.set_cursor(&stream_key, entry.idx).await?;
                handled += 1;
            }
        }
        Ok(handled)
    }

    /// Handle one stream entry, downgrading per-entry failures to log
    /// lines so a poison event can't wedge the whole stream.
    pub(crate) async fn process_stream_entry(&self, idx: u64, user: &UserDid, payload: &[u8]) {
        if let Err(err) = self.handle_stream_event(user, payload).await {
            warn!(
                target: LOG_TARGET,
                idx,
                err = %err.fmt_compact(),
                "Stream event handling failed; skipping"
            );
        }
    }

    /// Main service loop: gateway events in, stream subscription out.
    pub async fn run(
        self: Arc<Self>,
        mut gateway: mpsc::Receiver<DiscordEvent>,
    ) -> BridgeResult<()> {
        self.register().await?;
        self.recover_channels().await?;

        self.transport
            .subscribe(&self.config.space_stream)
            .await
            .context(StreamSnafu)?;
        let mut incoming = self.transport.incoming();
        self.catch_up().await?;
        info!(target: LOG_TARGET, "Bridge is running");

        let stream_key = self.config.space_stream.as_str().to_owned();
        loop {
            tokio::select! {
                gateway_event = gateway.recv() => {
                    let Some(gateway_event) = gateway_event else {
                        info!(target: LOG_TARGET, "Gateway feed ended; shutting down");
                        return Ok(());
                    };
                    if let Err(err) = self.handle_discord_event(gateway_event).await {
                        warn!(
                            target: LOG_TARGET,
                            err = %err.fmt_compact(),
                            "Discord event handling failed"
                        );
                    }
                }
                stream_event = incoming.recv() => {
                    match stream_event {
                        Ok(event) if event.stream == self.config.space_stream => {
                            let cursor = self.stores.cursor(&stream_key).await?;
                            if event.idx <= cursor {
                                continue;
                            }
                            self.process_stream_entry(event.idx, &event.user, &event.payload)
                                .await;
                            self.stores.set_cursor(&stream_key, event.idx).await?;
                        }
                        Ok(_) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                            debug!(
                                target: LOG_TARGET,
                                missed,
                                "Stream feed lagged; catching up from cursor"
                            );
                            self.catch_up().await?;
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                            info!(target: LOG_TARGET, "Stream feed closed; shutting down");
                            return Ok(());
                        }
                    }
                }
            }
        }
    }
}
