//! The Discord collaborator interface.
//!
//! The gateway library itself is external; whatever drives it feeds
//! [`DiscordEvent`]s into the bridge over a channel, and the bridge
//! talks back through [`DiscordApi`]. [`MockDiscord`] records calls for
//! the test suites and scripts failure sequences (rate limits, dead
//! webhooks) per method.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use snafu::Snafu;

/// Discord ids stay opaque strings end to end.
pub type Snowflake = String;

/// Discord's snowflake epoch (ms).
const DISCORD_EPOCH_MS: u64 = 1_420_070_400_000;

/// Creation time encoded in a snowflake, in ms since the Unix epoch.
pub fn snowflake_timestamp_ms(snowflake: &str) -> Option<u64> {
    snowflake
        .parse::<u64>()
        .ok()
        .map(|raw| (raw >> 22) + DISCORD_EPOCH_MS)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscordUser {
    pub id: Snowflake,
    pub username: String,
    #[serde(default)]
    pub global_name: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub bot: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscordAttachment {
    pub url: String,
    pub filename: String,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscordMessage {
    pub id: Snowflake,
    pub channel_id: Snowflake,
    #[serde(default)]
    pub guild_id: Option<Snowflake>,
    pub author: DiscordUser,
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<DiscordAttachment>,
    #[serde(default)]
    pub referenced_message_id: Option<Snowflake>,
    /// Milliseconds; `None` for never-edited messages.
    #[serde(default)]
    pub edited_timestamp_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscordChannelKind {
    Text,
    Category,
    PublicThread,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscordChannel {
    pub id: Snowflake,
    pub name: String,
    pub kind: DiscordChannelKind,
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub parent_id: Option<Snowflake>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscordReaction {
    pub channel_id: Snowflake,
    pub message_id: Snowflake,
    pub user_id: Snowflake,
    pub emoji: String,
}

/// Gateway events the bridge consumes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DiscordEvent {
    MessageCreate(DiscordMessage),
    MessageUpdate(DiscordMessage),
    MessageDelete {
        channel_id: Snowflake,
        message_id: Snowflake,
    },
    MessageReactionAdd(DiscordReaction),
    MessageReactionRemove(DiscordReaction),
    ChannelCreate(DiscordChannel),
    ThreadCreate(DiscordChannel),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Webhook {
    pub id: Snowflake,
    pub name: String,
    /// Absent on webhooks created by other applications.
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub content: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PermissionOverride {
    pub role_id: Snowflake,
    pub allow: u64,
    pub deny: u64,
}

#[derive(Debug, Snafu, Clone)]
pub enum DiscordApiError {
    #[snafu(display("Rate limited; retry after {retry_after_secs}s"))]
    RateLimited { retry_after_secs: f64 },
    #[snafu(display("Object not found"))]
    NotFound,
    #[snafu(display("Server error ({status})"))]
    Server { status: u16 },
    #[snafu(display("Transport failure: {message}"))]
    Transport { message: String },
    #[snafu(display("Request rejected ({status}): {message}"))]
    Fatal { status: u16, message: String },
}

pub type DiscordApiResult<T> = std::result::Result<T, DiscordApiError>;

/// The REST surface the bridge drives.
#[async_trait]
pub trait DiscordApi: Send + Sync {
    async fn get_channels(&self, guild_id: &Snowflake) -> DiscordApiResult<Vec<DiscordChannel>>;

    async fn create_channel(
        &self,
        guild_id: &Snowflake,
        name: &str,
        topic: Option<&str>,
        parent_id: Option<&Snowflake>,
    ) -> DiscordApiResult<DiscordChannel>;

    async fn start_thread_with_message(
        &self,
        channel_id: &Snowflake,
        message_id: &Snowflake,
        name: &str,
    ) -> DiscordApiResult<DiscordChannel>;

    async fn get_channel_webhooks(
        &self,
        channel_id: &Snowflake,
    ) -> DiscordApiResult<Vec<Webhook>>;

    async fn create_webhook(
        &self,
        channel_id: &Snowflake,
        name: &str,
    ) -> DiscordApiResult<Webhook>;

    async fn delete_webhook(&self, webhook_id: &Snowflake) -> DiscordApiResult<()>;

    /// Returns the id of the created message.
    async fn execute_webhook(
        &self,
        webhook_id: &Snowflake,
        token: &str,
        payload: &WebhookPayload,
    ) -> DiscordApiResult<Snowflake>;

    async fn edit_message(
        &self,
        channel_id: &Snowflake,
        message_id: &Snowflake,
        content: &str,
    ) -> DiscordApiResult<()>;

    async fn delete_message(
        &self,
        channel_id: &Snowflake,
        message_id: &Snowflake,
    ) -> DiscordApiResult<()>;

    async fn add_reaction(
        &self,
        channel_id: &Snowflake,
        message_id: &Snowflake,
        emoji: &str,
    ) -> DiscordApiResult<()>;

    async fn remove_reaction(
        &self,
        channel_id: &Snowflake,
        message_id: &Snowflake,
        user_id: Option<&Snowflake>,
        emoji: &str,
    ) -> DiscordApiResult<()>;

    /// Users who currently carry `emoji` on the message.
    async fn get_reactions(
        &self,
        channel_id: &Snowflake,
        message_id: &Snowflake,
        emoji: &str,
    ) -> DiscordApiResult<Vec<DiscordUser>>;

    async fn create_role(&self, guild_id: &Snowflake, name: &str) -> DiscordApiResult<Snowflake>;

    async fn delete_role(
        &self,
        guild_id: &Snowflake,
        role_id: &Snowflake,
    ) -> DiscordApiResult<()>;

    async fn edit_channel_permission_overrides(
        &self,
        channel_id: &Snowflake,
        overrides: &[PermissionOverride],
    ) -> DiscordApiResult<()>;
}

/// A recorded REST call, for assertions.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedCall {
    GetChannels,
    CreateChannel { name: String },
    StartThread { channel_id: Snowflake, name: String },
    GetChannelWebhooks { channel_id: Snowflake },
    CreateWebhook { channel_id: Snowflake, name: String },
    DeleteWebhook { webhook_id: Snowflake },
    ExecuteWebhook { webhook_id: Snowflake, payload: WebhookPayload },
    EditMessage { message_id: Snowflake, content: String },
    DeleteMessage { message_id: Snowflake },
    AddReaction { message_id: Snowflake, emoji: String },
    RemoveReaction { message_id: Snowflake, emoji: String },
    GetReactions { message_id: Snowflake, emoji: String },
    CreateRole { name: String },
    DeleteRole { role_id: Snowflake },
    EditPermissionOverrides { channel_id: Snowflake },
}

#[derive(Default)]
struct MockState {
    channels: Vec<DiscordChannel>,
    webhooks: HashMap<Snowflake, Vec<Webhook>>,
    calls: Vec<RecordedCall>,
    /// Scripted failures consumed before `execute_webhook` succeeds.
    webhook_failures: Vec<DiscordApiError>,
    reactions: HashMap<(Snowflake, String), Vec<DiscordUser>>,
}

/// In-memory Discord standing in for the REST API in tests.
pub struct MockDiscord {
    state: Mutex<MockState>,
    id_counter: AtomicU64,
}

impl Default for MockDiscord {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDiscord {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            id_counter: AtomicU64::new(9_000_000),
        }
    }

    fn next_id(&self) -> Snowflake {
        self.id_counter.fetch_add(1, Ordering::Relaxed).to_string()
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.state.lock().expect("Locking failed").calls.clone()
    }

    pub fn call_count(&self) -> usize {
        self.state.lock().expect("Locking failed").calls.len()
    }

    pub fn seed_channel(&self, channel: DiscordChannel) {
        self.state
            .lock()
            .expect("Locking failed")
            .channels
            .push(channel);
    }

    pub fn seed_reactions(
        &self,
        message_id: Snowflake,
        emoji: &str,
        users: Vec<DiscordUser>,
    ) {
        self.state
            .lock()
            .expect("Locking failed")
            .reactions
            .insert((message_id, emoji.to_owned()), users);
    }

    /// Queue failures returned by `execute_webhook` before it succeeds.
    pub fn script_webhook_failures(&self, failures: Vec<DiscordApiError>) {
        self.state.lock().expect("Locking failed").webhook_failures = failures;
    }

    fn record(&self, call: RecordedCall) {
        self.state.lock().expect("Locking failed").calls.push(call);
    }
}

#[async_trait]
impl DiscordApi for MockDiscord {
    async fn get_channels(&self, _guild_id: &Snowflake) -> DiscordApiResult<Vec<DiscordChannel>> {
        self.record(RecordedCall::GetChannels);
        Ok(self.state.lock().expect("Locking failed").channels.clone())
    }

    async fn create_channel(
        &self,
        _guild_id: &Snowflake,
        name: &str,
        topic: Option<&str>,
        parent_id: Option<&Snowflake>,
    ) -> DiscordApiResult<DiscordChannel> {
        self.record(RecordedCall::CreateChannel { name: name.to_owned() });
        let channel = DiscordChannel {
            id: self.next_id(),
            name: name.to_owned(),
            kind: DiscordChannelKind::Text,
            topic: topic.map(str::to_owned),
            parent_id: parent_id.cloned(),
        };
        self.state
            .lock()
            .expect("Locking failed")
            .channels
            .push(channel.clone());
        Ok(channel)
    }

    async fn start_thread_with_message(
        &self,
        channel_id: &Snowflake,
        _message_id: &Snowflake,
        name: &str,
    ) -> DiscordApiResult<DiscordChannel> {
        self.record(RecordedCall::StartThread {
            channel_id: channel_id.clone(),
            name: name.to_owned(),
        });
        let thread = DiscordChannel {
            id: self.next_id(),
            name: name.to_owned(),
            kind: DiscordChannelKind::PublicThread,
            topic: None,
            parent_id: Some(channel_id.clone()),
        };
        self.state
            .lock()
            .expect("Locking failed")
            .channels
            .push(thread.clone());
        Ok(thread)
    }

    async fn get_channel_webhooks(
        &self,
        channel_id: &Snowflake,
    ) -> DiscordApiResult<Vec<Webhook>> {
        self.record(RecordedCall::GetChannelWebhooks {
            channel_id: channel_id.clone(),
        });
        Ok(self
            .state
            .lock()
            .expect("Locking failed")
            .webhooks
            .get(channel_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn create_webhook(
        &self,
        channel_id: &Snowflake,
        name: &str,
    ) -> DiscordApiResult<Webhook> {
        self.record(RecordedCall::CreateWebhook {
            channel_id: channel_id.clone(),
            name: name.to_owned(),
        });
        let webhook = Webhook {
            id: self.next_id(),
            name: name.to_owned(),
            token: Some(format!("token-{}", self.id_counter.load(Ordering::Relaxed))),
        };
        self.state
            .lock()
            .expect("Locking failed")
            .webhooks
            .entry(channel_id.clone())
            .or_default()
            .push(webhook.clone());
        Ok(webhook)
    }

    async fn delete_webhook(&self, webhook_id: &Snowflake) -> DiscordApiResult<()> {
        self.record(RecordedCall::DeleteWebhook {
            webhook_id: webhook_id.clone(),
        });
        let mut state = self.state.lock().expect("Locking failed");
        for webhooks in state.webhooks.values_mut() {
            webhooks.retain(|webhook| &webhook.id != webhook_id);
        }
        Ok(())
    }

    async fn execute_webhook(
        &self,
        webhook_id: &Snowflake,
        _token: &str,
        payload: &WebhookPayload,
    ) -> DiscordApiResult<Snowflake> {
        self.record(RecordedCall::ExecuteWebhook {
            webhook_id: webhook_id.clone(),
            payload: payload.clone(),
        });
        let scripted = {
            let mut state = self.state.lock().expect("Locking failed");
            if state.webhook_failures.is_empty() {
                None
            } else {
                Some(state.webhook_failures.remove(0))
            }
        };
        match scripted {
            Some(failure) => Err(failure),
            None => Ok(self.next_id()),
        }
    }

    async fn edit_message(
        &self,
        _channel_id: &Snowflake,
        message_id: &Snowflake,
        content: &str,
    ) -> DiscordApiResult<()> {
        self.record(RecordedCall::EditMessage {
            message_id: message_id.clone(),
            content: content.to_owned(),
        });
        Ok(())
    }

    async fn delete_message(
        &self,
        _channel_id: &Snowflake,
        message_id: &Snowflake,
    ) -> DiscordApiResult<()> {
        self.record(RecordedCall::DeleteMessage {
            message_id: message_id.clone(),
        });
        Ok(())
    }

    async fn add_reaction(
        &self,
        _channel_id: &Snowflake,
        message_id: &Snowflake,
        emoji: &str,
    ) -> DiscordApiResult<()> {
        self.record(RecordedCall::AddReaction {
            message_id: message_id.clone(),
            emoji: emoji.to_owned(),
        });
        Ok(())
    }

    async fn remove_reaction(
        &self,
        _channel_id: &Snowflake,
        message_id: &Snowflake,
        _user_id: Option<&Snowflake>,
        emoji: &str,
    ) -> DiscordApiResult<()> {
        self.record(RecordedCall::RemoveReaction {
            message_id: message_id.clone(),
            emoji: emoji.to_owned(),
        });
        Ok(())
    }

    async fn get_reactions(
        &self,
        _channel_id: &Snowflake,
        message_id: &Snowflake,
        emoji: &str,
    ) -> DiscordApiResult<Vec<DiscordUser>> {
        self.record(RecordedCall::GetReactions {
            message_id: message_id.clone(),
            emoji: emoji.to_owned(),
        });
        Ok(self
            .state
            .lock()
            .expect("Locking failed")
            .reactions
            .get(&(message_id.clone(), emoji.to_owned()))
            .cloned()
            .unwrap_or_default())
    }

    async fn create_role(
        &self,
        _guild_id: &Snowflake,
        name: &str,
    ) -> DiscordApiResult<Snowflake> {
        self.record(RecordedCall::CreateRole { name: name.to_owned() });
        Ok(self.next_id())
    }

    async fn delete_role(
        &self,
        _guild_id: &Snowflake,
        role_id: &Snowflake,
    ) -> DiscordApiResult<()> {
        self.record(RecordedCall::DeleteRole {
            role_id: role_id.clone(),
        });
        Ok(())
    }

    async fn edit_channel_permission_overrides(
        &self,
        channel_id: &Snowflake,
        _overrides: &[PermissionOverride],
    ) -> DiscordApiResult<()> {
        self.record(RecordedCall::EditPermissionOverrides {
            channel_id: channel_id.clone(),
        });
        Ok(())
    }
}
