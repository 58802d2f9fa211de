//! reqwest implementation of [`DiscordApi`] against the v10 REST API.
//!
//! Maps the HTTP failure surface onto [`DiscordApiError`]: 429 becomes
//! `RateLimited` with the body's `retry_after`, 404 `NotFound`, 5xx
//! `Server`, connection failures `Transport`, anything else `Fatal`.
//! Retry policy lives in the orchestrator, not here.

use async_trait::async_trait;
use serde::Deserialize;
use url::Url;

use crate::discord::{
    DiscordApi, DiscordApiError, DiscordApiResult, DiscordChannel, DiscordChannelKind,
    DiscordUser, PermissionOverride, Snowflake, Webhook, WebhookPayload,
};

const API_BASE: &str = "https://discord.com/api/v10";
const CDN_BASE: &str = "https://cdn.discordapp.com";

const CHANNEL_TYPE_TEXT: u8 = 0;
const CHANNEL_TYPE_CATEGORY: u8 = 4;
const CHANNEL_TYPE_PUBLIC_THREAD: u8 = 11;

pub struct HttpDiscordApi {
    http: reqwest::Client,
    token: String,
    base: Url,
}

#[derive(Debug, Deserialize)]
struct WireChannel {
    id: String,
    name: Option<String>,
    #[serde(rename = "type")]
    kind: u8,
    topic: Option<String>,
    parent_id: Option<String>,
}

impl WireChannel {
    fn into_channel(self) -> Option<DiscordChannel> {
        let kind = match self.kind {
            CHANNEL_TYPE_TEXT => DiscordChannelKind::Text,
            CHANNEL_TYPE_CATEGORY => DiscordChannelKind::Category,
            CHANNEL_TYPE_PUBLIC_THREAD => DiscordChannelKind::PublicThread,
            // Voice, forums, DMs: nothing to bridge
            _ => return None,
        };
        Some(DiscordChannel {
            id: self.id,
            name: self.name.unwrap_or_default(),
            kind,
            topic: self.topic,
            parent_id: self.parent_id,
        })
    }
}

#[derive(Debug, Deserialize)]
struct WireWebhook {
    id: String,
    name: Option<String>,
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    id: String,
}

#[derive(Debug, Deserialize)]
struct WireUser {
    id: String,
    username: String,
    global_name: Option<String>,
    avatar: Option<String>,
    #[serde(default)]
    bot: bool,
}

impl WireUser {
    fn into_user(self) -> DiscordUser {
        let avatar_url = self
            .avatar
            .as_ref()
            .map(|hash| format!("{CDN_BASE}/avatars/{}/{hash}.png", self.id));
        DiscordUser {
            id: self.id,
            username: self.username,
            global_name: self.global_name,
            avatar_url,
            bot: self.bot,
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireRole {
    id: String,
}

#[derive(Debug, Deserialize)]
struct WireRateLimit {
    retry_after: f64,
}

impl HttpDiscordApi {
    pub fn new(bot_token: impl Into<String>) -> Self {
        Self::with_base(bot_token, API_BASE)
    }

    /// Custom base URL, for proxies and test servers.
    pub fn with_base(bot_token: impl Into<String>, base: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            token: bot_token.into(),
            base: Url::parse(base).expect("valid base url"),
        }
    }

    /// Build `<base>/<segments...>`, percent-encoding each segment
    /// (reaction emoji are raw unicode).
    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .expect("base url can be a base")
            .extend(segments);
        url
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
    ) -> DiscordApiResult<reqwest::Response> {
        let response = request
            .header("Authorization", format!("Bot {}", self.token))
            .send()
            .await
            .map_err(|err| DiscordApiError::Transport {
                message: err.to_string(),
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status.as_u16() == 429 {
            let retry_after_secs = response
                .json::<WireRateLimit>()
                .await
                .map(|body| body.retry_after)
                .unwrap_or(1.0);
            return Err(DiscordApiError::RateLimited { retry_after_secs });
        }
        if status.as_u16() == 404 {
            return Err(DiscordApiError::NotFound);
        }
        if status.is_server_error() {
            return Err(DiscordApiError::Server {
                status: status.as_u16(),
            });
        }
        let message = response.text().await.unwrap_or_default();
        Err(DiscordApiError::Fatal {
            status: status.as_u16(),
            message,
        })
    }

    async fn parse<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> DiscordApiResult<T> {
        response
            .json::<T>()
            .await
            .map_err(|err| DiscordApiError::Transport {
                message: err.to_string(),
            })
    }
}

#[async_trait]
impl DiscordApi for HttpDiscordApi {
    async fn get_channels(&self, guild_id: &Snowflake) -> DiscordApiResult<Vec<DiscordChannel>> {
        let url = self.endpoint(&["guilds", guild_id, "channels"]);
        let response = self.send(self.http.get(url)).await?;
        let channels: Vec<WireChannel> = Self::parse(response).await?;
        Ok(channels
            .into_iter()
            .filter_map(WireChannel::into_channel)
            .collect())
    }

    async fn create_channel(
        &self,
        guild_id: &Snowflake,
        name: &str,
        topic: Option<&str>,
        parent_id: Option<&Snowflake>,
    ) -> DiscordApiResult<DiscordChannel> {
        let url = self.endpoint(&["guilds", guild_id, "channels"]);
        let body = serde_json::json!({
            "name": name,
            "type": CHANNEL_TYPE_TEXT,
            "topic": topic,
            "parent_id": parent_id,
        });
        let response = self.send(self.http.post(url).json(&body)).await?;
        let channel: WireChannel = Self::parse(response).await?;
        channel
            .into_channel()
            .ok_or_else(|| DiscordApiError::Transport {
                message: "created channel has unexpected type".to_owned(),
            })
    }

    async fn start_thread_with_message(
        &self,
        channel_id: &Snowflake,
        message_id: &Snowflake,
        name: &str,
    ) -> DiscordApiResult<DiscordChannel> {
        let url = self.endpoint(&["channels", channel_id, "messages", message_id, "threads"]);
        let body = serde_json::json!({ "name": name });
        let response = self.send(self.http.post(url).json(&body)).await?;
        let channel: WireChannel = Self::parse(response).await?;
        channel
            .into_channel()
            .ok_or_else(|| DiscordApiError::Transport {
                message: "created thread has unexpected type".to_owned(),
            })
    }

    async fn get_channel_webhooks(
        &self,
        channel_id: &Snowflake,
    ) -> DiscordApiResult<Vec<Webhook>> {
        let url = self.endpoint(&["channels", channel_id, "webhooks"]);
        let response = self.send(self.http.get(url)).await?;
        let webhooks: Vec<WireWebhook> = Self::parse(response).await?;
        Ok(webhooks
            .into_iter()
            .map(|webhook| Webhook {
                id: webhook.id,
                name: webhook.name.unwrap_or_default(),
                token: webhook.token,
            })
            .collect())
    }

    async fn create_webhook(
        &self,
        channel_id: &Snowflake,
        name: &str,
    ) -> DiscordApiResult<Webhook> {
        let url = self.endpoint(&["channels", channel_id, "webhooks"]);
        let body = serde_json::json!({ "name": name });
        let response = self.send(self.http.post(url).json(&body)).await?;
        let webhook: WireWebhook = Self::parse(response).await?;
        Ok(Webhook {
            id: webhook.id,
            name: webhook.name.unwrap_or_default(),
            token: webhook.token,
        })
    }

    async fn delete_webhook(&self, webhook_id: &Snowflake) -> DiscordApiResult<()> {
        let url = self.endpoint(&["webhooks", webhook_id]);
        self.send(self.http.delete(url)).await?;
        Ok(())
    }

    async fn execute_webhook(
        &self,
        webhook_id: &Snowflake,
        token: &str,
        payload: &WebhookPayload,
    ) -> DiscordApiResult<Snowflake> {
        let mut url = self.endpoint(&["webhooks", webhook_id, token]);
        url.set_query(Some("wait=true"));
        let response = self.send(self.http.post(url).json(payload)).await?;
        let message: WireMessage = Self::parse(response).await?;
        Ok(message.id)
    }

    async fn edit_message(
        &self,
        channel_id: &Snowflake,
        message_id: &Snowflake,
        content: &str,
    ) -> DiscordApiResult<()> {
        let url = self.endpoint(&["channels", channel_id, "messages", message_id]);
        let body = serde_json::json!({ "content": content });
        self.send(self.http.patch(url).json(&body)).await?;
        Ok(())
    }

    async fn delete_message(
        &self,
        channel_id: &Snowflake,
        message_id: &Snowflake,
    ) -> DiscordApiResult<()> {
        let url = self.endpoint(&["channels", channel_id, "messages", message_id]);
        self.send(self.http.delete(url)).await?;
        Ok(())
    }

    async fn add_reaction(
        &self,
        channel_id: &Snowflake,
        message_id: &Snowflake,
        emoji: &str,
    ) -> DiscordApiResult<()> {
        let url = self.endpoint(&[
            "channels", channel_id, "messages", message_id, "reactions", emoji, "@me",
        ]);
        self.send(self.http.put(url)).await?;
        Ok(())
    }

    async fn remove_reaction(
        &self,
        channel_id: &Snowflake,
        message_id: &Snowflake,
        user_id: Option<&Snowflake>,
        emoji: &str,
    ) -> DiscordApiResult<()> {
        let who = user_id.map(String::as_str).unwrap_or("@me");
        let url = self.endpoint(&[
            "channels", channel_id, "messages", message_id, "reactions", emoji, who,
        ]);
        self.send(self.http.delete(url)).await?;
        Ok(())
    }

    async fn get_reactions(
        &self,
        channel_id: &Snowflake,
        message_id: &Snowflake,
        emoji: &str,
    ) -> DiscordApiResult<Vec<DiscordUser>> {
        let url = self.endpoint(&[
            "channels", channel_id, "messages", message_id, "reactions", emoji,
        ]);
        let response = self.send(self.http.get(url)).await?;
        let users: Vec<WireUser> = Self::parse(response).await?;
        Ok(users.into_iter().map(WireUser::into_user).collect())
    }

    async fn create_role(&self, guild_id: &Snowflake, name: &str) -> DiscordApiResult<Snowflake> {
        let url = self.endpoint(&["guilds", guild_id, "roles"]);
        let body = serde_json::json!({ "name": name });
        let response = self.send(self.http.post(url).json(&body)).await?;
        let role: WireRole = Self::parse(response).await?;
        Ok(role.id)
    }

    async fn delete_role(
        &self,
        guild_id: &Snowflake,
        role_id: &Snowflake,
    ) -> DiscordApiResult<()> {
        let url = self.endpoint(&["guilds", guild_id, "roles", role_id]);
        self.send(self.http.delete(url)).await?;
        Ok(())
    }

    async fn edit_channel_permission_overrides(
        &self,
        channel_id: &Snowflake,
        overrides: &[PermissionOverride],
    ) -> DiscordApiResult<()> {
        for permission_override in overrides {
            let url = self.endpoint(&[
                "channels",
                channel_id,
                "permissions",
                &permission_override.role_id,
            ]);
            let body = serde_json::json!({
                "allow": permission_override.allow.to_string(),
                "deny": permission_override.deny.to_string(),
                // 0 = role overwrite
                "type": 0,
            });
            self.send(self.http.put(url).json(&body)).await?;
        }
        Ok(())
    }
}
