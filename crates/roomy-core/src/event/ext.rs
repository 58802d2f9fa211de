//! Namespaced event extensions.
//!
//! Extensions ride along in the event's `ext` map under reverse-domain
//! keys. The bridge stamps every event it emits with a Discord origin
//! tag; the stream→Discord direction treats the presence of any such tag
//! as "self-originated, do not relay".

use ciborium::Value;
use serde::{Deserialize, Serialize};

use super::Event;

pub const DISCORD_MESSAGE_ORIGIN: &str = "space.roomy.extension.discordMessageOrigin.v0";
pub const DISCORD_CHANNEL_ORIGIN: &str = "space.roomy.extension.discordChannelOrigin.v0";
pub const DISCORD_THREAD_ORIGIN: &str = "space.roomy.extension.discordThreadOrigin.v0";
pub const DISCORD_USER_ORIGIN: &str = "space.roomy.extension.discordUserOrigin.v0";
pub const DISCORD_REACTION_ORIGIN: &str = "space.roomy.extension.discordReactionOrigin.v0";
pub const DISCORD_SIDEBAR_ORIGIN: &str = "space.roomy.extension.discordSidebarOrigin.v0";

const DISCORD_ORIGIN_PREFIX: &str = "space.roomy.extension.discord";
const ORIGIN_SUFFIX: &str = "Origin.v0";

/// Identifies the Discord object an event was bridged from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscordOrigin {
    /// The snowflake of the source object (message, channel, user, ...).
    pub snowflake: String,
    pub guild: String,
    /// Change fingerprint of the source content at bridge time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
}

impl Event {
    /// Any Discord origin tag present on this event.
    pub fn discord_origin(&self) -> Option<DiscordOrigin> {
        self.extensions.iter().find_map(|(key, value)| {
            if key.starts_with(DISCORD_ORIGIN_PREFIX) && key.ends_with(ORIGIN_SUFFIX) {
                value.deserialized().ok()
            } else {
                None
            }
        })
    }

    /// True when this event was emitted by the bridge itself.
    ///
    /// The echo-break predicate: such events must never cause a Discord
    /// REST call.
    pub fn has_discord_origin(&self) -> bool {
        self.extensions
            .keys()
            .any(|key| key.starts_with(DISCORD_ORIGIN_PREFIX) && key.ends_with(ORIGIN_SUFFIX))
    }

    pub fn with_discord_origin(mut self, key: &str, origin: &DiscordOrigin) -> Self {
        self.extensions.insert(
            key.to_owned(),
            Value::serialized(origin).expect("Can't fail"),
        );
        self
    }
}
