mod codec;
pub mod ext;

use std::collections::BTreeMap;

use ciborium::Value;
use serde::{Deserialize, Serialize};

pub use self::codec::DecodeError;
use crate::id::{EntityId, StreamId, UserDid};

/// Mime type marking an [`EditMessage`] body as a Diff-Match-Patch patch
/// to apply against the existing content, rather than a replacement.
pub const MIME_DMP_PATCH: &str = "text/x-dmp-patch";

/// One decoded stream event.
///
/// `id` doubles as the natural sort key of the entity the event creates
/// (ids are monotone on send). `room` scopes the event to a sub-container;
/// absence means space-level. `after` is a manual reordering anchor.
/// `extensions` carries opaque namespaced side-data, including the origin
/// tags the bridge uses to break echo loops.
///
/// The wire format is the CBOR codec in [`codec`](self); the serde derive
/// here backs the events-table JSON persistence used for stash replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EntityId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room: Option<EntityId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<EntityId>,
    pub kind: EventKind,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extensions: BTreeMap<String, Value>,
}

impl Event {
    pub fn new(id: EntityId, kind: EventKind) -> Self {
        Self {
            id,
            room: None,
            after: None,
            kind,
            extensions: BTreeMap::new(),
        }
    }

    pub fn in_room(mut self, room: EntityId) -> Self {
        self.room = Some(room);
        self
    }

    pub fn after(mut self, after: EntityId) -> Self {
        self.after = Some(after);
        self
    }
}

/// The closed set of event payloads the materializer understands.
///
/// Anything else decodes to [`EventKind::Unknown`], which downstream
/// consumers skip with a warning; decoding never fails on an
/// unrecognized `$type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "$type")]
pub enum EventKind {
    #[serde(rename = "createRoom")]
    CreateRoom(CreateRoom),
    #[serde(rename = "deleteRoom")]
    DeleteRoom(DeleteRoom),
    #[serde(rename = "setKind")]
    SetKind(SetKind),
    #[serde(rename = "updateParent")]
    UpdateParent(UpdateParent),
    #[serde(rename = "joinSpace")]
    JoinSpace(JoinSpace),
    #[serde(rename = "leaveSpace")]
    LeaveSpace(LeaveSpace),
    #[serde(rename = "joinRoom")]
    JoinRoom(JoinRoom),
    #[serde(rename = "leave")]
    Leave(Leave),
    #[serde(rename = "addAdmin")]
    AddAdmin(AddAdmin),
    #[serde(rename = "removeAdmin")]
    RemoveAdmin(RemoveAdmin),
    #[serde(rename = "createMessage")]
    CreateMessage(CreateMessage),
    #[serde(rename = "editMessage")]
    EditMessage(EditMessage),
    #[serde(rename = "addReaction")]
    AddReaction(AddReaction),
    #[serde(rename = "removeReaction")]
    RemoveReaction(RemoveReaction),
    #[serde(rename = "addBridgedReaction")]
    AddBridgedReaction(AddBridgedReaction),
    #[serde(rename = "removeBridgedReaction")]
    RemoveBridgedReaction(RemoveBridgedReaction),
    #[serde(rename = "setLastRead")]
    SetLastRead(SetLastRead),
    #[serde(rename = "setInfo")]
    SetInfo(SetInfo),
    #[serde(rename = "updateSidebar")]
    UpdateSidebar(UpdateSidebar),
    #[serde(rename = "updateProfile")]
    UpdateProfile(UpdateProfile),
    #[serde(rename = "createRoomLink")]
    CreateRoomLink(CreateRoomLink),
    #[serde(rename = "move")]
    Move(Move),
    #[serde(rename = "unknown")]
    Unknown { kind: String },
}

impl EventKind {
    /// The `$type` discriminator this kind is encoded under.
    pub fn type_name(&self) -> &str {
        match self {
            EventKind::CreateRoom(_) => "createRoom",
            EventKind::DeleteRoom(_) => "deleteRoom",
            EventKind::SetKind(_) => "setKind",
            EventKind::UpdateParent(_) => "updateParent",
            EventKind::JoinSpace(_) => "joinSpace",
            EventKind::LeaveSpace(_) => "leaveSpace",
            EventKind::JoinRoom(_) => "joinRoom",
            EventKind::Leave(_) => "leave",
            EventKind::AddAdmin(_) => "addAdmin",
            EventKind::RemoveAdmin(_) => "removeAdmin",
            EventKind::CreateMessage(_) => "createMessage",
            EventKind::EditMessage(_) => "editMessage",
            EventKind::AddReaction(_) => "addReaction",
            EventKind::RemoveReaction(_) => "removeReaction",
            EventKind::AddBridgedReaction(_) => "addBridgedReaction",
            EventKind::RemoveBridgedReaction(_) => "removeBridgedReaction",
            EventKind::SetLastRead(_) => "setLastRead",
            EventKind::SetInfo(_) => "setInfo",
            EventKind::UpdateSidebar(_) => "updateSidebar",
            EventKind::UpdateProfile(_) => "updateProfile",
            EventKind::CreateRoomLink(_) => "createRoomLink",
            EventKind::Move(_) => "move",
            EventKind::Unknown { kind } => kind,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomKind {
    Channel,
    Thread,
    Page,
    Category,
}

impl RoomKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RoomKind::Channel => "channel",
            RoomKind::Thread => "thread",
            RoomKind::Page => "page",
            RoomKind::Category => "category",
        }
    }
}

/// A message (or edit) body: raw bytes plus their mime type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Content {
    pub mime_type: String,
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

impl Content {
    pub fn text(data: impl Into<String>) -> Self {
        Self {
            mime_type: "text/plain".into(),
            data: data.into().into_bytes(),
        }
    }

    pub fn dmp_patch(patch: impl Into<String>) -> Self {
        Self {
            mime_type: MIME_DMP_PATCH.into(),
            data: patch.into().into_bytes(),
        }
    }

    pub fn is_dmp_patch(&self) -> bool {
        self.mime_type == MIME_DMP_PATCH
    }
}

/// Creates the room whose id is the event's own id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRoom {
    pub kind: RoomKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteRoom {
    pub room: EntityId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetKind {
    pub room: EntityId,
    pub kind: RoomKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateParent {
    pub room: EntityId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<EntityId>,
}

/// Personal-stream event: the user opened (joined) a space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinSpace {
    pub space: StreamId,
    #[serde(default)]
    pub hidden: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaveSpace {
    pub space: StreamId,
}

/// `user` defaults to the event sender when absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRoom {
    pub room: EntityId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<UserDid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Leave {
    pub room: EntityId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<UserDid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddAdmin {
    pub user: UserDid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveAdmin {
    pub user: UserDid,
}

/// A media attachment on a message. Classified into image/video/file
/// components by the mime-type prefix at materialization time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub source: String,
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alt: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkEmbed {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Anchors a message as a comment on a span of another entity's content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentAnchor {
    pub target: EntityId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snippet_start: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snippet_end: Option<u64>,
}

/// Bridged messages display under the original author's name and avatar
/// rather than the bridge bot's.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorOverride {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateMessage {
    pub body: Content,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply: Option<EntityId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<LinkEmbed>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<CommentAnchor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_override: Option<AuthorOverride>,
    /// Milliseconds since epoch; overrides the id-derived display time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp_override: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditMessage {
    pub target: EntityId,
    pub body: Content,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddReaction {
    pub target: EntityId,
    pub emoji: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveReaction {
    pub reaction: EntityId,
}

/// A reaction relayed by the bridge on behalf of a remote (Discord) user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddBridgedReaction {
    pub target: EntityId,
    pub emoji: String,
    pub reactor: UserDid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveBridgedReaction {
    pub reaction: EntityId,
}

/// Personal-stream event: last-read marker for a room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetLastRead {
    pub room: EntityId,
    pub event: EntityId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SidebarCategory {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<EntityId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateSidebar {
    #[serde(default)]
    pub categories: Vec<SidebarCategory>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateProfile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

/// Threads are two events: a `createRoom { kind: thread }` plus a
/// creation link from the parent room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRoomLink {
    pub room: EntityId,
    pub link_to_room: EntityId,
    #[serde(default)]
    pub is_creation_link: bool,
}

/// Manual reorder: move `entity` directly after `after` (or to the
/// natural id-ordered position when `after` is absent).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Move {
    pub entity: EntityId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<EntityId>,
}
