//! The binary wire codec for events.
//!
//! Payloads are CBOR-encoded tagged maps: a text-keyed map carrying a
//! `$type` discriminator, the common keys `id`, `room`, `after`, `ext`,
//! and the variant-specific fields flattened alongside them. Decoding is
//! total over unknown `$type` values and unknown keys; only structural
//! damage (not a map, missing/invalid `id`) is an error.

use std::collections::BTreeMap;

use ciborium::Value;
use snafu::{Location, OptionExt as _, ResultExt as _, Snafu};

use super::{Event, EventKind};
use crate::id::{EntityId, EntityIdParseError};

#[derive(Debug, Snafu)]
pub enum DecodeError {
    #[snafu(display("Payload is not valid cbor"))]
    Cbor {
        source: ciborium::de::Error<std::io::Error>,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("Payload is not a map"))]
    NotAMap,
    #[snafu(display("Missing `$type` discriminator"))]
    MissingType,
    #[snafu(display("Missing `id`"))]
    MissingId,
    #[snafu(display("Invalid `{key}` id"))]
    InvalidId {
        key: &'static str,
        source: EntityIdParseError,
    },
    #[snafu(display("Invalid fields for `{kind}`"))]
    Fields {
        kind: String,
        source: ciborium::value::Error,
        #[snafu(implicit)]
        location: Location,
    },
}

impl Event {
    pub fn decode(bytes: &[u8]) -> Result<Event, DecodeError> {
        let value: Value = ciborium::from_reader(std::io::Cursor::new(bytes)).context(CborSnafu)?;
        let entries = value.as_map().context(NotAMapSnafu)?;

        let mut type_name: Option<String> = None;
        let mut id: Option<EntityId> = None;
        let mut room: Option<EntityId> = None;
        let mut after: Option<EntityId> = None;
        let mut extensions = BTreeMap::new();

        for (key, val) in entries {
            let Some(key) = key.as_text() else {
                // Non-text keys are tolerated and ignored
                continue;
            };
            match key {
                "$type" => {
                    type_name = val.as_text().map(str::to_owned);
                }
                "id" => {
                    id = Some(parse_id_value(val, "id")?.context(MissingIdSnafu)?);
                }
                "room" => {
                    room = parse_id_value(val, "room")?;
                }
                "after" => {
                    after = parse_id_value(val, "after")?;
                }
                "ext" => {
                    if let Some(ext_entries) = val.as_map() {
                        for (ext_key, ext_val) in ext_entries {
                            if let Some(ext_key) = ext_key.as_text() {
                                extensions.insert(ext_key.to_owned(), ext_val.clone());
                            }
                        }
                    }
                }
                _ => {}
            }
        }

        let type_name = type_name.context(MissingTypeSnafu)?;
        let id = id.context(MissingIdSnafu)?;
        let kind = decode_kind(&type_name, &value)?;

        Ok(Event {
            id,
            room,
            after,
            kind,
            extensions,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut entries: Vec<(Value, Value)> = vec![(
            Value::Text("$type".into()),
            Value::Text(self.kind.type_name().to_owned()),
        )];
        entries.push((Value::Text("id".into()), Value::Text(self.id.to_string())));
        if let Some(room) = self.room {
            entries.push((Value::Text("room".into()), Value::Text(room.to_string())));
        }
        if let Some(after) = self.after {
            entries.push((Value::Text("after".into()), Value::Text(after.to_string())));
        }
        if !self.extensions.is_empty() {
            let ext = self
                .extensions
                .iter()
                .map(|(key, val)| (Value::Text(key.clone()), val.clone()))
                .collect();
            entries.push((Value::Text("ext".into()), Value::Map(ext)));
        }
        if let Some(fields) = encode_kind_fields(&self.kind) {
            entries.extend(fields);
        }

        let mut buf = Vec::with_capacity(128);
        ciborium::into_writer(&Value::Map(entries), &mut buf).expect("Can't fail");
        buf
    }
}

fn parse_id_value(value: &Value, key: &'static str) -> Result<Option<EntityId>, DecodeError> {
    match value {
        Value::Null => Ok(None),
        _ => {
            let Some(text) = value.as_text() else {
                return Ok(None);
            };
            Ok(Some(text.parse().context(InvalidIdSnafu { key })?))
        }
    }
}

fn decode_fields<T: serde::de::DeserializeOwned>(
    kind: &str,
    value: &Value,
) -> Result<T, DecodeError> {
    value.deserialized().context(FieldsSnafu { kind })
}

fn decode_kind(type_name: &str, value: &Value) -> Result<EventKind, DecodeError> {
    Ok(match type_name {
        "createRoom" => EventKind::CreateRoom(decode_fields(type_name, value)?),
        "deleteRoom" => EventKind::DeleteRoom(decode_fields(type_name, value)?),
        "setKind" => EventKind::SetKind(decode_fields(type_name, value)?),
        "updateParent" => EventKind::UpdateParent(decode_fields(type_name, value)?),
        "joinSpace" => EventKind::JoinSpace(decode_fields(type_name, value)?),
        "leaveSpace" => EventKind::LeaveSpace(decode_fields(type_name, value)?),
        "joinRoom" => EventKind::JoinRoom(decode_fields(type_name, value)?),
        "leave" => EventKind::Leave(decode_fields(type_name, value)?),
        "addAdmin" => EventKind::AddAdmin(decode_fields(type_name, value)?),
        "removeAdmin" => EventKind::RemoveAdmin(decode_fields(type_name, value)?),
        "createMessage" => EventKind::CreateMessage(decode_fields(type_name, value)?),
        "editMessage" => EventKind::EditMessage(decode_fields(type_name, value)?),
        "addReaction" => EventKind::AddReaction(decode_fields(type_name, value)?),
        "removeReaction" => EventKind::RemoveReaction(decode_fields(type_name, value)?),
        "addBridgedReaction" => EventKind::AddBridgedReaction(decode_fields(type_name, value)?),
        "removeBridgedReaction" => {
            EventKind::RemoveBridgedReaction(decode_fields(type_name, value)?)
        }
        "setLastRead" => EventKind::SetLastRead(decode_fields(type_name, value)?),
        "setInfo" => EventKind::SetInfo(decode_fields(type_name, value)?),
        "updateSidebar" => EventKind::UpdateSidebar(decode_fields(type_name, value)?),
        "updateProfile" => EventKind::UpdateProfile(decode_fields(type_name, value)?),
        "createRoomLink" => EventKind::CreateRoomLink(decode_fields(type_name, value)?),
        "move" => EventKind::Move(decode_fields(type_name, value)?),
        _ => EventKind::Unknown {
            kind: type_name.to_owned(),
        },
    })
}

fn encode_fields<T: serde::Serialize>(fields: &T) -> Option<Vec<(Value, Value)>> {
    match Value::serialized(fields).expect("Can't fail") {
        Value::Map(entries) => Some(entries),
        _ => None,
    }
}

fn encode_kind_fields(kind: &EventKind) -> Option<Vec<(Value, Value)>> {
    match kind {
        EventKind::CreateRoom(fields) => encode_fields(fields),
        EventKind::DeleteRoom(fields) => encode_fields(fields),
        EventKind::SetKind(fields) => encode_fields(fields),
        EventKind::UpdateParent(fields) => encode_fields(fields),
        EventKind::JoinSpace(fields) => encode_fields(fields),
        EventKind::LeaveSpace(fields) => encode_fields(fields),
        EventKind::JoinRoom(fields) => encode_fields(fields),
        EventKind::Leave(fields) => encode_fields(fields),
        EventKind::AddAdmin(fields) => encode_fields(fields),
        EventKind::RemoveAdmin(fields) => encode_fields(fields),
        EventKind::CreateMessage(fields) => encode_fields(fields),
        EventKind::EditMessage(fields) => encode_fields(fields),
        EventKind::AddReaction(fields) => encode_fields(fields),
        EventKind::RemoveReaction(fields) => encode_fields(fields),
        EventKind::AddBridgedReaction(fields) => encode_fields(fields),
        EventKind::RemoveBridgedReaction(fields) => encode_fields(fields),
        EventKind::SetLastRead(fields) => encode_fields(fields),
        EventKind::SetInfo(fields) => encode_fields(fields),
        EventKind::UpdateSidebar(fields) => encode_fields(fields),
        EventKind::UpdateProfile(fields) => encode_fields(fields),
        EventKind::CreateRoomLink(fields) => encode_fields(fields),
        EventKind::Move(fields) => encode_fields(fields),
        EventKind::Unknown { .. } => None,
    }
}
