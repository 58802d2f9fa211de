//! Event → SQL projection.
//!
//! [`materialize`] is a pure function from one decoded event to a
//! [`Bundle`]: the statements to run, the entities the event depends on,
//! and the sort directive for the apply loop's position engine. It never
//! touches the database; reads happen later, inside the applying
//! transaction.
//!
//! Statement shapes are uniformly idempotent (`ON CONFLICT DO NOTHING` /
//! targeted upserts) so a bundle can be replayed from the stash without
//! duplicating rows.

use roomy_core::event::{
    Attachment, AuthorOverride, CommentAnchor, Content, EventKind, LinkEmbed,
};
use roomy_core::{EntityId, Event, StreamId, Timestamp, UserDid};
use roomy_store::Statement;

/// Output of materializing one event.
#[derive(Debug, Clone)]
pub enum Bundle {
    Success {
        event_id: EntityId,
        idx: u64,
        statements: Vec<Statement>,
        depends_on: Vec<EntityId>,
        sort: Option<SortSpec>,
    },
    /// Idempotent user-entity/profile inserts, applied before the events
    /// that reference those users.
    ProfileEnsure {
        dids: Vec<UserDid>,
        statements: Vec<Statement>,
    },
    Error {
        event_id: EntityId,
        message: String,
    },
}

/// Directive for the sort-position engine, run after the bundle's
/// statements inside the same transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortSpec {
    pub entity: EntityId,
    pub after: Option<EntityId>,
}

/// Deterministic id of the user entity representing `did` within
/// `stream`. Reserved timestamp 1 keeps it clear of the space root
/// (timestamp 0) and of real event ulids.
pub fn user_entity_id(stream: &StreamId, did: &UserDid) -> EntityId {
    let mut hasher = blake3::Hasher::new();
    hasher.update(stream.as_str().as_bytes());
    hasher.update(b"\x00");
    hasher.update(did.as_str().as_bytes());
    let digest = hasher.finalize();
    let mut random = [0u8; 16];
    random[6..16].copy_from_slice(&digest.as_bytes()[..10]);
    EntityId::from_parts(1, u128::from_be_bytes(random))
}

/// Deterministic id for an entity derived from another (attachments),
/// stable across stash replays and re-ingest.
fn derived_entity_id(base: EntityId, salt: &str) -> EntityId {
    let mut hasher = blake3::Hasher::new();
    hasher.update(base.to_string().as_bytes());
    hasher.update(b"\x00");
    hasher.update(salt.as_bytes());
    let digest = hasher.finalize();
    let mut random = [0u8; 16];
    random[6..16].copy_from_slice(&digest.as_bytes()[..10]);
    EntityId::from_parts(base.timestamp_ms(), u128::from_be_bytes(random))
}

fn ensure_entity(
    id: EntityId,
    stream_id: &StreamId,
    parent: Option<EntityId>,
    now: Timestamp,
) -> Statement {
    Statement::new(
        "INSERT INTO entities (id, stream_id, parent, sort_idx, created_at, updated_at) \
         VALUES (?1, ?2, ?3, NULL, ?4, ?5) \
         ON CONFLICT(id) DO UPDATE SET updated_at = excluded.updated_at",
        vec![
            id.to_string().into(),
            stream_id.as_str().into(),
            parent.map(|p| p.to_string()).into(),
            created_at_of(id).into(),
            now.as_millis().into(),
        ],
    )
}

/// Entities created on the fly (users, space roots) must not bump
/// `updated_at` every time they are re-ensured.
fn ensure_entity_quiet(
    id: EntityId,
    stream_id: &StreamId,
    now: Timestamp,
) -> Statement {
    Statement::new(
        "INSERT INTO entities (id, stream_id, parent, sort_idx, created_at, updated_at) \
         VALUES (?1, ?2, NULL, NULL, ?3, ?4) \
         ON CONFLICT(id) DO NOTHING",
        vec![
            id.to_string().into(),
            stream_id.as_str().into(),
            created_at_of(id).into(),
            now.as_millis().into(),
        ],
    )
}

fn created_at_of(id: EntityId) -> u64 {
    id.timestamp_ms()
}

fn member_edge(head: EntityId, tail: EntityId, can: &str) -> Statement {
    Statement::new(
        "INSERT INTO edges (head, tail, label, payload_json) VALUES (?1, ?2, 'member', ?3) \
         ON CONFLICT(head, tail, label) DO UPDATE SET payload_json = excluded.payload_json",
        vec![
            head.to_string().into(),
            tail.to_string().into(),
            format!("{{\"can\":\"{can}\"}}").into(),
        ],
    )
}

fn plain_edge(head: EntityId, tail: EntityId, label: &'static str) -> Statement {
    Statement::new(
        format!(
            "INSERT INTO edges (head, tail, label) VALUES (?1, ?2, '{label}') \
             ON CONFLICT(head, tail, label) DO NOTHING"
        ),
        vec![head.to_string().into(), tail.to_string().into()],
    )
}

fn reorder_edges(entity: EntityId, after: Option<EntityId>) -> Vec<Statement> {
    let mut statements = vec![Statement::new(
        "DELETE FROM edges WHERE head = ?1 AND label = 'reorder'",
        vec![entity.to_string().into()],
    )];
    if let Some(after) = after {
        statements.push(plain_edge(entity, after, "reorder"));
    }
    statements
}

/// Users whose entities must exist before this event's edges reference
/// them. The sender is included for events that attribute content.
pub(crate) fn referenced_users(event: &Event, sender: &UserDid) -> Vec<UserDid> {
    match &event.kind {
        EventKind::CreateMessage(_) | EventKind::JoinSpace(_) | EventKind::AddReaction(_) => {
            vec![sender.clone()]
        }
        EventKind::JoinRoom(fields) => {
            vec![fields.user.clone().unwrap_or_else(|| sender.clone())]
        }
        EventKind::Leave(fields) => {
            vec![fields.user.clone().unwrap_or_else(|| sender.clone())]
        }
        EventKind::AddAdmin(fields) => vec![fields.user.clone()],
        EventKind::RemoveAdmin(fields) => vec![fields.user.clone()],
        EventKind::AddBridgedReaction(fields) => vec![fields.reactor.clone()],
        _ => vec![],
    }
}

pub(crate) fn materialize(
    event: &Event,
    stream_id: &StreamId,
    user: &UserDid,
    idx: u64,
) -> Bundle {
    let now = Timestamp::now();
    let event_id = event.id;
    let mut statements: Vec<Statement> = Vec::new();
    let mut depends_on: Vec<EntityId> = Vec::new();
    let mut sort: Option<SortSpec> = None;

    match &event.kind {
        EventKind::CreateRoom(fields) => {
            statements.push(ensure_entity(event_id, stream_id, event.room, now));
            statements.push(Statement::new(
                "INSERT INTO comp_room (entity, kind, name, deleted) VALUES (?1, ?2, ?3, 0) \
                 ON CONFLICT(entity) DO UPDATE SET \
                     kind = excluded.kind, \
                     name = COALESCE(excluded.name, comp_room.name)",
                vec![
                    event_id.to_string().into(),
                    fields.kind.as_str().into(),
                    fields.name.clone().into(),
                ],
            ));
            if let Some(parent) = event.room {
                depends_on.push(parent);
            }
            statements.extend(reorder_edges(event_id, event.after));
            sort = Some(SortSpec {
                entity: event_id,
                after: event.after,
            });
        }
        EventKind::DeleteRoom(fields) => {
            statements.push(Statement::new(
                "UPDATE comp_room SET deleted = 1 WHERE entity = ?1",
                vec![fields.room.to_string().into()],
            ));
            depends_on.push(fields.room);
        }
        EventKind::SetKind(fields) => {
            statements.push(Statement::new(
                "UPDATE comp_room SET kind = ?2 WHERE entity = ?1",
                vec![fields.room.to_string().into(), fields.kind.as_str().into()],
            ));
            depends_on.push(fields.room);
        }
        EventKind::UpdateParent(fields) => {
            statements.push(Statement::new(
                "UPDATE entities SET parent = ?2, updated_at = ?3 WHERE id = ?1",
                vec![
                    fields.room.to_string().into(),
                    fields.parent.map(|p| p.to_string()).into(),
                    now.as_millis().into(),
                ],
            ));
            statements.push(Statement::new(
                "DELETE FROM edges WHERE head = ?1 AND label = 'parent'",
                vec![fields.room.to_string().into()],
            ));
            statements.push(Statement::new(
                "DELETE FROM edges WHERE tail = ?1 AND label = 'child'",
                vec![fields.room.to_string().into()],
            ));
            depends_on.push(fields.room);
            if let Some(parent) = fields.parent {
                statements.push(plain_edge(fields.room, parent, "parent"));
                statements.push(plain_edge(parent, fields.room, "child"));
                depends_on.push(parent);
            }
        }
        EventKind::JoinSpace(fields) => {
            statements.push(ensure_entity(event_id, stream_id, None, now));
            statements.push(Statement::new(
                "INSERT INTO comp_space (entity, space_id, hidden, backfilled_to) \
                 VALUES (?1, ?2, ?3, 0) \
                 ON CONFLICT(space_id) DO UPDATE SET hidden = excluded.hidden",
                vec![
                    event_id.to_string().into(),
                    fields.space.as_str().into(),
                    fields.hidden.into(),
                ],
            ));
        }
        EventKind::LeaveSpace(fields) => {
            statements.push(Statement::new(
                "DELETE FROM comp_space WHERE space_id = ?1",
                vec![fields.space.as_str().into()],
            ));
        }
        EventKind::JoinRoom(fields) => {
            let member = fields.user.clone().unwrap_or_else(|| user.clone());
            statements.push(member_edge(
                fields.room,
                user_entity_id(stream_id, &member),
                "post",
            ));
            depends_on.push(fields.room);
        }
        EventKind::Leave(fields) => {
            let member = fields.user.clone().unwrap_or_else(|| user.clone());
            statements.push(Statement::new(
                "DELETE FROM edges WHERE head = ?1 AND tail = ?2 AND label = 'member'",
                vec![
                    fields.room.to_string().into(),
                    user_entity_id(stream_id, &member).to_string().into(),
                ],
            ));
            depends_on.push(fields.room);
        }
        EventKind::AddAdmin(fields) => {
            let root = EntityId::space_root(stream_id);
            statements.push(ensure_entity_quiet(root, stream_id, now));
            statements.push(member_edge(
                root,
                user_entity_id(stream_id, &fields.user),
                "admin",
            ));
        }
        EventKind::RemoveAdmin(fields) => {
            let root = EntityId::space_root(stream_id);
            statements.push(Statement::new(
                "UPDATE edges SET payload_json = '{\"can\":\"post\"}' \
                 WHERE head = ?1 AND tail = ?2 AND label = 'member'",
                vec![
                    root.to_string().into(),
                    user_entity_id(stream_id, &fields.user).to_string().into(),
                ],
            ));
        }
        EventKind::CreateMessage(fields) => {
            statements.push(ensure_entity(event_id, stream_id, event.room, now));
            statements.push(content_insert(event_id, &fields.body));
            statements.push(plain_edge(
                event_id,
                user_entity_id(stream_id, user),
                "author",
            ));
            if let Some(room) = event.room {
                depends_on.push(room);
            }
            if let Some(reply) = fields.reply {
                statements.push(plain_edge(event_id, reply, "reply"));
                depends_on.push(reply);
            }
            for (at, attachment) in fields.attachments.iter().enumerate() {
                statements.extend(attachment_statements(
                    event_id, stream_id, at, attachment, now,
                ));
            }
            if let Some(link) = &fields.link {
                statements.push(link_insert(event_id, link));
            }
            if let Some(comment) = &fields.comment {
                statements.push(comment_insert(event_id, comment));
                statements.push(plain_edge(event_id, comment.target, "source"));
                depends_on.push(comment.target);
            }
            if fields.author_override.is_some() || fields.timestamp_override.is_some() {
                statements.push(override_meta_insert(
                    event_id,
                    fields.author_override.as_ref(),
                    fields.timestamp_override,
                ));
            }
            statements.extend(reorder_edges(event_id, event.after));
            sort = Some(SortSpec {
                entity: event_id,
                after: event.after,
            });
        }
        EventKind::EditMessage(fields) => {
            if fields.body.is_dmp_patch() {
                statements.push(Statement::new(
                    "UPDATE comp_content \
                     SET data = CAST(apply_dmp_patch(text(data), ?2) AS BLOB) \
                     WHERE entity = ?1",
                    vec![
                        fields.target.to_string().into(),
                        String::from_utf8_lossy(&fields.body.data).into_owned().into(),
                    ],
                ));
            } else {
                statements.push(Statement::new(
                    "UPDATE comp_content SET data = ?2, mime_type = ?3 WHERE entity = ?1",
                    vec![
                        fields.target.to_string().into(),
                        fields.body.data.clone().into(),
                        fields.body.mime_type.as_str().into(),
                    ],
                ));
            }
            statements.push(Statement::new(
                "INSERT INTO comp_page_edits (entity, edit_count, last_edited_at) \
                 VALUES (?1, 1, ?2) \
                 ON CONFLICT(entity) DO UPDATE SET \
                     edit_count = comp_page_edits.edit_count + 1, \
                     last_edited_at = excluded.last_edited_at",
                vec![fields.target.to_string().into(), now.as_millis().into()],
            ));
            statements.push(Statement::new(
                "UPDATE entities SET updated_at = ?2 WHERE id = ?1",
                vec![fields.target.to_string().into(), now.as_millis().into()],
            ));
            depends_on.push(fields.target);
        }
        EventKind::AddReaction(fields) => {
            statements.push(ensure_entity(event_id, stream_id, Some(fields.target), now));
            statements.push(reaction_insert(event_id, fields.target, &fields.emoji, user));
            depends_on.push(fields.target);
        }
        EventKind::AddBridgedReaction(fields) => {
            statements.push(ensure_entity(event_id, stream_id, Some(fields.target), now));
            statements.push(reaction_insert(
                event_id,
                fields.target,
                &fields.emoji,
                &fields.reactor,
            ));
            depends_on.push(fields.target);
        }
        EventKind::RemoveReaction(fields) => {
            statements.push(Statement::new(
                "DELETE FROM entities WHERE id = ?1",
                vec![fields.reaction.to_string().into()],
            ));
            depends_on.push(fields.reaction);
        }
        EventKind::RemoveBridgedReaction(fields) => {
            statements.push(Statement::new(
                "DELETE FROM entities WHERE id = ?1",
                vec![fields.reaction.to_string().into()],
            ));
            depends_on.push(fields.reaction);
        }
        EventKind::SetLastRead(fields) => {
            statements.push(ensure_entity(event_id, stream_id, None, now));
            statements.push(Statement::new(
                "INSERT INTO comp_last_read (entity, room, last_read_id) VALUES (?1, ?2, ?3) \
                 ON CONFLICT(room) DO UPDATE SET last_read_id = excluded.last_read_id",
                vec![
                    event_id.to_string().into(),
                    fields.room.to_string().into(),
                    fields.event.to_string().into(),
                ],
            ));
        }
        EventKind::SetInfo(fields) => {
            let root = EntityId::space_root(stream_id);
            statements.push(ensure_entity_quiet(root, stream_id, now));
            statements.push(Statement::new(
                "INSERT INTO comp_info (entity, name, description, avatar) \
                 VALUES (?1, ?2, ?3, ?4) \
                 ON CONFLICT(entity) DO UPDATE SET \
                     name = COALESCE(excluded.name, comp_info.name), \
                     description = COALESCE(excluded.description, comp_info.description), \
                     avatar = COALESCE(excluded.avatar, comp_info.avatar)",
                vec![
                    root.to_string().into(),
                    fields.name.clone().into(),
                    fields.description.clone().into(),
                    fields.avatar.clone().into(),
                ],
            ));
        }
        EventKind::UpdateSidebar(fields) => {
            let root = EntityId::space_root(stream_id);
            statements.push(ensure_entity_quiet(root, stream_id, now));
            statements.push(Statement::new(
                "INSERT INTO comp_info (entity, sidebar_json) VALUES (?1, ?2) \
                 ON CONFLICT(entity) DO UPDATE SET sidebar_json = excluded.sidebar_json",
                vec![
                    root.to_string().into(),
                    serde_json::to_string(&fields.categories)
                        .expect("Can't fail")
                        .into(),
                ],
            ));
        }
        EventKind::UpdateProfile(fields) => {
            let uid = user_entity_id(stream_id, user);
            statements.push(ensure_entity_quiet(uid, stream_id, now));
            statements.push(Statement::new(
                "INSERT INTO comp_user (entity, did, handle) VALUES (?1, ?2, ?3) \
                 ON CONFLICT(entity) DO UPDATE SET \
                     handle = COALESCE(excluded.handle, comp_user.handle)",
                vec![
                    uid.to_string().into(),
                    user.as_str().into(),
                    fields.username.clone().into(),
                ],
            ));
            statements.push(Statement::new(
                "INSERT INTO comp_info (entity, name, avatar) VALUES (?1, ?2, ?3) \
                 ON CONFLICT(entity) DO UPDATE SET \
                     name = COALESCE(excluded.name, comp_info.name), \
                     avatar = COALESCE(excluded.avatar, comp_info.avatar)",
                vec![
                    uid.to_string().into(),
                    fields.display_name.clone().into(),
                    fields.avatar.clone().into(),
                ],
            ));
        }
        EventKind::CreateRoomLink(fields) => {
            statements.push(Statement::new(
                "INSERT INTO edges (head, tail, label, payload_json) \
                 VALUES (?1, ?2, 'link', ?3) \
                 ON CONFLICT(head, tail, label) DO UPDATE SET \
                     payload_json = excluded.payload_json",
                vec![
                    fields.room.to_string().into(),
                    fields.link_to_room.to_string().into(),
                    format!("{{\"isCreationLink\":{}}}", fields.is_creation_link).into(),
                ],
            ));
            depends_on.push(fields.room);
            depends_on.push(fields.link_to_room);
        }
        EventKind::Move(fields) => {
            statements.extend(reorder_edges(fields.entity, fields.after));
            depends_on.push(fields.entity);
            if let Some(after) = fields.after {
                depends_on.push(after);
            }
            sort = Some(SortSpec {
                entity: fields.entity,
                after: fields.after,
            });
        }
        EventKind::Unknown { kind } => {
            return Bundle::Error {
                event_id,
                message: format!("unknown event kind `{kind}`"),
            };
        }
    }

    Bundle::Success {
        event_id,
        idx,
        statements,
        depends_on,
        sort,
    }
}

fn content_insert(entity: EntityId, body: &Content) -> Statement {
    Statement::new(
        "INSERT INTO comp_content (entity, data, mime_type) VALUES (?1, ?2, ?3) \
         ON CONFLICT(entity) DO NOTHING",
        vec![
            entity.to_string().into(),
            body.data.clone().into(),
            body.mime_type.as_str().into(),
        ],
    )
}

fn attachment_statements(
    message: EntityId,
    stream_id: &StreamId,
    at: usize,
    attachment: &Attachment,
    now: Timestamp,
) -> Vec<Statement> {
    let attachment_id = derived_entity_id(message, &format!("attachment:{at}"));
    let mut statements = vec![Statement::new(
        "INSERT INTO entities (id, stream_id, parent, sort_idx, created_at, updated_at) \
         VALUES (?1, ?2, ?3, NULL, ?4, ?4) ON CONFLICT(id) DO NOTHING",
        vec![
            attachment_id.to_string().into(),
            stream_id.as_str().into(),
            message.to_string().into(),
            now.as_millis().into(),
        ],
    )];

    let component = if attachment.mime_type.starts_with("image/") {
        Statement::new(
            "INSERT INTO comp_image (entity, source, width, height, alt) \
             VALUES (?1, ?2, ?3, ?4, ?5) ON CONFLICT(entity) DO NOTHING",
            vec![
                attachment_id.to_string().into(),
                attachment.source.as_str().into(),
                attachment.width.map(u64::from).into(),
                attachment.height.map(u64::from).into(),
                attachment.alt.clone().into(),
            ],
        )
    } else if attachment.mime_type.starts_with("video/") {
        Statement::new(
            "INSERT INTO comp_video (entity, source, width, height) \
             VALUES (?1, ?2, ?3, ?4) ON CONFLICT(entity) DO NOTHING",
            vec![
                attachment_id.to_string().into(),
                attachment.source.as_str().into(),
                attachment.width.map(u64::from).into(),
                attachment.height.map(u64::from).into(),
            ],
        )
    } else {
        Statement::new(
            "INSERT INTO comp_file (entity, source, name, mime_type, size) \
             VALUES (?1, ?2, ?3, ?4, ?5) ON CONFLICT(entity) DO NOTHING",
            vec![
                attachment_id.to_string().into(),
                attachment.source.as_str().into(),
                attachment.name.clone().into(),
                attachment.mime_type.as_str().into(),
                attachment.size.into(),
            ],
        )
    };
    statements.push(component);
    statements.push(plain_edge(message, attachment_id, "embed"));
    statements
}

fn link_insert(entity: EntityId, link: &LinkEmbed) -> Statement {
    Statement::new(
        "INSERT INTO comp_link (entity, url, title, description) VALUES (?1, ?2, ?3, ?4) \
         ON CONFLICT(entity) DO NOTHING",
        vec![
            entity.to_string().into(),
            link.url.as_str().into(),
            link.title.clone().into(),
            link.description.clone().into(),
        ],
    )
}

fn comment_insert(entity: EntityId, comment: &CommentAnchor) -> Statement {
    Statement::new(
        "INSERT INTO comp_comment (entity, target, snippet_start, snippet_end) \
         VALUES (?1, ?2, ?3, ?4) ON CONFLICT(entity) DO NOTHING",
        vec![
            entity.to_string().into(),
            comment.target.to_string().into(),
            comment.snippet_start.into(),
            comment.snippet_end.into(),
        ],
    )
}

fn override_meta_insert(
    entity: EntityId,
    author: Option<&AuthorOverride>,
    timestamp_ms: Option<u64>,
) -> Statement {
    Statement::new(
        "INSERT INTO comp_override_meta (entity, author_name, author_avatar, timestamp_ms) \
         VALUES (?1, ?2, ?3, ?4) ON CONFLICT(entity) DO NOTHING",
        vec![
            entity.to_string().into(),
            author.map(|a| a.name.clone()).into(),
            author.and_then(|a| a.avatar.clone()).into(),
            timestamp_ms.into(),
        ],
    )
}

fn reaction_insert(
    entity: EntityId,
    target: EntityId,
    emoji: &str,
    reactor: &UserDid,
) -> Statement {
    Statement::new(
        "INSERT INTO comp_reaction (entity, target, emoji, reactor) VALUES (?1, ?2, ?3, ?4) \
         ON CONFLICT(entity) DO NOTHING",
        vec![
            entity.to_string().into(),
            target.to_string().into(),
            emoji.into(),
            reactor.as_str().into(),
        ],
    )
}

/// Idempotent statements ensuring a user entity (+ optional fetched
/// profile info) exists in `stream`.
pub(crate) fn ensure_user_statements(
    stream_id: &StreamId,
    did: &UserDid,
    profile: Option<&crate::profile::Profile>,
) -> Vec<Statement> {
    let uid = user_entity_id(stream_id, did);
    let now = Timestamp::now();
    let mut statements = vec![
        ensure_entity_quiet(uid, stream_id, now),
        Statement::new(
            "INSERT INTO comp_user (entity, did, handle) VALUES (?1, ?2, ?3) \
             ON CONFLICT(entity) DO NOTHING",
            vec![
                uid.to_string().into(),
                did.as_str().into(),
                profile.and_then(|p| p.username.clone()).into(),
            ],
        ),
    ];
    if let Some(profile) = profile {
        if profile.display_name.is_some() || profile.avatar.is_some() {
            statements.push(Statement::new(
                "INSERT INTO comp_info (entity, name, avatar) VALUES (?1, ?2, ?3) \
                 ON CONFLICT(entity) DO NOTHING",
                vec![
                    uid.to_string().into(),
                    profile.display_name.clone().into(),
                    profile.avatar.clone().into(),
                ],
            ));
        }
    }
    statements
}
