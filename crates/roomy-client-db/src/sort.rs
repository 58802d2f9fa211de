//! Sort-position engine.
//!
//! Runs inside the applying transaction, after a bundle's statements.
//! Computes the entity's `sort_idx` so it sorts immediately after its
//! anchor: the explicit `after` target when given, otherwise the entity
//! with the greatest id strictly below its own within the stream.
//!
//! Display order everywhere is `ORDER BY COALESCE(sort_idx, id), id`.

use roomy_core::{EntityId, StreamId};
use roomy_store::{Statement, StoreResult, StoreTx};

use crate::frac_index::key_between;
use crate::materialize::SortSpec;

/// Position `spec.entity`, then re-position any entities anchored
/// (`reorder` edge) to it.
///
/// Skips silently when the entity was not materialized (e.g. the event
/// referenced a missing parent and its bundle was stashed or failed).
pub(crate) fn position_entity(
    tx: &StoreTx<'_>,
    stream_id: &StreamId,
    spec: &SortSpec,
) -> StoreResult<()> {
    let entity = spec.entity.to_string();

    let current = tx.query(&Statement::new(
        "SELECT sort_idx FROM entities WHERE id = ?1 AND stream_id = ?2",
        vec![entity.as_str().into(), stream_id.as_str().into()],
    ))?;
    let Some(current_row) = current.first() else {
        return Ok(());
    };
    let current_sort_idx = current_row.text("sort_idx").map(str::to_owned);

    let lower = lower_bound(tx, stream_id, spec.entity, spec.after)?;
    let upper = upper_bound(tx, stream_id, spec.entity, lower.as_deref())?;

    let sort_idx = key_between(lower.as_deref(), upper.as_deref());
    if current_sort_idx.as_deref() == Some(sort_idx.as_str()) {
        // Repeated identical move; nothing to churn
        return Ok(());
    }

    tx.execute(&Statement::new(
        "UPDATE entities SET sort_idx = ?2 WHERE id = ?1",
        vec![entity.as_str().into(), sort_idx.as_str().into()],
    ))?;

    // Entities anchored after this one land between it and its successor,
    // all sharing one key; their own id breaks the tie in display order.
    let followers = tx.query(&Statement::new(
        "SELECT head FROM edges WHERE tail = ?1 AND label = 'reorder' AND head <> ?1 \
         ORDER BY head",
        vec![entity.as_str().into()],
    ))?;
    if !followers.is_empty() {
        let follower_idx = key_between(Some(&sort_idx), upper.as_deref());
        for row in &followers.rows {
            let Some(follower) = row.text("head") else {
                continue;
            };
            tx.execute(&Statement::new(
                "UPDATE entities SET sort_idx = ?2 WHERE id = ?1 AND stream_id = ?3",
                vec![
                    follower.into(),
                    follower_idx.as_str().into(),
                    stream_id.as_str().into(),
                ],
            ))?;
        }
    }

    Ok(())
}

/// The key everything must sort above: the anchor's key when `after` is
/// given and resolvable, else the key of the greatest-id entity below
/// this one.
fn lower_bound(
    tx: &StoreTx<'_>,
    stream_id: &StreamId,
    entity: EntityId,
    after: Option<EntityId>,
) -> StoreResult<Option<String>> {
    if let Some(after) = after {
        let anchor = tx.query(&Statement::new(
            "SELECT id, sort_idx FROM entities WHERE id = ?1 AND stream_id = ?2",
            vec![after.to_string().into(), stream_id.as_str().into()],
        ))?;
        if let Some(row) = anchor.first() {
            return Ok(Some(
                row.text("sort_idx")
                    .unwrap_or_else(|| row.text("id").expect("selected column"))
                    .to_owned(),
            ));
        }
        // Anchor unknown in this stream; fall through to id order
    }

    let pred = tx.query(&Statement::new(
        "SELECT id, sort_idx FROM entities \
         WHERE stream_id = ?1 AND id < ?2 \
         ORDER BY id DESC LIMIT 1",
        vec![stream_id.as_str().into(), entity.to_string().into()],
    ))?;
    Ok(pred.first().map(|row| {
        row.text("sort_idx")
            .unwrap_or_else(|| row.text("id").expect("selected column"))
            .to_owned()
    }))
}

/// The key of the entity currently sorting right after the predecessor,
/// excluding the one being positioned. `None` (no successor, or a
/// successor that was never positioned) means unbounded.
fn upper_bound(
    tx: &StoreTx<'_>,
    stream_id: &StreamId,
    entity: EntityId,
    lower: Option<&str>,
) -> StoreResult<Option<String>> {
    let succ = match lower {
        Some(lower) => tx.query(&Statement::new(
            "SELECT sort_idx FROM entities \
             WHERE stream_id = ?1 AND id <> ?2 AND COALESCE(sort_idx, id) > ?3 \
             ORDER BY COALESCE(sort_idx, id), id LIMIT 1",
            vec![
                stream_id.as_str().into(),
                entity.to_string().into(),
                lower.into(),
            ],
        ))?,
        None => tx.query(&Statement::new(
            "SELECT sort_idx FROM entities \
             WHERE stream_id = ?1 AND id <> ?2 \
             ORDER BY COALESCE(sort_idx, id), id LIMIT 1",
            vec![stream_id.as_str().into(), entity.to_string().into()],
        ))?,
    };
    Ok(succ
        .first()
        .and_then(|row| row.text("sort_idx").map(str::to_owned)))
}
