//! Batch orchestration: the materialize loop and the apply loop.
//!
//! Two chained priority channels. `event_channel` carries raw
//! [`Batch`]es; the materialize loop decodes, enriches profiles, and
//! materializes them into [`StatementBatch`]es on `statement_channel`;
//! the apply loop applies those under savepoints and resolves the
//! callers' pending futures. Unstash batches re-enter `event_channel`
//! at priority class so they overtake ongoing backfill.

use std::collections::BTreeSet;
use std::sync::Arc;

use itertools::Itertools as _;
use roomy_core::event::EventKind;
use roomy_core::{EntityId, Event, StreamId, UserDid};
use roomy_store::{SqlValue, Statement, StoreResult, StoreTx};
use roomy_util::FmtCompact as _;
use roomy_util_pchan::Class;
use tracing::{debug, error, warn};

use crate::materialize::{Bundle, SortSpec, materialize, referenced_users};
use crate::profile::profile_bundle;
use crate::{
    ApplyReport, ApplyResult, ApplyResultError, Batch, Database, LOG_TARGET, StashedRow,
};

pub(crate) struct PreparedEvent {
    pub idx: u64,
    pub user: UserDid,
    pub payload_json: String,
    pub bundle: Bundle,
}

pub(crate) struct StatementBatch {
    pub batch_id: u64,
    pub stream_id: StreamId,
    pub profile: Option<Bundle>,
    pub events: Vec<PreparedEvent>,
    /// Greatest idx seen in the source window, including skipped events.
    /// `None` for unstash batches, which must not move cursors.
    pub max_idx: Option<u64>,
}

pub(crate) async fn materialize_loop(
    db: Arc<Database>,
    mut event_rx: roomy_util_pchan::Receiver<Batch>,
    mut statement_tx: roomy_util_pchan::Sender<StatementBatch>,
) {
    while let Some(batch) = event_rx.recv().await {
        let (class, prepared) = match batch {
            Batch::Events {
                batch_id,
                stream_id,
                entries,
                priority,
            } => (
                priority,
                prepare_entries(&db, batch_id, stream_id, entries).await,
            ),
            Batch::Unstash {
                batch_id,
                stream_id,
                rows,
            } => (
                Class::Priority,
                prepare_stashed(&db, batch_id, stream_id, rows).await,
            ),
        };
        if statement_tx.send(class, prepared).await.is_err() {
            break;
        }
    }
    statement_tx.finish();
}

async fn prepare_entries(
    db: &Database,
    batch_id: u64,
    stream_id: StreamId,
    entries: Vec<roomy_core::StreamEntry>,
) -> StatementBatch {
    let mut max_idx = None;
    let mut decoded: Vec<(u64, UserDid, Event)> = Vec::with_capacity(entries.len());

    for entry in entries {
        max_idx = Some(max_idx.map_or(entry.idx, |max: u64| max.max(entry.idx)));
        match Event::decode(&entry.payload) {
            Ok(event) => {
                if let EventKind::Unknown { ref kind } = event.kind {
                    warn!(
                        target: LOG_TARGET,
                        stream = %stream_id,
                        idx = entry.idx,
                        kind = %kind,
                        "Ignoring event of unknown kind"
                    );
                    continue;
                }
                decoded.push((entry.idx, entry.user, event));
            }
            Err(err) => {
                warn!(
                    target: LOG_TARGET,
                    stream = %stream_id,
                    idx = entry.idx,
                    err = %err.fmt_compact(),
                    "Skipping undecodable event"
                );
            }
        }
    }

    prepare_decoded(db, batch_id, stream_id, decoded, max_idx).await
}

async fn prepare_stashed(
    db: &Database,
    batch_id: u64,
    stream_id: StreamId,
    rows: Vec<StashedRow>,
) -> StatementBatch {
    let mut decoded = Vec::with_capacity(rows.len());
    for row in rows {
        match serde_json::from_str::<Event>(&row.payload_json) {
            Ok(event) => decoded.push((row.idx, row.user, event)),
            Err(err) => {
                // A stashed row we wrote ourselves should always parse
                error!(
                    target: LOG_TARGET,
                    stream = %stream_id,
                    idx = row.idx,
                    err = %err,
                    "Stashed event row is unreadable"
                );
            }
        }
    }
    prepare_decoded(db, batch_id, stream_id, decoded, None).await
}

async fn prepare_decoded(
    db: &Database,
    batch_id: u64,
    stream_id: StreamId,
    decoded: Vec<(u64, UserDid, Event)>,
    max_idx: Option<u64>,
) -> StatementBatch {
    let mut cache = BTreeSet::new();
    let needed: BTreeSet<UserDid> = decoded
        .iter()
        .flat_map(|(_, user, event)| referenced_users(event, user))
        .collect();
    let profile = profile_bundle(
        db.store(),
        db.profile_fetcher.as_ref(),
        &stream_id,
        needed,
        &mut cache,
    )
    .await;

    let events = decoded
        .into_iter()
        .map(|(idx, user, event)| PreparedEvent {
            payload_json: serde_json::to_string(&event).expect("Can't fail"),
            bundle: materialize(&event, &stream_id, &user, idx),
            idx,
            user,
        })
        .collect();

    StatementBatch {
        batch_id,
        stream_id,
        profile,
        events,
        max_idx,
    }
}

pub(crate) async fn apply_loop(
    db: Arc<Database>,
    mut statement_rx: roomy_util_pchan::Receiver<StatementBatch>,
) {
    while let Some(batch) = statement_rx.recv().await {
        let batch_id = batch.batch_id;
        let report = match apply_batch(&db, batch).await {
            Ok(report) => report,
            Err(err) => {
                error!(
                    target: LOG_TARGET,
                    batch_id,
                    err = %err.fmt_compact(),
                    "Batch apply failed"
                );
                ApplyReport {
                    batch_id,
                    results: vec![ApplyResult::Error(ApplyResultError {
                        event_id: None,
                        idx: None,
                        message: err.to_string(),
                    })],
                }
            }
        };

        let waiter = db
            .pending
            .lock()
            .expect("Locking failed")
            .remove(&batch_id);
        if let Some(waiter) = waiter {
            let _ = waiter.send(report.clone());
        }
        let _ = db.reports_tx.send(report);
    }
}

async fn apply_batch(db: &Database, batch: StatementBatch) -> StoreResult<ApplyReport> {
    let batch_id = batch.batch_id;
    let stream_id = batch.stream_id.clone();

    // Live queries must not observe (or re-run on) half-applied batches
    db.store().suspend_notifications();
    let outcome = db
        .store()
        .with_write(|tx| {
            tx.savepoint(&format!("batch{batch_id}"), |tx| {
                let mut results = Vec::new();
                let mut newly_applied: Vec<EntityId> = Vec::new();

                if let Some(Bundle::ProfileEnsure { dids, statements }) = &batch.profile {
                    let ensured = tx.savepoint(&format!("profiles{batch_id}"), |tx| {
                        for statement in statements {
                            tx.execute(statement)?;
                        }
                        Ok(())
                    });
                    if let Err(err) = ensured {
                        results.push(ApplyResult::Error(ApplyResultError {
                            event_id: None,
                            idx: None,
                            message: format!(
                                "profile ensure for {} users failed: {err}",
                                dids.len()
                            ),
                        }));
                    }
                }

                for prepared in &batch.events {
                    apply_event(tx, &batch.stream_id, prepared, &mut results, &mut newly_applied)?;
                }

                if let Some(max_idx) = batch.max_idx {
                    // Monotone by construction: MAX against the stored value
                    tx.execute(&Statement::new(
                        "UPDATE comp_space SET backfilled_to = MAX(backfilled_to, ?2) \
                         WHERE space_id = ?1",
                        vec![batch.stream_id.as_str().into(), max_idx.into()],
                    ))?;
                }

                Ok((results, newly_applied))
            })
        })
        .await;
    db.store().resume_notifications().await;
    let (results, newly_applied) = outcome?;

    if let Some(max_idx) = batch.max_idx {
        if let Err(err) = db.advance_cursor(&stream_id, max_idx).await {
            warn!(
                target: LOG_TARGET,
                stream = %stream_id,
                err = %err.fmt_compact(),
                "Failed to advance stream cursor"
            );
        }
    }

    if !newly_applied.is_empty() {
        schedule_unstash(db, newly_applied).await;
    }

    Ok(ApplyReport { batch_id, results })
}

fn apply_event(
    tx: &StoreTx<'_>,
    stream_id: &StreamId,
    prepared: &PreparedEvent,
    results: &mut Vec<ApplyResult>,
    newly_applied: &mut Vec<EntityId>,
) -> StoreResult<()> {
    let (event_id, statements, depends_on, sort) = match &prepared.bundle {
        Bundle::Success {
            event_id,
            statements,
            depends_on,
            sort,
            ..
        } => (*event_id, statements, depends_on, sort),
        Bundle::Error { event_id, message } => {
            // Materialize errors are final: no events row, cursor advances
            results.push(ApplyResult::Error(ApplyResultError {
                event_id: Some(*event_id),
                idx: Some(prepared.idx),
                message: message.clone(),
            }));
            return Ok(());
        }
        Bundle::ProfileEnsure { .. } => return Ok(()),
    };

    // Re-ingest of an already-applied idx is a no-op
    let existing = tx.query(&Statement::new(
        "SELECT applied FROM events WHERE stream_id = ?1 AND idx = ?2",
        vec![stream_id.as_str().into(), prepared.idx.into()],
    ))?;
    if existing
        .first()
        .and_then(|row| row.integer("applied"))
        == Some(1)
    {
        results.push(ApplyResult::AlreadyApplied { idx: prepared.idx });
        return Ok(());
    }

    let mut deps_ok = true;
    for dep in depends_on {
        if !dependency_satisfied(tx, dep)? {
            deps_ok = false;
            break;
        }
    }

    let depends_json: SqlValue = if depends_on.is_empty() {
        SqlValue::Null
    } else {
        serde_json::to_string(
            &depends_on.iter().map(EntityId::to_string).collect::<Vec<_>>(),
        )
        .expect("Can't fail")
        .into()
    };

    if !deps_ok {
        tx.execute(&Statement::new(
            "INSERT INTO events \
                 (stream_id, idx, user, entity_ulid, payload_json, applied, depends_on) \
             VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6) \
             ON CONFLICT(stream_id, idx) DO NOTHING",
            vec![
                stream_id.as_str().into(),
                prepared.idx.into(),
                prepared.user.as_str().into(),
                event_id.to_string().into(),
                prepared.payload_json.as_str().into(),
                depends_json,
            ],
        ))?;
        debug!(
            target: LOG_TARGET,
            stream = %stream_id,
            idx = prepared.idx,
            event_id = %event_id,
            "Stashed event pending dependencies"
        );
        results.push(ApplyResult::Stashed {
            event_id,
            idx: prepared.idx,
        });
        return Ok(());
    }

    let bundle_outcome = tx.savepoint(&format!("bundle{}", prepared.idx), |tx| {
        for statement in statements {
            tx.execute(statement)?;
        }
        Ok(())
    });
    let error_message = bundle_outcome.as_ref().err().map(ToString::to_string);

    tx.execute(&Statement::new(
        "INSERT INTO events \
             (stream_id, idx, user, entity_ulid, payload_json, applied, depends_on, error) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
         ON CONFLICT(stream_id, idx) DO UPDATE SET \
             applied = excluded.applied, \
             error = excluded.error",
        vec![
            stream_id.as_str().into(),
            prepared.idx.into(),
            prepared.user.as_str().into(),
            event_id.to_string().into(),
            prepared.payload_json.as_str().into(),
            error_message.is_none().into(),
            depends_json,
            error_message.clone().into(),
        ],
    ))?;

    match error_message {
        None => {
            if let Some(sort) = sort {
                position_within_savepoint(tx, stream_id, sort, prepared.idx);
            }
            newly_applied.push(event_id);
            results.push(ApplyResult::Applied {
                event_id,
                idx: prepared.idx,
            });
        }
        Some(message) => {
            results.push(ApplyResult::Error(ApplyResultError {
                event_id: Some(event_id),
                idx: Some(prepared.idx),
                message,
            }));
        }
    }
    Ok(())
}

/// Sort positioning is best-effort: a failure is logged and the event
/// stays applied.
fn position_within_savepoint(
    tx: &StoreTx<'_>,
    stream_id: &StreamId,
    sort: &SortSpec,
    idx: u64,
) {
    let outcome = tx.savepoint(&format!("sort{idx}"), |tx| {
        crate::sort::position_entity(tx, stream_id, sort)
    });
    if let Err(err) = outcome {
        warn!(
            target: LOG_TARGET,
            stream = %stream_id,
            entity = %sort.entity,
            err = %err.fmt_compact(),
            "Sort positioning failed"
        );
    }
}

fn dependency_satisfied(tx: &StoreTx<'_>, dep: &EntityId) -> StoreResult<bool> {
    let result = tx.query(&Statement::new(
        "SELECT (EXISTS(SELECT 1 FROM events WHERE entity_ulid = ?1 AND applied = 1) \
              OR EXISTS(SELECT 1 FROM entities WHERE id = ?1)) AS ok",
        vec![dep.to_string().into()],
    ))?;
    Ok(result.first().and_then(|row| row.integer("ok")) == Some(1))
}

/// Scan the stash for events unblocked by the just-applied entities and
/// feed them back as priority batches.
///
/// The send happens from a detached task: the apply loop must keep
/// draining `statement_channel` or a full `event_channel` would deadlock
/// the pipeline.
async fn schedule_unstash(db: &Database, newly_applied: Vec<EntityId>) {
    let clauses = newly_applied
        .iter()
        .map(|_| "depends_on LIKE ?")
        .join(" OR ");
    let stmt = Statement::new(
        format!(
            "SELECT stream_id, idx, user, payload_json FROM events \
             WHERE applied = 0 AND depends_on IS NOT NULL AND ({clauses}) \
             ORDER BY stream_id, idx"
        ),
        newly_applied
            .iter()
            .map(|id| format!("%{id}%").into())
            .collect(),
    );

    let rows = match db.store().query(&stmt).await {
        Ok(result) => result,
        Err(err) => {
            warn!(
                target: LOG_TARGET,
                err = %err.fmt_compact(),
                "Unstash scan failed"
            );
            return;
        }
    };
    if rows.is_empty() {
        return;
    }

    let mut by_stream: std::collections::BTreeMap<String, Vec<StashedRow>> = Default::default();
    for row in &rows.rows {
        let (Some(stream), Some(idx), Some(user), Some(payload_json)) = (
            row.text("stream_id"),
            row.integer("idx"),
            row.text("user"),
            row.text("payload_json"),
        ) else {
            continue;
        };
        let Ok(user) = user.parse::<UserDid>() else {
            continue;
        };
        by_stream.entry(stream.to_owned()).or_default().push(StashedRow {
            idx: idx as u64,
            user,
            payload_json: payload_json.to_owned(),
        });
    }

    for (stream, rows) in by_stream {
        let Ok(stream_id) = stream.parse::<StreamId>() else {
            continue;
        };
        let batch_id = db.next_batch_id();
        let mut event_tx = db.event_tx.clone();
        debug!(
            target: LOG_TARGET,
            stream = %stream_id,
            count = rows.len(),
            "Scheduling unstash batch"
        );
        tokio::spawn(async move {
            let _ = event_tx
                .send(
                    Class::Priority,
                    Batch::Unstash {
                        batch_id,
                        stream_id,
                        rows,
                    },
                )
                .await;
        });
    }
}
