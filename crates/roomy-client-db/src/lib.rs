//! Client database: the Stream Materializer.
//!
//! Ingests ordered, binary-encoded stream events and projects them into
//! the relational store as entities, components, and edges. Handles
//! partial loads (durable cursors), out-of-order dependencies (stash /
//! unstash), malformed events (skip + warn), schema migrations (version
//! wipe), and concurrent writers (query lock + heartbeat).
//!
//! One `Database` serves any number of streams; per-stream ordering
//! comes from the callers pushing windows in idx order and the channel
//! pipeline preserving FIFO within a class.

mod apply;
pub mod frac_index;
mod heartbeat;
mod materialize;
mod profile;
mod schema;
mod sort;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use roomy_core::{EntityId, StreamEntry, StreamId, UserDid};
use roomy_kv::KvStore;
use roomy_store::{Statement, Store};
use snafu::{Location, Snafu};
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info};

pub use crate::heartbeat::{
    HEARTBEAT_INTERVAL, HEARTBEAT_KEY, HEARTBEAT_STALE_AFTER, HEARTBEAT_SUBLEVEL,
    HeartbeatRecord, WriterHeartbeat,
};
pub use crate::materialize::{Bundle, SortSpec, user_entity_id};
pub use crate::profile::{NullProfileFetcher, Profile, ProfileFetcher};
pub use crate::schema::STREAM_SCHEMA_VERSION;
pub use roomy_util_pchan::Class;

pub(crate) const LOG_TARGET: &str = "roomy::db";

/// KV sublevel holding `stream_id → last applied idx`.
pub const CURSORS_SUBLEVEL: &str = "streamCursors";
/// KV sublevel holding database-wide metadata.
pub const META_SUBLEVEL: &str = "meta";
const SCHEMA_VERSION_KEY: &str = "schema_version";

const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Snafu)]
pub enum DbError {
    #[snafu(transparent)]
    Store {
        source: roomy_store::StoreError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(transparent)]
    Kv {
        source: roomy_kv::KvError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("Materializer pipeline is shut down"))]
    PipelineClosed,
}

pub type DbResult<T> = std::result::Result<T, DbError>;

/// Input to the materializer pipeline.
pub(crate) enum Batch {
    Events {
        batch_id: u64,
        stream_id: StreamId,
        entries: Vec<StreamEntry>,
        priority: Class,
    },
    Unstash {
        batch_id: u64,
        stream_id: StreamId,
        rows: Vec<StashedRow>,
    },
}

#[derive(Debug, Clone)]
pub(crate) struct StashedRow {
    pub idx: u64,
    pub user: UserDid,
    pub payload_json: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ApplyResult {
    Applied { event_id: EntityId, idx: u64 },
    Stashed { event_id: EntityId, idx: u64 },
    AlreadyApplied { idx: u64 },
    Error(ApplyResultError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApplyResultError {
    pub event_id: Option<EntityId>,
    pub idx: Option<u64>,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct ApplyReport {
    pub batch_id: u64,
    pub results: Vec<ApplyResult>,
}

impl ApplyReport {
    pub fn applied_count(&self) -> usize {
        self.results
            .iter()
            .filter(|r| matches!(r, ApplyResult::Applied { .. }))
            .count()
    }

    pub fn stashed_count(&self) -> usize {
        self.results
            .iter()
            .filter(|r| matches!(r, ApplyResult::Stashed { .. }))
            .count()
    }

    pub fn errors(&self) -> impl Iterator<Item = &ApplyResultError> {
        self.results.iter().filter_map(|r| match r {
            ApplyResult::Error(err) => Some(err),
            _ => None,
        })
    }
}

pub struct Database {
    store: Store,
    kv: Arc<KvStore>,
    pub(crate) profile_fetcher: Arc<dyn ProfileFetcher>,
    pub(crate) event_tx: roomy_util_pchan::Sender<Batch>,
    pub(crate) pending: Mutex<HashMap<u64, oneshot::Sender<ApplyReport>>>,
    pub(crate) reports_tx: broadcast::Sender<ApplyReport>,
    batch_counter: AtomicU64,
}

impl Database {
    /// Open over an existing store + KV, wiping stream-local caches when
    /// `schema_version` differs from what the KV remembers.
    pub async fn open(
        store: Store,
        kv: Arc<KvStore>,
        profile_fetcher: Arc<dyn ProfileFetcher>,
        schema_version: &str,
    ) -> DbResult<Arc<Database>> {
        let previous: Option<String> = kv.get_json(META_SUBLEVEL, SCHEMA_VERSION_KEY).await?;
        if previous.as_deref() != Some(schema_version) {
            if let Some(previous) = &previous {
                info!(
                    target: LOG_TARGET,
                    from = %previous,
                    to = %schema_version,
                    "Stream schema version changed; wiping local caches"
                );
            }
            schema::drop_all(&store).await?;
            kv.clear_sublevel(CURSORS_SUBLEVEL).await?;
            kv.put_json(META_SUBLEVEL, SCHEMA_VERSION_KEY, &schema_version)
                .await?;
        }
        schema::create(&store).await?;

        let (event_tx, event_rx) = roomy_util_pchan::channel(CHANNEL_CAPACITY);
        let (statement_tx, statement_rx) = roomy_util_pchan::channel(CHANNEL_CAPACITY);
        let (reports_tx, _) = broadcast::channel(64);

        let db = Arc::new(Self {
            store,
            kv,
            profile_fetcher,
            event_tx,
            pending: Mutex::new(HashMap::new()),
            reports_tx,
            batch_counter: AtomicU64::new(0),
        });

        tokio::spawn(apply::materialize_loop(
            db.clone(),
            event_rx,
            statement_tx,
        ));
        tokio::spawn(apply::apply_loop(db.clone(), statement_rx));

        debug!(target: LOG_TARGET, version = %schema_version, "Database opened");
        Ok(db)
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn kv(&self) -> &Arc<KvStore> {
        &self.kv
    }

    pub(crate) fn next_batch_id(&self) -> u64 {
        self.batch_counter.fetch_add(1, Ordering::Relaxed)
    }

    /// Push a window of stream entries through the pipeline and wait for
    /// its apply report.
    pub async fn ingest_events(
        &self,
        stream_id: StreamId,
        entries: Vec<StreamEntry>,
        priority: Class,
    ) -> DbResult<ApplyReport> {
        let batch_id = self.next_batch_id();
        let (report_tx, report_rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("Locking failed")
            .insert(batch_id, report_tx);

        let mut event_tx = self.event_tx.clone();
        let sent = event_tx
            .send(
                priority,
                Batch::Events {
                    batch_id,
                    stream_id,
                    entries,
                    priority,
                },
            )
            .await;
        if sent.is_err() {
            self.pending
                .lock()
                .expect("Locking failed")
                .remove(&batch_id);
            return Err(DbError::PipelineClosed);
        }

        report_rx.await.map_err(|_| DbError::PipelineClosed)
    }

    /// One live event from the transport, behind any in-flight backfill.
    pub async fn ingest_live(
        &self,
        stream_id: StreamId,
        entry: StreamEntry,
    ) -> DbResult<ApplyReport> {
        self.ingest_events(stream_id, vec![entry], Class::Background)
            .await
    }

    /// Every apply report, including unstash batches no caller waits on.
    pub fn subscribe_reports(&self) -> broadcast::Receiver<ApplyReport> {
        self.reports_tx.subscribe()
    }

    /// Last applied idx for a stream; 0 before any backfill.
    pub async fn cursor(&self, stream_id: &StreamId) -> DbResult<u64> {
        Ok(self
            .kv
            .get_json::<u64>(CURSORS_SUBLEVEL, stream_id.as_str())
            .await?
            .unwrap_or(0))
    }

    pub(crate) async fn advance_cursor(
        &self,
        stream_id: &StreamId,
        to: u64,
    ) -> DbResult<()> {
        let current = self.cursor(stream_id).await?;
        if current < to {
            self.kv
                .put_json(CURSORS_SUBLEVEL, stream_id.as_str(), &to)
                .await?;
        }
        Ok(())
    }
}

/// Read-side helpers consumed by the stream client, the bridge, and the
/// test suites.
impl Database {
    pub async fn entity_exists(&self, id: EntityId) -> DbResult<bool> {
        let result = self
            .store
            .query(&Statement::new(
                "SELECT 1 AS one FROM entities WHERE id = ?1",
                vec![id.to_string().into()],
            ))
            .await?;
        Ok(!result.is_empty())
    }

    pub async fn content_text(&self, id: EntityId) -> DbResult<Option<String>> {
        let result = self
            .store
            .query(&Statement::new(
                "SELECT text(data) AS data FROM comp_content WHERE entity = ?1",
                vec![id.to_string().into()],
            ))
            .await?;
        Ok(result
            .first()
            .and_then(|row| row.text("data").map(str::to_owned)))
    }

    pub async fn edge_count(
        &self,
        head: EntityId,
        tail: EntityId,
        label: &str,
    ) -> DbResult<usize> {
        let result = self
            .store
            .query(&Statement::new(
                "SELECT COUNT(*) AS n FROM edges \
                 WHERE head = ?1 AND tail = ?2 AND label = ?3",
                vec![
                    head.to_string().into(),
                    tail.to_string().into(),
                    label.into(),
                ],
            ))
            .await?;
        Ok(result
            .first()
            .and_then(|row| row.integer("n"))
            .unwrap_or(0) as usize)
    }

    /// `(applied, error)` of the events row at `(stream, idx)`.
    pub async fn event_status(
        &self,
        stream_id: &StreamId,
        idx: u64,
    ) -> DbResult<Option<(bool, Option<String>)>> {
        let result = self
            .store
            .query(&Statement::new(
                "SELECT applied, error FROM events WHERE stream_id = ?1 AND idx = ?2",
                vec![stream_id.as_str().into(), idx.into()],
            ))
            .await?;
        Ok(result.first().map(|row| {
            (
                row.integer("applied") == Some(1),
                row.text("error").map(str::to_owned),
            )
        }))
    }

    /// Entity ids of a stream in display order.
    pub async fn sorted_entities(&self, stream_id: &StreamId) -> DbResult<Vec<String>> {
        let result = self
            .store
            .query(&Statement::new(
                "SELECT id FROM entities WHERE stream_id = ?1 \
                 ORDER BY COALESCE(sort_idx, id), id",
                vec![stream_id.as_str().into()],
            ))
            .await?;
        Ok(result
            .rows
            .iter()
            .filter_map(|row| row.text("id").map(str::to_owned))
            .collect())
    }

    pub async fn sort_idx_of(&self, id: EntityId) -> DbResult<Option<String>> {
        let result = self
            .store
            .query(&Statement::new(
                "SELECT sort_idx FROM entities WHERE id = ?1",
                vec![id.to_string().into()],
            ))
            .await?;
        Ok(result
            .first()
            .and_then(|row| row.text("sort_idx").map(str::to_owned)))
    }

    /// Joined spaces from the personal stream's `comp_space` rows.
    pub async fn spaces(&self, include_hidden: bool) -> DbResult<Vec<SpaceRecord>> {
        let sql = if include_hidden {
            "SELECT space_id, hidden, backfilled_to FROM comp_space ORDER BY space_id"
        } else {
            "SELECT space_id, hidden, backfilled_to FROM comp_space \
             WHERE hidden = 0 ORDER BY space_id"
        };
        let result = self.store.query(&Statement::new(sql, vec![])).await?;
        Ok(result
            .rows
            .iter()
            .filter_map(|row| {
                Some(SpaceRecord {
                    space_id: row.text("space_id")?.parse().ok()?,
                    hidden: row.integer("hidden") == Some(1),
                    backfilled_to: row.integer("backfilled_to").unwrap_or(0) as u64,
                })
            })
            .collect())
    }

    pub async fn user_handle(
        &self,
        stream_id: &StreamId,
        did: &UserDid,
    ) -> DbResult<Option<String>> {
        let uid = user_entity_id(stream_id, did);
        let result = self
            .store
            .query(&Statement::new(
                "SELECT handle FROM comp_user WHERE entity = ?1",
                vec![uid.to_string().into()],
            ))
            .await?;
        Ok(result
            .first()
            .and_then(|row| row.text("handle").map(str::to_owned)))
    }

    /// Names of all user tables, for wipe verification.
    pub async fn table_names(&self) -> DbResult<Vec<String>> {
        let result = self
            .store
            .query(&Statement::new(
                "SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name",
                vec![],
            ))
            .await?;
        Ok(result
            .rows
            .iter()
            .filter_map(|row| row.text("name").map(str::to_owned))
            .collect())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpaceRecord {
    pub space_id: StreamId,
    pub hidden: bool,
    pub backfilled_to: u64,
}

#[cfg(test)]
mod tests;
