//! Stream client.
//!
//! Connects the materializer to the event transport: authenticates with
//! a short-lived service token, subscribes streams, backfills them in
//! fixed-size windows from the durable cursor, funnels live events into
//! the same per-stream pipeline, and reconciles the set of open spaces
//! against a live query over the personal stream's `comp_space` rows.

pub mod transport;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable as _};
use roomy_client_db::{Class, Database};
use roomy_core::{Event, StreamEntry, StreamId};
use roomy_store::Statement;
use roomy_util::{BoxedError, FmtCompact as _};
use snafu::{IntoError as _, Location, ResultExt as _, Snafu};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub use crate::transport::{
    IncomingEvent, MemoryTransport, Transport, TransportError, TransportResult,
};

const LOG_TARGET: &str = "roomy::client";

/// Fixed backfill window size.
pub const BACKFILL_WINDOW: u64 = 2500;

const OPEN_SPACES_LIVE_QUERY: &str = "open-spaces";

#[derive(Debug, Snafu)]
pub enum ClientError {
    #[snafu(display("Transport failure"))]
    Transport {
        source: TransportError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(transparent)]
    Db {
        source: roomy_client_db::DbError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("Identity expired; re-authentication required"))]
    IdentityExpired,
    #[snafu(display("Token acquisition failed"))]
    TokenAcquisition {
        source: BoxedError,
        #[snafu(implicit)]
        location: Location,
    },
}

pub type ClientResult<T> = std::result::Result<T, ClientError>;

/// Identity collaborator issuing short-lived service tokens.
#[async_trait]
pub trait AuthTokenProvider: Send + Sync {
    async fn service_token(&self, aud: &str) -> Result<String, BoxedError>;
}

/// Fixed token, for tests and long-lived service credentials.
pub struct StaticTokenProvider(pub String);

#[async_trait]
impl AuthTokenProvider for StaticTokenProvider {
    async fn service_token(&self, _aud: &str) -> Result<String, BoxedError> {
        Ok(self.0.clone())
    }
}

pub struct Client {
    db: Arc<Database>,
    transport: Arc<dyn Transport>,
    auth: Arc<dyn AuthTokenProvider>,
    aud: String,
    open_streams: Mutex<HashMap<StreamId, JoinHandle<()>>>,
}

impl Client {
    /// Authenticate and return a connected handle. Token exchange and
    /// the transport handshake are retried with exponential backoff;
    /// a rejected token surfaces as [`ClientError::IdentityExpired`].
    pub async fn connect(
        db: Arc<Database>,
        transport: Arc<dyn Transport>,
        auth: Arc<dyn AuthTokenProvider>,
        aud: impl Into<String>,
    ) -> ClientResult<Arc<Client>> {
        let aud = aud.into();
        let client = Arc::new(Self {
            db,
            transport,
            auth,
            aud,
            open_streams: Mutex::new(HashMap::new()),
        });
        client.authenticate().await?;
        Ok(client)
    }

    pub async fn authenticate(&self) -> ClientResult<()> {
        let token = self
            .auth
            .service_token(&self.aud)
            .await
            .context(TokenAcquisitionSnafu)?;

        let attempt = || async {
            self.transport.authenticate(&token).await
        };
        attempt
            .retry(
                ExponentialBuilder::default()
                    .with_min_delay(Duration::from_millis(250))
                    .with_max_times(3),
            )
            .when(|err| !matches!(err, TransportError::IdentityExpired))
            .await
            .map_err(|err| match err {
                TransportError::IdentityExpired => ClientError::IdentityExpired,
                other => TransportSnafu.into_error(other),
            })?;
        info!(target: LOG_TARGET, aud = %self.aud, "Transport authenticated");
        Ok(())
    }

    pub fn db(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Subscribe a stream and keep it materialized: backfill from the
    /// durable cursor, then feed live events, re-backfilling whenever
    /// the live feed lags.
    pub async fn open_stream(self: &Arc<Self>, stream: StreamId) -> ClientResult<()> {
        {
            let open = self.open_streams.lock().expect("Locking failed");
            if open.contains_key(&stream) {
                return Ok(());
            }
        }

        // Subscribe before the backfill so no live event slips between
        self.transport
            .subscribe(&stream)
            .await
            .context(TransportSnafu)?;

        let task = {
            let client = self.clone();
            let stream = stream.clone();
            tokio::spawn(async move {
                client.run_stream(stream).await;
            })
        };
        let replaced = self
            .open_streams
            .lock()
            .expect("Locking failed")
            .insert(stream.clone(), task);
        debug_assert!(replaced.is_none());
        info!(target: LOG_TARGET, %stream, "Stream opened");
        Ok(())
    }

    pub async fn close_stream(&self, stream: &StreamId) -> ClientResult<()> {
        let task = self
            .open_streams
            .lock()
            .expect("Locking failed")
            .remove(stream);
        if let Some(task) = task {
            task.abort();
        }
        self.transport
            .unsubscribe(stream)
            .await
            .context(TransportSnafu)?;
        info!(target: LOG_TARGET, %stream, "Stream closed");
        Ok(())
    }

    pub fn open_stream_ids(&self) -> HashSet<StreamId> {
        self.open_streams
            .lock()
            .expect("Locking failed")
            .keys()
            .cloned()
            .collect()
    }

    async fn run_stream(self: Arc<Self>, stream: StreamId) {
        let mut incoming = self.transport.incoming();

        if let Err(err) = self.backfill(&stream).await {
            warn!(
                target: LOG_TARGET,
                %stream,
                err = %err.fmt_compact(),
                "Initial backfill failed; stream task exiting"
            );
            return;
        }

        loop {
            match incoming.recv().await {
                Ok(event) => {
                    if event.stream != stream {
                        continue;
                    }
                    let entry = StreamEntry {
                        idx: event.idx,
                        user: event.user,
                        payload: event.payload,
                    };
                    if let Err(err) = self.db.ingest_live(stream.clone(), entry).await {
                        warn!(
                            target: LOG_TARGET,
                            %stream,
                            idx = event.idx,
                            err = %err.fmt_compact(),
                            "Live event ingest failed"
                        );
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    // Dropped live events are re-fetched from the cursor
                    debug!(
                        target: LOG_TARGET,
                        %stream,
                        missed,
                        "Live feed lagged; re-backfilling"
                    );
                    if let Err(err) = self.backfill(&stream).await {
                        warn!(
                            target: LOG_TARGET,
                            %stream,
                            err = %err.fmt_compact(),
                            "Recovery backfill failed"
                        );
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    debug!(target: LOG_TARGET, %stream, "Transport incoming feed closed");
                    return;
                }
            }
        }
    }

    /// Fetch windows from `cursor + 1` until an empty window comes back.
    pub async fn backfill(&self, stream: &StreamId) -> ClientResult<u64> {
        let mut total = 0u64;
        loop {
            let cursor = self.db.cursor(stream).await?;
            let entries = self
                .transport
                .fetch_events(stream, cursor, BACKFILL_WINDOW)
                .await
                .context(TransportSnafu)?;
            if entries.is_empty() {
                break;
            }
            total += entries.len() as u64;
            self.db
                .ingest_events(stream.clone(), entries, Class::Background)
                .await?;
        }
        if 0 < total {
            debug!(target: LOG_TARGET, %stream, count = total, "Backfill window drained");
        }
        Ok(total)
    }

    /// Append one event to a stream.
    pub async fn send_event(&self, stream: &StreamId, event: &Event) -> ClientResult<u64> {
        self.transport
            .send_event(stream, event.encode())
            .await
            .context(TransportSnafu)
    }

    /// Run the open-spaces subscription manager until the live query is
    /// dropped: derive the wanted set from `comp_space WHERE hidden = 0`
    /// and reconcile subscriptions by set difference.
    pub fn spawn_space_manager(self: &Arc<Self>) -> ClientResult<JoinHandle<()>> {
        let (sink, mut updates) = tokio::sync::mpsc::unbounded_channel();
        let client = self.clone();

        let register = {
            let client = self.clone();
            async move {
                client
                    .db
                    .store()
                    .register_live_query(
                        OPEN_SPACES_LIVE_QUERY,
                        &["comp_space"],
                        Statement::new(
                            "SELECT space_id FROM comp_space WHERE hidden = 0 \
                             ORDER BY space_id",
                            vec![],
                        ),
                        sink,
                    )
                    .await
            }
        };

        let handle = tokio::spawn(async move {
            if let Err(err) = register.await {
                warn!(
                    target: LOG_TARGET,
                    err = %err.fmt_compact(),
                    "Open-spaces live query registration failed"
                );
                return;
            }
            // Only streams this manager opened are its to close; the
            // personal stream stays out of its hands.
            let mut managed: HashSet<StreamId> = HashSet::new();
            while let Some(result) = updates.recv().await {
                let wanted: HashSet<StreamId> = result
                    .rows
                    .iter()
                    .filter_map(|row| row.text("space_id")?.parse().ok())
                    .collect();
                client.reconcile_spaces(&mut managed, wanted).await;
            }
        });
        Ok(handle)
    }

    async fn reconcile_spaces(
        self: &Arc<Self>,
        managed: &mut HashSet<StreamId>,
        wanted: HashSet<StreamId>,
    ) {
        for stream in wanted.difference(managed).cloned().collect::<Vec<_>>() {
            match self.open_stream(stream.clone()).await {
                Ok(()) => {
                    managed.insert(stream);
                }
                Err(err) => {
                    warn!(
                        target: LOG_TARGET,
                        %stream,
                        err = %err.fmt_compact(),
                        "Failed to open space stream"
                    );
                }
            }
        }
        for stream in managed.difference(&wanted).cloned().collect::<Vec<_>>() {
            match self.close_stream(&stream).await {
                Ok(()) => {
                    managed.remove(&stream);
                }
                Err(err) => {
                    warn!(
                        target: LOG_TARGET,
                        %stream,
                        err = %err.fmt_compact(),
                        "Failed to close space stream"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests;
