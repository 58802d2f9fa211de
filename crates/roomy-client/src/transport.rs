//! The leaf transport collaborator.
//!
//! The event server itself is out of scope; this is the client-side
//! contract plus an in-memory implementation backing tests and the
//! bridge's loopback suites. Entries are dense and 1-based per stream;
//! `fetch_events(stream, offset, limit)` returns entries with
//! `offset < idx <= offset + limit`.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use roomy_core::{EntityId, StreamEntry, StreamId, UserDid};
use snafu::Snafu;
use tokio::sync::broadcast;

#[derive(Debug, Snafu, Clone)]
pub enum TransportError {
    #[snafu(display("Transport unavailable: {message}"))]
    Unavailable { message: String },
    #[snafu(display("Service token expired or rejected"))]
    IdentityExpired,
    #[snafu(display("Request rejected: {message}"))]
    Rejected { message: String },
}

pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// A live event pushed by the server for a subscribed stream.
#[derive(Debug, Clone)]
pub struct IncomingEvent {
    pub stream: StreamId,
    pub idx: u64,
    pub user: UserDid,
    pub payload: Vec<u8>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Present a short-lived service token (`aud = did:web:<host>`).
    async fn authenticate(&self, token: &str) -> TransportResult<()>;

    async fn create_stream_from_module_url(
        &self,
        ulid: EntityId,
        module_id: &str,
        module_url: &str,
        params: &serde_json::Value,
    ) -> TransportResult<StreamId>;

    async fn subscribe(&self, stream: &StreamId) -> TransportResult<()>;

    async fn unsubscribe(&self, stream: &StreamId) -> TransportResult<()>;

    async fn fetch_events(
        &self,
        stream: &StreamId,
        offset: u64,
        limit: u64,
    ) -> TransportResult<Vec<StreamEntry>>;

    /// Append one payload; returns the assigned idx.
    async fn send_event(&self, stream: &StreamId, payload: Vec<u8>) -> TransportResult<u64>;

    async fn send_events(
        &self,
        stream: &StreamId,
        payloads: Vec<Vec<u8>>,
    ) -> TransportResult<()>;

    /// Server-initiated events for all subscribed streams.
    fn incoming(&self) -> broadcast::Receiver<IncomingEvent>;
}

struct MemoryStream {
    entries: Vec<(UserDid, Vec<u8>)>,
}

/// In-process transport: per-stream append-only logs plus a broadcast of
/// live entries for subscribed streams.
pub struct MemoryTransport {
    streams: Mutex<HashMap<StreamId, MemoryStream>>,
    subscribed: Mutex<HashSet<StreamId>>,
    incoming_tx: broadcast::Sender<IncomingEvent>,
    local_user: UserDid,
    authenticated: Mutex<bool>,
}

impl MemoryTransport {
    pub fn new(local_user: UserDid) -> Self {
        let (incoming_tx, _) = broadcast::channel(1024);
        Self {
            streams: Mutex::new(HashMap::new()),
            subscribed: Mutex::new(HashSet::new()),
            incoming_tx,
            local_user,
            authenticated: Mutex::new(false),
        }
    }

    pub fn register_stream(&self, stream: StreamId) {
        self.streams
            .lock()
            .expect("Locking failed")
            .entry(stream)
            .or_insert_with(|| MemoryStream { entries: vec![] });
    }

    /// Append as another writer, delivering live to subscribers.
    pub fn push_external(&self, stream: &StreamId, user: UserDid, payload: Vec<u8>) -> u64 {
        let idx = {
            let mut streams = self.streams.lock().expect("Locking failed");
            let log = streams
                .entry(stream.clone())
                .or_insert_with(|| MemoryStream { entries: vec![] });
            log.entries.push((user.clone(), payload.clone()));
            log.entries.len() as u64
        };
        if self
            .subscribed
            .lock()
            .expect("Locking failed")
            .contains(stream)
        {
            let _ = self.incoming_tx.send(IncomingEvent {
                stream: stream.clone(),
                idx,
                user,
                payload,
            });
        }
        idx
    }

    pub fn entry_count(&self, stream: &StreamId) -> u64 {
        self.streams
            .lock()
            .expect("Locking failed")
            .get(stream)
            .map(|log| log.entries.len() as u64)
            .unwrap_or(0)
    }

    pub fn is_subscribed(&self, stream: &StreamId) -> bool {
        self.subscribed
            .lock()
            .expect("Locking failed")
            .contains(stream)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn authenticate(&self, token: &str) -> TransportResult<()> {
        if token.is_empty() {
            return Err(TransportError::IdentityExpired);
        }
        *self.authenticated.lock().expect("Locking failed") = true;
        Ok(())
    }

    async fn create_stream_from_module_url(
        &self,
        ulid: EntityId,
        _module_id: &str,
        _module_url: &str,
        _params: &serde_json::Value,
    ) -> TransportResult<StreamId> {
        let stream: StreamId = format!("did:memory:{ulid}")
            .parse()
            .expect("did prefix present");
        self.register_stream(stream.clone());
        Ok(stream)
    }

    async fn subscribe(&self, stream: &StreamId) -> TransportResult<()> {
        self.subscribed
            .lock()
            .expect("Locking failed")
            .insert(stream.clone());
        Ok(())
    }

    async fn unsubscribe(&self, stream: &StreamId) -> TransportResult<()> {
        self.subscribed
            .lock()
            .expect("Locking failed")
            .remove(stream);
        Ok(())
    }

    async fn fetch_events(
        &self,
        stream: &StreamId,
        offset: u64,
        limit: u64,
    ) -> TransportResult<Vec<StreamEntry>> {
        let streams = self.streams.lock().expect("Locking failed");
        let Some(log) = streams.get(stream) else {
            return Ok(vec![]);
        };
        Ok(log
            .entries
            .iter()
            .enumerate()
            .skip(offset as usize)
            .take(limit as usize)
            .map(|(at, (user, payload))| StreamEntry {
                idx: at as u64 + 1,
                user: user.clone(),
                payload: payload.clone(),
            })
            .collect())
    }

    async fn send_event(&self, stream: &StreamId, payload: Vec<u8>) -> TransportResult<u64> {
        Ok(self.push_external(stream, self.local_user.clone(), payload))
    }

    async fn send_events(
        &self,
        stream: &StreamId,
        payloads: Vec<Vec<u8>>,
    ) -> TransportResult<()> {
        for payload in payloads {
            self.push_external(stream, self.local_user.clone(), payload);
        }
        Ok(())
    }

    fn incoming(&self) -> broadcast::Receiver<IncomingEvent> {
        self.incoming_tx.subscribe()
    }
}
