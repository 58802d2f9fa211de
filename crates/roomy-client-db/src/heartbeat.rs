//! Writer heartbeat.
//!
//! One browsing context (process) at a time may apply batches. The
//! active writer holds the named query lock in-process and proves
//! liveness to *other* processes by refreshing a heartbeat record in the
//! durable KV every 5 seconds. A peer that cannot acquire the lock and
//! finds the heartbeat stale for longer than the lock timeout steals
//! writership by overwriting the record with its own id.

use std::sync::Arc;
use std::time::Duration;

use roomy_core::Timestamp;
use roomy_kv::{KvResult, KvStore};
use roomy_util::FmtCompact as _;
use tracing::{debug, info, warn};

use crate::LOG_TARGET;

pub const HEARTBEAT_SUBLEVEL: &str = "heartbeat";
pub const HEARTBEAT_KEY: &str = "writer";
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
/// A heartbeat older than this authorizes a steal.
pub const HEARTBEAT_STALE_AFTER: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct HeartbeatRecord {
    pub writer_id: String,
    pub at: Timestamp,
}

/// Claim writership if it is free or stale, then keep the heartbeat
/// fresh from a background task.
pub struct WriterHeartbeat {
    kv: Arc<KvStore>,
    writer_id: String,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl WriterHeartbeat {
    /// `Ok(None)` when another writer is alive.
    pub async fn try_claim(
        kv: Arc<KvStore>,
        writer_id: impl Into<String>,
    ) -> KvResult<Option<WriterHeartbeat>> {
        let writer_id = writer_id.into();
        let now = Timestamp::now();

        if let Some(existing) = kv
            .get_json::<HeartbeatRecord>(HEARTBEAT_SUBLEVEL, HEARTBEAT_KEY)
            .await?
        {
            let age = Duration::from_millis(now.millis_since(existing.at));
            if existing.writer_id != writer_id && age < HEARTBEAT_STALE_AFTER {
                debug!(
                    target: LOG_TARGET,
                    holder = %existing.writer_id,
                    age_ms = age.as_millis() as u64,
                    "Writer heartbeat fresh; not claiming"
                );
                return Ok(None);
            }
            if existing.writer_id != writer_id {
                info!(
                    target: LOG_TARGET,
                    stale_holder = %existing.writer_id,
                    claimant = %writer_id,
                    "Stealing writership from stale heartbeat"
                );
            }
        }

        kv.put_json(
            HEARTBEAT_SUBLEVEL,
            HEARTBEAT_KEY,
            &HeartbeatRecord {
                writer_id: writer_id.clone(),
                at: now,
            },
        )
        .await?;

        let mut heartbeat = WriterHeartbeat {
            kv,
            writer_id,
            task: None,
        };
        heartbeat.spawn_refresher();
        Ok(Some(heartbeat))
    }

    fn spawn_refresher(&mut self) {
        let kv = self.kv.clone();
        let writer_id = self.writer_id.clone();
        self.task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let record = HeartbeatRecord {
                    writer_id: writer_id.clone(),
                    at: Timestamp::now(),
                };
                if let Err(err) = kv
                    .put_json(HEARTBEAT_SUBLEVEL, HEARTBEAT_KEY, &record)
                    .await
                {
                    warn!(
                        target: LOG_TARGET,
                        err = %err.fmt_compact(),
                        "Failed to refresh writer heartbeat"
                    );
                }
            }
        }));
    }

    pub fn writer_id(&self) -> &str {
        &self.writer_id
    }
}

impl Drop for WriterHeartbeat {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
