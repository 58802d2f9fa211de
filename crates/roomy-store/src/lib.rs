//! Relational store binding.
//!
//! Wraps an embedded sqlite connection with the operations the
//! materializer consumes: plain execute with a prepared-statement cache,
//! nested savepoints, user-defined functions, and live queries that
//! re-run whenever a write touches one of their tables.
//!
//! One connection, one process-wide writer: every write path funnels
//! through the named `"roomy-query-lock"` advisory lock. Without that
//! serialization, nested savepoints of concurrent callers interleave and
//! corrupt the apply state.

pub mod dmp;
mod live;
mod udf;
mod value;

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};

use live::{LiveQueries, LiveQuery};
use roomy_util_lock::LockManager;
use rusqlite::Connection;
use snafu::{Location, ResultExt as _, Snafu};
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub use crate::value::{QueryResult, Row, SqlValue, Statement};

const LOG_TARGET: &str = "roomy::store";

/// Name of the advisory lock serializing all writers of one store.
pub const QUERY_LOCK: &str = "roomy-query-lock";

#[derive(Debug, Snafu)]
pub enum StoreError {
    #[snafu(display("Sqlite failure"))]
    Sqlite {
        source: rusqlite::Error,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("Invalid savepoint name `{name}`"))]
    SavepointName {
        name: String,
        #[snafu(implicit)]
        location: Location,
    },
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
    live: Arc<LiveQueries>,
    touched: Arc<Mutex<HashSet<String>>>,
    locks: LockManager,
}

impl Store {
    pub fn open(path: impl AsRef<Path>, locks: LockManager) -> StoreResult<Store> {
        let path = path.as_ref();
        debug!(target: LOG_TARGET, path = %path.display(), "Opening store");
        let conn = Connection::open(path).context(SqliteSnafu)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")
            .context(SqliteSnafu)?;
        Self::open_inner(conn, locks)
    }

    pub fn open_in_memory(locks: LockManager) -> StoreResult<Store> {
        debug!(target: LOG_TARGET, "Opening in-memory store");
        let conn = Connection::open_in_memory().context(SqliteSnafu)?;
        Self::open_inner(conn, locks)
    }

    fn open_inner(conn: Connection, locks: LockManager) -> StoreResult<Store> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .context(SqliteSnafu)?;
        conn.set_prepared_statement_cache_capacity(64);
        udf::register_builtin(&conn).context(SqliteSnafu)?;

        let touched: Arc<Mutex<HashSet<String>>> = Arc::default();
        {
            let touched = touched.clone();
            conn.update_hook(Some(
                move |_action, _db: &str, table: &str, _rowid: i64| {
                    touched
                        .lock()
                        .expect("Locking failed")
                        .insert(table.to_owned());
                },
            ));
        }

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            live: Arc::default(),
            touched,
            locks,
        })
    }

    pub fn lock_manager(&self) -> &LockManager {
        &self.locks
    }

    /// Read-only statement; takes no lock and triggers no notifications.
    pub async fn query(&self, stmt: &Statement) -> StoreResult<QueryResult> {
        tokio::task::block_in_place(|| {
            let conn = self.conn.lock().expect("Locking failed");
            run_statement(&conn, stmt)
        })
    }

    /// One write statement under the query lock.
    pub async fn execute(&self, stmt: &Statement) -> StoreResult<QueryResult> {
        let guard = self.locks.lock(QUERY_LOCK).await;
        let res = tokio::task::block_in_place(|| {
            let conn = self.conn.lock().expect("Locking failed");
            run_statement(&conn, stmt)
        });
        drop(guard);
        self.deliver_notifications().await;
        res
    }

    /// A multi-statement write under the query lock. `f` runs with the
    /// connection held; use [`StoreTx::savepoint`] inside for atomic
    /// scopes.
    pub async fn with_write<T>(
        &self,
        f: impl FnOnce(&StoreTx<'_>) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let guard = self.locks.lock(QUERY_LOCK).await;
        let res = tokio::task::block_in_place(|| {
            let conn = self.conn.lock().expect("Locking failed");
            let tx = StoreTx { conn: &conn };
            f(&tx)
        });
        drop(guard);
        self.deliver_notifications().await;
        res
    }

    /// Register a caller-provided scalar UDF.
    pub fn register_udf(
        &self,
        name: &str,
        arity: usize,
        f: impl Fn(&[SqlValue]) -> Result<SqlValue, roomy_util::BoxedError>
        + Send
        + Sync
        + std::panic::UnwindSafe
        + 'static,
    ) -> StoreResult<()> {
        let conn = self.conn.lock().expect("Locking failed");
        udf::register_custom(&conn, name, arity, f).context(SqliteSnafu)
    }

    /// Register a live query and push its initial result to `sink`.
    pub async fn register_live_query(
        &self,
        id: &str,
        tables: &[&str],
        stmt: Statement,
        sink: mpsc::UnboundedSender<QueryResult>,
    ) -> StoreResult<()> {
        let initial = self.query(&stmt).await?;
        let _ = sink.send(initial);
        self.live.register(
            id,
            LiveQuery {
                tables: tables.iter().map(|t| (*t).to_owned()).collect(),
                stmt,
                sink,
            },
        );
        Ok(())
    }

    pub fn remove_live_query(&self, id: &str) -> bool {
        self.live.remove(id)
    }

    /// Stop delivering live-query updates; touched tables accumulate.
    pub fn suspend_notifications(&self) {
        self.live.suspend();
    }

    /// Re-enable delivery, flushing everything touched while suspended.
    pub async fn resume_notifications(&self) {
        if let Some(pending) = self.live.resume() {
            self.run_affected(&pending).await;
        }
    }

    async fn deliver_notifications(&self) {
        let touched = std::mem::take(&mut *self.touched.lock().expect("Locking failed"));
        if touched.is_empty() {
            return;
        }
        if self.live.is_suspended() {
            self.live.defer(touched);
            return;
        }
        self.run_affected(&touched).await;
    }

    async fn run_affected(&self, touched: &HashSet<String>) {
        for (id, stmt, sink) in self.live.affected(touched) {
            match self.query(&stmt).await {
                Ok(result) => {
                    let _ = sink.send(result);
                }
                Err(err) => {
                    warn!(
                        target: LOG_TARGET,
                        live_query = %id,
                        err = %err,
                        "Live query re-run failed"
                    );
                }
            }
        }
    }
}

/// Access to the connection inside [`Store::with_write`].
pub struct StoreTx<'a> {
    conn: &'a Connection,
}

impl StoreTx<'_> {
    pub fn execute(&self, stmt: &Statement) -> StoreResult<QueryResult> {
        run_statement(self.conn, stmt)
    }

    pub fn query(&self, stmt: &Statement) -> StoreResult<QueryResult> {
        run_statement(self.conn, stmt)
    }

    /// Run `f` inside a named savepoint: released on success, rolled
    /// back (and released) when `f` errors. Savepoints nest.
    pub fn savepoint<T>(
        &self,
        name: &str,
        f: impl FnOnce(&Self) -> StoreResult<T>,
    ) -> StoreResult<T> {
        if name.is_empty()
            || !name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return SavepointNameSnafu { name }.fail();
        }

        self.conn
            .execute_batch(&format!("SAVEPOINT {name};"))
            .context(SqliteSnafu)?;
        match f(self) {
            Ok(value) => {
                self.conn
                    .execute_batch(&format!("RELEASE SAVEPOINT {name};"))
                    .context(SqliteSnafu)?;
                Ok(value)
            }
            Err(err) => {
                // Roll back this scope only, then drop the savepoint so
                // the outer scope can keep going.
                self.conn
                    .execute_batch(&format!(
                        "ROLLBACK TO SAVEPOINT {name}; RELEASE SAVEPOINT {name};"
                    ))
                    .context(SqliteSnafu)?;
                Err(err)
            }
        }
    }
}

fn run_statement(conn: &Connection, stmt: &Statement) -> StoreResult<QueryResult> {
    let mut prepared = conn.prepare_cached(&stmt.sql).context(SqliteSnafu)?;
    let column_names: Vec<String> = prepared
        .column_names()
        .into_iter()
        .map(str::to_owned)
        .collect();

    if column_names.is_empty() {
        let rows_affected = prepared
            .execute(rusqlite::params_from_iter(stmt.params.iter()))
            .context(SqliteSnafu)?;
        Ok(QueryResult {
            rows: vec![],
            rows_affected,
        })
    } else {
        let columns = Arc::new(column_names);
        let mut rows = prepared
            .query(rusqlite::params_from_iter(stmt.params.iter()))
            .context(SqliteSnafu)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().context(SqliteSnafu)? {
            let mut values = Vec::with_capacity(columns.len());
            for at in 0..columns.len() {
                values.push(SqlValue::from(
                    row.get::<_, rusqlite::types::Value>(at).context(SqliteSnafu)?,
                ));
            }
            out.push(Row::new(columns.clone(), values));
        }
        Ok(QueryResult {
            rows: out,
            rows_affected: 0,
        })
    }
}

#[cfg(test)]
mod tests;
