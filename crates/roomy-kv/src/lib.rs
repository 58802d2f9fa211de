//! Durable key/value store
//!
//! A single redb table keyed `(sublevel, key)` gives prefix-namespaced
//! sublevels with atomic multi-key batches across them and ordered
//! prefix-range iteration within them. Values are raw bytes; the
//! `*_json` accessors layer serde on top for record-shaped values
//! (cursors, fingerprints, edit markers).
//!
//! All access goes through `read_with`/`write_with` transaction helpers;
//! write transactions expose `on_commit` hooks that run only after the
//! data is durable.

use std::path::PathBuf;
use std::sync::Mutex;
use std::{ops, result};

use redb_bincode::{ReadTransaction, ReadableTable as _, WriteTransaction};
use snafu::{Location, ResultExt as _, Snafu};
use tokio::task::JoinError;
use tracing::debug;

const LOG_TARGET: &str = "roomy::kv";

#[macro_export]
macro_rules! def_table {
    ($(#[$outer:meta])*
        $name:ident : $k:ty => $v:ty) => {
        #[allow(unused)]
        $(#[$outer])*
        pub mod $name {
            use super::*;
            pub type Key = $k;
            pub type Value = $v;
            pub type Definition<'a> = redb_bincode::TableDefinition<'a, Key, Value>;
            pub trait ReadableTable: redb_bincode::ReadableTable<Key, Value> {}
            impl<RT> ReadableTable for RT where RT: redb_bincode::ReadableTable<Key, Value> {}
            pub type Table<'a> = redb_bincode::Table<'a, Key, Value>;
            pub const TABLE: Definition = redb_bincode::TableDefinition::new(stringify!($name));
        }
    };
}

def_table! {
    /// All KV data: `(sublevel, key) → value bytes`.
    ///
    /// Keeping every sublevel in one table is what makes cross-sublevel
    /// batches atomic: they are a single redb write transaction.
    kv: (String, String) => Vec<u8>
}

#[derive(Debug, Snafu)]
pub enum KvError {
    Database {
        source: redb::DatabaseError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(transparent)]
    Table {
        source: redb::TableError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(transparent)]
    Storage {
        source: redb::StorageError,
        #[snafu(implicit)]
        location: Location,
    },
    Transaction {
        #[snafu(source(from(redb::TransactionError, Box::new)))]
        source: Box<redb::TransactionError>,
        #[snafu(implicit)]
        location: Location,
    },
    Commit {
        source: redb::CommitError,
        #[snafu(implicit)]
        location: Location,
    },
    Join {
        source: JoinError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("Invalid json value under `{sublevel}/{key}`"))]
    Json {
        sublevel: String,
        key: String,
        source: serde_json::Error,
        #[snafu(implicit)]
        location: Location,
    },
}

pub type KvResult<T> = result::Result<T, KvError>;

/// One entry of an atomic multi-key batch.
#[derive(Debug, Clone)]
pub enum BatchOp {
    Put {
        sublevel: String,
        key: String,
        value: Vec<u8>,
    },
    Delete {
        sublevel: String,
        key: String,
    },
}

impl BatchOp {
    pub fn put(sublevel: impl Into<String>, key: impl Into<String>, value: Vec<u8>) -> Self {
        Self::Put {
            sublevel: sublevel.into(),
            key: key.into(),
            value,
        }
    }

    pub fn put_json<T: serde::Serialize>(
        sublevel: impl Into<String>,
        key: impl Into<String>,
        value: &T,
    ) -> Self {
        Self::Put {
            sublevel: sublevel.into(),
            key: key.into(),
            value: serde_json::to_vec(value).expect("Can't fail"),
        }
    }

    pub fn delete(sublevel: impl Into<String>, key: impl Into<String>) -> Self {
        Self::Delete {
            sublevel: sublevel.into(),
            key: key.into(),
        }
    }
}

pub struct WriteTransactionCtx {
    dbtx: WriteTransaction,
    on_commit: Mutex<Vec<Box<dyn FnOnce() + 'static>>>,
}

impl From<WriteTransaction> for WriteTransactionCtx {
    fn from(dbtx: WriteTransaction) -> Self {
        Self {
            dbtx,
            on_commit: Mutex::new(vec![]),
        }
    }
}

impl ops::Deref for WriteTransactionCtx {
    type Target = WriteTransaction;

    fn deref(&self) -> &Self::Target {
        &self.dbtx
    }
}

impl ops::DerefMut for WriteTransactionCtx {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.dbtx
    }
}

impl WriteTransactionCtx {
    pub fn on_commit(&self, f: impl FnOnce() + 'static) {
        self.on_commit
            .lock()
            .expect("Locking failed")
            .push(Box::new(f));
    }

    fn commit(self) -> result::Result<(), redb::CommitError> {
        let Self { dbtx, on_commit } = self;

        dbtx.commit()?;

        for hook in on_commit.lock().expect("Locking failed").drain(..) {
            hook();
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct KvStore {
    inner: redb_bincode::Database,
}

impl KvStore {
    pub async fn open(path: impl Into<PathBuf>) -> KvResult<KvStore> {
        let path = path.into();
        debug!(target: LOG_TARGET, path = %path.display(), "Opening kv store");

        let inner = tokio::task::spawn_blocking(move || redb::Database::create(path))
            .await
            .context(JoinSnafu)?
            .context(DatabaseSnafu)?;
        Self::open_inner(inner).await
    }

    pub async fn open_in_memory() -> KvResult<KvStore> {
        debug!(target: LOG_TARGET, "Opening in-memory kv store");
        let inner = redb::Database::builder()
            .create_with_backend(redb::backends::InMemoryBackend::new())
            .context(DatabaseSnafu)?;
        Self::open_inner(inner).await
    }

    async fn open_inner(inner: redb::Database) -> KvResult<KvStore> {
        let inner = redb_bincode::Database::from(inner);
        let store = Self { inner };
        // Make sure the table exists so first reads don't fail
        store.write_with(|tx| {
            tx.open_table(&kv::TABLE)?;
            Ok(())
        })
        .await?;
        Ok(store)
    }

    pub async fn write_with<T>(
        &self,
        f: impl FnOnce(&'_ WriteTransactionCtx) -> KvResult<T>,
    ) -> KvResult<T> {
        tokio::task::block_in_place(|| {
            let dbtx =
                WriteTransactionCtx::from(self.inner.begin_write().context(TransactionSnafu)?);
            let res = f(&dbtx)?;

            dbtx.commit().context(CommitSnafu)?;

            Ok(res)
        })
    }

    pub async fn read_with<T>(
        &self,
        f: impl FnOnce(&'_ ReadTransaction) -> KvResult<T>,
    ) -> KvResult<T> {
        tokio::task::block_in_place(|| {
            let dbtx = self.inner.begin_read().context(TransactionSnafu)?;
            f(&dbtx)
        })
    }

    pub async fn get(&self, sublevel: &str, key: &str) -> KvResult<Option<Vec<u8>>> {
        let composite = (sublevel.to_owned(), key.to_owned());
        self.read_with(|tx| {
            let table = tx.open_table(&kv::TABLE)?;
            Ok(table.get(&composite)?.map(|guard| guard.value()))
        })
        .await
    }

    pub async fn put(&self, sublevel: &str, key: &str, value: Vec<u8>) -> KvResult<()> {
        let composite = (sublevel.to_owned(), key.to_owned());
        self.write_with(|tx| {
            let mut table = tx.open_table(&kv::TABLE)?;
            table.insert(&composite, &value)?;
            Ok(())
        })
        .await
    }

    pub async fn delete(&self, sublevel: &str, key: &str) -> KvResult<()> {
        let composite = (sublevel.to_owned(), key.to_owned());
        self.write_with(|tx| {
            let mut table = tx.open_table(&kv::TABLE)?;
            table.remove(&composite)?;
            Ok(())
        })
        .await
    }

    pub async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        sublevel: &str,
        key: &str,
    ) -> KvResult<Option<T>> {
        let Some(bytes) = self.get(sublevel, key).await? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_slice(&bytes).context(JsonSnafu {
            sublevel,
            key,
        })?))
    }

    pub async fn put_json<T: serde::Serialize>(
        &self,
        sublevel: &str,
        key: &str,
        value: &T,
    ) -> KvResult<()> {
        self.put(
            sublevel,
            key,
            serde_json::to_vec(value).expect("Can't fail"),
        )
        .await
    }

    /// All `(key, value)` pairs of a sublevel whose key starts with
    /// `prefix`, in key order. Empty prefix iterates the whole sublevel.
    pub async fn iter_prefix(
        &self,
        sublevel: &str,
        prefix: &str,
    ) -> KvResult<Vec<(String, Vec<u8>)>> {
        let start = (sublevel.to_owned(), prefix.to_owned());
        let sublevel = sublevel.to_owned();
        let prefix = prefix.to_owned();
        self.read_with(|tx| {
            let table = tx.open_table(&kv::TABLE)?;
            let mut entries = Vec::new();
            for entry in table.range(start..)? {
                let (key_guard, value_guard) = entry?;
                let (entry_sublevel, entry_key) = key_guard.value();
                if entry_sublevel != sublevel || !entry_key.starts_with(&prefix) {
                    break;
                }
                entries.push((entry_key, value_guard.value()));
            }
            Ok(entries)
        })
        .await
    }

    /// Apply all operations in one redb write transaction.
    pub async fn batch(&self, ops: Vec<BatchOp>) -> KvResult<()> {
        self.write_with(|tx| {
            let mut table = tx.open_table(&kv::TABLE)?;
            for op in &ops {
                match op {
                    BatchOp::Put {
                        sublevel,
                        key,
                        value,
                    } => {
                        table.insert(&(sublevel.clone(), key.clone()), value)?;
                    }
                    BatchOp::Delete { sublevel, key } => {
                        table.remove(&(sublevel.clone(), key.clone()))?;
                    }
                }
            }
            Ok(())
        })
        .await
    }

    /// Remove every entry of a sublevel (schema-version wipe support).
    pub async fn clear_sublevel(&self, sublevel: &str) -> KvResult<usize> {
        let sublevel = sublevel.to_owned();
        self.write_with(|tx| {
            let mut table = tx.open_table(&kv::TABLE)?;
            let mut keys = Vec::new();
            for entry in table.range((sublevel.clone(), String::new())..)? {
                let (key_guard, _) = entry?;
                let (entry_sublevel, entry_key) = key_guard.value();
                if entry_sublevel != sublevel {
                    break;
                }
                keys.push((entry_sublevel, entry_key));
            }
            let removed = keys.len();
            for key in &keys {
                table.remove(key)?;
            }
            Ok(removed)
        })
        .await
    }
}

#[cfg(test)]
mod tests;
