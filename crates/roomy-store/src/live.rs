//! Live query registry.
//!
//! A live query is a stored SELECT plus the set of tables it depends on
//! and a sink. Every completed write reports the tables it touched (via
//! the sqlite update hook); queries whose table set intersects the
//! touched set are re-run and their fresh rows pushed to the sink.
//!
//! The apply loop suspends notification delivery for the duration of a
//! batch; tables touched while suspended accumulate and are flushed in
//! one re-evaluation on resume.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use tokio::sync::mpsc;

use crate::value::{QueryResult, Statement};

pub(crate) struct LiveQuery {
    pub tables: HashSet<String>,
    pub stmt: Statement,
    pub sink: mpsc::UnboundedSender<QueryResult>,
}

#[derive(Default)]
pub(crate) struct LiveQueries {
    queries: Mutex<HashMap<String, LiveQuery>>,
    suspended: Mutex<usize>,
    pending_tables: Mutex<HashSet<String>>,
}

impl LiveQueries {
    pub fn register(&self, id: &str, query: LiveQuery) {
        self.queries
            .lock()
            .expect("Locking failed")
            .insert(id.to_owned(), query);
    }

    pub fn remove(&self, id: &str) -> bool {
        self.queries
            .lock()
            .expect("Locking failed")
            .remove(id)
            .is_some()
    }

    /// Suspensions nest; delivery resumes when every suspender resumed.
    pub fn suspend(&self) {
        *self.suspended.lock().expect("Locking failed") += 1;
    }

    /// Returns the tables accumulated while suspended once fully resumed.
    pub fn resume(&self) -> Option<HashSet<String>> {
        let mut suspended = self.suspended.lock().expect("Locking failed");
        *suspended = suspended.saturating_sub(1);
        if *suspended == 0 {
            let pending = std::mem::take(
                &mut *self.pending_tables.lock().expect("Locking failed"),
            );
            (!pending.is_empty()).then_some(pending)
        } else {
            None
        }
    }

    pub fn is_suspended(&self) -> bool {
        0 < *self.suspended.lock().expect("Locking failed")
    }

    pub fn defer(&self, tables: HashSet<String>) {
        self.pending_tables
            .lock()
            .expect("Locking failed")
            .extend(tables);
    }

    /// `(id, statement, sink)` of every query depending on any touched
    /// table. Dead sinks are dropped from the registry on the way.
    pub fn affected(
        &self,
        touched: &HashSet<String>,
    ) -> Vec<(String, Statement, mpsc::UnboundedSender<QueryResult>)> {
        let mut queries = self.queries.lock().expect("Locking failed");
        queries.retain(|_, query| !query.sink.is_closed());
        queries
            .iter()
            .filter(|(_, query)| !query.tables.is_disjoint(touched))
            .map(|(id, query)| (id.clone(), query.stmt.clone(), query.sink.clone()))
            .collect()
    }
}
