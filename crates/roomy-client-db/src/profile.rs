//! Profile enrichment.
//!
//! Before an event referencing a user is applied, the user's entity and
//! `comp_user` row must exist. The materializer loop collects referenced
//! DIDs per batch, filters out the already-materialized ones with one
//! query, and asks the backend for the rest. Fetched or not, the entity
//! is ensured; a later `updateProfile` event fills in whatever the
//! backend couldn't provide.

use std::collections::BTreeSet;

use async_trait::async_trait;
use itertools::Itertools as _;
use roomy_core::{StreamId, UserDid};
use roomy_store::{Statement, Store};
use roomy_util::{BoxedError, FmtCompact as _};
use tracing::warn;

use crate::materialize::{Bundle, ensure_user_statements};
use crate::LOG_TARGET;

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Profile {
    pub username: Option<String>,
    pub display_name: Option<String>,
    pub avatar: Option<String>,
}

/// Backend collaborator resolving a DID to profile info.
#[async_trait]
pub trait ProfileFetcher: Send + Sync {
    async fn get_profile(&self, did: &UserDid) -> Result<Option<Profile>, BoxedError>;
}

/// Fetcher for contexts with no backend (tests, offline tools): every
/// user materializes bare.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullProfileFetcher;

#[async_trait]
impl ProfileFetcher for NullProfileFetcher {
    async fn get_profile(&self, _did: &UserDid) -> Result<Option<Profile>, BoxedError> {
        Ok(None)
    }
}

/// Build the `ProfileEnsure` bundle for a batch's referenced users.
///
/// `cache` carries the DIDs already ensured earlier in this batch run so
/// duplicate fetches are skipped.
pub(crate) async fn profile_bundle(
    store: &Store,
    fetcher: &dyn ProfileFetcher,
    stream_id: &StreamId,
    needed: BTreeSet<UserDid>,
    cache: &mut BTreeSet<UserDid>,
) -> Option<Bundle> {
    let candidates: Vec<UserDid> = needed
        .into_iter()
        .filter(|did| !cache.contains(did))
        .collect();
    if candidates.is_empty() {
        return None;
    }

    // One query resolves which of the candidates are already present
    let placeholders = candidates.iter().map(|_| "?").join(", ");
    let stmt = Statement::new(
        format!("SELECT DISTINCT did FROM comp_user WHERE did IN ({placeholders})"),
        candidates
            .iter()
            .map(|did| did.as_str().into())
            .collect(),
    );
    let existing: BTreeSet<String> = match store.query(&stmt).await {
        Ok(result) => result
            .rows
            .iter()
            .filter_map(|row| row.text("did").map(str::to_owned))
            .collect(),
        Err(err) => {
            warn!(
                target: LOG_TARGET,
                err = %err.fmt_compact(),
                "Profile presence query failed; ensuring all candidates"
            );
            BTreeSet::new()
        }
    };

    let mut statements = Vec::new();
    let mut dids = Vec::new();
    for did in candidates {
        cache.insert(did.clone());
        if existing.contains(did.as_str()) {
            continue;
        }
        let profile = match fetcher.get_profile(&did).await {
            Ok(profile) => profile,
            Err(err) => {
                warn!(
                    target: LOG_TARGET,
                    user = %did,
                    err = %err.as_ref().fmt_compact(),
                    "Profile fetch failed; materializing bare user"
                );
                None
            }
        };
        statements.extend(ensure_user_statements(stream_id, &did, profile.as_ref()));
        dids.push(did);
    }

    if dids.is_empty() {
        return None;
    }
    Some(Bundle::ProfileEnsure { dids, statements })
}
