pub mod event;
pub mod id;

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

pub use event::{Event, EventKind};
pub use id::{EntityId, StreamId, UserDid};

/// Milliseconds since the Unix epoch.
///
/// All times in the system are millisecond-precision: event ids carry a
/// millisecond prefix, Discord edit timestamps are milliseconds, and the
/// writer heartbeat compares millisecond ages.
#[cfg_attr(feature = "bincode", derive(::bincode::Encode, ::bincode::Decode))]
#[derive(
    Copy,
    Clone,
    Debug,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const ZERO: Self = Self(0);

    pub fn now() -> Self {
        Self(
            u64::try_from(
                SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .expect("Time went backwards")
                    .as_millis(),
            )
            .expect("Time overflow"),
        )
    }

    pub fn as_millis(self) -> u64 {
        self.0
    }

    /// Saturating difference in milliseconds; `0` when `other` is newer.
    pub fn millis_since(self, other: Timestamp) -> u64 {
        self.0.saturating_sub(other.0)
    }
}

impl From<u64> for Timestamp {
    fn from(millis: u64) -> Self {
        Self(millis)
    }
}

impl From<Timestamp> for u64 {
    fn from(ts: Timestamp) -> Self {
        ts.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// One entry of a stream as delivered by the transport.
///
/// `idx` is dense and 1-based within its stream; `payload` is the
/// CBOR-encoded [`Event`].
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct StreamEntry {
    pub idx: u64,
    pub user: UserDid,
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
}
