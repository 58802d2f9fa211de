use core::fmt;
use std::str::FromStr;
use std::sync::Mutex;

use snafu::{ResultExt as _, Snafu};
use ulid::Ulid;

/// Identity of any materialized node: room, message, user, media.
///
/// A ULID: 48-bit millisecond timestamp followed by 80 bits of randomness,
/// rendered as 26 chars of Crockford base32. The canonical string form is
/// its natural sort key, so an entity id doubles as the send-order sort
/// key of the event that created it.
#[derive(
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(transparent)]
pub struct EntityId(Ulid);

/// Process-wide monotonicity: two ids generated in the same millisecond
/// still compare strictly increasing.
static LAST_ULID: Mutex<u128> = Mutex::new(0);

impl EntityId {
    pub fn now() -> Self {
        let fresh = Ulid::new();
        let mut last = LAST_ULID.lock().expect("Locking failed");
        let value = if fresh.0 <= *last {
            *last + 1
        } else {
            fresh.0
        };
        *last = value;
        Self(Ulid(value))
    }

    /// The stable attachment point for space-level components of a stream.
    ///
    /// Zero timestamp (sorts before every real event) with the random part
    /// derived from the stream DID, so re-materializing the same stream
    /// always lands space metadata on the same entity and two streams
    /// never collide.
    pub fn space_root(stream_id: &StreamId) -> Self {
        let digest = blake3::hash(stream_id.as_str().as_bytes());
        let mut random = [0u8; 16];
        random[6..16].copy_from_slice(&digest.as_bytes()[..10]);
        Self(Ulid::from_parts(0, u128::from_be_bytes(random)))
    }

    pub fn timestamp_ms(&self) -> u64 {
        self.0.timestamp_ms()
    }

    pub fn from_parts(timestamp_ms: u64, random: u128) -> Self {
        Self(Ulid::from_parts(timestamp_ms, random))
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Debug for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityId({})", self.0)
    }
}

#[derive(Debug, Snafu, Clone)]
pub enum EntityIdParseError {
    #[snafu(display("Not a valid ulid: {source}"))]
    InvalidUlid { source: ulid::DecodeError },
}

impl FromStr for EntityId {
    type Err = EntityIdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(
            Ulid::from_string(s).context(InvalidUlidSnafu)?,
        ))
    }
}

#[derive(Debug, Snafu, Clone, PartialEq, Eq)]
pub enum DidParseError {
    #[snafu(display("Empty DID"))]
    Empty,
    #[snafu(display("Missing `did:` prefix"))]
    MissingPrefix,
}

macro_rules! define_did_type {
    (
        $(#[$outer:meta])*
        struct $t:tt
    ) => {
        $(#[$outer])*
        #[derive(
            Clone,
            PartialEq,
            Eq,
            PartialOrd,
            Ord,
            Hash,
            serde::Serialize,
            serde::Deserialize,
        )]
        #[serde(transparent)]
        pub struct $t(String);

        impl $t {
            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_string(self) -> String {
                self.0
            }
        }

        impl fmt::Display for $t {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl fmt::Debug for $t {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($t), "({})"), self.0)
            }
        }

        impl FromStr for $t {
            type Err = DidParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                if s.is_empty() {
                    return Err(EmptySnafu.build());
                }
                if !s.starts_with("did:") {
                    return Err(MissingPrefixSnafu.build());
                }
                Ok(Self(s.to_owned()))
            }
        }
    };
}

define_did_type! {
    /// Identity of a stream: an opaque DID owned by the event server.
    ///
    /// The content of the string is never interpreted beyond equality and
    /// the `did:` prefix; the identity system is a collaborator.
    struct StreamId
}

define_did_type! {
    /// Identity of a user: an opaque DID.
    struct UserDid
}
