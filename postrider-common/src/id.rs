//! Time-sortable message identifiers
//!
//! A [`QueueId`] is 24 lowercase hex characters: 12 for the millisecond
//! timestamp, 4 for an intra-millisecond counter, 8 for a random suffix.
//! Lexicographic order therefore equals creation order at millisecond
//! granularity, which lets range scans over ids double as time-range
//! scans.

use std::{
    fmt::{self, Display},
    str::FromStr,
    sync::Arc,
};

use parking_lot::Mutex;
use rand::Rng;

const TIME_HEX: usize = 12;
const COUNTER_HEX: usize = 4;
const RAND_HEX: usize = 8;
const ID_LEN: usize = TIME_HEX + COUNTER_HEX + RAND_HEX;

/// Identifier for a queued message
///
/// Serves as both the queue key and the blob filename stem. Two instances
/// sharing a store stay collision-free through the random suffix, which is
/// seeded per-generator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueueId(Arc<str>);

impl QueueId {
    /// Parse an id, validating length and hex alphabet
    ///
    /// Rejects anything that is not exactly 24 lowercase hex characters,
    /// which also rules out path traversal when ids are used as filenames.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        if raw.len() == ID_LEN && raw.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
        {
            Some(Self(Arc::from(raw)))
        } else {
            None
        }
    }

    /// Synthesize the lowest id for an instant
    ///
    /// Every id generated at or after `ms` sorts greater or equal, so this
    /// is usable as an exclusive scan boundary for time-based cleanup.
    #[must_use]
    pub fn for_timestamp(ms: u64) -> Self {
        Self(Arc::from(format!("{:012x}{:04x}{:08x}", ms & 0xffff_ffff_ffff, 0, 0).as_str()))
    }

    /// The millisecond timestamp encoded in this id
    #[must_use]
    pub fn timestamp_ms(&self) -> u64 {
        u64::from_str_radix(&self.0[..TIME_HEX], 16).unwrap_or_default()
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for QueueId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for QueueId {
    type Err = InvalidId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| InvalidId(s.to_string()))
    }
}

/// Error returned when parsing a malformed id
#[derive(Debug, thiserror::Error)]
#[error("Invalid queue id: {0}")]
pub struct InvalidId(String);

impl serde::Serialize for QueueId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for QueueId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = <String as serde::Deserialize>::deserialize(deserializer)?;
        Self::parse(&s).ok_or_else(|| serde::de::Error::custom(format!("invalid queue id: {s}")))
    }
}

/// Generator of monotonic [`QueueId`]s
///
/// The counter increments within a millisecond and resets when the clock
/// advances, so ids from one generator are strictly ordered even under
/// bursts. The random suffix keeps independent instances apart.
#[derive(Debug)]
pub struct IdGenerator {
    state: Mutex<GeneratorState>,
}

#[derive(Debug)]
struct GeneratorState {
    last_ms: u64,
    counter: u16,
}

impl IdGenerator {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GeneratorState {
                last_ms: 0,
                counter: 0,
            }),
        }
    }

    /// Generate the next id
    pub fn generate(&self) -> QueueId {
        let now = crate::now_ms();
        let mut state = self.state.lock();

        if now > state.last_ms {
            state.last_ms = now;
            state.counter = 0;
        } else {
            // Clock stalled or went backwards; keep counting within the
            // last observed millisecond so ordering holds.
            state.counter = state.counter.wrapping_add(1);
        }

        let suffix: u32 = rand::rng().random();
        QueueId(Arc::from(
            format!("{:012x}{:04x}{:08x}", state.last_ms & 0xffff_ffff_ffff, state.counter, suffix)
                .as_str(),
        ))
    }

    /// Intra-millisecond suffix, usable to disambiguate keys derived from
    /// the same wall-clock instant
    pub fn short(&self) -> String {
        let counter = {
            let mut state = self.state.lock();
            state.counter = state.counter.wrapping_add(1);
            state.counter
        };
        let suffix: u32 = rand::rng().random();
        format!("{counter:04x}{suffix:08x}")
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}
