use std::cmp::Ordering as CmpOrdering;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;

/// Opaque identifier of a watched entity (an order id).
///
/// The hub sends ids as JSON numbers while REST paths and CLI arguments carry
/// strings; both normalise to the same textual form so `42` and `"42"` match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    /// Wraps an id, trimming surrounding whitespace.
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self(id.trim().to_string())
    }

    /// Extracts an id from a hub argument. Accepts non-empty strings and numbers.
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) if !s.trim().is_empty() => Some(Self::new(s.as_str())),
            Value::Number(n) => Some(Self(n.to_string())),
            _ => None,
        }
    }

    /// The normalised textual id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for EntityId {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<u64> for EntityId {
    fn from(value: u64) -> Self {
        Self(value.to_string())
    }
}

impl From<i64> for EntityId {
    fn from(value: i64) -> Self {
        Self(value.to_string())
    }
}

static NEXT_STAMP: AtomicU64 = AtomicU64::new(1);

/// The moment a fetch was *issued*.
///
/// Stamps come from a process-wide counter, so they are strictly ordered even
/// when two fetches start within the same clock tick. Comparison uses the
/// sequence only; `issued_at` is kept for logging.
#[derive(Debug, Clone, Copy)]
pub struct FetchStamp {
    seq: u64,
    issued_at: Instant,
}

impl FetchStamp {
    /// Issues a new stamp, newer than every stamp issued before it.
    pub fn issue() -> Self {
        Self {
            seq: NEXT_STAMP.fetch_add(1, Ordering::Relaxed),
            issued_at: Instant::now(),
        }
    }

    /// Position in the global issue order.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Clock time at issue.
    pub fn issued_at(&self) -> Instant {
        self.issued_at
    }

    /// True when `self` was issued after `other`.
    pub fn is_newer_than(&self, other: &FetchStamp) -> bool {
        self.seq > other.seq
    }
}

impl PartialEq for FetchStamp {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for FetchStamp {}

impl PartialOrd for FetchStamp {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for FetchStamp {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.seq.cmp(&other.seq)
    }
}
