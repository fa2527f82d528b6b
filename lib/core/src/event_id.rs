//! Monotonic, lexicographically-sortable per-run event IDs.
//!
//! Format: `{20-digit zero-padded microseconds-since-epoch}-{5-digit zero-padded sequence}`.
//! Fixed-width digits make lexicographic string ordering agree with numeric
//! ordering, satisfying "sorts both lexicographically and by arrival".
//!
//! IDs are assigned by a per-run [`EventIdGenerator`], never synthesized by
//! callers. A generator is owned exclusively by the run-store adapter
//! responsible for that run's append path.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const TIMESTAMP_WIDTH: usize = 20;
const SEQUENCE_WIDTH: usize = 5;
const MAX_SEQUENCE: u32 = 99_999;

/// A single event's monotonic identifier within its run.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(String);

impl EventId {
    fn new(timestamp_micros: u64, sequence: u32) -> Self {
        Self(format!(
            "{timestamp_micros:0width$}-{sequence:0swidth$}",
            width = TIMESTAMP_WIDTH,
            swidth = SEQUENCE_WIDTH,
        ))
    }

    /// Returns the ID's string form, as used on the wire (SSE `id:` field,
    /// `Last-Event-ID` header, JSON persistence).
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The literal `"0"` sentinel id used only by the synthetic `hello`
    /// SSE event, which is never persisted to the store and never
    /// produced by an [`EventIdGenerator`]. Sorts before every generator-
    /// assigned id, since those are all longer strings with the same
    /// leading digit.
    #[must_use]
    pub fn zero() -> Self {
        Self("0".to_string())
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Error returned when an `EventId` cannot be parsed from its wire form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseEventIdError(pub String);

impl fmt::Display for ParseEventIdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid event id: {}", self.0)
    }
}

impl std::error::Error for ParseEventIdError {}

impl FromStr for EventId {
    type Err = ParseEventIdError;

    /// Accepts both this generator's fixed-width
    /// `{20 digits}-{5 digits}` form and the Redis adapter's native stream
    /// entry ID form `{millis}-{sequence}`, which is also two dash-joined
    /// decimal runs but without fixed width. Both are numerically (and, in
    /// practice, lexicographically) increasing by construction; only the
    /// generator's own `next` calls need the fixed-width guarantee to hold
    /// across a comparison, which is true for all ids it ever produces.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "0" {
            return Ok(Self::zero());
        }
        let (ts, seq) = s
            .split_once('-')
            .ok_or_else(|| ParseEventIdError(s.to_string()))?;
        if ts.is_empty() || seq.is_empty() {
            return Err(ParseEventIdError(s.to_string()));
        }
        ts.parse::<u64>()
            .map_err(|_| ParseEventIdError(s.to_string()))?;
        seq.parse::<u32>()
            .map_err(|_| ParseEventIdError(s.to_string()))?;
        Ok(Self(s.to_string()))
    }
}

/// Per-run generator producing strictly increasing [`EventId`]s.
///
/// Each run owns exactly one generator (held behind the run's lock in the
/// in-memory adapter, or delegated to the Redis stream's native entry ID in
/// the Redis adapter). Clock regression is handled by advancing the
/// timestamp to `previous + 1` rather than reusing a stale wall-clock
/// reading, per the monotonicity invariant on [`EventId`].
#[derive(Debug, Clone, Copy, Default)]
pub struct EventIdGenerator {
    last_timestamp_micros: u64,
    last_sequence: u32,
}

impl EventIdGenerator {
    /// Creates a fresh generator with no prior-assigned ID.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Assigns the next ID given the current wall-clock reading in
    /// microseconds since the Unix epoch.
    ///
    /// If `now_micros` is not strictly greater than the last-assigned
    /// timestamp (same microsecond burst, or clock regression), the
    /// sequence is incremented instead, rolling over into
    /// `last_timestamp + 1` if the sequence space is exhausted.
    pub fn next(&mut self, now_micros: u64) -> EventId {
        if now_micros > self.last_timestamp_micros {
            self.last_timestamp_micros = now_micros;
            self.last_sequence = 0;
        } else if self.last_sequence >= MAX_SEQUENCE {
            self.last_timestamp_micros += 1;
            self.last_sequence = 0;
        } else {
            self.last_sequence += 1;
        }

        EventId::new(self.last_timestamp_micros, self.last_sequence)
    }
}
