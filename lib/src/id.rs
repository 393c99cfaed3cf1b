use std::sync::Mutex;

use chrono::{DateTime, Utc};

/// A record identifier, assigned at insertion time.
///
/// Rendered as `<millis:013x>-<seq:016x>`: fixed-width lowercase hex of the
/// creation time in Unix milliseconds, then a 64-bit per-millisecond
/// sequence number. Lexicographic order of IDs therefore equals
/// chronological order at millisecond granularity, and up to 2^64 records
/// can share one timestamp.
pub type RecordId = String;

/// Generator of sortable [`RecordId`]s.
///
/// One generator per store; IDs from distinct generators are still
/// correctly ordered across processes as long as clocks agree to the
/// millisecond.
#[derive(Debug)]
pub struct IdGenerator {
    state: Mutex<(i64, u64)>,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self {
            state: Mutex::new((0, 0)),
        }
    }

    /// Assign the next ID for a record created at `now`.
    ///
    /// The clock is passed in rather than read here so that stores can
    /// stamp the record's `created` field and its ID from the same instant.
    pub fn next(&self, now: DateTime<Utc>) -> RecordId {
        let ms = now.timestamp_millis();
        let mut state = self.state.lock().expect("id generator mutex poisoned");
        if state.0 == ms {
            state.1 += 1;
        } else {
            // A clock step backwards must not break the ordering guarantee,
            // so never move the millis component backwards.
            state.0 = state.0.max(ms);
            state.1 = if state.0 == ms { 0 } else { state.1 + 1 };
        }
        format!("{:013x}-{:016x}", state.0, state.1)
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}
