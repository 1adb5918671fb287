//! Admission filter: rejects events that are too old, dated in the future, or undated.

use crate::config::IngestConfig;

/// Epoch values below this are treated as seconds (10^11 ms is March 1973).
const SECONDS_MAGNITUDE_LIMIT: i64 = 100_000_000_000;
/// Epoch values at or above this are microseconds (10^14 ms is the year 5138).
const MICROS_MAGNITUDE_LIMIT: i64 = 100_000_000_000_000;
/// Epoch values at or above this are nanoseconds.
const NANOS_MAGNITUDE_LIMIT: i64 = 100_000_000_000_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admit,
    /// Older than the staleness budget (e.g. a backlog flushed on reconnect).
    RejectStale { age_ms: i64 },
    /// Dated further ahead of now than the skew tolerance.
    RejectFuture { ahead_ms: i64 },
    /// No creation time could be parsed.
    RejectUnknown,
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Self::Admit)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Admit => "admit",
            Self::RejectStale { .. } => "stale",
            Self::RejectFuture { .. } => "future",
            Self::RejectUnknown => "unknown_time",
        }
    }
}

/// Staleness budget and skew tolerance, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionPolicy {
    pub max_age_ms: i64,
    pub future_tolerance_ms: i64,
}

impl AdmissionPolicy {
    pub fn from_config(config: &IngestConfig) -> Self {
        Self {
            max_age_ms: secs_to_ms(config.max_event_age_secs),
            future_tolerance_ms: secs_to_ms(config.future_tolerance_secs),
        }
    }

    pub fn admit(&self, occurred_at_ms: Option<i64>, now_ms: i64) -> Admission {
        admit(occurred_at_ms, now_ms, self)
    }
}

impl Default for AdmissionPolicy {
    fn default() -> Self {
        Self::from_config(&IngestConfig::default())
    }
}

/// Decide whether an event created at `occurred_at_ms` may be processed at `now_ms`.
///
/// An event exactly `max_age_ms` old is still admitted; one millisecond older is stale.
/// The future bound works the same way with `future_tolerance_ms`.
pub fn admit(occurred_at_ms: Option<i64>, now_ms: i64, policy: &AdmissionPolicy) -> Admission {
    let Some(occurred) = occurred_at_ms else {
        return Admission::RejectUnknown;
    };
    let occurred = normalize_epoch_ms(occurred);
    let age_ms = now_ms.saturating_sub(occurred);
    if age_ms > policy.max_age_ms {
        return Admission::RejectStale { age_ms };
    }
    let ahead_ms = occurred.saturating_sub(now_ms);
    if ahead_ms > policy.future_tolerance_ms {
        return Admission::RejectFuture { ahead_ms };
    }
    Admission::Admit
}

/// The platform emits epoch seconds, milliseconds, microseconds or nanoseconds depending on the
/// event source; detect by magnitude.
pub fn normalize_epoch_ms(raw: i64) -> i64 {
    let magnitude = raw.saturating_abs();
    if magnitude < SECONDS_MAGNITUDE_LIMIT {
        raw.saturating_mul(1000)
    } else if magnitude < MICROS_MAGNITUDE_LIMIT {
        raw
    } else if magnitude < NANOS_MAGNITUDE_LIMIT {
        raw / 1_000
    } else {
        raw / 1_000_000
    }
}

fn secs_to_ms(secs: u64) -> i64 {
    i64::try_from(secs.saturating_mul(1000)).unwrap_or(i64::MAX)
}
