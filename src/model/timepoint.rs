use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A point on the branch timeline, in milliseconds since the Unix epoch.
///
/// Kept as a raw integer so equality survives the round trip through the
/// document store; the wall clock is only consulted when a new timepoint is
/// assigned.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Timepoint(i64);

impl Timepoint {
    pub fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    pub fn millis(self) -> i64 {
        self.0
    }

    /// Current wall-clock time.
    pub fn now() -> Self {
        Self(Utc::now().timestamp_millis())
    }

    /// A timepoint strictly after `other`: the current wall clock, or
    /// `other` plus one millisecond when the clock has not advanced past it
    /// yet. Commit timepoints must exceed the branch head even when two
    /// commits land within the same millisecond.
    pub fn after(other: Timepoint) -> Self {
        let now = Self::now();
        if now > other {
            now
        } else {
            Self(other.0 + 1)
        }
    }
}

impl fmt::Display for Timepoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match Utc.timestamp_millis_opt(self.0).single() {
            Some(datetime) => write!(f, "{}", datetime.to_rfc3339()),
            None => write!(f, "{}ms", self.0),
        }
    }
}
