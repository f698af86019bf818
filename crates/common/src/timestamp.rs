//! Second-precision ISO-8601 UTC timestamps.
//!
//! The state directory (see `state` crate) uses these as both a stored
//! field and as a sortable directory-entry name, so precision is
//! deliberately coarse: a human should be able to `ls` the `start-time/`
//! index and read it. Uniqueness among concurrent launches is handled by
//! retrying on collision, not by adding sub-second precision.

use std::{
    fmt,
    str::FromStr,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use chrono::{DateTime, NaiveDateTime, Utc};

#[derive(Clone, Copy, Debug, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct Timestamp {
    secs_since_epoch: i64,
}

impl Timestamp {
    /// Capture the current wall-clock time at second precision.
    pub fn now() -> Self {
        Self::from_system_time(SystemTime::now())
    }

    pub fn from_system_time(time: SystemTime) -> Self {
        let secs = match time.duration_since(UNIX_EPOCH) {
            Ok(d) => d.as_secs() as i64,
            Err(e) => -(e.duration().as_secs() as i64),
        };
        Self {
            secs_since_epoch: secs,
        }
    }

    pub fn into_system_time(self) -> SystemTime {
        if self.secs_since_epoch >= 0 {
            UNIX_EPOCH + Duration::from_secs(self.secs_since_epoch as u64)
        } else {
            UNIX_EPOCH - Duration::from_secs((-self.secs_since_epoch) as u64)
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("malformed ISO-8601 timestamp: {0}")]
pub struct ParseTimestampError(String);

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let naive = NaiveDateTime::from_timestamp(self.secs_since_epoch, 0);
        write!(f, "{}", DateTime::<Utc>::from_utc(naive, Utc).format("%Y-%m-%dT%H:%M:%SZ"))
    }
}

impl FromStr for Timestamp {
    type Err = ParseTimestampError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let naive = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%SZ").map_err(|_| ParseTimestampError(s.to_owned()))?;
        Ok(Self {
            secs_since_epoch: naive.timestamp(),
        })
    }
}
