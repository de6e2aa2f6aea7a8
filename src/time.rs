//! Timezone-aware conversion between the engine reference timezone and UTC.

use chrono::{DateTime, LocalResult, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;

use crate::error::{ConfigError, TimeError};

pub const DEFAULT_TIMEZONE: &str = "America/Chicago";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimeService {
    tz: Tz,
}

impl TimeService {
    pub fn new(tz: Tz) -> Self {
        Self { tz }
    }

    pub fn from_name(name: &str) -> Result<Self, ConfigError> {
        let tz: Tz = name
            .parse()
            .map_err(|_| ConfigError::InvalidTimezone(name.to_string()))?;
        Ok(Self { tz })
    }

    pub fn tz(&self) -> Tz {
        self.tz
    }

    pub fn tz_name(&self) -> &'static str {
        self.tz.name()
    }

    /// Convert a local wall-clock time on `date` to UTC.
    ///
    /// Ambiguous times (DST fall-back) resolve to the earlier instant. Times
    /// skipped by a DST spring-forward are an error.
    pub fn local_to_utc(&self, date: NaiveDate, time: NaiveTime) -> Result<DateTime<Utc>, TimeError> {
        match self.tz.from_local_datetime(&date.and_time(time)) {
            LocalResult::Single(dt) => Ok(dt.with_timezone(&Utc)),
            LocalResult::Ambiguous(earliest, _) => Ok(earliest.with_timezone(&Utc)),
            LocalResult::None => Err(TimeError::NonexistentLocalTime {
                date,
                time,
                tz: self.tz.name().to_string(),
            }),
        }
    }

    pub fn to_local(&self, ts: DateTime<Utc>) -> DateTime<Tz> {
        ts.with_timezone(&self.tz)
    }

    /// Calendar date of `ts` in the reference timezone.
    pub fn trading_date(&self, ts: DateTime<Utc>) -> NaiveDate {
        self.to_local(ts).date_naive()
    }
}

impl Default for TimeService {
    fn default() -> Self {
        Self {
            tz: chrono_tz::America::Chicago,
        }
    }
}
