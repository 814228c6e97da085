//! Wall-clock timestamps recorded for each exposure
//!
//! The FITS writer needs the UTC start date/time, the end-of-integration time
//! and the Julian day, plus compact stamps used to build directory and file
//! names. They are computed once when the exposure starts so the cost never
//! lands on the readout path.

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};

/// Julian day of the Unix epoch (1970-01-01T00:00:00 UTC).
const UNIX_EPOCH_JD: f64 = 2_440_587.5;
const SECONDS_PER_DAY: f64 = 86_400.0;

/// UTC timestamps of one exposure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationTime {
    /// Start of integration
    pub start: DateTime<Utc>,
    /// End of integration (readout start)
    pub end: Option<DateTime<Utc>>,
}

impl ObservationTime {
    /// Timestamps for an exposure starting now.
    pub fn now() -> Self {
        Self::starting_at(Utc::now())
    }

    /// Timestamps for an exposure starting at `start`.
    pub fn starting_at(start: DateTime<Utc>) -> Self {
        Self { start, end: None }
    }

    /// Record the end of integration.
    pub fn mark_end(&mut self, end: DateTime<Utc>) {
        self.end = Some(end);
    }

    /// `DATE-OBS`: `YYYY-MM-DD`
    pub fn date_obs(&self) -> String {
        self.start.format("%Y-%m-%d").to_string()
    }

    /// `TIME-OBS`: `hh:mm:ss.ffffff`
    pub fn time_obs(&self) -> String {
        self.start.format("%H:%M:%S%.6f").to_string()
    }

    /// `TIME-END`: `hh:mm:ss.ffffff`, empty until integration ends
    pub fn time_end(&self) -> Option<String> {
        self.end.map(|end| end.format("%H:%M:%S%.6f").to_string())
    }

    /// Directory stamp: `YYMMDD`
    pub fn utc_date(&self) -> String {
        self.start.format("%y%m%d").to_string()
    }

    /// File stamp: `YYMMDDThhmmssss` where the last four digits are
    /// seconds and hundredths.
    pub fn utc_time(&self) -> String {
        let hundredths = self.start.second() * 100 + self.start.nanosecond() / 10_000_000;
        format!(
            "{}T{:02}{:02}{:04}",
            self.utc_date(),
            self.start.hour(),
            self.start.minute(),
            hundredths.min(5999)
        )
    }

    /// Julian day of the exposure start.
    pub fn julian_day(&self) -> f64 {
        let micros = self.start.timestamp_micros() as f64;
        UNIX_EPOCH_JD + micros * 1e-6 / SECONDS_PER_DAY
    }
}
