// =============================================================================
// Session Calendar — canonical unit-candle boundaries per instrument
// =============================================================================
//
// Unit candles are anchored to wall-clock boundaries in the instrument's local
// time: minute, hour, local midnight, local Monday 00:00 and the local first
// of the month.  Venues handled here use a fixed UTC offset (no DST), which is
// injected per symbol rather than compiled in.
// =============================================================================

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::types::{IntervalKind, DAY_MS};

/// `NaiveDate::num_days_from_ce()` of 1970-01-01.
const EPOCH_DAYS_FROM_CE: i64 = 719_163;

/// Read-only description of an instrument, consumed by the candle stores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolContext {
    pub symbol: String,
    /// Local UTC offset of the listing venue, in seconds.
    #[serde(default)]
    pub utc_offset_secs: i32,
    /// Base interval kinds the venue provides natively.
    #[serde(default = "default_intervals")]
    pub intervals: Vec<IntervalKind>,
}

fn default_intervals() -> Vec<IntervalKind> {
    IntervalKind::ALL.to_vec()
}

impl SymbolContext {
    pub fn new(symbol: impl Into<String>, utc_offset_secs: i32) -> Self {
        Self {
            symbol: symbol.into(),
            utc_offset_secs,
            intervals: default_intervals(),
        }
    }

    pub fn calendar(&self) -> SessionCalendar {
        SessionCalendar::new(self.utc_offset_secs)
    }
}

/// Boundary arithmetic for one instrument's timezone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionCalendar {
    offset_ms: i64,
}

impl SessionCalendar {
    pub fn new(utc_offset_secs: i32) -> Self {
        Self {
            offset_ms: i64::from(utc_offset_secs) * 1000,
        }
    }

    /// Start of the unit bucket containing `ts`.
    pub fn unit_start(&self, ts: i64, kind: IntervalKind) -> i64 {
        let local = ts + self.offset_ms;
        let local_start = match kind {
            IntervalKind::Minute | IntervalKind::Hour | IntervalKind::Day => {
                let unit = kind.unit_ms();
                local.div_euclid(unit) * unit
            }
            IntervalKind::Week => {
                let day = local.div_euclid(DAY_MS);
                // 1970-01-01 was a Thursday.
                let from_monday = (day + 3).rem_euclid(7);
                (day - from_monday) * DAY_MS
            }
            IntervalKind::Month => {
                let day = local.div_euclid(DAY_MS);
                month_start_day(day) * DAY_MS
            }
        };
        local_start - self.offset_ms
    }

    /// Inclusive end of the unit bucket starting at `start`.
    pub fn unit_end(&self, start: i64, kind: IntervalKind) -> i64 {
        match kind {
            IntervalKind::Month => {
                let day = (start + self.offset_ms).div_euclid(DAY_MS);
                next_month_start_day(day) * DAY_MS - self.offset_ms - 1
            }
            _ => start + kind.unit_ms() - 1,
        }
    }

    /// Canonical `(start, end)` of the bucket containing `ts`.
    pub fn unit_range(&self, ts: i64, kind: IntervalKind) -> (i64, i64) {
        let start = self.unit_start(ts, kind);
        (start, self.unit_end(start, kind))
    }

    /// Lookback origin `days` before `now`.
    pub fn days_before(&self, days: u32, now: i64) -> i64 {
        now - i64::from(days) * DAY_MS
    }
}

fn date_from_epoch_day(day: i64) -> Option<NaiveDate> {
    let ce = i32::try_from(day + EPOCH_DAYS_FROM_CE).ok()?;
    NaiveDate::from_num_days_from_ce_opt(ce)
}

fn epoch_day(date: NaiveDate) -> i64 {
    i64::from(date.num_days_from_ce()) - EPOCH_DAYS_FROM_CE
}

fn month_start_day(day: i64) -> i64 {
    date_from_epoch_day(day)
        .and_then(|d| d.with_day(1))
        .map(epoch_day)
        .unwrap_or(day)
}

fn next_month_start_day(day: i64) -> i64 {
    date_from_epoch_day(day)
        .and_then(|d| {
            let (y, m) = if d.month() == 12 {
                (d.year() + 1, 1)
            } else {
                (d.year(), d.month() + 1)
            };
            NaiveDate::from_ymd_opt(y, m, 1)
        })
        .map(epoch_day)
        .unwrap_or(day + 30)
}
