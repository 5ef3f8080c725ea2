//! # Time buckets
//!
//! Events are grouped into fixed calendar windows chosen by [`Granularity`]. Each window is
//! identified by a [`BucketKey`], an integer ordinal that increases strictly with time, so
//! ordering buckets never depends on how their labels happen to sort as strings.
//!
//! The human-readable `Date` label carried on the wire is rendered from the key only at
//! emission time. All calendar arithmetic is done in UTC:
//!
//! | granularity | ordinal                                  | label example            |
//! |-------------|------------------------------------------|--------------------------|
//! | second      | `ts`                                     | `Jan  1 00:00:00 2021`   |
//! | minute      | `ts / 60`                                | `Jan  1 00:00 2021`      |
//! | hour        | `ts / 3600`                              | `Jan  1 00 2021`         |
//! | day         | `ts / 86400`                             | `Jan  1 2021`            |
//! | week        | ISO weeks (Monday based) since the epoch | `2020 53`                |
//! | month       | `year * 12 + month0`                     | `Jan 2021`               |
//! | year        | `year`                                   | `2021`                   |

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const SECONDS_PER_MINUTE: i64 = 60;
const SECONDS_PER_HOUR: i64 = 3_600;
const SECONDS_PER_DAY: i64 = 86_400;
/// 1970-01-01 was a Thursday, three days after the Monday that opens its ISO week.
const EPOCH_WEEKDAY_OFFSET: i64 = 3;

/// Width of the time window used to bucket events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Second,
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Year,
}

/// Returned when a configured interval name is not a supported granularity.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("interval '{0}' is not one of second|minute|hour|day|week|month|year")]
pub struct UnknownGranularity(pub String);

/// Ordinal of a time bucket. Keys of one granularity order exactly like the windows they name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BucketKey(i64);

impl BucketKey {
    #[inline]
    pub const fn from_ordinal(ordinal: i64) -> Self {
        Self(ordinal)
    }

    #[inline]
    pub const fn ordinal(self) -> i64 {
        self.0
    }
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Granularity {
    /// Every supported granularity, finest first.
    pub const ALL: [Granularity; 7] = [
        Granularity::Second,
        Granularity::Minute,
        Granularity::Hour,
        Granularity::Day,
        Granularity::Week,
        Granularity::Month,
        Granularity::Year,
    ];

    /// Configuration name of the granularity.
    pub const fn name(self) -> &'static str {
        match self {
            Granularity::Second => "second",
            Granularity::Minute => "minute",
            Granularity::Hour => "hour",
            Granularity::Day => "day",
            Granularity::Week => "week",
            Granularity::Month => "month",
            Granularity::Year => "year",
        }
    }

    /// Map a unix timestamp (seconds) onto its bucket key.
    ///
    /// Returns `None` when the timestamp lies outside the calendar range `chrono` can represent.
    pub fn bucket_key(self, timestamp: i64) -> Option<BucketKey> {
        let datetime = DateTime::from_timestamp(timestamp, 0)?;
        let ordinal = match self {
            Granularity::Second => timestamp,
            Granularity::Minute => timestamp.div_euclid(SECONDS_PER_MINUTE),
            Granularity::Hour => timestamp.div_euclid(SECONDS_PER_HOUR),
            Granularity::Day => timestamp.div_euclid(SECONDS_PER_DAY),
            Granularity::Week => {
                (timestamp.div_euclid(SECONDS_PER_DAY) + EPOCH_WEEKDAY_OFFSET).div_euclid(7)
            }
            Granularity::Month => i64::from(datetime.year()) * 12 + i64::from(datetime.month0()),
            Granularity::Year => i64::from(datetime.year()),
        };
        Some(BucketKey(ordinal))
    }

    /// Unix timestamp of the first second covered by `key`.
    pub fn bucket_start(self, key: BucketKey) -> Option<i64> {
        let ordinal = key.ordinal();
        match self {
            Granularity::Second => Some(ordinal),
            Granularity::Minute => ordinal.checked_mul(SECONDS_PER_MINUTE),
            Granularity::Hour => ordinal.checked_mul(SECONDS_PER_HOUR),
            Granularity::Day => ordinal.checked_mul(SECONDS_PER_DAY),
            Granularity::Week => ordinal
                .checked_mul(7)?
                .checked_sub(EPOCH_WEEKDAY_OFFSET)?
                .checked_mul(SECONDS_PER_DAY),
            Granularity::Month => {
                let year = i32::try_from(ordinal.div_euclid(12)).ok()?;
                let month = u32::try_from(ordinal.rem_euclid(12)).ok()? + 1;
                midnight_utc(year, month)
            }
            Granularity::Year => midnight_utc(i32::try_from(ordinal).ok()?, 1),
        }
    }

    /// Render the `Date` label of `key`.
    ///
    /// Keys produced by [`Granularity::bucket_key`] always have a calendar label; any other key
    /// falls back to its ordinal.
    pub fn label(self, key: BucketKey) -> String {
        self.bucket_start(key)
            .and_then(|start| DateTime::from_timestamp(start, 0))
            .map(|start| self.format(start))
            .unwrap_or_else(|| key.to_string())
    }

    fn format(self, start: DateTime<Utc>) -> String {
        match self {
            Granularity::Second => start.format("%b %e %H:%M:%S %Y").to_string(),
            Granularity::Minute => start.format("%b %e %H:%M %Y").to_string(),
            Granularity::Hour => start.format("%b %e %H %Y").to_string(),
            Granularity::Day => start.format("%b %e %Y").to_string(),
            Granularity::Week => {
                let week = start.iso_week();
                format!("{} {}", week.year(), week.week())
            }
            Granularity::Month => start.format("%b %Y").to_string(),
            Granularity::Year => start.format("%Y").to_string(),
        }
    }
}

fn midnight_utc(year: i32, month: u32) -> Option<i64> {
    let start = NaiveDate::from_ymd_opt(year, month, 1)?.and_hms_opt(0, 0, 0)?;
    Some(start.and_utc().timestamp())
}

impl FromStr for Granularity {
    type Err = UnknownGranularity;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim().to_ascii_lowercase();
        Granularity::ALL
            .into_iter()
            .find(|granularity| granularity.name() == name)
            .ok_or_else(|| UnknownGranularity(s.to_string()))
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Merger shard that owns the bucket labelled `label` when merging is split over `shard_count`
/// instances.
pub fn shard_for(label: &str, shard_count: u32) -> u32 {
    if shard_count <= 1 {
        return 0;
    }
    (wyhash::wyhash(label.as_bytes(), 0) % u64::from(shard_count)) as u32
}
