//! Metric types and their per-variant parameters
//!
//! Every metric-specific rule (unit, accepted range, bucket granularity) lives
//! in one static table keyed by [`MetricType`]. Adding a metric means adding a
//! variant and a row; there is no dynamic lookup.

use std::fmt;
use std::str::FromStr;

use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};

/// Health metric mirrored from the external source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    Steps,
    HeartRate,
    SleepDuration,
    Weight,
    MoodScore,
}

/// How finely a metric is bucketed within a day
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketGranularity {
    /// One bucket per clock hour, keyed by the top of the hour
    Hourly,
    /// One value per calendar day, no sub-day bucket
    Daily,
}

/// Static parameters for a metric
#[derive(Debug, Clone, Copy)]
pub struct MetricParams {
    pub unit: &'static str,
    pub min: f64,
    pub max: f64,
    pub granularity: BucketGranularity,
}

const STEPS: MetricParams = MetricParams {
    unit: "count",
    min: 0.0,
    max: 100_000.0,
    granularity: BucketGranularity::Hourly,
};

const HEART_RATE: MetricParams = MetricParams {
    unit: "bpm",
    min: 20.0,
    max: 250.0,
    granularity: BucketGranularity::Hourly,
};

const SLEEP_DURATION: MetricParams = MetricParams {
    unit: "min",
    min: 0.0,
    max: 1440.0,
    granularity: BucketGranularity::Daily,
};

const WEIGHT: MetricParams = MetricParams {
    unit: "kg",
    min: 20.0,
    max: 400.0,
    granularity: BucketGranularity::Daily,
};

const MOOD_SCORE: MetricParams = MetricParams {
    unit: "score",
    min: 1.0,
    max: 10.0,
    granularity: BucketGranularity::Daily,
};

impl MetricType {
    pub const ALL: [MetricType; 5] = [
        MetricType::Steps,
        MetricType::HeartRate,
        MetricType::SleepDuration,
        MetricType::Weight,
        MetricType::MoodScore,
    ];

    pub fn params(self) -> &'static MetricParams {
        match self {
            MetricType::Steps => &STEPS,
            MetricType::HeartRate => &HEART_RATE,
            MetricType::SleepDuration => &SLEEP_DURATION,
            MetricType::Weight => &WEIGHT,
            MetricType::MoodScore => &MOOD_SCORE,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MetricType::Steps => "steps",
            MetricType::HeartRate => "heart_rate",
            MetricType::SleepDuration => "sleep_duration",
            MetricType::Weight => "weight",
            MetricType::MoodScore => "mood_score",
        }
    }

    pub fn granularity(self) -> BucketGranularity {
        self.params().granularity
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MetricType::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| format!("unknown metric type: {}", s))
    }
}

impl BucketGranularity {
    /// End (exclusive) of the bucket window in local wall-clock time.
    ///
    /// Daily buckets ignore `bucket_time` and span the whole calendar day.
    pub fn window_end(self, date: NaiveDate, bucket_time: Option<NaiveTime>) -> NaiveDateTime {
        match (self, bucket_time) {
            (BucketGranularity::Hourly, Some(start)) => date.and_time(start) + Duration::hours(1),
            _ => date.and_time(NaiveTime::MIN) + Duration::days(1),
        }
    }

    /// A bucket is open while its window has not fully elapsed.
    pub fn is_open(self, date: NaiveDate, bucket_time: Option<NaiveTime>, now: NaiveDateTime) -> bool {
        now < self.window_end(date, bucket_time)
    }

    /// Whether `time` is a valid bucket key for this granularity.
    pub fn is_aligned(self, time: NaiveTime) -> bool {
        match self {
            BucketGranularity::Hourly => {
                time.minute() == 0 && time.second() == 0 && time.nanosecond() == 0
            }
            BucketGranularity::Daily => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 14).unwrap()
    }

    #[test]
    fn test_metric_type_string_round_trip() {
        for metric in MetricType::ALL {
            assert_eq!(metric.as_str().parse::<MetricType>().unwrap(), metric);
        }
        assert!("calories".parse::<MetricType>().is_err());
    }

    #[test]
    fn test_serde_matches_as_str() {
        let json = serde_json::to_string(&MetricType::HeartRate).unwrap();
        assert_eq!(json, "\"heart_rate\"");
    }

    #[test]
    fn test_hourly_bucket_open_until_hour_elapses() {
        let nine = NaiveTime::from_hms_opt(9, 0, 0).unwrap();
        let g = BucketGranularity::Hourly;

        let during = day().and_hms_opt(9, 59, 59).unwrap();
        let after = day().and_hms_opt(10, 0, 0).unwrap();

        assert!(g.is_open(day(), Some(nine), during));
        assert!(!g.is_open(day(), Some(nine), after));
    }

    #[test]
    fn test_daily_bucket_spans_calendar_day() {
        let g = BucketGranularity::Daily;
        let late = day().and_hms_opt(23, 59, 0).unwrap();
        let next = day().succ_opt().unwrap().and_hms_opt(0, 0, 0).unwrap();

        assert!(g.is_open(day(), None, late));
        assert!(!g.is_open(day(), None, next));
    }

    #[test]
    fn test_alignment() {
        let g = BucketGranularity::Hourly;
        assert!(g.is_aligned(NaiveTime::from_hms_opt(13, 0, 0).unwrap()));
        assert!(!g.is_aligned(NaiveTime::from_hms_opt(13, 30, 0).unwrap()));
    }
}
