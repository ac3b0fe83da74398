/// Bucketed averages over collected sensor readings
use std::collections::BTreeMap;

use time::{Duration, OffsetDateTime};

use crate::models::{SensorReading, SensorType};
use crate::utils::round_to;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeRange {
    Hour,
    Day,
    Week,
}

impl TimeRange {
    pub fn span(&self) -> Duration {
        match self {
            TimeRange::Hour => Duration::hours(1),
            TimeRange::Day => Duration::days(1),
            TimeRange::Week => Duration::weeks(1),
        }
    }

    pub fn bucket(&self) -> Duration {
        match self {
            TimeRange::Hour => Duration::minutes(1),
            TimeRange::Day => Duration::hours(1),
            TimeRange::Week => Duration::days(1),
        }
    }
}

impl std::str::FromStr for TimeRange {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hour" => Ok(TimeRange::Hour),
            "day" => Ok(TimeRange::Day),
            "week" => Ok(TimeRange::Week),
            other => Err(format!("Unknown time range '{}'", other)),
        }
    }
}

/// One bucket of one sensor
#[derive(Debug, Clone, PartialEq)]
pub struct HistoricalDataPoint {
    pub sensor_type: SensorType,
    /// Start of the bucket
    pub timestamp: OffsetDateTime,
    pub average: f64,
    pub minimum: f64,
    pub maximum: f64,
    pub samples: usize,
}

/// Whole-interval statistics for one sensor
#[derive(Debug, Clone, PartialEq)]
pub struct SensorSummary {
    pub average: f64,
    pub minimum: f64,
    pub maximum: f64,
    /// Last value minus first value, e.g. battery drain over the interval
    pub change: f64,
    pub first: OffsetDateTime,
    pub last: OffsetDateTime,
    pub samples: usize,
}

fn bucket_start(timestamp: OffsetDateTime, bucket: Duration) -> i64 {
    let seconds = timestamp.unix_timestamp();
    seconds - seconds.rem_euclid(bucket.whole_seconds())
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    sum: f64,
    minimum: f64,
    maximum: f64,
    samples: usize,
}

impl Bucket {
    fn new(value: f64) -> Self {
        Self {
            sum: value,
            minimum: value,
            maximum: value,
            samples: 1,
        }
    }

    fn add(&mut self, value: f64) {
        self.sum += value;
        self.minimum = self.minimum.min(value);
        self.maximum = self.maximum.max(value);
        self.samples += 1;
    }
}

/// Running bucket statistics over the trailing `range`
///
/// Readings are folded in as they arrive, so memory grows with the number of
/// buckets per sensor rather than with the sample rate.
#[derive(Debug, Clone)]
pub struct History {
    range: TimeRange,
    buckets: BTreeMap<(SensorType, i64), Bucket>,
}

impl History {
    pub fn new(range: TimeRange) -> Self {
        Self {
            range,
            buckets: BTreeMap::new(),
        }
    }

    pub fn range(&self) -> TimeRange {
        self.range
    }

    /// Number of (sensor, bucket) cells currently held
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn record(&mut self, reading: &SensorReading) {
        let key = (
            reading.sensor_type,
            bucket_start(reading.timestamp, self.range.bucket()),
        );
        self.buckets
            .entry(key)
            .and_modify(|bucket| bucket.add(reading.value))
            .or_insert_with(|| Bucket::new(reading.value));
    }

    /// Drop buckets that ended before `now - span`
    pub fn evict(&mut self, now: OffsetDateTime) {
        let width = self.range.bucket().whole_seconds();
        let window_start = (now - self.range.span()).unix_timestamp();
        self.buckets.retain(|(_, start), _| start + width > window_start);
    }

    /// Bucket averages ordered by sensor type, then bucket start
    pub fn points(&self) -> Vec<HistoricalDataPoint> {
        self.buckets
            .iter()
            .map(|(&(sensor_type, start), bucket)| HistoricalDataPoint {
                sensor_type,
                timestamp: OffsetDateTime::UNIX_EPOCH + Duration::seconds(start),
                average: round_to(bucket.sum / bucket.samples as f64, 2),
                minimum: bucket.minimum,
                maximum: bucket.maximum,
                samples: bucket.samples,
            })
            .collect()
    }
}

/// Average readings into fixed-width buckets over the trailing `range`
///
/// Readings outside `(now - span, now]` are ignored. Output is ordered by
/// sensor type, then bucket start.
pub fn aggregate(
    readings: &[SensorReading],
    range: TimeRange,
    now: OffsetDateTime,
) -> Vec<HistoricalDataPoint> {
    let window_start = now - range.span();
    let mut history = History::new(range);
    for reading in readings
        .iter()
        .filter(|r| r.timestamp > window_start && r.timestamp <= now)
    {
        history.record(reading);
    }
    history.points()
}

/// Per-sensor statistics over one collection interval
pub fn summarize(readings: &[SensorReading]) -> BTreeMap<SensorType, SensorSummary> {
    let mut grouped: BTreeMap<SensorType, Vec<&SensorReading>> = BTreeMap::new();
    for reading in readings {
        grouped.entry(reading.sensor_type).or_default().push(reading);
    }

    let mut summaries = BTreeMap::new();
    for (sensor_type, mut group) in grouped {
        // Readings can arrive slightly out of order across characteristics
        group.sort_by_key(|r| r.timestamp);
        let (Some(first), Some(last)) = (group.first(), group.last()) else {
            continue;
        };

        let count = group.len() as f64;
        let sum: f64 = group.iter().map(|r| r.value).sum();
        summaries.insert(
            sensor_type,
            SensorSummary {
                average: round_to(sum / count, 2),
                minimum: group.iter().map(|r| r.value).fold(f64::INFINITY, f64::min),
                maximum: group
                    .iter()
                    .map(|r| r.value)
                    .fold(f64::NEG_INFINITY, f64::max),
                change: round_to(last.value - first.value, 2),
                first: first.timestamp,
                last: last.timestamp,
                samples: group.len(),
            },
        );
    }

    summaries
}
