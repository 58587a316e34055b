// Calendar-aware period division and resampling of stream samples
use crate::domain::stream_series::StreamSeries;
use crate::domain::telemetry::DataPoint;
use crate::error::{AnalyticsError, Result};
use chrono::{
    DateTime, Datelike, Duration, FixedOffset, Months, NaiveDateTime, NaiveTime, TimeZone,
    Timelike, Utc,
};
use std::collections::BTreeMap;

/// Calendar unit used to bucket samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Granularity {
    Hour,
    Day,
    /// ISO weeks, starting Monday.
    Week,
    Month,
}

/// A half-open `[start, end)` slice of time in the selector's timezone.
#[derive(Debug, Clone, PartialEq)]
pub struct Period<Tz: TimeZone> {
    pub start: DateTime<Tz>,
    pub end: DateTime<Tz>,
}

impl<Tz: TimeZone> Period<Tz> {
    pub fn contains(&self, timestamp: &DateTime<Utc>) -> bool {
        let start = self.start.with_timezone(&Utc);
        let end = self.end.with_timezone(&Utc);
        start <= *timestamp && *timestamp < end
    }

    pub fn duration(&self) -> Duration {
        self.end.clone().signed_duration_since(self.start.clone())
    }
}

/// Built-in bucket reductions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Aggregate {
    #[default]
    Mean,
    Sum,
    Min,
    Max,
    First,
    Last,
    Count,
}

impl Aggregate {
    /// Reduce a non-empty bucket.
    pub fn apply(&self, values: &[f64]) -> f64 {
        match self {
            Aggregate::Mean => values.iter().sum::<f64>() / values.len() as f64,
            Aggregate::Sum => values.iter().sum(),
            Aggregate::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
            Aggregate::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            Aggregate::First => values.first().copied().unwrap_or(f64::NAN),
            Aggregate::Last => values.last().copied().unwrap_or(f64::NAN),
            Aggregate::Count => values.len() as f64,
        }
    }
}

/// One resampled period. `value` is `None` when no valid sample fell in the
/// period; `count` is the number of valid samples aggregated.
#[derive(Debug, Clone, PartialEq)]
pub struct Bucket<Tz: TimeZone> {
    pub period: Period<Tz>,
    pub value: Option<f64>,
    pub count: usize,
}

impl<Tz: TimeZone> Bucket<Tz> {
    pub fn is_gap(&self) -> bool {
        self.value.is_none()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResampledSeries<Tz: TimeZone> {
    pub granularity: Granularity,
    pub buckets: Vec<Bucket<Tz>>,
}

impl<Tz: TimeZone> ResampledSeries<Tz> {
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn gap_count(&self) -> usize {
        self.buckets.iter().filter(|b| b.is_gap()).count()
    }

    /// Bucket start times with their values; gaps stay `None`.
    pub fn points(&self) -> Vec<(DateTime<Utc>, Option<f64>)> {
        self.buckets
            .iter()
            .map(|b| (b.period.start.with_timezone(&Utc), b.value))
            .collect()
    }

    /// Values with gaps as NaN, which plotting layers render as a break.
    pub fn values(&self) -> Vec<f64> {
        self.buckets
            .iter()
            .map(|b| b.value.unwrap_or(f64::NAN))
            .collect()
    }
}

/// Parse `UTC` or a fixed offset such as `+05:30`, `-0800` or `+02`.
///
/// Named zones need a timezone database, which this crate does not bundle;
/// callers with one can hand a zone straight to [`TimeseriesSelector::new`].
pub fn parse_timezone(name: &str) -> Result<FixedOffset> {
    let trimmed = name.trim();
    if trimmed.eq_ignore_ascii_case("utc") || trimmed == "Z" {
        return FixedOffset::east_opt(0).ok_or_else(|| AnalyticsError::usage("invalid UTC offset"));
    }

    let missing = || AnalyticsError::MissingPackage {
        capability: format!("timezone database (needed for '{}')", trimmed),
        suggestion: "pass a chrono TimeZone implementation such as chrono-tz to TimeseriesSelector::new".to_string(),
    };

    let (sign, rest) = match trimmed.chars().next() {
        Some('+') => (1, &trimmed[1..]),
        Some('-') => (-1, &trimmed[1..]),
        _ => return Err(missing()),
    };

    let digits: String = rest.chars().filter(|c| *c != ':').collect();
    if digits.is_empty() || digits.len() > 4 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(missing());
    }

    let (hours, minutes) = if digits.len() <= 2 {
        (digits.parse::<i32>().map_err(|_| missing())?, 0)
    } else {
        let split = digits.len() - 2;
        (
            digits[..split].parse::<i32>().map_err(|_| missing())?,
            digits[split..].parse::<i32>().map_err(|_| missing())?,
        )
    };

    if minutes >= 60 {
        return Err(AnalyticsError::usage(format!("invalid UTC offset '{}'", trimmed)));
    }

    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
        .ok_or_else(|| AnalyticsError::usage(format!("UTC offset '{}' is out of range", trimmed)))
}

fn floor_local(naive: NaiveDateTime, granularity: Granularity) -> NaiveDateTime {
    let date = naive.date();
    match granularity {
        Granularity::Hour => date.and_time(NaiveTime::MIN) + Duration::hours(naive.hour() as i64),
        Granularity::Day => date.and_time(NaiveTime::MIN),
        Granularity::Week => {
            let monday = date - Duration::days(date.weekday().num_days_from_monday() as i64);
            monday.and_time(NaiveTime::MIN)
        }
        Granularity::Month => date.with_day(1).unwrap_or(date).and_time(NaiveTime::MIN),
    }
}

fn next_local(floor: NaiveDateTime, granularity: Granularity) -> Option<NaiveDateTime> {
    match granularity {
        Granularity::Hour => floor.checked_add_signed(Duration::hours(1)),
        Granularity::Day => floor.checked_add_signed(Duration::days(1)),
        Granularity::Week => floor.checked_add_signed(Duration::days(7)),
        Granularity::Month => floor.checked_add_months(Months::new(1)),
    }
}

/// Accumulates samples for one stream and resamples them into calendar
/// periods of a timezone. Lives for the duration of one aggregation.
#[derive(Debug, Clone)]
pub struct TimeseriesSelector<Tz: TimeZone = Utc> {
    tz: Tz,
    granularity: Granularity,
    samples: BTreeMap<DateTime<Utc>, f64>,
    window: Option<(DateTime<Utc>, DateTime<Utc>)>,
}

impl TimeseriesSelector<Utc> {
    pub fn utc(granularity: Granularity) -> Self {
        Self::new(granularity, Utc)
    }
}

impl TimeseriesSelector<FixedOffset> {
    pub fn with_timezone_name(granularity: Granularity, timezone: &str) -> Result<Self> {
        Ok(Self::new(granularity, parse_timezone(timezone)?))
    }
}

impl<Tz: TimeZone> TimeseriesSelector<Tz> {
    pub fn new(granularity: Granularity, tz: Tz) -> Self {
        Self {
            tz,
            granularity,
            samples: BTreeMap::new(),
            window: None,
        }
    }

    /// Rebuild a selector from resampled output: one sample per non-gap
    /// bucket, covering the full span of the buckets.
    pub fn from_resampled(series: &ResampledSeries<Tz>) -> Result<Self> {
        let (first, last) = match (series.buckets.first(), series.buckets.last()) {
            (Some(first), Some(last)) => (first, last),
            _ => return Err(AnalyticsError::usage("cannot rebuild a selector from an empty series")),
        };

        let mut selector = Self::new(series.granularity, first.period.start.timezone());
        selector.cover(
            first.period.start.with_timezone(&Utc),
            last.period.end.with_timezone(&Utc),
        )?;
        selector.add_data(series.buckets.iter().filter_map(|b| {
            b.value
                .map(|v| DataPoint::new(b.period.start.with_timezone(&Utc), v))
        }));
        Ok(selector)
    }

    pub fn granularity(&self) -> Granularity {
        self.granularity
    }

    pub fn timezone(&self) -> &Tz {
        &self.tz
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Add samples; a timestamp seen before takes the newer value.
    pub fn add_data(&mut self, points: impl IntoIterator<Item = DataPoint>) {
        for point in points {
            self.samples.insert(point.timestamp, point.value);
        }
    }

    pub fn add_series(&mut self, series: &StreamSeries) {
        self.add_data(series.points().iter().copied());
    }

    /// Declare a span that resampling must cover even where there is no
    /// data, so leading and trailing gaps are reported.
    pub fn cover(&mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<()> {
        if start >= end {
            return Err(AnalyticsError::usage(format!(
                "covered span start {} must be before end {}",
                start, end
            )));
        }

        self.window = Some(match self.window {
            Some((s, e)) => (s.min(start), e.max(end)),
            None => (start, end),
        });
        Ok(())
    }

    fn localize(&self, naive: NaiveDateTime) -> Result<DateTime<Tz>> {
        // Local times skipped by a DST jump resolve to the first valid time after them.
        for shift in 0..4 {
            let candidate = naive + Duration::hours(shift);
            if let Some(dt) = self.tz.from_local_datetime(&candidate).earliest() {
                return Ok(dt);
            }
        }
        Err(AnalyticsError::usage(format!(
            "local time {} does not exist in the selector timezone",
            naive
        )))
    }

    fn floor(&self, at: &DateTime<Tz>, granularity: Granularity) -> Result<DateTime<Tz>> {
        match granularity {
            // Whole hours are stepped in absolute time so repeated DST hours stay distinct.
            Granularity::Hour => {
                let local = at.naive_local();
                let into_hour = Duration::minutes(local.minute() as i64)
                    + Duration::seconds(local.second() as i64)
                    + Duration::nanoseconds(local.nanosecond() as i64);
                Ok(at.clone() - into_hour)
            }
            _ => self.localize(floor_local(at.naive_local(), granularity)),
        }
    }

    fn next_boundary(&self, boundary: &DateTime<Tz>, granularity: Granularity) -> Result<DateTime<Tz>> {
        let next = match granularity {
            Granularity::Hour => boundary.clone() + Duration::hours(1),
            _ => {
                let floor = floor_local(boundary.naive_local(), granularity);
                let naive = next_local(floor, granularity)
                    .ok_or_else(|| AnalyticsError::usage("period boundary is out of range"))?;
                self.localize(naive)?
            }
        };

        if next <= *boundary {
            return Err(AnalyticsError::usage(format!(
                "calendar boundary after {:?} does not advance",
                boundary
            )));
        }
        Ok(next)
    }

    /// Split `[start, end]` into contiguous calendar periods. Interior
    /// boundaries sit on calendar units; the first and last periods are
    /// clipped to `start` and `end`.
    pub fn divide_period(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        granularity: Granularity,
    ) -> Result<Vec<Period<Tz>>> {
        if start >= end {
            return Err(AnalyticsError::usage(format!(
                "cannot divide an empty period: start {} is not before end {}",
                start, end
            )));
        }

        let end = end.with_timezone(&self.tz);
        let mut cursor = start.with_timezone(&self.tz);
        let mut boundary = self.next_boundary(&self.floor(&cursor, granularity)?, granularity)?;
        let mut periods = Vec::new();

        loop {
            if boundary >= end {
                periods.push(Period { start: cursor, end });
                return Ok(periods);
            }

            let next = self.next_boundary(&boundary, granularity)?;
            periods.push(Period {
                start: cursor,
                end: boundary.clone(),
            });
            cursor = boundary;
            boundary = next;
        }
    }

    /// Whole calendar periods spanning the data and any covered window.
    fn span(&self, granularity: Granularity) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
        let first = self.samples.keys().next().copied();
        let last = self.samples.keys().next_back().copied();

        let start = match (first, self.window) {
            (Some(f), Some((w, _))) => f.min(w),
            (Some(f), None) => f,
            (None, Some((w, _))) => w,
            (None, None) => {
                return Err(AnalyticsError::usage("no samples have been added to the selector"));
            }
        };
        let start = self.floor(&start.with_timezone(&self.tz), granularity)?;

        let mut end = start.clone();
        if let Some(last) = last {
            let floor = self.floor(&last.with_timezone(&self.tz), granularity)?;
            end = self.next_boundary(&floor, granularity)?;
        }
        if let Some((_, w)) = self.window {
            let w = w.with_timezone(&self.tz);
            let floor = self.floor(&w, granularity)?;
            let covered = if floor == w {
                w
            } else {
                self.next_boundary(&floor, granularity)?
            };
            if covered > end {
                end = covered;
            }
        }

        Ok((start.with_timezone(&Utc), end.with_timezone(&Utc)))
    }

    pub fn resample(&self, granularity: Granularity, aggregate: Aggregate) -> Result<ResampledSeries<Tz>> {
        self.resample_with(granularity, |values| aggregate.apply(values))
    }

    /// Resample at the configured granularity using the mean.
    pub fn resample_default(&self) -> Result<ResampledSeries<Tz>> {
        self.resample(self.granularity, Aggregate::Mean)
    }

    /// Bucket samples into calendar periods and reduce each bucket with
    /// `aggregate`. NaN samples are skipped; periods left without samples
    /// become explicit gaps.
    pub fn resample_with<F>(&self, granularity: Granularity, aggregate: F) -> Result<ResampledSeries<Tz>>
    where
        F: Fn(&[f64]) -> f64,
    {
        let (start, end) = self.span(granularity)?;
        let periods = self.divide_period(start, end, granularity)?;

        let mut samples = self.samples.iter().peekable();
        let mut buckets = Vec::with_capacity(periods.len());
        let mut values = Vec::new();
        let last_index = periods.len().saturating_sub(1);

        for (i, period) in periods.into_iter().enumerate() {
            let period_end = period.end.with_timezone(&Utc);
            values.clear();

            while let Some((timestamp, value)) = samples.peek() {
                if **timestamp < period_end || i == last_index {
                    // NaN marks a missing reading and never reaches the aggregate.
                    if !value.is_nan() {
                        values.push(**value);
                    }
                    samples.next();
                } else {
                    break;
                }
            }

            let value = if values.is_empty() {
                None
            } else {
                Some(aggregate(&values))
            };
            buckets.push(Bucket {
                period,
                value,
                count: values.len(),
            });
        }

        Ok(ResampledSeries {
            granularity,
            buckets,
        })
    }

    /// Calendar periods that contain at least one sample, in time order.
    pub fn occupied_periods(&self, granularity: Granularity) -> Result<Vec<Period<Tz>>> {
        let mut periods: Vec<Period<Tz>> = Vec::new();

        for timestamp in self.samples.keys() {
            if periods.last().is_some_and(|p| p.contains(timestamp)) {
                continue;
            }
            let start = self.floor(&timestamp.with_timezone(&self.tz), granularity)?;
            let end = self.next_boundary(&start, granularity)?;
            periods.push(Period { start, end });
        }

        Ok(periods)
    }

    /// Samples falling inside `period`.
    pub fn select(&self, period: &Period<Tz>) -> Vec<DataPoint> {
        let start = period.start.with_timezone(&Utc);
        let end = period.end.with_timezone(&Utc);
        self.samples
            .range(start..end)
            .map(|(t, v)| DataPoint::new(*t, *v))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    fn assert_contiguous<Tz: TimeZone>(periods: &[Period<Tz>], start: DateTime<Utc>, end: DateTime<Utc>) {
        assert_eq!(periods.first().unwrap().start.with_timezone(&Utc), start);
        assert_eq!(periods.last().unwrap().end.with_timezone(&Utc), end);
        for pair in periods.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
            assert!(pair[0].start < pair[0].end);
        }
    }

    #[test]
    fn test_divide_period_month() {
        let selector = TimeseriesSelector::utc(Granularity::Month);
        let start = utc(2024, 1, 30, 13, 45);
        let end = utc(2024, 4, 2, 6, 0);
        let periods = selector.divide_period(start, end, Granularity::Month).unwrap();

        assert_eq!(periods.len(), 4);
        assert_contiguous(&periods, start, end);
        assert_eq!(periods[1].start, utc(2024, 2, 1, 0, 0));
        assert_eq!(periods[2].start, utc(2024, 3, 1, 0, 0));
        assert_eq!(periods[3].start, utc(2024, 4, 1, 0, 0));
    }

    #[test]
    fn test_divide_period_week_aligns_to_monday() {
        let selector = TimeseriesSelector::utc(Granularity::Week);
        let start = utc(2024, 5, 1, 12, 0);
        let end = utc(2024, 6, 1, 0, 0);
        let periods = selector.divide_period(start, end, Granularity::Week).unwrap();

        assert_contiguous(&periods, start, end);
        for period in &periods[1..] {
            assert_eq!(period.start.weekday(), chrono::Weekday::Mon);
            assert_eq!(period.start.hour(), 0);
        }
        assert_eq!(periods.len(), 5);
    }

    #[test]
    fn test_divide_period_day_in_fixed_offset() {
        let selector = TimeseriesSelector::with_timezone_name(Granularity::Day, "+05:30").unwrap();
        let start = utc(2024, 3, 1, 0, 0);
        let end = utc(2024, 3, 3, 0, 0);
        let periods = selector.divide_period(start, end, Granularity::Day).unwrap();

        assert_contiguous(&periods, start, end);
        // Local midnight is 18:30 UTC on the previous day.
        assert_eq!(periods[1].start.with_timezone(&Utc), utc(2024, 3, 1, 18, 30));
        assert_eq!(periods[1].start.naive_local().time(), NaiveTime::MIN);
        assert_eq!(periods.len(), 3);
    }

    #[test]
    fn test_divide_period_hour_and_exact_boundaries() {
        let selector = TimeseriesSelector::utc(Granularity::Hour);
        let periods = selector
            .divide_period(utc(2024, 1, 1, 0, 0), utc(2024, 1, 1, 3, 0), Granularity::Hour)
            .unwrap();
        assert_eq!(periods.len(), 3);
        assert!(periods.iter().all(|p| p.duration() == Duration::hours(1)));
    }

    fn local_hours<Tz: TimeZone>(periods: &[Period<Tz>]) -> Vec<u32> {
        periods.iter().map(|p| p.start.naive_local().hour()).collect()
    }

    #[test]
    fn test_divide_period_day_across_dst() {
        let selector = TimeseriesSelector::new(Granularity::Day, chrono_tz::America::New_York);

        // Spring forward on 2024-03-10.
        let start = utc(2024, 3, 9, 5, 0);
        let end = utc(2024, 3, 12, 4, 0);
        let periods = selector.divide_period(start, end, Granularity::Day).unwrap();
        assert_contiguous(&periods, start, end);
        assert_eq!(local_hours(&periods), vec![0, 0, 0]);
        let hours: Vec<i64> = periods.iter().map(|p| p.duration().num_hours()).collect();
        assert_eq!(hours, vec![24, 23, 24]);

        // Fall back on 2024-11-03.
        let start = utc(2024, 11, 2, 4, 0);
        let end = utc(2024, 11, 5, 5, 0);
        let periods = selector.divide_period(start, end, Granularity::Day).unwrap();
        assert_contiguous(&periods, start, end);
        assert_eq!(local_hours(&periods), vec![0, 0, 0]);
        let hours: Vec<i64> = periods.iter().map(|p| p.duration().num_hours()).collect();
        assert_eq!(hours, vec![24, 25, 24]);
    }

    #[test]
    fn test_divide_period_day_when_midnight_is_skipped() {
        // Clocks jumped from 00:00 to 01:00 on 2018-11-04, so that day starts at 01:00.
        let selector = TimeseriesSelector::new(Granularity::Day, chrono_tz::America::Sao_Paulo);
        let start = utc(2018, 11, 3, 3, 0);
        let end = utc(2018, 11, 6, 2, 0);
        let periods = selector.divide_period(start, end, Granularity::Day).unwrap();

        assert_contiguous(&periods, start, end);
        assert_eq!(periods.len(), 3);
        assert_eq!(local_hours(&periods), vec![0, 1, 0]);
        assert_eq!(periods[1].start.with_timezone(&Utc), utc(2018, 11, 4, 3, 0));
        assert_eq!(periods[1].duration(), Duration::hours(23));
    }

    #[test]
    fn test_divide_period_hour_across_dst() {
        let selector = TimeseriesSelector::new(Granularity::Hour, chrono_tz::America::New_York);

        let start = utc(2024, 3, 10, 5, 0);
        let end = utc(2024, 3, 10, 10, 0);
        let periods = selector.divide_period(start, end, Granularity::Hour).unwrap();
        assert_contiguous(&periods, start, end);
        assert_eq!(local_hours(&periods), vec![0, 1, 3, 4, 5]);
        assert!(periods.iter().all(|p| p.duration() == Duration::hours(1)));

        // The repeated 01:00 hour yields two distinct periods.
        let start = utc(2024, 11, 3, 4, 0);
        let end = utc(2024, 11, 3, 8, 0);
        let periods = selector.divide_period(start, end, Granularity::Hour).unwrap();
        assert_contiguous(&periods, start, end);
        assert_eq!(local_hours(&periods), vec![0, 1, 1, 2]);
        assert!(periods.iter().all(|p| p.duration() == Duration::hours(1)));

        let mut selector = selector;
        selector.add_data((0..4).map(|h| DataPoint::new(start + Duration::minutes(30 + 60 * h), h as f64)));
        let resampled = selector.resample(Granularity::Hour, Aggregate::Mean).unwrap();
        assert_eq!(resampled.len(), 4);
        assert_eq!(resampled.gap_count(), 0);
        assert_eq!(resampled.values(), vec![0.0, 1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_divide_period_rejects_empty_range() {
        let selector = TimeseriesSelector::utc(Granularity::Day);
        let t = utc(2024, 1, 1, 0, 0);
        assert!(matches!(
            selector.divide_period(t, t, Granularity::Day),
            Err(AnalyticsError::Usage(_))
        ));
    }

    fn hourly_with_missing_day() -> TimeseriesSelector {
        let start = utc(2024, 3, 1, 0, 0);
        let mut selector = TimeseriesSelector::utc(Granularity::Day);
        selector.add_data((0..240).filter(|h| !(120..144).contains(h)).map(|h| {
            let day = h / 24;
            let hour = h % 24;
            DataPoint::new(start + Duration::hours(h), day as f64 + hour as f64 / 100.0)
        }));
        selector
    }

    #[test]
    fn test_resample_marks_missing_day_as_gap() {
        let selector = hourly_with_missing_day();
        let resampled = selector.resample(Granularity::Day, Aggregate::Mean).unwrap();

        assert_eq!(resampled.len(), 10);
        assert_eq!(resampled.gap_count(), 1);
        assert!(resampled.buckets[5].is_gap());
        assert_eq!(resampled.buckets[5].count, 0);
        assert!(resampled.values()[5].is_nan());

        for (day, bucket) in resampled.buckets.iter().enumerate().filter(|(d, _)| *d != 5) {
            let expected = day as f64 + 0.115;
            assert!((bucket.value.unwrap() - expected).abs() < 1e-9);
            assert_eq!(bucket.count, 24);
        }
    }

    #[test]
    fn test_resample_is_idempotent() {
        let first = hourly_with_missing_day()
            .resample(Granularity::Day, Aggregate::Mean)
            .unwrap();
        let second = TimeseriesSelector::from_resampled(&first)
            .unwrap()
            .resample(Granularity::Day, Aggregate::Mean)
            .unwrap();

        assert_eq!(first.len(), second.len());
        for (a, b) in first.buckets.iter().zip(&second.buckets) {
            assert_eq!(a.period, b.period);
            assert_eq!(a.value.is_none(), b.value.is_none());
            if let (Some(x), Some(y)) = (a.value, b.value) {
                assert!((x - y).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn test_resample_skips_nan_samples() {
        let mut selector = TimeseriesSelector::utc(Granularity::Day);
        selector.add_data([
            DataPoint::new(utc(2024, 1, 1, 1, 0), 1.0),
            DataPoint::new(utc(2024, 1, 1, 2, 0), f64::NAN),
            DataPoint::new(utc(2024, 1, 1, 3, 0), 3.0),
            DataPoint::new(utc(2024, 1, 2, 1, 0), f64::NAN),
        ]);

        let mean = selector.resample(Granularity::Day, Aggregate::Mean).unwrap();
        assert_eq!(mean.len(), 2);
        assert_eq!(mean.buckets[0].value, Some(2.0));
        assert_eq!(mean.buckets[0].count, 2);
        assert!(mean.buckets[1].is_gap());
        assert_eq!(mean.buckets[1].count, 0);

        let sum = selector.resample(Granularity::Day, Aggregate::Sum).unwrap();
        assert_eq!(sum.buckets[0].value, Some(4.0));
        assert_eq!(sum.gap_count(), 1);
    }

    #[test]
    fn test_cover_reports_trailing_gaps() {
        let mut selector = TimeseriesSelector::utc(Granularity::Day);
        selector.add_data([DataPoint::new(utc(2024, 1, 1, 6, 0), 1.0)]);
        selector.cover(utc(2024, 1, 1, 0, 0), utc(2024, 1, 4, 0, 0)).unwrap();

        let resampled = selector.resample(Granularity::Day, Aggregate::Sum).unwrap();
        assert_eq!(resampled.len(), 3);
        assert_eq!(resampled.buckets[0].value, Some(1.0));
        assert!(resampled.buckets[1].is_gap() && resampled.buckets[2].is_gap());
    }

    #[test]
    fn test_add_data_last_write_wins() {
        let mut selector = TimeseriesSelector::utc(Granularity::Hour);
        let t = utc(2024, 1, 1, 0, 30);
        selector.add_data([DataPoint::new(t, 1.0)]);
        selector.add_data([DataPoint::new(t, 7.0), DataPoint::new(t + Duration::minutes(1), 3.0)]);

        assert_eq!(selector.len(), 2);
        let resampled = selector.resample(Granularity::Hour, Aggregate::Max).unwrap();
        assert_eq!(resampled.len(), 1);
        assert_eq!(resampled.buckets[0].value, Some(7.0));
    }

    #[test]
    fn test_custom_aggregate_and_empty_selector() {
        let selector = hourly_with_missing_day();
        let counts = selector
            .resample_with(Granularity::Week, |values| values.len() as f64)
            .unwrap();
        let total: f64 = counts.buckets.iter().filter_map(|b| b.value).sum();
        assert_eq!(total, 216.0);

        let empty = TimeseriesSelector::utc(Granularity::Day);
        assert!(empty.resample_default().is_err());
    }

    #[test]
    fn test_occupied_periods_and_select() {
        let selector = hourly_with_missing_day();
        let days = selector.occupied_periods(Granularity::Day).unwrap();
        assert_eq!(days.len(), 9);
        assert_eq!(selector.select(&days[0]).len(), 24);

        let months = selector.occupied_periods(Granularity::Month).unwrap();
        assert_eq!(months.len(), 1);
        assert_eq!(months[0].start, utc(2024, 3, 1, 0, 0));
    }

    #[test]
    fn test_parse_timezone() {
        assert_eq!(parse_timezone("UTC").unwrap().local_minus_utc(), 0);
        assert_eq!(parse_timezone("+05:30").unwrap().local_minus_utc(), 19_800);
        assert_eq!(parse_timezone("-0800").unwrap().local_minus_utc(), -28_800);
        assert_eq!(parse_timezone("+02").unwrap().local_minus_utc(), 7_200);
        assert!(matches!(
            parse_timezone("US/Central"),
            Err(AnalyticsError::MissingPackage { .. })
        ));
    }

    #[test]
    fn test_aggregates() {
        let values = [3.0, 1.0, 2.0];
        assert_eq!(Aggregate::Mean.apply(&values), 2.0);
        assert_eq!(Aggregate::Sum.apply(&values), 6.0);
        assert_eq!(Aggregate::Min.apply(&values), 1.0);
        assert_eq!(Aggregate::Max.apply(&values), 3.0);
        assert_eq!(Aggregate::First.apply(&values), 3.0);
        assert_eq!(Aggregate::Last.apply(&values), 2.0);
        assert_eq!(Aggregate::Count.apply(&values), 3.0);
    }
}
