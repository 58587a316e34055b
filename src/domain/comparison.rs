// Side-by-side comparison of named datasets on a shared calendar index
use crate::domain::aggregator::{Aggregate, Granularity, TimeseriesSelector};
use crate::domain::telemetry::DataPoint;
use crate::error::{AnalyticsError, Result};
use chrono::{DateTime, Datelike, IsoWeek, TimeZone, Timelike, Utc, Weekday};
use std::collections::{BTreeMap, BTreeSet};

/// Calendar fields a local timestamp must match. `None` matches anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DateFilter {
    pub year: Option<i32>,
    pub month: Option<u32>,
    pub day: Option<u32>,
    pub hour: Option<u32>,
    pub week: Option<IsoWeek>,
    pub weekday: Option<Weekday>,
}

impl DateFilter {
    pub fn month(year: i32, month: u32) -> Self {
        Self {
            year: Some(year),
            month: Some(month),
            ..Self::default()
        }
    }

    pub fn day(year: i32, month: u32, day: u32) -> Self {
        Self {
            day: Some(day),
            ..Self::month(year, month)
        }
    }

    pub fn week(week: IsoWeek) -> Self {
        Self {
            week: Some(week),
            ..Self::default()
        }
    }

    pub fn matches<Tz: TimeZone>(&self, at: &DateTime<Tz>) -> bool {
        self.year.is_none_or(|y| at.year() == y)
            && self.month.is_none_or(|m| at.month() == m)
            && self.day.is_none_or(|d| at.day() == d)
            && self.hour.is_none_or(|h| at.hour() == h)
            && self.week.is_none_or(|w| at.iso_week() == w)
            && self.weekday.is_none_or(|w| at.weekday() == w)
    }
}

/// Several named datasets resampled to one granularity, so the same
/// calendar slice can be pulled out of each of them.
///
/// The index is the union of every dataset's bucket starts.
#[derive(Debug, Clone)]
pub struct TimeseriesAggregator<Tz: TimeZone = Utc> {
    tz: Tz,
    granularity: Granularity,
    aggregate: Aggregate,
    datasets: BTreeMap<String, BTreeMap<DateTime<Utc>, Option<f64>>>,
    index: BTreeSet<DateTime<Utc>>,
}

impl TimeseriesAggregator<Utc> {
    pub fn utc(granularity: Granularity, aggregate: Aggregate) -> Self {
        Self::new(granularity, aggregate, Utc)
    }
}

impl<Tz: TimeZone> TimeseriesAggregator<Tz> {
    pub fn new(granularity: Granularity, aggregate: Aggregate, tz: Tz) -> Self {
        Self {
            tz,
            granularity,
            aggregate,
            datasets: BTreeMap::new(),
            index: BTreeSet::new(),
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.datasets.keys().map(String::as_str)
    }

    /// Resample `points` and add them under a new, unique `name`.
    pub fn add_data(&mut self, name: impl Into<String>, points: impl IntoIterator<Item = DataPoint>) -> Result<()> {
        let name = name.into();
        if self.datasets.contains_key(&name) {
            return Err(AnalyticsError::usage(format!("dataset '{}' was already added", name)));
        }

        let mut selector = TimeseriesSelector::new(self.granularity, self.tz.clone());
        selector.add_data(points);

        let buckets: BTreeMap<DateTime<Utc>, Option<f64>> = if selector.is_empty() {
            BTreeMap::new()
        } else {
            selector
                .resample(self.granularity, self.aggregate)?
                .buckets
                .into_iter()
                .map(|b| (b.period.start.with_timezone(&Utc), b.value))
                .collect()
        };

        tracing::debug!("Dataset {} adds {} buckets", name, buckets.len());
        self.index.extend(buckets.keys().copied());
        self.datasets.insert(name, buckets);
        Ok(())
    }

    /// Every bucket start across all datasets, in local time.
    pub fn index(&self) -> Vec<DateTime<Tz>> {
        self.index.iter().map(|t| t.with_timezone(&self.tz)).collect()
    }

    fn distinct(&self, filter: impl Fn(&DateTime<Tz>) -> DateFilter) -> Vec<DateFilter> {
        let mut out: Vec<DateFilter> = Vec::new();
        for at in self.index() {
            let key = filter(&at);
            if !out.contains(&key) {
                out.push(key);
            }
        }
        out
    }

    /// Months spanned by the index, in time order.
    pub fn months(&self) -> Vec<DateFilter> {
        self.distinct(|at| DateFilter::month(at.year(), at.month()))
    }

    /// ISO weeks spanned by the index, in time order.
    pub fn weeks(&self) -> Vec<DateFilter> {
        self.distinct(|at| DateFilter::week(at.iso_week()))
    }

    /// Days spanned by the index, in time order.
    pub fn days(&self) -> Vec<DateFilter> {
        self.distinct(|at| DateFilter::day(at.year(), at.month(), at.day()))
    }

    fn dataset(&self, name: &str) -> Result<&BTreeMap<DateTime<Utc>, Option<f64>>> {
        self.datasets.get(name).ok_or_else(|| {
            AnalyticsError::usage(format!(
                "unknown dataset '{}' (have: {})",
                name,
                self.names().collect::<Vec<_>>().join(", ")
            ))
        })
    }

    /// Buckets of one dataset, optionally restricted by `filter`. Gap
    /// buckets are only returned when `include_gaps` is set.
    pub fn get(
        &self,
        name: &str,
        filter: Option<&DateFilter>,
        include_gaps: bool,
    ) -> Result<Vec<(DateTime<Tz>, Option<f64>)>> {
        Ok(self
            .dataset(name)?
            .iter()
            .map(|(t, v)| (t.with_timezone(&self.tz), *v))
            .filter(|(at, _)| filter.is_none_or(|f| f.matches(at)))
            .filter(|(_, v)| include_gaps || v.is_some())
            .collect())
    }

    /// One dataset laid over the shared index; `None` where it has no value.
    pub fn aligned(&self, name: &str) -> Result<Vec<(DateTime<Tz>, Option<f64>)>> {
        let data = self.dataset(name)?;
        Ok(self
            .index
            .iter()
            .map(|t| (t.with_timezone(&self.tz), data.get(t).copied().flatten()))
            .collect())
    }
}
