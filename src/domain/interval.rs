// Value and time domains: finding and combining [min, max] intervals
use crate::error::{AnalyticsError, Result};
use std::fmt::Debug;

/// A closed interval `[min, max]` over a value or time axis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Domain<T> {
    min: T,
    max: T,
}

/// How several domains are merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CombineMode {
    /// Widen to cover every input; used to put streams on a shared scale.
    Union,
    /// Narrow to where all inputs overlap; fails when they do not.
    Intersection,
}

impl<T: PartialOrd + Copy + Debug> Domain<T> {
    pub fn new(min: T, max: T) -> Result<Self> {
        // Written as a negation so unordered values (NaN) are rejected too.
        if !(min <= max) {
            return Err(AnalyticsError::usage(format!(
                "invalid domain: min {:?} is not <= max {:?}",
                min, max
            )));
        }
        Ok(Self { min, max })
    }

    pub fn min(&self) -> T {
        self.min
    }

    pub fn max(&self) -> T {
        self.max
    }

    pub fn contains(&self, value: T) -> bool {
        self.min <= value && value <= self.max
    }

    pub fn union(&self, other: &Domain<T>) -> Domain<T> {
        Domain {
            min: if other.min < self.min { other.min } else { self.min },
            max: if other.max > self.max { other.max } else { self.max },
        }
    }

    pub fn intersection(&self, other: &Domain<T>) -> Option<Domain<T>> {
        if other.max < self.min || other.min > self.max {
            return None;
        }

        Some(Domain {
            min: if other.min > self.min { other.min } else { self.min },
            max: if other.max < self.max { other.max } else { self.max },
        })
    }
}

impl Domain<f64> {
    pub fn width(&self) -> f64 {
        self.max - self.min
    }
}

/// Observed `[min, max]` of a sequence of values. NaN entries mark gaps and
/// are skipped; a sequence with no real values has no domain.
pub fn find_domain(values: impl IntoIterator<Item = f64>) -> Result<Domain<f64>> {
    let mut bounds: Option<(f64, f64)> = None;

    for value in values.into_iter().filter(|v| !v.is_nan()) {
        bounds = Some(match bounds {
            None => (value, value),
            Some((lo, hi)) => (lo.min(value), hi.max(value)),
        });
    }

    match bounds {
        Some((lo, hi)) => Domain::new(lo, hi),
        None => Err(AnalyticsError::usage(
            "cannot find the domain of a series without any values",
        )),
    }
}

/// Merge domains. There is no default mode: callers state whether they want
/// a shared scale (union) or the common region (intersection).
pub fn combine_domains<T: PartialOrd + Copy + Debug>(
    domains: &[Domain<T>],
    mode: CombineMode,
) -> Result<Domain<T>> {
    let (first, rest) = domains
        .split_first()
        .ok_or_else(|| AnalyticsError::usage("cannot combine an empty set of domains"))?;

    let mut combined = *first;
    for domain in rest {
        combined = match mode {
            CombineMode::Union => combined.union(domain),
            CombineMode::Intersection => combined.intersection(domain).ok_or_else(|| {
                AnalyticsError::usage(format!(
                    "domains do not intersect: running intersection {:?} vs {:?}",
                    combined, domain
                ))
            })?,
        };
    }

    Ok(combined)
}
