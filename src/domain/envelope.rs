// Min/max envelopes for rendering dense series compactly
use crate::domain::interval::{CombineMode, Domain, combine_domains, find_domain};
use crate::error::{AnalyticsError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BinSpacing {
    #[default]
    Linear,
    /// Geometric spacing; the x-domain must be strictly positive.
    Log,
}

/// Which x position represents a bin in the output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BinMark {
    Left,
    #[default]
    Center,
    Right,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvelopeOptions {
    pub bin_count: usize,
    pub spacing: BinSpacing,
    pub mark: BinMark,
}

impl Default for EnvelopeOptions {
    fn default() -> Self {
        Self {
            bin_count: 100,
            spacing: BinSpacing::Linear,
            mark: BinMark::Center,
        }
    }
}

impl EnvelopeOptions {
    pub fn with_bins(bin_count: usize) -> Self {
        Self {
            bin_count,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnvelopeBin {
    pub start: f64,
    pub end: f64,
    pub mark: f64,
    pub lower: f64,
    pub upper: f64,
    pub count: usize,
}

/// Lower and upper envelope; only bins that received samples are present.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Envelope {
    bins: Vec<EnvelopeBin>,
}

impl Envelope {
    pub fn bins(&self) -> &[EnvelopeBin] {
        &self.bins
    }

    pub fn len(&self) -> usize {
        self.bins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bins.is_empty()
    }

    pub fn marks(&self) -> Vec<f64> {
        self.bins.iter().map(|b| b.mark).collect()
    }

    pub fn lower(&self) -> Vec<f64> {
        self.bins.iter().map(|b| b.lower).collect()
    }

    pub fn upper(&self) -> Vec<f64> {
        self.bins.iter().map(|b| b.upper).collect()
    }
}

/// Incrementally builds an envelope over a fixed x-domain, one series at a time.
#[derive(Debug, Clone)]
pub struct EnvelopeAccumulator {
    edges: Vec<f64>,
    lower: Vec<f64>,
    upper: Vec<f64>,
    counts: Vec<usize>,
    mark: BinMark,
}

impl EnvelopeAccumulator {
    pub fn new(min_x: f64, max_x: f64, options: EnvelopeOptions) -> Result<Self> {
        if options.bin_count == 0 {
            return Err(AnalyticsError::usage("envelope bin count must be positive"));
        }
        let domain = Domain::new(min_x, max_x)?;
        if !min_x.is_finite() || !max_x.is_finite() {
            return Err(AnalyticsError::usage("envelope domain must be finite"));
        }

        let n = options.bin_count;
        let mut edges: Vec<f64> = match options.spacing {
            BinSpacing::Linear => (0..=n)
                .map(|i| domain.min() + domain.width() * i as f64 / n as f64)
                .collect(),
            BinSpacing::Log => {
                if domain.min() <= 0.0 {
                    return Err(AnalyticsError::usage(format!(
                        "log spaced envelope needs a positive domain, got min {}",
                        domain.min()
                    )));
                }
                let (lo, hi) = (domain.min().ln(), domain.max().ln());
                (0..=n)
                    .map(|i| (lo + (hi - lo) * i as f64 / n as f64).exp())
                    .collect()
            }
        };

        // Pin the outer edges so roundoff never pushes a sample out of range.
        edges[0] = domain.min();
        edges[n] = domain.max();

        Ok(Self {
            edges,
            lower: vec![f64::NAN; n],
            upper: vec![f64::NAN; n],
            counts: vec![0; n],
            mark: options.mark,
        })
    }

    /// Bin holding `x`: bins are `(left, right]`, with the first bin also
    /// closed on the left. Samples outside the domain have no bin.
    fn bin_index(&self, x: f64) -> Option<usize> {
        let first = *self.edges.first()?;
        if x.is_nan() || x < first {
            return None;
        }

        let index = self.edges[1..].partition_point(|edge| *edge < x);
        (index < self.counts.len()).then_some(index)
    }

    pub fn update(&mut self, points: &[(f64, f64)]) {
        for &(x, y) in points {
            if y.is_nan() {
                continue;
            }
            let Some(i) = self.bin_index(x) else {
                continue;
            };

            if self.counts[i] == 0 || y < self.lower[i] {
                self.lower[i] = y;
            }
            if self.counts[i] == 0 || y > self.upper[i] {
                self.upper[i] = y;
            }
            self.counts[i] += 1;
        }
    }

    pub fn finish(self) -> Envelope {
        let bins = self
            .counts
            .iter()
            .enumerate()
            .filter(|(_, count)| **count > 0)
            .map(|(i, count)| {
                let (start, end) = (self.edges[i], self.edges[i + 1]);
                let mark = match self.mark {
                    BinMark::Left => start,
                    BinMark::Right => end,
                    BinMark::Center => (start + end) / 2.0,
                };

                EnvelopeBin {
                    start,
                    end,
                    mark,
                    lower: self.lower[i],
                    upper: self.upper[i],
                    count: *count,
                }
            })
            .collect();

        Envelope { bins }
    }
}

/// Envelope of one or more `(x, y)` series over the union of their x-domains.
pub fn envelope(series: &[&[(f64, f64)]], options: EnvelopeOptions) -> Result<Envelope> {
    let domains = series
        .iter()
        .filter(|points| !points.is_empty())
        .map(|points| find_domain(points.iter().map(|(x, _)| *x)))
        .collect::<Result<Vec<_>>>()?;

    let domain = combine_domains(&domains, CombineMode::Union)?;

    let mut accumulator = EnvelopeAccumulator::new(domain.min(), domain.max(), options)?;
    for points in series {
        accumulator.update(points);
    }

    Ok(accumulator.finish())
}
