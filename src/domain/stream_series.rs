// Unit-aware sample sequence for a single stream
use crate::domain::interval::{Domain, find_domain};
use crate::domain::telemetry::{DataPoint, StreamDescriptor, normalize_points};
use crate::domain::vartype::{Mdo, Unit, VariableType, apply_mdo};
use crate::error::{AnalyticsError, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// One stream's samples together with the metadata needed to convert them.
///
/// Raw internal values are shared and never modified; the displayed values
/// are always recomputed from them, so conversions compose without drift.
#[derive(Debug, Clone)]
pub struct StreamSeries {
    raw: Arc<[DataPoint]>,
    points: Vec<DataPoint>,
    unit: Unit,
    stream: Option<StreamDescriptor>,
    vartype: Option<VariableType>,
}

impl StreamSeries {
    /// Build a series in internal units. Samples are sorted and deduplicated.
    pub fn new(points: Vec<DataPoint>) -> Self {
        let raw: Arc<[DataPoint]> = normalize_points(points).into();
        Self {
            points: raw.to_vec(),
            raw,
            unit: Unit::Internal,
            stream: None,
            vartype: None,
        }
    }

    /// Build a series and switch it to the stream's default output unit.
    pub fn for_stream(
        points: Vec<DataPoint>,
        stream: StreamDescriptor,
        vartype: Option<VariableType>,
    ) -> Self {
        let mut series = Self::new(points);
        series.set_stream(stream);
        series.set_vartype(vartype);

        let unit = series.vartype.as_ref().and_then(|vt| {
            series
                .stream
                .as_ref()
                .and_then(|s| s.output_unit.as_deref())
                .and_then(|name| vt.unit(name))
                .or_else(|| vt.default_unit())
                .cloned()
        });

        if let Some(unit) = unit {
            series = series.with_unit(Unit::Defined(unit));
        }
        series
    }

    pub fn set_stream(&mut self, stream: StreamDescriptor) {
        self.stream = Some(stream);
    }

    /// Replace the variable type. If the current unit does not belong to the
    /// new type, values fall back to internal units.
    pub fn set_vartype(&mut self, vartype: Option<VariableType>) {
        let keeps_unit = match (&self.unit, &vartype) {
            (Unit::Internal, _) => true,
            (Unit::Defined(unit), Some(vt)) => vt.unit(&unit.slug).is_some(),
            (Unit::Defined(_), None) => false,
        };

        self.vartype = vartype;
        if !keeps_unit {
            self.points = self.raw.to_vec();
            self.unit = Unit::Internal;
        }
    }

    pub fn stream(&self) -> Option<&StreamDescriptor> {
        self.stream.as_ref()
    }

    pub fn vartype(&self) -> Option<&VariableType> {
        self.vartype.as_ref()
    }

    pub fn unit(&self) -> &Unit {
        &self.unit
    }

    pub fn points(&self) -> &[DataPoint] {
        &self.points
    }

    pub fn raw_points(&self) -> &[DataPoint] {
        &self.raw
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn values(&self) -> impl Iterator<Item = f64> + '_ {
        self.points.iter().map(|p| p.value)
    }

    /// Units this series can be converted to.
    pub fn available_units(&self) -> Vec<&str> {
        self.vartype
            .as_ref()
            .map(|vt| vt.units.iter().map(|u| u.label.as_str()).collect())
            .unwrap_or_default()
    }

    /// Return a copy of this series expressed in `unit`.
    pub fn convert(&self, unit: &str) -> Result<StreamSeries> {
        let target = match &self.vartype {
            Some(vartype) => vartype.resolve_unit(unit)?,
            None if unit.eq_ignore_ascii_case("internal") => Unit::Internal,
            None => {
                return Err(AnalyticsError::usage(format!(
                    "cannot convert stream {} to '{}': no variable type is attached",
                    self.slug().unwrap_or("<anonymous>"),
                    unit
                )));
            }
        };

        if target.is_same(&self.unit) {
            return Ok(self.clone());
        }
        Ok(self.with_unit(target))
    }

    /// Apply an explicit MDO to the raw values, bypassing unit lookup.
    pub fn apply_mdo(&self, mdo: &Mdo) -> Vec<DataPoint> {
        apply_mdo(&self.raw, mdo)
    }

    /// Observed value range, ignoring NaN samples.
    pub fn value_domain(&self) -> Result<Domain<f64>> {
        find_domain(self.values())
    }

    pub fn time_domain(&self) -> Result<Domain<DateTime<Utc>>> {
        match (self.points.first(), self.points.last()) {
            (Some(first), Some(last)) => Domain::new(first.timestamp, last.timestamp),
            _ => Err(AnalyticsError::usage("cannot take the time domain of an empty series")),
        }
    }

    /// Samples as `(unix seconds, value)` pairs, e.g. for envelopes.
    pub fn to_xy(&self) -> Vec<(f64, f64)> {
        self.points
            .iter()
            .map(|p| (p.timestamp.timestamp_millis() as f64 / 1000.0, p.value))
            .collect()
    }

    fn slug(&self) -> Option<&str> {
        self.stream.as_ref().map(|s| s.slug.as_str())
    }

    fn with_unit(&self, unit: Unit) -> StreamSeries {
        StreamSeries {
            raw: Arc::clone(&self.raw),
            points: self.apply_mdo(&unit.mdo()),
            unit,
            stream: self.stream.clone(),
            vartype: self.vartype.clone(),
        }
    }
}
