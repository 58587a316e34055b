// Variable types, units and the MDO transform
use crate::domain::telemetry::{DataPoint, StreamDescriptor};
use crate::error::{AnalyticsError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Multiplier / divisor / offset triple mapping internal values to a unit:
/// `value = internal * multiplier / divisor + offset`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Mdo {
    pub multiplier: f64,
    pub divisor: f64,
    pub offset: f64,
}

impl Mdo {
    pub const IDENTITY: Mdo = Mdo {
        multiplier: 1.0,
        divisor: 1.0,
        offset: 0.0,
    };

    pub fn new(multiplier: f64, divisor: f64, offset: f64) -> Result<Self> {
        if !multiplier.is_finite() || !divisor.is_finite() || !offset.is_finite() {
            return Err(AnalyticsError::usage("MDO coefficients must be finite"));
        }
        // Both must be non-zero or the transform cannot be inverted.
        if multiplier == 0.0 || divisor == 0.0 {
            return Err(AnalyticsError::usage(format!(
                "MDO multiplier and divisor must be non-zero (m={}, d={})",
                multiplier, divisor
            )));
        }

        Ok(Self {
            multiplier,
            divisor,
            offset,
        })
    }

    pub fn apply(&self, internal: f64) -> f64 {
        internal * self.multiplier / self.divisor + self.offset
    }

    pub fn invert(&self, value: f64) -> f64 {
        (value - self.offset) * self.divisor / self.multiplier
    }
}

impl Default for Mdo {
    fn default() -> Self {
        Mdo::IDENTITY
    }
}

/// Apply `mdo` to every sample, producing a new sequence.
pub fn apply_mdo(points: &[DataPoint], mdo: &Mdo) -> Vec<DataPoint> {
    points
        .iter()
        .map(|p| DataPoint::new(p.timestamp, mdo.apply(p.value)))
        .collect()
}

/// One output unit a variable type can be displayed in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitDefinition {
    pub slug: String,
    pub label: String,
    #[serde(default)]
    pub short: Option<String>,
    pub mdo: Mdo,
}

impl UnitDefinition {
    fn matches(&self, name: &str) -> bool {
        self.slug.eq_ignore_ascii_case(name)
            || self.label.eq_ignore_ascii_case(name)
            || self
                .short
                .as_deref()
                .is_some_and(|s| s.eq_ignore_ascii_case(name))
    }
}

/// The unit a series is currently expressed in.
#[derive(Debug, Clone, PartialEq)]
pub enum Unit {
    /// Raw values as stored by the backend.
    Internal,
    Defined(UnitDefinition),
}

impl Unit {
    pub fn mdo(&self) -> Mdo {
        match self {
            Unit::Internal => Mdo::IDENTITY,
            Unit::Defined(unit) => unit.mdo,
        }
    }

    pub fn label(&self) -> &str {
        match self {
            Unit::Internal => "internal",
            Unit::Defined(unit) => &unit.label,
        }
    }

    pub fn is_same(&self, other: &Unit) -> bool {
        match (self, other) {
            (Unit::Internal, Unit::Internal) => true,
            (Unit::Defined(a), Unit::Defined(b)) => a.slug == b.slug,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableType {
    pub slug: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub units: Vec<UnitDefinition>,
    #[serde(default)]
    pub default_unit: Option<String>,
}

impl VariableType {
    /// Look a unit up by slug, full label or short label (case-insensitive).
    pub fn unit(&self, name: &str) -> Option<&UnitDefinition> {
        self.units.iter().find(|u| u.matches(name))
    }

    pub fn default_unit(&self) -> Option<&UnitDefinition> {
        self.default_unit
            .as_deref()
            .and_then(|name| self.unit(name))
            .or_else(|| self.units.first())
    }

    pub fn mdo(&self) -> Mdo {
        self.default_unit().map(|u| u.mdo).unwrap_or_default()
    }

    pub fn unit_label(&self) -> Option<&str> {
        self.default_unit().map(|u| u.label.as_str())
    }

    /// Resolve a unit name, with `internal` naming the raw values.
    pub fn resolve_unit(&self, name: &str) -> Result<Unit> {
        if name.eq_ignore_ascii_case("internal") {
            return Ok(Unit::Internal);
        }

        self.unit(name)
            .cloned()
            .map(Unit::Defined)
            .ok_or_else(|| {
                AnalyticsError::usage(format!(
                    "unit '{}' is not available for variable type {} (available: {})",
                    name,
                    self.slug,
                    self.units
                        .iter()
                        .map(|u| u.label.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                ))
            })
    }
}

/// Variable types keyed by slug, resolved once per stream when a series is built.
#[derive(Debug, Clone, Default)]
pub struct VartypeRegistry {
    types: BTreeMap<String, VariableType>,
}

impl VartypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, vartype: VariableType) {
        self.types.insert(vartype.slug.clone(), vartype);
    }

    pub fn get(&self, slug: &str) -> Option<&VariableType> {
        self.types.get(slug)
    }

    pub fn resolve(&self, stream: &StreamDescriptor) -> Option<&VariableType> {
        stream.var_type.as_deref().and_then(|slug| self.get(slug))
    }

    pub fn iter(&self) -> impl Iterator<Item = &VariableType> {
        self.types.values()
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

impl FromIterator<VariableType> for VartypeRegistry {
    fn from_iter<I: IntoIterator<Item = VariableType>>(iter: I) -> Self {
        let mut registry = VartypeRegistry::new();
        for vartype in iter {
            registry.insert(vartype);
        }
        registry
    }
}
