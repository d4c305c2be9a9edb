//! Hyperparameter dimensions and the concrete values sampled from them.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

use crate::errors::{ConfigError, HsResult};

/// A concrete parameter value produced by sampling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl ParameterValue {
    /// Numeric view of the value, if it has one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Text(v) => write!(f, "{v}"),
        }
    }
}

impl From<f64> for ParameterValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<i64> for ParameterValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<bool> for ParameterValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for ParameterValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

/// Describes the values a dimension can take.
///
/// `Choice` and `IntRange` are finite and enumerate directly for grid
/// sampling. The continuous ranges are discretized into evenly spaced points
/// for grid sampling. `Normal` is unbounded and only usable with random
/// sampling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParameterDomain {
    /// Finite ordered set of values.
    Choice { values: Vec<ParameterValue> },
    /// Integer range [low, high] inclusive.
    IntRange { low: i64, high: i64 },
    /// Continuous uniform range [low, high].
    Uniform { low: f64, high: f64 },
    /// Log-uniform range (sampled in log-space then exponentiated).
    LogUniform { low: f64, high: f64 },
    /// Uniform range rounded to the nearest multiple of `q`.
    QUniform { low: f64, high: f64, q: f64 },
    /// Gaussian with the given mean and standard deviation.
    Normal { mean: f64, std_dev: f64 },
}

impl ParameterDomain {
    /// Whether the domain has a natural finite enumeration.
    pub fn is_discrete(&self) -> bool {
        matches!(
            self,
            Self::Choice { .. } | Self::IntRange { .. } | Self::QUniform { .. }
        )
    }

    /// Number of distinct values for discrete domains. `None` for
    /// continuous domains and for ranges too wide to count in a `usize`.
    pub fn cardinality(&self) -> Option<usize> {
        let span = |first: i64, last: i64| -> Option<usize> {
            if first > last {
                return Some(0);
            }
            usize::try_from(last.abs_diff(first)).ok()?.checked_add(1)
        };
        match self {
            Self::Choice { values } => Some(values.len()),
            Self::IntRange { low, high } => span(*low, *high),
            Self::QUniform { .. } => {
                let (first, last) = self.quantized_bounds()?;
                span(first, last)
            }
            _ => None,
        }
    }

    /// For `QUniform`, the smallest and largest `k` such that `k * q` lies
    /// in `[low, high]`. Empty when the first exceeds the last.
    pub fn quantized_bounds(&self) -> Option<(i64, i64)> {
        match self {
            Self::QUniform { low, high, q } => {
                Some(((low / q).ceil() as i64, (high / q).floor() as i64))
            }
            _ => None,
        }
    }
}

/// A single named dimension of the search space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    /// Human-readable parameter name (e.g. "regularization").
    pub name: String,
    pub domain: ParameterDomain,
}

impl ParameterSpec {
    pub fn new(name: impl Into<String>, domain: ParameterDomain) -> Self {
        Self {
            name: name.into(),
            domain,
        }
    }

    pub fn choice<V: Into<ParameterValue>>(
        name: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        Self::new(
            name,
            ParameterDomain::Choice {
                values: values.into_iter().map(Into::into).collect(),
            },
        )
    }

    /// Reject domains that could never produce a value.
    pub fn validate(&self) -> HsResult<()> {
        let invalid = |message: String| -> HsResult<()> {
            Err(ConfigError::InvalidSpace { message }.into())
        };

        if self.name.trim().is_empty() {
            return invalid("parameter name must not be empty".to_string());
        }

        match &self.domain {
            ParameterDomain::Choice { values } if values.is_empty() => {
                Err(ConfigError::EmptyDomain {
                    parameter: self.name.clone(),
                }
                .into())
            }
            ParameterDomain::Choice { .. } => Ok(()),
            ParameterDomain::IntRange { low, high } if low > high => Err(
                ConfigError::EmptyDomain {
                    parameter: self.name.clone(),
                }
                .into(),
            ),
            ParameterDomain::IntRange { .. } => Ok(()),
            ParameterDomain::Uniform { low, high } => check_bounds(&self.name, *low, *high),
            ParameterDomain::LogUniform { low, high } => {
                check_bounds(&self.name, *low, *high)?;
                if *low <= 0.0 {
                    return invalid(format!(
                        "'{}': log-uniform bounds must be positive, got low={low}",
                        self.name
                    ));
                }
                Ok(())
            }
            ParameterDomain::QUniform { low, high, q } => {
                check_bounds(&self.name, *low, *high)?;
                if !(q.is_finite() && *q > 0.0) {
                    return invalid(format!("'{}': q must be positive, got {q}", self.name));
                }
                if self.domain.cardinality() == Some(0) {
                    return Err(ConfigError::EmptyDomain {
                        parameter: self.name.clone(),
                    }
                    .into());
                }
                Ok(())
            }
            ParameterDomain::Normal { mean, std_dev } => {
                if !mean.is_finite() || !(std_dev.is_finite() && *std_dev > 0.0) {
                    return invalid(format!(
                        "'{}': normal needs a finite mean and positive std_dev",
                        self.name
                    ));
                }
                Ok(())
            }
        }
    }
}

fn check_bounds(name: &str, low: f64, high: f64) -> HsResult<()> {
    if !low.is_finite() || !high.is_finite() {
        return Err(ConfigError::InvalidSpace {
            message: format!("'{name}': bounds must be finite"),
        }
        .into());
    }
    if low > high {
        return Err(ConfigError::EmptyDomain {
            parameter: name.to_string(),
        }
        .into());
    }
    Ok(())
}

/// Validate a list of dimensions as a whole: non-empty, unique names, every
/// domain valid.
pub fn validate_specs(specs: &[ParameterSpec]) -> HsResult<()> {
    if specs.is_empty() {
        return Err(ConfigError::InvalidSpace {
            message: "search space has no parameters".to_string(),
        }
        .into());
    }

    let mut seen = HashSet::new();
    for spec in specs {
        spec.validate()?;
        if !seen.insert(spec.name.as_str()) {
            return Err(ConfigError::DuplicateParameter {
                parameter: spec.name.clone(),
            }
            .into());
        }
    }
    Ok(())
}

/// One named value inside a [`ParameterSet`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterEntry {
    pub name: String,
    pub value: ParameterValue,
}

/// The concrete configuration of one trial: exactly one value per dimension,
/// kept in declaration order. Immutable once built.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParameterSet {
    entries: Vec<ParameterEntry>,
}

impl ParameterSet {
    pub fn from_pairs<I, N>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (N, ParameterValue)>,
        N: Into<String>,
    {
        Self {
            entries: pairs
                .into_iter()
                .map(|(name, value)| ParameterEntry {
                    name: name.into(),
                    value,
                })
                .collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ParameterValue> {
        self.entries
            .iter()
            .find(|entry| entry.name == name)
            .map(|entry| &entry.value)
    }

    /// Numeric value of a parameter, if present and numeric.
    pub fn get_f64(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(ParameterValue::as_f64)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParameterValue)> {
        self.entries
            .iter()
            .map(|entry| (entry.name.as_str(), &entry.value))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Display for ParameterSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, entry) in self.entries.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}={}", entry.name, entry.value)?;
        }
        Ok(())
    }
}
