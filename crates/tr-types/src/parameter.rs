//! Concrete parameter values and parameterizations.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A concrete parameter value produced by a generation strategy or supplied
/// by a caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Int(i64),
    Float(f64),
    Json(serde_json::Value),
}

impl ParameterValue {
    /// Numeric view of the value, if it has one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Int(v) => Some(*v as f64),
            Self::Json(v) => v.as_f64(),
        }
    }
}

impl std::fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Float(v) => write!(f, "{v:?}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Json(v) => write!(f, "{v}"),
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

impl From<&str> for ParameterValue {
    fn from(v: &str) -> Self {
        Self::Json(serde_json::Value::String(v.to_string()))
    }
}

/// A full assignment of values to parameters, keyed by parameter name.
///
/// Ordered by name so that iteration and serialization are stable.
pub type Parameterization = BTreeMap<String, ParameterValue>;

/// Build a [`Parameterization`] from `(name, value)` pairs.
pub fn parameterization<I, K, V>(pairs: I) -> Parameterization
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<ParameterValue>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}
