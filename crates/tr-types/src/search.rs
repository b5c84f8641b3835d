//! Search space definitions and parameterization validation.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::errors::{TrellisError, TrellisResult};
use crate::invalid_parameterization;
use crate::parameter::{ParameterValue, Parameterization};

/// A single parameter dimension in the search space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    /// Parameter name, unique within a search space (e.g. "lr").
    pub name: String,
    /// The kind of search range.
    pub kind: ParameterKind,
}

/// Describes the domain of a parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParameterKind {
    /// Continuous range [low, high], optionally searched in log-space.
    Range { low: f64, high: f64, log_scale: bool },
    /// Integer range [low, high] inclusive.
    IntRange { low: i64, high: i64 },
    /// Categorical choices.
    Choice { values: Vec<serde_json::Value> },
}

impl ParameterSpec {
    pub fn float(name: impl Into<String>, low: f64, high: f64) -> Self {
        Self {
            name: name.into(),
            kind: ParameterKind::Range {
                low,
                high,
                log_scale: false,
            },
        }
    }

    pub fn log_float(name: impl Into<String>, low: f64, high: f64) -> Self {
        Self {
            name: name.into(),
            kind: ParameterKind::Range {
                low,
                high,
                log_scale: true,
            },
        }
    }

    pub fn int(name: impl Into<String>, low: i64, high: i64) -> Self {
        Self {
            name: name.into(),
            kind: ParameterKind::IntRange { low, high },
        }
    }

    pub fn choice(name: impl Into<String>, values: Vec<serde_json::Value>) -> Self {
        Self {
            name: name.into(),
            kind: ParameterKind::Choice { values },
        }
    }

    fn check_bounds(&self) -> TrellisResult<()> {
        let invalid = |message: String| TrellisError::InvalidBounds {
            name: self.name.clone(),
            message,
        };
        match &self.kind {
            ParameterKind::Range {
                low,
                high,
                log_scale,
            } => {
                if !low.is_finite() || !high.is_finite() {
                    return Err(invalid(format!("bounds must be finite, got [{low}, {high}]")));
                }
                if low >= high {
                    return Err(invalid(format!("low {low} must be below high {high}")));
                }
                if *log_scale && *low <= 0.0 {
                    return Err(invalid(format!("log-scale range needs low > 0, got {low}")));
                }
            }
            ParameterKind::IntRange { low, high } => {
                if low >= high {
                    return Err(invalid(format!("low {low} must be below high {high}")));
                }
            }
            ParameterKind::Choice { values } => {
                if values.is_empty() {
                    return Err(invalid("choice set is empty".to_string()));
                }
            }
        }
        Ok(())
    }

    fn check_value(&self, value: &ParameterValue) -> TrellisResult<()> {
        match (&self.kind, value) {
            (ParameterKind::Range { low, high, .. }, ParameterValue::Float(_) | ParameterValue::Int(_)) => {
                let v = value.as_f64().unwrap_or(f64::NAN);
                if !v.is_finite() || v < *low || v > *high {
                    return Err(invalid_parameterization!(
                        "{} = {v} outside [{low}, {high}]",
                        self.name
                    ));
                }
            }
            (ParameterKind::IntRange { low, high }, ParameterValue::Int(v)) => {
                if v < low || v > high {
                    return Err(invalid_parameterization!(
                        "{} = {v} outside [{low}, {high}]",
                        self.name
                    ));
                }
            }
            // JSON callers may send `2.0` for an integer parameter.
            (ParameterKind::IntRange { low, high }, ParameterValue::Float(v)) if v.fract() == 0.0 => {
                if *v < *low as f64 || *v > *high as f64 {
                    return Err(invalid_parameterization!(
                        "{} = {v:?} outside [{low}, {high}]",
                        self.name
                    ));
                }
            }
            (ParameterKind::Choice { values }, value) => {
                if choice_index(values, value).is_none() {
                    return Err(invalid_parameterization!(
                        "{} = {value} is not an allowed choice",
                        self.name
                    ));
                }
            }
            (kind, value) => {
                return Err(invalid_parameterization!(
                    "{} = {value} has the wrong type for {kind:?}",
                    self.name
                ));
            }
        }
        Ok(())
    }
}

fn to_json(value: &ParameterValue) -> serde_json::Value {
    match value {
        ParameterValue::Int(v) => serde_json::Value::from(*v),
        ParameterValue::Float(v) => serde_json::Number::from_f64(*v)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        ParameterValue::Json(v) => v.clone(),
    }
}

/// Number of values in `[low, high]`, without overflowing for extreme bounds.
fn int_span(low: i64, high: i64) -> f64 {
    (high as i128 - low as i128 + 1) as f64
}

fn choice_index(values: &[serde_json::Value], value: &ParameterValue) -> Option<usize> {
    let needle = to_json(value);
    values.iter().position(|v| *v == needle)
}

/// Objective metadata attached to a search space.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Objective {
    pub name: String,
    pub minimize: bool,
}

impl Objective {
    pub fn minimize(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            minimize: true,
        }
    }

    pub fn maximize(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            minimize: false,
        }
    }

    /// Whether `candidate` is strictly better than `incumbent`.
    pub fn improves(&self, candidate: f64, incumbent: f64) -> bool {
        if self.minimize {
            candidate < incumbent
        } else {
            candidate > incumbent
        }
    }
}

/// Number of parameters of each kind in a search space.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimensionCounts {
    pub continuous: usize,
    pub discrete: usize,
    pub choice: usize,
}

/// The full search space: an ordered list of validated parameter
/// definitions plus the objective being optimized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchSpace {
    parameters: Vec<ParameterSpec>,
    objective: Objective,
}

impl SearchSpace {
    /// Validate parameter specs and build a search space.
    pub fn new(parameters: Vec<ParameterSpec>, objective: Objective) -> TrellisResult<Self> {
        let mut seen = HashSet::new();
        for spec in &parameters {
            if !seen.insert(spec.name.as_str()) {
                return Err(TrellisError::DuplicateParameterName {
                    name: spec.name.clone(),
                });
            }
            spec.check_bounds()?;
        }
        Ok(Self {
            parameters,
            objective,
        })
    }

    pub fn builder(objective: Objective) -> SearchSpaceBuilder {
        SearchSpaceBuilder {
            parameters: Vec::new(),
            objective,
        }
    }

    pub fn parameters(&self) -> &[ParameterSpec] {
        &self.parameters
    }

    pub fn objective(&self) -> &Objective {
        &self.objective
    }

    pub fn len(&self) -> usize {
        self.parameters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }

    pub fn dimension_counts(&self) -> DimensionCounts {
        let mut counts = DimensionCounts::default();
        for spec in &self.parameters {
            match spec.kind {
                ParameterKind::Range { .. } => counts.continuous += 1,
                ParameterKind::IntRange { .. } => counts.discrete += 1,
                ParameterKind::Choice { .. } => counts.choice += 1,
            }
        }
        counts
    }

    /// Check that `params` assigns an in-domain value to every declared
    /// parameter and nothing else.
    pub fn validate(&self, params: &Parameterization) -> TrellisResult<()> {
        for spec in &self.parameters {
            let value = params
                .get(&spec.name)
                .ok_or_else(|| invalid_parameterization!("missing parameter {}", spec.name))?;
            spec.check_value(value)?;
        }
        if let Some(extra) = params
            .keys()
            .find(|k| !self.parameters.iter().any(|p| &p.name == *k))
        {
            return Err(invalid_parameterization!("unknown parameter {extra}"));
        }
        Ok(())
    }

    /// Map a valid parameterization into the unit hypercube, one coordinate
    /// per parameter in declaration order.
    pub fn to_unit(&self, params: &Parameterization) -> TrellisResult<Vec<f64>> {
        self.parameters
            .iter()
            .map(|spec| {
                let value = params
                    .get(&spec.name)
                    .ok_or_else(|| invalid_parameterization!("missing parameter {}", spec.name))?;
                let u = match &spec.kind {
                    ParameterKind::Range {
                        low,
                        high,
                        log_scale,
                    } => {
                        let v = value.as_f64().ok_or_else(|| {
                            invalid_parameterization!("{} = {value} is not numeric", spec.name)
                        })?;
                        if *log_scale {
                            (v.ln() - low.ln()) / (high.ln() - low.ln())
                        } else {
                            (v - low) / (high - low)
                        }
                    }
                    ParameterKind::IntRange { low, high } => {
                        let v = value.as_f64().ok_or_else(|| {
                            invalid_parameterization!("{} = {value} is not numeric", spec.name)
                        })?;
                        (v - *low as f64 + 0.5) / int_span(*low, *high)
                    }
                    ParameterKind::Choice { values } => {
                        let idx = choice_index(values, value).ok_or_else(|| {
                            invalid_parameterization!("{} = {value} is not an allowed choice", spec.name)
                        })?;
                        (idx as f64 + 0.5) / values.len() as f64
                    }
                };
                Ok(u.clamp(0.0, 1.0))
            })
            .collect()
    }

    /// Map a point of the unit hypercube back to a parameterization.
    /// Coordinates are clamped to [0, 1]; the result always validates.
    pub fn from_unit(&self, point: &[f64]) -> Parameterization {
        self.parameters
            .iter()
            .zip(point.iter().chain(std::iter::repeat(&0.5)))
            .map(|(spec, &u)| {
                let u = if u.is_finite() { u.clamp(0.0, 1.0) } else { 0.5 };
                let value = match &spec.kind {
                    ParameterKind::Range {
                        low,
                        high,
                        log_scale,
                    } => {
                        let v = if *log_scale {
                            (low.ln() + u * (high.ln() - low.ln())).exp()
                        } else {
                            low + u * (high - low)
                        };
                        ParameterValue::Float(v.clamp(*low, *high))
                    }
                    ParameterKind::IntRange { low, high } => {
                        let k = (u * int_span(*low, *high)).floor() as i128;
                        ParameterValue::Int((*low as i128 + k).min(*high as i128) as i64)
                    }
                    ParameterKind::Choice { values } => {
                        let idx = ((u * values.len() as f64).floor() as usize).min(values.len() - 1);
                        ParameterValue::Json(values[idx].clone())
                    }
                };
                (spec.name.clone(), value)
            })
            .collect()
    }
}

/// Incremental construction of a [`SearchSpace`]; validation happens in
/// [`SearchSpaceBuilder::build`].
#[derive(Debug, Clone)]
pub struct SearchSpaceBuilder {
    parameters: Vec<ParameterSpec>,
    objective: Objective,
}

impl SearchSpaceBuilder {
    pub fn add(mut self, spec: ParameterSpec) -> Self {
        self.parameters.push(spec);
        self
    }

    pub fn add_float(self, name: impl Into<String>, low: f64, high: f64) -> Self {
        self.add(ParameterSpec::float(name, low, high))
    }

    pub fn add_log_float(self, name: impl Into<String>, low: f64, high: f64) -> Self {
        self.add(ParameterSpec::log_float(name, low, high))
    }

    pub fn add_int(self, name: impl Into<String>, low: i64, high: i64) -> Self {
        self.add(ParameterSpec::int(name, low, high))
    }

    pub fn add_choice(self, name: impl Into<String>, values: Vec<serde_json::Value>) -> Self {
        self.add(ParameterSpec::choice(name, values))
    }

    pub fn build(self) -> TrellisResult<SearchSpace> {
        SearchSpace::new(self.parameters, self.objective)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parameter::parameterization;
    use serde_json::json;

    fn sample_space() -> SearchSpace {
        SearchSpace::builder(Objective::maximize("accuracy"))
            .add_log_float("lr", 1e-6, 0.4)
            .add_float("momentum", 0.0, 1.0)
            .add_int("layers", 1, 4)
            .add_choice("optimizer", vec![json!("sgd"), json!("adam")])
            .build()
            .unwrap()
    }

    fn valid_params() -> Parameterization {
        parameterization([
            ("lr", ParameterValue::Float(0.01)),
            ("momentum", ParameterValue::Float(0.9)),
            ("layers", ParameterValue::Int(2)),
            ("optimizer", ParameterValue::from("adam")),
        ])
    }

    #[test]
    fn duplicate_names_rejected() {
        let err = SearchSpace::builder(Objective::minimize("loss"))
            .add_float("x", 0.0, 1.0)
            .add_int("x", 0, 3)
            .build()
            .unwrap_err();
        assert!(matches!(err, TrellisError::DuplicateParameterName { name } if name == "x"));
    }

    #[test]
    fn malformed_bounds_rejected() {
        let inverted = SearchSpace::builder(Objective::minimize("loss"))
            .add_float("x", 1.0, 1.0)
            .build();
        assert!(matches!(inverted, Err(TrellisError::InvalidBounds { .. })));

        let log_at_zero = SearchSpace::builder(Objective::minimize("loss"))
            .add_log_float("lr", 0.0, 1.0)
            .build();
        assert!(matches!(log_at_zero, Err(TrellisError::InvalidBounds { .. })));

        let empty_choice = SearchSpace::builder(Objective::minimize("loss"))
            .add_choice("c", vec![])
            .build();
        assert!(matches!(empty_choice, Err(TrellisError::InvalidBounds { .. })));
    }

    #[test]
    fn validate_accepts_in_domain_values() {
        let space = sample_space();
        space.validate(&valid_params()).unwrap();

        // Integers widen into continuous ranges.
        let mut params = valid_params();
        params.insert("momentum".into(), ParameterValue::Int(1));
        space.validate(&params).unwrap();
    }

    #[test]
    fn validate_rejects_bad_parameterizations() {
        let space = sample_space();

        let mut missing = valid_params();
        missing.remove("layers");
        assert!(space.validate(&missing).is_err());

        let mut extra = valid_params();
        extra.insert("dropout".into(), ParameterValue::Float(0.1));
        let err = space.validate(&extra).unwrap_err();
        assert!(err.to_string().contains("unknown parameter dropout"));

        let mut out_of_bounds = valid_params();
        out_of_bounds.insert("lr".into(), ParameterValue::Float(0.5));
        assert!(space.validate(&out_of_bounds).is_err());

        let mut wrong_type = valid_params();
        wrong_type.insert("layers".into(), ParameterValue::Float(2.5));
        assert!(space.validate(&wrong_type).is_err());

        let mut bad_choice = valid_params();
        bad_choice.insert("optimizer".into(), ParameterValue::from("rmsprop"));
        assert!(space.validate(&bad_choice).is_err());
    }

    #[test]
    fn integral_floats_accepted_for_int_parameters() {
        let space = sample_space();

        let mut whole = valid_params();
        whole.insert("layers".into(), ParameterValue::Float(2.0));
        space.validate(&whole).unwrap();

        let mut too_large = valid_params();
        too_large.insert("layers".into(), ParameterValue::Float(9.0));
        let err = space.validate(&too_large).unwrap_err();
        assert!(err.to_string().contains("layers = 9.0 outside [1, 4]"));

        let mut not_a_number = valid_params();
        not_a_number.insert("layers".into(), ParameterValue::Float(f64::NAN));
        assert!(space.validate(&not_a_number).is_err());
    }

    #[test]
    fn full_width_int_range_maps_without_overflow() {
        let space = SearchSpace::builder(Objective::minimize("loss"))
            .add_int("n", i64::MIN, i64::MAX)
            .build()
            .unwrap();
        for u in [0.0, 0.5, 1.0] {
            let params = space.from_unit(&[u]);
            space.validate(&params).unwrap();
            let unit = space.to_unit(&params).unwrap();
            assert!(unit[0].is_finite() && (0.0..=1.0).contains(&unit[0]));
        }
        assert_eq!(space.from_unit(&[0.0])["n"], ParameterValue::Int(i64::MIN));
        assert_eq!(space.from_unit(&[1.0])["n"], ParameterValue::Int(i64::MAX));
    }

    #[test]
    fn unit_mapping_stays_in_domain() {
        let space = sample_space();
        for corner in [0.0, 0.25, 0.5, 0.999, 1.0, 1.5, -0.2] {
            let params = space.from_unit(&[corner; 4]);
            space.validate(&params).unwrap();
        }
    }

    #[test]
    fn unit_mapping_inverts_for_continuous() {
        let space = sample_space();
        let params = valid_params();
        let unit = space.to_unit(&params).unwrap();
        assert_eq!(unit.len(), 4);
        let back = space.from_unit(&unit);
        let lr = back["lr"].as_f64().unwrap();
        assert!((lr - 0.01).abs() < 1e-9);
        assert_eq!(back["layers"], ParameterValue::Int(2));
        assert_eq!(back["optimizer"], ParameterValue::from("adam"));
    }

    #[test]
    fn dimension_counts() {
        let counts = sample_space().dimension_counts();
        assert_eq!(counts.continuous, 2);
        assert_eq!(counts.discrete, 1);
        assert_eq!(counts.choice, 1);
    }

    #[test]
    fn objective_direction() {
        assert!(Objective::minimize("loss").improves(0.1, 0.2));
        assert!(Objective::maximize("acc").improves(0.9, 0.8));
        assert!(!Objective::maximize("acc").improves(0.8, 0.8));
    }
}
