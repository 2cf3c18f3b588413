//! Traffic routing types
//!
//! Weighted routing rules across deployment variants, and the validation gate
//! every weight set must pass before it reaches the external router.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Allowed absolute deviation when checking that weights sum to 100
pub const WEIGHT_TOLERANCE: f64 = 0.01;

/// Weight assigned to one variant of a project
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantWeight {
    pub variant_id: String,
    pub weight: f64,
    /// Sticky segment matching for A/B variants
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_rule: Option<MatchRule>,
}

impl VariantWeight {
    pub fn new(variant_id: impl Into<String>, weight: f64) -> Self {
        Self {
            variant_id: variant_id.into(),
            weight,
            match_rule: None,
        }
    }
}

/// Header match that pins a request segment to a variant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchRule {
    pub header: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum WeightError {
    #[error("weight set is empty")]
    Empty,
    #[error("weight {weight} for variant '{variant}' is outside [0, 100]")]
    OutOfRange { variant: String, weight: f64 },
    #[error("variant '{0}' appears more than once")]
    DuplicateVariant(String),
    #[error("weights sum to {0}, expected 100")]
    BadSum(f64),
}

/// Validates a full weight set: non-empty, each weight in range, unique
/// variants, and a total of exactly 100 within [`WEIGHT_TOLERANCE`].
pub fn validate_weights(weights: &[VariantWeight]) -> Result<(), WeightError> {
    if weights.is_empty() {
        return Err(WeightError::Empty);
    }

    let mut seen = std::collections::HashSet::new();
    for w in weights {
        if !(0.0..=100.0).contains(&w.weight) {
            return Err(WeightError::OutOfRange {
                variant: w.variant_id.clone(),
                weight: w.weight,
            });
        }
        if !seen.insert(w.variant_id.as_str()) {
            return Err(WeightError::DuplicateVariant(w.variant_id.clone()));
        }
    }

    check_sum(weights.iter().map(|w| w.weight))
}

/// Validates a canary/stable split. This is a hard gate: nothing is clamped.
pub fn validate_split(canary: f64, stable: f64) -> Result<(), WeightError> {
    for (variant, weight) in [("canary", canary), ("stable", stable)] {
        if !(0.0..=100.0).contains(&weight) {
            return Err(WeightError::OutOfRange {
                variant: variant.to_string(),
                weight,
            });
        }
    }
    check_sum([canary, stable])
}

fn check_sum(weights: impl IntoIterator<Item = f64>) -> Result<(), WeightError> {
    let total: f64 = weights.into_iter().sum();
    if (total - 100.0).abs() > WEIGHT_TOLERANCE {
        return Err(WeightError::BadSum(total));
    }
    Ok(())
}

/// Builds the two-variant weight set for a canary rollout
pub fn canary_split(stable_variant: &str, canary_variant: &str, canary: f64) -> Vec<VariantWeight> {
    vec![
        VariantWeight::new(stable_variant, 100.0 - canary),
        VariantWeight::new(canary_variant, canary),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_must_sum_to_100() {
        assert!(validate_split(30.0, 70.0).is_ok());
        assert!(validate_split(33.333, 66.667).is_ok());
        assert_eq!(validate_split(30.0, 60.0), Err(WeightError::BadSum(90.0)));
        assert!(validate_split(60.0, 60.0).is_err());
    }

    #[test]
    fn test_split_rejects_out_of_range() {
        assert!(matches!(
            validate_split(-10.0, 110.0),
            Err(WeightError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_validate_weights() {
        let weights = canary_split("stable", "canary", 10.0);
        assert!(validate_weights(&weights).is_ok());

        assert_eq!(validate_weights(&[]), Err(WeightError::Empty));

        let dup = vec![VariantWeight::new("a", 50.0), VariantWeight::new("a", 50.0)];
        assert_eq!(
            validate_weights(&dup),
            Err(WeightError::DuplicateVariant("a".to_string()))
        );

        let short = vec![VariantWeight::new("a", 50.0), VariantWeight::new("b", 40.0)];
        assert!(matches!(validate_weights(&short), Err(WeightError::BadSum(_))));
    }

    #[test]
    fn test_match_rule_omitted_when_absent() {
        let json = serde_json::to_value(VariantWeight::new("a", 100.0)).unwrap();
        assert!(json.get("match_rule").is_none());
    }
}
