//! Load-balance weight annotation
//!
//! ```text
//! bfe.ingress.kubernetes.io/balance.weight: '{"service": {"service-a": 30, "service-b": 70}}'
//! ```
//!
//! The outer key is the Service named by the Ingress backend; the inner map
//! lists the Services that actually receive the traffic and their raw weights.

use super::Annotations;
use crate::error::{CompilerError, Result};
use std::collections::BTreeMap;

pub const WEIGHT: &str = "balance.weight";

/// Backend service -> sub-backend service -> raw weight
pub type Balance = BTreeMap<String, BTreeMap<String, i64>>;

pub fn parse_balance(annotations: &Annotations<'_>) -> Result<Balance> {
    let Some(raw) = annotations.get(WEIGHT) else {
        return Ok(Balance::new());
    };

    let balance: Balance = serde_json::from_str(raw).map_err(|e| {
        CompilerError::validation(format!(
            "annotation {} is illegal, error: {}",
            annotations.key(WEIGHT),
            e
        ))
    })?;

    for (service, weights) in &balance {
        check_weights(service, weights)?;
    }
    Ok(balance)
}

/// Weights must be non-negative with a positive sum
pub fn check_weights(service: &str, weights: &BTreeMap<String, i64>) -> Result<()> {
    if let Some((name, weight)) = weights.iter().find(|(_, w)| **w < 0) {
        return Err(CompilerError::validation(format!(
            "weight of load balance service {}/{} should >= 0, got {}",
            service, name, weight
        )));
    }

    let sum: i128 = weights.values().map(|w| *w as i128).sum();
    if sum == 0 {
        return Err(CompilerError::validation(format!(
            "sum of all load balance weights of service {} should > 0",
            service
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::annotations::DEFAULT_ANNOTATION_PREFIX;

    fn balance(value: &str) -> Result<Balance> {
        let mut map = BTreeMap::new();
        map.insert(
            format!("{}{}", DEFAULT_ANNOTATION_PREFIX, WEIGHT),
            value.to_string(),
        );
        parse_balance(&Annotations::new(&map, DEFAULT_ANNOTATION_PREFIX))
    }

    #[test]
    fn test_parse_weights() {
        let lb = balance(r#"{"web": {"web-v1": 80, "web-v2": 20}}"#).unwrap();
        assert_eq!(lb["web"]["web-v1"], 80);
        assert_eq!(lb["web"]["web-v2"], 20);
    }

    #[test]
    fn test_zero_weight_is_legal() {
        let lb = balance(r#"{"web": {"web-v1": 100, "web-v2": 0}}"#).unwrap();
        assert_eq!(lb["web"]["web-v2"], 0);
    }

    #[test]
    fn test_negative_weight_rejected() {
        let err = balance(r#"{"web": {"web-v1": 100, "web-v2": -1}}"#).unwrap_err();
        assert!(err.to_string().contains("should >= 0"));
    }

    #[test]
    fn test_all_zero_rejected() {
        let err = balance(r#"{"web": {"web-v1": 0, "web-v2": 0}}"#).unwrap_err();
        assert!(err.to_string().contains("should > 0"));
    }

    #[test]
    fn test_weights_near_i64_max_accepted() {
        let lb = balance(r#"{"web": {"v1": 9223372036854775807, "v2": 1}}"#).unwrap();
        assert_eq!(lb["web"]["v1"], i64::MAX);
        assert!(check_weights("web", &lb["web"]).is_ok());
    }

    #[test]
    fn test_invalid_json_rejected() {
        assert!(balance(r#"{"web": ["web-v1"]}"#).is_err());
        assert!(balance("not json").is_err());
    }
}
