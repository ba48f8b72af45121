use crate::core::types::DType;
use crate::equalize::PairOrder;
use crate::error::{Error, Result};
use crate::quantization::qtype::QScheme;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A format pinned on a node output regardless of its statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForcedFormat {
    pub dtype: DType,
    pub min: f64,
    pub max: f64,
    #[serde(default)]
    pub asymmetric: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuantizationConfig {
    pub scheme: QScheme,
    pub default_dtype: DType,
    /// Run cross-layer equalization before quantizing.
    pub equalize: bool,
    pub equalization_threshold: f64,
    pub pair_order: PairOrder,
    /// Handler options applied to every node.
    pub options: BTreeMap<String, bool>,
    /// Per-node handler options, overriding `options`.
    pub node_options: BTreeMap<String, BTreeMap<String, bool>>,
    pub forced_outputs: BTreeMap<String, ForcedFormat>,
}

impl Default for QuantizationConfig {
    fn default() -> Self {
        Self {
            scheme: QScheme::Scaled,
            default_dtype: DType::Int8,
            equalize: false,
            equalization_threshold: 0.01,
            pair_order: PairOrder::Reverse,
            options: BTreeMap::new(),
            node_options: BTreeMap::new(),
            forced_outputs: BTreeMap::new(),
        }
    }
}

impl QuantizationConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        if !(config.equalization_threshold >= 0.0) {
            return Err(Error::InvalidThreshold { threshold: config.equalization_threshold });
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_defaults() {
        let config = QuantizationConfig::from_json(r#"{"scheme": "pow2", "options": {"allow_asymmetric": true}}"#).unwrap();
        assert_eq!(config.scheme, QScheme::Pow2);
        assert_eq!(config.default_dtype, DType::Int8);
        assert_eq!(config.equalization_threshold, 0.01);
        assert_eq!(config.options.get("allow_asymmetric"), Some(&true));
    }

    #[test]
    fn negative_threshold_is_rejected_on_load() {
        let err = QuantizationConfig::from_json(r#"{"equalization_threshold": -0.5}"#).unwrap_err();
        assert!(matches!(err, Error::InvalidThreshold { threshold } if threshold == -0.5));
    }

    #[test]
    fn malformed_config_is_a_config_error() {
        let err = QuantizationConfig::from_json(r#"{"scheme": "float"}"#).unwrap_err();
        assert!(matches!(err, crate::error::Error::Config(_)));
    }
}
