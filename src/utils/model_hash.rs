// src/utils/model_hash.rs

use anyhow::{Context, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::blocking::predicates::BlockingRule;
use crate::config::{DedupeConfig, FieldDefinition};

#[derive(Serialize)]
struct ModelDefinition<'a> {
    fields: &'a [FieldDefinition],
    blocking: &'a [BlockingRule],
    classifier: &'a str,
    hyperparameters: &'a serde_json::Value,
    threshold: f64,
    filter_condition: &'a str,
    merge_exact: &'a [Vec<String>],
}

/// Hex SHA-256 of the canonical JSON form of the model definition.
pub fn model_definition_hash(config: &DedupeConfig) -> Result<String> {
    let definition = ModelDefinition {
        fields: &config.fields,
        blocking: &config.blocking,
        classifier: &config.classifier,
        hyperparameters: &config.hyperparameters,
        threshold: config.threshold,
        filter_condition: &config.filter_condition,
        merge_exact: &config.merge_exact,
    };
    // serde_json::Value objects are key-sorted, so equal definitions encode equally
    let bytes = serde_json::to_vec(&definition).context("Failed to encode model definition")?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(json: serde_json::Value) -> DedupeConfig {
        DedupeConfig::from_json_str(&json.to_string()).unwrap()
    }

    fn base() -> serde_json::Value {
        serde_json::json!({
            "schema": "dedupe",
            "table": "dedupe.entries",
            "key": "entry_id",
            "fields": [{"field": "last_name", "type": "String"}],
            "hyperparameters": {"weights": {"last_name": 2.0}, "a": 1}
        })
    }

    #[test]
    fn test_hash_is_stable_and_hex() {
        let h1 = model_definition_hash(&config(base())).unwrap();
        let h2 = model_definition_hash(&config(base())).unwrap();
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);
        assert!(h1.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_hash_ignores_table_location_but_not_threshold() {
        let base_hash = model_definition_hash(&config(base())).unwrap();

        let mut moved = base();
        moved["schema"] = serde_json::json!("other");
        assert_eq!(model_definition_hash(&config(moved)).unwrap(), base_hash);

        let mut stricter = base();
        stricter["threshold"] = serde_json::json!(0.9);
        assert_ne!(model_definition_hash(&config(stricter)).unwrap(), base_hash);
    }
}
