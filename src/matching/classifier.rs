// src/matching/classifier.rs

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};

use crate::config::{FieldDefinition, FieldType};
use crate::error::DedupeError;
use crate::models::Record;

/// Scores candidate record pairs. Scores are match confidences in `[0, 1]`,
/// one per input pair and in input order.
pub trait PairwiseClassifier: Send + Sync {
    fn name(&self) -> &str;
    fn score_pairs(&self, pairs: &[(&Record, &Record)]) -> Result<Vec<f64>>;
}

pub type ClassifierFactory =
    Box<dyn Fn(&serde_json::Value, &[FieldDefinition]) -> Result<Box<dyn PairwiseClassifier>> + Send + Sync>;

/// Name → factory map. Built-ins are registered by [`ClassifierRegistry::with_builtins`].
pub struct ClassifierRegistry {
    factories: BTreeMap<String, ClassifierFactory>,
}

impl Default for ClassifierRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl ClassifierRegistry {
    pub fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register(WEIGHTED_JARO_WINKLER, |hyper, fields| {
            Ok(Box::new(WeightedJaroWinkler::new(hyper, fields)?))
        });
        registry.register(EXACT_AGREEMENT, |hyper, fields| {
            Ok(Box::new(ExactAgreement::new(hyper, fields)?))
        });
        registry
    }

    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&serde_json::Value, &[FieldDefinition]) -> Result<Box<dyn PairwiseClassifier>>
            + Send
            + Sync
            + 'static,
    {
        self.factories.insert(name.to_string(), Box::new(factory));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    /// Instantiates `name`. Bad hyperparameters surface as configuration errors.
    pub fn build(
        &self,
        name: &str,
        hyperparameters: &serde_json::Value,
        fields: &[FieldDefinition],
    ) -> Result<Box<dyn PairwiseClassifier>> {
        let factory = self.factories.get(name).ok_or_else(|| {
            DedupeError::config(format!("unknown classifier '{}', available: {:?}", name, self.names()))
        })?;
        factory(hyperparameters, fields)
            .map_err(|e| DedupeError::config(format!("classifier '{}': {:#}", name, e)).into())
    }
}

pub const WEIGHTED_JARO_WINKLER: &str = "weighted_jaro_winkler";
pub const EXACT_AGREEMENT: &str = "exact_agreement";

fn normalize(value: Option<&str>) -> Option<String> {
    value
        .map(|v| v.trim().to_lowercase())
        .filter(|v| !v.is_empty())
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct WeightedHyperparameters {
    #[serde(default)]
    weights: HashMap<String, f64>,
}

/// Weighted mean of per-field similarities over the fields present on both
/// sides. Fuzzy string fields use Jaro-Winkler, all others exact equality.
#[derive(Debug, Clone)]
pub struct WeightedJaroWinkler {
    fields: Vec<(FieldType, f64)>,
}

impl WeightedJaroWinkler {
    pub fn new(hyperparameters: &serde_json::Value, fields: &[FieldDefinition]) -> Result<Self> {
        let params: WeightedHyperparameters = serde_json::from_value(hyperparameters.clone())
            .context("expected {\"weights\": {<field>: <weight>}}")?;
        for (field, weight) in &params.weights {
            if !fields.iter().any(|f| &f.field == field) {
                bail!("weight given for unknown field '{}'", field);
            }
            if !weight.is_finite() || *weight < 0.0 {
                bail!("weight for '{}' must be a non-negative number", field);
            }
        }
        Ok(Self {
            fields: fields
                .iter()
                .map(|f| (f.field_type, params.weights.get(&f.field).copied().unwrap_or(1.0)))
                .collect(),
        })
    }

    fn score(&self, a: &Record, b: &Record) -> f64 {
        let mut total = 0.0;
        let mut weight_sum = 0.0;
        for (idx, (field_type, weight)) in self.fields.iter().enumerate() {
            if *weight == 0.0 {
                continue;
            }
            let (Some(va), Some(vb)) = (normalize(a.value(idx)), normalize(b.value(idx))) else {
                continue;
            };
            let similarity = if field_type.is_fuzzy() {
                strsim::jaro_winkler(&va, &vb)
            } else if va == vb {
                1.0
            } else {
                0.0
            };
            total += weight * similarity;
            weight_sum += weight;
        }
        if weight_sum == 0.0 {
            0.0
        } else {
            total / weight_sum
        }
    }
}

impl PairwiseClassifier for WeightedJaroWinkler {
    fn name(&self) -> &str {
        WEIGHTED_JARO_WINKLER
    }

    fn score_pairs(&self, pairs: &[(&Record, &Record)]) -> Result<Vec<f64>> {
        Ok(pairs.iter().map(|(a, b)| self.score(a, b)).collect())
    }
}

/// Fraction of fields present on both sides whose values are equal.
#[derive(Debug, Clone)]
pub struct ExactAgreement {
    field_count: usize,
}

impl ExactAgreement {
    pub fn new(hyperparameters: &serde_json::Value, fields: &[FieldDefinition]) -> Result<Self> {
        match hyperparameters {
            serde_json::Value::Object(map) if map.is_empty() => {}
            serde_json::Value::Null => {}
            other => bail!("takes no hyperparameters, got {}", other),
        }
        Ok(Self {
            field_count: fields.len(),
        })
    }
}

impl PairwiseClassifier for ExactAgreement {
    fn name(&self) -> &str {
        EXACT_AGREEMENT
    }

    fn score_pairs(&self, pairs: &[(&Record, &Record)]) -> Result<Vec<f64>> {
        Ok(pairs
            .iter()
            .map(|(a, b)| {
                let mut present = 0usize;
                let mut equal = 0usize;
                for idx in 0..self.field_count {
                    if let (Some(va), Some(vb)) = (normalize(a.value(idx)), normalize(b.value(idx))) {
                        present += 1;
                        if va == vb {
                            equal += 1;
                        }
                    }
                }
                if present == 0 {
                    0.0
                } else {
                    equal as f64 / present as f64
                }
            })
            .collect())
    }
}
