// src/blocking/predicates.rs

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::config::DedupeConfig;
use crate::models::Record;

/// Emits zero or more block keys per record. `None` marks a key the
/// predicate could not form (for example a null field); such keys are
/// skipped and counted by the coverage builder.
pub trait PredicateIndex {
    fn name(&self) -> &str;
    fn block_keys(&self, record: &Record) -> Vec<Option<String>>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PredicateKind {
    WholeField,
    FirstNChars { n: usize },
    LastNChars { n: usize },
    Tokens,
    SortedTokens,
}

impl PredicateKind {
    pub fn validate(&self) -> Result<(), String> {
        match self {
            PredicateKind::FirstNChars { n } | PredicateKind::LastNChars { n } if *n == 0 => {
                Err("character predicates need n > 0".to_string())
            }
            _ => Ok(()),
        }
    }

    /// Applies the predicate to a normalized (trimmed, lower-cased) value.
    fn apply(&self, value: &str) -> Vec<String> {
        match self {
            PredicateKind::WholeField => vec![value.to_string()],
            PredicateKind::FirstNChars { n } => vec![value.chars().take(*n).collect()],
            PredicateKind::LastNChars { n } => {
                let count = value.chars().count();
                vec![value.chars().skip(count.saturating_sub(*n)).collect()]
            }
            PredicateKind::Tokens => {
                let tokens: BTreeSet<&str> = value.split_whitespace().collect();
                tokens.into_iter().map(str::to_string).collect()
            }
            PredicateKind::SortedTokens => {
                let mut tokens: Vec<&str> = value.split_whitespace().collect();
                tokens.sort_unstable();
                vec![tokens.join(" ")]
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockingRule {
    pub field: String,
    pub predicate: PredicateKind,
}

/// Predicate index built from configured rules. Keys are `"<value>:<rule>"`
/// so that equal values under different rules land in different blocks.
#[derive(Debug, Clone)]
pub struct StaticPredicateIndex {
    rules: Vec<(usize, PredicateKind)>,
}

impl StaticPredicateIndex {
    /// Resolves rule fields to record positions. Assumes a validated config.
    pub fn from_config(config: &DedupeConfig) -> Self {
        let rules = config
            .blocking
            .iter()
            .filter_map(|rule| {
                config
                    .fields
                    .iter()
                    .position(|f| f.field == rule.field)
                    .map(|pos| (pos, rule.predicate.clone()))
            })
            .collect();
        Self { rules }
    }

    pub fn new(rules: Vec<(usize, PredicateKind)>) -> Self {
        Self { rules }
    }
}

impl PredicateIndex for StaticPredicateIndex {
    fn name(&self) -> &str {
        "static"
    }

    fn block_keys(&self, record: &Record) -> Vec<Option<String>> {
        let mut keys = Vec::new();
        for (rule_idx, (pos, predicate)) in self.rules.iter().enumerate() {
            let normalized = record
                .value(*pos)
                .map(|v| v.trim().to_lowercase())
                .filter(|v| !v.is_empty());
            match normalized {
                Some(value) => keys.extend(
                    predicate
                        .apply(&value)
                        .into_iter()
                        .map(|k| Some(format!("{}:{}", k, rule_idx))),
                ),
                None => keys.push(None),
            }
        }
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(values: &[Option<&str>]) -> Record {
        Record::new(1, values.iter().map(|v| v.map(str::to_string)).collect())
    }

    #[test]
    fn test_whole_field_and_prefix_keys() {
        let index = StaticPredicateIndex::new(vec![
            (0, PredicateKind::WholeField),
            (1, PredicateKind::FirstNChars { n: 3 }),
        ]);
        let keys = index.block_keys(&record(&[Some(" Smith "), Some("19800101")]));
        assert_eq!(keys, vec![Some("smith:0".to_string()), Some("198:1".to_string())]);
    }

    #[test]
    fn test_null_field_yields_null_key() {
        let index = StaticPredicateIndex::new(vec![(0, PredicateKind::WholeField)]);
        assert_eq!(index.block_keys(&record(&[None])), vec![None]);
        assert_eq!(index.block_keys(&record(&[Some("   ")])), vec![None]);
    }

    #[test]
    fn test_token_predicates() {
        let index = StaticPredicateIndex::new(vec![
            (0, PredicateKind::Tokens),
            (0, PredicateKind::SortedTokens),
            (0, PredicateKind::LastNChars { n: 2 }),
        ]);
        let keys: Vec<String> = index
            .block_keys(&record(&[Some("Mary Ann")]))
            .into_iter()
            .flatten()
            .collect();
        assert_eq!(keys, vec!["ann:0", "mary:0", "ann mary:1", "nn:2"]);
    }

    #[test]
    fn test_zero_width_predicate_rejected() {
        assert!(PredicateKind::FirstNChars { n: 0 }.validate().is_err());
        assert!(PredicateKind::Tokens.validate().is_ok());
    }
}
