// src/config.rs

use anyhow::{Context, Result};
use log::{debug, info};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

use crate::blocking::predicates::{BlockingRule, PredicateKind};
use crate::error::DedupeError;
use crate::matching::classifier::ClassifierRegistry;

pub const DEFAULT_THRESHOLD: f64 = 0.5;
pub const DEFAULT_FILTER_CONDITION: &str = "1=1";
pub const DEFAULT_CLASSIFIER: &str = "weighted_jaro_winkler";
pub const DEFAULT_PROGRESS_EVERY: usize = 10_000;

static IDENTIFIER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid identifier regex"));
static QUALIFIED_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)?$")
        .expect("valid qualified identifier regex")
});

/// Column names the derived tables use for their own bookkeeping.
fn is_reserved(name: &str) -> bool {
    name.starts_with('_') || matches!(name, "src_ids" | "dedupe_id" | "canon_id")
}

/// How a comparison field is compared by the built-in classifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldType {
    String,
    ShortString,
    Text,
    Exact,
    Categorical,
    Date,
    DateTime,
    Price,
    Set,
}

impl FieldType {
    /// Fuzzy string types are compared with Jaro-Winkler, the rest by equality.
    pub fn is_fuzzy(&self) -> bool {
        matches!(self, FieldType::String | FieldType::ShortString | FieldType::Text)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDefinition {
    pub field: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub has_missing: bool,
}

/// `merge_exact` accepts either one flat list of columns or a list of lists.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum MergeExactInput {
    Nested(Vec<Vec<String>>),
    Flat(Vec<String>),
}

impl MergeExactInput {
    fn into_subsets(self) -> Vec<Vec<String>> {
        match self {
            MergeExactInput::Nested(subsets) => subsets,
            MergeExactInput::Flat(cols) if cols.is_empty() => Vec::new(),
            MergeExactInput::Flat(cols) => vec![cols],
        }
    }
}

/// Shape of the JSON file before defaults are applied.
#[derive(Debug, Deserialize)]
struct RawConfig {
    schema: Option<String>,
    table: Option<String>,
    key: Option<String>,
    fields: Option<Vec<FieldDefinition>>,
    threshold: Option<f64>,
    merge_exact: Option<MergeExactInput>,
    source_columns: Option<Vec<String>>,
    filter_condition: Option<String>,
    classifier: Option<String>,
    hyperparameters: Option<serde_json::Value>,
    blocking: Option<Vec<BlockingRule>>,
    progress_every: Option<usize>,
}

/// Where an exact-merge subset is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeLevel {
    /// All columns are comparison fields: merge on `map` over `entries_unique`.
    Unique,
    /// At least one raw source column: merge on `unique_map` over the source table.
    Source,
}

#[derive(Debug, Clone, Serialize)]
pub struct DedupeConfig {
    pub schema: String,
    pub table: String,
    pub key: String,
    pub fields: Vec<FieldDefinition>,
    pub threshold: f64,
    pub merge_exact: Vec<Vec<String>>,
    pub source_columns: Vec<String>,
    pub filter_condition: String,
    pub classifier: String,
    pub hyperparameters: serde_json::Value,
    pub blocking: Vec<BlockingRule>,
    pub progress_every: usize,
}

impl DedupeConfig {
    /// Reads a JSON or YAML configuration file and applies defaults. Call
    /// [`DedupeConfig::validate`] before using the result.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("Loading run configuration from {}", path.display());
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
            .unwrap_or_default();
        let contents = || {
            std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))
        };
        match ext.as_str() {
            "json" => Self::from_json_str(&contents()?),
            "yaml" | "yml" => Self::from_yaml_str(&contents()?),
            _ => Err(DedupeError::config(format!(
                "unknown configuration filetype '{}', expected .json, .yaml or .yml",
                ext
            ))
            .into()),
        }
    }

    pub fn from_json_str(contents: &str) -> Result<Self> {
        let raw: RawConfig = serde_json::from_str(contents)
            .map_err(|e| DedupeError::config(format!("malformed configuration: {}", e)))?;
        Self::from_raw(raw)
    }

    pub fn from_yaml_str(contents: &str) -> Result<Self> {
        let raw: RawConfig = serde_yaml::from_str(contents)
            .map_err(|e| DedupeError::config(format!("malformed configuration: {}", e)))?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawConfig) -> Result<Self> {
        fn required<T>(value: Option<T>, key: &str) -> Result<T> {
            value.ok_or_else(|| {
                DedupeError::config(format!("Key {} must be defined in the config file", key))
                    .into()
            })
        }

        let fields = required(raw.fields, "fields")?;
        let blocking = raw.blocking.unwrap_or_else(|| {
            fields
                .iter()
                .map(|f| BlockingRule {
                    field: f.field.clone(),
                    predicate: PredicateKind::WholeField,
                })
                .collect()
        });

        Ok(Self {
            schema: required(raw.schema, "schema")?,
            table: required(raw.table, "table")?,
            key: required(raw.key, "key")?,
            fields,
            threshold: raw.threshold.unwrap_or(DEFAULT_THRESHOLD),
            merge_exact: raw.merge_exact.map(|m| m.into_subsets()).unwrap_or_default(),
            source_columns: raw.source_columns.unwrap_or_default(),
            filter_condition: raw
                .filter_condition
                .unwrap_or_else(|| DEFAULT_FILTER_CONDITION.to_string()),
            classifier: raw.classifier.unwrap_or_else(|| DEFAULT_CLASSIFIER.to_string()),
            hyperparameters: raw
                .hyperparameters
                .unwrap_or_else(|| serde_json::Value::Object(Default::default())),
            blocking,
            progress_every: raw.progress_every.unwrap_or(DEFAULT_PROGRESS_EVERY),
        })
    }

    /// Checks everything that can be checked without a database connection.
    pub fn validate(&self, registry: &ClassifierRegistry) -> Result<()> {
        let invalid = |msg: String| -> anyhow::Error { DedupeError::config(msg).into() };

        if !IDENTIFIER_RE.is_match(&self.schema) {
            return Err(invalid(format!("schema '{}' is not a valid identifier", self.schema)));
        }
        if !QUALIFIED_RE.is_match(&self.table) {
            return Err(invalid(format!("table '{}' is not a valid identifier", self.table)));
        }
        if !IDENTIFIER_RE.is_match(&self.key) {
            return Err(invalid(format!("key '{}' is not a valid identifier", self.key)));
        }
        if self.fields.is_empty() {
            return Err(invalid("at least one comparison field is required".to_string()));
        }

        let mut seen = HashSet::new();
        for f in &self.fields {
            if !IDENTIFIER_RE.is_match(&f.field) {
                return Err(invalid(format!("field '{}' is not a valid identifier", f.field)));
            }
            if is_reserved(&f.field) {
                return Err(invalid(format!("field name '{}' is reserved", f.field)));
            }
            if !seen.insert(f.field.as_str()) {
                return Err(invalid(format!("field '{}' is declared twice", f.field)));
            }
        }
        let mut seen_source = HashSet::new();
        for col in &self.source_columns {
            if !IDENTIFIER_RE.is_match(col) {
                return Err(invalid(format!("source column '{}' is not a valid identifier", col)));
            }
            if is_reserved(col) || *col == self.key {
                return Err(invalid(format!("source column name '{}' is reserved", col)));
            }
            if self.is_field(col) {
                return Err(invalid(format!(
                    "source column '{}' is already a comparison field",
                    col
                )));
            }
            if !seen_source.insert(col.as_str()) {
                return Err(invalid(format!("source column '{}' is declared twice", col)));
            }
        }

        if !(0.0..=1.0).contains(&self.threshold) {
            return Err(invalid(format!(
                "threshold must be within [0, 1], got {}",
                self.threshold
            )));
        }
        if self.progress_every == 0 {
            return Err(invalid("progress_every must be positive".to_string()));
        }

        for subset in &self.merge_exact {
            if subset.is_empty() {
                return Err(invalid("merge_exact subsets must not be empty".to_string()));
            }
            let distinct: HashSet<&String> = subset.iter().collect();
            if distinct.len() != subset.len() {
                return Err(invalid(format!("merge_exact subset {:?} repeats a column", subset)));
            }
            for col in subset {
                if !self.is_field(col) && !self.source_columns.contains(col) {
                    return Err(invalid(format!(
                        "merge_exact column '{}' is neither a comparison field nor a declared source column",
                        col
                    )));
                }
            }
        }

        for rule in &self.blocking {
            if !self.is_field(&rule.field) {
                return Err(invalid(format!(
                    "blocking rule references unknown field '{}'",
                    rule.field
                )));
            }
            rule.predicate.validate().map_err(invalid)?;
        }
        if self.blocking.is_empty() {
            return Err(invalid("at least one blocking rule is required".to_string()));
        }

        if !registry.contains(&self.classifier) {
            return Err(invalid(format!(
                "unknown classifier '{}', available: {:?}",
                self.classifier,
                registry.names()
            )));
        }

        debug!("Configuration validated: {} fields, {} merge subsets", self.fields.len(), self.merge_exact.len());
        Ok(())
    }

    pub fn is_field(&self, name: &str) -> bool {
        self.fields.iter().any(|f| f.field == name)
    }

    /// Comparison columns in declaration order.
    pub fn columns(&self) -> Vec<&str> {
        self.fields.iter().map(|f| f.field.as_str()).collect()
    }

    /// Qualifies `name` with the run schema.
    pub fn qualified(&self, name: &str) -> String {
        format!("{}.{}", self.schema, name)
    }

    pub fn merge_level(&self, subset: &[String]) -> MergeLevel {
        if subset.iter().all(|c| self.is_field(c)) {
            MergeLevel::Unique
        } else {
            MergeLevel::Source
        }
    }

    /// Subsets applied at `level`, in configured order.
    pub fn merge_subsets(&self, level: MergeLevel) -> Vec<&[String]> {
        self.merge_exact
            .iter()
            .filter(|s| self.merge_level(s) == level)
            .map(|s| s.as_slice())
            .collect()
    }

    pub fn log_config(&self) {
        info!("⚙️  Source table: {} (key: {}), schema: {}", self.table, self.key, self.schema);
        info!("   Comparison fields: {:?}", self.columns());
        info!("   Blocking rules: {}", self.blocking.len());
        info!("   Classifier: {} (threshold {:.2})", self.classifier, self.threshold);
        if self.merge_exact.is_empty() {
            info!("   Exact merges: none");
        } else {
            info!("   Exact merges: {:?}", self.merge_exact);
        }
    }
}
