//! Schema mappings and the record normalizer: the typed boundary between raw
//! source documents and canonical candidates.

mod source;

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, NaiveDateTime, SubsecRound, Utc};
use incur_core::{
    core_column_type, Candidate, FieldType, FieldValue, RawDocument, RawRecord, SchemaViolation,
    COL_NATURAL_KEY, COL_SOURCE_LAST_MODIFIED, COL_STATUS,
};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub use source::{JsonPageDirSource, PullRequest, RecordSource, SourceError};

pub const CRATE_NAME: &str = "incur-normalize";

/// Sub-key a reference object collapses to when the rule names none.
pub const DISPLAY_VALUE_KEY: &str = "display_value";

const RAW_VALUE_PREVIEW_CHARS: usize = 120;

/// Fallback formats tried after RFC 3339, all read as UTC.
const TIMESTAMP_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%d-%m-%Y %H:%M:%S",
    "%d/%m/%Y %H:%M:%S",
];
const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%d-%m-%Y", "%d/%m/%Y"];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingPolicy {
    #[default]
    Null,
    Zero,
    Fail,
}

/// Where a core value (key, last-modified, status) comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceRule {
    pub source_path: String,
    #[serde(default)]
    pub flatten: Option<String>,
    #[serde(default)]
    pub timestamp_format: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FieldRule {
    pub name: String,
    pub source_path: String,
    pub target_type: FieldType,
    #[serde(default)]
    pub flatten: Option<String>,
    /// YAML `null` and an omitted key both mean [`MissingPolicy::Null`].
    #[serde(default)]
    pub default_on_missing: Option<MissingPolicy>,
    #[serde(default)]
    pub timestamp_format: Option<String>,
}

impl FieldRule {
    pub fn missing_policy(&self) -> MissingPolicy {
        self.default_on_missing.unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchemaMapping {
    pub version: String,
    pub natural_key: SourceRule,
    pub last_modified: SourceRule,
    #[serde(default)]
    pub status: Option<SourceRule>,
    #[serde(default)]
    pub fields: Vec<FieldRule>,
}

#[derive(Debug, Error)]
pub enum MappingError {
    #[error("reading schema mapping {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing schema mapping: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid schema mapping: {0}")]
    Invalid(String),
}

impl SchemaMapping {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, MappingError> {
        let mapping: Self = serde_yaml::from_str(yaml)?;
        mapping.validate()?;
        Ok(mapping)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, MappingError> {
        let path = path.as_ref();
        let yaml = fs::read_to_string(path).map_err(|source| MappingError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&yaml)
    }

    pub fn validate(&self) -> Result<(), MappingError> {
        if self.version.trim().is_empty() {
            return Err(MappingError::Invalid("version must not be empty".into()));
        }
        let core_rules = [
            (COL_NATURAL_KEY, Some(&self.natural_key)),
            (COL_SOURCE_LAST_MODIFIED, Some(&self.last_modified)),
            (COL_STATUS, self.status.as_ref()),
        ];
        for (column, rule) in core_rules {
            if rule.is_some_and(|r| r.source_path.trim().is_empty()) {
                return Err(MappingError::Invalid(format!(
                    "`{column}` rule needs a source_path"
                )));
            }
        }

        let mut seen = BTreeSet::new();
        for rule in &self.fields {
            if rule.name.trim().is_empty() || rule.source_path.trim().is_empty() {
                return Err(MappingError::Invalid(format!(
                    "field `{}` needs a name and a source_path",
                    rule.name
                )));
            }
            if core_column_type(&rule.name).is_some() {
                return Err(MappingError::Invalid(format!(
                    "field `{}` shadows a core column",
                    rule.name
                )));
            }
            if !seen.insert(rule.name.as_str()) {
                return Err(MappingError::Invalid(format!(
                    "field `{}` is mapped twice",
                    rule.name
                )));
            }
            if rule.timestamp_format.is_some() && rule.target_type != FieldType::Timestamp {
                return Err(MappingError::Invalid(format!(
                    "field `{}` sets timestamp_format but targets {}",
                    rule.name, rule.target_type
                )));
            }
        }
        Ok(())
    }

    /// Canonical column names this mapping produces, core columns included.
    pub fn column_names(&self) -> BTreeSet<&str> {
        incur_core::CORE_COLUMNS
            .iter()
            .map(|(name, _)| *name)
            .chain(self.fields.iter().map(|rule| rule.name.as_str()))
            .collect()
    }

    /// Declared target types of the mapped (non-core) fields.
    pub fn field_types(&self) -> BTreeMap<String, FieldType> {
        self.fields
            .iter()
            .map(|rule| (rule.name.clone(), rule.target_type))
            .collect()
    }

    pub fn column_type(&self, name: &str) -> Option<FieldType> {
        core_column_type(name).or_else(|| {
            self.fields
                .iter()
                .find(|rule| rule.name == name)
                .map(|rule| rule.target_type)
        })
    }
}

/// Outcome of reading one path from a document, before coercion.
enum Extracted<'a> {
    Missing,
    Value(&'a JsonValue),
}

static JSON_NULL: JsonValue = JsonValue::Null;

fn extract<'a>(doc: &'a RawDocument, source_path: &str, flatten: Option<&str>) -> Extracted<'a> {
    let Some(value) = doc.get_path(source_path) else {
        return Extracted::Missing;
    };
    let flattened = match (value, flatten) {
        (JsonValue::Object(map), Some(sub_key)) => map.get(sub_key).unwrap_or(&JSON_NULL),
        (JsonValue::Object(map), None) => map.get(DISPLAY_VALUE_KEY).unwrap_or(&JSON_NULL),
        (scalar, _) => scalar,
    };
    Extracted::Value(flattened)
}

pub fn parse_timestamp(raw: &str, format: Option<&str>) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    let parsed = match format {
        Some(format) => NaiveDateTime::parse_from_str(raw, format)
            .map(|naive| naive.and_utc())
            .or_else(|_| DateTime::parse_from_str(raw, format).map(|dt| dt.with_timezone(&Utc)))
            .ok()
            .or_else(|| {
                NaiveDate::parse_from_str(raw, format)
                    .ok()
                    .and_then(|date| date.and_hms_opt(0, 0, 0))
                    .map(|naive| naive.and_utc())
            }),
        None => DateTime::parse_from_rfc3339(raw)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
            .or_else(|| {
                TIMESTAMP_FORMATS
                    .iter()
                    .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
                    .map(|naive| naive.and_utc())
            })
            .or_else(|| {
                DATE_FORMATS
                    .iter()
                    .find_map(|format| NaiveDate::parse_from_str(raw, format).ok())
                    .and_then(|date| date.and_hms_opt(0, 0, 0))
                    .map(|naive| naive.and_utc())
            }),
    };
    parsed.map(|ts| ts.trunc_subsecs(6))
}

/// Coerces one source value to `target`. The error is the violation reason.
/// Blank strings are null for every target except text, which keeps them.
pub fn coerce(
    value: &JsonValue,
    target: FieldType,
    timestamp_format: Option<&str>,
) -> Result<FieldValue, String> {
    if let JsonValue::String(s) = value {
        if target != FieldType::Text && s.trim().is_empty() {
            return Ok(FieldValue::Null);
        }
    }
    let coerced = match (target, value) {
        (_, JsonValue::Null) => Some(FieldValue::Null),
        (FieldType::Text, JsonValue::String(s)) => Some(FieldValue::Text(s.clone())),
        (FieldType::Text, JsonValue::Number(n)) => Some(FieldValue::Text(n.to_string())),
        (FieldType::Text, JsonValue::Bool(b)) => Some(FieldValue::Text(b.to_string())),
        (FieldType::Integer, JsonValue::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0 && f.abs() < 9.0e15).map(|f| f as i64))
            .map(FieldValue::Integer),
        (FieldType::Integer, JsonValue::String(s)) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| {
                    s.parse::<f64>()
                        .ok()
                        .filter(|f| f.fract() == 0.0 && f.abs() < 9.0e15)
                        .map(|f| f as i64)
                })
                .map(FieldValue::Integer)
        }
        (FieldType::Float, JsonValue::Number(n)) => n.as_f64().map(FieldValue::Float),
        (FieldType::Float, JsonValue::String(s)) => s
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|f| f.is_finite())
            .map(FieldValue::Float),
        (FieldType::Boolean, JsonValue::Bool(b)) => Some(FieldValue::Boolean(*b)),
        (FieldType::Boolean, JsonValue::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" => Some(FieldValue::Boolean(true)),
            "false" | "0" => Some(FieldValue::Boolean(false)),
            _ => None,
        },
        (FieldType::Boolean, JsonValue::Number(n)) => match n.as_i64() {
            Some(1) => Some(FieldValue::Boolean(true)),
            Some(0) => Some(FieldValue::Boolean(false)),
            _ => None,
        },
        (FieldType::Timestamp, JsonValue::String(s)) => {
            parse_timestamp(s, timestamp_format).map(FieldValue::Timestamp)
        }
        _ => None,
    };
    coerced.ok_or_else(|| match timestamp_format {
        Some(format) if target == FieldType::Timestamp => {
            format!("cannot coerce to {target} with format `{format}`")
        }
        _ => format!("cannot coerce to {target}"),
    })
}

fn preview(value: Option<&JsonValue>) -> String {
    let Some(value) = value else {
        return "<missing>".to_string();
    };
    let text = value.to_string();
    if text.chars().count() <= RAW_VALUE_PREVIEW_CHARS {
        return text;
    }
    let mut truncated = text.chars().take(RAW_VALUE_PREVIEW_CHARS).collect::<String>();
    truncated.push_str("...");
    truncated
}

/// Candidates and violations from one batch of raw records.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedBatch {
    pub candidates: Vec<Candidate>,
    pub violations: Vec<SchemaViolation>,
}

impl NormalizedBatch {
    pub fn push(&mut self, outcome: Result<Candidate, SchemaViolation>) {
        match outcome {
            Ok(candidate) => self.candidates.push(candidate),
            Err(violation) => self.violations.push(violation),
        }
    }

    pub fn extend(&mut self, other: NormalizedBatch) {
        self.candidates.extend(other.candidates);
        self.violations.extend(other.violations);
    }

    pub fn len(&self) -> usize {
        self.candidates.len() + self.violations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl FromIterator<Result<Candidate, SchemaViolation>> for NormalizedBatch {
    fn from_iter<T: IntoIterator<Item = Result<Candidate, SchemaViolation>>>(iter: T) -> Self {
        let mut batch = Self::default();
        for outcome in iter {
            batch.push(outcome);
        }
        batch
    }
}

/// Stateless: the same records and mapping always give the same output.
#[derive(Debug, Clone)]
pub struct Normalizer {
    mapping: Arc<SchemaMapping>,
}

impl Normalizer {
    pub fn new(mapping: Arc<SchemaMapping>) -> Self {
        Self { mapping }
    }

    pub fn mapping(&self) -> &SchemaMapping {
        &self.mapping
    }

    /// Lazily normalizes `records`; each item fails or succeeds on its own.
    pub fn normalize<'a, I>(
        &'a self,
        records: I,
    ) -> impl Iterator<Item = Result<Candidate, SchemaViolation>> + 'a
    where
        I: IntoIterator<Item = &'a RawRecord>,
        I::IntoIter: 'a,
    {
        records
            .into_iter()
            .map(move |record| self.normalize_record(record))
    }

    pub fn normalize_batch(&self, records: &[RawRecord]) -> NormalizedBatch {
        self.normalize(records).collect()
    }

    pub fn normalize_record(&self, record: &RawRecord) -> Result<Candidate, SchemaViolation> {
        let doc = &record.document;
        let mapping = &*self.mapping;
        let key_preview = || {
            match extract(doc, &mapping.natural_key.source_path, mapping.natural_key.flatten.as_deref()) {
                Extracted::Value(value) => value
                    .as_str()
                    .map(str::to_string)
                    .or_else(|| value.as_i64().map(|n| n.to_string())),
                Extracted::Missing => None,
            }
        };
        let violation = |field: &str, raw: Option<&JsonValue>, reason: String| SchemaViolation {
            record_key: key_preview(),
            ordinal: record.ordinal,
            field: field.to_string(),
            raw_value: preview(raw),
            reason,
        };
        let required = |column: &str, rule: &SourceRule, target: FieldType| {
            let Extracted::Value(raw) = extract(doc, &rule.source_path, rule.flatten.as_deref()) else {
                return Err(violation(column, None, format!("required `{}` is missing", rule.source_path)));
            };
            match coerce(raw, target, rule.timestamp_format.as_deref()) {
                Ok(FieldValue::Null) => Err(violation(column, Some(raw), "required value is null".into())),
                Ok(FieldValue::Text(text)) if text.trim().is_empty() => {
                    Err(violation(column, Some(raw), "required value is blank".into()))
                }
                Ok(value) => Ok(value),
                Err(reason) => Err(violation(column, Some(raw), reason)),
            }
        };

        let natural_key = match required(COL_NATURAL_KEY, &mapping.natural_key, FieldType::Text)? {
            FieldValue::Text(key) => key.trim().to_string(),
            other => other.render().unwrap_or_default(),
        };
        let source_last_modified = required(
            COL_SOURCE_LAST_MODIFIED,
            &mapping.last_modified,
            FieldType::Timestamp,
        )?
        .as_timestamp()
        .ok_or_else(|| violation(COL_SOURCE_LAST_MODIFIED, None, "not a timestamp".into()))?;

        let status = match &mapping.status {
            Some(rule) => match extract(doc, &rule.source_path, rule.flatten.as_deref()) {
                Extracted::Missing => None,
                Extracted::Value(raw) => match coerce(raw, FieldType::Text, None) {
                    Ok(value) => value
                        .as_text()
                        .filter(|text| !text.trim().is_empty())
                        .map(str::to_string),
                    Err(reason) => return Err(violation(COL_STATUS, Some(raw), reason)),
                },
            },
            None => None,
        };

        let mut fields = BTreeMap::new();
        for rule in &mapping.fields {
            let value = match extract(doc, &rule.source_path, rule.flatten.as_deref()) {
                Extracted::Missing => match rule.missing_policy() {
                    MissingPolicy::Null => FieldValue::Null,
                    MissingPolicy::Zero => rule.target_type.zero_value(),
                    MissingPolicy::Fail => {
                        return Err(violation(
                            &rule.name,
                            None,
                            format!("`{}` is missing and the field is required", rule.source_path),
                        ))
                    }
                },
                Extracted::Value(raw) => coerce(raw, rule.target_type, rule.timestamp_format.as_deref())
                    .map_err(|reason| violation(&rule.name, Some(raw), reason))?,
            };
            fields.insert(rule.name.clone(), value);
        }

        Ok(Candidate {
            natural_key,
            source_last_modified,
            status,
            mapping_version: mapping.version.clone(),
            ordinal: record.ordinal,
            fields,
        })
    }
}
