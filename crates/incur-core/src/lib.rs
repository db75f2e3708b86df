//! Core domain model for incident curation: runs, raw documents, typed field
//! values and canonical records.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "incur-core";

/// Monotonic identifier of one ingestion attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub u64);

impl RunId {
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "run-{:06}", self.0)
    }
}

impl FromStr for RunId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.trim().trim_start_matches("run-");
        digits
            .parse::<u64>()
            .map(RunId)
            .map_err(|_| format!("invalid run id `{s}`"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestionMode {
    FullBackfill,
    IncrementalOpen,
}

impl IngestionMode {
    pub fn is_backfill(self) -> bool {
        matches!(self, Self::FullBackfill)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::FullBackfill => "full_backfill",
            Self::IncrementalOpen => "incremental_open",
        }
    }
}

impl fmt::Display for IngestionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IngestionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "full_backfill" | "full-backfill" | "backfill" | "full" => Ok(Self::FullBackfill),
            "incremental_open" | "incremental-open" | "incremental" => Ok(Self::IncrementalOpen),
            other => Err(format!(
                "unsupported ingestion mode `{other}`; expected one of: full_backfill, incremental_open"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Succeeded,
    Failed,
    Partial,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Partial => "partial",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Time range the source client pulled for a run, as reported by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PullWindow {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RunStateError {
    #[error("{run_id} already finished with status {status}")]
    AlreadyTerminal { run_id: RunId, status: RunStatus },
    #[error("{run_id} cannot finish with non-terminal status {status}")]
    NotTerminal { run_id: RunId, status: RunStatus },
}

/// One ingestion attempt. Its terminal status is set exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Run {
    pub run_id: RunId,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub mode: IngestionMode,
    pub status: RunStatus,
    pub records_pulled: usize,
    #[serde(default)]
    pub pull_window: PullWindow,
}

impl Run {
    pub fn start(
        run_id: RunId,
        mode: IngestionMode,
        started_at: DateTime<Utc>,
        pull_window: PullWindow,
    ) -> Self {
        Self {
            run_id,
            started_at,
            finished_at: None,
            mode,
            status: RunStatus::Pending,
            records_pulled: 0,
            pull_window,
        }
    }

    pub fn complete(
        &mut self,
        status: RunStatus,
        finished_at: DateTime<Utc>,
    ) -> Result<(), RunStateError> {
        if self.status.is_terminal() {
            return Err(RunStateError::AlreadyTerminal {
                run_id: self.run_id,
                status: self.status,
            });
        }
        if !status.is_terminal() {
            return Err(RunStateError::NotTerminal {
                run_id: self.run_id,
                status,
            });
        }
        self.status = status;
        self.finished_at = Some(finished_at);
        Ok(())
    }
}

/// Untyped source document addressed by dotted key paths (`assignment_group.value`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawDocument(JsonValue);

impl RawDocument {
    pub fn new(value: JsonValue) -> Self {
        Self(value)
    }

    pub fn as_value(&self) -> &JsonValue {
        &self.0
    }

    /// Resolves a dotted path. Numeric segments index into arrays.
    pub fn get_path(&self, path: &str) -> Option<&JsonValue> {
        path.split('.')
            .filter(|segment| !segment.is_empty())
            .try_fold(&self.0, |node, segment| match node {
                JsonValue::Object(map) => map.get(segment),
                JsonValue::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
                _ => None,
            })
    }
}

impl From<JsonValue> for RawDocument {
    fn from(value: JsonValue) -> Self {
        Self(value)
    }
}

/// A source record as pulled, with its position in the run's page order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub ordinal: u64,
    pub document: RawDocument,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Text,
    Integer,
    Float,
    Boolean,
    Timestamp,
}

impl FieldType {
    pub fn zero_value(self) -> FieldValue {
        match self {
            Self::Text => FieldValue::Text(String::new()),
            Self::Integer => FieldValue::Integer(0),
            Self::Float => FieldValue::Float(0.0),
            Self::Boolean => FieldValue::Boolean(false),
            Self::Timestamp => FieldValue::Timestamp(DateTime::<Utc>::UNIX_EPOCH),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Integer => "integer",
            Self::Float => "float",
            Self::Boolean => "boolean",
            Self::Timestamp => "timestamp",
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed canonical value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Null,
    Text(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Timestamp(DateTime<Utc>),
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn field_type(&self) -> Option<FieldType> {
        match self {
            Self::Null => None,
            Self::Text(_) => Some(FieldType::Text),
            Self::Integer(_) => Some(FieldType::Integer),
            Self::Float(_) => Some(FieldType::Float),
            Self::Boolean(_) => Some(FieldType::Boolean),
            Self::Timestamp(_) => Some(FieldType::Timestamp),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Timestamp(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Integer(value) => Some(*value as f64),
            Self::Float(value) => Some(*value),
            _ => None,
        }
    }

    /// Text rendering used for grouping and text features; `None` for nulls.
    pub fn render(&self) -> Option<String> {
        match self {
            Self::Null => None,
            Self::Text(value) => Some(value.clone()),
            Self::Integer(value) => Some(value.to_string()),
            Self::Float(value) => Some(value.to_string()),
            Self::Boolean(value) => Some(value.to_string()),
            Self::Timestamp(value) => Some(value.to_rfc3339()),
        }
    }

    /// Re-expresses a value as `target`, for rows written under an older
    /// mapping that typed the column differently. Text targets take the
    /// rendering; other targets re-parse it and become null when that fails.
    pub fn conform_to(&self, target: FieldType) -> FieldValue {
        match self.field_type() {
            Some(current) if current != target => {}
            _ => return self.clone(),
        }
        match (target, self) {
            (FieldType::Text, value) => value.render().map_or(Self::Null, Self::Text),
            (FieldType::Float, Self::Integer(value)) => Self::Float(*value as f64),
            (FieldType::Integer, Self::Float(value)) if value.fract() == 0.0 && value.abs() < 9.0e15 => {
                Self::Integer(*value as i64)
            }
            (FieldType::Boolean, Self::Integer(1)) => Self::Boolean(true),
            (FieldType::Boolean, Self::Integer(0)) => Self::Boolean(false),
            (FieldType::Integer, Self::Boolean(value)) => Self::Integer(i64::from(*value)),
            (_, Self::Text(text)) => Self::parse_as(text.trim(), target),
            _ => Self::Null,
        }
    }

    fn parse_as(text: &str, target: FieldType) -> FieldValue {
        let parsed = match target {
            FieldType::Text => Some(Self::Text(text.to_string())),
            FieldType::Integer => text.parse::<i64>().ok().map(Self::Integer),
            FieldType::Float => text
                .parse::<f64>()
                .ok()
                .filter(|value| value.is_finite())
                .map(Self::Float),
            FieldType::Boolean => match text.to_ascii_lowercase().as_str() {
                "true" | "1" => Some(Self::Boolean(true)),
                "false" | "0" => Some(Self::Boolean(false)),
                _ => None,
            },
            FieldType::Timestamp => DateTime::parse_from_rfc3339(text)
                .ok()
                .map(|ts| Self::Timestamp(ts.with_timezone(&Utc))),
        };
        parsed.unwrap_or(Self::Null)
    }
}

pub const COL_NATURAL_KEY: &str = "natural_key";
pub const COL_STATUS: &str = "status";
pub const COL_SOURCE_LAST_MODIFIED: &str = "source_last_modified";
pub const COL_CURATED_AT: &str = "curated_at";
pub const COL_MAPPING_VERSION: &str = "mapping_version";
pub const COL_RUN_ID: &str = "run_id";

/// Columns every canonical record carries regardless of mapping.
pub const CORE_COLUMNS: [(&str, FieldType); 6] = [
    (COL_NATURAL_KEY, FieldType::Text),
    (COL_STATUS, FieldType::Text),
    (COL_SOURCE_LAST_MODIFIED, FieldType::Timestamp),
    (COL_CURATED_AT, FieldType::Timestamp),
    (COL_MAPPING_VERSION, FieldType::Text),
    (COL_RUN_ID, FieldType::Integer),
];

pub fn core_column_type(name: &str) -> Option<FieldType> {
    CORE_COLUMNS
        .iter()
        .find(|(column, _)| *column == name)
        .map(|(_, field_type)| *field_type)
}

/// Normalizer output for one raw record, not yet merged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub natural_key: String,
    pub source_last_modified: DateTime<Utc>,
    pub status: Option<String>,
    pub mapping_version: String,
    pub ordinal: u64,
    pub fields: BTreeMap<String, FieldValue>,
}

impl Candidate {
    pub fn into_record(self, run_id: RunId, curated_at: DateTime<Utc>) -> CanonicalRecord {
        CanonicalRecord {
            natural_key: self.natural_key,
            source_last_modified: self.source_last_modified,
            status: self.status,
            mapping_version: self.mapping_version,
            run_id,
            curated_at,
            fields: self
                .fields
                .into_iter()
                .filter(|(_, value)| !value.is_null())
                .collect(),
        }
    }
}

/// Curated representation of one incident. Null fields are absent from `fields`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub natural_key: String,
    pub source_last_modified: DateTime<Utc>,
    pub status: Option<String>,
    pub mapping_version: String,
    pub run_id: RunId,
    pub curated_at: DateTime<Utc>,
    pub fields: BTreeMap<String, FieldValue>,
}

impl CanonicalRecord {
    /// Value of a core or mapped column; unknown and null columns read as `Null`.
    pub fn column(&self, name: &str) -> FieldValue {
        match name {
            COL_NATURAL_KEY => FieldValue::Text(self.natural_key.clone()),
            COL_STATUS => self
                .status
                .clone()
                .map(FieldValue::Text)
                .unwrap_or(FieldValue::Null),
            COL_SOURCE_LAST_MODIFIED => FieldValue::Timestamp(self.source_last_modified),
            COL_CURATED_AT => FieldValue::Timestamp(self.curated_at),
            COL_MAPPING_VERSION => FieldValue::Text(self.mapping_version.clone()),
            COL_RUN_ID => FieldValue::Integer(self.run_id.0 as i64),
            other => self.fields.get(other).cloned().unwrap_or(FieldValue::Null),
        }
    }

    /// True when the candidate carries exactly this revision's curated content.
    pub fn same_revision(&self, candidate: &Candidate) -> bool {
        if self.natural_key != candidate.natural_key
            || self.source_last_modified != candidate.source_last_modified
            || self.status != candidate.status
            || self.mapping_version != candidate.mapping_version
        {
            return false;
        }
        let mut non_null = candidate.fields.iter().filter(|(_, value)| !value.is_null());
        let count = non_null.clone().count();
        count == self.fields.len() && non_null.all(|(name, value)| self.fields.get(name) == Some(value))
    }
}

/// Case-insensitive set of statuses after which records are frozen.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct TerminalStatuses(BTreeSet<String>);

impl TerminalStatuses {
    pub fn new<I, S>(statuses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self(
            statuses
                .into_iter()
                .map(|s| s.as_ref().trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect(),
        )
    }

    pub fn contains(&self, status: &str) -> bool {
        self.0.contains(&status.trim().to_lowercase())
    }

    pub fn is_terminal(&self, status: Option<&str>) -> bool {
        status.is_some_and(|s| self.contains(s))
    }
}

impl From<Vec<String>> for TerminalStatuses {
    fn from(value: Vec<String>) -> Self {
        Self::new(value)
    }
}

impl From<TerminalStatuses> for Vec<String> {
    fn from(value: TerminalStatuses) -> Self {
        value.0.into_iter().collect()
    }
}

/// A record the normalizer could not map; it is excluded from the merge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaViolation {
    pub record_key: Option<String>,
    pub ordinal: u64,
    pub field: String,
    pub raw_value: String,
    pub reason: String,
}

impl fmt::Display for SchemaViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "record {} (ordinal {}): field `{}` rejected {}: {}",
            self.record_key.as_deref().unwrap_or("<unknown>"),
            self.ordinal,
            self.field,
            self.raw_value,
            self.reason
        )
    }
}

impl std::error::Error for SchemaViolation {}

/// Immutable view of one canonical table version. Readers hold it behind an
/// `Arc`; a merge builds a new snapshot and never touches an existing one.
#[derive(Debug, Clone)]
pub struct CanonicalSnapshot {
    version: u64,
    committed_at: DateTime<Utc>,
    records: BTreeMap<String, Arc<CanonicalRecord>>,
}

impl CanonicalSnapshot {
    pub fn empty() -> Self {
        Self {
            version: 0,
            committed_at: DateTime::<Utc>::UNIX_EPOCH,
            records: BTreeMap::new(),
        }
    }

    pub fn new(
        version: u64,
        committed_at: DateTime<Utc>,
        records: BTreeMap<String, Arc<CanonicalRecord>>,
    ) -> Self {
        Self {
            version,
            committed_at,
            records,
        }
    }

    /// Keys records by natural key; a later duplicate replaces an earlier one.
    pub fn from_records<I>(version: u64, committed_at: DateTime<Utc>, records: I) -> Self
    where
        I: IntoIterator<Item = CanonicalRecord>,
    {
        let records = records
            .into_iter()
            .map(|record| (record.natural_key.clone(), Arc::new(record)))
            .collect();
        Self::new(version, committed_at, records)
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn committed_at(&self) -> DateTime<Utc> {
        self.committed_at
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, natural_key: &str) -> Option<&CanonicalRecord> {
        self.records.get(natural_key).map(Arc::as_ref)
    }

    /// Records in natural-key order.
    pub fn records(&self) -> impl Iterator<Item = &CanonicalRecord> {
        self.records.values().map(Arc::as_ref)
    }

    pub fn entries(&self) -> &BTreeMap<String, Arc<CanonicalRecord>> {
        &self.records
    }

    /// Greatest `curated_at` in the table, or the commit time of an empty table.
    pub fn watermark(&self) -> DateTime<Utc> {
        self.records()
            .map(|record| record.curated_at)
            .max()
            .unwrap_or(self.committed_at)
    }

    pub fn mapping_versions(&self) -> BTreeSet<&str> {
        self.records()
            .map(|record| record.mapping_version.as_str())
            .collect()
    }
}

impl Default for CanonicalSnapshot {
    fn default() -> Self {
        Self::empty()
    }
}
