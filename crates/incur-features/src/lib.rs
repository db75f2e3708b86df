//! Task-specific feature views derived from one canonical snapshot.

mod store;

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow_array::RecordBatch;
use chrono::{DateTime, Datelike, Duration, Timelike, Utc};
use incur_core::{
    CanonicalRecord, CanonicalSnapshot, FieldType, FieldValue, TerminalStatuses, COL_CURATED_AT,
    COL_NATURAL_KEY, COL_SOURCE_LAST_MODIFIED, COL_STATUS,
};
use incur_normalize::SchemaMapping;
use incur_storage::{build_record_batch, encode_parquet, Column, StoreError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

pub use store::{FeatureManifest, FeatureStore};

pub const CRATE_NAME: &str = "incur-features";

/// Columns that tie a per-row feature to the canonical revision it came from.
pub const TRACE_COLUMNS: [&str; 3] = [COL_NATURAL_KEY, COL_SOURCE_LAST_MODIFIED, COL_CURATED_AT];

const MICROS_PER_HOUR: f64 = 3_600_000_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Classification,
    Regression,
    Clustering,
    Nlp,
}

impl TaskKind {
    pub fn is_supervised(self) -> bool {
        matches!(self, Self::Classification | Self::Regression)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RowFilter {
    #[serde(default)]
    pub require_present: Vec<String>,
    #[serde(default)]
    pub status_in: Vec<String>,
    #[serde(default)]
    pub status_not_in: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordEligibility {
    Open,
    Closed,
    #[default]
    All,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Eligibility {
    #[serde(default)]
    pub records: RecordEligibility,
    /// Only records whose `source_last_modified` falls within this many days
    /// before the as-of time.
    #[serde(default)]
    pub lookback_days: Option<u32>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MixedVersionPolicy {
    #[default]
    Allow,
    Reject,
}

fn default_separator() -> String {
    " ".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Derivation {
    /// Hours from `field` to the as-of time.
    HoursSince { field: String },
    HoursBetween { start: String, end: String },
    /// True when `completed` (or, while open, the as-of time) is after `deadline`.
    DeadlineExceeded {
        deadline: String,
        #[serde(default)]
        completed: Option<String>,
    },
    HourOfDay { field: String },
    /// 0 = Monday.
    DayOfWeek { field: String },
    Text {
        fields: Vec<String>,
        #[serde(default = "default_separator")]
        separator: String,
        #[serde(default)]
        lowercase: bool,
    },
    IsTerminal,
}

impl Derivation {
    pub fn output_type(&self) -> FieldType {
        match self {
            Self::HoursSince { .. } | Self::HoursBetween { .. } => FieldType::Float,
            Self::DeadlineExceeded { .. } | Self::IsTerminal => FieldType::Boolean,
            Self::HourOfDay { .. } | Self::DayOfWeek { .. } => FieldType::Integer,
            Self::Text { .. } => FieldType::Text,
        }
    }

    pub fn inputs(&self) -> Vec<&str> {
        match self {
            Self::HoursSince { field } | Self::HourOfDay { field } | Self::DayOfWeek { field } => {
                vec![field.as_str()]
            }
            Self::HoursBetween { start, end } => vec![start.as_str(), end.as_str()],
            Self::DeadlineExceeded {
                deadline,
                completed,
            } => std::iter::once(deadline.as_str())
                .chain(completed.as_deref())
                .collect(),
            Self::Text { fields, .. } => fields.iter().map(String::as_str).collect(),
            Self::IsTerminal => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivedColumn {
    pub name: String,
    #[serde(flatten)]
    pub derivation: Derivation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateOp {
    Count,
    CountTerminal,
    DistinctCount,
    Sum,
    Mean,
    Min,
    Max,
}

impl AggregateOp {
    fn needs_field(self) -> bool {
        !matches!(self, Self::Count | Self::CountTerminal)
    }

    fn output_type(self) -> FieldType {
        match self {
            Self::Count | Self::CountTerminal | Self::DistinctCount => FieldType::Integer,
            Self::Sum | Self::Mean | Self::Min | Self::Max => FieldType::Float,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Aggregate {
    pub name: String,
    pub op: AggregateOp,
    #[serde(default)]
    pub field: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskDefinition {
    pub task: String,
    pub kind: TaskKind,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub features: Vec<String>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub row_filter: RowFilter,
    #[serde(default)]
    pub derived_columns: Vec<DerivedColumn>,
    #[serde(default)]
    pub eligibility: Eligibility,
    #[serde(default)]
    pub group_by: Vec<String>,
    #[serde(default)]
    pub aggregates: Vec<Aggregate>,
    #[serde(default)]
    pub mixed_mapping_versions: MixedVersionPolicy,
}

#[derive(Debug, Error)]
pub enum FeatureError {
    #[error("task `{task}` references fields missing from the schema mapping: {}", missing.join(", "))]
    UnsupportedTaskSchema { task: String, missing: Vec<String> },
    #[error("task `{task}` rejects mixed mapping versions: expected `{expected}`, table holds {}", found.join(", "))]
    MixedMappingVersions {
        task: String,
        expected: String,
        found: Vec<String>,
    },
    #[error("invalid task `{task}`: {reason}")]
    InvalidTask { task: String, reason: String },
    #[error("reading task definition {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing task definition {path}: {source}")]
    Definition {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl TaskDefinition {
    pub fn from_yaml_str(yaml: &str, origin: &Path) -> Result<Self, FeatureError> {
        let task: Self = serde_yaml::from_str(yaml).map_err(|source| FeatureError::Definition {
            path: origin.to_path_buf(),
            source,
        })?;
        task.validate()?;
        Ok(task)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, FeatureError> {
        let path = path.as_ref();
        let yaml = fs::read_to_string(path).map_err(|source| FeatureError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&yaml, path)
    }

    fn invalid(&self, reason: impl Into<String>) -> FeatureError {
        FeatureError::InvalidTask {
            task: self.task.clone(),
            reason: reason.into(),
        }
    }

    pub fn is_aggregate(&self) -> bool {
        !self.group_by.is_empty()
    }

    fn derived(&self, name: &str) -> Option<&Derivation> {
        self.derived_columns
            .iter()
            .find(|column| column.name == name)
            .map(|column| &column.derivation)
    }

    pub fn validate(&self) -> Result<(), FeatureError> {
        let safe_name = !self.task.is_empty()
            && self
                .task
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !safe_name {
            return Err(self.invalid("task names use ascii letters, digits, `_` and `-`"));
        }
        if self.kind.is_supervised() && self.label.is_none() {
            return Err(self.invalid("supervised tasks need a label"));
        }
        if self.is_aggregate() {
            if self.aggregates.is_empty() {
                return Err(self.invalid("group_by needs at least one aggregate"));
            }
            if let Some(aggregate) = self
                .aggregates
                .iter()
                .find(|a| a.op.needs_field() != a.field.is_some())
            {
                return Err(self.invalid(format!(
                    "aggregate `{}` ({:?}) {} a field",
                    aggregate.name,
                    aggregate.op,
                    if aggregate.op.needs_field() { "needs" } else { "takes no" }
                )));
            }
        } else if !self.aggregates.is_empty() {
            return Err(self.invalid("aggregates need group_by"));
        }

        let mut names = BTreeSet::new();
        for column in &self.derived_columns {
            if TRACE_COLUMNS.contains(&column.name.as_str())
                || self.features.contains(&column.name)
                || !names.insert(column.name.as_str())
            {
                return Err(self.invalid(format!(
                    "derived column `{}` collides with another column",
                    column.name
                )));
            }
        }
        let mut outputs = BTreeSet::new();
        for aggregate in &self.aggregates {
            if self.group_by.contains(&aggregate.name) || !outputs.insert(aggregate.name.as_str()) {
                return Err(self.invalid(format!(
                    "aggregate `{}` collides with another column",
                    aggregate.name
                )));
            }
        }
        Ok(())
    }

    /// Canonical columns the task reads, derived columns excluded.
    pub fn referenced_fields(&self) -> BTreeSet<&str> {
        let direct = self
            .features
            .iter()
            .chain(self.label.iter())
            .chain(self.row_filter.require_present.iter())
            .chain(self.group_by.iter())
            .chain(self.aggregates.iter().filter_map(|a| a.field.as_ref()))
            .map(String::as_str);
        let inputs = self
            .derived_columns
            .iter()
            .flat_map(|column| column.derivation.inputs());
        direct
            .chain(inputs)
            .filter(|name| self.derived(name).is_none())
            .collect()
    }
}

/// Task definitions from every `*.yaml` file in `dir`, ordered by task name.
pub fn load_task_definitions(dir: impl AsRef<Path>) -> Result<Vec<TaskDefinition>, FeatureError> {
    let dir = dir.as_ref();
    let io = |source: std::io::Error| FeatureError::Io {
        path: dir.to_path_buf(),
        source,
    };
    let mut paths = fs::read_dir(dir)
        .map_err(io)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.extension()
                .is_some_and(|ext| ext == "yaml" || ext == "yml")
        })
        .collect::<Vec<_>>();
    paths.sort();

    let mut tasks = BTreeMap::new();
    for path in paths {
        let task = TaskDefinition::load(&path)?;
        if tasks.contains_key(&task.task) {
            return Err(FeatureError::InvalidTask {
                task: task.task,
                reason: format!("defined twice (again in {})", path.display()),
            });
        }
        tasks.insert(task.task.clone(), task);
    }
    Ok(tasks.into_values().collect())
}

/// A materialized feature table for one task at one canonical version.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureDataset {
    pub task: String,
    pub kind: TaskKind,
    pub canonical_version: u64,
    pub as_of: DateTime<Utc>,
    pub mapping_version: String,
    pub columns: Vec<Column>,
    pub row_count: usize,
}

impl FeatureDataset {
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|column| column.name == name)
    }

    pub fn to_record_batch(&self) -> Result<RecordBatch, FeatureError> {
        Ok(build_record_batch(&self.columns)?)
    }

    pub fn to_parquet(&self) -> Result<Vec<u8>, FeatureError> {
        Ok(encode_parquet(&self.to_record_batch()?)?)
    }
}

fn hours_between(start: DateTime<Utc>, end: DateTime<Utc>) -> FieldValue {
    (end - start)
        .num_microseconds()
        .map(|micros| FieldValue::Float(micros as f64 / MICROS_PER_HOUR))
        .unwrap_or(FieldValue::Null)
}

/// Builds feature datasets against one schema mapping and terminal set.
#[derive(Debug, Clone)]
pub struct FeatureViewBuilder {
    mapping: Arc<SchemaMapping>,
    terminal: TerminalStatuses,
}

struct RowContext<'a> {
    record: &'a CanonicalRecord,
    as_of: DateTime<Utc>,
    terminal: &'a TerminalStatuses,
}

impl RowContext<'_> {
    fn timestamp(&self, name: &str) -> Option<DateTime<Utc>> {
        self.record.column(name).as_timestamp()
    }

    fn derive(&self, derivation: &Derivation) -> FieldValue {
        match derivation {
            Derivation::HoursSince { field } => self
                .timestamp(field)
                .map(|ts| hours_between(ts, self.as_of))
                .unwrap_or(FieldValue::Null),
            Derivation::HoursBetween { start, end } => {
                match (self.timestamp(start), self.timestamp(end)) {
                    (Some(start), Some(end)) => hours_between(start, end),
                    _ => FieldValue::Null,
                }
            }
            Derivation::DeadlineExceeded {
                deadline,
                completed,
            } => match self.timestamp(deadline) {
                Some(deadline) => {
                    let done = completed
                        .as_deref()
                        .and_then(|field| self.timestamp(field))
                        .unwrap_or(self.as_of);
                    FieldValue::Boolean(done > deadline)
                }
                None => FieldValue::Null,
            },
            Derivation::HourOfDay { field } => self
                .timestamp(field)
                .map(|ts| FieldValue::Integer(i64::from(ts.hour())))
                .unwrap_or(FieldValue::Null),
            Derivation::DayOfWeek { field } => self
                .timestamp(field)
                .map(|ts| FieldValue::Integer(i64::from(ts.weekday().num_days_from_monday())))
                .unwrap_or(FieldValue::Null),
            Derivation::Text {
                fields,
                separator,
                lowercase,
            } => {
                let parts = fields
                    .iter()
                    .filter_map(|field| self.record.column(field).render())
                    .filter(|part| !part.trim().is_empty())
                    .collect::<Vec<_>>();
                if parts.is_empty() {
                    return FieldValue::Null;
                }
                let text = parts.join(separator);
                FieldValue::Text(if *lowercase { text.to_lowercase() } else { text })
            }
            Derivation::IsTerminal => {
                FieldValue::Boolean(self.terminal.is_terminal(self.record.status.as_deref()))
            }
        }
    }
}

/// Row values keyed by output column name.
type Row = BTreeMap<String, FieldValue>;

impl FeatureViewBuilder {
    pub fn new(mapping: Arc<SchemaMapping>, terminal: TerminalStatuses) -> Self {
        Self { mapping, terminal }
    }

    fn check_schema(&self, task: &TaskDefinition) -> Result<(), FeatureError> {
        let known = self.mapping.column_names();
        let missing = task
            .referenced_fields()
            .into_iter()
            .filter(|name| !known.contains(name))
            .map(str::to_string)
            .collect::<Vec<_>>();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(FeatureError::UnsupportedTaskSchema {
                task: task.task.clone(),
                missing,
            })
        }
    }

    fn check_versions(
        &self,
        snapshot: &CanonicalSnapshot,
        task: &TaskDefinition,
    ) -> Result<(), FeatureError> {
        if task.mixed_mapping_versions == MixedVersionPolicy::Allow {
            return Ok(());
        }
        let found = snapshot.mapping_versions();
        if found.iter().all(|version| *version == self.mapping.version) {
            return Ok(());
        }
        Err(FeatureError::MixedMappingVersions {
            task: task.task.clone(),
            expected: self.mapping.version.clone(),
            found: found.into_iter().map(str::to_string).collect(),
        })
    }

    fn column_type(&self, task: &TaskDefinition, name: &str) -> FieldType {
        task.derived(name)
            .map(Derivation::output_type)
            .or_else(|| self.mapping.column_type(name))
            .unwrap_or(FieldType::Text)
    }

    fn eligible(&self, task: &TaskDefinition, record: &CanonicalRecord, as_of: DateTime<Utc>) -> bool {
        let terminal = self.terminal.is_terminal(record.status.as_deref());
        let by_state = match task.eligibility.records {
            RecordEligibility::Open => !terminal,
            RecordEligibility::Closed => terminal,
            RecordEligibility::All => true,
        };
        let in_window = task.eligibility.lookback_days.map_or(true, |days| {
            record.source_last_modified >= as_of - Duration::days(i64::from(days))
        });
        let status = record.status.as_deref().unwrap_or_default();
        let matches_status = |list: &[String]| list.iter().any(|s| s.eq_ignore_ascii_case(status.trim()));
        by_state
            && in_window
            && (task.row_filter.status_in.is_empty() || matches_status(&task.row_filter.status_in))
            && !matches_status(&task.row_filter.status_not_in)
    }

    /// Every value the task's output can draw on for one record.
    fn row(&self, task: &TaskDefinition, ctx: &RowContext<'_>) -> Row {
        let mut row = Row::new();
        let canonical = TRACE_COLUMNS
            .iter()
            .copied()
            .chain([COL_STATUS])
            .chain(task.features.iter().map(String::as_str))
            .chain(task.label.iter().map(String::as_str))
            .chain(task.group_by.iter().map(String::as_str))
            .chain(task.row_filter.require_present.iter().map(String::as_str))
            .chain(task.aggregates.iter().filter_map(|a| a.field.as_deref()));
        for name in canonical {
            if task.derived(name).is_none() {
                row.insert(name.to_string(), ctx.record.column(name));
            }
        }
        for column in &task.derived_columns {
            row.insert(column.name.clone(), ctx.derive(&column.derivation));
        }
        row
    }

    fn keeps(task: &TaskDefinition, row: &Row) -> bool {
        let present = |name: &String| row.get(name).is_some_and(|value| !value.is_null());
        task.row_filter.require_present.iter().all(present)
            && (!task.kind.is_supervised() || task.label.iter().all(present))
    }

    /// Builds the task's dataset from `snapshot` as of its watermark.
    pub fn build(
        &self,
        snapshot: &CanonicalSnapshot,
        task: &TaskDefinition,
    ) -> Result<FeatureDataset, FeatureError> {
        task.validate()?;
        self.check_schema(task)?;
        self.check_versions(snapshot, task)?;

        let as_of = snapshot.watermark();
        let rows = snapshot
            .records()
            .filter(|record| self.eligible(task, record, as_of))
            .map(|record| {
                let ctx = RowContext {
                    record,
                    as_of,
                    terminal: &self.terminal,
                };
                self.row(task, &ctx)
            })
            .filter(|row| Self::keeps(task, row))
            .collect::<Vec<_>>();
        debug!(task = %task.task, eligible = rows.len(), "feature rows selected");

        let columns = if task.is_aggregate() {
            self.aggregate_columns(task, &rows)
        } else {
            self.row_columns(task, &rows)
        };
        let row_count = columns.first().map_or(0, |column| column.values.len());
        info!(
            task = %task.task,
            canonical_version = snapshot.version(),
            rows = row_count,
            "feature dataset built"
        );
        Ok(FeatureDataset {
            task: task.task.clone(),
            kind: task.kind,
            canonical_version: snapshot.version(),
            as_of,
            mapping_version: self.mapping.version.clone(),
            columns,
            row_count,
        })
    }

    fn row_columns(&self, task: &TaskDefinition, rows: &[Row]) -> Vec<Column> {
        let mut names: Vec<&str> = Vec::new();
        let ordered = TRACE_COLUMNS
            .iter()
            .copied()
            .chain(task.features.iter().map(String::as_str))
            .chain(task.derived_columns.iter().map(|c| c.name.as_str()))
            .chain(task.label.iter().map(String::as_str));
        for name in ordered {
            if !names.contains(&name) {
                names.push(name);
            }
        }
        names
            .into_iter()
            .map(|name| {
                let values = rows
                    .iter()
                    .map(|row| row.get(name).cloned().unwrap_or(FieldValue::Null))
                    .collect();
                let column = Column::new(name, self.column_type(task, name), values);
                if TRACE_COLUMNS.contains(&name) {
                    column.required()
                } else {
                    column
                }
            })
            .collect()
    }

    fn aggregate_columns(&self, task: &TaskDefinition, rows: &[Row]) -> Vec<Column> {
        // Grouped by rendered key; the first row's values represent the group.
        let mut groups: BTreeMap<Vec<Option<String>>, Vec<&Row>> = BTreeMap::new();
        for row in rows {
            let key = task
                .group_by
                .iter()
                .map(|name| row.get(name).and_then(FieldValue::render))
                .collect();
            groups.entry(key).or_default().push(row);
        }

        let mut columns = task
            .group_by
            .iter()
            .map(|name| {
                let values = groups
                    .values()
                    .map(|members| {
                        members
                            .first()
                            .and_then(|row| row.get(name))
                            .cloned()
                            .unwrap_or(FieldValue::Null)
                    })
                    .collect();
                Column::new(name.as_str(), self.column_type(task, name), values)
            })
            .collect::<Vec<_>>();

        for aggregate in &task.aggregates {
            let values = groups
                .values()
                .map(|members| self.aggregate(aggregate, members))
                .collect();
            columns.push(Column::new(
                aggregate.name.as_str(),
                aggregate.op.output_type(),
                values,
            ));
        }
        columns
    }

    fn aggregate(&self, aggregate: &Aggregate, members: &[&Row]) -> FieldValue {
        let field_values = || {
            members.iter().filter_map(|row| {
                aggregate
                    .field
                    .as_ref()
                    .and_then(|field| row.get(field))
                    .filter(|value| !value.is_null())
            })
        };
        let numbers = || field_values().filter_map(FieldValue::as_f64);
        match aggregate.op {
            AggregateOp::Count => FieldValue::Integer(members.len() as i64),
            AggregateOp::CountTerminal => FieldValue::Integer(
                members
                    .iter()
                    .filter(|row| {
                        row.get(COL_STATUS)
                            .and_then(FieldValue::as_text)
                            .is_some_and(|status| self.terminal.contains(status))
                    })
                    .count() as i64,
            ),
            AggregateOp::DistinctCount => FieldValue::Integer(
                field_values()
                    .filter_map(FieldValue::render)
                    .collect::<BTreeSet<_>>()
                    .len() as i64,
            ),
            AggregateOp::Sum => {
                let mut seen = false;
                let total = numbers().fold(0.0, |acc, n| {
                    seen = true;
                    acc + n
                });
                if seen {
                    FieldValue::Float(total)
                } else {
                    FieldValue::Null
                }
            }
            AggregateOp::Mean => {
                let (count, total) = numbers().fold((0usize, 0.0), |(c, t), n| (c + 1, t + n));
                if count == 0 {
                    FieldValue::Null
                } else {
                    FieldValue::Float(total / count as f64)
                }
            }
            AggregateOp::Min => numbers()
                .reduce(f64::min)
                .map(FieldValue::Float)
                .unwrap_or(FieldValue::Null),
            AggregateOp::Max => numbers()
                .reduce(f64::max)
                .map(FieldValue::Float)
                .unwrap_or(FieldValue::Null),
        }
    }
}
