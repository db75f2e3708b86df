//! Versioned canonical table: one Parquet snapshot per directory and a
//! `CURRENT` pointer that is the only mutation point.
//!
//! ```text
//! canonical/
//! ├── CURRENT                     # {"version": 2, "path": "versions/v000002", ...}
//! └── versions/
//!     ├── v000001/{incidents.parquet, manifest.json}
//!     └── v000002/{incidents.parquet, manifest.json}
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow_array::RecordBatch;
use chrono::{DateTime, Utc};
use incur_core::{
    CanonicalRecord, CanonicalSnapshot, FieldType, FieldValue, RunId, COL_CURATED_AT,
    COL_MAPPING_VERSION, COL_NATURAL_KEY, COL_RUN_ID, COL_SOURCE_LAST_MODIFIED, COL_STATUS,
};
use serde::{Deserialize, Serialize};
use tracing::{info, info_span, warn};

use crate::columnar::{batch_column_values, build_record_batch, encode_parquet, read_parquet_file, Column};
use crate::{io_err, publish_dir, replace_file, sha256_hex, stage_dir, CommitFailure, StoreError};

pub const TABLE_FILE: &str = "incidents.parquet";
const MANIFEST_FILE: &str = "manifest.json";
const POINTER_FILE: &str = "CURRENT";
const VERSIONS_DIR: &str = "versions";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TablePointer {
    pub version: u64,
    pub path: String,
    pub committed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    pub field_type: FieldType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionManifest {
    pub version: u64,
    pub parent_version: u64,
    pub run_id: Option<RunId>,
    pub committed_at: DateTime<Utc>,
    pub row_count: usize,
    pub mapping_versions: Vec<String>,
    pub columns: Vec<ColumnSpec>,
    pub file: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone)]
pub struct CanonicalStore {
    root: PathBuf,
}

impl CanonicalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn version_dir_name(version: u64) -> String {
        format!("v{version:06}")
    }

    fn versions_dir(&self) -> PathBuf {
        self.root.join(VERSIONS_DIR)
    }

    fn pointer_path(&self) -> PathBuf {
        self.root.join(POINTER_FILE)
    }

    pub fn current_pointer(&self) -> Result<Option<TablePointer>, StoreError> {
        let path = self.pointer_path();
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(io_err(&path)(err)),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| StoreError::Json { path, source })
    }

    fn current_version(&self) -> Result<u64, StoreError> {
        Ok(self.current_pointer()?.map(|p| p.version).unwrap_or(0))
    }

    /// Loads the version named by `CURRENT`; an uninitialized store is empty.
    pub fn open(&self) -> Result<CanonicalSnapshot, StoreError> {
        match self.current_pointer()? {
            Some(pointer) => Ok(self.load_version(pointer.version)?.1),
            None => Ok(CanonicalSnapshot::empty()),
        }
    }

    pub fn load_version(
        &self,
        version: u64,
    ) -> Result<(VersionManifest, CanonicalSnapshot), StoreError> {
        let dir = self.versions_dir().join(Self::version_dir_name(version));
        let manifest_path = dir.join(MANIFEST_FILE);
        let manifest_bytes = fs::read(&manifest_path).map_err(io_err(&manifest_path))?;
        let manifest: VersionManifest = serde_json::from_slice(&manifest_bytes).map_err(|source| {
            StoreError::Json {
                path: manifest_path.clone(),
                source,
            }
        })?;

        let table_path = dir.join(&manifest.file);
        let table_bytes = fs::read(&table_path).map_err(io_err(&table_path))?;
        let sha256 = sha256_hex(&table_bytes);
        if sha256 != manifest.sha256 {
            return Err(StoreError::Corrupt {
                path: table_path,
                reason: format!("sha256 {sha256} does not match manifest {}", manifest.sha256),
            });
        }

        let batches = read_parquet_file(&table_path)?;
        let records = decode_records(&batches)?;
        if records.len() != manifest.row_count {
            return Err(StoreError::Corrupt {
                path: table_path,
                reason: format!(
                    "decoded {} rows, manifest records {}",
                    records.len(),
                    manifest.row_count
                ),
            });
        }
        let snapshot = CanonicalSnapshot::from_records(version, manifest.committed_at, records);
        Ok((manifest, snapshot))
    }

    pub fn list_versions(&self) -> Result<Vec<u64>, StoreError> {
        let dir = self.versions_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(io_err(&dir)(err)),
        };
        let mut versions = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_dir())
            .filter_map(|entry| {
                entry
                    .file_name()
                    .to_str()
                    .and_then(|name| name.strip_prefix('v'))
                    .and_then(|digits| digits.parse::<u64>().ok())
            })
            .collect::<Vec<_>>();
        versions.sort_unstable();
        Ok(versions)
    }

    /// Writes `records` as the child of `parent` and swaps `CURRENT` to it.
    /// Either the whole version becomes current or nothing observable changes.
    ///
    /// `declared` carries the column types of the mapping in force. Rows
    /// written under an older mapping are conformed to those types, so the
    /// returned snapshot matches what was written.
    pub fn commit(
        &self,
        parent: &CanonicalSnapshot,
        records: BTreeMap<String, Arc<CanonicalRecord>>,
        declared: &BTreeMap<String, FieldType>,
        run_id: RunId,
        committed_at: DateTime<Utc>,
    ) -> Result<CanonicalSnapshot, CommitFailure> {
        let version = parent.version() + 1;
        let span = info_span!("canonical_commit", version, %run_id);
        let _guard = span.enter();

        let (records, column_types) = conform_records(records, declared);
        match self.try_commit(parent.version(), version, &records, &column_types, run_id, committed_at) {
            Ok(()) => {
                info!(rows = records.len(), "canonical version committed");
                Ok(CanonicalSnapshot::new(version, committed_at, records))
            }
            Err(source) => {
                warn!(error = %source, "canonical commit failed; previous version stays current");
                Err(CommitFailure { version, source })
            }
        }
    }

    fn ensure_pointer_at(&self, expected: u64) -> Result<(), StoreError> {
        let found = self.current_version()?;
        if found != expected {
            return Err(StoreError::PointerMoved { expected, found });
        }
        Ok(())
    }

    fn try_commit(
        &self,
        parent_version: u64,
        version: u64,
        records: &BTreeMap<String, Arc<CanonicalRecord>>,
        column_types: &BTreeMap<String, FieldType>,
        run_id: RunId,
        committed_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.ensure_pointer_at(parent_version)?;

        let (batch, columns) = encode_records(records, column_types)?;
        let table_bytes = encode_parquet(&batch)?;
        let manifest = VersionManifest {
            version,
            parent_version,
            run_id: Some(run_id),
            committed_at,
            row_count: records.len(),
            mapping_versions: records
                .values()
                .map(|r| r.mapping_version.clone())
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect(),
            columns,
            file: TABLE_FILE.to_string(),
            sha256: sha256_hex(&table_bytes),
            bytes: table_bytes.len() as u64,
        };

        let versions_dir = self.versions_dir();
        let staged = stage_dir(&versions_dir)?;
        let target = versions_dir.join(Self::version_dir_name(version));
        // A directory at `target` is left from a commit whose pointer swap failed.
        if let Err(err) = write_version_files(&staged, &table_bytes, &manifest) {
            let _ = fs::remove_dir_all(&staged);
            return Err(err);
        }
        publish_dir(&staged, &target)?;

        let swapped = self.ensure_pointer_at(parent_version).and_then(|()| {
            let pointer = TablePointer {
                version,
                path: format!("{VERSIONS_DIR}/{}", Self::version_dir_name(version)),
                committed_at,
            };
            let bytes = serde_json::to_vec_pretty(&pointer).map_err(|source| StoreError::Json {
                path: self.pointer_path(),
                source,
            })?;
            replace_file(&self.pointer_path(), &bytes)
        });
        if let Err(err) = swapped {
            let _ = fs::remove_dir_all(&target);
            return Err(err);
        }
        Ok(())
    }

    /// Removes all but the `keep` newest versions. The current version is
    /// always kept.
    pub fn prune(&self, keep: usize) -> Result<Vec<u64>, StoreError> {
        let current = self.current_version()?;
        let versions = self.list_versions()?;
        let cutoff = versions.len().saturating_sub(keep.max(1));
        let mut removed = Vec::new();
        for version in versions.into_iter().take(cutoff) {
            if version == current {
                continue;
            }
            let dir = self.versions_dir().join(Self::version_dir_name(version));
            fs::remove_dir_all(&dir).map_err(io_err(&dir))?;
            removed.push(version);
        }
        if !removed.is_empty() {
            info!(?removed, "pruned canonical versions");
        }
        Ok(removed)
    }
}

fn write_version_files(
    dir: &Path,
    table_bytes: &[u8],
    manifest: &VersionManifest,
) -> Result<(), StoreError> {
    let table_path = dir.join(&manifest.file);
    File::create(&table_path)
        .and_then(|mut file| {
            file.write_all(table_bytes)?;
            file.sync_all()
        })
        .map_err(io_err(&table_path))?;

    let manifest_path = dir.join(MANIFEST_FILE);
    let bytes = serde_json::to_vec_pretty(manifest).map_err(|source| StoreError::Json {
        path: manifest_path.clone(),
        source,
    })?;
    File::create(&manifest_path)
        .and_then(|mut file| {
            file.write_all(&bytes)?;
            file.sync_all()
        })
        .map_err(io_err(&manifest_path))
}

/// Column types for the next version: the declared ones, then the type of
/// the first value in key order for fields no longer declared. Values whose
/// type differs from their column are conformed; rows that change are copied.
fn conform_records(
    records: BTreeMap<String, Arc<CanonicalRecord>>,
    declared: &BTreeMap<String, FieldType>,
) -> (BTreeMap<String, Arc<CanonicalRecord>>, BTreeMap<String, FieldType>) {
    let mut column_types = declared.clone();
    for record in records.values() {
        for (name, value) in &record.fields {
            if let Some(field_type) = value.field_type() {
                column_types.entry(name.clone()).or_insert(field_type);
            }
        }
    }

    let mut conformed_rows = 0usize;
    let mut nulled_values = 0usize;
    let records = records
        .into_iter()
        .map(|(key, record)| {
            let mismatched = record.fields.iter().any(|(name, value)| {
                value
                    .field_type()
                    .is_some_and(|found| column_types.get(name) != Some(&found))
            });
            if !mismatched {
                return (key, record);
            }
            conformed_rows += 1;
            let mut copy = CanonicalRecord::clone(&record);
            copy.fields = record
                .fields
                .iter()
                .filter_map(|(name, value)| {
                    let conformed = match column_types.get(name) {
                        Some(target) => value.conform_to(*target),
                        None => value.clone(),
                    };
                    if conformed.is_null() && !value.is_null() {
                        nulled_values += 1;
                    }
                    (!conformed.is_null()).then(|| (name.clone(), conformed))
                })
                .collect();
            (key, Arc::new(copy))
        })
        .collect::<BTreeMap<_, _>>();
    if conformed_rows > 0 {
        warn!(
            rows = conformed_rows,
            nulled = nulled_values,
            "conformed rows written under a different column type"
        );
    }
    (records, column_types)
}

fn encode_records(
    records: &BTreeMap<String, Arc<CanonicalRecord>>,
    column_types: &BTreeMap<String, FieldType>,
) -> Result<(RecordBatch, Vec<ColumnSpec>), StoreError> {
    let rows = records.values().collect::<Vec<_>>();

    let mut columns = vec![
        Column::new(
            COL_NATURAL_KEY,
            FieldType::Text,
            rows.iter().map(|r| FieldValue::Text(r.natural_key.clone())).collect(),
        )
        .required(),
        Column::new(COL_STATUS, FieldType::Text, rows.iter().map(|r| r.column(COL_STATUS)).collect()),
        Column::new(
            COL_SOURCE_LAST_MODIFIED,
            FieldType::Timestamp,
            rows.iter().map(|r| FieldValue::Timestamp(r.source_last_modified)).collect(),
        )
        .required(),
        Column::new(
            COL_CURATED_AT,
            FieldType::Timestamp,
            rows.iter().map(|r| FieldValue::Timestamp(r.curated_at)).collect(),
        )
        .required(),
        Column::new(
            COL_MAPPING_VERSION,
            FieldType::Text,
            rows.iter().map(|r| FieldValue::Text(r.mapping_version.clone())).collect(),
        )
        .required(),
        Column::new(
            COL_RUN_ID,
            FieldType::Integer,
            rows.iter().map(|r| r.column(COL_RUN_ID)).collect(),
        )
        .required(),
    ];
    for (name, field_type) in column_types {
        columns.push(Column::new(
            name.as_str(),
            *field_type,
            rows.iter().map(|r| r.column(name)).collect(),
        ));
    }

    let specs = columns
        .iter()
        .map(|c| ColumnSpec {
            name: c.name.clone(),
            field_type: c.field_type,
        })
        .collect();
    Ok((build_record_batch(&columns)?, specs))
}

fn required_column(batch: &RecordBatch, name: &str) -> Result<Vec<FieldValue>, StoreError> {
    batch_column_values(batch, name)?.ok_or_else(|| StoreError::Decode {
        column: name.to_string(),
        reason: "required column missing".to_string(),
    })
}

fn decode_error(column: &str, reason: &str) -> StoreError {
    StoreError::Decode {
        column: column.to_string(),
        reason: reason.to_string(),
    }
}

fn decode_records(batches: &[RecordBatch]) -> Result<Vec<CanonicalRecord>, StoreError> {
    const CORE: [&str; 6] = [
        COL_NATURAL_KEY,
        COL_STATUS,
        COL_SOURCE_LAST_MODIFIED,
        COL_CURATED_AT,
        COL_MAPPING_VERSION,
        COL_RUN_ID,
    ];

    let mut records = Vec::new();
    for batch in batches {
        let keys = required_column(batch, COL_NATURAL_KEY)?;
        let statuses = required_column(batch, COL_STATUS)?;
        let modified = required_column(batch, COL_SOURCE_LAST_MODIFIED)?;
        let curated = required_column(batch, COL_CURATED_AT)?;
        let mapping_versions = required_column(batch, COL_MAPPING_VERSION)?;
        let run_ids = required_column(batch, COL_RUN_ID)?;

        let mut field_columns = Vec::new();
        for field in batch.schema().fields() {
            let name = field.name();
            if CORE.contains(&name.as_str()) {
                continue;
            }
            if let Some(values) = batch_column_values(batch, name)? {
                field_columns.push((name.clone(), values));
            }
        }

        for row in 0..batch.num_rows() {
            let natural_key = keys[row]
                .as_text()
                .ok_or_else(|| decode_error(COL_NATURAL_KEY, "null natural key"))?
                .to_string();
            let run_id = match run_ids[row] {
                FieldValue::Integer(n) if n >= 0 => RunId(n as u64),
                _ => return Err(decode_error(COL_RUN_ID, "run id must be a non-negative integer")),
            };
            let fields = field_columns
                .iter()
                .filter(|(_, values)| !values[row].is_null())
                .map(|(name, values)| (name.clone(), values[row].clone()))
                .collect();
            records.push(CanonicalRecord {
                natural_key,
                source_last_modified: modified[row]
                    .as_timestamp()
                    .ok_or_else(|| decode_error(COL_SOURCE_LAST_MODIFIED, "null timestamp"))?,
                status: statuses[row].as_text().map(str::to_string),
                mapping_version: mapping_versions[row]
                    .as_text()
                    .ok_or_else(|| decode_error(COL_MAPPING_VERSION, "null mapping version"))?
                    .to_string(),
                run_id,
                curated_at: curated[row]
                    .as_timestamp()
                    .ok_or_else(|| decode_error(COL_CURATED_AT, "null timestamp"))?,
                fields,
            });
        }
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn ts(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 24, hour, 0, 0).single().unwrap()
    }

    fn record(key: &str, status: &str, hour: u32) -> CanonicalRecord {
        CanonicalRecord {
            natural_key: key.to_string(),
            source_last_modified: ts(hour),
            status: Some(status.to_string()),
            mapping_version: "v1".to_string(),
            run_id: RunId(1),
            curated_at: ts(hour + 1),
            fields: BTreeMap::from([
                ("assignment_group_id".to_string(), FieldValue::Text("G1".into())),
                ("priority".to_string(), FieldValue::Integer(2)),
            ]),
        }
    }

    fn declared() -> BTreeMap<String, FieldType> {
        BTreeMap::from([
            ("assignment_group_id".to_string(), FieldType::Text),
            ("priority".to_string(), FieldType::Integer),
        ])
    }

    fn table(records: Vec<CanonicalRecord>) -> BTreeMap<String, Arc<CanonicalRecord>> {
        records
            .into_iter()
            .map(|r| (r.natural_key.clone(), Arc::new(r)))
            .collect()
    }

    #[test]
    fn uninitialized_store_opens_empty() {
        let dir = tempdir().expect("tempdir");
        let store = CanonicalStore::new(dir.path());
        let snapshot = store.open().expect("open");
        assert_eq!(snapshot.version(), 0);
        assert!(snapshot.is_empty());
        assert!(store.current_pointer().unwrap().is_none());
    }

    #[test]
    fn commit_then_reopen_round_trips_records() {
        let dir = tempdir().expect("tempdir");
        let store = CanonicalStore::new(dir.path());
        let mut sparse = record("INC2", "Open", 3);
        sparse.fields.remove("priority");
        let committed = store
            .commit(
                &CanonicalSnapshot::empty(),
                table(vec![record("INC1", "Closed", 1), sparse]),
                &declared(),
                RunId(1),
                ts(6),
            )
            .expect("commit");
        assert_eq!(committed.version(), 1);

        let reopened = store.open().expect("reopen");
        assert_eq!(reopened.version(), 1);
        assert_eq!(reopened.committed_at(), ts(6));
        assert_eq!(reopened.len(), 2);
        for original in committed.records() {
            assert_eq!(reopened.get(&original.natural_key), Some(original));
        }

        let (manifest, _) = store.load_version(1).expect("manifest");
        assert_eq!(manifest.parent_version, 0);
        assert_eq!(manifest.mapping_versions, vec!["v1".to_string()]);
        assert!(manifest
            .columns
            .iter()
            .any(|c| c.name == "priority" && c.field_type == FieldType::Integer));
    }

    #[test]
    fn failed_swap_keeps_previous_version_current() {
        let dir = tempdir().expect("tempdir");
        let store = CanonicalStore::new(dir.path());
        let v1 = store
            .commit(&CanonicalSnapshot::empty(), table(vec![record("INC1", "Open", 1)]), &declared(), RunId(1), ts(2))
            .expect("v1");

        // A regular file where the next version directory must go.
        std::fs::write(dir.path().join(VERSIONS_DIR).join("v000002"), b"blocker").unwrap();
        let failure = store
            .commit(&v1, table(vec![record("INC1", "Closed", 4)]), &declared(), RunId(2), ts(5))
            .unwrap_err();
        assert_eq!(failure.version, 2);

        let reopened = store.open().expect("reopen");
        assert_eq!(reopened.version(), 1);
        assert_eq!(reopened.get("INC1").unwrap().status.as_deref(), Some("Open"));
        let leftovers = std::fs::read_dir(dir.path().join(VERSIONS_DIR))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn stale_parent_is_rejected() {
        let dir = tempdir().expect("tempdir");
        let store = CanonicalStore::new(dir.path());
        let empty = CanonicalSnapshot::empty();
        store
            .commit(&empty, table(vec![record("INC1", "Open", 1)]), &declared(), RunId(1), ts(2))
            .expect("v1");
        let failure = store
            .commit(&empty, table(vec![record("INC9", "Open", 1)]), &declared(), RunId(2), ts(3))
            .unwrap_err();
        assert!(matches!(
            failure.source,
            StoreError::PointerMoved { expected: 0, found: 1 }
        ));
        assert!(store.open().unwrap().get("INC9").is_none());
    }

    #[test]
    fn retyped_fields_conform_rows_from_older_mappings() {
        let dir = tempdir().expect("tempdir");
        let store = CanonicalStore::new(dir.path());
        let mut legacy = record("INC1", "Closed", 1);
        legacy.mapping_version = "v0".into();
        legacy.fields.insert("priority".into(), FieldValue::Text("2 - High".into()));
        legacy.fields.insert("impact".into(), FieldValue::Text("3".into()));
        let mut numeric = record("INC2", "Open", 1);
        numeric.mapping_version = "v0".into();
        numeric.fields.insert("priority".into(), FieldValue::Text("4".into()));

        let committed = store
            .commit(
                &CanonicalSnapshot::empty(),
                table(vec![legacy, numeric, record("INC3", "Open", 2)]),
                &declared(),
                RunId(2),
                ts(3),
            )
            .expect("commit");

        let inc1 = committed.get("INC1").unwrap();
        assert_eq!(inc1.column("priority"), FieldValue::Null);
        assert!(!inc1.fields.contains_key("priority"));
        // Fields the mapping no longer declares keep their own type.
        assert_eq!(inc1.column("impact"), FieldValue::Text("3".into()));
        assert_eq!(inc1.mapping_version, "v0");
        assert_eq!(committed.get("INC2").unwrap().column("priority"), FieldValue::Integer(4));

        let reopened = store.open().expect("reopen");
        for original in committed.records() {
            assert_eq!(reopened.get(&original.natural_key), Some(original));
        }
        let (manifest, _) = store.load_version(1).expect("manifest");
        assert_eq!(manifest.mapping_versions, vec!["v0".to_string(), "v1".to_string()]);
        assert!(manifest
            .columns
            .iter()
            .any(|c| c.name == "priority" && c.field_type == FieldType::Integer));
    }

    #[test]
    fn prune_keeps_newest_versions() {
        let dir = tempdir().expect("tempdir");
        let store = CanonicalStore::new(dir.path());
        let mut snapshot = CanonicalSnapshot::empty();
        for hour in 1..=4 {
            snapshot = store
                .commit(&snapshot, table(vec![record("INC1", "Open", hour)]), &declared(), RunId(hour as u64), ts(hour + 1))
                .expect("commit");
        }
        let removed = store.prune(2).expect("prune");
        assert_eq!(removed, vec![1, 2]);
        assert_eq!(store.list_versions().unwrap(), vec![3, 4]);
        assert_eq!(store.open().unwrap().version(), 4);
    }
}
