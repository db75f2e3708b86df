use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use incur_storage::{publish_dir, sha256_hex, stage_dir, ColumnSpec, StoreError};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{FeatureDataset, FeatureError, TaskKind};

const MANIFEST_FILE: &str = "manifest.json";

/// Build manifest written next to each feature dataset. It carries no wall
/// clock time, so a rebuild from the same snapshot reproduces it exactly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureManifest {
    pub task: String,
    pub kind: TaskKind,
    pub canonical_version: u64,
    pub as_of: DateTime<Utc>,
    pub mapping_version: String,
    pub row_count: usize,
    pub columns: Vec<ColumnSpec>,
    pub file: String,
    pub sha256: String,
    pub bytes: u64,
}

/// `features/<task>/v<canonical version>/`.
#[derive(Debug, Clone)]
pub struct FeatureStore {
    root: PathBuf,
}

fn write_synced(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    File::create(path)
        .and_then(|mut file| {
            file.write_all(bytes)?;
            file.sync_all()
        })
        .map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })
}

impl FeatureStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dataset_dir(&self, task: &str, canonical_version: u64) -> PathBuf {
        self.root
            .join(task)
            .join(format!("v{canonical_version:06}"))
    }

    /// Writes the dataset and its manifest, replacing an earlier build of the
    /// same task and canonical version.
    pub fn write(&self, dataset: &FeatureDataset) -> Result<FeatureManifest, FeatureError> {
        let bytes = dataset.to_parquet()?;
        let manifest = FeatureManifest {
            task: dataset.task.clone(),
            kind: dataset.kind,
            canonical_version: dataset.canonical_version,
            as_of: dataset.as_of,
            mapping_version: dataset.mapping_version.clone(),
            row_count: dataset.row_count,
            columns: dataset
                .columns
                .iter()
                .map(|column| ColumnSpec {
                    name: column.name.clone(),
                    field_type: column.field_type,
                })
                .collect(),
            file: format!("{}.parquet", dataset.task),
            sha256: sha256_hex(&bytes),
            bytes: bytes.len() as u64,
        };

        let target = self.dataset_dir(&dataset.task, dataset.canonical_version);
        let parent = target.parent().unwrap_or(&self.root);
        let staged = stage_dir(parent)?;
        let manifest_bytes = serde_json::to_vec_pretty(&manifest).map_err(|source| StoreError::Json {
            path: staged.join(MANIFEST_FILE),
            source,
        })?;
        let written = write_synced(&staged.join(&manifest.file), &bytes)
            .and_then(|()| write_synced(&staged.join(MANIFEST_FILE), &manifest_bytes));
        if let Err(err) = written {
            let _ = std::fs::remove_dir_all(&staged);
            return Err(err.into());
        }
        publish_dir(&staged, &target)?;

        info!(
            task = %manifest.task,
            canonical_version = manifest.canonical_version,
            rows = manifest.row_count,
            path = %target.display(),
            "feature dataset written"
        );
        Ok(manifest)
    }

    pub fn read_manifest(
        &self,
        task: &str,
        canonical_version: u64,
    ) -> Result<FeatureManifest, StoreError> {
        let path = self.dataset_dir(task, canonical_version).join(MANIFEST_FILE);
        let bytes = std::fs::read(&path).map_err(|source| StoreError::Io {
            path: path.clone(),
            source,
        })?;
        serde_json::from_slice(&bytes).map_err(|source| StoreError::Json { path, source })
    }
}
