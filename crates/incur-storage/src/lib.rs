//! Durable storage for incident curation: append-only raw snapshots, versioned
//! canonical tables behind a swappable pointer, and the run ledger.

mod canonical;
mod columnar;
mod ledger;
mod raw;

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;
use arrow_schema::ArrowError;
use incur_core::FieldType;
use parquet::errors::ParquetError;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::warn;
use uuid::Uuid;

pub use canonical::{CanonicalStore, ColumnSpec, TablePointer, VersionManifest, TABLE_FILE};
pub use columnar::{
    arrow_type, batch_column_values, build_record_batch, encode_parquet, read_parquet_file,
    Column,
};
pub use ledger::RunLedger;
pub use raw::{page_records, RawPageEntry, RawRunManifest, RawSnapshot, RawSnapshotStore, RawSnapshotWriter};

pub const CRATE_NAME: &str = "incur-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("json error at {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("{context}: {source}")]
    Arrow {
        context: String,
        #[source]
        source: ArrowError,
    },
    #[error("{context}: {source}")]
    Parquet {
        context: String,
        #[source]
        source: ParquetError,
    },
    #[error("column `{column}` is typed {expected} but holds a {found} value")]
    ColumnTypeConflict {
        column: String,
        expected: FieldType,
        found: FieldType,
    },
    #[error("cannot decode column `{column}`: {reason}")]
    Decode { column: String, reason: String },
    #[error("table pointer moved: expected version {expected}, found {found}")]
    PointerMoved { expected: u64, found: u64 },
    #[error("corrupt table file {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },
}

/// Fatal failure of the single atomic swap of a canonical version. The
/// previous version stays current.
#[derive(Debug, Error)]
#[error("commit of canonical version {version} failed")]
pub struct CommitFailure {
    pub version: u64,
    #[source]
    pub source: StoreError,
}

pub(crate) fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

fn temp_name(len: usize) -> String {
    format!(".{}.{}.tmp", Uuid::new_v4(), len)
}

/// Replace `path` with `bytes` through a synced temp file and an atomic rename.
pub fn replace_file(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent).map_err(io_err(parent))?;
    let temp_path = parent.join(temp_name(bytes.len()));

    let written = OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .and_then(|mut file| {
            file.write_all(bytes)?;
            file.sync_all()
        });
    if let Err(err) = written {
        let _ = std::fs::remove_file(&temp_path);
        return Err(io_err(&temp_path)(err));
    }

    if let Err(err) = std::fs::rename(&temp_path, path) {
        let _ = std::fs::remove_file(&temp_path);
        return Err(io_err(path)(err));
    }
    Ok(())
}

/// Create a hidden staging directory under `parent`, to be published with
/// [`publish_dir`].
pub fn stage_dir(parent: &Path) -> Result<PathBuf, StoreError> {
    std::fs::create_dir_all(parent).map_err(io_err(parent))?;
    let staged = parent.join(temp_name(0));
    std::fs::create_dir(&staged).map_err(io_err(&staged))?;
    Ok(staged)
}

/// Rename a staged directory into place. A directory already at `target` is
/// moved aside first and only removed once the staged one is published, so a
/// failed publish leaves the previous contents at `target`.
pub fn publish_dir(staged: &Path, target: &Path) -> Result<(), StoreError> {
    let parent = target.parent().unwrap_or_else(|| Path::new("."));
    let aside = if target.is_dir() {
        let aside = parent.join(temp_name(0));
        if let Err(err) = std::fs::rename(target, &aside) {
            let _ = std::fs::remove_dir_all(staged);
            return Err(io_err(target)(err));
        }
        Some(aside)
    } else {
        None
    };

    if let Err(err) = std::fs::rename(staged, target) {
        let _ = std::fs::remove_dir_all(staged);
        if let Some(aside) = &aside {
            let _ = std::fs::rename(aside, target);
        }
        return Err(io_err(target)(err));
    }
    if let Some(aside) = aside {
        if let Err(err) = std::fs::remove_dir_all(&aside) {
            warn!(path = %aside.display(), error = %err, "could not remove replaced directory");
        }
    }
    Ok(())
}

/// Async write through a temp file and rename. With `overwrite == false` an
/// existing file is an error.
pub async fn write_file_atomic(path: &Path, bytes: &[u8], overwrite: bool) -> anyhow::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    if !overwrite
        && fs::try_exists(path)
            .await
            .with_context(|| format!("checking {}", path.display()))?
    {
        anyhow::bail!("{} already exists and is write-once", path.display());
    }

    let temp_path = parent.join(temp_name(bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    let written = async {
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await
    }
    .await;
    drop(file);
    if let Err(err) = written {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| format!("writing temp file {}", temp_path.display()));
    }

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn hashing_is_stable() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn replace_file_leaves_no_temp_files() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("CURRENT");
        replace_file(&path, b"one").expect("first write");
        replace_file(&path, b"two").expect("second write");

        assert_eq!(std::fs::read(&path).unwrap(), b"two");
        let leftovers = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn publish_dir_replaces_existing_target() {
        let dir = tempdir().expect("tempdir");
        let target = dir.path().join("v000001");
        std::fs::create_dir_all(&target).unwrap();
        std::fs::write(target.join("old.txt"), b"old").unwrap();

        let staged = stage_dir(dir.path()).expect("stage");
        std::fs::write(staged.join("new.txt"), b"new").unwrap();
        publish_dir(&staged, &target).expect("publish");

        assert!(target.join("new.txt").exists());
        assert!(!target.join("old.txt").exists());
        assert!(!staged.exists());
        let leftovers = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn failed_publish_keeps_the_existing_target() {
        let dir = tempdir().expect("tempdir");
        let target = dir.path().join("v000001");
        std::fs::create_dir_all(&target).unwrap();
        std::fs::write(target.join("old.txt"), b"old").unwrap();

        let missing = dir.path().join(".never-staged.tmp");
        assert!(publish_dir(&missing, &target).is_err());
        assert_eq!(std::fs::read(target.join("old.txt")).unwrap(), b"old");
    }

    #[test]
    fn commit_failure_names_its_cause_once() {
        let failure = CommitFailure {
            version: 2,
            source: StoreError::PointerMoved { expected: 1, found: 3 },
        };
        let chain = format!("{:#}", anyhow::Error::new(failure));
        assert_eq!(
            chain,
            "commit of canonical version 2 failed: table pointer moved: expected version 1, found 3"
        );
    }

    #[tokio::test]
    async fn write_once_refuses_to_overwrite() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("page_001.json");
        write_file_atomic(&path, b"{}", false).await.expect("first");
        let err = write_file_atomic(&path, b"[]", false).await.unwrap_err();
        assert!(err.to_string().contains("write-once"));
        write_file_atomic(&path, b"[]", true).await.expect("overwrite allowed");
        assert_eq!(std::fs::read(&path).unwrap(), b"[]");
    }
}
