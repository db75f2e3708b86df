//! Append-only raw snapshot store. Each run owns one folder of write-once
//! source pages; a run becomes visible to readers only once sealed with its
//! manifest.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use incur_core::{IngestionMode, PullWindow, RawDocument, RawRecord, Run, RunId};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use tokio::fs;
use tracing::{debug, info, info_span, Instrument};

use crate::{sha256_hex, write_file_atomic};

const DATASET_DIR: &str = "incidents_raw";
const MANIFEST_FILE: &str = "manifest.json";
const PAGE_FORMAT: &str = "json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawPageEntry {
    pub page: u32,
    pub file: String,
    pub records: usize,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRunManifest {
    pub run_id: RunId,
    pub mode: IngestionMode,
    pub started_at: DateTime<Utc>,
    pub saved_at: DateTime<Utc>,
    #[serde(default)]
    pub pull_window: PullWindow,
    pub source_id: String,
    pub page_count: usize,
    pub record_count: usize,
    pub format: String,
    pub pages: Vec<RawPageEntry>,
}

/// Records of one page file. Accepts the source envelope `{"result": [...]}`
/// or a bare array.
pub fn page_records(bytes: &[u8]) -> Result<Vec<JsonValue>> {
    let value: JsonValue = serde_json::from_slice(bytes).context("parsing raw page json")?;
    match value {
        JsonValue::Array(items) => Ok(items),
        JsonValue::Object(mut map) => match map.remove("result") {
            Some(JsonValue::Array(items)) => Ok(items),
            Some(other) => bail!("page `result` must be an array, found {}", json_kind(&other)),
            None => bail!("page object has no `result` array"),
        },
        other => bail!("page must be an array or envelope, found {}", json_kind(&other)),
    }
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

#[derive(Debug, Clone)]
pub struct RawSnapshotStore {
    root: PathBuf,
}

impl RawSnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn dataset_dir(&self) -> PathBuf {
        self.root.join(DATASET_DIR)
    }

    pub fn run_dir_name(run_id: RunId, started_at: DateTime<Utc>) -> String {
        format!(
            "run_ts={}_run={:06}",
            started_at.format("%Y%m%dT%H%M%SZ"),
            run_id.0
        )
    }

    /// Opens the run folder for page writes. A run that is already sealed
    /// cannot be reopened.
    pub async fn begin(&self, run: &Run, source_id: &str) -> Result<RawSnapshotWriter> {
        let dir = self
            .dataset_dir()
            .join(Self::run_dir_name(run.run_id, run.started_at));
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating raw run directory {}", dir.display()))?;
        if fs::try_exists(dir.join(MANIFEST_FILE))
            .await
            .with_context(|| format!("checking raw manifest in {}", dir.display()))?
        {
            bail!("raw snapshot for {} is already sealed", run.run_id);
        }
        Ok(RawSnapshotWriter {
            dir,
            run_id: run.run_id,
            mode: run.mode,
            started_at: run.started_at,
            pull_window: run.pull_window,
            source_id: source_id.to_string(),
            pages: Vec::new(),
        })
    }

    /// Sealed runs in ascending run id order. Unsealed folders are skipped.
    pub async fn list_runs(&self) -> Result<Vec<(PathBuf, RawRunManifest)>> {
        let dataset_dir = self.dataset_dir();
        if !fs::try_exists(&dataset_dir)
            .await
            .with_context(|| format!("checking {}", dataset_dir.display()))?
        {
            return Ok(Vec::new());
        }

        let mut runs = Vec::new();
        let mut entries = fs::read_dir(&dataset_dir)
            .await
            .with_context(|| format!("listing {}", dataset_dir.display()))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("listing {}", dataset_dir.display()))?
        {
            let dir = entry.path();
            let manifest_path = dir.join(MANIFEST_FILE);
            if !fs::try_exists(&manifest_path).await.unwrap_or(false) {
                debug!(dir = %dir.display(), "skipping unsealed raw run");
                continue;
            }
            let bytes = fs::read(&manifest_path)
                .await
                .with_context(|| format!("reading {}", manifest_path.display()))?;
            let manifest: RawRunManifest = serde_json::from_slice(&bytes)
                .with_context(|| format!("parsing {}", manifest_path.display()))?;
            runs.push((dir, manifest));
        }
        runs.sort_by_key(|(_, manifest)| manifest.run_id);
        Ok(runs)
    }

    pub async fn latest_run(&self) -> Result<Option<RawRunManifest>> {
        Ok(self.list_runs().await?.pop().map(|(_, manifest)| manifest))
    }

    /// Reads a sealed run back in page order, verifying every page hash.
    pub async fn load_run(&self, run_id: RunId) -> Result<RawSnapshot> {
        let span = info_span!("raw_load", %run_id);
        async {
            let (dir, manifest) = self
                .list_runs()
                .await?
                .into_iter()
                .find(|(_, manifest)| manifest.run_id == run_id)
                .with_context(|| format!("no sealed raw snapshot for {run_id}"))?;

            let mut records = Vec::with_capacity(manifest.record_count);
            for entry in &manifest.pages {
                let path = dir.join(&entry.file);
                let bytes = fs::read(&path)
                    .await
                    .with_context(|| format!("reading raw page {}", path.display()))?;
                let sha256 = sha256_hex(&bytes);
                if sha256 != entry.sha256 {
                    bail!(
                        "raw page {} hash {} does not match manifest {}",
                        path.display(),
                        sha256,
                        entry.sha256
                    );
                }
                let page = page_records(&bytes)
                    .with_context(|| format!("decoding raw page {}", path.display()))?;
                for document in page {
                    records.push(RawRecord {
                        ordinal: records.len() as u64,
                        document: RawDocument::new(document),
                    });
                }
            }
            if records.len() != manifest.record_count {
                bail!(
                    "raw snapshot {run_id} holds {} records, manifest records {}",
                    records.len(),
                    manifest.record_count
                );
            }
            info!(pages = manifest.page_count, records = records.len(), "raw snapshot loaded");
            Ok(RawSnapshot { manifest, records })
        }
        .instrument(span)
        .await
    }
}

/// Writer for one unsealed run. Sealing consumes it, so no page can follow
/// the manifest.
#[derive(Debug)]
pub struct RawSnapshotWriter {
    dir: PathBuf,
    run_id: RunId,
    mode: IngestionMode,
    started_at: DateTime<Utc>,
    pull_window: PullWindow,
    source_id: String,
    pages: Vec<RawPageEntry>,
}

impl RawSnapshotWriter {
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn record_count(&self) -> usize {
        self.pages.iter().map(|p| p.records).sum()
    }

    pub async fn append_page(&mut self, records: &[JsonValue]) -> Result<RawPageEntry> {
        let page = self.pages.len() as u32 + 1;
        let file = format!("page_{page:03}.{PAGE_FORMAT}");
        let bytes = serde_json::to_vec_pretty(&json!({ "result": records }))
            .context("encoding raw page")?;
        write_file_atomic(&self.dir.join(&file), &bytes, false).await?;

        let entry = RawPageEntry {
            page,
            file,
            records: records.len(),
            sha256: sha256_hex(&bytes),
            bytes: bytes.len() as u64,
        };
        debug!(run_id = %self.run_id, page, records = entry.records, "raw page written");
        self.pages.push(entry.clone());
        Ok(entry)
    }

    pub async fn seal(self, saved_at: DateTime<Utc>) -> Result<RawRunManifest> {
        let manifest = RawRunManifest {
            run_id: self.run_id,
            mode: self.mode,
            started_at: self.started_at,
            saved_at,
            pull_window: self.pull_window,
            source_id: self.source_id.clone(),
            page_count: self.pages.len(),
            record_count: self.record_count(),
            format: PAGE_FORMAT.to_string(),
            pages: self.pages,
        };
        let bytes = serde_json::to_vec_pretty(&manifest).context("encoding raw manifest")?;
        write_file_atomic(&self.dir.join(MANIFEST_FILE), &bytes, false).await?;
        info!(
            run_id = %manifest.run_id,
            pages = manifest.page_count,
            records = manifest.record_count,
            "raw snapshot sealed"
        );
        Ok(manifest)
    }
}

#[derive(Debug, Clone)]
pub struct RawSnapshot {
    pub manifest: RawRunManifest,
    records: Vec<RawRecord>,
}

impl RawSnapshot {
    pub fn run_id(&self) -> RunId {
        self.manifest.run_id
    }

    pub fn records(&self) -> &[RawRecord] {
        &self.records
    }

    pub fn into_records(self) -> Vec<RawRecord> {
        self.records
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn run(id: u64) -> Run {
        let started_at = Utc.with_ymd_and_hms(2026, 2, 24, 9, 30, id as u32).single().unwrap();
        Run::start(RunId(id), IngestionMode::IncrementalOpen, started_at, PullWindow::default())
    }

    #[test]
    fn page_envelopes_and_bare_arrays_parse() {
        let enveloped = page_records(br#"{"result": [{"number": "INC1"}]}"#).unwrap();
        assert_eq!(enveloped, vec![json!({"number": "INC1"})]);
        assert_eq!(page_records(b"[1, 2]").unwrap().len(), 2);
        assert!(page_records(br#"{"records": []}"#).is_err());
        assert!(page_records(br#""text""#).is_err());
    }

    #[tokio::test]
    async fn sealed_run_loads_in_page_order() {
        let dir = tempdir().expect("tempdir");
        let store = RawSnapshotStore::new(dir.path());
        let run = run(1);

        let mut writer = store.begin(&run, "fixture").await.expect("begin");
        writer
            .append_page(&[json!({"number": "INC1"}), json!({"number": "INC2"})])
            .await
            .expect("page 1");
        writer.append_page(&[json!({"number": "INC1"})]).await.expect("page 2");
        assert!(writer.dir().join("page_002.json").exists());
        let manifest = writer.seal(run.started_at).await.expect("seal");
        assert_eq!(manifest.page_count, 2);
        assert_eq!(manifest.record_count, 3);

        let snapshot = store.load_run(RunId(1)).await.expect("load");
        let ordinals = snapshot.records().iter().map(|r| r.ordinal).collect::<Vec<_>>();
        assert_eq!(ordinals, vec![0, 1, 2]);
        assert_eq!(
            snapshot.records()[2].document.get_path("number"),
            Some(&json!("INC1"))
        );
    }

    #[tokio::test]
    async fn unsealed_runs_are_invisible_and_sealed_runs_are_closed() {
        let dir = tempdir().expect("tempdir");
        let store = RawSnapshotStore::new(dir.path());

        let mut first = store.begin(&run(1), "fixture").await.unwrap();
        first.append_page(&[json!({"number": "INC1"})]).await.unwrap();
        first.seal(run(1).started_at).await.unwrap();

        let mut pending = store.begin(&run(2), "fixture").await.unwrap();
        pending.append_page(&[json!({"number": "INC2"})]).await.unwrap();

        let latest = store.latest_run().await.unwrap().expect("a sealed run");
        assert_eq!(latest.run_id, RunId(1));
        assert!(store.load_run(RunId(2)).await.is_err());
        assert!(store.begin(&run(1), "fixture").await.is_err());
    }

    #[tokio::test]
    async fn tampered_page_fails_the_load() {
        let dir = tempdir().expect("tempdir");
        let store = RawSnapshotStore::new(dir.path());
        let mut writer = store.begin(&run(3), "fixture").await.unwrap();
        writer.append_page(&[json!({"number": "INC1"})]).await.unwrap();
        let page_path = writer.dir().join("page_001.json");
        writer.seal(run(3).started_at).await.unwrap();

        std::fs::write(&page_path, br#"{"result": []}"#).unwrap();
        let err = store.load_run(RunId(3)).await.unwrap_err();
        assert!(err.to_string().contains("does not match manifest"));
    }
}
