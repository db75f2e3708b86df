use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use incur_core::{IngestionMode, PullWindow, Run, RunId, RunStatus};
use tokio::fs;
use tracing::info;

use crate::write_file_atomic;

/// Run records, one JSON file per run under `runs/`.
#[derive(Debug, Clone)]
pub struct RunLedger {
    root: PathBuf,
}

impl RunLedger {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn run_path(&self, run_id: RunId) -> PathBuf {
        self.root.join(format!("{run_id}.json"))
    }

    async fn save(&self, run: &Run, overwrite: bool) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(run).context("encoding run record")?;
        write_file_atomic(&self.run_path(run.run_id), &bytes, overwrite).await
    }

    /// Allocates the next run id and persists the pending run.
    pub async fn begin(
        &self,
        mode: IngestionMode,
        started_at: DateTime<Utc>,
        pull_window: PullWindow,
    ) -> Result<Run> {
        let run_id = self
            .list()
            .await?
            .last()
            .map(|run| run.run_id.next())
            .unwrap_or(RunId(1));
        let run = Run::start(run_id, mode, started_at, pull_window);
        self.save(&run, false)
            .await
            .with_context(|| format!("allocating {run_id}"))?;
        info!(%run_id, %mode, "run started");
        Ok(run)
    }

    pub async fn record_pull(&self, run_id: RunId, records_pulled: usize) -> Result<Run> {
        let mut run = self.load(run_id).await?;
        run.records_pulled = records_pulled;
        self.save(&run, true).await?;
        Ok(run)
    }

    /// Sets the terminal status. The run on disk must still be pending.
    pub async fn finish(
        &self,
        run_id: RunId,
        status: RunStatus,
        finished_at: DateTime<Utc>,
    ) -> Result<Run> {
        let mut run = self.load(run_id).await?;
        run.complete(status, finished_at)?;
        self.save(&run, true).await?;
        info!(%run_id, %status, "run finished");
        Ok(run)
    }

    pub async fn load(&self, run_id: RunId) -> Result<Run> {
        let path = self.run_path(run_id);
        let bytes = fs::read(&path)
            .await
            .with_context(|| format!("reading run record {}", path.display()))?;
        serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing run record {}", path.display()))
    }

    pub async fn list(&self) -> Result<Vec<Run>> {
        if !fs::try_exists(&self.root)
            .await
            .with_context(|| format!("checking {}", self.root.display()))?
        {
            return Ok(Vec::new());
        }
        let mut entries = fs::read_dir(&self.root)
            .await
            .with_context(|| format!("listing {}", self.root.display()))?;
        let mut runs = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(".json")) else {
                continue;
            };
            let Ok(run_id) = stem.parse::<RunId>() else {
                continue;
            };
            runs.push(self.load(run_id).await?);
        }
        runs.sort_by_key(|run| run.run_id);
        Ok(runs)
    }
}
