//! The seam to the external source API client.

use std::path::PathBuf;

use anyhow::Context;
use async_trait::async_trait;
use incur_core::{IngestionMode, PullWindow, RunId};
use incur_storage::page_records;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::fs;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequest {
    pub run_id: RunId,
    pub mode: IngestionMode,
    pub window: PullWindow,
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Produces one run's raw records as source pages. Pagination, auth and the
/// choice of which records are "open" belong to the implementation.
#[async_trait]
pub trait RecordSource: Send + Sync {
    fn source_id(&self) -> &str;

    async fn pull_pages(&self, request: &PullRequest) -> Result<Vec<Vec<JsonValue>>, SourceError>;
}

/// Reads page files (`*.json`, envelope or bare array) exported by the API
/// client, in file name order.
#[derive(Debug, Clone)]
pub struct JsonPageDirSource {
    source_id: String,
    dir: PathBuf,
}

impl JsonPageDirSource {
    pub fn new(source_id: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        Self {
            source_id: source_id.into(),
            dir: dir.into(),
        }
    }
}

#[async_trait]
impl RecordSource for JsonPageDirSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn pull_pages(&self, request: &PullRequest) -> Result<Vec<Vec<JsonValue>>, SourceError> {
        let mut entries = fs::read_dir(&self.dir)
            .await
            .with_context(|| format!("listing page directory {}", self.dir.display()))?;
        let mut paths = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("listing page directory {}", self.dir.display()))?
        {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                paths.push(path);
            }
        }
        paths.sort();
        if paths.is_empty() {
            return Err(SourceError::Message(format!(
                "no page files in {}",
                self.dir.display()
            )));
        }

        let mut pages = Vec::with_capacity(paths.len());
        for path in paths {
            let bytes = fs::read(&path)
                .await
                .with_context(|| format!("reading page {}", path.display()))?;
            let records =
                page_records(&bytes).with_context(|| format!("decoding page {}", path.display()))?;
            debug!(run_id = %request.run_id, page = %path.display(), records = records.len(), "page pulled");
            pages.push(records);
        }
        Ok(pages)
    }
}
