use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use incur_core::{IngestionMode, RunId, RunStatus, SchemaViolation};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::merge::MergeReport;

const BRIEF_LIST_LIMIT: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureBuildOutcome {
    pub task: String,
    pub canonical_version: u64,
    pub rows: Option<usize>,
    pub path: Option<String>,
    pub error: Option<String>,
}

impl FeatureBuildOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Structured summary of one run, written even when the run fails.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: RunId,
    pub mode: IngestionMode,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub records_pulled: usize,
    pub raw_records: usize,
    pub candidates: usize,
    pub violations: Vec<SchemaViolation>,
    pub merge: Option<MergeReport>,
    pub parent_version: u64,
    pub canonical_version: u64,
    pub committed: bool,
    #[serde(default)]
    pub features: Vec<FeatureBuildOutcome>,
    pub error: Option<String>,
}

pub fn render_brief(report: &RunReport) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# Incident Curation Run {}\n", report.run_id);
    let _ = writeln!(out, "- Status: **{}**", report.status);
    let _ = writeln!(out, "- Mode: {}", report.mode);
    let _ = writeln!(out, "- Started: {}", report.started_at.to_rfc3339());
    let _ = writeln!(out, "- Finished: {}", report.finished_at.to_rfc3339());
    let _ = writeln!(out, "- Records pulled: {}", report.records_pulled);
    let _ = writeln!(
        out,
        "- Canonical version: {} -> {}{}",
        report.parent_version,
        report.canonical_version,
        if report.committed { "" } else { " (no commit)" }
    );
    if let Some(error) = &report.error {
        let _ = writeln!(out, "- Error: {error}");
    }

    if let Some(merge) = &report.merge {
        let _ = writeln!(out, "\n## Merge\n");
        let _ = writeln!(out, "| inserted | updated | rejected | unchanged | batch duplicates |");
        let _ = writeln!(out, "|---|---|---|---|---|");
        let _ = writeln!(
            out,
            "| {} | {} | {} | {} | {} |",
            merge.inserted, merge.updated, merge.rejected, merge.unchanged, merge.batch_duplicates
        );
        let rejected = merge.rejections().collect::<Vec<_>>();
        if !rejected.is_empty() {
            let _ = writeln!(out, "\nTerminal-locked keys:");
            for outcome in rejected.iter().take(BRIEF_LIST_LIMIT) {
                let _ = writeln!(
                    out,
                    "- {} (status {})",
                    outcome.natural_key,
                    outcome.existing_status.as_deref().unwrap_or("-")
                );
            }
            if rejected.len() > BRIEF_LIST_LIMIT {
                let _ = writeln!(out, "- ... {} more", rejected.len() - BRIEF_LIST_LIMIT);
            }
        }
    }

    if !report.violations.is_empty() {
        let _ = writeln!(out, "\n## Schema violations ({})\n", report.violations.len());
        for violation in report.violations.iter().take(BRIEF_LIST_LIMIT) {
            let _ = writeln!(out, "- {violation}");
        }
        if report.violations.len() > BRIEF_LIST_LIMIT {
            let _ = writeln!(out, "- ... {} more", report.violations.len() - BRIEF_LIST_LIMIT);
        }
    }

    if !report.features.is_empty() {
        let _ = writeln!(out, "\n## Feature views\n");
        for feature in &report.features {
            match (&feature.error, feature.rows) {
                (Some(error), _) => {
                    let _ = writeln!(out, "- {}: failed: {error}", feature.task);
                }
                (None, rows) => {
                    let _ = writeln!(out, "- {}: {} rows", feature.task, rows.unwrap_or(0));
                }
            }
        }
    }
    out
}

/// Writes `run_report.json` and `run_brief.md` under `<reports_root>/<run id>/`.
pub async fn write_run_report(reports_root: &Path, report: &RunReport) -> Result<PathBuf> {
    let dir = reports_root.join(report.run_id.to_string());
    fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;

    let json = serde_json::to_vec_pretty(report).context("serializing run report")?;
    fs::write(dir.join("run_report.json"), json)
        .await
        .context("writing run_report.json")?;
    fs::write(dir.join("run_brief.md"), render_brief(report))
        .await
        .context("writing run_brief.md")?;
    Ok(dir)
}
