//! Curation pipeline orchestration: ingest a run's raw pages, normalize and
//! merge them into the canonical table, then rebuild feature views.

mod handle;
mod merge;
mod report;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, SubsecRound, Utc};
use incur_core::{
    CanonicalSnapshot, IngestionMode, PullWindow, RawRecord, Run, RunId, RunStatus,
    TerminalStatuses,
};
use incur_features::{load_task_definitions, FeatureStore, FeatureViewBuilder, TaskDefinition};
use incur_normalize::{NormalizedBatch, Normalizer, PullRequest, RecordSource, SchemaMapping};
use incur_storage::{CanonicalStore, RawSnapshotStore, RunLedger, StoreError};
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tracing::{info, info_span, warn, Instrument};

pub use handle::{TableHandle, VersionMismatch};
pub use merge::{KeyOutcome, MergeContext, MergeOutput, MergeReport, RejectReason, UpsertMerger};
pub use report::{render_brief, write_run_report, FeatureBuildOutcome, RunReport};

pub const CRATE_NAME: &str = "incur-sync";

#[derive(Debug, Clone)]
pub struct CurationConfig {
    pub workspace_root: PathBuf,
    pub data_dir: PathBuf,
    pub normalize_workers: Option<usize>,
}

impl CurationConfig {
    pub fn from_env() -> Self {
        let workspace_root = std::env::var("INCUR_WORKSPACE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));
        Self {
            data_dir: std::env::var("INCUR_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| workspace_root.join("data")),
            normalize_workers: std::env::var("INCUR_NORMALIZE_WORKERS")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|workers: &usize| *workers > 0),
            workspace_root,
        }
    }

    pub fn with_roots(workspace_root: impl Into<PathBuf>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            data_dir: data_dir.into(),
            normalize_workers: None,
        }
    }

    pub fn config_dir(&self) -> PathBuf {
        self.workspace_root.join("config")
    }

    pub fn raw_dir(&self) -> PathBuf {
        self.data_dir.join("raw")
    }

    pub fn canonical_dir(&self) -> PathBuf {
        self.data_dir.join("canonical")
    }

    pub fn features_dir(&self) -> PathBuf {
        self.data_dir.join("features")
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.data_dir.join("runs")
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.data_dir.join("reports")
    }
}

fn default_true() -> bool {
    true
}

fn default_retain_versions() -> usize {
    10
}

/// `config/curation.yaml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CurationSettings {
    pub source_id: String,
    pub terminal_statuses: TerminalStatuses,
    #[serde(default)]
    pub normalize_workers: Option<usize>,
    #[serde(default = "default_true")]
    pub rebuild_features_after_merge: bool,
    #[serde(default = "default_retain_versions")]
    pub retain_versions: usize,
}

impl CurationSettings {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSummary {
    pub canonical_version: u64,
    pub rows: usize,
    pub committed_at: DateTime<Utc>,
    pub watermark: DateTime<Utc>,
    pub mapping_versions: Vec<String>,
    pub sealed_raw_runs: usize,
    pub recent_runs: Vec<Run>,
}

pub struct CurationPipeline {
    config: CurationConfig,
    settings: CurationSettings,
    mapping: Arc<SchemaMapping>,
    tasks: Vec<TaskDefinition>,
    raw: RawSnapshotStore,
    canonical: CanonicalStore,
    ledger: RunLedger,
    features: FeatureStore,
    merger: UpsertMerger,
    table: Arc<TableHandle>,
}

impl CurationPipeline {
    /// Loads mapping, settings and task definitions from `<workspace>/config`
    /// and opens the current canonical version.
    pub fn new(config: CurationConfig) -> Result<Self> {
        let config_dir = config.config_dir();
        let settings = CurationSettings::load(&config_dir.join("curation.yaml"))?;
        let mapping_path = config_dir.join("schema_mapping.yaml");
        let mapping = SchemaMapping::load(&mapping_path)
            .with_context(|| format!("loading {}", mapping_path.display()))?;
        let tasks_dir = config_dir.join("tasks");
        let tasks = if tasks_dir.is_dir() {
            load_task_definitions(&tasks_dir)
                .with_context(|| format!("loading tasks from {}", tasks_dir.display()))?
        } else {
            Vec::new()
        };
        Self::from_parts(config, settings, mapping, tasks)
    }

    pub fn from_parts(
        config: CurationConfig,
        settings: CurationSettings,
        mapping: SchemaMapping,
        tasks: Vec<TaskDefinition>,
    ) -> Result<Self> {
        let canonical = CanonicalStore::new(config.canonical_dir());
        let snapshot = canonical
            .open()
            .with_context(|| format!("opening canonical table in {}", config.canonical_dir().display()))?;
        info!(
            version = snapshot.version(),
            rows = snapshot.len(),
            mapping = %mapping.version,
            "curation pipeline ready"
        );
        Ok(Self {
            raw: RawSnapshotStore::new(config.raw_dir()),
            ledger: RunLedger::new(config.runs_dir()),
            features: FeatureStore::new(config.features_dir()),
            merger: UpsertMerger::new(settings.terminal_statuses.clone()),
            table: Arc::new(TableHandle::new(snapshot)),
            canonical,
            mapping: Arc::new(mapping),
            tasks,
            settings,
            config,
        })
    }

    pub fn config(&self) -> &CurationConfig {
        &self.config
    }

    pub fn settings(&self) -> &CurationSettings {
        &self.settings
    }

    pub fn tasks(&self) -> &[TaskDefinition] {
        &self.tasks
    }

    /// The live-table handle; readers `load()` a snapshot from it.
    pub fn table(&self) -> Arc<TableHandle> {
        Arc::clone(&self.table)
    }

    pub fn canonical_store(&self) -> &CanonicalStore {
        &self.canonical
    }

    pub fn ledger(&self) -> &RunLedger {
        &self.ledger
    }

    fn terminal(&self) -> &TerminalStatuses {
        &self.settings.terminal_statuses
    }

    fn workers(&self) -> usize {
        self.config
            .normalize_workers
            .or(self.settings.normalize_workers)
            .or_else(|| std::thread::available_parallelism().ok().map(|n| n.get()))
            .unwrap_or(1)
            .max(1)
    }

    /// Starts a run, pulls its pages from `source` and seals the raw snapshot.
    /// A failed pull marks the run failed and writes its report.
    pub async fn ingest(
        &self,
        source: &dyn RecordSource,
        mode: IngestionMode,
        window: PullWindow,
    ) -> Result<Run> {
        let started_at = Utc::now().trunc_subsecs(6);
        let run = self.ledger.begin(mode, started_at, window).await?;
        let span = info_span!("ingest", run_id = %run.run_id, %mode, source = source.source_id());

        let pulled = async {
            let request = PullRequest {
                run_id: run.run_id,
                mode,
                window,
            };
            let pages = source
                .pull_pages(&request)
                .await
                .with_context(|| format!("pulling pages from {}", source.source_id()))?;
            let mut writer = self.raw.begin(&run, source.source_id()).await?;
            for page in &pages {
                writer.append_page(page).await?;
            }
            let manifest = writer.seal(Utc::now()).await?;
            self.ledger
                .record_pull(run.run_id, manifest.record_count)
                .await
        }
        .instrument(span)
        .await;

        match pulled {
            Ok(run) => Ok(run),
            Err(err) => {
                warn!(run_id = %run.run_id, error = %format!("{err:#}"), "ingest failed");
                self.fail_run(&run, 0, self.table.version(), &err).await?;
                Err(err.context(format!("{} failed during ingest", run.run_id)))
            }
        }
    }

    /// Sets the run's terminal status in the ledger. A ledger failure is
    /// logged and handed back as a note for the report; the run still ends.
    async fn record_finish(&self, run: &Run, status: RunStatus) -> (Run, Option<String>) {
        let finished_at = Utc::now();
        match self.ledger.finish(run.run_id, status, finished_at).await {
            Ok(finished) => (finished, None),
            Err(err) => {
                let note = format!("recording {} as {status}: {err:#}", run.run_id);
                warn!(error = %note, "run ledger not updated");
                let mut finished = run.clone();
                finished.status = status;
                finished.finished_at = Some(finished_at);
                (finished, Some(note))
            }
        }
    }

    async fn fail_run(
        &self,
        run: &Run,
        raw_records: usize,
        parent_version: u64,
        err: &anyhow::Error,
    ) -> Result<RunReport> {
        let (finished, ledger_note) = self.record_finish(run, RunStatus::Failed).await;
        let error = match ledger_note {
            Some(note) => format!("{err:#}; {note}"),
            None => format!("{err:#}"),
        };
        let report = RunReport {
            run_id: run.run_id,
            mode: run.mode,
            status: RunStatus::Failed,
            started_at: run.started_at,
            finished_at: finished.finished_at.unwrap_or(finished.started_at),
            records_pulled: finished.records_pulled,
            raw_records,
            candidates: 0,
            violations: Vec::new(),
            merge: None,
            parent_version,
            canonical_version: self.table.version(),
            committed: false,
            features: Vec::new(),
            error: Some(error),
        };
        write_run_report(&self.config.reports_dir(), &report).await?;
        Ok(report)
    }

    /// Points the table handle at a version that is already current on disk.
    /// If the handle moved during the run it is reset, since `CURRENT` now
    /// names `next`.
    fn advance_table(&self, parent_version: u64, next: Arc<CanonicalSnapshot>) {
        if let Err(mismatch) = self.table.compare_and_swap(parent_version, Arc::clone(&next)) {
            warn!(
                expected = mismatch.expected,
                found = mismatch.found,
                committed = next.version(),
                "table handle moved during the run; resetting it to the committed version"
            );
            self.table.store(next);
        }
    }

    /// Reloads the handle from `CURRENT` after another writer advanced it.
    fn resync_table(&self) {
        match self.canonical.open() {
            Ok(current) => {
                info!(version = current.version(), "table handle reloaded from disk");
                self.table.store(Arc::new(current));
            }
            Err(err) => warn!(error = %err, "could not reload the canonical table"),
        }
    }

    /// Normalizes disjoint chunks on blocking workers and aggregates them.
    pub async fn normalize(&self, records: Vec<RawRecord>) -> Result<NormalizedBatch> {
        let workers = self.workers();
        let chunk_size = records.len().div_ceil(workers).max(1);
        let mut set = JoinSet::new();
        let mut records = records;
        while !records.is_empty() {
            let rest = records.split_off(chunk_size.min(records.len()));
            let chunk = std::mem::replace(&mut records, rest);
            let normalizer = Normalizer::new(Arc::clone(&self.mapping));
            set.spawn_blocking(move || normalizer.normalize_batch(&chunk));
        }

        let mut batch = NormalizedBatch::default();
        while let Some(joined) = set.join_next().await {
            batch.extend(joined.context("normalizer worker panicked")?);
        }
        batch.violations.sort_by_key(|violation| violation.ordinal);
        batch.candidates.sort_by_key(|candidate| candidate.ordinal);
        Ok(batch)
    }

    /// Normalizes and merges one sealed raw run (the latest when `run_id` is
    /// `None`) and commits the result as the next canonical version.
    pub async fn curate(&self, run_id: Option<RunId>) -> Result<RunReport> {
        let run_id = match run_id {
            Some(run_id) => run_id,
            None => {
                self.raw
                    .latest_run()
                    .await?
                    .context("no sealed raw snapshot to curate")?
                    .run_id
            }
        };
        let run = self.ledger.load(run_id).await?;
        if run.status.is_terminal() {
            bail!("{run_id} already finished with status {}", run.status);
        }
        let span = info_span!("curate", %run_id, mode = %run.mode);
        self.curate_run(run).instrument(span).await
    }

    async fn curate_run(&self, run: Run) -> Result<RunReport> {
        let parent = self.table.load();
        let raw = match self.raw.load_run(run.run_id).await {
            Ok(raw) => raw,
            Err(err) => return self.fail_run(&run, 0, parent.version(), &err).await,
        };
        let raw_records = raw.records().len();
        let batch = match self.normalize(raw.into_records()).await {
            Ok(batch) => batch,
            Err(err) => return self.fail_run(&run, raw_records, parent.version(), &err).await,
        };
        if !batch.violations.is_empty() {
            warn!(violations = batch.violations.len(), "records failed normalization");
        }

        let run_time = Utc::now().trunc_subsecs(6);
        let ctx = MergeContext {
            run_id: run.run_id,
            mode: run.mode,
            run_time,
        };
        let candidates = batch.candidates.len();
        let merged = self.merger.merge(&parent, batch.candidates, &ctx);
        info!(
            inserted = merged.report.inserted,
            updated = merged.report.updated,
            rejected = merged.report.rejected,
            unchanged = merged.report.unchanged,
            "merge computed"
        );

        let mut committed = false;
        if merged.report.changed() {
            let declared = self.mapping.field_types();
            match self
                .canonical
                .commit(&parent, merged.records, &declared, run.run_id, run_time)
            {
                Ok(next) => {
                    self.advance_table(parent.version(), Arc::new(next));
                    committed = true;
                }
                Err(failure) => {
                    if matches!(failure.source, StoreError::PointerMoved { .. }) {
                        self.resync_table();
                    }
                    let err = anyhow::Error::new(failure);
                    let mut report = self.fail_run(&run, raw_records, parent.version(), &err).await?;
                    report.candidates = candidates;
                    report.violations = batch.violations;
                    report.merge = Some(merged.report);
                    write_run_report(&self.config.reports_dir(), &report).await?;
                    return Ok(report);
                }
            }
        }

        let status = if batch.violations.is_empty() {
            RunStatus::Succeeded
        } else {
            RunStatus::Partial
        };
        let (finished, ledger_note) = self.record_finish(&run, status).await;

        let features = if committed && self.settings.rebuild_features_after_merge {
            self.build_features(None).await?
        } else {
            Vec::new()
        };

        let report = RunReport {
            run_id: run.run_id,
            mode: run.mode,
            status,
            started_at: run.started_at,
            finished_at: finished.finished_at.unwrap_or(run_time),
            records_pulled: finished.records_pulled,
            raw_records,
            candidates,
            violations: batch.violations,
            merge: Some(merged.report),
            parent_version: parent.version(),
            canonical_version: self.table.version(),
            committed,
            features,
            error: ledger_note,
        };
        let dir = write_run_report(&self.config.reports_dir(), &report).await?;
        info!(%status, report = %dir.display(), "run finished");
        Ok(report)
    }

    /// Builds every configured task (or just `only`) from one snapshot. A
    /// task that fails is reported and does not stop the others.
    pub async fn build_features(&self, only: Option<&str>) -> Result<Vec<FeatureBuildOutcome>> {
        let snapshot = self.table.load();
        let tasks = self
            .tasks
            .iter()
            .filter(|task| only.map_or(true, |name| task.task == name))
            .collect::<Vec<_>>();
        if let Some(name) = only {
            if tasks.is_empty() {
                bail!("no task named `{name}`");
            }
        }

        let builder = FeatureViewBuilder::new(Arc::clone(&self.mapping), self.terminal().clone());
        let mut outcomes = Vec::with_capacity(tasks.len());
        for task in tasks {
            let built = builder
                .build(&snapshot, task)
                .and_then(|dataset| self.features.write(&dataset));
            let outcome = match built {
                Ok(manifest) => FeatureBuildOutcome {
                    task: task.task.clone(),
                    canonical_version: snapshot.version(),
                    rows: Some(manifest.row_count),
                    path: Some(
                        self.features
                            .dataset_dir(&task.task, snapshot.version())
                            .display()
                            .to_string(),
                    ),
                    error: None,
                },
                Err(err) => {
                    warn!(task = %task.task, error = %err, "feature build failed");
                    FeatureBuildOutcome {
                        task: task.task.clone(),
                        canonical_version: snapshot.version(),
                        rows: None,
                        path: None,
                        error: Some(err.to_string()),
                    }
                }
            };
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    /// Ingest followed by curation of the same run.
    pub async fn run_once(
        &self,
        source: &dyn RecordSource,
        mode: IngestionMode,
        window: PullWindow,
    ) -> Result<RunReport> {
        let run = self.ingest(source, mode, window).await?;
        self.curate(Some(run.run_id)).await
    }

    pub async fn status(&self) -> Result<StatusSummary> {
        let snapshot = self.table.load();
        let runs = self.ledger.list().await?;
        let recent_runs = runs.iter().rev().take(5).cloned().collect();
        Ok(StatusSummary {
            canonical_version: snapshot.version(),
            rows: snapshot.len(),
            committed_at: snapshot.committed_at(),
            watermark: snapshot.watermark(),
            mapping_versions: snapshot
                .mapping_versions()
                .into_iter()
                .map(str::to_string)
                .collect(),
            sealed_raw_runs: self.raw.list_runs().await?.len(),
            recent_runs,
        })
    }

    /// Drops canonical versions beyond `keep` (default: `retain_versions`).
    pub fn prune(&self, keep: Option<usize>) -> Result<Vec<u64>> {
        let keep = keep.unwrap_or(self.settings.retain_versions);
        Ok(self.canonical.prune(keep)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use async_trait::async_trait;
    use incur_core::FieldValue;
    use incur_features::FeatureError;
    use incur_normalize::SourceError;
    use serde_json::{json, Value as JsonValue};
    use tempfile::{tempdir, TempDir};

    const MAPPING: &str = r#"
version: incidents-v1
natural_key: {source_path: sys_id}
last_modified: {source_path: sys_updated_on}
status: {source_path: state}
fields:
  - {name: assignment_group_id, source_path: assignment_group, target_type: text, flatten: id}
  - {name: priority, source_path: priority, target_type: integer}
  - {name: opened_at, source_path: opened_at, target_type: timestamp}
"#;

    const TASK: &str = r#"
task: open_age
kind: regression
features: [priority]
label: hours_open
derived_columns:
  - {name: hours_open, kind: hours_since, field: opened_at}
"#;

    struct StaticSource(Vec<Vec<JsonValue>>);

    #[async_trait]
    impl RecordSource for StaticSource {
        fn source_id(&self) -> &str {
            "static"
        }

        async fn pull_pages(&self, _request: &PullRequest) -> Result<Vec<Vec<JsonValue>>, SourceError> {
            Ok(self.0.clone())
        }
    }

    struct FailingSource;

    #[async_trait]
    impl RecordSource for FailingSource {
        fn source_id(&self) -> &str {
            "failing"
        }

        async fn pull_pages(&self, _request: &PullRequest) -> Result<Vec<Vec<JsonValue>>, SourceError> {
            Err(SourceError::Message("upstream returned 503".into()))
        }
    }

    fn pipeline(dir: &TempDir) -> CurationPipeline {
        pipeline_with(dir, MAPPING)
    }

    fn pipeline_with(dir: &TempDir, mapping: &str) -> CurationPipeline {
        let settings = CurationSettings {
            source_id: "static".into(),
            terminal_statuses: TerminalStatuses::new(["Closed", "Resolved"]),
            normalize_workers: Some(2),
            rebuild_features_after_merge: true,
            retain_versions: 3,
        };
        let task = TaskDefinition::from_yaml_str(TASK, Path::new("open_age.yaml")).unwrap();
        CurationPipeline::from_parts(
            CurationConfig::with_roots(dir.path(), dir.path().join("data")),
            settings,
            SchemaMapping::from_yaml_str(mapping).unwrap(),
            vec![task],
        )
        .expect("pipeline")
    }

    fn incident(id: &str, state: &str, updated: &str) -> JsonValue {
        json!({
            "sys_id": id,
            "state": state,
            "sys_updated_on": updated,
            "assignment_group": {"id": "G1", "display_value": "Network"},
            "priority": "2",
            "opened_at": "2026-02-24 08:00:00"
        })
    }

    #[tokio::test]
    async fn first_run_inserts_and_builds_features() {
        let dir = tempdir().expect("tempdir");
        let pipeline = pipeline(&dir);
        let source = StaticSource(vec![
            vec![incident("INC1", "Open", "2026-02-24 10:00:00"), incident("INC2", "New", "2026-02-24 10:05:00")],
            vec![incident("INC1", "Open", "2026-02-24 10:00:00")],
        ]);

        let report = pipeline
            .run_once(&source, IngestionMode::FullBackfill, PullWindow::default())
            .await
            .expect("run");
        assert_eq!(report.status, RunStatus::Succeeded);
        assert_eq!(report.records_pulled, 3);
        let merge = report.merge.as_ref().unwrap();
        assert_eq!(merge.inserted, 2);
        assert_eq!(merge.batch_duplicates, 1);
        assert!(report.committed);
        assert_eq!(report.canonical_version, 1);
        assert_eq!(report.features.len(), 1);
        assert!(report.features[0].succeeded());

        let snapshot = pipeline.table().load();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(
            snapshot.get("INC1").unwrap().column("assignment_group_id"),
            incur_core::FieldValue::Text("G1".into())
        );
        assert!(dir.path().join("data/reports/run-000001/run_report.json").exists());
        assert!(dir.path().join("data/reports/run-000001/run_brief.md").exists());
        assert!(dir
            .path()
            .join("data/features/open_age/v000001/open_age.parquet")
            .exists());
        assert_eq!(
            pipeline.ledger().load(report.run_id).await.unwrap().status,
            RunStatus::Succeeded
        );
    }

    #[tokio::test]
    async fn violations_make_the_run_partial() {
        let dir = tempdir().expect("tempdir");
        let pipeline = pipeline(&dir);
        let mut bad = incident("INC9", "Open", "2026-02-24 10:00:00");
        bad["priority"] = json!("urgent");
        let source = StaticSource(vec![vec![incident("INC1", "Open", "2026-02-24 10:00:00"), bad]]);

        let report = pipeline
            .run_once(&source, IngestionMode::IncrementalOpen, PullWindow::default())
            .await
            .unwrap();
        assert_eq!(report.status, RunStatus::Partial);
        assert_eq!(report.violations.len(), 1);
        assert_eq!(report.violations[0].record_key.as_deref(), Some("INC9"));
        assert_eq!(report.violations[0].field, "priority");
        assert!(pipeline.table().load().get("INC9").is_none());
    }

    #[tokio::test]
    async fn replayed_run_is_all_unchanged_and_does_not_commit() {
        let dir = tempdir().expect("tempdir");
        let pipeline = pipeline(&dir);
        let pages = vec![vec![incident("INC1", "Open", "2026-02-24 10:00:00")]];

        pipeline
            .run_once(&StaticSource(pages.clone()), IngestionMode::IncrementalOpen, PullWindow::default())
            .await
            .unwrap();
        let before = pipeline.table().load();
        let replay = pipeline
            .run_once(&StaticSource(pages), IngestionMode::IncrementalOpen, PullWindow::default())
            .await
            .unwrap();

        assert_eq!(replay.merge.as_ref().unwrap().unchanged, 1);
        assert!(!replay.committed);
        assert_eq!(replay.canonical_version, 1);
        let after = pipeline.table().load();
        assert_eq!(
            before.records().collect::<Vec<_>>(),
            after.records().collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn commit_failure_marks_run_failed_and_keeps_previous_version() {
        let dir = tempdir().expect("tempdir");
        let pipeline = pipeline(&dir);
        pipeline
            .run_once(
                &StaticSource(vec![vec![incident("INC1", "Open", "2026-02-24 10:00:00")]]),
                IngestionMode::IncrementalOpen,
                PullWindow::default(),
            )
            .await
            .unwrap();
        let reader = pipeline.table().load();

        // A regular file where the next version directory must go.
        std::fs::write(
            dir.path().join("data/canonical/versions/v000002"),
            b"blocker",
        )
        .unwrap();
        let report = pipeline
            .run_once(
                &StaticSource(vec![vec![incident("INC1", "Closed", "2026-02-24 12:00:00")]]),
                IngestionMode::IncrementalOpen,
                PullWindow::default(),
            )
            .await
            .unwrap();

        assert_eq!(report.status, RunStatus::Failed);
        assert!(report.error.is_some());
        assert_eq!(report.canonical_version, 1);
        assert_eq!(pipeline.table().version(), 1);
        assert_eq!(reader.get("INC1").unwrap().status.as_deref(), Some("Open"));
        let reopened = pipeline.canonical_store().open().unwrap();
        assert_eq!(reopened.version(), 1);
        assert_eq!(reopened.get("INC1").unwrap().status.as_deref(), Some("Open"));
        assert_eq!(
            pipeline.ledger().load(report.run_id).await.unwrap().status,
            RunStatus::Failed
        );
    }

    #[tokio::test]
    async fn failed_pull_is_recorded() {
        let dir = tempdir().expect("tempdir");
        let pipeline = pipeline(&dir);
        let err = pipeline
            .ingest(&FailingSource, IngestionMode::IncrementalOpen, PullWindow::default())
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("503"));
        let run = pipeline.ledger().load(RunId(1)).await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert!(dir.path().join("data/reports/run-000001/run_report.json").exists());
    }

    #[tokio::test]
    async fn a_finished_run_cannot_be_curated_again() {
        let dir = tempdir().expect("tempdir");
        let pipeline = pipeline(&dir);
        let report = pipeline
            .run_once(
                &StaticSource(vec![vec![incident("INC1", "Open", "2026-02-24 10:00:00")]]),
                IngestionMode::IncrementalOpen,
                PullWindow::default(),
            )
            .await
            .unwrap();
        assert!(pipeline.curate(Some(report.run_id)).await.is_err());
    }

    #[tokio::test]
    async fn unknown_task_fields_fail_only_that_task() {
        let dir = tempdir().expect("tempdir");
        let mut pipeline = pipeline(&dir);
        let bad = TaskDefinition::from_yaml_str(
            "task: bad\nkind: nlp\nfeatures: [short_description]\n",
            Path::new("bad.yaml"),
        )
        .unwrap();
        pipeline.tasks.push(bad);

        let snapshot_builder = FeatureViewBuilder::new(Arc::clone(&pipeline.mapping), pipeline.terminal().clone());
        assert!(matches!(
            snapshot_builder.build(&pipeline.table().load(), &pipeline.tasks[1]),
            Err(FeatureError::UnsupportedTaskSchema { .. })
        ));

        let outcomes = pipeline.build_features(None).await.unwrap();
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes[0].succeeded());
        assert!(outcomes[1].error.as_deref().unwrap().contains("short_description"));
    }

    #[tokio::test]
    async fn parallel_normalization_matches_sequential() {
        let dir = tempdir().expect("tempdir");
        let pipeline = pipeline(&dir);
        let records = (0..25u64)
            .map(|i| RawRecord {
                ordinal: i,
                document: incur_core::RawDocument::new(if i % 7 == 0 {
                    json!({"sys_id": format!("INC{i}")})
                } else {
                    incident(&format!("INC{i}"), "Open", "2026-02-24 10:00:00")
                }),
            })
            .collect::<Vec<_>>();
        let sequential = Normalizer::new(Arc::clone(&pipeline.mapping)).normalize_batch(&records);
        let parallel = pipeline.normalize(records).await.unwrap();
        assert_eq!(parallel, sequential);
        assert_eq!(parallel.violations.len(), 4);
    }

    #[tokio::test]
    async fn retyping_a_field_conforms_rows_from_the_older_mapping() {
        let dir = tempdir().expect("tempdir");
        let text_priority = MAPPING
            .replace("version: incidents-v1", "version: incidents-v0")
            .replace("target_type: integer", "target_type: text");
        let older = pipeline_with(&dir, &text_priority);
        let mut high = incident("INC1", "Closed", "2026-02-24 10:00:00");
        high["priority"] = json!("2 - High");
        older
            .run_once(
                &StaticSource(vec![vec![high, incident("INC2", "Closed", "2026-02-24 10:00:00")]]),
                IngestionMode::FullBackfill,
                PullWindow::default(),
            )
            .await
            .unwrap();
        assert_eq!(
            older.table().load().get("INC1").unwrap().column("priority"),
            FieldValue::Text("2 - High".into())
        );
        drop(older);

        let newer = pipeline(&dir);
        let report = newer
            .run_once(
                &StaticSource(vec![vec![incident("INC10", "Open", "2026-02-25 09:00:00")]]),
                IngestionMode::IncrementalOpen,
                PullWindow::default(),
            )
            .await
            .unwrap();
        assert_eq!(report.status, RunStatus::Succeeded);
        assert!(report.committed);
        assert_eq!(report.canonical_version, 2);
        assert!(report.features.iter().all(|feature| feature.succeeded()));

        let snapshot = newer.table().load();
        assert_eq!(snapshot.get("INC10").unwrap().column("priority"), FieldValue::Integer(2));
        assert_eq!(snapshot.get("INC2").unwrap().column("priority"), FieldValue::Integer(2));
        assert_eq!(snapshot.get("INC1").unwrap().column("priority"), FieldValue::Null);
        assert_eq!(
            snapshot.mapping_versions().into_iter().collect::<Vec<_>>(),
            vec!["incidents-v0", "incidents-v1"]
        );

        let next = newer
            .run_once(
                &StaticSource(vec![vec![incident("INC11", "Open", "2026-02-25 10:00:00")]]),
                IngestionMode::IncrementalOpen,
                PullWindow::default(),
            )
            .await
            .unwrap();
        assert_eq!(next.canonical_version, 3);
    }

    #[tokio::test]
    async fn a_stale_handle_is_reloaded_after_another_writer_commits() {
        let dir = tempdir().expect("tempdir");
        let first = pipeline(&dir);
        let second = pipeline(&dir);
        first
            .run_once(
                &StaticSource(vec![vec![incident("INC1", "Open", "2026-02-24 10:00:00")]]),
                IngestionMode::IncrementalOpen,
                PullWindow::default(),
            )
            .await
            .unwrap();

        let pages = vec![vec![incident("INC2", "Open", "2026-02-24 11:00:00")]];
        let stale = second
            .run_once(&StaticSource(pages.clone()), IngestionMode::IncrementalOpen, PullWindow::default())
            .await
            .unwrap();
        assert_eq!(stale.status, RunStatus::Failed);
        assert!(stale.error.as_deref().unwrap().contains("pointer moved"));
        assert_eq!(second.table().version(), 1);

        let retried = second
            .run_once(&StaticSource(pages), IngestionMode::IncrementalOpen, PullWindow::default())
            .await
            .unwrap();
        assert_eq!(retried.status, RunStatus::Succeeded);
        assert_eq!(retried.canonical_version, 2);
        let snapshot = second.table().load();
        assert!(snapshot.get("INC1").is_some());
        assert!(snapshot.get("INC2").is_some());
    }

    #[test]
    fn a_handle_moved_mid_run_follows_the_committed_version() {
        let dir = tempdir().expect("tempdir");
        let pipeline = pipeline(&dir);
        let parent = pipeline.table().load();
        let committed_at = Utc::now().trunc_subsecs(6);
        let record = incur_core::CanonicalRecord {
            natural_key: "INC1".into(),
            source_last_modified: committed_at,
            status: Some("Open".into()),
            mapping_version: "incidents-v1".into(),
            run_id: RunId(1),
            curated_at: committed_at,
            fields: BTreeMap::new(),
        };
        let next = pipeline
            .canonical_store()
            .commit(
                &parent,
                BTreeMap::from([("INC1".to_string(), Arc::new(record))]),
                &pipeline.mapping.field_types(),
                RunId(1),
                committed_at,
            )
            .unwrap();

        pipeline
            .table()
            .store(Arc::new(CanonicalSnapshot::from_records(7, committed_at, Vec::new())));
        pipeline.advance_table(parent.version(), Arc::new(next));

        assert_eq!(pipeline.table().version(), 1);
        assert_eq!(
            pipeline.table().load().records().collect::<Vec<_>>(),
            pipeline.canonical_store().open().unwrap().records().collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn a_ledger_failure_after_commit_still_reports_the_commit() {
        let dir = tempdir().expect("tempdir");
        let pipeline = pipeline(&dir);
        let run = pipeline
            .ingest(
                &StaticSource(vec![vec![incident("INC1", "Open", "2026-02-24 10:00:00")]]),
                IngestionMode::IncrementalOpen,
                PullWindow::default(),
            )
            .await
            .unwrap();
        std::fs::remove_file(dir.path().join("data/runs/run-000001.json")).unwrap();

        let report = pipeline.curate_run(run).await.unwrap();
        assert_eq!(report.status, RunStatus::Succeeded);
        assert!(report.committed);
        assert_eq!(report.canonical_version, 1);
        assert_eq!(report.records_pulled, 1);
        assert!(report.error.as_deref().unwrap().contains("recording run-000001"));
        assert_eq!(pipeline.canonical_store().open().unwrap().version(), 1);

        let written: RunReport = serde_json::from_slice(
            &std::fs::read(dir.path().join("data/reports/run-000001/run_report.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(written, report);
    }
}
