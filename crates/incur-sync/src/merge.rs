//! Upsert of one run's candidates into a canonical snapshot.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use incur_core::{
    Candidate, CanonicalRecord, CanonicalSnapshot, IngestionMode, RunId, TerminalStatuses,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// Older than the canonical revision; counted as unchanged.
    StaleUpdate,
    /// The canonical record is terminal and the run is not a full backfill.
    TerminalLocked,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyOutcome {
    pub natural_key: String,
    pub reason: RejectReason,
    pub candidate_last_modified: DateTime<Utc>,
    pub existing_last_modified: DateTime<Utc>,
    pub existing_status: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeReport {
    pub inserted: usize,
    pub updated: usize,
    pub rejected: usize,
    pub unchanged: usize,
    pub batch_duplicates: usize,
    pub outcomes: Vec<KeyOutcome>,
}

impl MergeReport {
    pub fn changed(&self) -> bool {
        self.inserted + self.updated > 0
    }

    pub fn rejections(&self) -> impl Iterator<Item = &KeyOutcome> {
        self.outcomes
            .iter()
            .filter(|outcome| outcome.reason == RejectReason::TerminalLocked)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeContext {
    pub run_id: RunId,
    pub mode: IngestionMode,
    /// Stamped as `curated_at` on every inserted or updated record.
    pub run_time: DateTime<Utc>,
}

/// The next table contents. Untouched records share their `Arc` with the
/// snapshot they were merged into.
#[derive(Debug, Clone)]
pub struct MergeOutput {
    pub records: BTreeMap<String, Arc<CanonicalRecord>>,
    pub report: MergeReport,
}

#[derive(Debug, Clone, Default)]
pub struct UpsertMerger {
    terminal: TerminalStatuses,
}

impl UpsertMerger {
    pub fn new(terminal: TerminalStatuses) -> Self {
        Self { terminal }
    }

    pub fn terminal_statuses(&self) -> &TerminalStatuses {
        &self.terminal
    }

    /// Keeps one candidate per key: greatest `source_last_modified`, then
    /// greatest ordinal.
    pub fn dedup_batch(candidates: Vec<Candidate>) -> (BTreeMap<String, Candidate>, usize) {
        let mut survivors: BTreeMap<String, Candidate> = BTreeMap::new();
        let mut duplicates = 0;
        for candidate in candidates {
            match survivors.get(&candidate.natural_key) {
                Some(kept) => {
                    duplicates += 1;
                    if (candidate.source_last_modified, candidate.ordinal)
                        > (kept.source_last_modified, kept.ordinal)
                    {
                        survivors.insert(candidate.natural_key.clone(), candidate);
                    }
                }
                None => {
                    survivors.insert(candidate.natural_key.clone(), candidate);
                }
            }
        }
        (survivors, duplicates)
    }

    /// Never mutates `table`.
    pub fn merge(
        &self,
        table: &CanonicalSnapshot,
        candidates: Vec<Candidate>,
        ctx: &MergeContext,
    ) -> MergeOutput {
        let (survivors, batch_duplicates) = Self::dedup_batch(candidates);
        let mut records = table.entries().clone();
        let mut report = MergeReport {
            batch_duplicates,
            ..MergeReport::default()
        };

        for (key, candidate) in survivors {
            let Some(existing) = records.get(&key) else {
                records.insert(key, Arc::new(candidate.into_record(ctx.run_id, ctx.run_time)));
                report.inserted += 1;
                continue;
            };

            if existing.same_revision(&candidate) {
                report.unchanged += 1;
                continue;
            }

            let reason = if self.terminal.is_terminal(existing.status.as_deref())
                && !ctx.mode.is_backfill()
            {
                Some(RejectReason::TerminalLocked)
            } else if candidate.source_last_modified < existing.source_last_modified {
                Some(RejectReason::StaleUpdate)
            } else {
                None
            };

            match reason {
                Some(reason) => {
                    debug!(natural_key = %key, ?reason, "candidate not applied");
                    match reason {
                        RejectReason::TerminalLocked => report.rejected += 1,
                        RejectReason::StaleUpdate => report.unchanged += 1,
                    }
                    report.outcomes.push(KeyOutcome {
                        natural_key: key,
                        reason,
                        candidate_last_modified: candidate.source_last_modified,
                        existing_last_modified: existing.source_last_modified,
                        existing_status: existing.status.clone(),
                    });
                }
                None => {
                    records.insert(key, Arc::new(candidate.into_record(ctx.run_id, ctx.run_time)));
                    report.updated += 1;
                }
            }
        }

        MergeOutput { records, report }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use incur_core::FieldValue;

    fn ts(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 24, hour, 0, 0).single().unwrap()
    }

    fn candidate(key: &str, status: &str, hour: u32, ordinal: u64) -> Candidate {
        Candidate {
            natural_key: key.to_string(),
            source_last_modified: ts(hour),
            status: Some(status.to_string()),
            mapping_version: "v1".to_string(),
            ordinal,
            fields: BTreeMap::from([(
                "assignment_group_id".to_string(),
                FieldValue::Text("G1".to_string()),
            )]),
        }
    }

    fn ctx(run: u64, mode: IngestionMode, hour: u32) -> MergeContext {
        MergeContext {
            run_id: RunId(run),
            mode,
            run_time: ts(hour),
        }
    }

    fn merger() -> UpsertMerger {
        UpsertMerger::new(TerminalStatuses::new(["Closed", "Resolved"]))
    }

    fn apply(table: &CanonicalSnapshot, out: MergeOutput, hour: u32) -> CanonicalSnapshot {
        CanonicalSnapshot::new(table.version() + 1, ts(hour), out.records)
    }

    #[test]
    fn insert_into_empty_table() {
        let out = merger().merge(
            &CanonicalSnapshot::empty(),
            vec![candidate("INC1", "Open", 1, 0)],
            &ctx(1, IngestionMode::IncrementalOpen, 10),
        );
        assert_eq!(out.report.inserted, 1);
        let row = &out.records["INC1"];
        assert_eq!(row.status.as_deref(), Some("Open"));
        assert_eq!(row.source_last_modified, ts(1));
        assert_eq!(row.curated_at, ts(10));
        assert_eq!(row.run_id, RunId(1));
        assert_eq!(row.fields["assignment_group_id"], FieldValue::Text("G1".into()));
    }

    #[test]
    fn older_candidate_is_stale() {
        let merger = merger();
        let empty = CanonicalSnapshot::empty();
        let v1 = apply(
            &empty,
            merger.merge(&empty, vec![candidate("INC1", "Open", 2, 0)], &ctx(1, IngestionMode::IncrementalOpen, 10)),
            10,
        );
        let out = merger.merge(&v1, vec![candidate("INC1", "Open", 1, 0)], &ctx(2, IngestionMode::IncrementalOpen, 11));
        assert_eq!(out.report.unchanged, 1);
        assert_eq!(out.report.updated, 0);
        assert_eq!(out.report.outcomes[0].reason, RejectReason::StaleUpdate);
        assert!(!out.report.changed());
        assert!(Arc::ptr_eq(&out.records["INC1"], &v1.entries()["INC1"]));
    }

    #[test]
    fn terminal_records_lock_outside_backfill() {
        let merger = merger();
        let empty = CanonicalSnapshot::empty();
        let v1 = apply(
            &empty,
            merger.merge(&empty, vec![candidate("INC1", "Open", 1, 0)], &ctx(1, IngestionMode::IncrementalOpen, 10)),
            10,
        );
        let closed = merger.merge(&v1, vec![candidate("INC1", "Closed", 2, 0)], &ctx(2, IngestionMode::IncrementalOpen, 11));
        assert_eq!(closed.report.updated, 1);
        let v2 = apply(&v1, closed, 11);

        let reopen = vec![candidate("INC1", "Open", 3, 0)];
        let locked = merger.merge(&v2, reopen.clone(), &ctx(3, IngestionMode::IncrementalOpen, 12));
        assert_eq!(locked.report.rejected, 1);
        assert_eq!(locked.report.rejections().count(), 1);
        assert_eq!(locked.records["INC1"].status.as_deref(), Some("Closed"));

        let stale_locked = merger.merge(&v2, vec![candidate("INC1", "Open", 0, 0)], &ctx(3, IngestionMode::IncrementalOpen, 12));
        assert_eq!(stale_locked.report.rejected, 1);
        assert_eq!(stale_locked.report.unchanged, 0);

        let backfill = merger.merge(&v2, reopen, &ctx(3, IngestionMode::FullBackfill, 12));
        assert_eq!(backfill.report.updated, 1);
        assert_eq!(backfill.records["INC1"].status.as_deref(), Some("Open"));
        assert_eq!(backfill.records["INC1"].source_last_modified, ts(3));
    }

    #[test]
    fn batch_dedup_prefers_latest_then_highest_ordinal() {
        let mut late = candidate("INC1", "In Progress", 5, 0);
        late.fields.insert("priority".into(), FieldValue::Integer(1));
        let mut tie = candidate("INC1", "On Hold", 5, 7);
        tie.fields.insert("priority".into(), FieldValue::Integer(2));
        let batch = vec![candidate("INC1", "Open", 3, 9), tie, late];

        let out = merger().merge(&CanonicalSnapshot::empty(), batch, &ctx(1, IngestionMode::IncrementalOpen, 10));
        assert_eq!(out.report.inserted, 1);
        assert_eq!(out.report.batch_duplicates, 2);
        assert_eq!(out.records["INC1"].status.as_deref(), Some("On Hold"));
    }

    #[test]
    fn replaying_a_batch_changes_nothing() {
        let merger = merger();
        let batch = vec![
            candidate("INC1", "Open", 1, 0),
            candidate("INC2", "Closed", 2, 1),
            candidate("INC3", "Open", 3, 2),
        ];
        let empty = CanonicalSnapshot::empty();
        let once = apply(&empty, merger.merge(&empty, batch.clone(), &ctx(1, IngestionMode::IncrementalOpen, 10)), 10);
        let replay = merger.merge(&once, batch, &ctx(2, IngestionMode::IncrementalOpen, 11));

        assert_eq!(replay.report.unchanged, 3);
        assert!(!replay.report.changed());
        let twice = apply(&once, replay, 11);
        assert_eq!(
            once.records().collect::<Vec<_>>(),
            twice.records().collect::<Vec<_>>()
        );
    }

    #[test]
    fn recency_never_decreases_and_keys_stay_unique() {
        let merger = merger();
        let mut table = CanonicalSnapshot::empty();
        let batches = [
            vec![candidate("A", "Open", 4, 0), candidate("B", "Open", 1, 1)],
            vec![candidate("A", "Open", 2, 0), candidate("B", "Open", 6, 1), candidate("B", "Open", 3, 2)],
            vec![candidate("A", "Open", 8, 0), candidate("C", "Open", 1, 1), candidate("A", "Open", 5, 2)],
        ];
        let mut last_seen: BTreeMap<String, DateTime<Utc>> = BTreeMap::new();
        for (run, batch) in batches.into_iter().enumerate() {
            let out = merger.merge(&table, batch, &ctx(run as u64 + 1, IngestionMode::IncrementalOpen, 10 + run as u32));
            table = apply(&table, out, 10 + run as u32);
            for record in table.records() {
                if let Some(previous) = last_seen.insert(record.natural_key.clone(), record.source_last_modified) {
                    assert!(record.source_last_modified >= previous, "{} went backwards", record.natural_key);
                }
            }
            let keys = table.records().map(|r| r.natural_key.as_str()).collect::<Vec<_>>();
            let mut unique = keys.clone();
            unique.dedup();
            assert_eq!(keys, unique);
        }
        assert_eq!(table.get("A").unwrap().source_last_modified, ts(8));
        assert_eq!(table.get("B").unwrap().source_last_modified, ts(6));
    }

    #[test]
    fn merging_leaves_the_input_snapshot_untouched() {
        let merger = merger();
        let empty = CanonicalSnapshot::empty();
        let v1 = apply(&empty, merger.merge(&empty, vec![candidate("INC1", "Open", 1, 0)], &ctx(1, IngestionMode::IncrementalOpen, 10)), 10);
        let held = v1.clone();
        let _ = merger.merge(&v1, vec![candidate("INC1", "Closed", 2, 0), candidate("INC2", "Open", 2, 1)], &ctx(2, IngestionMode::IncrementalOpen, 11));
        assert_eq!(held.len(), 1);
        assert_eq!(held.get("INC1").unwrap().status.as_deref(), Some("Open"));
    }
}
