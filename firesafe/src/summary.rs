//! Per-run report folded from the final checkpoint.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tracing::{info, warn};

use crate::checkpoint::{Checkpoint, FailureClass, SourceStatus};
use crate::sources::SourceKind;

pub const SUMMARY_FILE: &str = "export_summary.json";

/// What one source did during this run, beyond its checkpoint entry.
#[derive(Debug, Clone, Default)]
pub struct SourceRun {
    pub duration: Duration,
    pub reads_reserved: u64,
    pub extras: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSummary {
    pub source: SourceKind,
    pub status: SourceStatus,
    pub records_processed: u64,
    pub records_skipped: u64,
    pub batches_committed: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_class: Option<FailureClass>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_message: Option<String>,
    pub duration_secs: f64,
    pub reads_reserved: u64,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extras: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportSummary {
    pub project_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_secs: f64,
    pub cancelled: bool,
    pub sources: Vec<SourceSummary>,
}

impl ExportSummary {
    /// Fold the checkpoint entries of `kinds` with this run's timings.
    pub fn build(
        checkpoint: &Checkpoint,
        kinds: &[SourceKind],
        runs: &HashMap<SourceKind, SourceRun>,
        started_at: DateTime<Utc>,
        cancelled: bool,
    ) -> Self {
        let finished_at = Utc::now();
        let sources = kinds
            .iter()
            .map(|kind| {
                let progress = checkpoint.progress(*kind).cloned().unwrap_or_default();
                let run = runs.get(kind).cloned().unwrap_or_default();
                SourceSummary {
                    source: *kind,
                    status: progress.status,
                    records_processed: progress.records_processed,
                    records_skipped: progress.records_skipped,
                    batches_committed: progress.batches_committed,
                    failure_class: progress.failure.as_ref().map(|f| f.class),
                    failure_message: progress.failure.map(|f| f.message),
                    duration_secs: run.duration.as_secs_f64(),
                    reads_reserved: run.reads_reserved,
                    extras: run.extras,
                }
            })
            .collect();

        Self {
            project_id: checkpoint.project_id.clone(),
            started_at,
            finished_at,
            duration_secs: (finished_at - started_at)
                .to_std()
                .map(|d| d.as_secs_f64())
                .unwrap_or(0.0),
            cancelled,
            sources,
        }
    }

    pub fn source(&self, kind: SourceKind) -> Option<&SourceSummary> {
        self.sources.iter().find(|s| s.source == kind)
    }

    /// Every source completed.
    pub fn is_clean(&self) -> bool {
        self.sources
            .iter()
            .all(|s| s.status == SourceStatus::Completed)
    }

    pub fn any_failed(&self) -> bool {
        self.sources.iter().any(|s| s.status == SourceStatus::Failed)
    }

    pub fn total_records(&self) -> u64 {
        self.sources.iter().map(|s| s.records_processed).sum()
    }

    pub fn total_skipped(&self) -> u64 {
        self.sources.iter().map(|s| s.records_skipped).sum()
    }

    pub fn log(&self) {
        for s in &self.sources {
            match s.status {
                SourceStatus::Completed => info!(
                    source = %s.source,
                    records = s.records_processed,
                    skipped = s.records_skipped,
                    duration_secs = s.duration_secs,
                    "Source completed"
                ),
                SourceStatus::Failed => warn!(
                    source = %s.source,
                    records = s.records_processed,
                    class = ?s.failure_class,
                    error = s.failure_message.as_deref().unwrap_or(""),
                    "Source failed"
                ),
                SourceStatus::LimitExceeded => warn!(
                    source = %s.source,
                    records = s.records_processed,
                    reads_reserved = s.reads_reserved,
                    "Source stopped at its safety limit"
                ),
                SourceStatus::Pending | SourceStatus::InProgress => info!(
                    source = %s.source,
                    records = s.records_processed,
                    status = %s.status,
                    "Source not finished; run again to resume"
                ),
            }
        }
        info!(
            project_id = %self.project_id,
            records = self.total_records(),
            skipped = self.total_skipped(),
            duration_secs = self.duration_secs,
            clean = self.is_clean(),
            "Export run finished"
        );
    }
}

impl fmt::Display for ExportSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Export of '{}'", self.project_id)?;
        writeln!(
            f,
            "{:<12} {:<15} {:>10} {:>8} {:>9}",
            "SOURCE", "STATUS", "RECORDS", "SKIPPED", "SECONDS"
        )?;
        for s in &self.sources {
            writeln!(
                f,
                "{:<12} {:<15} {:>10} {:>8} {:>9.1}",
                s.source.as_str(),
                s.status.as_str(),
                s.records_processed,
                s.records_skipped,
                s.duration_secs
            )?;
            if let Some(message) = &s.failure_message {
                writeln!(f, "  {}", message)?;
            }
        }
        if self.cancelled {
            writeln!(f, "Run was interrupted; run again to resume.")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::Failure;
    use crate::sources::Cursor;
    use serde_json::json;

    fn checkpoint() -> Checkpoint {
        let mut cp = Checkpoint::new("demo", &[SourceKind::Firestore, SourceKind::Auth]);
        let fs = cp.sources.get_mut(&SourceKind::Firestore).unwrap();
        fs.start().unwrap();
        fs.advance(Some(Cursor::new("c1")), 4, 1).unwrap();
        fs.limit_exceeded().unwrap();
        let auth = cp.sources.get_mut(&SourceKind::Auth).unwrap();
        auth.start().unwrap();
        auth.fail(Failure::new(FailureClass::Fatal, "permission denied"))
            .unwrap();
        cp
    }

    #[test]
    fn test_build_from_checkpoint() {
        let mut runs = HashMap::new();
        let mut extras = Map::new();
        extras.insert("collections_visited".into(), json!(2));
        runs.insert(
            SourceKind::Firestore,
            SourceRun {
                duration: Duration::from_millis(1500),
                reads_reserved: 4,
                extras,
            },
        );
        let summary = ExportSummary::build(
            &checkpoint(),
            &[SourceKind::Firestore, SourceKind::Auth],
            &runs,
            Utc::now(),
            false,
        );

        let fs = summary.source(SourceKind::Firestore).unwrap();
        assert_eq!(fs.status, SourceStatus::LimitExceeded);
        assert_eq!(fs.records_processed, 4);
        assert_eq!(fs.records_skipped, 1);
        assert_eq!(fs.duration_secs, 1.5);
        assert_eq!(fs.extras["collections_visited"], 2);

        let auth = summary.source(SourceKind::Auth).unwrap();
        assert_eq!(auth.failure_class, Some(FailureClass::Fatal));
        assert!(summary.any_failed());
        assert!(!summary.is_clean());
        assert_eq!(summary.total_records(), 4);
    }

    #[test]
    fn test_json_shape() {
        let summary = ExportSummary::build(
            &checkpoint(),
            &[SourceKind::Auth],
            &HashMap::new(),
            Utc::now(),
            false,
        );
        let value = serde_json::to_value(&summary).unwrap();
        assert_eq!(value["sources"][0]["source"], "auth");
        assert_eq!(value["sources"][0]["status"], "failed");
        assert_eq!(value["sources"][0]["failure_class"], "fatal");
        assert!(value["sources"][0].get("extras").is_none());
    }

    #[test]
    fn test_display() {
        let summary = ExportSummary::build(
            &checkpoint(),
            &[SourceKind::Firestore, SourceKind::Auth],
            &HashMap::new(),
            Utc::now(),
            true,
        );
        let text = summary.to_string();
        assert!(text.contains("limit_exceeded"));
        assert!(text.contains("permission denied"));
        assert!(text.contains("resume"));
    }
}
