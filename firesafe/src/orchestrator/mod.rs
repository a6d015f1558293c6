//! Drives every configured source from its checkpoint cursor to a terminal
//! status.
//!
//! Per batch: reserve reads, fetch (with retries), serialize, commit to the
//! sink, then advance and save the checkpoint. The checkpoint is the only
//! place progress is recorded, so a killed process resumes at the first
//! batch whose checkpoint update did not land.

mod retry;

pub use retry::RetryPolicy;

use chrono::Utc;
use firesafe_storage::ArtifactStorage;
use futures::stream::{self, StreamExt, TryStreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::checkpoint::{
    CheckpointLedger, Failure, FailureClass, FileCheckpointStore, SourceProgress, SourceStatus,
};
use crate::config::ExportConfig;
use crate::error::{CheckpointError, Result};
use crate::limiter::SafetyLimiter;
use crate::progress::ExportProgress;
use crate::sink::{DirectorySink, ExportSink, SerializedRecord};
use crate::sources::{Batch, Cursor, RawRecord, SourceExporter, SourceKind};
use crate::summary::{ExportSummary, SourceRun, SUMMARY_FILE};

pub struct Orchestrator {
    config: Arc<ExportConfig>,
    exporters: Vec<Arc<dyn SourceExporter>>,
    ledger: Arc<CheckpointLedger>,
    sink: Arc<dyn ExportSink>,
    limiter: Arc<SafetyLimiter>,
    retry: RetryPolicy,
    cancel: CancellationToken,
    progress: Arc<ExportProgress>,
}

/// How the batch loop of one source ended.
enum Stop {
    Exhausted,
    Limited,
    Failed,
    Cancelled,
}

impl Orchestrator {
    pub fn new(
        config: Arc<ExportConfig>,
        exporters: Vec<Arc<dyn SourceExporter>>,
        ledger: Arc<CheckpointLedger>,
        sink: Arc<dyn ExportSink>,
    ) -> Self {
        Self {
            limiter: Arc::new(SafetyLimiter::from_config(&config)),
            retry: RetryPolicy::from_config(&config.retry),
            cancel: CancellationToken::new(),
            progress: Arc::new(ExportProgress::hidden()),
            config,
            exporters,
            ledger,
            sink,
        }
    }

    /// Open (or create) the checkpoint in `storage` and write into the same tree.
    pub async fn open(
        config: Arc<ExportConfig>,
        exporters: Vec<Arc<dyn SourceExporter>>,
        storage: Arc<dyn ArtifactStorage>,
    ) -> Result<Self> {
        let kinds: Vec<SourceKind> = exporters.iter().map(|e| e.kind()).collect();
        let store = Arc::new(FileCheckpointStore::new(storage.clone()));
        let ledger = CheckpointLedger::open(store, &config.firebase.project_id, &kinds).await?;
        Ok(Self::new(
            config,
            exporters,
            Arc::new(ledger),
            Arc::new(DirectorySink::new(storage)),
        ))
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_progress(mut self, progress: Arc<ExportProgress>) -> Self {
        self.progress = progress;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn ledger(&self) -> &Arc<CheckpointLedger> {
        &self.ledger
    }

    pub fn kinds(&self) -> Vec<SourceKind> {
        self.exporters.iter().map(|e| e.kind()).collect()
    }

    /// Run every source to a terminal status (or until cancelled).
    ///
    /// Source-level failures end up in the summary; only checkpoint and
    /// finalization errors abort the run.
    pub async fn run(&self) -> Result<ExportSummary> {
        let started_at = Utc::now();
        let kinds = self.kinds();
        info!(
            project_id = %self.config.firebase.project_id,
            sources = ?kinds,
            concurrency = self.config.export.max_concurrent_sources,
            "Export run starting"
        );

        let runs: HashMap<SourceKind, SourceRun> = stream::iter(self.exporters.iter().cloned())
            .map(|exporter| self.run_source(exporter))
            .buffer_unordered(self.config.export.max_concurrent_sources.max(1))
            .try_collect()
            .await?;

        let checkpoint = self.ledger.snapshot().await;
        let cancelled = self.cancel.is_cancelled();
        let summary = ExportSummary::build(&checkpoint, &kinds, &runs, started_at, cancelled);
        summary.log();
        self.sink
            .write_run_artifact(SUMMARY_FILE, &serde_json::to_value(&summary)?)
            .await?;

        if !cancelled && checkpoint.is_clean() {
            self.ledger.archive().await?;
        }
        Ok(summary)
    }

    #[instrument(skip_all, fields(source = %exporter.kind()))]
    async fn run_source(
        &self,
        exporter: Arc<dyn SourceExporter>,
    ) -> Result<(SourceKind, SourceRun)> {
        let kind = exporter.kind();
        let started = Instant::now();
        let mut run = SourceRun::default();

        let progress = self
            .ledger
            .get(kind)
            .await
            .ok_or(CheckpointError::UnknownSource(kind))?;

        match progress.status {
            SourceStatus::Completed => {
                info!(records = progress.records_processed, "Already completed");
                self.finish(exporter.as_ref()).await?;
            }
            SourceStatus::Failed | SourceStatus::LimitExceeded => {
                debug!(status = %progress.status, "Source is terminal; not running");
            }
            SourceStatus::Pending | SourceStatus::InProgress => {
                self.progress.start_source(kind, progress.records_processed);
                let (stop, reserved) = self.drive(exporter.as_ref()).await?;
                run.reads_reserved = reserved;
                if matches!(stop, Stop::Exhausted) {
                    self.finish(exporter.as_ref()).await?;
                }
                if let Some(p) = self.ledger.get(kind).await {
                    self.progress.finish_source(kind, p.status);
                }
            }
        }

        run.duration = started.elapsed();
        run.extras = exporter.summary_extras();
        Ok((kind, run))
    }

    /// The batch loop. Returns why it stopped and how many reads it reserved.
    async fn drive(&self, exporter: &dyn SourceExporter) -> Result<(Stop, u64)> {
        let kind = exporter.kind();
        let batch_size = self.config.batch_size(kind);
        let mut reserved = 0u64;

        // Output left in the area by an earlier, archived export must not
        // merge into this one.
        let untouched = self.ledger.get(kind).await.is_some_and(|p| p.is_untouched());
        if untouched {
            if let Err(e) = self.sink.reset(kind).await {
                error!(error = %e, "Could not clear previous output");
                self.fail(kind, FailureClass::Destination, &e.to_string())
                    .await?;
                return Ok((Stop::Failed, reserved));
            }
        }

        let mut current = self.ledger.update(kind, SourceProgress::start).await?;
        if current.cursor.is_some() {
            info!(
                cursor = ?current.cursor,
                records = current.records_processed,
                "Resuming from checkpoint"
            );
        }

        loop {
            if self.cancel.is_cancelled() {
                info!("Cancelled; source left resumable");
                return Ok((Stop::Cancelled, reserved));
            }

            if !self.limiter.check_and_reserve(kind, batch_size as u64) {
                warn!(
                    ceiling = ?self.limiter.ceiling(kind),
                    records = current.records_processed,
                    "Safety limit reached"
                );
                self.ledger.update(kind, SourceProgress::limit_exceeded).await?;
                return Ok((Stop::Limited, reserved));
            }
            reserved += batch_size as u64;

            let cursor = current.cursor.clone();
            let cursor_ref = cursor.as_ref();
            let fetch = self
                .retry
                .run(move || exporter.next_batch(cursor_ref, batch_size));
            let fetched = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    info!("Cancelled; abandoning in-flight fetch");
                    return Ok((Stop::Cancelled, reserved));
                }
                result = fetch => result,
            };

            let batch = match fetched {
                Ok(batch) => batch,
                Err((e, attempts)) => {
                    let class = if e.is_transient() {
                        FailureClass::Transient
                    } else {
                        FailureClass::Fatal
                    };
                    error!(attempts, error = %e, "Fetch failed");
                    self.fail(kind, class, e.message()).await?;
                    return Ok((Stop::Failed, reserved));
                }
            };

            if let Some(reason) = contract_violation(&batch, cursor.as_ref(), batch_size) {
                error!(%reason, "Adapter broke the batch contract");
                self.fail(kind, FailureClass::Fatal, &reason).await?;
                return Ok((Stop::Failed, reserved));
            }

            let Batch {
                records,
                next_cursor,
            } = batch;
            let (serialized, skipped) = serialize_batch(kind, records);
            let processed = serialized.len() as u64;

            let seq = current.batches_committed + 1;
            if let Err(e) = self.sink.commit(kind, seq, &serialized).await {
                error!(seq, error = %e, "Could not write batch");
                self.fail(kind, FailureClass::Destination, &e.to_string())
                    .await?;
                return Ok((Stop::Failed, reserved));
            }

            let exhausted = next_cursor.is_none();
            current = self
                .ledger
                .update(kind, move |p| {
                    p.advance(next_cursor, processed, skipped)?;
                    if exhausted {
                        p.complete()?;
                    }
                    Ok(())
                })
                .await?;
            self.progress.inc(kind, processed);
            debug!(
                seq,
                processed,
                skipped,
                total = current.records_processed,
                "Batch committed"
            );

            if exhausted {
                info!(records = current.records_processed, "Source completed");
                return Ok((Stop::Exhausted, reserved));
            }
        }
    }

    /// Merge the committed segments and write derived artifacts.
    async fn finish(&self, exporter: &dyn SourceExporter) -> Result<()> {
        let kind = exporter.kind();
        let index = self.sink.finalize(kind).await?;
        for (name, content) in exporter.derived_artifacts(&index).await {
            self.sink.write_artifact(kind, &name, &content).await?;
        }
        Ok(())
    }

    async fn fail(&self, kind: SourceKind, class: FailureClass, message: &str) -> Result<()> {
        let failure = Failure::new(class, message);
        self.ledger.update(kind, move |p| p.fail(failure)).await?;
        Ok(())
    }
}

fn contract_violation(
    batch: &Batch,
    cursor: Option<&Cursor>,
    batch_size: usize,
) -> Option<String> {
    if batch.next_cursor.is_some() && batch.next_cursor.as_ref() == cursor {
        return Some(format!(
            "adapter returned the cursor it was given ({:?}) without progress",
            cursor
        ));
    }
    if batch.records.len() > batch_size {
        return Some(format!(
            "adapter returned {} records for a batch of {}",
            batch.records.len(),
            batch_size
        ));
    }
    None
}

/// Serialize every record, skipping (and counting) the ones that fail.
fn serialize_batch(
    kind: SourceKind,
    records: Vec<RawRecord>,
) -> (Vec<SerializedRecord>, u64) {
    let mut out = Vec::with_capacity(records.len());
    let mut skipped = 0u64;
    for raw in records {
        let id = raw.id.clone();
        match raw.serialize() {
            Ok(record) => out.push(record),
            Err(e) => {
                warn!(source = %kind, record = %id, error = %e, "Skipping record");
                skipped += 1;
            }
        }
    }
    (out, skipped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{Fault, MemoryPlatform};
    use crate::error::SourceError;
    use crate::sources::build_exporters;
    use firesafe_storage::LocalStorage;
    use serde_json::json;
    use tempfile::TempDir;

    fn config(firestore_batch: usize) -> Arc<ExportConfig> {
        let mut config = ExportConfig::for_project("demo");
        config.export.firestore_batch_size = firestore_batch;
        config.export.auth_batch_size = 2;
        Arc::new(config)
    }

    fn platform() -> Arc<MemoryPlatform> {
        let p = MemoryPlatform::new();
        for i in 0..5 {
            p.add_document(&format!("users/u{}", i), json!({"n": {"integerValue": i.to_string()}}));
        }
        p.add_user(json!({"localId": "a"}));
        p.add_user(json!({"localId": "b"}));
        p.add_user(json!({"localId": "c"}));
        Arc::new(p)
    }

    async fn orchestrator(
        dir: &TempDir,
        config: Arc<ExportConfig>,
        platform: Arc<MemoryPlatform>,
    ) -> Orchestrator {
        let exporters = build_exporters(&config, platform);
        Orchestrator::open(
            config,
            exporters,
            Arc::new(LocalStorage::new(dir.path())),
        )
        .await
        .unwrap()
        .with_retry(RetryPolicy::immediate(3))
    }

    #[tokio::test]
    async fn test_clean_run_archives_checkpoint() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(&dir, config(2), platform()).await;
        let summary = orch.run().await.unwrap();

        assert!(summary.is_clean());
        assert_eq!(summary.source(SourceKind::Firestore).unwrap().records_processed, 5);
        assert_eq!(summary.source(SourceKind::Auth).unwrap().records_processed, 3);
        assert!(!dir.path().join(".checkpoint.json").exists());
        assert!(dir.path().join(".checkpoint.completed.json").exists());
        assert!(dir.path().join("export_summary.json").exists());
        assert!(dir.path().join("firestore/records.ndjson").exists());
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let dir = TempDir::new().unwrap();
        let p = platform();
        p.inject(
            SourceKind::Auth,
            Fault::once(SourceError::Transient("503".into())).times(2),
        );
        let orch = orchestrator(&dir, config(10), p.clone()).await;
        let summary = orch.run().await.unwrap();

        assert_eq!(summary.source(SourceKind::Auth).unwrap().status, SourceStatus::Completed);
        // two failures + two successful pages
        assert_eq!(p.calls(SourceKind::Auth), 4);
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail_source() {
        let dir = TempDir::new().unwrap();
        let p = platform();
        p.inject(SourceKind::Auth, Fault::always(SourceError::Transient("503".into())));
        let orch = orchestrator(&dir, config(10), p.clone()).await;
        let summary = orch.run().await.unwrap();

        let auth = summary.source(SourceKind::Auth).unwrap();
        assert_eq!(auth.status, SourceStatus::Failed);
        assert_eq!(auth.failure_class, Some(FailureClass::Transient));
        assert_eq!(p.calls(SourceKind::Auth), 3);
        assert!(dir.path().join(".checkpoint.json").exists());
    }

    #[tokio::test]
    async fn test_skipped_records_are_counted() {
        let dir = TempDir::new().unwrap();
        let p = platform();
        p.add_document("users/zz", json!({"v": {"vectorValue": {}}}));
        let orch = orchestrator(&dir, config(10), p).await;
        let summary = orch.run().await.unwrap();

        let fs = summary.source(SourceKind::Firestore).unwrap();
        assert_eq!(fs.status, SourceStatus::Completed);
        assert_eq!(fs.records_processed, 5);
        assert_eq!(fs.records_skipped, 1);
    }

    #[test]
    fn test_contract_violation() {
        use crate::serializer::NativeFormat;

        let same = Batch::new(Vec::new(), Some(Cursor::new("c")));
        assert!(contract_violation(&same, Some(&Cursor::new("c")), 10).is_some());

        let oversized = Batch::new(
            vec![RawRecord::new("a", json!(1), NativeFormat::PlainJson); 3],
            None,
        );
        assert!(contract_violation(&oversized, None, 2).is_some());

        let ok = Batch::new(Vec::new(), None);
        assert!(contract_violation(&ok, None, 2).is_none());
    }
}
