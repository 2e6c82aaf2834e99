//! Run orchestration: resume filter, batching, per-record retries, persistence

use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use annoline_core::{
    CancelFlag, RetryOutcome, SharedProgress, WorkQueue, fmt_num, fmt_pct, retry_with_backoff,
};
use annoline_store::{
    AnnotationResult, AnnotationStatus, DatasetId, Failure, FailureKind, Record, ResultStore,
    RunMetadata, RunOutcome, RunWriter,
};
use indicatif::ProgressBar;

use crate::batch::{self, Batch, BatchError};
use crate::client::AnnotationClient;
use crate::config::{ConfigError, RunSettings};
use crate::source::{RecordSource, SourceError};
use crate::state::{Ledger, LedgerError};

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("invalid run configuration: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Batch(#[from] BatchError),
    /// Backend unusable; later records were skipped.
    #[error("run aborted: {reason}")]
    BackendFatal {
        reason: String,
        report: Box<RunReport>,
    },
    #[error("run cancelled: {reason}")]
    Cancelled {
        reason: String,
        report: Box<RunReport>,
    },
    #[error("result store: {0:#}")]
    Store(anyhow::Error),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl RunError {
    /// Partial report for runs that stopped after starting.
    pub fn report(&self) -> Option<&RunReport> {
        match self {
            Self::BackendFatal { report, .. } | Self::Cancelled { report, .. } => Some(report),
            _ => None,
        }
    }
}

/// Final tallies of one run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: String,
    pub dataset: DatasetId,
    pub total: usize,
    pub success: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Source records left out because earlier runs finished them.
    pub resumed: usize,
    pub outcome: RunOutcome,
    pub dir: PathBuf,
    pub content_hash: String,
    pub elapsed: Duration,
}

impl RunReport {
    fn from_metadata(
        meta: &RunMetadata,
        dir: PathBuf,
        content_hash: String,
        elapsed: Duration,
    ) -> Self {
        Self {
            run_id: meta.run_id.clone(),
            dataset: meta.dataset.clone(),
            total: meta.total_records,
            success: meta.success_count,
            failed: meta.failed_count,
            skipped: meta.skipped_count,
            resumed: meta.resumed_count,
            outcome: meta.outcome.clone(),
            dir,
            content_hash,
            elapsed,
        }
    }

    pub fn log(&self) {
        log::info!("=== Run Summary ===");
        log::info!("Run: {} ({})", self.run_id, self.outcome);
        log::info!("Dataset: {}", self.dataset);
        log::info!(
            "Records: {} total, {} success ({}), {} failed, {} skipped",
            fmt_num(self.total),
            fmt_num(self.success),
            fmt_pct(self.success, self.total),
            fmt_num(self.failed),
            fmt_num(self.skipped)
        );
        if self.resumed > 0 {
            log::info!("Resumed: {} already done in earlier runs", fmt_num(self.resumed));
        }
        log::info!("Time: {:.1}s", self.elapsed.as_secs_f64());
        log::info!("Output: {}", self.dir.display());
    }
}

/// Why a run stopped early.
#[derive(Debug, Clone)]
enum Halt {
    Fatal(String),
    Cancelled(String),
}

impl Halt {
    fn skip_kind(&self) -> FailureKind {
        match self {
            Self::Fatal(_) => FailureKind::Aborted,
            Self::Cancelled(_) => FailureKind::Cancelled,
        }
    }

    fn skip_reason(&self) -> String {
        match self {
            Self::Fatal(reason) => format!("run aborted: {reason}"),
            Self::Cancelled(reason) => format!("run cancelled: {reason}"),
        }
    }
}

/// Mutable state of one run, owned by the coordinator.
struct RunContext {
    ledger: Ledger,
    writer: RunWriter,
    halt: Option<Halt>,
    bar: ProgressBar,
}

impl RunContext {
    /// Move a finished batch into terminal states and persist it as one part.
    fn commit(&mut self, results: Vec<AnnotationResult>) -> Result<(), RunError> {
        for r in &results {
            self.ledger.resolve(r.record_id(), r.status)?;
        }
        self.bar.inc(results.len() as u64);
        self.writer.append(results).map_err(RunError::Store)?;
        Ok(())
    }

    /// Seal the run as aborted after an internal error, so `run.json` does not
    /// stay `running`. Parts already written remain usable for resumption.
    fn abandon(self, err: &RunError) {
        let reason = err.to_string();
        self.bar.abandon();
        match self.writer.finish(RunOutcome::Aborted {
            reason: reason.clone(),
        }) {
            Ok(handle) => log::error!("Run {} aborted: {reason}", handle.run_id),
            Err(e) => log::error!("Failed to seal run after error ({reason}): {e:#}"),
        }
    }

    /// Skip a batch that never started.
    fn skip_batch(&mut self, batch: Batch, halt: &Halt) -> Result<(), RunError> {
        let reason = halt.skip_reason();
        let results = batch
            .records
            .into_iter()
            .map(|r| AnnotationResult::skipped(r, halt.skip_kind(), reason.clone()))
            .collect();
        self.commit(results)
    }
}

/// Drives a [`RecordSource`] through an [`AnnotationClient`] into a [`ResultStore`].
pub struct RunCoordinator<'a> {
    source: &'a dyn RecordSource,
    client: AnnotationClient,
    store: &'a ResultStore,
    settings: RunSettings,
    progress: Option<SharedProgress>,
}

impl<'a> RunCoordinator<'a> {
    pub fn new(
        source: &'a dyn RecordSource,
        client: AnnotationClient,
        store: &'a ResultStore,
        settings: RunSettings,
    ) -> Self {
        Self {
            source,
            client,
            store,
            settings,
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: SharedProgress) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Records this run will annotate, plus how many were excluded by resumption.
    ///
    /// Drains the source up to the subset cap, so every source error
    /// surfaces before the first batch.
    fn collect_work(&self) -> Result<(Vec<Record>, usize), RunError> {
        let dataset = self.source.dataset();
        let done = self
            .store
            .completed_records(dataset, self.settings.resume)
            .map_err(RunError::Store)?;
        if !done.is_empty() {
            log::info!(
                "{} records of {dataset} already done ({} policy)",
                fmt_num(done.len()),
                self.settings.resume
            );
        }

        let mut work = Vec::new();
        let mut resumed = 0;
        for item in self.source.records()? {
            let record = item?;
            if done.contains(&record.id) {
                resumed += 1;
                continue;
            }
            work.push(record);
            if self.settings.subset_size.is_some_and(|cap| work.len() >= cap) {
                break;
            }
        }
        Ok((work, resumed))
    }

    /// Execute the run. Fatal backend errors and cancellation return the
    /// partial report inside the error, after everything terminal is persisted.
    pub fn run(&self, cancel: &CancelFlag) -> Result<RunReport, RunError> {
        let start = Instant::now();
        self.settings.validate()?;

        let dataset = self.source.dataset().clone();
        log::info!("Reading {dataset}");
        let (work, resumed) = self.collect_work()?;
        let ledger = Ledger::new(work.iter().map(|r| r.id)).map_err(|e| match e {
            LedgerError::DuplicateId(id) => SourceError::Format {
                path: dataset.to_string(),
                reason: format!("duplicate record id {id}"),
            }
            .into(),
            other => RunError::from(other),
        })?;

        let total = work.len();
        let batch_total = batch::batch_count(total, self.settings.batch_size);
        let batches = batch::batch(work, self.settings.batch_size)?;

        let provenance = self.settings.provenance(self.client.guideline());
        let mut metadata = RunMetadata::start(dataset.clone(), provenance);
        metadata.resumed_count = resumed;
        let writer = self.store.begin_run(metadata).map_err(RunError::Store)?;
        log::info!(
            "Run {}: {} records in {} batches of {} with {} ({})",
            writer.metadata().run_id,
            fmt_num(total),
            batch_total,
            self.settings.batch_size,
            self.settings.annotation_model,
            self.client.backend_name()
        );

        let (bar, status) = match &self.progress {
            Some(p) => (
                p.run_bar(&dataset.source, total as u64),
                p.status_line("batch"),
            ),
            None => (ProgressBar::hidden(), ProgressBar::hidden()),
        };
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.settings.concurrency)
            .thread_name(|i| format!("annotate-{i}"))
            .build()
            .map_err(|e| ConfigError::Invalid(format!("worker pool: {e}")))?;

        let mut ctx = RunContext {
            ledger,
            writer,
            halt: None,
            bar,
        };

        if let Err(e) = self.drive(&mut ctx, batches, &pool, &status, batch_total, cancel) {
            status.finish_and_clear();
            ctx.abandon(&e);
            return Err(e);
        }

        status.finish_and_clear();
        ctx.bar.finish();
        debug_assert!(ctx.ledger.all_terminal());

        let outcome = match &ctx.halt {
            None => RunOutcome::Completed,
            Some(Halt::Fatal(reason)) => RunOutcome::Aborted {
                reason: reason.clone(),
            },
            Some(Halt::Cancelled(reason)) => RunOutcome::Cancelled {
                reason: reason.clone(),
            },
        };
        let RunContext { writer, halt, .. } = ctx;
        let mut meta = writer.metadata().clone();
        meta.finish(outcome.clone());
        let handle = writer.finish(outcome).map_err(RunError::Store)?;
        let report =
            RunReport::from_metadata(&meta, handle.dir, handle.content_hash, start.elapsed());
        report.log();

        match halt {
            None => Ok(report),
            Some(Halt::Fatal(reason)) => Err(RunError::BackendFatal {
                reason,
                report: Box::new(report),
            }),
            Some(Halt::Cancelled(reason)) => Err(RunError::Cancelled {
                reason,
                report: Box::new(report),
            }),
        }
    }

    /// Run or skip every batch in order, committing each one as it ends.
    fn drive(
        &self,
        ctx: &mut RunContext,
        batches: impl Iterator<Item = Batch>,
        pool: &rayon::ThreadPool,
        status: &ProgressBar,
        batch_total: usize,
        cancel: &CancelFlag,
    ) -> Result<(), RunError> {
        for batch in batches {
            if ctx.halt.is_none() {
                if let Some(reason) = cancel.reason() {
                    log::warn!("Cancellation requested ({reason}), skipping remaining batches");
                    ctx.halt = Some(Halt::Cancelled(reason.to_string()));
                }
            }
            if let Some(halt) = ctx.halt.clone() {
                ctx.skip_batch(batch, &halt)?;
                continue;
            }

            status.set_message(format!(
                "{}/{} ({} records)",
                batch.index + 1,
                batch_total,
                batch.len()
            ));
            let (results, halt) = self.run_batch(pool, &mut ctx.ledger, &batch, cancel)?;
            let ok = results
                .iter()
                .filter(|r| r.status == AnnotationStatus::Success)
                .count();
            log::info!(
                "Batch {}/{}: {}/{} annotated",
                batch.index + 1,
                batch_total,
                ok,
                batch.len()
            );
            ctx.commit(results)?;
            ctx.halt = halt;
        }

        Ok(())
    }

    /// Annotate one batch on up to `min(concurrency, batch.len())` workers.
    ///
    /// Results come back in record order. Records nobody claimed before a
    /// fatal error or cancellation are skipped with `attempt_count = 0`.
    /// Records already in flight finish their current call but are not
    /// retried; a retryable failure then ends Skipped with the attempts made.
    fn run_batch(
        &self,
        pool: &rayon::ThreadPool,
        ledger: &mut Ledger,
        batch: &Batch,
        cancel: &CancelFlag,
    ) -> Result<(Vec<AnnotationResult>, Option<Halt>), RunError> {
        for record in &batch.records {
            ledger.begin(record.id)?;
        }

        let queue = WorkQueue::new(batch.records.iter().collect());
        let workers = self.settings.concurrency.min(batch.len());
        let fatal = AtomicBool::new(false);
        let fatal_reason: Mutex<Option<String>> = Mutex::new(None);
        let finished: Mutex<Vec<(usize, AnnotationResult)>> =
            Mutex::new(Vec::with_capacity(batch.len()));
        let model = self.settings.annotation_model.as_str();

        pool.scope(|s| {
            for _ in 0..workers {
                s.spawn(|_| {
                    loop {
                        if fatal.load(Ordering::SeqCst) || cancel.is_cancelled() {
                            break;
                        }
                        let Some((pos, record)) = queue.claim() else {
                            break;
                        };
                        let label = format!("record {}", record.id);
                        let stop = || fatal.load(Ordering::SeqCst) || cancel.is_cancelled();
                        let outcome = retry_with_backoff(&label, &self.settings.retry, stop, |_| {
                            self.client.annotate_record(record, model)
                        });
                        let result = match outcome {
                            RetryOutcome::Succeeded { value, attempts } => {
                                AnnotationResult::success(
                                    (*record).clone(),
                                    value.payload,
                                    value.pair_payload,
                                    attempts,
                                )
                                .with_prompts(Some(value.prompt), value.pair_prompt)
                            }
                            RetryOutcome::Failed { error, attempts } => {
                                if error.is_fatal() {
                                    fatal.store(true, Ordering::SeqCst);
                                    fatal_reason
                                        .lock()
                                        .expect("worker thread panicked")
                                        .get_or_insert_with(|| error.to_string());
                                }
                                AnnotationResult::failed(
                                    (*record).clone(),
                                    Failure::new(error.kind(), error.to_string()),
                                    attempts,
                                )
                                .with_prompts(Some(self.client.prompt_for(record)), None)
                            }
                            RetryOutcome::Interrupted {
                                last_error,
                                attempts,
                            } => {
                                let (kind, what) = if fatal.load(Ordering::SeqCst) {
                                    (FailureKind::Aborted, "run aborted")
                                } else {
                                    (FailureKind::Cancelled, "cancelled")
                                };
                                let mut skipped = AnnotationResult::skipped(
                                    (*record).clone(),
                                    kind,
                                    format!("{what} after {attempts} attempt(s): {last_error}"),
                                );
                                skipped.attempt_count = attempts;
                                skipped.with_prompts(Some(self.client.prompt_for(record)), None)
                            }
                        };
                        finished
                            .lock()
                            .expect("worker thread panicked")
                            .push((pos, result));
                    }
                });
            }
        });

        let halt = match fatal_reason.into_inner().expect("worker thread panicked") {
            Some(reason) => {
                log::error!("Fatal backend error, aborting run: {reason}");
                Some(Halt::Fatal(reason))
            }
            None => cancel.reason().map(|r| Halt::Cancelled(r.to_string())),
        };

        let mut finished = finished.into_inner().expect("worker thread panicked");
        if let Some(halt) = &halt {
            let reason = halt.skip_reason();
            for (pos, record) in queue.unclaimed() {
                finished.push((
                    pos,
                    AnnotationResult::skipped((*record).clone(), halt.skip_kind(), reason.clone()),
                ));
            }
        }
        finished.sort_by_key(|(pos, _)| *pos);
        debug_assert_eq!(finished.len(), batch.len());

        Ok((finished.into_iter().map(|(_, r)| r).collect(), halt))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn halt_skip_kinds() {
        assert_eq!(Halt::Fatal("401".into()).skip_kind(), FailureKind::Aborted);
        assert_eq!(Halt::Cancelled("timed out".into()).skip_kind(), FailureKind::Cancelled);
        assert!(Halt::Fatal("model missing".into()).skip_reason().contains("model missing"));
    }

    #[test]
    fn report_from_metadata() {
        let mut meta = RunMetadata::start(
            DatasetId::new("snli", "train.parquet", "train"),
            RunSettings::default().provenance("guide"),
        );
        meta.tally(AnnotationStatus::Success);
        meta.tally(AnnotationStatus::Skipped);
        meta.resumed_count = 4;
        meta.finish(RunOutcome::Completed);
        let report =
            RunReport::from_metadata(&meta, PathBuf::from("/tmp/x"), "abc".into(), Duration::ZERO);
        assert_eq!((report.total, report.success, report.skipped, report.resumed), (2, 1, 1, 4));
        report.log();
    }

    #[test]
    fn only_stopped_runs_carry_reports() {
        assert!(RunError::Batch(BatchError::InvalidBatchSize(0)).report().is_none());
    }
}
