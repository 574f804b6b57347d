//! The merge pipeline for one import: deduplicate the staged rows, run every row through
//! normalization, address resolution and classification, write batches, then deactivate the
//! customers that did not appear.
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use merge_common::address::{AddressQuery, AddressResolver};
use merge_common::classify::{classify, ErrorReport};
use merge_common::model::{NormalizedCustomer, StagingRow};
use merge_common::normalize::normalize_row;
use merge_common::runs::{ImportRun, RunCounts, RunStore};
use merge_common::staging::{dedup_rows, StagingSource};
use merge_common::writer::CustomerWriter;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{MergeError, MergeStage};

pub const DEFAULT_BATCH_SIZE: usize = 200;

/// Outcome of a successful merge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeSummary {
    pub import_id: i64,
    /// Rows left after deduplication.
    pub staged: u64,
    pub inserted: u64,
    pub updated: u64,
    pub deactivated: u64,
    /// Rows that could not be normalized, or older rows of a customer already merged in this run.
    pub skipped: u64,
    pub with_errors: u64,
}

/// Cross-row state of one merge: customers seen so far and the batch being built.
#[derive(Debug, Default)]
struct MergeState {
    seen: HashSet<String>,
    batch: Vec<NormalizedCustomer>,
    reports: Vec<ErrorReport>,
    counts: RunCounts,
    staged: u64,
    skipped: u64,
}

impl MergeState {
    fn new(staged: usize) -> Self {
        MergeState {
            staged: staged as u64,
            ..Default::default()
        }
    }

    fn push(&mut self, customer: NormalizedCustomer, report: ErrorReport) {
        if self.seen.insert(customer.customer_number.clone()) && report.has_errors() {
            self.counts.with_errors += 1;
        }
        self.batch.push(customer);
        self.reports.push(report);
    }

    fn failed(&self, stage: MergeStage, source: merge_common::error::DatabaseError) -> MergeError {
        MergeError::Stage {
            stage,
            counts: self.counts,
            source,
        }
    }

    fn summary(&self, import_id: i64) -> MergeSummary {
        MergeSummary {
            import_id,
            staged: self.staged,
            inserted: self.counts.inserted,
            updated: self.counts.updated,
            deactivated: self.counts.deactivated,
            skipped: self.skipped,
            with_errors: self.counts.with_errors,
        }
    }
}

impl MergeSummary {
    pub fn counts(&self) -> RunCounts {
        RunCounts {
            inserted: self.inserted,
            updated: self.updated,
            deactivated: self.deactivated,
            with_errors: self.with_errors,
        }
    }
}

pub struct Merger {
    staging: Arc<dyn StagingSource + Send + Sync>,
    resolver: AddressResolver,
    writer: Arc<dyn CustomerWriter + Send + Sync>,
    runs: Arc<dyn RunStore + Send + Sync>,
    batch_size: usize,
}

impl Merger {
    pub fn new(
        staging: Arc<dyn StagingSource + Send + Sync>,
        resolver: AddressResolver,
        writer: Arc<dyn CustomerWriter + Send + Sync>,
        runs: Arc<dyn RunStore + Send + Sync>,
        batch_size: usize,
    ) -> Self {
        Self {
            staging,
            resolver,
            writer,
            runs,
            batch_size: batch_size.max(1),
        }
    }

    /// Claim `import_id` and merge it. Fails without touching the registry when the import is
    /// unknown, already merged or being merged elsewhere.
    pub async fn merge(&self, import_id: i64) -> Result<MergeSummary, MergeError> {
        let run = self.runs.claim(import_id).await?;
        self.merge_claimed(&run).await
    }

    /// Merge an import this worker has already claimed, and record the outcome on the run.
    #[instrument(skip_all, fields(import_id = run.import_id))]
    pub async fn merge_claimed(&self, run: &ImportRun) -> Result<MergeSummary, MergeError> {
        let import_id = run.import_id;
        info!("starting merge of {} staged rows", run.staged_rows);

        let result = match self.run_pipeline(import_id).await {
            Ok(summary) => self
                .runs
                .complete(import_id, &summary.counts())
                .await
                .map(|_| summary)
                .map_err(MergeError::from),
            Err(error) => Err(error),
        };

        match &result {
            Ok(summary) => {
                metrics::counter!("merge_runs_total", "outcome" => "merged").increment(1);
                info!(
                    inserted = summary.inserted,
                    updated = summary.updated,
                    deactivated = summary.deactivated,
                    skipped = summary.skipped,
                    with_errors = summary.with_errors,
                    "merge completed"
                );
            }
            Err(error) => {
                metrics::counter!("merge_runs_total", "outcome" => "failed").increment(1);
                error!("merge failed: {}", error);
                self.record_failure(import_id, error).await;
            }
        }

        result
    }

    async fn record_failure(&self, import_id: i64, error: &MergeError) {
        let Some(stage) = error.failed_stage() else {
            return;
        };

        if let Err(fail_error) = self
            .runs
            .fail(import_id, stage.as_str(), &error.to_string(), &error.counts())
            .await
        {
            error!("failed to record merge failure: {}", fail_error);
        }
    }

    async fn run_pipeline(&self, import_id: i64) -> Result<MergeSummary, MergeError> {
        let rows = self
            .staging
            .load(import_id)
            .await
            .map_err(|source| MergeError::Stage {
                stage: MergeStage::LoadStaging,
                counts: RunCounts::default(),
                source,
            })?;
        let loaded = rows.len();

        // Latest first, so the newest row of a customer number is the one merged.
        let rows = dedup_rows(rows);
        if rows.is_empty() {
            return Err(MergeError::EmptyImport(import_id));
        }
        debug!(loaded, deduplicated = rows.len(), "selected staging rows");

        let mut state = MergeState::new(rows.len());
        for row in &rows {
            self.process_row(&mut state, row).await;
            if state.batch.len() >= self.batch_size {
                self.flush(&mut state).await?;
            }
        }
        self.flush(&mut state).await?;
        self.deactivate(&mut state).await?;

        Ok(state.summary(import_id))
    }

    /// Normalize, resolve and classify one row, and queue it for writing.
    async fn process_row(&self, state: &mut MergeState, row: &StagingRow) {
        let mut customer = match normalize_row(row) {
            Ok(customer) => customer,
            Err(error) => {
                warn!(row_id = row.id, "skipping staging row: {}", error);
                metrics::counter!("merge_rows_skipped_total").increment(1);
                state.skipped += 1;
                return;
            }
        };

        if state.seen.contains(&customer.customer_number) {
            debug!(
                row_id = row.id,
                customer_number = %customer.customer_number,
                "skipping older row of a customer already merged in this run"
            );
            state.skipped += 1;
            return;
        }

        let resolution = self
            .resolver
            .resolve(&AddressQuery::from_customer(&customer))
            .await;
        resolution.apply_to(&mut customer);

        let report = classify(&customer, row.street.as_deref());
        customer.has_errors = report.has_errors();
        customer.error_reason = report.summary();

        state.push(customer, report);
    }

    async fn flush(&self, state: &mut MergeState) -> Result<(), MergeError> {
        if state.batch.is_empty() {
            return Ok(());
        }
        let started = Instant::now();
        let batch = std::mem::take(&mut state.batch);
        let reports = std::mem::take(&mut state.reports);

        let counts = self
            .writer
            .upsert_customers(&batch)
            .await
            .map_err(|source| state.failed(MergeStage::WriteCustomers, source))?;
        state.counts.inserted += counts.inserted;
        state.counts.updated += counts.updated;

        self.writer
            .upsert_error_reports(&reports)
            .await
            .map_err(|source| state.failed(MergeStage::WriteErrorReports, source))?;

        metrics::counter!("merge_rows_total").increment(batch.len() as u64);
        metrics::histogram!("merge_batch_duration_seconds").record(started.elapsed().as_secs_f64());
        debug!(
            rows = batch.len(),
            inserted = counts.inserted,
            updated = counts.updated,
            "flushed batch"
        );

        Ok(())
    }

    async fn deactivate(&self, state: &mut MergeState) -> Result<(), MergeError> {
        if state.seen.is_empty() {
            warn!("no customers seen, skipping deactivation");
            return Ok(());
        }

        let deactivated = self
            .writer
            .deactivate_unseen(&state.seen)
            .await
            .map_err(|source| state.failed(MergeStage::Deactivate, source))?;
        state.counts.deactivated = deactivated;

        Ok(())
    }
}
