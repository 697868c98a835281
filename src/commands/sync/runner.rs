use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::pacing::Pacing;
use crate::config::SyncConfig;
use crate::embedding::{
    EmbeddingService, EmbeddingStrategy, EmbeddingVector, generate_fallback, generate_primary,
};
use crate::error::RecordError;
use crate::gateway::CatalogGateway;
use crate::model::{BatchProgress, CatalogRecord, RecordId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Cancelled,
}

impl RunOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug)]
pub struct RunReport {
    pub updated: usize,
    pub failed: usize,
    pub failed_records: Vec<RecordId>,
    pub elapsed: Duration,
    pub batches: Vec<BatchProgress>,
    pub outcome: RunOutcome,
}

/// Why a record did not finish.
enum Halt {
    Failed(RecordError),
    Cancelled,
}

impl From<RecordError> for Halt {
    fn from(err: RecordError) -> Self {
        Self::Failed(err)
    }
}

/// Drives one sequential pass over a work set: generate, encode, persist.
pub struct SyncRunner<'a, G, S> {
    gateway: &'a G,
    strategy: EmbeddingStrategy<'a, S>,
    config: &'a SyncConfig,
    pacing: Pacing,
    cancel: CancellationToken,
}

impl<'a, G, S> SyncRunner<'a, G, S>
where
    G: CatalogGateway,
    S: EmbeddingService,
{
    pub fn new(
        gateway: &'a G,
        strategy: EmbeddingStrategy<'a, S>,
        config: &'a SyncConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            gateway,
            strategy,
            config,
            pacing: Pacing::from_config(config),
            cancel,
        }
    }

    pub async fn run(&self, work_set: &[CatalogRecord]) -> RunReport {
        let started = Instant::now();
        let batch_size = self.config.batch_size.max(1);
        let total = work_set.len();
        let total_batches = total.div_ceil(batch_size);

        let mut report = RunReport {
            updated: 0,
            failed: 0,
            failed_records: Vec::new(),
            elapsed: Duration::ZERO,
            batches: Vec::with_capacity(total_batches),
            outcome: RunOutcome::Completed,
        };

        info!(
            total,
            batch_size,
            generator = %self.strategy.label(),
            dry_run = self.config.dry_run,
            "starting embedding sync"
        );

        let mut processed = 0usize;
        'batches: for (batch_index, batch) in work_set.chunks(batch_size).enumerate() {
            info!(
                batch = batch_index + 1,
                total_batches,
                records = batch.len(),
                "processing batch"
            );

            for (position, record) in batch.iter().enumerate() {
                match self.sync_record(record).await {
                    Ok(()) => report.updated += 1,
                    Err(Halt::Failed(err)) => {
                        warn!(
                            record_id = %record.id,
                            name = %record.display_name(),
                            error = %err,
                            "embedding update failed"
                        );
                        report.failed += 1;
                        report.failed_records.push(record.id.clone());
                    }
                    Err(Halt::Cancelled) => {
                        report.outcome = RunOutcome::Cancelled;
                        break 'batches;
                    }
                }
                processed += 1;

                if let Some(delay) = self.pacing.after_record(position, batch.len()) {
                    if let Err(Halt::Cancelled) = self.pause(delay).await {
                        report.outcome = RunOutcome::Cancelled;
                        break 'batches;
                    }
                }
            }

            let progress = batch_progress(
                batch_index,
                total_batches,
                batch.len(),
                processed,
                total,
                started.elapsed(),
                &report,
            );
            info!(
                batch = progress.batch_number,
                total_batches,
                progress_pct = %format!("{:.1}", progress.percent_complete),
                processed,
                total,
                rate_per_sec = %format!("{:.2}", progress.records_per_sec),
                elapsed_secs = %format!("{:.1}", progress.elapsed_secs),
                updated = report.updated,
                failed = report.failed,
                "batch finished"
            );
            report.batches.push(progress);

            if let Some(delay) = self.pacing.after_batch(batch_index, total_batches) {
                info!(delay_secs = delay.as_secs_f64(), "waiting before next batch");
                if let Err(Halt::Cancelled) = self.pause(delay).await {
                    report.outcome = RunOutcome::Cancelled;
                    break;
                }
            }
        }

        report.elapsed = started.elapsed();
        match report.outcome {
            RunOutcome::Completed => info!(
                updated = report.updated,
                failed = report.failed,
                elapsed_secs = %format!("{:.2}", report.elapsed.as_secs_f64()),
                "embedding sync complete"
            ),
            RunOutcome::Cancelled => warn!(
                updated = report.updated,
                failed = report.failed,
                remaining = total.saturating_sub(processed),
                "embedding sync cancelled"
            ),
        }

        report
    }

    async fn sync_record(&self, record: &CatalogRecord) -> Result<(), Halt> {
        if !record.has_tags() {
            return Err(RecordError::EmptyTags.into());
        }

        info!(
            record_id = %record.id,
            name = %record.display_name(),
            tags = %record.flavor_tags.join(", "),
            "processing record"
        );

        let embedding = match &self.strategy {
            EmbeddingStrategy::Primary(service) => {
                self.guarded("embedding request", generate_primary(*service, &record.flavor_tags))
                    .await?
            }
            EmbeddingStrategy::Fallback => generate_fallback(&record.flavor_tags),
        };
        debug!(record_id = %record.id, dims = embedding.len(), "generated embedding");

        if self.config.dry_run {
            info!(
                record_id = %record.id,
                dims = embedding.len(),
                "dry run: would update embedding"
            );
            return Ok(());
        }

        self.persist(&record.id, &embedding).await
    }

    async fn persist(&self, record_id: &RecordId, embedding: &EmbeddingVector) -> Result<(), Halt> {
        let encoded = embedding.encode();
        let accepted = self
            .guarded("embedding update", async {
                self.gateway
                    .update_embedding(record_id, &encoded)
                    .await
                    .map_err(RecordError::from)
            })
            .await?;

        if !accepted {
            return Err(RecordError::Rejected.into());
        }

        info!(record_id = %record_id, "updated embedding");
        Ok(())
    }

    /// Races an external call against cancellation and the optional per-call timeout.
    async fn guarded<T, F>(&self, stage: &'static str, call: F) -> Result<T, Halt>
    where
        F: Future<Output = Result<T, RecordError>>,
    {
        let timed = async {
            match self.config.call_timeout {
                Some(after) => match tokio::time::timeout(after, call).await {
                    Ok(result) => result,
                    Err(_) => Err(RecordError::Timeout { stage, after }),
                },
                None => call.await,
            }
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Halt::Cancelled),
            result = timed => result.map_err(Halt::from),
        }
    }

    async fn pause(&self, delay: Duration) -> Result<(), Halt> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Halt::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }
}

fn batch_progress(
    batch_index: usize,
    total_batches: usize,
    batch_size: usize,
    processed: usize,
    total: usize,
    elapsed: Duration,
    report: &RunReport,
) -> BatchProgress {
    let elapsed_secs = elapsed.as_secs_f64();
    let percent_complete = if total == 0 {
        100.0
    } else {
        processed as f64 / total as f64 * 100.0
    };
    let records_per_sec = if elapsed_secs > 0.0 {
        processed as f64 / elapsed_secs
    } else {
        0.0
    };

    BatchProgress {
        batch_number: batch_index + 1,
        total_batches,
        batch_size,
        processed,
        total,
        percent_complete,
        elapsed_secs,
        records_per_sec,
        updated: report.updated,
        failed: report.failed,
    }
}
