use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::detect::select_stale;
use super::runner::{RunOutcome, RunReport, SyncRunner};
use crate::cli::SyncArgs;
use crate::config::{GatewayTarget, PrimaryConfig, SyncConfig};
use crate::embedding::{EmbeddingService, EmbeddingStrategy, OpenAiEmbedder};
use crate::gateway::{CatalogGateway, PostgrestGateway, SqliteGateway};
use crate::model::{RecordId, SyncRunManifest, SyncRunRecord};
use crate::util::{record_ids_digest, utc_compact_string, utc_string, write_json_pretty};

const EMBEDDING_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

pub struct SyncSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub generator: String,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub catalog_records: usize,
    pub work_set: Vec<RecordId>,
    pub skipped_empty: Vec<RecordId>,
    pub report: RunReport,
    pub sync_logged: bool,
}

impl SyncSummary {
    pub fn outcome(&self) -> RunOutcome {
        self.report.outcome
    }

    /// Runner failures plus stale records skipped for having no tags.
    pub fn failed_total(&self) -> usize {
        self.report.failed + self.skipped_empty.len()
    }
}

pub async fn run(args: SyncArgs, cancel: CancellationToken) -> Result<RunOutcome> {
    let config = SyncConfig::from_args(&args)?;
    let primary = PrimaryConfig::from_args(&args);

    match GatewayTarget::from_args(&args.gateway)? {
        GatewayTarget::Postgrest {
            base_url,
            api_key,
            timeout,
        } => {
            let gateway = PostgrestGateway::new(&base_url, &api_key, timeout)?;
            info!(gateway = %gateway.describe(), "Supabase gateway configured");
            run_with_gateway(&gateway, &config, primary, args.manifest_dir.as_deref(), cancel)
                .await
        }
        GatewayTarget::Sqlite { path } => {
            let gateway = SqliteGateway::open(&path)?;
            info!(gateway = %gateway.describe(), "SQLite gateway configured");
            run_with_gateway(&gateway, &config, primary, args.manifest_dir.as_deref(), cancel)
                .await
        }
    }
}

async fn run_with_gateway<G: CatalogGateway>(
    gateway: &G,
    config: &SyncConfig,
    primary: Option<PrimaryConfig>,
    manifest_dir: Option<&Path>,
    cancel: CancellationToken,
) -> Result<RunOutcome> {
    let embedder = match primary {
        Some(primary) => {
            let embedder = OpenAiEmbedder::new(
                &primary.api_key,
                &primary.base_url,
                primary.model,
                EMBEDDING_REQUEST_TIMEOUT,
                primary.max_retries,
            )?;
            info!(model = %embedder.model_name(), "OpenAI embedding service configured");
            Some(embedder)
        }
        None => None,
    };

    let strategy = resolve_strategy(embedder.as_ref(), config)?;
    let summary = execute_sync(gateway, strategy, config, cancel).await?;

    if let Some(manifest_dir) = manifest_dir {
        let manifest_path = manifest_dir.join(format!(
            "sync_run_{}.json",
            utc_compact_string(summary.finished_at)
        ));
        write_json_pretty(&manifest_path, &build_manifest(&summary, config))?;
        info!(path = %manifest_path.display(), "wrote sync run manifest");
    }

    Ok(summary.outcome())
}

/// Without a primary service the fallback must be allowed explicitly.
pub(super) fn resolve_strategy<'a, S: EmbeddingService>(
    embedder: Option<&'a S>,
    config: &SyncConfig,
) -> Result<EmbeddingStrategy<'a, S>> {
    match embedder {
        Some(service) => Ok(EmbeddingStrategy::Primary(service)),
        None if config.allow_fallback => {
            warn!("no OpenAI API key provided; using deterministic fallback embeddings");
            Ok(EmbeddingStrategy::Fallback)
        }
        None => bail!(
            "no OpenAI API key provided; pass --allow-fallback to use deterministic fallback embeddings"
        ),
    }
}

/// Detect, run, and record one sync pass against `gateway`.
pub async fn execute_sync<G, S>(
    gateway: &G,
    strategy: EmbeddingStrategy<'_, S>,
    config: &SyncConfig,
    cancel: CancellationToken,
) -> Result<SyncSummary>
where
    G: CatalogGateway,
    S: EmbeddingService,
{
    let started_at = Utc::now();
    let generator = strategy.label();

    let records = gateway
        .list_all_catalog_records()
        .await
        .with_context(|| format!("failed to list catalog records from {}", gateway.describe()))?;
    let catalog_records = records.len();
    info!(catalog_records, "loaded catalog records");

    let last_sync_at = if config.force_all {
        info!(catalog_records, "force mode: every tagged record will be updated");
        None
    } else {
        match gateway.get_last_sync_entry().await {
            Ok(Some(entry)) => {
                info!(last_sync_at = %utc_string(entry.created_at), "found previous sync run");
                Some(entry.created_at)
            }
            Ok(None) => {
                info!("no previous sync run found; every record is stale");
                None
            }
            Err(err) => {
                warn!(error = %err, "could not read sync log; treating every record as stale");
                None
            }
        }
    };

    let selection = select_stale(records, last_sync_at, config.force_all);
    for record in &selection.skipped_empty {
        warn!(
            record_id = %record.id,
            name = %record.display_name(),
            "record has no flavor tags; skipping"
        );
    }
    info!(
        work_set = selection.work_set.len(),
        skipped_empty = selection.skipped_empty.len(),
        "selected records needing embedding updates"
    );

    let runner = SyncRunner::new(gateway, strategy, config, cancel);
    let report = runner.run(&selection.work_set).await;

    let finished_at = Utc::now();
    let sync_logged =
        record_completed_run(gateway, config, &report, started_at, finished_at).await;

    let summary = SyncSummary {
        started_at,
        finished_at,
        generator,
        last_sync_at,
        catalog_records,
        work_set: selection
            .work_set
            .iter()
            .map(|record| record.id.clone())
            .collect(),
        skipped_empty: selection
            .skipped_empty
            .iter()
            .map(|record| record.id.clone())
            .collect(),
        report,
        sync_logged,
    };
    info!(
        status = summary.outcome().as_str(),
        updated = summary.report.updated,
        failed = summary.failed_total(),
        skipped_empty = summary.skipped_empty.len(),
        sync_logged = summary.sync_logged,
        "sync finished"
    );

    Ok(summary)
}

/// Appends to the sync log only after a clean, live, complete run; anything
/// else would let failed records look fresh on the next pass. Tagless records
/// are not part of the check: they stay stale until someone tags them.
async fn record_completed_run<G: CatalogGateway>(
    gateway: &G,
    config: &SyncConfig,
    report: &RunReport,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
) -> bool {
    if config.dry_run || report.outcome != RunOutcome::Completed {
        return false;
    }

    if report.failed > 0 {
        warn!(
            failed = report.failed,
            "not recording sync run; failed records will be retried next time"
        );
        return false;
    }

    let run = SyncRunRecord {
        started_at,
        finished_at,
        updated_count: report.updated,
        failed_count: report.failed,
    };
    match gateway.record_sync_run(&run).await {
        Ok(()) => true,
        Err(err) => {
            warn!(error = %err, "failed to record sync run");
            false
        }
    }
}

pub(super) fn build_manifest(summary: &SyncSummary, config: &SyncConfig) -> SyncRunManifest {
    let report = &summary.report;
    SyncRunManifest {
        manifest_version: 1,
        run_id: format!("sync-{}", utc_compact_string(summary.started_at)),
        started_at: utc_string(summary.started_at),
        finished_at: utc_string(summary.finished_at),
        generator: summary.generator.clone(),
        dry_run: config.dry_run,
        force_all: config.force_all,
        batch_size: config.batch_size,
        inter_record_delay_secs: config.inter_record_delay.as_secs_f64(),
        inter_batch_delay_secs: config.inter_batch_delay.as_secs_f64(),
        last_sync_at: summary.last_sync_at.map(utc_string),
        catalog_records: summary.catalog_records,
        work_set_size: summary.work_set.len(),
        work_set_digest: record_ids_digest(&summary.work_set),
        skipped_empty_tags: summary
            .skipped_empty
            .iter()
            .map(|id| id.to_string())
            .collect(),
        updated_count: report.updated,
        failed_count: summary.failed_total(),
        failed_records: report
            .failed_records
            .iter()
            .map(|id| id.to_string())
            .collect(),
        duration_ms: report.elapsed.as_millis(),
        status: report.outcome.as_str().to_string(),
        sync_logged: summary.sync_logged,
        batches: report.batches.clone(),
    }
}
