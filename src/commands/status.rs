use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::cli::StatusArgs;
use crate::commands::sync::select_stale;
use crate::config::GatewayTarget;
use crate::gateway::{CatalogGateway, PostgrestGateway, SqliteGateway};
use crate::model::CatalogRecord;
use crate::util::utc_string;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogStatus {
    pub total: usize,
    pub with_embedding: usize,
    pub without_tags: usize,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub would_sync: usize,
}

pub async fn run(args: StatusArgs) -> Result<()> {
    let status = match GatewayTarget::from_args(&args.gateway)? {
        GatewayTarget::Postgrest {
            base_url,
            api_key,
            timeout,
        } => collect(&PostgrestGateway::new(&base_url, &api_key, timeout)?).await?,
        GatewayTarget::Sqlite { path } => collect(&SqliteGateway::open(&path)?).await?,
    };

    info!(
        total = status.total,
        with_embedding = status.with_embedding,
        missing_embedding = status.total - status.with_embedding,
        without_tags = status.without_tags,
        last_sync_at = %status.last_sync_at.map(utc_string).unwrap_or_else(|| "never".to_string()),
        would_sync = status.would_sync,
        "catalog status"
    );

    Ok(())
}

pub async fn collect<G: CatalogGateway>(gateway: &G) -> Result<CatalogStatus> {
    info!(gateway = %gateway.describe(), "status requested");

    let records = gateway
        .list_all_catalog_records()
        .await
        .with_context(|| format!("failed to list catalog records from {}", gateway.describe()))?;

    let last_sync_at = match gateway.get_last_sync_entry().await {
        Ok(entry) => entry.map(|entry| entry.created_at),
        Err(err) => {
            warn!(error = %err, "could not read sync log");
            None
        }
    };

    Ok(summarize(records, last_sync_at))
}

fn summarize(records: Vec<CatalogRecord>, last_sync_at: Option<DateTime<Utc>>) -> CatalogStatus {
    let total = records.len();
    let with_embedding = records.iter().filter(|record| record.has_embedding()).count();
    let without_tags = records.iter().filter(|record| !record.has_tags()).count();
    let would_sync = select_stale(records, last_sync_at, false).work_set.len();

    CatalogStatus {
        total,
        with_embedding,
        without_tags,
        last_sync_at,
        would_sync,
    }
}
