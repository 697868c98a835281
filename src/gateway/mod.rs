//! Read/write access to the coffee catalog and its sync log.

mod postgrest;
mod sqlite;

use std::future::Future;

use crate::error::GatewayError;
use crate::model::{CatalogRecord, RecordId, SyncLogEntry, SyncRunRecord};

pub use postgrest::PostgrestGateway;
pub use sqlite::SqliteGateway;

pub trait CatalogGateway {
    fn list_all_catalog_records(
        &self,
    ) -> impl Future<Output = Result<Vec<CatalogRecord>, GatewayError>>;

    /// Most recent completed sync run, if any.
    fn get_last_sync_entry(
        &self,
    ) -> impl Future<Output = Result<Option<SyncLogEntry>, GatewayError>>;

    /// Overwrites one record's embedding with an encoded vector literal.
    /// `Ok(false)` means the store refused the update.
    fn update_embedding(
        &self,
        record_id: &RecordId,
        encoded_vector: &str,
    ) -> impl Future<Output = Result<bool, GatewayError>>;

    fn record_sync_run(
        &self,
        run: &SyncRunRecord,
    ) -> impl Future<Output = Result<(), GatewayError>>;

    fn describe(&self) -> String;
}
