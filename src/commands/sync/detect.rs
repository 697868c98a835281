use chrono::{DateTime, Utc};

use crate::model::CatalogRecord;

#[derive(Debug, Default)]
pub struct Selection {
    pub work_set: Vec<CatalogRecord>,
    /// Stale records that have nothing to embed. Reported, never processed.
    pub skipped_empty: Vec<CatalogRecord>,
}

/// Picks the records whose embedding must be regenerated, keeping input order.
///
/// Without a previous run every record is stale. Otherwise a record is stale
/// when it changed strictly after `last_sync_time` or has no embedding yet.
pub fn select_stale(
    records: Vec<CatalogRecord>,
    last_sync_time: Option<DateTime<Utc>>,
    force_all: bool,
) -> Selection {
    let mut selection = Selection::default();

    for record in records {
        if !force_all && !is_stale(&record, last_sync_time) {
            continue;
        }

        if record.has_tags() {
            selection.work_set.push(record);
        } else {
            selection.skipped_empty.push(record);
        }
    }

    selection
}

pub fn is_stale(record: &CatalogRecord, last_sync_time: Option<DateTime<Utc>>) -> bool {
    let Some(last_sync_time) = last_sync_time else {
        return true;
    };

    let changed_since = record
        .last_changed_at()
        .is_some_and(|changed| changed > last_sync_time);

    changed_since || !record.has_embedding()
}
