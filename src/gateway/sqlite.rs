use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OpenFlags, OptionalExtension, params};
use tracing::warn;

use super::CatalogGateway;
use crate::embedding::{EMBEDDING_DIM, decode_vector};
use crate::error::GatewayError;
use crate::model::{
    CatalogRecord, RecordId, SyncLogEntry, SyncRunRecord, parse_catalog_timestamp,
};
use crate::util::utc_string;

/// Local catalog stored in a SQLite file, mirroring the hosted tables.
pub struct SqliteGateway {
    connection: Connection,
    path: String,
}

impl SqliteGateway {
    pub fn open(db_path: &Path) -> Result<Self> {
        let connection = Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("failed to open catalog database: {}", db_path.display()))?;

        Self::from_connection(connection, db_path)
    }

    #[cfg(test)]
    pub fn create(db_path: &Path) -> Result<Self> {
        let connection = Connection::open(db_path)
            .with_context(|| format!("failed to create catalog database: {}", db_path.display()))?;
        Self::from_connection(connection, db_path)
    }

    fn from_connection(connection: Connection, db_path: &Path) -> Result<Self> {
        configure_connection(&connection)?;
        ensure_schema(&connection)?;
        Ok(Self {
            connection,
            path: db_path.display().to_string(),
        })
    }

    #[cfg(test)]
    pub fn insert_record(
        &self,
        id: &str,
        name: &str,
        tags: &[&str],
        updated_at: Option<DateTime<Utc>>,
        embedding: Option<&str>,
    ) -> Result<()> {
        self.connection.execute(
            "
            INSERT INTO coffees(id, name, flavor_tags, created_at, updated_at, flavor_embedding)
            VALUES(?1, ?2, ?3, ?4, ?5, ?6)
            ",
            params![
                id,
                name,
                serde_json::to_string(tags)?,
                utc_string(Utc::now()),
                updated_at.map(utc_string),
                embedding,
            ],
        )?;
        Ok(())
    }

    #[cfg(test)]
    pub fn stored_embedding(&self, id: &str) -> Result<Option<String>> {
        let value = self.connection.query_row(
            "SELECT flavor_embedding FROM coffees WHERE id = ?1",
            [id],
            |row| row.get::<_, Option<String>>(0),
        )?;
        Ok(value)
    }
}

impl CatalogGateway for SqliteGateway {
    async fn list_all_catalog_records(&self) -> Result<Vec<CatalogRecord>, GatewayError> {
        let mut statement = self.connection.prepare(
            "
            SELECT id, COALESCE(name, ''), flavor_tags, created_at, updated_at, flavor_embedding
            FROM coffees
            ORDER BY id ASC
            ",
        )?;

        let mut rows = statement.query([])?;
        let mut out = Vec::<CatalogRecord>::new();
        while let Some(row) = rows.next()? {
            let id: String = row.get(0)?;
            let tags_json: Option<String> = row.get(2)?;
            let created_at: Option<String> = row.get(3)?;
            let updated_at: Option<String> = row.get(4)?;
            let embedding: Option<String> = row.get(5)?;

            out.push(CatalogRecord {
                flavor_tags: parse_tags(&id, tags_json.as_deref())?,
                created_at: parse_timestamp(&id, created_at.as_deref()),
                updated_at: parse_timestamp(&id, updated_at.as_deref()),
                flavor_embedding: parse_embedding(&id, embedding.as_deref()),
                name: row.get(1)?,
                id: RecordId::new(id),
            });
        }

        Ok(out)
    }

    async fn get_last_sync_entry(&self) -> Result<Option<SyncLogEntry>, GatewayError> {
        let raw = self
            .connection
            .query_row(
                "
                SELECT created_at
                FROM update_logs
                ORDER BY created_at DESC, log_id DESC
                LIMIT 1
                ",
                [],
                |row| row.get::<_, String>(0),
            )
            .optional()?;

        match raw {
            Some(raw) => {
                let created_at = parse_catalog_timestamp(&raw).ok_or_else(|| {
                    GatewayError::Malformed(format!("unreadable sync log timestamp: {raw}"))
                })?;
                Ok(Some(SyncLogEntry { created_at }))
            }
            None => Ok(None),
        }
    }

    async fn update_embedding(
        &self,
        record_id: &RecordId,
        encoded_vector: &str,
    ) -> Result<bool, GatewayError> {
        match decode_vector(encoded_vector) {
            Ok(values) if values.len() == EMBEDDING_DIM => {}
            Ok(values) => {
                warn!(record_id = %record_id, dims = values.len(), "refusing embedding with wrong dimensions");
                return Ok(false);
            }
            Err(err) => {
                warn!(record_id = %record_id, error = %err, "refusing unreadable embedding literal");
                return Ok(false);
            }
        }

        let changed = self.connection.execute(
            "UPDATE coffees SET flavor_embedding = ?2 WHERE id = ?1",
            params![record_id.as_str(), encoded_vector],
        )?;
        Ok(changed == 1)
    }

    async fn record_sync_run(&self, run: &SyncRunRecord) -> Result<(), GatewayError> {
        self.connection.execute(
            "
            INSERT INTO update_logs(created_at, finished_at, updated_count, failed_count)
            VALUES(?1, ?2, ?3, ?4)
            ",
            params![
                utc_string(run.started_at),
                utc_string(run.finished_at),
                run.updated_count as i64,
                run.failed_count as i64,
            ],
        )?;
        Ok(())
    }

    fn describe(&self) -> String {
        self.path.clone()
    }
}

fn configure_connection(connection: &Connection) -> Result<()> {
    connection
        .pragma_update(None, "journal_mode", "WAL")
        .context("failed to set journal_mode=WAL")?;
    connection
        .pragma_update(None, "synchronous", "NORMAL")
        .context("failed to set synchronous=NORMAL")?;
    Ok(())
}

fn ensure_schema(connection: &Connection) -> Result<()> {
    connection
        .execute_batch(
            "
            CREATE TABLE IF NOT EXISTS coffees (
              id TEXT PRIMARY KEY,
              name TEXT,
              flavor_tags TEXT NOT NULL DEFAULT '[]',
              created_at TEXT,
              updated_at TEXT,
              flavor_embedding TEXT
            );

            CREATE TABLE IF NOT EXISTS update_logs (
              log_id INTEGER PRIMARY KEY AUTOINCREMENT,
              created_at TEXT NOT NULL,
              finished_at TEXT,
              updated_count INTEGER NOT NULL DEFAULT 0,
              failed_count INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_update_logs_created_at ON update_logs(created_at);
            ",
        )
        .context("failed to ensure catalog schema")
}

fn parse_tags(id: &str, raw: Option<&str>) -> Result<Vec<String>, GatewayError> {
    let Some(raw) = raw else {
        return Ok(Vec::new());
    };

    let tags: Vec<String> = serde_json::from_str(raw)
        .map_err(|err| GatewayError::Malformed(format!("flavor_tags of {id}: {err}")))?;
    Ok(tags
        .into_iter()
        .map(|tag| tag.trim().to_string())
        .filter(|tag| !tag.is_empty())
        .collect())
}

fn parse_timestamp(id: &str, raw: Option<&str>) -> Option<DateTime<Utc>> {
    let raw = raw.map(str::trim).filter(|value| !value.is_empty())?;
    let parsed = parse_catalog_timestamp(raw);
    if parsed.is_none() {
        warn!(record_id = %id, value = %raw, "unreadable catalog timestamp; ignoring it");
    }
    parsed
}

fn parse_embedding(id: &str, raw: Option<&str>) -> Option<Vec<f32>> {
    let raw = raw?;
    match decode_vector(raw) {
        Ok(values) => Some(values),
        Err(err) => {
            warn!(record_id = %id, error = %err, "unreadable stored embedding; treating as missing");
            None
        }
    }
}
