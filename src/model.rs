use std::fmt;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use tracing::warn;

use crate::embedding::decode_vector;

/// Opaque catalog identifier. Gateways may hand it out as a number or a string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for RecordId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        match serde_json::Value::deserialize(deserializer)? {
            serde_json::Value::String(value) => Ok(Self(value)),
            serde_json::Value::Number(value) => Ok(Self(value.to_string())),
            other => Err(serde::de::Error::custom(format!(
                "unsupported record id: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CatalogRecord {
    pub id: RecordId,
    #[serde(default, alias = "coffee_name")]
    pub name: String,
    #[serde(default, deserialize_with = "deserialize_tags")]
    pub flavor_tags: Vec<String>,
    #[serde(default, deserialize_with = "deserialize_timestamp")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "deserialize_timestamp")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "deserialize_embedding")]
    pub flavor_embedding: Option<Vec<f32>>,
}

impl CatalogRecord {
    pub fn last_changed_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at.or(self.created_at)
    }

    pub fn has_embedding(&self) -> bool {
        self.flavor_embedding
            .as_ref()
            .is_some_and(|values| !values.is_empty())
    }

    pub fn has_tags(&self) -> bool {
        !self.flavor_tags.is_empty()
    }

    pub fn display_name(&self) -> &str {
        if self.name.trim().is_empty() {
            "Unknown"
        } else {
            &self.name
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct SyncLogEntry {
    #[serde(deserialize_with = "deserialize_required_timestamp")]
    pub created_at: DateTime<Utc>,
}

/// Appended to the sync log once a run finishes cleanly. The log timestamp is
/// the run's start, so edits made while it ran stay stale for the next pass.
#[derive(Debug, Clone, Serialize)]
pub struct SyncRunRecord {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub updated_count: usize,
    pub failed_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchProgress {
    pub batch_number: usize,
    pub total_batches: usize,
    pub batch_size: usize,
    pub processed: usize,
    pub total: usize,
    pub percent_complete: f64,
    pub elapsed_secs: f64,
    pub records_per_sec: f64,
    pub updated: usize,
    pub failed: usize,
}

#[derive(Debug, Serialize)]
pub struct SyncRunManifest {
    pub manifest_version: u32,
    pub run_id: String,
    pub started_at: String,
    pub finished_at: String,
    pub generator: String,
    pub dry_run: bool,
    pub force_all: bool,
    pub batch_size: usize,
    pub inter_record_delay_secs: f64,
    pub inter_batch_delay_secs: f64,
    pub last_sync_at: Option<String>,
    pub catalog_records: usize,
    pub work_set_size: usize,
    pub work_set_digest: String,
    pub skipped_empty_tags: Vec<String>,
    pub updated_count: usize,
    /// Includes `skipped_empty_tags`.
    pub failed_count: usize,
    pub failed_records: Vec<String>,
    pub duration_ms: u128,
    pub status: String,
    pub sync_logged: bool,
    pub batches: Vec<BatchProgress>,
}

const NAIVE_TIMESTAMP_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

/// RFC 3339, or a naive `timestamp without time zone` value read as UTC.
pub fn parse_catalog_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }

    NAIVE_TIMESTAMP_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .map(|naive| naive.and_utc())
}

/// An unreadable timestamp is dropped with a warning; staleness then falls
/// back to whether the record has an embedding.
fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let Some(raw) = Option::<String>::deserialize(deserializer)? else {
        return Ok(None);
    };
    if raw.trim().is_empty() {
        return Ok(None);
    }

    let parsed = parse_catalog_timestamp(&raw);
    if parsed.is_none() {
        warn!(value = %raw, "unreadable catalog timestamp; ignoring it");
    }
    Ok(parsed)
}

fn deserialize_required_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_catalog_timestamp(&raw)
        .ok_or_else(|| serde::de::Error::custom(format!("unreadable timestamp: {raw}")))
}

fn deserialize_tags<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let tags = Option::<Vec<String>>::deserialize(deserializer)?.unwrap_or_default();
    Ok(tags
        .into_iter()
        .map(|tag| tag.trim().to_string())
        .filter(|tag| !tag.is_empty())
        .collect())
}

/// pgvector columns come back from PostgREST as text literals; SQLite rows and
/// hand-written fixtures may use plain arrays.
fn deserialize_embedding<'de, D>(deserializer: D) -> Result<Option<Vec<f32>>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawEmbedding {
        Literal(String),
        Values(Vec<f32>),
    }

    match Option::<RawEmbedding>::deserialize(deserializer)? {
        None => Ok(None),
        Some(RawEmbedding::Values(values)) => Ok(Some(values)),
        Some(RawEmbedding::Literal(literal)) => match decode_vector(&literal) {
            Ok(values) => Ok(Some(values)),
            Err(err) => {
                warn!(error = %err, "unreadable stored embedding; treating as missing");
                Ok(None)
            }
        },
    }
}
