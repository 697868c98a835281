use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use reqwest::{Client, Response};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use super::CatalogGateway;
use crate::error::GatewayError;
use crate::model::{CatalogRecord, RecordId, SyncLogEntry, SyncRunRecord};
use crate::util::utc_string;

const CATALOG_TABLE: &str = "coffees";
const SYNC_LOG_TABLE: &str = "update_logs";
const UPDATE_RPC: &str = "update_coffee_flavor_vector";
const PAGE_SIZE: usize = 1000;

/// Supabase REST backend.
pub struct PostgrestGateway {
    client: Client,
    rest_url: String,
}

impl PostgrestGateway {
    pub fn new(base_url: &str, api_key: &SecretString, timeout: Duration) -> Result<Self> {
        let api_key = api_key.expose_secret().trim();
        anyhow::ensure!(!api_key.is_empty(), "missing Supabase API key");

        let mut headers = HeaderMap::new();
        let mut key_header = HeaderValue::from_str(api_key).context("invalid Supabase API key")?;
        key_header.set_sensitive(true);
        let mut auth = HeaderValue::from_str(&format!("Bearer {api_key}"))
            .context("invalid Supabase API key")?;
        auth.set_sensitive(true);
        headers.insert("apikey", key_header);
        headers.insert(AUTHORIZATION, auth);

        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .context("failed to build Supabase HTTP client")?;

        Ok(Self {
            client,
            rest_url: rest_url(base_url),
        })
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, GatewayError> {
        let url = format!("{}/{path}", self.rest_url);
        let response = self.client.get(&url).query(query).send().await?;
        Ok(check_status(response).await?.json().await?)
    }

    async fn post_json<B: Serialize>(&self, path: &str, body: &B) -> Result<Response, GatewayError> {
        let url = format!("{}/{path}", self.rest_url);
        let response = self.client.post(&url).json(body).send().await?;
        check_status(response).await
    }
}

impl CatalogGateway for PostgrestGateway {
    async fn list_all_catalog_records(&self) -> Result<Vec<CatalogRecord>, GatewayError> {
        let mut records = Vec::<CatalogRecord>::new();
        let mut offset = 0usize;

        loop {
            let page: Vec<CatalogRecord> = self
                .get_json(CATALOG_TABLE, &catalog_page_query(offset))
                .await?;
            let fetched = page.len();
            records.extend(page);
            debug!(offset, fetched, "fetched catalog page");

            if fetched < PAGE_SIZE {
                break;
            }
            offset += fetched;
        }

        Ok(records)
    }

    async fn get_last_sync_entry(&self) -> Result<Option<SyncLogEntry>, GatewayError> {
        let query = [
            ("select", "created_at".to_string()),
            ("order", "created_at.desc".to_string()),
            ("limit", "1".to_string()),
        ];
        let rows: Vec<SyncLogEntry> = self.get_json(SYNC_LOG_TABLE, &query).await?;
        Ok(rows.into_iter().next())
    }

    async fn update_embedding(
        &self,
        record_id: &RecordId,
        encoded_vector: &str,
    ) -> Result<bool, GatewayError> {
        let body = UpdateEmbeddingArgs {
            p_coffee_id: record_id.as_str(),
            p_embedding: encoded_vector,
        };
        let response = self.post_json(&format!("rpc/{UPDATE_RPC}"), &body).await?;
        let result: serde_json::Value = response.json().await?;
        Ok(rpc_succeeded(&result))
    }

    async fn record_sync_run(&self, run: &SyncRunRecord) -> Result<(), GatewayError> {
        // Only created_at is assumed to exist on the hosted log table.
        let body = serde_json::json!({ "created_at": utc_string(run.started_at) });
        self.post_json(SYNC_LOG_TABLE, &body).await?;
        Ok(())
    }

    fn describe(&self) -> String {
        self.rest_url.clone()
    }
}

#[derive(Serialize)]
struct UpdateEmbeddingArgs<'a> {
    p_coffee_id: &'a str,
    p_embedding: &'a str,
}

fn rest_url(base_url: &str) -> String {
    format!("{}/rest/v1", base_url.trim().trim_end_matches('/'))
}

fn catalog_page_query(offset: usize) -> Vec<(&'static str, String)> {
    vec![
        ("select", "*".to_string()),
        ("order", "id.asc".to_string()),
        ("limit", PAGE_SIZE.to_string()),
        ("offset", offset.to_string()),
    ]
}

/// The RPC answers a bare `true`; some PostgREST versions wrap scalars.
fn rpc_succeeded(result: &serde_json::Value) -> bool {
    match result {
        serde_json::Value::Bool(value) => *value,
        serde_json::Value::Array(values) if values.len() == 1 => rpc_succeeded(&values[0]),
        serde_json::Value::Object(map) if map.len() == 1 => {
            map.values().next().is_some_and(rpc_succeeded)
        }
        _ => false,
    }
}

async fn check_status(response: Response) -> Result<Response, GatewayError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "<body unavailable>".to_string());
    Err(GatewayError::Status { status, body })
}
