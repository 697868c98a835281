//! Adapter to an external OpenAI-compatible embedding service.

use std::future::Future;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::EmbeddingVector;
use crate::error::{EmbeddingError, RecordError};

pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_OPENAI_MODEL: &str = "text-embedding-ada-002";
const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);

/// Text-to-vector service. Uses native async fn in traits.
pub trait EmbeddingService {
    fn embed(&self, text: &str) -> impl Future<Output = Result<Vec<f32>, EmbeddingError>>;

    fn model_name(&self) -> &str;
}

/// Builds the prompt for a record and validates what the service returns.
pub async fn generate_primary<S: EmbeddingService>(
    service: &S,
    tags: &[String],
) -> Result<EmbeddingVector, RecordError> {
    let text = tags.join(", ");
    debug!(model = %service.model_name(), text = %text, "requesting primary embedding");
    let values = service.embed(&text).await?;
    EmbeddingVector::new(values)
}

#[derive(Clone)]
pub struct OpenAiEmbedder {
    client: Client,
    endpoint: String,
    model: String,
    max_retries: usize,
    retry_base: Duration,
}

impl OpenAiEmbedder {
    pub fn new(
        api_key: &SecretString,
        base_url: &str,
        model: String,
        timeout: Duration,
        max_retries: usize,
    ) -> Result<Self> {
        let api_key = api_key.expose_secret().trim();
        anyhow::ensure!(!api_key.is_empty(), "missing OpenAI API key");
        anyhow::ensure!(!model.trim().is_empty(), "missing OpenAI model name");

        let mut headers = HeaderMap::new();
        let mut auth = HeaderValue::from_str(&format!("Bearer {api_key}"))
            .context("invalid OpenAI API key")?;
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .context("failed to build OpenAI HTTP client")?;
        let endpoint = format!("{}/embeddings", base_url.trim_end_matches('/'));

        Ok(Self {
            client,
            endpoint,
            model,
            max_retries,
            retry_base: RETRY_BASE_DELAY,
        })
    }

    #[cfg(test)]
    fn with_retry_base(mut self, retry_base: Duration) -> Self {
        self.retry_base = retry_base;
        self
    }

    fn should_retry(&self, status: StatusCode) -> bool {
        status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
    }

    fn is_retryable_error(&self, err: &reqwest::Error) -> bool {
        err.is_timeout() || err.is_connect()
    }
}

impl EmbeddingService for OpenAiEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let mut attempt = 0usize;
        loop {
            let request = EmbeddingRequest {
                model: &self.model,
                input: text,
            };
            match self.client.post(&self.endpoint).json(&request).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let parsed: EmbeddingResponse = response.json().await?;
                        return parsed
                            .data
                            .into_iter()
                            .min_by_key(|entry| entry.index)
                            .map(|entry| entry.embedding)
                            .ok_or(EmbeddingError::EmptyResponse);
                    }

                    let body = response
                        .text()
                        .await
                        .unwrap_or_else(|_| "<body unavailable>".to_string());
                    if self.should_retry(status) && attempt < self.max_retries {
                        attempt += 1;
                        warn!(%status, attempt, "embedding request throttled; retrying");
                        tokio::time::sleep(retry_backoff(self.retry_base, attempt)).await;
                        continue;
                    }
                    return Err(EmbeddingError::Status { status, body });
                }
                Err(err) => {
                    if self.is_retryable_error(&err) && attempt < self.max_retries {
                        attempt += 1;
                        warn!(error = %err, attempt, "embedding request failed; retrying");
                        tokio::time::sleep(retry_backoff(self.retry_base, attempt)).await;
                        continue;
                    }
                    return Err(err.into());
                }
            }
        }
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

fn retry_backoff(base: Duration, attempt: usize) -> Duration {
    let capped = attempt.min(5) as u32;
    base * (1 << capped)
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    #[serde(default)]
    index: usize,
}
