use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("vector literal must be wrapped in '[' and ']'")]
    MissingBrackets,

    #[error("vector literal has an empty component at position {0}")]
    EmptyComponent(usize),

    #[error("vector literal component {index} is not a number: '{raw}'")]
    InvalidComponent { index: usize, raw: String },

    #[error("vector literal component {0} is not finite")]
    NonFinite(usize),
}

#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("embedding request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("embedding service returned {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("embedding service returned no vectors")]
    EmptyResponse,
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("gateway request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("gateway returned {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("malformed catalog row: {0}")]
    Malformed(String),
}

/// Failure of a single catalog record. Never aborts a run.
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("record has no flavor tags")]
    EmptyTags,

    #[error("embedding has {actual} dimensions, expected {expected}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("embedding component {0} is not finite")]
    NonFinite(usize),

    #[error(transparent)]
    Embedding(#[from] EmbeddingError),

    #[error("persisting embedding failed: {0}")]
    Persistence(#[from] GatewayError),

    #[error("gateway rejected the embedding update")]
    Rejected,

    #[error("{stage} timed out after {after:?}")]
    Timeout { stage: &'static str, after: Duration },
}
