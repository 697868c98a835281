pub mod codec;
pub mod fallback;
pub mod primary;

use crate::error::RecordError;

pub use codec::{decode_vector, encode_vector};
pub use fallback::generate_fallback;
pub use primary::{EmbeddingService, OpenAiEmbedder, generate_primary};

/// Dimensionality of the `flavor_embedding` column.
pub const EMBEDDING_DIM: usize = 1536;

/// A vector that is safe to persist: exactly [`EMBEDDING_DIM`] finite values.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingVector(Vec<f32>);

impl EmbeddingVector {
    pub fn new(values: Vec<f32>) -> Result<Self, RecordError> {
        if values.len() != EMBEDDING_DIM {
            return Err(RecordError::DimensionMismatch {
                expected: EMBEDDING_DIM,
                actual: values.len(),
            });
        }

        if let Some(index) = values.iter().position(|value| !value.is_finite()) {
            return Err(RecordError::NonFinite(index));
        }

        Ok(Self(values))
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn encode(&self) -> String {
        encode_vector(self.as_slice())
    }
}

/// How the runner obtains vectors. Resolved once before a run starts.
pub enum EmbeddingStrategy<'a, S> {
    Primary(&'a S),
    Fallback,
}

impl<S: EmbeddingService> EmbeddingStrategy<'_, S> {
    pub fn label(&self) -> String {
        match self {
            Self::Primary(service) => format!("primary:{}", service.model_name()),
            Self::Fallback => "fallback".to_string(),
        }
    }
}
