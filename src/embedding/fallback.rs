//! Deterministic flavor embedding used when no embedding service is configured.
//!
//! Tags are folded into a short seed vector over a fixed flavor dictionary,
//! normalized, then tiled out to [`EMBEDDING_DIM`] values with a periodic
//! per-position scale so neighbouring tiles are not identical.

use super::{EMBEDDING_DIM, EmbeddingVector};

const SEED_DIM: usize = 5;
const BASE_VALUE: f32 = 0.1;
const KEYWORD_WEIGHT: f32 = 0.5;
const UNMATCHED_INCREMENT: f32 = 0.05;

/// Checked in order; the first keyword contained in a tag wins.
const FLAVOR_SEEDS: [(&str, [f32; SEED_DIM]); 8] = [
    ("fruity", [0.8, 0.2, 0.1, 0.0, 0.3]),
    ("chocolate", [0.2, 0.9, 0.4, 0.1, 0.1]),
    ("nutty", [0.3, 0.5, 0.8, 0.2, 0.1]),
    ("floral", [0.7, 0.1, 0.2, 0.1, 0.6]),
    ("spicy", [0.4, 0.2, 0.7, 0.5, 0.3]),
    ("sweet", [0.5, 0.6, 0.3, 0.1, 0.2]),
    ("bitter", [0.1, 0.4, 0.5, 0.8, 0.1]),
    ("acidic", [0.6, 0.2, 0.1, 0.7, 0.4]),
];

const VARIATION_PERIOD: usize = 11;

pub fn generate_fallback(tags: &[String]) -> EmbeddingVector {
    let mut seed = [BASE_VALUE; SEED_DIM];

    for tag in tags {
        let tag = tag.to_lowercase();
        match keyword_seed(&tag) {
            Some(keyword_vector) => {
                for (value, keyword_value) in seed.iter_mut().zip(keyword_vector.iter()) {
                    *value += KEYWORD_WEIGHT * keyword_value;
                }
            }
            None => {
                for value in &mut seed {
                    *value += UNMATCHED_INCREMENT;
                }
            }
        }
    }

    normalize_seed(&mut seed);

    let values = (0..EMBEDDING_DIM)
        .map(|index| seed[index % SEED_DIM] * position_factor(index))
        .collect::<Vec<f32>>();

    // Length and finiteness hold by construction.
    EmbeddingVector(values)
}

fn keyword_seed(tag: &str) -> Option<&'static [f32; SEED_DIM]> {
    FLAVOR_SEEDS
        .iter()
        .find(|(keyword, _)| tag.contains(keyword))
        .map(|(_, vector)| vector)
}

/// A zero-norm seed is left as-is rather than divided.
fn normalize_seed(values: &mut [f32; SEED_DIM]) {
    let norm = values
        .iter()
        .map(|value| f64::from(*value) * f64::from(*value))
        .sum::<f64>()
        .sqrt();

    if norm <= 0.0 || !norm.is_finite() {
        return;
    }

    for value in values.iter_mut() {
        *value = (f64::from(*value) / norm) as f32;
    }
}

/// Scale in `[0.95, 1.05]`, periodic in the position index.
fn position_factor(index: usize) -> f32 {
    let step = (7 * index + 3) % VARIATION_PERIOD;
    0.95 + step as f32 / 100.0
}
