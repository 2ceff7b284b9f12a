use crate::error::BackendError;
use crate::traits::Embedder;
use async_trait::async_trait;

pub const DEFAULT_EMBEDDING_DIMENSIONS: usize = 128;

/// Deterministic hashed trigram embedder. Needs no network, which makes it
/// useful for smoke runs and tests.
#[derive(Debug, Clone, Copy)]
pub struct CharacterNgramEmbedder {
    pub dimensions: usize,
}

impl Default for CharacterNgramEmbedder {
    fn default() -> Self {
        Self {
            dimensions: DEFAULT_EMBEDDING_DIMENSIONS,
        }
    }
}

impl CharacterNgramEmbedder {
    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dimensions.max(1)];
        let chars: Vec<char> = text.to_lowercase().chars().collect();

        for window in chars.windows(3) {
            let bucket = (fnv1a(window) % vector.len() as u64) as usize;
            vector[bucket] += 1.0;
        }

        let magnitude = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
        if magnitude > 0.0 {
            for value in &mut vector {
                *value /= magnitude;
            }
        }

        vector
    }
}

fn fnv1a(window: &[char]) -> u64 {
    let mut hash = 1469598103934665603u64;
    let mut buffer = [0u8; 4];
    for ch in window {
        for byte in ch.encode_utf8(&mut buffer).bytes() {
            hash ^= byte as u64;
            hash = hash.wrapping_mul(1099511628211);
        }
    }
    hash
}

#[async_trait]
impl Embedder for CharacterNgramEmbedder {
    fn dimensions(&self) -> usize {
        self.dimensions.max(1)
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, BackendError> {
        Ok(texts.iter().map(|text| self.embed_text(text)).collect())
    }
}

pub fn cosine_similarity(left: &[f32], right: &[f32]) -> f32 {
    if left.len() != right.len() || left.is_empty() {
        return 0.0;
    }

    let dot = left.iter().zip(right).map(|(a, b)| a * b).sum::<f32>();
    let left_norm = left.iter().map(|value| value * value).sum::<f32>().sqrt();
    let right_norm = right.iter().map(|value| value * value).sum::<f32>().sqrt();

    if left_norm == 0.0 || right_norm == 0.0 {
        0.0
    } else {
        dot / (left_norm * right_norm)
    }
}

/// Verifies an embedding response lines up with its request.
pub fn check_batch(
    requested: usize,
    vectors: &[Vec<f32>],
    dimensions: usize,
) -> Result<(), BackendError> {
    if vectors.len() != requested {
        return Err(BackendError::Request(format!(
            "embedding count {} doesn't match input count {requested}",
            vectors.len()
        )));
    }

    if let Some(vector) = vectors.iter().find(|vector| vector.len() != dimensions) {
        return Err(BackendError::DimensionMismatch {
            expected: dimensions,
            actual: vector.len(),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedder_is_deterministic() {
        let embedder = CharacterNgramEmbedder::default();
        let first = embedder.embed_text("Groundwater quality report");
        let second = embedder.embed_text("Groundwater quality report");
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn batch_preserves_order_and_length() {
        let embedder = CharacterNgramEmbedder { dimensions: 32 };
        let texts = vec!["school enrolment".to_string(), "hospital beds".to_string()];

        let vectors = embedder.embed_batch(&texts).await.expect("embedding succeeds");

        assert_eq!(vectors.len(), 2);
        assert!(vectors.iter().all(|vector| vector.len() == 32));
        assert_eq!(vectors[1], embedder.embed_text("hospital beds"));
    }

    #[test]
    fn similar_text_scores_higher() {
        let embedder = CharacterNgramEmbedder::default();
        let query = embedder.embed_text("vaccination schedule for children");
        let close = embedder.embed_text("the vaccination schedule for young children");
        let far = embedder.embed_text("road resurfacing tender");
        assert!(cosine_similarity(&query, &close) > cosine_similarity(&query, &far));
    }

    #[test]
    fn batch_check_rejects_mismatches() {
        assert!(check_batch(2, &[vec![0.0; 4]], 4).is_err());
        assert!(matches!(
            check_batch(1, &[vec![0.0; 3]], 4),
            Err(BackendError::DimensionMismatch { expected: 4, actual: 3 })
        ));
        assert!(check_batch(1, &[vec![0.0; 4]], 4).is_ok());
    }
}
