#[cfg(feature = "text-embedding")]
use std::sync::Mutex;

#[cfg(feature = "text-embedding")]
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};

#[cfg(feature = "text-embedding")]
use crate::domain::request::Prediction;
#[cfg(feature = "text-embedding")]
use crate::processing::backend::{BatchInput, InferenceBackend, InferenceError};

/// Normalize a vector to unit length.
///
/// Returns the original vector when the norm is zero.
pub(crate) fn normalize_embedding(vec: &[f32]) -> Vec<f32> {
    let norm = vec.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm == 0.0 {
        vec.to_vec()
    } else {
        vec.iter().map(|x| x / norm).collect()
    }
}

/// Sentence embeddings for `utf8` payloads.
///
/// The model is loaded once per worker; every batch is embedded in a single
/// call and each vector is normalized to unit length.
#[cfg(feature = "text-embedding")]
pub struct TextEmbeddingBackend {
    embedder: Mutex<TextEmbedding>,
}

#[cfg(feature = "text-embedding")]
impl TextEmbeddingBackend {
    pub fn try_new() -> Result<Self, InferenceError> {
        let embedder =
            TextEmbedding::try_new(InitOptions::new(EmbeddingModel::MultilingualE5Large))
                .map_err(|error| {
                    InferenceError::Backend(format!("Failed to initialize embedder: {error:?}"))
                })?;
        Ok(Self {
            embedder: Mutex::new(embedder),
        })
    }
}

#[cfg(feature = "text-embedding")]
impl InferenceBackend for TextEmbeddingBackend {
    fn name(&self) -> &'static str {
        "text-embedding"
    }

    fn infer(&self, input: &BatchInput) -> Result<Vec<Prediction>, InferenceError> {
        let BatchInput::Text(texts) = input else {
            return Err(InferenceError::UnsupportedInput {
                backend: self.name(),
                input: "tensor",
            });
        };

        let mut embedder = self
            .embedder
            .lock()
            .map_err(|_| InferenceError::Backend("embedder mutex poisoned".to_string()))?;

        let embeddings = embedder
            .embed(texts.clone(), None)
            .map_err(|error| {
                InferenceError::Backend(format!("Failed to generate embedding: {error:?}"))
            })?;

        Ok(embeddings
            .into_iter()
            .map(|value| Prediction::vector(normalize_embedding(&value)))
            .collect())
    }
}
