use std::sync::Arc;

use thiserror::Error;

use crate::domain::request::Prediction;
use crate::models::config::Settings;
use crate::processing::embedding::normalize_embedding;

#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("backend {backend} does not accept {input} input")]
    UnsupportedInput {
        backend: &'static str,
        input: &'static str,
    },
    #[error("inference backend failed: {0}")]
    Backend(String),
    #[error("unknown inference backend: {0}")]
    UnknownBackend(String),
}

/// Row-major stack of equally shaped items; `shape[0]` is the batch size.
#[derive(Clone, Debug, PartialEq)]
pub struct BatchTensor {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl BatchTensor {
    pub fn batch_size(&self) -> usize {
        self.shape.first().copied().unwrap_or(0)
    }

    /// Iterates over the flattened items of the batch.
    pub fn rows(&self) -> impl Iterator<Item = &[f32]> {
        let row_len = self.shape.iter().skip(1).product::<usize>().max(1);
        self.data.chunks(row_len).take(self.batch_size())
    }
}

/// One batch as handed to a backend.
#[derive(Clone, Debug, PartialEq)]
pub enum BatchInput {
    Tensor(BatchTensor),
    Text(Vec<String>),
}

impl BatchInput {
    pub fn len(&self) -> usize {
        match self {
            BatchInput::Tensor(tensor) => tensor.batch_size(),
            BatchInput::Text(texts) => texts.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn kind(&self) -> &'static str {
        match self {
            BatchInput::Tensor(_) => "tensor",
            BatchInput::Text(_) => "text",
        }
    }
}

/// A model invoked once per batch.
///
/// Implementations run on a blocking thread and must return exactly one
/// prediction per batch item, in batch order.
pub trait InferenceBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn infer(&self, input: &BatchInput) -> Result<Vec<Prediction>, InferenceError>;
}

/// Scales every item to unit length.
pub struct NormalizeBackend;

impl InferenceBackend for NormalizeBackend {
    fn name(&self) -> &'static str {
        "normalize"
    }

    fn infer(&self, input: &BatchInput) -> Result<Vec<Prediction>, InferenceError> {
        let BatchInput::Tensor(tensor) = input else {
            return Err(InferenceError::UnsupportedInput {
                backend: self.name(),
                input: input.kind(),
            });
        };
        let item_shape = tensor.shape.get(1..).unwrap_or_default().to_vec();
        Ok(tensor
            .rows()
            .map(|row| Prediction {
                shape: item_shape.clone(),
                values: normalize_embedding(row),
            })
            .collect())
    }
}

/// Resolves the backend named in `worker.backend`.
pub fn build_backend(settings: &Settings) -> Result<Arc<dyn InferenceBackend>, InferenceError> {
    match settings.worker.backend.as_str() {
        "normalize" => Ok(Arc::new(NormalizeBackend)),
        #[cfg(feature = "text-embedding")]
        "text-embedding" => Ok(Arc::new(
            crate::processing::embedding::TextEmbeddingBackend::try_new()?,
        )),
        other => Err(InferenceError::UnknownBackend(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_backend_returns_one_unit_vector_per_row() {
        let input = BatchInput::Tensor(BatchTensor {
            shape: vec![2, 2],
            data: vec![3.0, 4.0, 0.0, 0.0],
        });

        let outputs = NormalizeBackend.infer(&input).unwrap();

        assert_eq!(outputs.len(), 2);
        assert_eq!(outputs[0].shape, vec![2]);
        assert_eq!(outputs[0].values, vec![0.6, 0.8]);
        assert_eq!(outputs[1].values, vec![0.0, 0.0]);
    }

    #[test]
    fn normalize_backend_rejects_text() {
        let input = BatchInput::Text(vec!["tea".to_string()]);

        assert!(matches!(
            NormalizeBackend.infer(&input),
            Err(InferenceError::UnsupportedInput { .. })
        ));
    }

    #[test]
    fn unknown_backend_is_rejected() {
        let mut settings = Settings::default();
        settings.worker.backend = "resnet".to_string();

        assert!(matches!(
            build_backend(&settings),
            Err(InferenceError::UnknownBackend(name)) if name == "resnet"
        ));
    }

    #[test]
    fn default_backend_is_normalize() {
        let backend = build_backend(&Settings::default()).unwrap();

        assert_eq!(backend.name(), "normalize");
    }
}
