use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::codec::CodecError;

/// Element type of a request payload. Numeric types use native (little-endian
/// on every supported target) byte order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    Uint8,
    Float32,
    Float64,
    Utf8,
}

impl DType {
    pub fn size(self) -> usize {
        match self {
            DType::Uint8 | DType::Utf8 => 1,
            DType::Float32 => 4,
            DType::Float64 => 8,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DType::Uint8 => "uint8",
            DType::Float32 => "float32",
            DType::Float64 => "float64",
            DType::Utf8 => "utf8",
        };
        f.write_str(name)
    }
}

/// Raw bytes plus the shape/dtype needed to interpret them.
///
/// Construction checks that the byte length matches the shape, so a payload
/// that exists is always internally consistent.
#[derive(Clone, Debug, PartialEq)]
pub struct TensorPayload {
    shape: Vec<usize>,
    dtype: DType,
    bytes: Vec<u8>,
}

impl TensorPayload {
    pub fn new(shape: Vec<usize>, dtype: DType, bytes: Vec<u8>) -> Result<Self, CodecError> {
        if shape.is_empty() {
            return Err(CodecError::EmptyShape);
        }
        let expected = shape
            .iter()
            .try_fold(dtype.size(), |acc, dim| acc.checked_mul(*dim))
            .ok_or(CodecError::ShapeOverflow)?;
        if expected != bytes.len() {
            return Err(CodecError::PayloadLength {
                expected,
                actual: bytes.len(),
            });
        }
        Ok(Self {
            shape,
            dtype,
            bytes,
        })
    }

    /// Packs `values` in native byte order, matching how workers unpack them.
    pub fn from_f32(shape: Vec<usize>, values: &[f32]) -> Result<Self, CodecError> {
        Self::new(shape, DType::Float32, bytemuck::cast_slice(values).to_vec())
    }

    pub fn from_text(text: &str) -> Result<Self, CodecError> {
        Self::new(vec![text.len()], DType::Utf8, text.as_bytes().to_vec())
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn element_count(&self) -> usize {
        self.shape.iter().product()
    }
}

/// A unit of work travelling through the pending queue.
#[derive(Clone, Debug, PartialEq)]
pub struct InferenceRequest {
    pub id: String,
    pub payload: TensorPayload,
    pub enqueued_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Success,
    Error,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    /// The individual request could not be decoded; other batch members are unaffected.
    Decode,
    /// The batched computation failed for every member of the batch.
    Inference,
}

/// Error payload written by a worker and surfaced to the caller verbatim.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl fmt::Display for ResultFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            FailureKind::Decode => "decode",
            FailureKind::Inference => "inference",
        };
        write!(f, "{kind} error: {}", self.message)
    }
}

/// Model output for a single request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub shape: Vec<usize>,
    pub values: Vec<f32>,
}

impl Prediction {
    pub fn vector(values: Vec<f32>) -> Self {
        Self {
            shape: vec![values.len()],
            values,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InferenceResult {
    pub request_id: String,
    pub status: ResultStatus,
    pub output: Option<Prediction>,
    pub error: Option<ResultFailure>,
    pub computed_at: DateTime<Utc>,
}

impl InferenceResult {
    pub fn success(request_id: impl Into<String>, output: Prediction) -> Self {
        Self {
            request_id: request_id.into(),
            status: ResultStatus::Success,
            output: Some(output),
            error: None,
            computed_at: Utc::now(),
        }
    }

    pub fn failure(request_id: impl Into<String>, kind: FailureKind, message: String) -> Self {
        Self {
            request_id: request_id.into(),
            status: ResultStatus::Error,
            output: None,
            error: Some(ResultFailure { kind, message }),
            computed_at: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ResultStatus::Success
    }

    /// Splits the result into the prediction or the worker's failure payload.
    pub fn into_outcome(self) -> Result<Prediction, ResultFailure> {
        match (self.status, self.output, self.error) {
            (ResultStatus::Success, Some(output), _) => Ok(output),
            (_, _, Some(error)) => Err(error),
            (ResultStatus::Success, None, None) => Err(ResultFailure {
                kind: FailureKind::Inference,
                message: "result marked successful without output".to_string(),
            }),
            (ResultStatus::Error, _, None) => Err(ResultFailure {
                kind: FailureKind::Inference,
                message: "result marked failed without error details".to_string(),
            }),
        }
    }
}
