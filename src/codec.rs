//! Wire format shared by gateways and workers.
//!
//! Requests travel as JSON objects with the payload bytes base64-encoded:
//!
//! ```json
//! {"id": "9f3c…-7", "shape": [224, 224, 3], "dtype": "float32",
//!  "payload": "AAAAAA…", "enqueued_at": "2026-01-01T00:00:00Z"}
//! ```
//!
//! Results are the JSON serialization of [`InferenceResult`].

use base64::{Engine, engine::general_purpose::STANDARD as BASE64_STANDARD};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::request::{DType, InferenceRequest, InferenceResult, TensorPayload};

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("malformed base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("payload shape must have at least one dimension")]
    EmptyShape,
    #[error("payload shape overflows the addressable size")]
    ShapeOverflow,
    #[error("payload has {actual} bytes, shape requires {expected}")]
    PayloadLength { expected: usize, actual: usize },
    #[error("expected dtype {expected}, got {actual}")]
    DTypeMismatch { expected: DType, actual: DType },
    #[error("expected shape {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    #[error("text payload is not valid utf-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),
}

#[derive(Serialize, Deserialize)]
struct RequestEnvelope {
    id: String,
    shape: Vec<usize>,
    dtype: DType,
    payload: String,
    enqueued_at: DateTime<Utc>,
}

/// Minimal view used to salvage the id from an otherwise broken envelope.
#[derive(Deserialize)]
struct EnvelopeId {
    id: String,
}

/// Decode failure that remembers which request it belonged to, when known.
#[derive(Debug, Error)]
#[error("{source}")]
pub struct RequestDecodeError {
    pub request_id: Option<String>,
    #[source]
    pub source: CodecError,
}

pub fn encode_request(request: &InferenceRequest) -> Result<Vec<u8>, CodecError> {
    let envelope = RequestEnvelope {
        id: request.id.clone(),
        shape: request.payload.shape().to_vec(),
        dtype: request.payload.dtype(),
        payload: BASE64_STANDARD.encode(request.payload.bytes()),
        enqueued_at: request.enqueued_at,
    };
    Ok(serde_json::to_vec(&envelope)?)
}

pub fn decode_request(raw: &[u8]) -> Result<InferenceRequest, RequestDecodeError> {
    let salvage_id = || {
        serde_json::from_slice::<EnvelopeId>(raw)
            .ok()
            .map(|value| value.id)
    };

    let envelope: RequestEnvelope =
        serde_json::from_slice(raw).map_err(|error| RequestDecodeError {
            request_id: salvage_id(),
            source: error.into(),
        })?;

    let id = envelope.id;
    let payload = BASE64_STANDARD
        .decode(envelope.payload.as_bytes())
        .map_err(CodecError::from)
        .and_then(|bytes| TensorPayload::new(envelope.shape, envelope.dtype, bytes));

    match payload {
        Ok(payload) => Ok(InferenceRequest {
            id,
            payload,
            enqueued_at: envelope.enqueued_at,
        }),
        Err(source) => Err(RequestDecodeError {
            request_id: Some(id),
            source,
        }),
    }
}

pub fn encode_result(result: &InferenceResult) -> Result<Vec<u8>, CodecError> {
    Ok(serde_json::to_vec(result)?)
}

pub fn decode_result(raw: &[u8]) -> Result<InferenceResult, CodecError> {
    Ok(serde_json::from_slice(raw)?)
}

/// Unpacks a numeric payload into `f32` values in row-major order.
pub fn payload_values(payload: &TensorPayload) -> Result<Vec<f32>, CodecError> {
    let bytes = payload.bytes();
    let values = match payload.dtype() {
        DType::Uint8 => bytes.iter().map(|&b| f32::from(b)).collect(),
        DType::Float32 => bytes
            .chunks_exact(4)
            .map(bytemuck::pod_read_unaligned::<f32>)
            .collect(),
        DType::Float64 => bytes
            .chunks_exact(8)
            .map(|chunk| bytemuck::pod_read_unaligned::<f64>(chunk) as f32)
            .collect(),
        DType::Utf8 => {
            return Err(CodecError::DTypeMismatch {
                expected: DType::Float32,
                actual: DType::Utf8,
            });
        }
    };
    Ok(values)
}

/// Interprets a `utf8` payload as text.
pub fn payload_text(payload: &TensorPayload) -> Result<String, CodecError> {
    if payload.dtype() != DType::Utf8 {
        return Err(CodecError::DTypeMismatch {
            expected: DType::Utf8,
            actual: payload.dtype(),
        });
    }
    Ok(std::str::from_utf8(payload.bytes())?.to_string())
}
