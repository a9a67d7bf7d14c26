//! Turning claimed queue items into one backend call and back into results.

use crate::codec::{CodecError, decode_request, payload_text, payload_values};
use crate::domain::request::{DType, FailureKind, InferenceResult, Prediction, TensorPayload};
use crate::models::config::PayloadSettings;
use crate::processing::backend::{BatchInput, BatchTensor, InferenceError};

/// Outcome of decoding a claimed batch.
///
/// `ids[i]` is the request whose data is item `i` of `input`; items that
/// failed to decode are already turned into error results.
#[derive(Debug)]
pub struct PreparedBatch {
    pub ids: Vec<String>,
    pub input: BatchInput,
    pub failures: Vec<InferenceResult>,
    /// Items so malformed that no request id could be recovered.
    pub orphaned: usize,
}

enum ItemInput {
    Values(Vec<f32>),
    Text(String),
}

fn decode_item(
    request_payload: &TensorPayload,
    payload: &PayloadSettings,
) -> Result<ItemInput, CodecError> {
    payload.check(request_payload)?;
    match payload.dtype {
        DType::Utf8 => payload_text(request_payload).map(ItemInput::Text),
        _ => payload_values(request_payload).map(ItemInput::Values),
    }
}

/// Decodes every raw item and stacks the valid ones into a single input.
///
/// A bad item only fails itself; the rest of the batch is unaffected.
pub fn prepare_batch(raw_items: Vec<Vec<u8>>, payload: &PayloadSettings) -> PreparedBatch {
    let mut ids = Vec::with_capacity(raw_items.len());
    let mut failures = Vec::new();
    let mut orphaned = 0;
    let mut data = Vec::new();
    let mut texts = Vec::new();

    for raw in raw_items {
        let request = match decode_request(&raw) {
            Ok(request) => request,
            Err(error) => {
                match error.request_id {
                    Some(id) => {
                        log::warn!("Failed to decode request {id}: {}", error.source);
                        failures.push(InferenceResult::failure(
                            id,
                            FailureKind::Decode,
                            error.source.to_string(),
                        ));
                    }
                    None => {
                        orphaned += 1;
                        log::error!(
                            "Dropping undecodable queue item of {} bytes without a request id: {}",
                            raw.len(),
                            error.source
                        );
                    }
                }
                continue;
            }
        };

        match decode_item(&request.payload, payload) {
            Ok(ItemInput::Values(values)) => {
                data.extend(values);
                ids.push(request.id);
            }
            Ok(ItemInput::Text(text)) => {
                texts.push(text);
                ids.push(request.id);
            }
            Err(error) => {
                log::warn!("Rejecting request {}: {error}", request.id);
                failures.push(InferenceResult::failure(
                    request.id,
                    FailureKind::Decode,
                    error.to_string(),
                ));
            }
        }
    }

    let input = match payload.dtype {
        DType::Utf8 => BatchInput::Text(texts),
        _ => {
            let mut shape = Vec::with_capacity(payload.shape.len() + 1);
            shape.push(ids.len());
            shape.extend_from_slice(&payload.shape);
            BatchInput::Tensor(BatchTensor { shape, data })
        }
    };

    PreparedBatch {
        ids,
        input,
        failures,
        orphaned,
    }
}

/// Pairs backend output with request ids.
///
/// A backend error, or an output count that does not match the batch, fails
/// every request in the batch.
pub fn fan_out(
    ids: Vec<String>,
    outcome: Result<Vec<Prediction>, InferenceError>,
) -> Vec<InferenceResult> {
    let error = match outcome {
        Ok(outputs) if outputs.len() == ids.len() => {
            return ids
                .into_iter()
                .zip(outputs)
                .map(|(id, output)| InferenceResult::success(id, output))
                .collect();
        }
        Ok(outputs) => format!(
            "backend returned {} outputs for a batch of {}",
            outputs.len(),
            ids.len()
        ),
        Err(error) => error.to_string(),
    };

    log::error!("Inference failed for batch of {}: {error}", ids.len());
    ids.into_iter()
        .map(|id| InferenceResult::failure(id, FailureKind::Inference, error.clone()))
        .collect()
}
