use crate::relay::errors::RelayError;
use crate::relay::types::{RequestMessage, ResponseMessage};

/// Encodes relay messages into transport payloads and back
pub trait Codec: Send + Sync + 'static {
    fn encode_request(&self, message: &RequestMessage) -> Result<Vec<u8>, RelayError>;
    fn decode_request(&self, payload: &[u8]) -> Result<RequestMessage, RelayError>;
    fn encode_response(&self, message: &ResponseMessage) -> Result<Vec<u8>, RelayError>;
    fn decode_response(&self, payload: &[u8]) -> Result<ResponseMessage, RelayError>;
}

/// JSON codec backed by `serde_json`
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode_request(&self, message: &RequestMessage) -> Result<Vec<u8>, RelayError> {
        serde_json::to_vec(message).map_err(codec_error("encode request"))
    }

    fn decode_request(&self, payload: &[u8]) -> Result<RequestMessage, RelayError> {
        serde_json::from_slice(payload).map_err(codec_error("decode request"))
    }

    fn encode_response(&self, message: &ResponseMessage) -> Result<Vec<u8>, RelayError> {
        serde_json::to_vec(message).map_err(codec_error("encode response"))
    }

    fn decode_response(&self, payload: &[u8]) -> Result<ResponseMessage, RelayError> {
        serde_json::from_slice(payload).map_err(codec_error("decode response"))
    }
}

fn codec_error(what: &'static str) -> impl Fn(serde_json::Error) -> RelayError {
    move |e| RelayError::Decode(format!("{}: {}", what, e))
}
