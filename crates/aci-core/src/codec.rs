//! Pluggable marshalling of call arguments and return values.
//!
//! The envelope layer only moves opaque bytes; an [`ObjectCodec`] turns
//! argument lists and results into those bytes. [`JsonCodec`] is the default.

use crate::envelope::{Envelope, INVOKE_REQUEST_TYPE, OBJECT_TYPE};
use crate::{AciError, Result};
use bytes::Bytes;
use serde_json::Value;

/// Serializer for invocation arguments and results.
pub trait ObjectCodec: Send + Sync {
    /// Short name, used in logs.
    fn name(&self) -> &'static str;

    /// Serialize an argument list.
    fn encode_args(&self, args: &[Value]) -> Result<Bytes>;

    /// Deserialize a return value.
    fn decode_result(&self, bytes: &[u8]) -> Result<Value>;
}

/// JSON marshalling via `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl ObjectCodec for JsonCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn encode_args(&self, args: &[Value]) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(args)?))
    }

    fn decode_result(&self, bytes: &[u8]) -> Result<Value> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Wrap serialized arguments in a `binary_invoke_request` envelope.
pub fn request_envelope(codec: &dyn ObjectCodec, method: &str, args: &[Value]) -> Result<Envelope> {
    let payload = codec.encode_args(args)?;
    Ok(Envelope::single(INVOKE_REQUEST_TYPE, method, payload))
}

/// Extract the return value from a result envelope.
///
/// Uses the `object` record, or the first record when none is tagged.
pub fn result_value(codec: &dyn ObjectCodec, envelope: &Envelope) -> Result<Value> {
    let record = envelope
        .find(OBJECT_TYPE)
        .or_else(|| envelope.records().first())
        .ok_or_else(|| AciError::Envelope {
            message: "result envelope has no records".into(),
        })?;
    codec.decode_result(&record.payload)
}
