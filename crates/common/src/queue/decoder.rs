use std::marker::PhantomData;
use std::panic::{catch_unwind, AssertUnwindSafe};

use jsonschema::Validator;
use serde::de::DeserializeOwned;

use crate::queue::{DecodeError, DecodeFailure, Decoded, MessageEnvelope, SchemaError};
use crate::scope::panic_message;

/// Turns a raw message body into a typed value.
///
/// Decoding is pure: the same body always yields the same value or the same error.
pub trait MessageDecoder: Send + Sync + 'static {
    type Output: Send + 'static;

    fn decode(&self, body: &[u8]) -> Result<Self::Output, DecodeError>;
}

/// Decode an envelope, attaching its identity to both the value and the failure.
/// A panicking decoder is reported as a failure too.
pub fn decode_message<D>(
    decoder: &D,
    envelope: &MessageEnvelope,
) -> Result<Decoded<D::Output>, DecodeFailure>
where
    D: MessageDecoder + ?Sized,
{
    let decoded = catch_unwind(AssertUnwindSafe(|| decoder.decode(&envelope.body)))
        .unwrap_or_else(|panic| {
            Err(DecodeError::new(format!(
                "decoder panicked: {}",
                panic_message(panic.as_ref())
            )))
        });

    match decoded {
        Ok(body) => Ok(Decoded {
            id: envelope.id.clone(),
            attempts: envelope.attempts,
            headers: envelope.headers.clone(),
            body,
        }),
        Err(e) => Err(DecodeFailure {
            message_id: envelope.id.clone(),
            diagnostic: e.diagnostic,
        }),
    }
}

/// Deserializes JSON bodies with serde.
pub struct JsonDecoder<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonDecoder<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonDecoder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> MessageDecoder for JsonDecoder<T>
where
    T: DeserializeOwned + Send + 'static,
{
    type Output = T;

    fn decode(&self, body: &[u8]) -> Result<T, DecodeError> {
        serde_json::from_slice(body).map_err(|e| DecodeError::new(format!("invalid body: {}", e)))
    }
}

/// Validates JSON bodies against a JSON Schema (Draft 2020-12) before deserializing.
///
/// The schema is compiled once, when the decoder is built.
pub struct JsonSchemaDecoder<T> {
    validator: Validator,
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonSchemaDecoder<T> {
    pub fn new(schema_str: &str) -> Result<Self, SchemaError> {
        let schema_value: serde_json::Value = serde_json::from_str(schema_str)
            .map_err(|e| SchemaError(format!("Invalid schema JSON: {}", e)))?;
        Self::from_value(&schema_value)
    }

    pub fn from_value(schema: &serde_json::Value) -> Result<Self, SchemaError> {
        let validator = Validator::new(schema)
            .map_err(|e| SchemaError(format!("Invalid JSON Schema: {}", e)))?;

        Ok(Self {
            validator,
            _marker: PhantomData,
        })
    }
}

impl<T> MessageDecoder for JsonSchemaDecoder<T>
where
    T: DeserializeOwned + Send + 'static,
{
    type Output = T;

    fn decode(&self, body: &[u8]) -> Result<T, DecodeError> {
        let value: serde_json::Value = serde_json::from_slice(body)
            .map_err(|e| DecodeError::new(format!("body is not JSON: {}", e)))?;

        // Report every violation, not just the first
        let errors: Vec<String> = self
            .validator
            .iter_errors(&value)
            .map(|e| format!("{} at {}", e, e.instance_path))
            .collect();

        if !errors.is_empty() {
            return Err(DecodeError::new(errors.join("; ")));
        }

        serde_json::from_value(value)
            .map_err(|e| DecodeError::new(format!("schema-valid body did not deserialize: {}", e)))
    }
}

/// Decodes protobuf bodies with prost.
pub struct ProtobufDecoder<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> ProtobufDecoder<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for ProtobufDecoder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> MessageDecoder for ProtobufDecoder<T>
where
    T: prost::Message + Default + Send + 'static,
{
    type Output = T;

    fn decode(&self, body: &[u8]) -> Result<T, DecodeError> {
        T::decode(body).map_err(|e| DecodeError::new(format!("invalid protobuf body: {}", e)))
    }
}
