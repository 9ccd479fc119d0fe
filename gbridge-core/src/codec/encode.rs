use super::CodecOptions;
use prost_reflect::{DynamicMessage, ReflectMessage, SerializeOptions};

#[derive(Debug, thiserror::Error)]
#[error("Failed to encode '{message_type}' as JSON: {source}")]
pub struct EncodeError {
    pub message_type: String,
    #[source]
    pub source: serde_json::Error,
}

/// Encodes `message` following the protobuf JSON mapping.
///
/// 64-bit integers are written as strings and enums by name. Fields holding their default
/// value are skipped unless they have explicit presence or `emit_defaults` is set.
pub fn encode(
    message: &DynamicMessage,
    options: &CodecOptions,
) -> Result<serde_json::Value, EncodeError> {
    message
        .serialize_with_options(serde_json::value::Serializer, &serialize_options(options))
        .map_err(|source| EncodeError {
            message_type: message.descriptor().full_name().to_string(),
            source,
        })
}

/// Same as [`encode`], returning the serialized bytes.
pub fn encode_to_vec(
    message: &DynamicMessage,
    options: &CodecOptions,
) -> Result<Vec<u8>, EncodeError> {
    let mut out = Vec::new();
    let mut serializer = serde_json::Serializer::new(&mut out);

    message
        .serialize_with_options(&mut serializer, &serialize_options(options))
        .map_err(|source| EncodeError {
            message_type: message.descriptor().full_name().to_string(),
            source,
        })?;

    Ok(out)
}

fn serialize_options(options: &CodecOptions) -> SerializeOptions {
    SerializeOptions::new()
        .skip_default_fields(!options.emit_defaults)
        .use_proto_field_name(options.use_proto_field_names)
        .stringify_64_bit_integers(true)
}
