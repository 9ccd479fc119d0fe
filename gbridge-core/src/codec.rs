//! # Message Codec
//!
//! Converts between JSON and [`DynamicMessage`](prost_reflect::DynamicMessage) for any message
//! descriptor, following the protobuf JSON mapping.
//!
//! Decoding is strict by default: unknown keys, type mismatches and out of range numbers are
//! rejected with a [`DecodeError`] that points at the offending value. Both the proto field
//! name and its lowerCamelCase JSON name are accepted.
//!
//! Encoding delegates to `prost-reflect`'s serializer.
mod decode;
mod encode;

pub use decode::{DecodeError, DecodeErrorKind, decode, decode_value};
pub use encode::{EncodeError, encode, encode_to_vec};

/// Knobs for both directions of the codec. The defaults match the protobuf JSON mapping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CodecOptions {
    /// Emit fields holding their default value (`0`, `""`, `[]`...) in responses.
    pub emit_defaults: bool,
    /// Emit proto field names (`zip_code`) instead of JSON names (`zipCode`).
    pub use_proto_field_names: bool,
    /// Drop unknown request keys instead of rejecting them.
    pub ignore_unknown_fields: bool,
}
