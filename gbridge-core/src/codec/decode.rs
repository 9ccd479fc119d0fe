use super::CodecOptions;
use base64::Engine;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use prost::bytes::Bytes;
use prost_reflect::{
    DeserializeOptions, DynamicMessage, EnumDescriptor, FieldDescriptor, Kind, MapKey,
    MessageDescriptor, Value as ProtoValue,
};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt::Write;
use std::num::{IntErrorKind, ParseIntError};
use std::str::FromStr;

/// Messages with a special JSON representation, decoded by `prost-reflect` itself.
const WELL_KNOWN_TYPES: &[&str] = &[
    "google.protobuf.Any",
    "google.protobuf.BoolValue",
    "google.protobuf.BytesValue",
    "google.protobuf.DoubleValue",
    "google.protobuf.Duration",
    "google.protobuf.Empty",
    "google.protobuf.FieldMask",
    "google.protobuf.FloatValue",
    "google.protobuf.Int32Value",
    "google.protobuf.Int64Value",
    "google.protobuf.ListValue",
    "google.protobuf.StringValue",
    "google.protobuf.Struct",
    "google.protobuf.Timestamp",
    "google.protobuf.UInt32Value",
    "google.protobuf.UInt64Value",
    "google.protobuf.Value",
];

/// The reason a request body could not be turned into a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DecodeErrorKind {
    /// The body is not valid JSON.
    InvalidJson,
    /// The body is valid JSON but not an object.
    ExpectedObject,
    UnknownField,
    /// The same field was given under its proto name and its JSON name.
    DuplicateField,
    /// More than one member of a `oneof` was set.
    OneofConflict,
    /// The JSON type cannot represent the field (e.g. a string for a `bool`).
    TypeMismatch,
    InvalidValue,
    OutOfRange,
    UnknownEnumValue,
}

impl DecodeErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecodeErrorKind::InvalidJson => "InvalidJson",
            DecodeErrorKind::ExpectedObject => "ExpectedObject",
            DecodeErrorKind::UnknownField => "UnknownField",
            DecodeErrorKind::DuplicateField => "DuplicateField",
            DecodeErrorKind::OneofConflict => "OneofConflict",
            DecodeErrorKind::TypeMismatch => "TypeMismatch",
            DecodeErrorKind::InvalidValue => "InvalidValue",
            DecodeErrorKind::OutOfRange => "OutOfRange",
            DecodeErrorKind::UnknownEnumValue => "UnknownEnumValue",
        }
    }
}

impl std::fmt::Display for DecodeErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request body that does not fit the message schema.
///
/// `path` locates the offending value (e.g. `profile.tags[2]` or `labels["env"]`) and is empty
/// when the problem is the body as a whole.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{}{}", location(.path), .message)]
pub struct DecodeError {
    pub path: String,
    pub kind: DecodeErrorKind,
    pub message: String,
}

fn location(path: &str) -> String {
    if path.is_empty() {
        String::new()
    } else {
        format!("{path}: ")
    }
}

impl DecodeError {
    fn root(kind: DecodeErrorKind, message: impl Into<String>) -> Self {
        Self {
            path: String::new(),
            kind,
            message: message.into(),
        }
    }
}

/// Decodes a JSON request body into a message of type `desc`.
///
/// An empty (or whitespace-only) body is treated as `{}`.
pub fn decode(
    body: &[u8],
    desc: &MessageDescriptor,
    options: &CodecOptions,
) -> Result<DynamicMessage, DecodeError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return decode_value(&Value::Object(Map::new()), desc, options);
    }

    let value: Value = serde_json::from_slice(body)
        .map_err(|e| DecodeError::root(DecodeErrorKind::InvalidJson, format!("Invalid JSON: {e}")))?;

    decode_value(&value, desc, options)
}

/// Decodes an already parsed JSON value, which must be an object.
pub fn decode_value(
    value: &Value,
    desc: &MessageDescriptor,
    options: &CodecOptions,
) -> Result<DynamicMessage, DecodeError> {
    if !value.is_object() {
        return Err(DecodeError::root(
            DecodeErrorKind::ExpectedObject,
            format!("Expected a JSON object, found {}", json_type(value)),
        ));
    }

    Decoder {
        options,
        path: Vec::new(),
    }
    .message(value, desc)
}

enum Segment {
    Field(String),
    Index(usize),
    Key(String),
}

struct Decoder<'a> {
    options: &'a CodecOptions,
    path: Vec<Segment>,
}

impl Decoder<'_> {
    fn message(
        &mut self,
        value: &Value,
        desc: &MessageDescriptor,
    ) -> Result<DynamicMessage, DecodeError> {
        if WELL_KNOWN_TYPES.contains(&desc.full_name()) {
            return self.well_known(value, desc);
        }

        let Value::Object(object) = value else {
            return Err(self.mismatch(&format!("an object for '{}'", desc.full_name()), value));
        };

        let mut message = DynamicMessage::new(desc.clone());
        let mut seen: HashMap<u32, &str> = HashMap::new();
        let mut oneofs: HashMap<String, &str> = HashMap::new();

        for (key, value) in object {
            let Some(field) = desc
                .get_field_by_json_name(key)
                .or_else(|| desc.get_field_by_name(key))
            else {
                if self.options.ignore_unknown_fields {
                    continue;
                }
                return self.nested(Segment::Field(key.clone()), |d| {
                    Err(d.error(
                        DecodeErrorKind::UnknownField,
                        format!("Unknown field '{key}' in message '{}'", desc.full_name()),
                    ))
                });
            };

            if let Some(previous) = seen.insert(field.number(), key) {
                return self.nested(Segment::Field(key.clone()), |d| {
                    Err(d.error(
                        DecodeErrorKind::DuplicateField,
                        format!("Field '{}' is already set by '{previous}'", field.name()),
                    ))
                });
            }

            let decoded = self.nested(Segment::Field(key.clone()), |d| d.field(value, &field))?;
            // `null` leaves the field unset.
            let Some(decoded) = decoded else {
                continue;
            };

            if let Some(oneof) = field.containing_oneof().filter(|o| !o.is_synthetic())
                && let Some(other) = oneofs.insert(oneof.name().to_string(), key)
            {
                return self.nested(Segment::Field(key.clone()), |d| {
                    Err(d.error(
                        DecodeErrorKind::OneofConflict,
                        format!("'{other}' is already set in oneof '{}'", oneof.name()),
                    ))
                });
            }

            message.try_set_field(&field, decoded).map_err(|e| {
                let mut err = self.error(DecodeErrorKind::InvalidValue, e.to_string());
                push_path(&mut err.path, &Segment::Field(key.clone()));
                err
            })?;
        }

        Ok(message)
    }

    /// `Ok(None)` means the field is absent.
    fn field(
        &mut self,
        value: &Value,
        field: &FieldDescriptor,
    ) -> Result<Option<ProtoValue>, DecodeError> {
        if field.is_map() {
            return match value {
                Value::Null => Ok(None),
                Value::Object(entries) => self.map(entries, field).map(Some),
                other => Err(self.mismatch("an object", other)),
            };
        }

        if field.is_list() {
            return match value {
                Value::Null => Ok(None),
                Value::Array(items) => self.list(items, &field.kind()).map(Some),
                other => Err(self.mismatch("an array", other)),
            };
        }

        if value.is_null() && !accepts_null(&field.kind()) {
            return Ok(None);
        }

        self.singular(value, &field.kind()).map(Some)
    }

    fn list(&mut self, items: &[Value], kind: &Kind) -> Result<ProtoValue, DecodeError> {
        let mut values = Vec::with_capacity(items.len());

        for (index, item) in items.iter().enumerate() {
            let value = self.nested(Segment::Index(index), |d| {
                if item.is_null() && !accepts_null(kind) {
                    return Err(d.error(
                        DecodeErrorKind::InvalidValue,
                        "null is not allowed inside a repeated field",
                    ));
                }
                d.singular(item, kind)
            })?;
            values.push(value);
        }

        Ok(ProtoValue::List(values))
    }

    fn map(
        &mut self,
        entries: &Map<String, Value>,
        field: &FieldDescriptor,
    ) -> Result<ProtoValue, DecodeError> {
        let Kind::Message(entry) = field.kind() else {
            return Err(self.error(
                DecodeErrorKind::InvalidValue,
                format!("Map field '{}' has no entry type", field.name()),
            ));
        };
        let key_kind = entry.map_entry_key_field().kind();
        let value_kind = entry.map_entry_value_field().kind();

        let mut map = HashMap::with_capacity(entries.len());
        for (key, value) in entries {
            let (key, value) = self.nested(Segment::Key(key.clone()), |d| {
                let key = d.map_key(key, &key_kind)?;
                if value.is_null() && !accepts_null(&value_kind) {
                    return Err(d.error(DecodeErrorKind::InvalidValue, "null is not allowed as a map value"));
                }
                Ok((key, d.singular(value, &value_kind)?))
            })?;
            map.insert(key, value);
        }

        Ok(ProtoValue::Map(map))
    }

    fn map_key(&self, key: &str, kind: &Kind) -> Result<MapKey, DecodeError> {
        match kind {
            Kind::Bool => match key {
                "true" => Ok(MapKey::Bool(true)),
                "false" => Ok(MapKey::Bool(false)),
                _ => Err(self.error(
                    DecodeErrorKind::InvalidValue,
                    format!("Invalid bool map key '{key}'"),
                )),
            },
            Kind::Int32 | Kind::Sint32 | Kind::Sfixed32 => self.parse_integer(key).map(MapKey::I32),
            Kind::Int64 | Kind::Sint64 | Kind::Sfixed64 => self.parse_integer(key).map(MapKey::I64),
            Kind::Uint32 | Kind::Fixed32 => self.parse_integer(key).map(MapKey::U32),
            Kind::Uint64 | Kind::Fixed64 => self.parse_integer(key).map(MapKey::U64),
            Kind::String => Ok(MapKey::String(key.to_string())),
            other => Err(self.error(
                DecodeErrorKind::InvalidValue,
                format!("Unsupported map key type {other:?}"),
            )),
        }
    }

    fn singular(&mut self, value: &Value, kind: &Kind) -> Result<ProtoValue, DecodeError> {
        match kind {
            Kind::Double => self.float(value).map(ProtoValue::F64),
            Kind::Float => {
                let float = self.float(value)?;
                if float.is_finite() && (float > f32::MAX as f64 || float < f32::MIN as f64) {
                    return Err(self.error(
                        DecodeErrorKind::OutOfRange,
                        format!("{float} does not fit in a float"),
                    ));
                }
                Ok(ProtoValue::F32(float as f32))
            }
            Kind::Int32 | Kind::Sint32 | Kind::Sfixed32 => self.integer(value).map(ProtoValue::I32),
            Kind::Int64 | Kind::Sint64 | Kind::Sfixed64 => self.integer(value).map(ProtoValue::I64),
            Kind::Uint32 | Kind::Fixed32 => self.integer(value).map(ProtoValue::U32),
            Kind::Uint64 | Kind::Fixed64 => self.integer(value).map(ProtoValue::U64),
            Kind::Bool => match value {
                Value::Bool(b) => Ok(ProtoValue::Bool(*b)),
                other => Err(self.mismatch("a boolean", other)),
            },
            Kind::String => match value {
                Value::String(s) => Ok(ProtoValue::String(s.clone())),
                other => Err(self.mismatch("a string", other)),
            },
            Kind::Bytes => match value {
                Value::String(s) => self.bytes(s).map(ProtoValue::Bytes),
                other => Err(self.mismatch("a base64 string", other)),
            },
            Kind::Enum(desc) => self.enumeration(value, desc),
            Kind::Message(desc) => self.message(value, desc).map(ProtoValue::Message),
        }
    }

    fn integer<T>(&self, value: &Value) -> Result<T, DecodeError>
    where
        T: TryFrom<i64> + TryFrom<u64> + FromStr<Err = ParseIntError>,
    {
        let out_of_range = || {
            self.error(
                DecodeErrorKind::OutOfRange,
                format!("{value} is out of range for {}", std::any::type_name::<T>()),
            )
        };

        match value {
            Value::Number(n) => {
                if let Some(int) = n.as_i64() {
                    return <T as TryFrom<i64>>::try_from(int).map_err(|_| out_of_range());
                }
                if let Some(uint) = n.as_u64() {
                    return <T as TryFrom<u64>>::try_from(uint).map_err(|_| out_of_range());
                }

                let float = n.as_f64().unwrap_or(f64::NAN);
                if float.fract() != 0.0 || !float.is_finite() {
                    return Err(self.error(
                        DecodeErrorKind::InvalidValue,
                        format!("{n} is not an integer"),
                    ));
                }
                // Integral values written with an exponent or a fraction (e.g. `1e3`, `2.0`).
                if float >= i64::MIN as f64 && float < i64::MAX as f64 {
                    <T as TryFrom<i64>>::try_from(float as i64).map_err(|_| out_of_range())
                } else if float >= 0.0 && float < u64::MAX as f64 {
                    <T as TryFrom<u64>>::try_from(float as u64).map_err(|_| out_of_range())
                } else {
                    Err(out_of_range())
                }
            }
            Value::String(s) => self.parse_integer(s),
            other => Err(self.mismatch("an integer", other)),
        }
    }

    fn parse_integer<T: FromStr<Err = ParseIntError>>(&self, s: &str) -> Result<T, DecodeError> {
        s.parse().map_err(|e: ParseIntError| match e.kind() {
            IntErrorKind::PosOverflow | IntErrorKind::NegOverflow => self.error(
                DecodeErrorKind::OutOfRange,
                format!("'{s}' is out of range for {}", std::any::type_name::<T>()),
            ),
            _ => self.error(DecodeErrorKind::InvalidValue, format!("'{s}' is not an integer")),
        })
    }

    fn float(&self, value: &Value) -> Result<f64, DecodeError> {
        match value {
            Value::Number(n) => n.as_f64().ok_or_else(|| {
                self.error(DecodeErrorKind::InvalidValue, format!("{n} is not a number"))
            }),
            Value::String(s) => match s.as_str() {
                "NaN" => Ok(f64::NAN),
                "Infinity" => Ok(f64::INFINITY),
                "-Infinity" => Ok(f64::NEG_INFINITY),
                other => other
                    .parse::<f64>()
                    .ok()
                    .filter(|f| f.is_finite())
                    .ok_or_else(|| {
                        self.error(DecodeErrorKind::InvalidValue, format!("'{other}' is not a number"))
                    }),
            },
            other => Err(self.mismatch("a number", other)),
        }
    }

    fn bytes(&self, s: &str) -> Result<Bytes, DecodeError> {
        [STANDARD, URL_SAFE, STANDARD_NO_PAD, URL_SAFE_NO_PAD]
            .iter()
            .find_map(|engine| engine.decode(s).ok())
            .map(Bytes::from)
            .ok_or_else(|| self.error(DecodeErrorKind::InvalidValue, "Invalid base64 string"))
    }

    fn enumeration(&self, value: &Value, desc: &EnumDescriptor) -> Result<ProtoValue, DecodeError> {
        match value {
            Value::Null if desc.full_name() == "google.protobuf.NullValue" => {
                Ok(ProtoValue::EnumNumber(0))
            }
            Value::String(name) => desc
                .get_value_by_name(name)
                .map(|v| ProtoValue::EnumNumber(v.number()))
                .ok_or_else(|| {
                    self.error(
                        DecodeErrorKind::UnknownEnumValue,
                        format!("'{name}' is not a value of enum '{}'", desc.full_name()),
                    )
                }),
            Value::Number(_) => self.integer(value).map(ProtoValue::EnumNumber),
            other => Err(self.mismatch("an enum name or number", other)),
        }
    }

    fn well_known(
        &self,
        value: &Value,
        desc: &MessageDescriptor,
    ) -> Result<DynamicMessage, DecodeError> {
        let options =
            DeserializeOptions::new().deny_unknown_fields(!self.options.ignore_unknown_fields);

        DynamicMessage::deserialize_with_options(desc.clone(), value, &options).map_err(|e| {
            self.error(
                DecodeErrorKind::InvalidValue,
                format!("Invalid value for '{}': {e}", desc.full_name()),
            )
        })
    }

    /// Runs `f` with `segment` appended to the current path.
    fn nested<T>(
        &mut self,
        segment: Segment,
        f: impl FnOnce(&mut Self) -> Result<T, DecodeError>,
    ) -> Result<T, DecodeError> {
        self.path.push(segment);
        let result = f(self);
        self.path.pop();
        result
    }

    fn error(&self, kind: DecodeErrorKind, message: impl Into<String>) -> DecodeError {
        let mut path = String::new();
        for segment in &self.path {
            push_path(&mut path, segment);
        }
        DecodeError {
            path,
            kind,
            message: message.into(),
        }
    }

    fn mismatch(&self, expected: &str, found: &Value) -> DecodeError {
        self.error(
            DecodeErrorKind::TypeMismatch,
            format!("Expected {expected}, found {}", json_type(found)),
        )
    }
}

fn push_path(path: &mut String, segment: &Segment) {
    // Writing to a String cannot fail.
    let _ = match segment {
        Segment::Field(name) if path.is_empty() => write!(path, "{name}"),
        Segment::Field(name) => write!(path, ".{name}"),
        Segment::Index(index) => write!(path, "[{index}]"),
        Segment::Key(key) => write!(path, "[{key:?}]"),
    };
}

fn accepts_null(kind: &Kind) -> bool {
    match kind {
        Kind::Message(desc) => desc.full_name() == "google.protobuf.Value",
        Kind::Enum(desc) => desc.full_name() == "google.protobuf.NullValue",
        _ => false,
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
