//! Extensible JSON codec.
//!
//! DDP frames are JSON text extended with out-of-band type discriminators for
//! values plain JSON cannot carry:
//!
//! - `{"$date": <ms since epoch>}` for timestamps
//! - `{"$binary": "<base64>"}` for byte strings
//! - `{"$type": "<name>", "$value": <json>}` for application-registered types
//! - `{"$escape": {...}}` for plain objects that happen to look like one of the
//!   shapes above
//!
//! Custom types are resolved through an explicit [`TypeRegistry`] built before
//! any session opens. Decoding an unregistered `$type` is an error, never a
//! silent pass-through.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use thiserror::Error;

const DATE_KEY: &str = "$date";
const BINARY_KEY: &str = "$binary";
const TYPE_KEY: &str = "$type";
const VALUE_KEY: &str = "$value";
const ESCAPE_KEY: &str = "$escape";

/// Object map used by [`Ejson::Object`]. Keys are kept sorted so encoding is
/// deterministic.
pub type EjsonMap = BTreeMap<String, Ejson>;

/// A decoded extensible-JSON value.
#[derive(Clone, Debug, PartialEq)]
pub enum Ejson {
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    Array(Vec<Ejson>),
    Object(EjsonMap),
    Date(DateTime<Utc>),
    Binary(Vec<u8>),
    Custom(CustomValue),
}

impl Ejson {
    /// Builds an empty object.
    pub fn object() -> Self {
        Ejson::Object(EjsonMap::new())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Ejson::String(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&EjsonMap> {
        match self {
            Ejson::Object(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Ejson]> {
        match self {
            Ejson::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Ejson::Number(number) => number.as_i64(),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Ejson::Null)
    }

    /// Looks up a key when `self` is an object.
    pub fn get(&self, key: &str) -> Option<&Ejson> {
        self.as_object().and_then(|map| map.get(key))
    }

    /// Inserts a key when `self` is an object; other variants are left alone.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Ejson>) -> Self {
        if let Ejson::Object(map) = &mut self {
            map.insert(key.into(), value.into());
        }
        self
    }
}

impl From<&str> for Ejson {
    fn from(value: &str) -> Self {
        Ejson::String(value.to_string())
    }
}

impl From<String> for Ejson {
    fn from(value: String) -> Self {
        Ejson::String(value)
    }
}

impl From<bool> for Ejson {
    fn from(value: bool) -> Self {
        Ejson::Bool(value)
    }
}

impl From<i64> for Ejson {
    fn from(value: i64) -> Self {
        Ejson::Number(value.into())
    }
}

impl From<u64> for Ejson {
    fn from(value: u64) -> Self {
        Ejson::Number(value.into())
    }
}

impl From<DateTime<Utc>> for Ejson {
    fn from(value: DateTime<Utc>) -> Self {
        Ejson::Date(value)
    }
}

impl From<Vec<Ejson>> for Ejson {
    fn from(value: Vec<Ejson>) -> Self {
        Ejson::Array(value)
    }
}

impl From<EjsonMap> for Ejson {
    fn from(value: EjsonMap) -> Self {
        Ejson::Object(value)
    }
}

/// Instance of an application-registered type.
///
/// Equality is identity: two values are equal when they share the same
/// allocation and type name.
#[derive(Clone)]
pub struct CustomValue {
    type_name: String,
    value: Arc<dyn Any + Send + Sync>,
}

impl CustomValue {
    pub fn new<T>(type_name: impl Into<String>, value: T) -> Self
    where
        T: Any + Send + Sync,
    {
        Self {
            type_name: type_name.into(),
            value: Arc::new(value),
        }
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }
}

impl fmt::Debug for CustomValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustomValue")
            .field("type_name", &self.type_name)
            .finish_non_exhaustive()
    }
}

impl PartialEq for CustomValue {
    fn eq(&self, other: &Self) -> bool {
        self.type_name == other.type_name && Arc::ptr_eq(&self.value, &other.value)
    }
}

/// Errors produced while encoding or decoding extensible JSON.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unregistered custom type: {0}")]
    UnknownType(String),

    #[error("custom type {type_name} is already registered")]
    DuplicateType { type_name: String },

    #[error("value does not match registered type {type_name}")]
    TypeMismatch { type_name: String },

    #[error("failed to reconstruct custom type {type_name}: {message}")]
    CustomDecode { type_name: String, message: String },

    #[error("invalid $date value: {0}")]
    InvalidDate(String),

    #[error("invalid $binary value: {0}")]
    InvalidBinary(String),
}

type EncodeFn = Box<dyn Fn(&(dyn Any + Send + Sync)) -> Option<Value> + Send + Sync>;
type DecodeFn = Box<dyn Fn(&Value) -> Result<Arc<dyn Any + Send + Sync>, String> + Send + Sync>;

struct TypeEntry {
    encode: EncodeFn,
    decode: DecodeFn,
}

/// Explicit mapping from `$type` tag to an encode/decode function pair.
#[derive(Default)]
pub struct TypeRegistry {
    types: HashMap<String, TypeEntry>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a custom type under `type_name`.
    ///
    /// `encode` must be deterministic; `decode` reconstructs the value from the
    /// JSON produced by `encode`.
    pub fn register<T, E, D>(
        &mut self,
        type_name: impl Into<String>,
        encode: E,
        decode: D,
    ) -> Result<(), CodecError>
    where
        T: Any + Send + Sync,
        E: Fn(&T) -> Value + Send + Sync + 'static,
        D: Fn(&Value) -> Result<T, String> + Send + Sync + 'static,
    {
        let type_name = type_name.into();
        if self.types.contains_key(&type_name) {
            return Err(CodecError::DuplicateType { type_name });
        }

        let entry = TypeEntry {
            encode: Box::new(move |value| value.downcast_ref::<T>().map(&encode)),
            decode: Box::new(move |json| {
                decode(json).map(|value| Arc::new(value) as Arc<dyn Any + Send + Sync>)
            }),
        };
        self.types.insert(type_name, entry);
        Ok(())
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.types.contains_key(type_name)
    }

    fn encode(&self, value: &CustomValue) -> Result<Value, CodecError> {
        let entry = self
            .types
            .get(value.type_name())
            .ok_or_else(|| CodecError::UnknownType(value.type_name().to_string()))?;
        (entry.encode)(value.value.as_ref()).ok_or_else(|| CodecError::TypeMismatch {
            type_name: value.type_name().to_string(),
        })
    }

    fn decode(&self, type_name: &str, json: &Value) -> Result<CustomValue, CodecError> {
        let entry = self
            .types
            .get(type_name)
            .ok_or_else(|| CodecError::UnknownType(type_name.to_string()))?;
        let value = (entry.decode)(json).map_err(|message| CodecError::CustomDecode {
            type_name: type_name.to_string(),
            message,
        })?;
        Ok(CustomValue {
            type_name: type_name.to_string(),
            value,
        })
    }
}

impl fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.types.keys().collect();
        names.sort();
        f.debug_struct("TypeRegistry").field("types", &names).finish()
    }
}

/// Text codec shared by every session of a client.
#[derive(Clone, Debug, Default)]
pub struct Codec {
    registry: Arc<TypeRegistry>,
}

impl Codec {
    pub fn new(registry: Arc<TypeRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    /// Encodes a value into one text frame.
    pub fn encode(&self, value: &Ejson) -> Result<String, CodecError> {
        let json = self.to_json_value(value)?;
        Ok(serde_json::to_string(&json)?)
    }

    /// Decodes one text frame.
    pub fn decode(&self, text: &str) -> Result<Ejson, CodecError> {
        let json: Value = serde_json::from_str(text)?;
        self.from_json_value(&json)
    }

    pub fn to_json_value(&self, value: &Ejson) -> Result<Value, CodecError> {
        Ok(match value {
            Ejson::Null => Value::Null,
            Ejson::Bool(flag) => Value::Bool(*flag),
            Ejson::Number(number) => Value::Number(number.clone()),
            Ejson::String(text) => Value::String(text.clone()),
            Ejson::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| self.to_json_value(item))
                    .collect::<Result<_, _>>()?,
            ),
            Ejson::Object(map) => {
                let mut out = Map::new();
                for (key, item) in map {
                    out.insert(key.clone(), self.to_json_value(item)?);
                }
                if looks_reserved(map.keys().map(String::as_str)) {
                    let mut escaped = Map::new();
                    escaped.insert(ESCAPE_KEY.to_string(), Value::Object(out));
                    Value::Object(escaped)
                } else {
                    Value::Object(out)
                }
            }
            Ejson::Date(date) => single_key(DATE_KEY, Value::from(date.timestamp_millis())),
            Ejson::Binary(bytes) => single_key(BINARY_KEY, Value::from(BASE64_STANDARD.encode(bytes))),
            Ejson::Custom(custom) => {
                let encoded = self.registry.encode(custom)?;
                let mut out = Map::new();
                out.insert(TYPE_KEY.to_string(), Value::from(custom.type_name()));
                out.insert(VALUE_KEY.to_string(), encoded);
                Value::Object(out)
            }
        })
    }

    pub fn from_json_value(&self, json: &Value) -> Result<Ejson, CodecError> {
        Ok(match json {
            Value::Null => Ejson::Null,
            Value::Bool(flag) => Ejson::Bool(*flag),
            Value::Number(number) => Ejson::Number(number.clone()),
            Value::String(text) => Ejson::String(text.clone()),
            Value::Array(items) => Ejson::Array(
                items
                    .iter()
                    .map(|item| self.from_json_value(item))
                    .collect::<Result<_, _>>()?,
            ),
            Value::Object(map) => self.revive_object(map)?,
        })
    }

    fn revive_object(&self, map: &Map<String, Value>) -> Result<Ejson, CodecError> {
        if map.len() == 1 {
            if let Some(raw) = map.get(DATE_KEY) {
                return decode_date(raw).map(Ejson::Date);
            }
            if let Some(raw) = map.get(BINARY_KEY) {
                return decode_binary(raw).map(Ejson::Binary);
            }
            if let Some(Value::Object(inner)) = map.get(ESCAPE_KEY) {
                let mut out = EjsonMap::new();
                for (key, item) in inner {
                    out.insert(key.clone(), self.from_json_value(item)?);
                }
                return Ok(Ejson::Object(out));
            }
        }
        if map.len() == 2 {
            if let (Some(Value::String(type_name)), Some(raw)) =
                (map.get(TYPE_KEY), map.get(VALUE_KEY))
            {
                return self.registry.decode(type_name, raw).map(Ejson::Custom);
            }
        }

        let mut out = EjsonMap::new();
        for (key, item) in map {
            out.insert(key.clone(), self.from_json_value(item)?);
        }
        Ok(Ejson::Object(out))
    }
}

fn single_key(key: &str, value: Value) -> Value {
    let mut out = Map::new();
    out.insert(key.to_string(), value);
    Value::Object(out)
}

fn looks_reserved<'a>(keys: impl Iterator<Item = &'a str>) -> bool {
    let keys: Vec<&str> = keys.collect();
    match keys.as_slice() {
        [only] => matches!(*only, DATE_KEY | BINARY_KEY | ESCAPE_KEY),
        [first, second] => {
            (*first == TYPE_KEY && *second == VALUE_KEY)
                || (*first == VALUE_KEY && *second == TYPE_KEY)
        }
        _ => false,
    }
}

fn decode_date(raw: &Value) -> Result<DateTime<Utc>, CodecError> {
    let millis = raw
        .as_i64()
        .or_else(|| raw.as_f64().filter(|ms| ms.is_finite()).map(|ms| ms as i64))
        .ok_or_else(|| CodecError::InvalidDate(raw.to_string()))?;
    DateTime::<Utc>::from_timestamp_millis(millis)
        .ok_or_else(|| CodecError::InvalidDate(raw.to_string()))
}

fn decode_binary(raw: &Value) -> Result<Vec<u8>, CodecError> {
    let text = raw
        .as_str()
        .ok_or_else(|| CodecError::InvalidBinary(raw.to_string()))?;
    BASE64_STANDARD
        .decode(text)
        .map_err(|err| CodecError::InvalidBinary(err.to_string()))
}
