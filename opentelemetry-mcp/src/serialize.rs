//! Total JSON encoding of request payloads for span attributes.
//!
//! [`serialize`] never fails. It first encodes the value the way `serde_json`
//! would. If that fails (a map key that is not string-like, an integer wider
//! than 64 bits, a `Serialize` impl that errors, a reference cycle, or nesting
//! deeper than [`MAX_DEPTH`]) it walks the value again and rebuilds it field by
//! field:
//!
//! - primitive fields are kept as they are,
//! - any other field is encoded on its own and stored as a JSON string,
//! - fields that close a cycle or exceed the depth bound become [`TRUNCATED`],
//! - values whose `Serialize` impl fails before exposing a field become `{}`.
use serde::ser::{
    self, Serialize, SerializeMap, SerializeSeq, SerializeStruct, SerializeStructVariant,
    SerializeTuple, SerializeTupleStruct, SerializeTupleVariant, Serializer,
};
use serde_json::{Map, Number, Value};
use std::fmt;
use thiserror::Error;

/// Placeholder stored in place of a value that closes a cycle or exceeds the
/// nesting bound.
pub const TRUNCATED: &str = "<truncated>";

/// Maximum nesting level walked before a value is truncated.
pub const MAX_DEPTH: usize = 1024;

// Each reconstructed level is stored as a string inside its parent, so every
// level doubles the escaping of everything below it.
const MAX_FALLBACK_NESTING: usize = 8;

// Encoding recurses once per nesting level. When less than `RED_ZONE` is left
// on the current stack, the walk continues on a fresh `STACK_SEGMENT`.
const RED_ZONE: usize = 256 * 1024;
const STACK_SEGMENT: usize = 2 * 1024 * 1024;
// Stack reserved per level when rendering or dropping an encoded tree.
const RENDER_FRAME: usize = 1024;

/// Encode `value` as JSON text.
///
/// The returned string always parses as JSON.
pub fn serialize<T: Serialize + ?Sized>(value: &T) -> String {
    let mut walk = Walk::default();
    match walk.root(value, Mode::Strict) {
        Ok(encoded) => render(encoded),
        Err(_) => match walk.root(value, Mode::Lenient) {
            Ok(encoded) => render(encoded),
            Err(_) => "{}".to_owned(),
        },
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Mode {
    /// Fail on anything `serde_json` would reject, and on cycles and depth.
    Strict,
    /// Rebuild field by field, never failing on a field.
    Lenient,
}

impl Mode {
    fn truncated(self) -> Result<Value, SerializeError> {
        match self {
            Mode::Strict => Err(SerializeError::Truncated),
            Mode::Lenient => Ok(Value::String(TRUNCATED.to_owned())),
        }
    }
}

#[derive(Debug, Error)]
enum SerializeError {
    #[error("{0}")]
    Custom(String),
    #[error("map key must be a string, number or bool")]
    KeyMustBeString,
    #[error("integer {0} does not fit in 64 bits")]
    IntegerOverflow(String),
    #[error("cycle or nesting limit reached")]
    Truncated,
}

impl ser::Error for SerializeError {
    fn custom<T: fmt::Display>(msg: T) -> Self {
        SerializeError::Custom(msg.to_string())
    }
}

/// Address and type of a value on the active path.
type Identity = (usize, &'static str);

fn identity<T: ?Sized>(value: &T) -> Option<Identity> {
    // Zero sized values may share an address with anything.
    (std::mem::size_of_val(value) != 0)
        .then(|| (value as *const T as *const () as usize, std::any::type_name::<T>()))
}

/// Nesting depth of `value`, walked without recursion.
fn nesting(value: &Value) -> usize {
    let mut deepest = 0;
    let mut pending = vec![(value, 0)];
    while let Some((value, depth)) = pending.pop() {
        deepest = deepest.max(depth);
        match value {
            Value::Array(items) => pending.extend(items.iter().map(|item| (item, depth + 1))),
            Value::Object(map) => pending.extend(map.values().map(|item| (item, depth + 1))),
            _ => {}
        }
    }
    deepest
}

/// JSON text of `value`. The tree is also dropped on the reserved stack.
fn render(value: Value) -> String {
    let red_zone = RED_ZONE + nesting(&value) * RENDER_FRAME;
    stacker::maybe_grow(red_zone, red_zone + STACK_SEGMENT, move || value.to_string())
}

fn is_primitive(value: &Value) -> bool {
    matches!(
        value,
        Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_)
    )
}

/// State shared by every level of one encoding.
#[derive(Debug, Default)]
struct Walk {
    path: Vec<Identity>,
    fallbacks: usize,
}

impl Walk {
    fn root<T: Serialize + ?Sized>(
        &mut self,
        value: &T,
        mode: Mode,
    ) -> Result<Value, SerializeError> {
        self.enter(value, 0, mode, |walk| {
            value.serialize(ValueSerializer::new(walk, 0, mode))
        })
    }

    /// Encode a struct field, map value, sequence element or variant payload.
    fn field<T: Serialize + ?Sized>(
        &mut self,
        value: &T,
        depth: usize,
        mode: Mode,
    ) -> Result<Value, SerializeError> {
        let depth = depth + 1;
        self.enter(value, depth, mode, |walk| match mode {
            Mode::Strict => value.serialize(ValueSerializer::new(walk, depth, Mode::Strict)),
            Mode::Lenient => Ok(walk.lenient_field(value, depth)),
        })
    }

    /// Encode the content of an option or newtype in the current mode.
    fn nested<T: Serialize + ?Sized>(
        &mut self,
        value: &T,
        depth: usize,
        mode: Mode,
    ) -> Result<Value, SerializeError> {
        let depth = depth + 1;
        self.enter(value, depth, mode, |walk| {
            value.serialize(ValueSerializer::new(walk, depth, mode))
        })
    }

    fn key<T: Serialize + ?Sized>(
        &mut self,
        key: &T,
        depth: usize,
        mode: Mode,
    ) -> Result<String, SerializeError> {
        match (self.field(key, depth, Mode::Strict), mode) {
            (Ok(Value::String(key)), _) => Ok(key),
            (Ok(Value::Number(key)), _) => Ok(key.to_string()),
            (Ok(Value::Bool(key)), _) => Ok(key.to_string()),
            (Ok(_), Mode::Strict) => Err(SerializeError::KeyMustBeString),
            (Ok(key), Mode::Lenient) => Ok(render(key)),
            (Err(err), Mode::Strict) => Err(err),
            (Err(_), Mode::Lenient) => match self.reconstruct(key, depth + 1) {
                Value::String(key) => Ok(key),
                key => Ok(render(key)),
            },
        }
    }

    fn enter<T: ?Sized>(
        &mut self,
        value: &T,
        depth: usize,
        mode: Mode,
        encode: impl FnOnce(&mut Walk) -> Result<Value, SerializeError>,
    ) -> Result<Value, SerializeError> {
        let id = identity(value);
        if depth > MAX_DEPTH || id.is_some_and(|id| self.path.contains(&id)) {
            return mode.truncated();
        }

        if let Some(id) = id {
            self.path.push(id);
        }
        let result = stacker::maybe_grow(RED_ZONE, STACK_SEGMENT, || encode(self));
        if id.is_some() {
            self.path.pop();
        }
        result
    }

    fn lenient_field<T: Serialize + ?Sized>(&mut self, value: &T, depth: usize) -> Value {
        let encoded = match value.serialize(ValueSerializer::new(self, depth, Mode::Strict)) {
            Ok(encoded) => encoded,
            Err(_) => self.reconstruct(value, depth),
        };
        if is_primitive(&encoded) {
            encoded
        } else {
            Value::String(render(encoded))
        }
    }

    fn reconstruct<T: Serialize + ?Sized>(&mut self, value: &T, depth: usize) -> Value {
        if self.fallbacks >= MAX_FALLBACK_NESTING {
            return Value::String(TRUNCATED.to_owned());
        }

        self.fallbacks += 1;
        let encoded = value
            .serialize(ValueSerializer::new(self, depth, Mode::Lenient))
            .unwrap_or_else(|_| Value::Object(Map::new()));
        self.fallbacks -= 1;
        encoded
    }
}

struct ValueSerializer<'a> {
    walk: &'a mut Walk,
    depth: usize,
    mode: Mode,
}

impl<'a> ValueSerializer<'a> {
    fn new(walk: &'a mut Walk, depth: usize, mode: Mode) -> Self {
        ValueSerializer { walk, depth, mode }
    }

    fn overflow(self, text: String) -> Result<Value, SerializeError> {
        match self.mode {
            Mode::Strict => Err(SerializeError::IntegerOverflow(text)),
            Mode::Lenient => Ok(Value::String(text)),
        }
    }

    fn seq(self, len: Option<usize>) -> ValueSerializeSeq<'a> {
        ValueSerializeSeq {
            walk: self.walk,
            depth: self.depth,
            mode: self.mode,
            value: Vec::with_capacity(len.unwrap_or(0)),
        }
    }

    fn map(self) -> ValueSerializeMap<'a> {
        ValueSerializeMap {
            walk: self.walk,
            depth: self.depth,
            mode: self.mode,
            key: None,
            value: Map::new(),
        }
    }
}

struct ValueSerializeSeq<'a> {
    walk: &'a mut Walk,
    depth: usize,
    mode: Mode,
    value: Vec<Value>,
}

struct ValueSerializeTupleVariant<'a> {
    variant: &'static str,
    inner: ValueSerializeSeq<'a>,
}

struct ValueSerializeMap<'a> {
    walk: &'a mut Walk,
    depth: usize,
    mode: Mode,
    key: Option<String>,
    value: Map<String, Value>,
}

struct ValueSerializeStructVariant<'a> {
    variant: &'static str,
    inner: ValueSerializeMap<'a>,
}

fn tagged(variant: &'static str, value: Value) -> Value {
    let mut map = Map::new();
    map.insert(variant.to_owned(), value);
    Value::Object(map)
}

impl<'a> Serializer for ValueSerializer<'a> {
    type Ok = Value;

    type Error = SerializeError;

    type SerializeSeq = ValueSerializeSeq<'a>;

    type SerializeTuple = ValueSerializeSeq<'a>;

    type SerializeTupleStruct = ValueSerializeSeq<'a>;

    type SerializeTupleVariant = ValueSerializeTupleVariant<'a>;

    type SerializeMap = ValueSerializeMap<'a>;

    type SerializeStruct = ValueSerializeMap<'a>;

    type SerializeStructVariant = ValueSerializeStructVariant<'a>;

    fn serialize_bool(self, v: bool) -> Result<Self::Ok, Self::Error> {
        Ok(Value::Bool(v))
    }

    fn serialize_i8(self, v: i8) -> Result<Self::Ok, Self::Error> {
        self.serialize_i64(v as i64)
    }

    fn serialize_i16(self, v: i16) -> Result<Self::Ok, Self::Error> {
        self.serialize_i64(v as i64)
    }

    fn serialize_i32(self, v: i32) -> Result<Self::Ok, Self::Error> {
        self.serialize_i64(v as i64)
    }

    fn serialize_i64(self, v: i64) -> Result<Self::Ok, Self::Error> {
        Ok(Value::Number(v.into()))
    }

    fn serialize_i128(self, v: i128) -> Result<Self::Ok, Self::Error> {
        if let Ok(v) = i64::try_from(v) {
            self.serialize_i64(v)
        } else if let Ok(v) = u64::try_from(v) {
            self.serialize_u64(v)
        } else {
            self.overflow(v.to_string())
        }
    }

    fn serialize_u8(self, v: u8) -> Result<Self::Ok, Self::Error> {
        self.serialize_u64(v as u64)
    }

    fn serialize_u16(self, v: u16) -> Result<Self::Ok, Self::Error> {
        self.serialize_u64(v as u64)
    }

    fn serialize_u32(self, v: u32) -> Result<Self::Ok, Self::Error> {
        self.serialize_u64(v as u64)
    }

    fn serialize_u64(self, v: u64) -> Result<Self::Ok, Self::Error> {
        Ok(Value::Number(v.into()))
    }

    fn serialize_u128(self, v: u128) -> Result<Self::Ok, Self::Error> {
        if let Ok(v) = u64::try_from(v) {
            self.serialize_u64(v)
        } else {
            self.overflow(v.to_string())
        }
    }

    fn serialize_f32(self, v: f32) -> Result<Self::Ok, Self::Error> {
        self.serialize_f64(v as f64)
    }

    fn serialize_f64(self, v: f64) -> Result<Self::Ok, Self::Error> {
        // NaN and infinities have no JSON representation.
        Ok(Number::from_f64(v).map_or(Value::Null, Value::Number))
    }

    fn serialize_char(self, v: char) -> Result<Self::Ok, Self::Error> {
        Ok(Value::String(v.to_string()))
    }

    fn serialize_str(self, v: &str) -> Result<Self::Ok, Self::Error> {
        Ok(Value::String(v.to_owned()))
    }

    fn serialize_bytes(self, v: &[u8]) -> Result<Self::Ok, Self::Error> {
        Ok(Value::Array(
            v.iter().map(|byte| Value::Number((*byte).into())).collect(),
        ))
    }

    fn serialize_none(self) -> Result<Self::Ok, Self::Error> {
        Ok(Value::Null)
    }

    fn serialize_some<T: Serialize + ?Sized>(self, value: &T) -> Result<Self::Ok, Self::Error> {
        self.walk.nested(value, self.depth, self.mode)
    }

    fn serialize_unit(self) -> Result<Self::Ok, Self::Error> {
        Ok(Value::Null)
    }

    fn serialize_unit_struct(self, _: &'static str) -> Result<Self::Ok, Self::Error> {
        Ok(Value::Null)
    }

    fn serialize_unit_variant(
        self,
        _: &'static str,
        _: u32,
        variant: &'static str,
    ) -> Result<Self::Ok, Self::Error> {
        Ok(Value::String(variant.to_owned()))
    }

    fn serialize_newtype_struct<T: Serialize + ?Sized>(
        self,
        _: &'static str,
        value: &T,
    ) -> Result<Self::Ok, Self::Error> {
        self.walk.nested(value, self.depth, self.mode)
    }

    fn serialize_newtype_variant<T: Serialize + ?Sized>(
        self,
        _: &'static str,
        _: u32,
        variant: &'static str,
        value: &T,
    ) -> Result<Self::Ok, Self::Error> {
        let value = self.walk.field(value, self.depth, self.mode)?;
        Ok(tagged(variant, value))
    }

    fn serialize_seq(self, len: Option<usize>) -> Result<Self::SerializeSeq, Self::Error> {
        Ok(self.seq(len))
    }

    fn serialize_tuple(self, len: usize) -> Result<Self::SerializeTuple, Self::Error> {
        Ok(self.seq(Some(len)))
    }

    fn serialize_tuple_struct(
        self,
        _: &'static str,
        len: usize,
    ) -> Result<Self::SerializeTupleStruct, Self::Error> {
        Ok(self.seq(Some(len)))
    }

    fn serialize_tuple_variant(
        self,
        _: &'static str,
        _: u32,
        variant: &'static str,
        len: usize,
    ) -> Result<Self::SerializeTupleVariant, Self::Error> {
        Ok(ValueSerializeTupleVariant {
            variant,
            inner: self.seq(Some(len)),
        })
    }

    fn serialize_map(self, _: Option<usize>) -> Result<Self::SerializeMap, Self::Error> {
        Ok(self.map())
    }

    fn serialize_struct(
        self,
        _: &'static str,
        _: usize,
    ) -> Result<Self::SerializeStruct, Self::Error> {
        Ok(self.map())
    }

    fn serialize_struct_variant(
        self,
        _: &'static str,
        _: u32,
        variant: &'static str,
        _: usize,
    ) -> Result<Self::SerializeStructVariant, Self::Error> {
        Ok(ValueSerializeStructVariant {
            variant,
            inner: self.map(),
        })
    }
}

impl ValueSerializeSeq<'_> {
    fn push<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), SerializeError> {
        let value = self.walk.field(value, self.depth, self.mode)?;
        self.value.push(value);
        Ok(())
    }
}

impl SerializeSeq for ValueSerializeSeq<'_> {
    type Ok = Value;

    type Error = SerializeError;

    fn serialize_element<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), Self::Error> {
        self.push(value)
    }

    fn end(self) -> Result<Self::Ok, Self::Error> {
        Ok(Value::Array(self.value))
    }
}

impl SerializeTuple for ValueSerializeSeq<'_> {
    type Ok = Value;

    type Error = SerializeError;

    fn serialize_element<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), Self::Error> {
        self.push(value)
    }

    fn end(self) -> Result<Self::Ok, Self::Error> {
        Ok(Value::Array(self.value))
    }
}

impl SerializeTupleStruct for ValueSerializeSeq<'_> {
    type Ok = Value;

    type Error = SerializeError;

    fn serialize_field<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), Self::Error> {
        self.push(value)
    }

    fn end(self) -> Result<Self::Ok, Self::Error> {
        Ok(Value::Array(self.value))
    }
}

impl SerializeTupleVariant for ValueSerializeTupleVariant<'_> {
    type Ok = Value;

    type Error = SerializeError;

    fn serialize_field<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), Self::Error> {
        self.inner.push(value)
    }

    fn end(self) -> Result<Self::Ok, Self::Error> {
        Ok(tagged(self.variant, Value::Array(self.inner.value)))
    }
}

impl ValueSerializeMap<'_> {
    fn insert<T: Serialize + ?Sized>(
        &mut self,
        key: String,
        value: &T,
    ) -> Result<(), SerializeError> {
        let value = self.walk.field(value, self.depth, self.mode)?;
        self.value.insert(key, value);
        Ok(())
    }
}

impl SerializeMap for ValueSerializeMap<'_> {
    type Ok = Value;

    type Error = SerializeError;

    fn serialize_key<T: Serialize + ?Sized>(&mut self, key: &T) -> Result<(), Self::Error> {
        self.key = Some(self.walk.key(key, self.depth, self.mode)?);
        Ok(())
    }

    fn serialize_value<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), Self::Error> {
        let key = self
            .key
            .take()
            .ok_or_else(|| <SerializeError as ser::Error>::custom("missing key"))?;
        self.insert(key, value)
    }

    fn end(self) -> Result<Self::Ok, Self::Error> {
        Ok(Value::Object(self.value))
    }
}

impl SerializeStruct for ValueSerializeMap<'_> {
    type Ok = Value;

    type Error = SerializeError;

    fn serialize_field<T: Serialize + ?Sized>(
        &mut self,
        key: &'static str,
        value: &T,
    ) -> Result<(), Self::Error> {
        self.insert(key.to_owned(), value)
    }

    fn end(self) -> Result<Self::Ok, Self::Error> {
        Ok(Value::Object(self.value))
    }
}

impl SerializeStructVariant for ValueSerializeStructVariant<'_> {
    type Ok = Value;

    type Error = SerializeError;

    fn serialize_field<T: Serialize + ?Sized>(
        &mut self,
        key: &'static str,
        value: &T,
    ) -> Result<(), Self::Error> {
        self.inner.insert(key.to_owned(), value)
    }

    fn end(self) -> Result<Self::Ok, Self::Error> {
        Ok(tagged(self.variant, Value::Object(self.inner.value)))
    }
}
