use std::collections::BTreeMap;

use bytes::Bytes;

/// A decoded bencode value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Integer(i64),
    /// Byte strings are opaque, they may or may not be UTF-8.
    Bytes(Bytes),
    List(Vec<Value>),
    /// Keys are kept sorted as raw byte strings, so encoding is canonical.
    Dict(BTreeMap<Bytes, Value>),
    /// Already encoded bytes, emitted verbatim. Never produced by the
    /// decoder.
    Cached(Bencached),
}

impl Value {
    pub fn string(s: impl Into<String>) -> Self {
        Value::Bytes(Bytes::from(s.into()))
    }

    pub fn dict() -> Self {
        Value::Dict(BTreeMap::new())
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// The byte string as UTF-8, if it is one.
    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|b| std::str::from_utf8(b).ok())
    }

    pub fn as_list(&self) -> Option<&Vec<Value>> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Bytes, Value>> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_dict_mut(&mut self) -> Option<&mut BTreeMap<Bytes, Value>> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Look up a key if this is a dictionary.
    pub fn get(&self, key: &[u8]) -> Option<&Value> {
        self.as_dict().and_then(|d| d.get(key))
    }

    /// Insert into a dictionary, ignored for other variants.
    pub fn insert(&mut self, key: &[u8], value: impl Into<Value>) {
        if let Value::Dict(d) = self {
            d.insert(Bytes::copy_from_slice(key), value.into());
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

impl From<u64> for Value {
    fn from(value: u64) -> Self {
        Value::Integer(value as i64)
    }
}

impl From<u32> for Value {
    fn from(value: u32) -> Self {
        Value::Integer(value as i64)
    }
}

impl From<u16> for Value {
    fn from(value: u16) -> Self {
        Value::Integer(value as i64)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Bytes(Bytes::copy_from_slice(value.as_bytes()))
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Bytes(Bytes::from(value))
    }
}

impl From<&[u8]> for Value {
    fn from(value: &[u8]) -> Self {
        Value::Bytes(Bytes::copy_from_slice(value))
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Value::Bytes(Bytes::from(value))
    }
}

impl From<Bytes> for Value {
    fn from(value: Bytes) -> Self {
        Value::Bytes(value)
    }
}

impl From<Vec<Value>> for Value {
    fn from(value: Vec<Value>) -> Self {
        Value::List(value)
    }
}

impl From<Bencached> for Value {
    fn from(value: Bencached) -> Self {
        Value::Cached(value)
    }
}

/// Pre-encoded bencode, cheap to clone and splice into other values.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Bencached(Bytes);

impl Bencached {
    pub fn new(value: &Value) -> Self {
        Self(Bytes::from(super::encode(value)))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
