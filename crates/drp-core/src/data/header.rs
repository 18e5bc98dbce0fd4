use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{DrpError, Result};

/// A single metadata value, mirroring the value types a FITS card can hold.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl HeaderValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Str(_) => "string",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl fmt::Display for HeaderValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{}", b),
            Self::Int(i) => write!(f, "{}", i),
            Self::Float(v) => write!(f, "{}", v),
            Self::Str(s) => write!(f, "{}", s),
        }
    }
}

impl From<&str> for HeaderValue {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<String> for HeaderValue {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<i64> for HeaderValue {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<i32> for HeaderValue {
    fn from(i: i32) -> Self {
        Self::Int(i as i64)
    }
}

impl From<f64> for HeaderValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<bool> for HeaderValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

/// Ordered key/value metadata attached to every data block.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Header {
    cards: IndexMap<String, HeaderValue>,
}

impl Header {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<HeaderValue>) {
        self.cards.insert(key.into(), value.into());
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<HeaderValue>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&HeaderValue> {
        self.cards.get(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<HeaderValue> {
        self.cards.shift_remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.cards.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.cards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cards.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &HeaderValue)> {
        self.cards.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.cards.keys()
    }

    /// Fetch a value, reporting `name` as the owner when the key is missing.
    pub fn require(&self, key: &str, name: &str) -> Result<&HeaderValue> {
        self.cards.get(key).ok_or_else(|| DrpError::MissingHeaderKey {
            key: key.to_string(),
            name: name.to_string(),
        })
    }

    pub fn get_str(&self, key: &str, name: &str) -> Result<&str> {
        let value = self.require(key, name)?;
        value.as_str().ok_or(DrpError::HeaderType {
            key: key.to_string(),
            expected: "string",
            found: value.type_name(),
        })
    }

    pub fn get_f64(&self, key: &str, name: &str) -> Result<f64> {
        let value = self.require(key, name)?;
        value.as_f64().ok_or(DrpError::HeaderType {
            key: key.to_string(),
            expected: "float",
            found: value.type_name(),
        })
    }

    pub fn get_i64(&self, key: &str, name: &str) -> Result<i64> {
        let value = self.require(key, name)?;
        value.as_i64().ok_or(DrpError::HeaderType {
            key: key.to_string(),
            expected: "int",
            found: value.type_name(),
        })
    }

    /// String form of a value regardless of its type, used for grouping and
    /// selection where header values are compared textually.
    pub fn get_text(&self, key: &str) -> Option<String> {
        self.cards.get(key).map(|v| v.to_string())
    }
}

impl FromIterator<(String, HeaderValue)> for Header {
    fn from_iter<I: IntoIterator<Item = (String, HeaderValue)>>(iter: I) -> Self {
        Self {
            cards: iter.into_iter().collect(),
        }
    }
}
