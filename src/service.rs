//! # Service
//!
//! Structured properties of live driver objects. Hook bodies only ever read and write small
//! values through [`Service`], the host provides the implementation.

use std::collections::BTreeMap;

/// A property value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// Raw bytes
    Data(Vec<u8>),
    /// A string
    String(String),
    /// A boolean
    Bool(bool),
    /// A nested dictionary
    Dict(BTreeMap<String, Value>),
}

impl Value {
    /// Returns the string if this is one
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the bytes if this is a data value
    pub fn as_data(&self) -> Option<&[u8]> {
        match self {
            Value::Data(d) => Some(d),
            _ => None,
        }
    }

    /// Returns the dictionary if this is one
    pub fn as_dict(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }
}

/// A live object in the host's service registry
pub trait Service {
    /// Reads a property
    fn property(&self, key: &str) -> Option<Value>;

    /// Writes a property, returning whether the host accepted it
    fn set_property(&mut self, key: &str, value: Value) -> bool;

    /// Removes a property
    fn remove_property(&mut self, key: &str);

    /// Reads a property of the parent object
    fn parent_property(&self, key: &str) -> Option<Value>;
}
