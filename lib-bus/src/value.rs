//! Tagged value model for the typed object bus.
//!
//! Replaces the reflective variant handling of dynamic IPC bindings with a
//! closed sum type. Conversion helpers return `Option` so property readers
//! can treat a missing property and a mistyped property identically.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

/// A single value carried over the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum IpcValue {
    Bool(bool),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    U64(u64),
    F64(f64),
    Str(String),
    ObjectPath(String),
    Bytes(Vec<u8>),
    Array(Vec<IpcValue>),
    Dict(BTreeMap<String, IpcValue>),
}

impl IpcValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            IpcValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            IpcValue::Str(v) | IpcValue::ObjectPath(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_i16(&self) -> Option<i16> {
        match self {
            IpcValue::I16(v) => Some(*v),
            IpcValue::I32(v) => i16::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_u16(&self) -> Option<u16> {
        match self {
            IpcValue::U16(v) => Some(*v),
            IpcValue::U32(v) => u16::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            IpcValue::U8(v) => Some(*v as u32),
            IpcValue::U16(v) => Some(*v as u32),
            IpcValue::U32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            IpcValue::U64(v) => Some(*v),
            _ => self.as_u32().map(u64::from),
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            IpcValue::Bytes(v) => Some(v),
            _ => None,
        }
    }

    /// Byte-array content regardless of whether the peer marshalled it as a
    /// byte blob or as an array of u8 values.
    pub fn to_byte_vec(&self) -> Option<Vec<u8>> {
        match self {
            IpcValue::Bytes(v) => Some(v.clone()),
            IpcValue::Array(items) => items
                .iter()
                .map(|item| match item {
                    IpcValue::U8(b) => Some(*b),
                    _ => None,
                })
                .collect(),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[IpcValue]> {
        match self {
            IpcValue::Array(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<String, IpcValue>> {
        match self {
            IpcValue::Dict(v) => Some(v),
            _ => None,
        }
    }

    /// String list extraction for properties such as `UUIDs` and `Flags`.
    pub fn to_string_vec(&self) -> Option<Vec<String>> {
        self.as_array().map(|items| {
            items
                .iter()
                .filter_map(|item| item.as_str().map(str::to_string))
                .collect()
        })
    }
}

impl From<&str> for IpcValue {
    fn from(v: &str) -> Self {
        IpcValue::Str(v.to_string())
    }
}

impl From<String> for IpcValue {
    fn from(v: String) -> Self {
        IpcValue::Str(v)
    }
}

impl From<bool> for IpcValue {
    fn from(v: bool) -> Self {
        IpcValue::Bool(v)
    }
}

impl From<Vec<u8>> for IpcValue {
    fn from(v: Vec<u8>) -> Self {
        IpcValue::Bytes(v)
    }
}

impl From<i16> for IpcValue {
    fn from(v: i16) -> Self {
        IpcValue::I16(v)
    }
}

impl From<u32> for IpcValue {
    fn from(v: u32) -> Self {
        IpcValue::U32(v)
    }
}

/// Properties of a single interface on a single object.
pub type PropertyMap = HashMap<String, IpcValue>;

/// interface name -> properties
pub type InterfaceMap = BTreeMap<String, PropertyMap>;

/// Full object tree as returned by `GetManagedObjects`:
/// object path -> interface name -> properties.
pub type ManagedObjects = BTreeMap<String, InterfaceMap>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_vec_accepts_both_shapes() {
        let blob = IpcValue::Bytes(vec![1, 2, 3]);
        let array = IpcValue::Array(vec![IpcValue::U8(1), IpcValue::U8(2), IpcValue::U8(3)]);
        assert_eq!(blob.to_byte_vec(), Some(vec![1, 2, 3]));
        assert_eq!(array.to_byte_vec(), Some(vec![1, 2, 3]));
    }

    #[test]
    fn string_vec_skips_non_strings() {
        let arr = IpcValue::Array(vec![
            IpcValue::Str("0000180f-0000-1000-8000-00805f9b34fb".into()),
            IpcValue::U8(7),
        ]);
        assert_eq!(arr.to_string_vec().unwrap().len(), 1);
    }

    #[test]
    fn numeric_widening() {
        assert_eq!(IpcValue::U16(0x5a02).as_u32(), Some(0x5a02));
        assert_eq!(IpcValue::I32(-40).as_i16(), Some(-40));
    }
}
