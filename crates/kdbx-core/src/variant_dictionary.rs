//! KDBX4 VariantDictionary: the typed key/value map used for KDF parameters

use crate::error::{Error, Result};
use crate::header::ByteReader;
use byteorder::{ByteOrder, LittleEndian};
use std::collections::HashMap;

const VD_VERSION_MAJOR: u16 = 0x0100;
const VD_VERSION_CRITICAL_MASK: u16 = 0xFF00;

const TYPE_END: u8 = 0x00;
const TYPE_UINT32: u8 = 0x04;
const TYPE_UINT64: u8 = 0x05;
const TYPE_BOOL: u8 = 0x08;
const TYPE_INT32: u8 = 0x0C;
const TYPE_INT64: u8 = 0x0D;
const TYPE_STRING: u8 = 0x18;
const TYPE_BYTES: u8 = 0x42;

#[derive(Debug, Clone, PartialEq)]
pub enum VariantValue {
    UInt32(u32),
    UInt64(u64),
    Bool(bool),
    Int32(i32),
    Int64(i64),
    String(String),
    Bytes(Vec<u8>),
}

#[derive(Debug, Clone, Default)]
pub struct VariantDictionary {
    items: HashMap<String, VariantValue>,
}

impl VariantDictionary {
    // version: u16, then (type: u8, key_len: u32, key, value_len: u32, value)*
    // terminated by a type byte of 0
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(data);

        let version = reader.read_u16("variant dictionary version")?;
        if version & VD_VERSION_CRITICAL_MASK != VD_VERSION_MAJOR {
            return Err(Error::FormatError(format!(
                "Unsupported variant dictionary version {:#06x}",
                version
            )));
        }

        let mut items = HashMap::new();
        loop {
            let value_type = reader.read_u8("variant dictionary item type")?;
            if value_type == TYPE_END {
                break;
            }

            let key_len = reader.read_u32("variant dictionary key length")? as usize;
            let key = reader.take(key_len, "variant dictionary key")?;
            let key = std::str::from_utf8(key)
                .map_err(|_| Error::FormatError("Variant dictionary key is not UTF-8".into()))?
                .to_string();

            let value_len = reader.read_u32("variant dictionary value length")? as usize;
            let raw = reader.take(value_len, "variant dictionary value")?;

            let value = match value_type {
                TYPE_UINT32 => VariantValue::UInt32(LittleEndian::read_u32(fixed(raw, 4, &key)?)),
                TYPE_UINT64 => VariantValue::UInt64(LittleEndian::read_u64(fixed(raw, 8, &key)?)),
                TYPE_BOOL => VariantValue::Bool(fixed(raw, 1, &key)?[0] != 0),
                TYPE_INT32 => VariantValue::Int32(LittleEndian::read_i32(fixed(raw, 4, &key)?)),
                TYPE_INT64 => VariantValue::Int64(LittleEndian::read_i64(fixed(raw, 8, &key)?)),
                TYPE_STRING => VariantValue::String(String::from_utf8_lossy(raw).into_owned()),
                TYPE_BYTES => VariantValue::Bytes(raw.to_vec()),
                other => {
                    return Err(Error::FormatError(format!(
                        "Unknown variant dictionary value type {:#04x} for key '{}'",
                        other, key
                    )))
                }
            };
            items.insert(key, value);
        }

        Ok(Self { items })
    }

    pub fn contains(&self, key: &str) -> bool {
        self.items.contains_key(key)
    }

    pub fn get_bytes(&self, key: &str) -> Option<&[u8]> {
        match self.items.get(key)? {
            VariantValue::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Unsigned integer of either width; KeePassXC and KeePass disagree on some keys
    pub fn get_u64(&self, key: &str) -> Option<u64> {
        match self.items.get(key)? {
            VariantValue::UInt64(v) => Some(*v),
            VariantValue::UInt32(v) => Some(u64::from(*v)),
            _ => None,
        }
    }

    pub fn get_u32(&self, key: &str) -> Option<u32> {
        match self.items.get(key)? {
            VariantValue::UInt32(v) => Some(*v),
            VariantValue::UInt64(v) => u32::try_from(*v).ok(),
            _ => None,
        }
    }
}

fn fixed<'a>(raw: &'a [u8], len: usize, key: &str) -> Result<&'a [u8]> {
    if raw.len() != len {
        return Err(Error::FormatError(format!(
            "Variant dictionary value for '{}' has length {}, expected {}",
            key,
            raw.len(),
            len
        )));
    }
    Ok(raw)
}
