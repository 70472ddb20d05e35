//! # Byte Codec
//!
//! Converts field values to and from the fixed-width byte slots of a record.
//! Every encode produces exactly the declared fixed length (values are
//! padded, never truncated silently) and every decode consumes a slot of
//! that length.
//!
//! ## Encodings
//!
//! | Type            | Bytes | Layout                                    |
//! |-----------------|-------|-------------------------------------------|
//! | Int/UInt/Float  | 4     | little-endian                             |
//! | Long/ULong/Double/TimeSpan/Enum | 8 | little-endian                 |
//! | Short/UShort    | 2     | little-endian                             |
//! | Byte/SByte/Bool | 1     | raw                                       |
//! | Char            | 4     | Unicode scalar as u32                     |
//! | Decimal/Guid    | 16    | i128 LE / raw bytes                       |
//! | DateTime        | 8     | tick count, versioned (see `version`)     |
//! | DateTimeOffset  | 16    | ticks + offset ticks, two i64             |
//! | String          | decl. | UTF-8, zero-padded, NUL-trimmed on read   |
//! | Bytes           | decl. | raw, zero-padded                          |
//!
//! Nullable fields prepend one flag byte (0 = null) and encode the inner
//! value into the remaining length. Enum values are re-based to their
//! underlying integer before encoding.
//!
//! When an encryptor is configured, string content is encrypted after
//! padding (the schema layer guarantees string slots are block-aligned) and
//! decrypted before trimming on read. Scalars are not encrypted.
//!
//! Unsupported types fail with a typed `DbError::NotSupported`; nothing is
//! silently defaulted.

pub mod version;

use std::sync::Arc;

use eyre::{bail, ensure, Result};

use crate::encryption::Encryptor;
use crate::error::DbError;
use crate::types::{FieldType, Value};

pub use version::{FormatVersion, CURRENT_FORMAT_VERSION};

#[derive(Clone)]
pub struct Codec {
    version: FormatVersion,
    encryptor: Option<Arc<dyn Encryptor>>,
}

impl Codec {
    pub fn new(version: FormatVersion, encryptor: Option<Arc<dyn Encryptor>>) -> Self {
        Self { version, encryptor }
    }

    pub fn version(&self) -> FormatVersion {
        self.version
    }

    pub fn encryptor(&self) -> Option<&Arc<dyn Encryptor>> {
        self.encryptor.as_ref()
    }

    /// Encodes `value` into exactly `fixed_len` bytes. `real_len` is the
    /// logical length before padding (the declared maximum for strings).
    pub fn encode(
        &self,
        value: &Value,
        field_type: FieldType,
        fixed_len: usize,
        real_len: usize,
        nullable: bool,
    ) -> Result<Vec<u8>> {
        if nullable {
            let mut out = vec![0u8; fixed_len];
            if value.is_null() {
                return Ok(out);
            }
            out[0] = 1;
            let inner = self.encode_inner(value, field_type, fixed_len - 1, real_len)?;
            out[1..].copy_from_slice(&inner);
            return Ok(out);
        }
        ensure!(
            !value.is_null(),
            "null value for non-nullable {:?} field",
            field_type
        );
        self.encode_inner(value, field_type, fixed_len, real_len)
    }

    /// Decodes a fixed-width slot back into a value. `check_encrypted`
    /// controls whether string content runs through the configured decryptor
    /// (raw header reads skip it).
    pub fn decode(
        &self,
        field_type: FieldType,
        bytes: &[u8],
        nullable: bool,
        check_encrypted: bool,
    ) -> Result<Value> {
        if nullable {
            ensure!(!bytes.is_empty(), "empty slot for nullable field");
            if bytes[0] == 0 {
                return Ok(Value::Null);
            }
            return self.decode_inner(field_type, &bytes[1..], check_encrypted);
        }
        self.decode_inner(field_type, bytes, check_encrypted)
    }

    fn encode_inner(
        &self,
        value: &Value,
        field_type: FieldType,
        len: usize,
        real_len: usize,
    ) -> Result<Vec<u8>> {
        let mut out = vec![0u8; len];
        match (field_type, value) {
            (FieldType::Int, Value::Int(v)) => out.copy_from_slice(&v.to_le_bytes()),
            (FieldType::UInt, Value::UInt(v)) => out.copy_from_slice(&v.to_le_bytes()),
            (FieldType::Long, Value::Long(v)) => out.copy_from_slice(&v.to_le_bytes()),
            (FieldType::ULong, Value::ULong(v)) => out.copy_from_slice(&v.to_le_bytes()),
            (FieldType::Short, Value::Short(v)) => out.copy_from_slice(&v.to_le_bytes()),
            (FieldType::UShort, Value::UShort(v)) => out.copy_from_slice(&v.to_le_bytes()),
            (FieldType::Byte, Value::Byte(v)) => out[0] = *v,
            (FieldType::SByte, Value::SByte(v)) => out[0] = *v as u8,
            (FieldType::Bool, Value::Bool(v)) => out[0] = u8::from(*v),
            (FieldType::Char, Value::Char(v)) => out.copy_from_slice(&(*v as u32).to_le_bytes()),
            (FieldType::Float, Value::Float(v)) => out.copy_from_slice(&v.to_le_bytes()),
            (FieldType::Double, Value::Double(v)) => out.copy_from_slice(&v.to_le_bytes()),
            (FieldType::Decimal, Value::Decimal(v)) => out.copy_from_slice(&v.to_le_bytes()),
            (FieldType::Guid, Value::Guid(v)) => out.copy_from_slice(v),
            (FieldType::TimeSpan, Value::TimeSpan(v)) => out.copy_from_slice(&v.to_le_bytes()),
            (FieldType::DateTime, Value::DateTime { ticks, kind }) => {
                let raw = self.version.encode_datetime(*ticks, *kind);
                out.copy_from_slice(&raw.to_le_bytes());
            }
            (FieldType::DateTimeOffset, Value::DateTimeOffset { ticks, offset_ticks }) => {
                out[..8].copy_from_slice(&ticks.to_le_bytes());
                out[8..].copy_from_slice(&offset_ticks.to_le_bytes());
            }
            (FieldType::Enum, v) => {
                let underlying = enum_underlying(v)?;
                out.copy_from_slice(&underlying.to_le_bytes());
            }
            (FieldType::String, Value::Str(s)) => {
                let content = s.as_bytes();
                ensure!(
                    content.len() <= real_len.min(len),
                    "string of {} bytes exceeds declared length {}",
                    content.len(),
                    real_len.min(len)
                );
                out[..content.len()].copy_from_slice(content);
                if let Some(enc) = &self.encryptor {
                    enc.encrypt(&mut out)?;
                }
            }
            (FieldType::Bytes, Value::Bytes(b)) => {
                ensure!(
                    b.len() <= len,
                    "byte slice of {} exceeds declared length {}",
                    b.len(),
                    len
                );
                out[..b.len()].copy_from_slice(b);
            }
            (ft, v) if ft.is_handle() => {
                bail!(
                    "handle-based field {:?} cannot pass through the scalar codec (value {:?})",
                    ft,
                    v.field_type()
                )
            }
            (ft, v) => {
                return Err(DbError::NotSupported(format!(
                    "cannot encode {:?} value as {:?}",
                    v.field_type(),
                    ft
                ))
                .into())
            }
        }
        Ok(out)
    }

    fn decode_inner(
        &self,
        field_type: FieldType,
        bytes: &[u8],
        check_encrypted: bool,
    ) -> Result<Value> {
        if let Some(expected) = field_type.fixed_len() {
            ensure!(
                bytes.len() >= expected,
                "slot of {} bytes too small for {:?}",
                bytes.len(),
                field_type
            );
        }
        let value = match field_type {
            FieldType::Int => Value::Int(i32::from_le_bytes(bytes[..4].try_into()?)),
            FieldType::UInt => Value::UInt(u32::from_le_bytes(bytes[..4].try_into()?)),
            FieldType::Long => Value::Long(i64::from_le_bytes(bytes[..8].try_into()?)),
            FieldType::ULong => Value::ULong(u64::from_le_bytes(bytes[..8].try_into()?)),
            FieldType::Short => Value::Short(i16::from_le_bytes(bytes[..2].try_into()?)),
            FieldType::UShort => Value::UShort(u16::from_le_bytes(bytes[..2].try_into()?)),
            FieldType::Byte => Value::Byte(bytes[0]),
            FieldType::SByte => Value::SByte(bytes[0] as i8),
            FieldType::Bool => Value::Bool(bytes[0] != 0),
            FieldType::Char => {
                let code = u32::from_le_bytes(bytes[..4].try_into()?);
                let c = char::from_u32(code)
                    .ok_or_else(|| eyre::eyre!("invalid char scalar {:#x}", code))?;
                Value::Char(c)
            }
            FieldType::Float => Value::Float(f32::from_le_bytes(bytes[..4].try_into()?)),
            FieldType::Double => Value::Double(f64::from_le_bytes(bytes[..8].try_into()?)),
            FieldType::Decimal => Value::Decimal(i128::from_le_bytes(bytes[..16].try_into()?)),
            FieldType::Guid => {
                let mut g = [0u8; 16];
                g.copy_from_slice(&bytes[..16]);
                Value::Guid(g)
            }
            FieldType::TimeSpan => Value::TimeSpan(i64::from_le_bytes(bytes[..8].try_into()?)),
            FieldType::DateTime => {
                let raw = i64::from_le_bytes(bytes[..8].try_into()?);
                let (ticks, kind) = self.version.decode_datetime(raw);
                Value::DateTime { ticks, kind }
            }
            FieldType::DateTimeOffset => Value::DateTimeOffset {
                ticks: i64::from_le_bytes(bytes[..8].try_into()?),
                offset_ticks: i64::from_le_bytes(bytes[8..16].try_into()?),
            },
            FieldType::Enum => Value::Long(i64::from_le_bytes(bytes[..8].try_into()?)),
            FieldType::String => {
                let mut buf = bytes.to_vec();
                if check_encrypted {
                    if let Some(enc) = &self.encryptor {
                        enc.decrypt(&mut buf)?;
                    }
                }
                let end = buf.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
                buf.truncate(end);
                Value::Str(String::from_utf8(buf)?)
            }
            FieldType::Bytes => Value::Bytes(bytes.to_vec()),
            other => {
                return Err(DbError::NotSupported(format!(
                    "cannot decode {:?} through the scalar codec",
                    other
                ))
                .into())
            }
        };
        Ok(value)
    }
}

fn enum_underlying(value: &Value) -> Result<i64> {
    Ok(match value {
        Value::Int(v) => *v as i64,
        Value::UInt(v) => *v as i64,
        Value::Long(v) => *v,
        Value::Short(v) => *v as i64,
        Value::UShort(v) => *v as i64,
        Value::Byte(v) => *v as i64,
        Value::SByte(v) => *v as i64,
        other => {
            return Err(DbError::NotSupported(format!(
                "enum fields require an integer value, got {:?}",
                other.field_type()
            ))
            .into())
        }
    })
}
