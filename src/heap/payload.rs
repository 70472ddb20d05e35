//! # Heap Payload Serialization
//!
//! Variable-length field contents are serialized into the raw-data heap in
//! one of three shapes, chosen by element kind:
//!
//! 1. **Flat**: arrays of fixed-width primitives, elements at a fixed
//!    stride, no per-element headers.
//! 2. **Complex references**: each element is an 8-byte `{oid, tid}` pair
//!    (`{0, 0}` for a null element).
//! 3. **Jagged**: strings, nested arrays and dictionaries, where each element is a
//!    `{count, element_type_id, total_length}` mini-header followed by its
//!    own payload, recursively and with unbounded nesting depth.
//!
//! Every payload opens with a `{count, element_type_id}` header so it can be
//! decoded without out-of-band element type information. Dictionaries are a
//! count followed by alternating jagged-encoded key and value elements;
//! arrays and dictionaries are rejected as dictionary keys or values.

use eyre::{bail, ensure, Result};

use crate::codec::Codec;
use crate::error::DbError;
use crate::types::{FieldType, Value};

/// Per-element mini-header of the jagged shape.
const ELEMENT_HEADER: usize = 12;
const NULL_ELEMENT: i32 = -1;

/// Element kind a value serializes as inside a heap payload.
fn element_type_of(value: &Value) -> Result<FieldType> {
    match value {
        Value::Object(_) => Ok(FieldType::Complex),
        other => other.field_type().ok_or_else(|| {
            DbError::NotSupported("cannot infer element type of a null-only payload".into()).into()
        }),
    }
}

fn is_jagged(ft: FieldType) -> bool {
    matches!(ft, FieldType::String | FieldType::Text | FieldType::Array | FieldType::Dictionary)
}

/// Fixed stride of flat elements.
fn stride_of(ft: FieldType) -> Result<usize> {
    ft.fixed_len()
        .ok_or_else(|| DbError::NotSupported(format!("{:?} has no flat stride", ft)).into())
}

/// Serializes an array value. `Value::Object` elements must already be
/// resolved to `Value::ComplexRef` by the record store.
pub fn encode_array(values: &[Value], codec: &Codec) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(16 + values.len() * 8);
    out.extend_from_slice(&(values.len() as i32).to_le_bytes());
    let Some(first) = values.iter().find(|v| !v.is_null()) else {
        ensure!(
            values.is_empty(),
            "arrays of only null elements are not representable in the flat shape"
        );
        out.extend_from_slice(&0i32.to_le_bytes());
        return Ok(out);
    };
    let etype = element_type_of(first)?;
    out.extend_from_slice(&etype.id().to_le_bytes());

    if etype == FieldType::Complex {
        for v in values {
            let (oid, tid) = match v {
                Value::Null => (0, 0),
                Value::ComplexRef { oid, tid } => (*oid, *tid),
                other => bail!(
                    "unresolved {:?} element in a complex-reference payload",
                    other.field_type()
                ),
            };
            out.extend_from_slice(&oid.to_le_bytes());
            out.extend_from_slice(&tid.to_le_bytes());
        }
    } else if is_jagged(etype) {
        for v in values {
            encode_element(v, etype, codec, &mut out)?;
        }
    } else {
        let stride = stride_of(etype)?;
        for v in values {
            ensure!(
                !v.is_null(),
                "null elements require the jagged or complex-reference shape"
            );
            ensure!(
                element_type_of(v)? == etype,
                "mixed element kinds in one array payload"
            );
            let bytes = codec.encode(v, etype, stride, stride, false)?;
            out.extend_from_slice(&bytes);
        }
    }
    Ok(out)
}

pub fn decode_array(bytes: &[u8], codec: &Codec) -> Result<Vec<Value>> {
    let (count, etype_id) = payload_header(bytes)?;
    let mut values = Vec::with_capacity(count);
    if count == 0 {
        return Ok(values);
    }
    let etype = FieldType::from_id(etype_id)?;
    let mut pos = 8usize;

    if etype == FieldType::Complex {
        for _ in 0..count {
            let oid = read_i32(bytes, pos)?;
            let tid = read_i32(bytes, pos + 4)?;
            pos += 8;
            values.push(if oid == 0 {
                Value::Null
            } else {
                Value::ComplexRef { oid, tid }
            });
        }
    } else if is_jagged(etype) {
        for _ in 0..count {
            let (value, consumed) = decode_element(&bytes[pos..], codec)?;
            values.push(value);
            pos += consumed;
        }
    } else {
        let stride = stride_of(etype)?;
        for _ in 0..count {
            ensure!(bytes.len() >= pos + stride, "flat payload truncated");
            values.push(codec.decode(etype, &bytes[pos..pos + stride], false, false)?);
            pos += stride;
        }
    }
    Ok(values)
}

/// Serializes a dictionary as alternating jagged key/value elements.
pub fn encode_dict(entries: &[(Value, Value)], codec: &Codec) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(16 + entries.len() * 24);
    out.extend_from_slice(&(entries.len() as i32).to_le_bytes());
    out.extend_from_slice(&FieldType::Dictionary.id().to_le_bytes());
    for (key, value) in entries {
        for (side, v) in [("key", key), ("value", value)] {
            if matches!(v, Value::Array(_) | Value::Dict(_)) {
                return Err(DbError::UnsupportedOperation(format!(
                    "arrays and dictionaries are not allowed as dictionary {}s",
                    side
                ))
                .into());
            }
        }
        ensure!(!key.is_null(), "dictionary keys must not be null");
        let ktype = element_type_of(key)?;
        encode_element(key, ktype, codec, &mut out)?;
        match value {
            Value::Null => encode_element(value, FieldType::String, codec, &mut out)?,
            v => encode_element(v, element_type_of(v)?, codec, &mut out)?,
        }
    }
    Ok(out)
}

pub fn decode_dict(bytes: &[u8], codec: &Codec) -> Result<Vec<(Value, Value)>> {
    let (count, _) = payload_header(bytes)?;
    let mut entries = Vec::with_capacity(count);
    let mut pos = 8usize;
    for _ in 0..count {
        let (key, consumed) = decode_element(&bytes[pos..], codec)?;
        pos += consumed;
        let (value, consumed) = decode_element(&bytes[pos..], codec)?;
        pos += consumed;
        entries.push((key, value));
    }
    Ok(entries)
}

/// Writes one jagged element: `{count, element_type_id, total_length}` then
/// the element payload.
fn encode_element(
    value: &Value,
    etype: FieldType,
    codec: &Codec,
    out: &mut Vec<u8>,
) -> Result<()> {
    if value.is_null() {
        out.extend_from_slice(&NULL_ELEMENT.to_le_bytes());
        out.extend_from_slice(&0i32.to_le_bytes());
        out.extend_from_slice(&0i32.to_le_bytes());
        return Ok(());
    }
    let (count, body): (i32, Vec<u8>) = match value {
        Value::Str(s) => (s.len() as i32, s.as_bytes().to_vec()),
        Value::Array(vs) => (vs.len() as i32, encode_array(vs, codec)?),
        Value::Dict(es) => (es.len() as i32, encode_dict(es, codec)?),
        Value::ComplexRef { oid, tid } => {
            let mut b = Vec::with_capacity(8);
            b.extend_from_slice(&oid.to_le_bytes());
            b.extend_from_slice(&tid.to_le_bytes());
            (1, b)
        }
        v => {
            let stride = stride_of(etype)?;
            (1, codec.encode(v, etype, stride, stride, false)?)
        }
    };
    out.extend_from_slice(&count.to_le_bytes());
    out.extend_from_slice(&etype.id().to_le_bytes());
    out.extend_from_slice(&(body.len() as i32).to_le_bytes());
    out.extend_from_slice(&body);
    Ok(())
}

/// Reads one jagged element, returning the value and bytes consumed.
fn decode_element(bytes: &[u8], codec: &Codec) -> Result<(Value, usize)> {
    ensure!(bytes.len() >= ELEMENT_HEADER, "element header truncated");
    let count = read_i32(bytes, 0)?;
    let etype_id = read_i32(bytes, 4)?;
    let total = read_i32(bytes, 8)? as usize;
    if count == NULL_ELEMENT {
        return Ok((Value::Null, ELEMENT_HEADER));
    }
    ensure!(bytes.len() >= ELEMENT_HEADER + total, "element payload truncated");
    let body = &bytes[ELEMENT_HEADER..ELEMENT_HEADER + total];
    let etype = FieldType::from_id(etype_id)?;
    let value = match etype {
        FieldType::String | FieldType::Text => Value::Str(std::str::from_utf8(body)?.to_string()),
        FieldType::Array => Value::Array(decode_array(body, codec)?),
        FieldType::Dictionary => Value::Dict(decode_dict(body, codec)?),
        FieldType::Complex => {
            let oid = read_i32(body, 0)?;
            let tid = read_i32(body, 4)?;
            Value::ComplexRef { oid, tid }
        }
        ft => codec.decode(ft, body, false, false)?,
    };
    Ok((value, ELEMENT_HEADER + total))
}

fn payload_header(bytes: &[u8]) -> Result<(usize, i32)> {
    ensure!(bytes.len() >= 8, "payload header truncated");
    let count = read_i32(bytes, 0)?;
    ensure!(count >= 0, "negative payload count");
    Ok((count as usize, read_i32(bytes, 4)?))
}

fn read_i32(bytes: &[u8], at: usize) -> Result<i32> {
    ensure!(bytes.len() >= at + 4, "payload truncated at {}", at);
    Ok(i32::from_le_bytes(bytes[at..at + 4].try_into()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::FormatVersion;

    fn codec() -> Codec {
        Codec::new(FormatVersion::V2, None)
    }

    #[test]
    fn flat_int_array_roundtrip() {
        let c = codec();
        let values: Vec<Value> = (0..5).map(Value::Int).collect();
        let bytes = encode_array(&values, &c).unwrap();
        assert_eq!(bytes.len(), 8 + 5 * 4);
        assert_eq!(decode_array(&bytes, &c).unwrap(), values);
    }

    #[test]
    fn empty_array_roundtrip() {
        let c = codec();
        let bytes = encode_array(&[], &c).unwrap();
        assert_eq!(decode_array(&bytes, &c).unwrap(), Vec::<Value>::new());
    }

    #[test]
    fn string_array_is_jagged() {
        let c = codec();
        let values = vec![
            Value::Str("a".into()),
            Value::Null,
            Value::Str("longer element".into()),
        ];
        let bytes = encode_array(&values, &c).unwrap();
        assert_eq!(decode_array(&bytes, &c).unwrap(), values);
    }

    #[test]
    fn nested_arrays_recurse() {
        let c = codec();
        let values = vec![
            Value::Array(vec![Value::Int(1), Value::Int(2)]),
            Value::Array(vec![Value::Array(vec![Value::Str("deep".into())])]),
        ];
        let bytes = encode_array(&values, &c).unwrap();
        assert_eq!(decode_array(&bytes, &c).unwrap(), values);
    }

    #[test]
    fn complex_reference_array() {
        let c = codec();
        let values = vec![
            Value::ComplexRef { oid: 3, tid: 2 },
            Value::Null,
            Value::ComplexRef { oid: 9, tid: 2 },
        ];
        let bytes = encode_array(&values, &c).unwrap();
        assert_eq!(decode_array(&bytes, &c).unwrap(), values);
    }

    #[test]
    fn dictionary_roundtrip() {
        let c = codec();
        let entries = vec![
            (Value::Str("k1".into()), Value::Int(1)),
            (Value::Str("k2".into()), Value::Null),
            (Value::Int(7), Value::Str("seven".into())),
        ];
        let bytes = encode_dict(&entries, &c).unwrap();
        assert_eq!(decode_dict(&bytes, &c).unwrap(), entries);
    }

    #[test]
    fn collection_dictionary_keys_rejected() {
        let c = codec();
        let entries = vec![(Value::Array(vec![Value::Int(1)]), Value::Int(1))];
        let err = encode_dict(&entries, &c).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DbError>(),
            Some(DbError::UnsupportedOperation(_))
        ));
    }

    #[test]
    fn mixed_flat_elements_rejected() {
        let c = codec();
        let values = vec![Value::Int(1), Value::Long(2)];
        assert!(encode_array(&values, &c).is_err());
    }
}
