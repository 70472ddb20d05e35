//! # On-Disk Type Header
//!
//! Every type file begins with a binary header describing the record layout.
//! Offsets are cumulative:
//!
//! ```text
//! Offset            Size  Field
//! 0                 4     headerSize
//! 4                 4     typeNameSize
//! 8                 n     typeName (UTF-8)
//! 8+n               8     lastUpdated (millis)
//! 16+n              4     numberOfRecords
//! 20+n              4     positionFirstRecord
//! 24+n              4     lengthOfRecord
//! 28+n              4     version
//! 32+n              4     nrFields
//! 36+n              16    TID + 3 unused  (only when version <= -30)
//! ...               220×  field descriptor blocks
//! ```
//!
//! Each descriptor block is a fixed 220 bytes: sizeOfName(4), name(200,
//! zero-padded), length(4), positionInRecord(4), realLength(4), typeId(4).
//! Nullable fields persist their type id offset by 1000. The block is a
//! zerocopy struct so it can be read straight off the buffer.

use eyre::{bail, ensure, Result};
use zerocopy::little_endian::I32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::codec::version::TID_BLOCK_SINCE;
use crate::types::{FieldType, NULLABLE_TYPE_OFFSET};

use super::{FieldDescriptor, TypeSchema, INDEX_NODE_TYPE_PREFIX};

pub const FIELD_NAME_CAP: usize = 200;
pub const DESCRIPTOR_BLOCK_SIZE: usize = 220;

/// Fixed header bytes before the type name.
const PRE_NAME: usize = 8;
/// Fixed header bytes between the type name and the TID block.
const POST_NAME: usize = 28;
/// TID + three unused slots.
const TID_BLOCK: usize = 16;

const MAX_NAME_LEN: usize = 1024;
const MAX_FIELDS: usize = 4096;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct DescriptorBlock {
    size_of_name: I32,
    name: [u8; FIELD_NAME_CAP],
    length: I32,
    position: I32,
    real_length: I32,
    type_id: I32,
}

const _: () = assert!(std::mem::size_of::<DescriptorBlock>() == DESCRIPTOR_BLOCK_SIZE);

/// Total header size for a type with the given name length and field count.
pub fn header_size(name_len: usize, nr_fields: usize, version: i32) -> usize {
    let tid = if version <= TID_BLOCK_SINCE { TID_BLOCK } else { 0 };
    PRE_NAME + name_len + POST_NAME + tid + nr_fields * DESCRIPTOR_BLOCK_SIZE
}

/// File offset of the numberOfRecords field.
pub fn record_count_offset(name_len: usize) -> u64 {
    (PRE_NAME + name_len + 8) as u64
}

pub fn encode(schema: &TypeSchema) -> Vec<u8> {
    let name = schema.name.as_bytes();
    let mut out = Vec::with_capacity(schema.header_size);
    out.extend_from_slice(&(schema.header_size as i32).to_le_bytes());
    out.extend_from_slice(&(name.len() as i32).to_le_bytes());
    out.extend_from_slice(name);
    out.extend_from_slice(&schema.last_updated.to_le_bytes());
    out.extend_from_slice(&(schema.record_count as i32).to_le_bytes());
    out.extend_from_slice(&(schema.header_size as i32).to_le_bytes());
    out.extend_from_slice(&(schema.record_length as i32).to_le_bytes());
    out.extend_from_slice(&schema.version.to_le_bytes());
    out.extend_from_slice(&(schema.fields.len() as i32).to_le_bytes());
    if schema.version <= TID_BLOCK_SINCE {
        out.extend_from_slice(&schema.tid.to_le_bytes());
        out.extend_from_slice(&[0u8; 12]);
    }
    for field in &schema.fields {
        let mut name_buf = [0u8; FIELD_NAME_CAP];
        name_buf[..field.name.len()].copy_from_slice(field.name.as_bytes());
        let type_id = if field.nullable {
            field.field_type.id() + NULLABLE_TYPE_OFFSET
        } else {
            field.field_type.id()
        };
        let block = DescriptorBlock {
            size_of_name: I32::new(field.name.len() as i32),
            name: name_buf,
            length: I32::new(field.len as i32),
            position: I32::new(field.offset as i32),
            real_length: I32::new(field.real_len as i32),
            type_id: I32::new(type_id),
        };
        out.extend_from_slice(block.as_bytes());
    }
    debug_assert_eq!(out.len(), schema.header_size);
    out
}

/// Parses a complete header buffer back into a schema. The tid is read from
/// the TID block when present, otherwise 0 (the store re-floors its counter
/// from loaded tids).
pub fn decode(bytes: &[u8]) -> Result<TypeSchema> {
    ensure!(bytes.len() >= PRE_NAME + POST_NAME, "header truncated");
    let stored_header_size = read_i32(bytes, 0)? as usize;
    let name_len = read_i32(bytes, 4)? as usize;
    ensure!(
        (1..=MAX_NAME_LEN).contains(&name_len),
        "implausible type name length {}",
        name_len
    );
    ensure!(bytes.len() >= PRE_NAME + name_len + POST_NAME, "header truncated");
    let name = std::str::from_utf8(&bytes[PRE_NAME..PRE_NAME + name_len])?.to_string();

    let mut pos = PRE_NAME + name_len;
    let last_updated = read_i64(bytes, pos)?;
    let record_count = read_i32(bytes, pos + 8)?;
    let position_first_record = read_i32(bytes, pos + 12)? as usize;
    let record_length = read_i32(bytes, pos + 16)? as usize;
    let version = read_i32(bytes, pos + 20)?;
    let nr_fields = read_i32(bytes, pos + 24)? as usize;
    pos += POST_NAME;

    ensure!(nr_fields <= MAX_FIELDS, "implausible field count {}", nr_fields);
    ensure!(record_count >= 0, "negative record count");
    let expected = header_size(name_len, nr_fields, version);
    ensure!(
        stored_header_size == expected && position_first_record == expected,
        "header size mismatch: stored {} first-record {} computed {}",
        stored_header_size,
        position_first_record,
        expected
    );
    ensure!(bytes.len() >= expected, "header truncated");

    let mut tid = 0;
    if version <= TID_BLOCK_SINCE {
        tid = read_i32(bytes, pos)?;
        pos += TID_BLOCK;
    }

    let mut fields = Vec::with_capacity(nr_fields);
    let mut running = 4usize;
    for _ in 0..nr_fields {
        let block = DescriptorBlock::ref_from_bytes(&bytes[pos..pos + DESCRIPTOR_BLOCK_SIZE])
            .map_err(|e| eyre::eyre!("bad descriptor block: {:?}", e))?;
        pos += DESCRIPTOR_BLOCK_SIZE;

        let fname_len = block.size_of_name.get() as usize;
        ensure!(fname_len <= FIELD_NAME_CAP, "descriptor name overflows block");
        let fname = std::str::from_utf8(&block.name[..fname_len])?.to_string();

        let raw_type = block.type_id.get();
        let (type_id, nullable) = if raw_type >= NULLABLE_TYPE_OFFSET {
            (raw_type - NULLABLE_TYPE_OFFSET, true)
        } else {
            (raw_type, false)
        };
        let field_type = FieldType::from_id(type_id)?;

        let len = block.length.get() as usize;
        let offset = block.position.get() as usize;
        ensure!(
            offset == running,
            "field '{}' offset {} breaks the prefix-sum invariant (expected {})",
            fname,
            offset,
            running
        );
        running += len;

        fields.push(FieldDescriptor {
            name: fname,
            field_type,
            len,
            offset,
            real_len: block.real_length.get() as usize,
            nullable,
        });
    }
    if record_length != running {
        bail!(
            "record length {} disagrees with field lengths (sum {})",
            record_length,
            running
        );
    }

    Ok(TypeSchema {
        tid,
        is_index_node: name.starts_with(INDEX_NODE_TYPE_PREFIX),
        name,
        version,
        fields,
        record_length,
        header_size: stored_header_size,
        record_count: record_count as u32,
        last_updated,
    })
}

fn read_i32(bytes: &[u8], at: usize) -> Result<i32> {
    ensure!(bytes.len() >= at + 4, "header truncated at {}", at);
    Ok(i32::from_le_bytes(bytes[at..at + 4].try_into()?))
}

fn read_i64(bytes: &[u8], at: usize) -> Result<i64> {
    ensure!(bytes.len() >= at + 8, "header truncated at {}", at);
    Ok(i64::from_le_bytes(bytes[at..at + 8].try_into()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::CURRENT_FORMAT_VERSION;
    use crate::schema::{FieldMeta, TypeDescription};

    fn sample() -> TypeSchema {
        let desc = TypeDescription::new("Order")
            .field(FieldMeta::new("Id", FieldType::Int))
            .field(FieldMeta::new("Note", FieldType::String).max_length(32))
            .field(FieldMeta::new("Total", FieldType::Double).nullable())
            .field(FieldMeta::new("Lines", FieldType::Array));
        let mut schema = TypeSchema::build(&desc, 7, CURRENT_FORMAT_VERSION, None).unwrap();
        schema.record_count = 42;
        schema
    }

    #[test]
    fn header_roundtrip() {
        let schema = sample();
        let bytes = encode(&schema);
        assert_eq!(bytes.len(), schema.header_size);
        let parsed = decode(&bytes).unwrap();
        assert_eq!(parsed.tid, 7);
        assert_eq!(parsed.name, "Order");
        assert_eq!(parsed.record_count, 42);
        assert_eq!(parsed.record_length, schema.record_length);
        assert_eq!(parsed.fields, schema.fields);
        assert_eq!(parsed.version, CURRENT_FORMAT_VERSION);
    }

    #[test]
    fn nullable_type_ids_offset_by_1000() {
        let schema = sample();
        let bytes = encode(&schema);
        let parsed = decode(&bytes).unwrap();
        let total = parsed.fields.iter().find(|f| f.name == "Total").unwrap();
        assert!(total.nullable);
        assert_eq!(total.field_type, FieldType::Double);
    }

    #[test]
    fn tid_block_present_only_for_new_versions() {
        // Version -20 predates the TID block; headers must be 16 bytes
        // shorter and decode to tid 0.
        let desc = TypeDescription::new("Old")
            .field(FieldMeta::new("X", FieldType::Int));
        let schema = TypeSchema::build(&desc, 3, -20, None).unwrap();
        let bytes = encode(&schema);
        assert_eq!(bytes.len(), header_size(3, 1, -20));
        assert_eq!(bytes.len() + 16, header_size(3, 1, CURRENT_FORMAT_VERSION));
        let parsed = decode(&bytes).unwrap();
        assert_eq!(parsed.tid, 0);
        assert_eq!(parsed.version, -20);
    }

    #[test]
    fn garbage_is_rejected() {
        let junk = vec![0xAB; 64];
        assert!(decode(&junk).is_err());
    }

    #[test]
    fn record_count_offset_matches_layout() {
        let schema = sample();
        let bytes = encode(&schema);
        let off = record_count_offset(schema.name.len()) as usize;
        let stored = i32::from_le_bytes(bytes[off..off + 4].try_into().unwrap());
        assert_eq!(stored, 42);
    }
}
