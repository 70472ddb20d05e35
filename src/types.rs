//! # Value Model and Type Identifiers
//!
//! ferrobase stores typed records whose layout is described by a
//! [`crate::schema::TypeSchema`]. At runtime, field contents travel as the
//! owned [`Value`] enum and whole objects as [`ObjectInfo`], an explicit,
//! registration-driven rendition of the original reflection-based object
//! model.
//!
//! ## Type Identifiers
//!
//! [`FieldType`] enumerates the semantic type ids persisted in field
//! descriptor blocks. Fixed-width types occupy their natural little-endian
//! size in the record; variable-length kinds (text, arrays, dictionaries,
//! documents) occupy an 8-byte handle pointing into the raw-data heap, and
//! complex references occupy an 8-byte {oid, tid} handle resolved through an
//! injected [`crate::record::ComplexResolver`].
//!
//! | Kind         | In-record bytes | Payload location        |
//! |--------------|-----------------|-------------------------|
//! | scalar       | fixed width     | inline                  |
//! | `String`     | declared max    | inline, zero-padded     |
//! | `Text`       | 8 (handle)      | raw-data heap           |
//! | `Array`      | 8 (handle)      | raw-data heap           |
//! | `Dictionary` | 8 (handle)      | raw-data heap           |
//! | `Document`   | 8 (handle)      | raw-data heap           |
//! | `Complex`    | 8 ({oid, tid})  | another type's store    |
//!
//! Nullable scalar fields persist as `type_id + 1000` and carry one extra
//! leading flag byte in the record.

use std::cmp::Ordering;

use eyre::Result;

use crate::error::DbError;

/// Offset added to a persisted type id to mark the field nullable.
pub const NULLABLE_TYPE_OFFSET: i32 = 1000;

/// Semantic type id of a field, as persisted in the type header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum FieldType {
    Int = 1,
    UInt = 2,
    Long = 3,
    ULong = 4,
    Short = 5,
    UShort = 6,
    Byte = 7,
    SByte = 8,
    Bool = 9,
    Char = 10,
    Float = 11,
    Double = 12,
    Decimal = 13,
    String = 14,
    DateTime = 15,
    DateTimeOffset = 16,
    TimeSpan = 17,
    Guid = 18,
    Enum = 19,
    /// Unbounded string stored in the raw-data heap.
    Text = 20,
    Complex = 21,
    Array = 22,
    Dictionary = 23,
    Document = 24,
    /// Fixed-length raw bytes stored inline. Used by the generated B-tree
    /// node type for its key/child arrays.
    Bytes = 25,
}

impl FieldType {
    pub fn from_id(id: i32) -> Result<Self> {
        let ft = match id {
            1 => FieldType::Int,
            2 => FieldType::UInt,
            3 => FieldType::Long,
            4 => FieldType::ULong,
            5 => FieldType::Short,
            6 => FieldType::UShort,
            7 => FieldType::Byte,
            8 => FieldType::SByte,
            9 => FieldType::Bool,
            10 => FieldType::Char,
            11 => FieldType::Float,
            12 => FieldType::Double,
            13 => FieldType::Decimal,
            14 => FieldType::String,
            15 => FieldType::DateTime,
            16 => FieldType::DateTimeOffset,
            17 => FieldType::TimeSpan,
            18 => FieldType::Guid,
            19 => FieldType::Enum,
            20 => FieldType::Text,
            21 => FieldType::Complex,
            22 => FieldType::Array,
            23 => FieldType::Dictionary,
            24 => FieldType::Document,
            25 => FieldType::Bytes,
            other => {
                return Err(DbError::NotSupported(format!("unknown type id {}", other)).into())
            }
        };
        Ok(ft)
    }

    pub fn id(self) -> i32 {
        self as i32
    }

    /// Fixed byte width of the value itself, for types that have one.
    /// `String` and `Bytes` take their width from the field declaration;
    /// handle-based kinds return `None`.
    pub fn fixed_len(self) -> Option<usize> {
        match self {
            FieldType::Int | FieldType::UInt | FieldType::Float | FieldType::Char => Some(4),
            FieldType::Long
            | FieldType::ULong
            | FieldType::Double
            | FieldType::DateTime
            | FieldType::TimeSpan
            | FieldType::Enum => Some(8),
            FieldType::Short | FieldType::UShort => Some(2),
            FieldType::Byte | FieldType::SByte | FieldType::Bool => Some(1),
            FieldType::Decimal | FieldType::Guid | FieldType::DateTimeOffset => Some(16),
            FieldType::String
            | FieldType::Text
            | FieldType::Complex
            | FieldType::Array
            | FieldType::Dictionary
            | FieldType::Document
            | FieldType::Bytes => None,
        }
    }

    /// True for kinds whose payload lives in the raw-data heap.
    pub fn is_heap_backed(self) -> bool {
        matches!(
            self,
            FieldType::Text | FieldType::Array | FieldType::Dictionary | FieldType::Document
        )
    }

    /// True for kinds persisted as an 8-byte handle rather than inline bytes.
    pub fn is_handle(self) -> bool {
        self.is_heap_backed() || self == FieldType::Complex
    }

    pub fn is_collection(self) -> bool {
        matches!(self, FieldType::Array | FieldType::Dictionary)
    }
}

/// DateTime kind, normalized into the tick encoding by the V2 codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum TimeKind {
    #[default]
    Unspecified = 0,
    Utc = 1,
    Local = 2,
}

impl TimeKind {
    pub fn from_bits(bits: u8) -> Self {
        match bits {
            1 => TimeKind::Utc,
            2 => TimeKind::Local,
            _ => TimeKind::Unspecified,
        }
    }
}

/// Owned runtime value of a single field.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Int(i32),
    UInt(u32),
    Long(i64),
    ULong(u64),
    Short(i16),
    UShort(u16),
    Byte(u8),
    SByte(i8),
    Bool(bool),
    Char(char),
    Float(f32),
    Double(f64),
    /// Decimal persisted as a 16-byte two's complement integer.
    Decimal(i128),
    Str(String),
    DateTime { ticks: i64, kind: TimeKind },
    DateTimeOffset { ticks: i64, offset_ticks: i64 },
    TimeSpan(i64),
    Guid([u8; 16]),
    Bytes(Vec<u8>),
    Array(Vec<Value>),
    Dict(Vec<(Value, Value)>),
    /// Persisted handle to an object in another type's record store.
    ComplexRef { oid: i32, tid: i32 },
    /// In-memory nested object, resolved to a `ComplexRef` on save.
    Object(Box<ObjectInfo>),
    Document(serde_json::Value),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// The field type this value naturally serializes as, if any.
    pub fn field_type(&self) -> Option<FieldType> {
        Some(match self {
            Value::Null => return None,
            Value::Int(_) => FieldType::Int,
            Value::UInt(_) => FieldType::UInt,
            Value::Long(_) => FieldType::Long,
            Value::ULong(_) => FieldType::ULong,
            Value::Short(_) => FieldType::Short,
            Value::UShort(_) => FieldType::UShort,
            Value::Byte(_) => FieldType::Byte,
            Value::SByte(_) => FieldType::SByte,
            Value::Bool(_) => FieldType::Bool,
            Value::Char(_) => FieldType::Char,
            Value::Float(_) => FieldType::Float,
            Value::Double(_) => FieldType::Double,
            Value::Decimal(_) => FieldType::Decimal,
            Value::Str(_) => FieldType::String,
            Value::DateTime { .. } => FieldType::DateTime,
            Value::DateTimeOffset { .. } => FieldType::DateTimeOffset,
            Value::TimeSpan(_) => FieldType::TimeSpan,
            Value::Guid(_) => FieldType::Guid,
            Value::Bytes(_) => FieldType::Bytes,
            Value::Array(_) => FieldType::Array,
            Value::Dict(_) => FieldType::Dictionary,
            Value::ComplexRef { .. } | Value::Object(_) => FieldType::Complex,
            Value::Document(_) => FieldType::Document,
        })
    }

    /// Natural ordering between two values of the same kind. Used by the
    /// B-tree for key comparisons. Nulls sort before everything; values of
    /// different kinds are incomparable.
    pub fn compare(&self, other: &Value) -> Result<Ordering> {
        use Value::*;
        let ord = match (self, other) {
            (Null, Null) => Ordering::Equal,
            (Null, _) => Ordering::Less,
            (_, Null) => Ordering::Greater,
            (Int(a), Int(b)) => a.cmp(b),
            (UInt(a), UInt(b)) => a.cmp(b),
            (Long(a), Long(b)) => a.cmp(b),
            (ULong(a), ULong(b)) => a.cmp(b),
            (Short(a), Short(b)) => a.cmp(b),
            (UShort(a), UShort(b)) => a.cmp(b),
            (Byte(a), Byte(b)) => a.cmp(b),
            (SByte(a), SByte(b)) => a.cmp(b),
            (Bool(a), Bool(b)) => a.cmp(b),
            (Char(a), Char(b)) => a.cmp(b),
            (Float(a), Float(b)) => a.partial_cmp(b).unwrap_or(Ordering::Equal),
            (Double(a), Double(b)) => a.partial_cmp(b).unwrap_or(Ordering::Equal),
            (Decimal(a), Decimal(b)) => a.cmp(b),
            (Str(a), Str(b)) => a.cmp(b),
            (DateTime { ticks: a, .. }, DateTime { ticks: b, .. }) => a.cmp(b),
            (TimeSpan(a), TimeSpan(b)) => a.cmp(b),
            (
                DateTimeOffset { ticks: a, offset_ticks: ao },
                DateTimeOffset { ticks: b, offset_ticks: bo },
            ) => {
                // Widened so extreme tick/offset pairs cannot overflow i64.
                let a_utc = *a as i128 - *ao as i128;
                let b_utc = *b as i128 - *bo as i128;
                a_utc.cmp(&b_utc)
            }
            (Guid(a), Guid(b)) => a.cmp(b),
            (a, b) => {
                return Err(DbError::UnsupportedOperation(format!(
                    "values of kinds {:?} and {:?} are not comparable",
                    a.field_type(),
                    b.field_type()
                ))
                .into())
            }
        };
        Ok(ord)
    }
}

/// An object as it crosses the record-store boundary: a type name, an oid
/// (0 for unsaved objects), and named field values.
///
/// `graph_key` is an optional caller-supplied identity used to resolve
/// circular references during a save: a parent carrying a graph key is
/// assigned its oid before its children serialize, and children referencing
/// the same key resolve to the in-flight oid instead of recursing forever.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectInfo {
    pub type_name: String,
    pub oid: i32,
    pub graph_key: Option<u64>,
    fields: Vec<(String, Value)>,
}

impl ObjectInfo {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            oid: 0,
            graph_key: None,
            fields: Vec::new(),
        }
    }

    pub fn with_oid(type_name: impl Into<String>, oid: i32) -> Self {
        let mut obj = Self::new(type_name);
        obj.oid = oid;
        obj
    }

    pub fn set(&mut self, name: impl Into<String>, value: Value) -> &mut Self {
        let name = name.into();
        if let Some(slot) = self.fields.iter_mut().find(|(n, _)| *n == name) {
            slot.1 = value;
        } else {
            self.fields.push((name, value));
        }
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}
