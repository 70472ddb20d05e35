//! # Versioned Codec Dispatch
//!
//! Type files carry a negative format version integer in their header. Over
//! the format's history the DateTime encoding changed: old files store the
//! raw tick count, newer files fold the time kind into the top bits. Rather
//! than branching on the version at every call site, the version is resolved
//! to a [`FormatVersion`] once when the schema loads, and the codec dispatches
//! through it.
//!
//! | Header version | DateTime encoding                      |
//! |----------------|----------------------------------------|
//! | `> -25`        | V1: raw ticks, kind discarded          |
//! | `<= -25`       | V2: `ticks | kind << 62` (normalized)  |
//!
//! New files are written as [`CURRENT_FORMAT_VERSION`].

use crate::types::TimeKind;

/// Version stamped into newly created type headers. Activates the TID header
/// block (`<= -30`) and the kind-normalized DateTime encoding (`<= -25`).
pub const CURRENT_FORMAT_VERSION: i32 = -35;

/// Header version at or below which the kind-normalized DateTime path is
/// used.
pub const KIND_NORMALIZED_SINCE: i32 = -25;

/// Header version at or below which the header carries the TID block.
pub const TID_BLOCK_SINCE: i32 = -30;

const TICKS_MASK: i64 = 0x3FFF_FFFF_FFFF_FFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatVersion {
    V1,
    V2,
}

impl FormatVersion {
    pub fn from_header(version: i32) -> Self {
        if version <= KIND_NORMALIZED_SINCE {
            FormatVersion::V2
        } else {
            FormatVersion::V1
        }
    }

    pub fn encode_datetime(self, ticks: i64, kind: TimeKind) -> i64 {
        match self {
            FormatVersion::V1 => ticks,
            FormatVersion::V2 => (ticks & TICKS_MASK) | ((kind as i64) << 62),
        }
    }

    pub fn decode_datetime(self, raw: i64) -> (i64, TimeKind) {
        match self {
            FormatVersion::V1 => (raw, TimeKind::Unspecified),
            FormatVersion::V2 => {
                let kind = TimeKind::from_bits(((raw >> 62) & 0x3) as u8);
                (raw & TICKS_MASK, kind)
            }
        }
    }
}
