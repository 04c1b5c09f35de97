//! Relocation records.

use std::fmt;

/// Offset chains end with this value.
pub const CHAIN_END: u16 = 0xFFFF;

/// `param1` of an internal reference naming an entry point instead of a segment.
pub const MOVEABLE_SEGMENT: u16 = 0xFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocationKind {
    /// `param1` = 1-based segment index (or [`MOVEABLE_SEGMENT`]),
    /// `param2` = offset (or entry ordinal).
    InternalReference,
    /// `param1` = 1-based module reference index, `param2` = ordinal.
    ImportedOrdinal,
    /// `param1` = 1-based module reference index, `param2` = offset into the
    /// imported-names table.
    ImportedName,
    /// Floating point emulation fixup.
    OsFixup,
}

impl RelocationKind {
    pub fn from_flags(flags: u8) -> Self {
        match flags & 0x03 {
            0 => Self::InternalReference,
            1 => Self::ImportedOrdinal,
            2 => Self::ImportedName,
            _ => Self::OsFixup,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressType {
    LowByte,
    Selector,
    Pointer32,
    Offset16,
    Pointer48,
    Offset32,
    Unknown(u8),
}

impl AddressType {
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::LowByte,
            2 => Self::Selector,
            3 => Self::Pointer32,
            5 => Self::Offset16,
            11 => Self::Pointer48,
            13 => Self::Offset32,
            other => Self::Unknown(other),
        }
    }
}

impl fmt::Display for AddressType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressType::Unknown(raw) => write!(f, "Unknown({raw})"),
            other => write!(f, "{other:?}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relocation {
    pub address_type: AddressType,
    pub kind: RelocationKind,
    /// Add to the existing bytes instead of walking an offset chain.
    pub additive: bool,
    /// First offset of the chain within the segment.
    pub offset: u16,
    pub param1: u16,
    pub param2: u16,
}

impl Relocation {
    /// Size of one on-disk record.
    pub const SIZE: usize = 8;

    pub fn new(kind: RelocationKind, address_type: AddressType, offset: u16, param1: u16, param2: u16) -> Self {
        Self {
            address_type,
            kind,
            additive: false,
            offset,
            param1,
            param2,
        }
    }

    pub fn additive(mut self) -> Self {
        self.additive = true;
        self
    }

    /// Decodes one 8-byte record.
    pub fn parse(record: &[u8; Self::SIZE]) -> Self {
        let word = |i: usize| u16::from_le_bytes([record[i], record[i + 1]]);
        Self {
            address_type: AddressType::from_raw(record[0]),
            kind: RelocationKind::from_flags(record[1]),
            additive: record[1] & 0x04 != 0,
            offset: word(2),
            param1: word(4),
            param2: word(6),
        }
    }

    pub fn describe_kind(&self) -> String {
        if self.additive {
            format!("{:?} | Additive", self.kind)
        } else {
            format!("{:?}", self.kind)
        }
    }
}
