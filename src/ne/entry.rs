//! Entry table records.

use bitflags::bitflags;

/// Segment number of entries holding a constant instead of a code address.
pub const CONSTANT_SEGMENT: u8 = 0xFE;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EntryFlags: u8 {
        const EXPORTED = 0x01;
        /// Entry uses the module's own (shared) data segment.
        const SHARED_DATA = 0x02;
    }
}

/// A procedure exported or internally referenced by ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryPoint {
    pub ordinal: u16,
    /// 1-based owning segment, or [`CONSTANT_SEGMENT`].
    pub segment: u8,
    pub offset: u16,
    pub flags: EntryFlags,
}

impl EntryPoint {
    pub fn new(ordinal: u16, segment: u8, offset: u16, flags: EntryFlags) -> Self {
        Self {
            ordinal,
            segment,
            offset,
            flags,
        }
    }

    pub fn is_exported(&self) -> bool {
        self.flags.contains(EntryFlags::EXPORTED)
    }

    pub fn uses_shared_data(&self) -> bool {
        self.flags.contains(EntryFlags::SHARED_DATA)
    }

    pub fn is_constant(&self) -> bool {
        self.segment == CONSTANT_SEGMENT
    }
}
