//! Segment records.
//!
//! A `Segment` is one relocatable code or data unit of a module as handed over
//! by the reader. The loader gives it a selector; the record itself is never
//! mutated.

use bitflags::bitflags;

use super::relocation::Relocation;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SegmentFlags: u16 {
        const DATA = 1 << 0;
        const ALLOCATED = 1 << 1;
        const LOADED = 1 << 2;
        const MOVEABLE = 1 << 4;
        const PURE = 1 << 5;
        const PRELOAD = 1 << 6;
        const READ_ONLY = 1 << 7;
        const HAS_RELOCATIONS = 1 << 8;
        const DISCARDABLE = 1 << 12;
    }
}

#[derive(Debug, Clone, Default)]
pub struct Segment {
    /// Byte offset of the segment's image in the file (diagnostics only).
    pub file_offset: u32,
    /// Raw image bytes.
    pub data: Vec<u8>,
    /// Bytes to allocate. Never smaller than `data`; the tail is zero-filled.
    pub allocation_size: u32,
    pub flags: SegmentFlags,
    /// Fixups, in file order.
    pub relocations: Vec<Relocation>,
}

impl Segment {
    pub fn new(data: Vec<u8>, allocation_size: u32, flags: SegmentFlags) -> Self {
        let allocation_size = allocation_size.max(data.len() as u32);
        Self {
            file_offset: 0,
            data,
            allocation_size,
            flags,
            relocations: Vec::new(),
        }
    }

    pub fn code(data: Vec<u8>) -> Self {
        let size = data.len() as u32;
        Self::new(data, size, SegmentFlags::empty())
    }

    pub fn data(data: Vec<u8>, allocation_size: u32) -> Self {
        Self::new(data, allocation_size, SegmentFlags::DATA)
    }

    pub fn with_relocations(mut self, relocations: Vec<Relocation>) -> Self {
        self.relocations = relocations;
        self
    }

    pub fn is_data(&self) -> bool {
        self.flags.contains(SegmentFlags::DATA)
    }

    pub fn is_read_only(&self) -> bool {
        self.flags.contains(SegmentFlags::READ_ONLY)
    }

    /// Human readable description used as the heap allocation name.
    pub fn describe(&self) -> &'static str {
        match (self.is_data(), self.is_read_only()) {
            (true, true) => "Data Read-Only",
            (true, false) => "Data Read-Write",
            (false, true) => "Code Read-Only",
            (false, false) => "Code Read-Write",
        }
    }
}
