//! Segmented executable images.
//!
//! This module holds the immutable description of a 16-bit segmented module:
//! - `NeHeader`: the header fields the loader consumes.
//! - `Segment`, `Relocation`, `EntryPoint`: per-segment and per-ordinal records.
//! - `NeImage`: everything above plus the name tables.
//!
//! `reader` builds an `NeImage` from file bytes. Tests build them directly.

pub mod entry;
pub mod reader;
pub mod relocation;
pub mod segment;

use std::collections::{BTreeMap, HashMap};

use bitflags::bitflags;

pub use entry::{EntryFlags, EntryPoint, CONSTANT_SEGMENT};
pub use relocation::{AddressType, Relocation, RelocationKind};
pub use segment::{Segment, SegmentFlags};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct AppFlags: u8 {
        const FULL_SCREEN = 0x01;
        const WIN_PM_COMPAT = 0x02;
        const WIN_PM = 0x03;
        const OS2_APP = 0x08;
        const IMAGE_ERROR = 0x20;
        const NON_CONFORM = 0x40;
        const DLL = 0x80;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NeHeader {
    pub app_flags: AppFlags,
    /// 1-based index of the automatic data segment, 0 if none.
    pub auto_data_segment: u16,
    pub init_heap_size: u16,
    pub init_stack_size: u16,
    /// CS:IP, with CS as a 1-based segment index. 0 if none.
    pub entry_point: u32,
    /// SS:SP, with SS as a 1-based segment index.
    pub initial_stack: u32,
}

impl NeHeader {
    pub fn entry_segment(&self) -> u16 {
        (self.entry_point >> 16) as u16
    }

    pub fn entry_offset(&self) -> u16 {
        self.entry_point as u16
    }
}

/// Length-prefixed strings addressed by byte offset, as referenced by
/// `ImportedName` relocations and the module reference table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportedNameTable {
    bytes: Vec<u8>,
}

impl Default for ImportedNameTable {
    fn default() -> Self {
        // Offset 0 is conventionally an empty string.
        Self { bytes: vec![0] }
    }
}

impl ImportedNameTable {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// Appends `name` and returns its offset.
    pub fn push(&mut self, name: &str) -> u16 {
        let offset = self.bytes.len() as u16;
        self.bytes.push(name.len() as u8);
        self.bytes.extend_from_slice(name.as_bytes());
        offset
    }

    /// The string at `offset`. A zero length reads as no name.
    pub fn get(&self, offset: u16) -> Option<String> {
        let start = offset as usize;
        let len = *self.bytes.get(start)? as usize;
        if len == 0 {
            return None;
        }
        let raw = self.bytes.get(start + 1..start + 1 + len)?;
        Some(String::from_utf8_lossy(raw).into_owned())
    }
}

#[derive(Debug, Clone, Default)]
pub struct NeImage {
    /// Host path the image was read from, if any.
    pub file_name: String,
    pub module_name: String,
    pub description: String,
    pub header: NeHeader,
    pub segments: Vec<Segment>,
    pub entry_points: BTreeMap<u16, EntryPoint>,
    /// Module names in reference-table order. Relocations index this 1-based.
    pub module_references: Vec<String>,
    pub imported_names: ImportedNameTable,
    export_names: BTreeMap<u16, String>,
    export_ordinals: HashMap<String, u16>,
}

impl NeImage {
    pub fn new(module_name: &str) -> Self {
        Self {
            module_name: module_name.to_string(),
            ..Self::default()
        }
    }

    pub fn is_dll(&self) -> bool {
        self.header.app_flags.contains(AppFlags::DLL)
    }

    /// Registers an exported name. Names compare case-insensitively.
    pub fn add_export(&mut self, ordinal: u16, name: &str) {
        self.export_names.insert(ordinal, name.to_string());
        self.export_ordinals.insert(name.to_ascii_uppercase(), ordinal);
    }

    pub fn add_entry_point(&mut self, entry: EntryPoint) {
        self.entry_points.insert(entry.ordinal, entry);
    }

    /// Adds a module reference and returns its 1-based index.
    pub fn add_module_reference(&mut self, name: &str) -> u16 {
        self.imported_names.push(name);
        self.module_references.push(name.to_string());
        self.module_references.len() as u16
    }

    pub fn ordinal_from_name(&self, name: &str) -> Option<u16> {
        self.export_ordinals.get(&name.to_ascii_uppercase()).copied()
    }

    pub fn name_from_ordinal(&self, ordinal: u16) -> Option<&str> {
        self.export_names.get(&ordinal).map(String::as_str)
    }

    pub fn exports(&self) -> impl Iterator<Item = (u16, &str)> {
        self.export_names.iter().map(|(o, n)| (*o, n.as_str()))
    }

    /// 0-based index of the automatic data segment.
    pub fn data_segment_index(&self) -> Option<usize> {
        match self.header.auto_data_segment {
            0 => None,
            n if (n as usize) <= self.segments.len() => Some(n as usize - 1),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn imported_names_are_offset_addressed() {
        let mut table = ImportedNameTable::default();
        let kernel = table.push("KERNEL");
        let user = table.push("USER");
        assert_eq!(kernel, 1);
        assert_eq!(user, 8);
        assert_eq!(table.get(user).as_deref(), Some("USER"));
        assert_eq!(table.get(0), None);
        assert_eq!(table.get(200), None);
    }

    #[test]
    fn export_lookup_ignores_case() {
        let mut image = NeImage::new("TOOLS");
        image.add_export(3, "DoThing");
        assert_eq!(image.ordinal_from_name("DOTHING"), Some(3));
        assert_eq!(image.name_from_ordinal(3), Some("DoThing"));
        assert_eq!(image.ordinal_from_name("Other"), None);
    }

    #[test]
    fn data_segment_index_is_validated() {
        let mut image = NeImage::new("APP");
        image.segments.push(Segment::code(vec![0x90]));
        image.header.auto_data_segment = 2;
        assert_eq!(image.data_segment_index(), None);
        image.segments.push(Segment::data(vec![], 0x10));
        assert_eq!(image.data_segment_index(), Some(1));
    }
}
