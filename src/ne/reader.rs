//! NE file reader.
//!
//! Parses the MZ stub, the NE header and the tables the loader needs into an
//! [`NeImage`]. Offsets in the NE header are relative to the header itself,
//! except the non-resident name table which is a file offset.

use std::fs::File;
use std::path::Path;

use memmap2::Mmap;

use super::entry::{EntryFlags, EntryPoint};
use super::relocation::Relocation;
use super::segment::{Segment, SegmentFlags};
use super::{AppFlags, ImportedNameTable, NeHeader, NeImage};
use crate::error::VirtualError;

const MZ_SIGNATURE: &[u8; 2] = b"MZ";
const NE_SIGNATURE: &[u8; 2] = b"NE";
const NE_OFFSET_FIELD: usize = 0x3C;
const MOVEABLE_BUNDLE: u8 = 0xFF;
const INT_3F: u16 = 0x3FCD;

const TARGET_UNKNOWN: u8 = 0;
const TARGET_WINDOWS: u8 = 2;

type Result<T> = std::result::Result<T, VirtualError>;

/// Bounds-checked little-endian reads over the file bytes.
struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn at(bytes: &'a [u8], pos: usize) -> Self {
        Self { bytes, pos }
    }

    fn truncated(&self, what: &str) -> VirtualError {
        VirtualError::BadImage(format!("truncated {what} at 0x{:X}", self.pos))
    }

    fn take(&mut self, len: usize, what: &str) -> Result<&'a [u8]> {
        let slice = self
            .bytes
            .get(self.pos..self.pos + len)
            .ok_or_else(|| self.truncated(what))?;
        self.pos += len;
        Ok(slice)
    }

    fn u8(&mut self, what: &str) -> Result<u8> {
        Ok(self.take(1, what)?[0])
    }

    fn u16(&mut self, what: &str) -> Result<u16> {
        let b = self.take(2, what)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self, what: &str) -> Result<u32> {
        let b = self.take(4, what)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Length-prefixed string; `None` for a zero length.
    fn name(&mut self, what: &str) -> Result<Option<String>> {
        let len = self.u8(what)? as usize;
        if len == 0 {
            return Ok(None);
        }
        let raw = self.take(len, what)?;
        Ok(Some(String::from_utf8_lossy(raw).into_owned()))
    }
}

/// Raw header fields, including the table offsets the parser needs.
struct RawHeader {
    header: NeHeader,
    entry_table: usize,
    entry_table_len: usize,
    segment_count: u16,
    module_ref_count: u16,
    non_resident_len: usize,
    segment_table: usize,
    resident_names: usize,
    module_refs: usize,
    imported_names: usize,
    non_resident_names: usize,
    alignment_shift: u16,
}

impl NeImage {
    /// Memory-maps and parses the file at `path`.
    pub fn open(path: &Path) -> Result<NeImage> {
        let file = File::open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };
        NeImage::parse(&mmap, &path.to_string_lossy())
    }

    pub fn parse(bytes: &[u8], file_name: &str) -> Result<NeImage> {
        if bytes.get(0..2) != Some(MZ_SIGNATURE.as_slice()) {
            return Err(VirtualError::BadImage(format!("{file_name}: missing MZ signature")));
        }
        let ne = Cursor::at(bytes, NE_OFFSET_FIELD).u32("MZ header")? as usize;
        let raw = read_header(bytes, ne)?;

        let mut image = NeImage {
            file_name: file_name.to_string(),
            header: raw.header.clone(),
            ..NeImage::default()
        };

        read_module_references(bytes, ne, &raw, &mut image)?;
        read_names(bytes, raw.non_resident_names, Some(raw.non_resident_len), &mut image, false)?;
        read_names(bytes, ne + raw.resident_names, None, &mut image, true)?;
        read_segments(bytes, ne, &raw, &mut image)?;
        read_entry_table(bytes, ne, &raw, &mut image)?;

        tracing::debug!(
            "Read {} '{}': {} segments, {} entry points, {} module references",
            file_name,
            image.module_name,
            image.segments.len(),
            image.entry_points.len(),
            image.module_references.len()
        );
        Ok(image)
    }
}

fn read_header(bytes: &[u8], ne: usize) -> Result<RawHeader> {
    let mut c = Cursor::at(bytes, ne);
    if c.take(2, "NE header")? != NE_SIGNATURE.as_slice() {
        return Err(VirtualError::BadImage("missing NE signature".into()));
    }
    c.take(2, "NE header")?; // linker version
    let entry_table = c.u16("NE header")? as usize;
    let entry_table_len = c.u16("NE header")? as usize;
    c.u32("NE header")?; // CRC
    c.u8("NE header")?; // program flags
    let app_flags = AppFlags::from_bits_retain(c.u8("NE header")?);
    let auto_data_segment = c.u16("NE header")?;
    let init_heap_size = c.u16("NE header")?;
    let init_stack_size = c.u16("NE header")?;
    let entry_point = c.u32("NE header")?;
    let initial_stack = c.u32("NE header")?;
    let segment_count = c.u16("NE header")?;
    let module_ref_count = c.u16("NE header")?;
    let non_resident_len = c.u16("NE header")? as usize;
    let segment_table = c.u16("NE header")? as usize;
    c.u16("NE header")?; // resource table
    let resident_names = c.u16("NE header")? as usize;
    let module_refs = c.u16("NE header")? as usize;
    let imported_names = c.u16("NE header")? as usize;
    let non_resident_names = c.u32("NE header")? as usize;
    c.u16("NE header")?; // moveable entry count
    let alignment_shift = match c.u16("NE header")? {
        0 => 9,
        n if n < 16 => n,
        n => return Err(VirtualError::BadImage(format!("alignment shift {n} out of range"))),
    };
    c.u16("NE header")?; // resource segment count
    let target_os = c.u8("NE header")?;
    if target_os != TARGET_UNKNOWN && target_os != TARGET_WINDOWS {
        return Err(VirtualError::BadImage(format!("unsupported target OS {target_os:X}")));
    }

    Ok(RawHeader {
        header: NeHeader {
            app_flags,
            auto_data_segment,
            init_heap_size,
            init_stack_size,
            entry_point,
            initial_stack,
        },
        entry_table,
        entry_table_len,
        segment_count,
        module_ref_count,
        non_resident_len,
        segment_table,
        resident_names,
        module_refs,
        imported_names,
        non_resident_names,
        alignment_shift,
    })
}

fn read_module_references(bytes: &[u8], ne: usize, raw: &RawHeader, image: &mut NeImage) -> Result<()> {
    // The imported-names table runs up to the entry table.
    let start = ne + raw.imported_names;
    let end = (ne + raw.entry_table).max(start);
    let table = bytes
        .get(start..end)
        .ok_or_else(|| VirtualError::BadImage("imported-names table out of range".into()))?;
    image.imported_names = ImportedNameTable::from_bytes(table.to_vec());

    let mut c = Cursor::at(bytes, ne + raw.module_refs);
    for index in 0..raw.module_ref_count {
        let offset = c.u16("module reference table")?;
        let name = image.imported_names.get(offset).ok_or_else(|| {
            VirtualError::BadImage(format!("module reference {} has no name", index + 1))
        })?;
        image.module_references.push(name);
    }
    Ok(())
}

/// Reads a resident or non-resident name table. Ordinal 0 names the module
/// (resident) or carries its description (non-resident).
fn read_names(
    bytes: &[u8],
    start: usize,
    len: Option<usize>,
    image: &mut NeImage,
    resident: bool,
) -> Result<()> {
    if start == 0 || len == Some(0) {
        return Ok(());
    }
    let stop = len.map(|len| start + len);
    let mut c = Cursor::at(bytes, start);
    while stop.map_or(true, |stop| c.pos < stop) {
        let Some(name) = c.name("name table")? else {
            break;
        };
        let ordinal = c.u16("name table")?;
        match (ordinal, resident) {
            (0, true) => image.module_name = name,
            (0, false) => image.description = name,
            _ => image.add_export(ordinal, &name),
        }
    }
    Ok(())
}

fn read_segments(bytes: &[u8], ne: usize, raw: &RawHeader, image: &mut NeImage) -> Result<()> {
    let mut c = Cursor::at(bytes, ne + raw.segment_table);
    for index in 0..raw.segment_count as usize {
        let sector = c.u16("segment table")? as usize;
        let length = c.u16("segment table")? as usize;
        let flags = SegmentFlags::from_bits_retain(c.u16("segment table")?);
        let min_alloc = c.u16("segment table")?;

        let file_offset = sector << raw.alignment_shift;
        let length = match (sector, length) {
            (0, _) => 0,
            (_, 0) => 0x10000,
            (_, n) => n,
        };
        let allocation = if min_alloc == 0 { 0x10000 } else { min_alloc as u32 };

        let data = bytes
            .get(file_offset..file_offset + length)
            .ok_or_else(|| VirtualError::BadImage(format!("segment {} data out of range", index + 1)))?
            .to_vec();

        let mut segment = Segment::new(data, allocation, flags);
        segment.file_offset = file_offset as u32;

        if flags.contains(SegmentFlags::HAS_RELOCATIONS) && sector != 0 {
            let mut r = Cursor::at(bytes, file_offset + length);
            let count = r.u16("relocation table")?;
            for _ in 0..count {
                let record = r.take(Relocation::SIZE, "relocation table")?;
                let mut raw_record = [0u8; Relocation::SIZE];
                raw_record.copy_from_slice(record);
                segment.relocations.push(Relocation::parse(&raw_record));
            }
        }
        image.segments.push(segment);
    }
    Ok(())
}

fn read_entry_table(bytes: &[u8], ne: usize, raw: &RawHeader, image: &mut NeImage) -> Result<()> {
    let start = ne + raw.entry_table;
    let stop = start + raw.entry_table_len;
    let mut c = Cursor::at(bytes, start);
    let mut ordinal: u16 = 1;

    while c.pos < stop {
        let count = c.u8("entry table")?;
        if count == 0 {
            break;
        }
        let bundle_segment = c.u8("entry table")?;
        if bundle_segment == 0 {
            ordinal = ordinal.wrapping_add(count as u16);
            continue;
        }

        for _ in 0..count {
            let flags = EntryFlags::from_bits_retain(c.u8("entry table")?);
            let segment = if bundle_segment == MOVEABLE_BUNDLE {
                let int3f = c.u16("entry table")?;
                if int3f != INT_3F {
                    tracing::warn!("Moveable entry {} lacks INT 3Fh marker ({:04X})", ordinal, int3f);
                }
                c.u8("entry table")?
            } else {
                bundle_segment
            };
            let offset = c.u16("entry table")?;
            image.add_entry_point(EntryPoint::new(ordinal, segment, offset, flags));
            ordinal = ordinal.wrapping_add(1);
        }
    }
    Ok(())
}
