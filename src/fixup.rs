//! Relocation patching.
//!
//! Writes resolved values into a segment buffer:
//! - Additive fixups add the value to the word/dword already present.
//! - Non-additive fixups walk the offset chain stored in the segment itself:
//!   each patched location holds the offset of the next one, `0xFFFF` ends it.
//! - OS fixups rewrite inline FPU instructions into the emulator interrupts.

use thiserror::Error;

use crate::error::UnsupportedError;
use crate::ne::relocation::{Relocation, CHAIN_END};
use crate::utils::{read_dword, read_word, write_dword, write_word};

/// A resolved relocation value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixupValue {
    Word(u16),
    Dword(u32),
}

#[derive(Error, Debug)]
pub enum FixupError {
    #[error("offset 0x{0:04X} is outside the segment")]
    OutOfRange(u16),

    #[error("relocation chain does not terminate (revisits 0x{0:04X})")]
    Cycle(u16),

    #[error(transparent)]
    Unsupported(#[from] UnsupportedError),
}

/// Applies `value` starting at `offset`. Returns the number of locations
/// written.
pub fn apply(
    data: &mut [u8],
    offset: u16,
    value: FixupValue,
    additive: bool,
    trace: bool,
) -> Result<usize, FixupError> {
    if additive {
        let at = offset as usize;
        match value {
            FixupValue::Word(v) => {
                let old = read_word(data, at).ok_or(FixupError::OutOfRange(offset))?;
                write_word(data, at, old.wrapping_add(v)).ok_or(FixupError::OutOfRange(offset))?;
            }
            FixupValue::Dword(v) => {
                let old = read_dword(data, at).ok_or(FixupError::OutOfRange(offset))?;
                write_dword(data, at, old.wrapping_add(v)).ok_or(FixupError::OutOfRange(offset))?;
            }
        }
        return Ok(1);
    }

    // A chain visiting more locations than there are words must loop.
    let limit = data.len() / 2 + 1;
    let mut written = 0;
    let mut offset = offset;
    while offset != CHAIN_END {
        if written >= limit {
            return Err(FixupError::Cycle(offset));
        }
        if trace {
            tracing::trace!("            chain offset: {:04X}", offset);
        }
        let at = offset as usize;
        let next = read_word(data, at).ok_or(FixupError::OutOfRange(offset))?;
        let stored = match value {
            FixupValue::Word(v) => write_word(data, at, v),
            FixupValue::Dword(v) => write_dword(data, at, v),
        };
        stored.ok_or(FixupError::OutOfRange(offset))?;
        written += 1;
        offset = next;
    }
    Ok(written)
}

/// Maps the first two bytes of an FPU instruction (read as a little-endian
/// word) to the emulator interrupt replacing them. The second value is the
/// segment-override table the third byte must be translated through, if any.
pub fn map_fp_opcode(opcode: u16) -> Option<(u16, Option<u8>)> {
    let replacement = match opcode {
        0xD89B => 0x34CD,
        0xD99B => 0x35CD,
        0xDA9B => 0x36CD,
        0xDB9B => 0x37CD,
        0xDC9B => 0x38CD,
        0xDD9B => 0x39CD,
        0xDE9B => 0x3ACD,
        0xDF9B => 0x3BCD,
        0x269B => 0x3CCD,
        0x2E9B => return Some((0x3CCD, Some(0x2E))),
        0x369B => return Some((0x3CCD, Some(0x36))),
        0x9B90 => 0x3DCD,
        _ => return None,
    };
    Some((replacement, None))
}

/// Third-byte translation for segment-overridden FPU instructions.
pub fn map_fp_tribyte(table: u8, opcode: u8) -> Option<u8> {
    let mapped = match (table as u16) << 8 | opcode as u16 {
        0x2ED8 => 0x98,
        0x2ED9 => 0x99,
        0x2EDB => 0x9B,
        0x2EDC => 0x9C,
        0x2EDD => 0x9D,
        0x2EDF => 0x9F,
        0x36D8 => 0x58,
        0x36D9 => 0x59,
        0x36DB => 0x5B,
        0x36DD => 0x5D,
        0x36DE => 0x5E,
        0x36DF => 0x5F,
        _ => return None,
    };
    Some(mapped)
}

/// Applies an OS (floating point) fixup in place.
pub fn apply_os_fixup(data: &mut [u8], reloc: &Relocation) -> Result<(), FixupError> {
    let at = reloc.offset as usize;
    let opcode = read_word(data, at).ok_or(FixupError::OutOfRange(reloc.offset))?;
    let (replacement, tribyte) = map_fp_opcode(opcode).ok_or(UnsupportedError::FpFixup {
        offset: reloc.offset,
        opcode: opcode.to_le_bytes(),
        param1: reloc.param1,
        param2: reloc.param2,
    })?;
    write_word(data, at, replacement).ok_or(FixupError::OutOfRange(reloc.offset))?;

    if let Some(table) = tribyte {
        let third = reloc.offset.wrapping_add(2);
        let op = *data.get(third as usize).ok_or(FixupError::OutOfRange(third))?;
        let mapped = map_fp_tribyte(table, op).ok_or(UnsupportedError::FpTriByte { table, opcode: op })?;
        data[third as usize] = mapped;
    }
    Ok(())
}
