//! Utility types and functions.

use std::fmt;

/// Aligns a size up to the next multiple of `align`, a power of two.
/// `None` if the result doesn't fit in a `u32`.
pub fn align_up(value: u32, align: u32) -> Option<u32> {
    debug_assert!(align.is_power_of_two());
    Some(value.checked_add(align - 1)? & !(align - 1))
}

/// A segmented `selector:offset` address.
///
/// Packs into a `u32` with the selector in the high word, which is also the
/// in-memory layout of a far pointer (offset at the lower address).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FarPtr {
    pub selector: u16,
    pub offset: u16,
}

impl FarPtr {
    pub const NULL: FarPtr = FarPtr { selector: 0, offset: 0 };

    pub const fn new(selector: u16, offset: u16) -> Self {
        Self { selector, offset }
    }

    pub const fn from_u32(value: u32) -> Self {
        Self {
            selector: (value >> 16) as u16,
            offset: value as u16,
        }
    }

    pub const fn to_u32(self) -> u32 {
        (self.selector as u32) << 16 | self.offset as u32
    }

    pub const fn is_null(self) -> bool {
        self.selector == 0 && self.offset == 0
    }

    /// Same selector, offset moved by `delta` (wrapping within the segment).
    pub const fn add(self, delta: u16) -> Self {
        Self {
            selector: self.selector,
            offset: self.offset.wrapping_add(delta),
        }
    }
}

impl fmt::Display for FarPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04X}:{:04X}", self.selector, self.offset)
    }
}

pub fn read_word(data: &[u8], offset: usize) -> Option<u16> {
    let bytes = data.get(offset..offset + 2)?;
    Some(u16::from_le_bytes([bytes[0], bytes[1]]))
}

pub fn write_word(data: &mut [u8], offset: usize, value: u16) -> Option<()> {
    data.get_mut(offset..offset + 2)?
        .copy_from_slice(&value.to_le_bytes());
    Some(())
}

pub fn read_dword(data: &[u8], offset: usize) -> Option<u32> {
    let bytes = data.get(offset..offset + 4)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

pub fn write_dword(data: &mut [u8], offset: usize, value: u32) -> Option<()> {
    data.get_mut(offset..offset + 4)?
        .copy_from_slice(&value.to_le_bytes());
    Some(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn far_pointer_packs_selector_high() {
        let ptr = FarPtr::new(0x1237, 0x0042);
        assert_eq!(ptr.to_u32(), 0x1237_0042);
        assert_eq!(FarPtr::from_u32(0x1237_0042), ptr);
        assert_eq!(ptr.to_string(), "1237:0042");
        assert!(FarPtr::NULL.is_null());
    }

    #[test]
    fn align_up_rounds_to_paragraphs() {
        assert_eq!(align_up(0, 16), Some(0));
        assert_eq!(align_up(1, 16), Some(16));
        assert_eq!(align_up(32, 16), Some(32));
        assert_eq!(align_up(u32::MAX - 3, 16), None);
    }

    #[test]
    fn word_helpers_are_bounds_checked() {
        let mut data = [0u8; 4];
        assert_eq!(write_dword(&mut data, 0, 0xAABBCCDD), Some(()));
        assert_eq!(data, [0xDD, 0xCC, 0xBB, 0xAA]);
        assert_eq!(read_word(&data, 2), Some(0xAABB));
        assert_eq!(read_word(&data, 3), None);
        assert_eq!(write_word(&mut data, 3, 1), None);
    }
}
