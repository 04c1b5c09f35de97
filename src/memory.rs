//! Selector-addressed guest memory.
//!
//! [`GlobalHeap`] is the interface the loader and call bridge consume.
//! [`SelectorHeap`] is an in-process implementation: every allocation gets one
//! selector addressing at most 64K, code and read-only selectors reject guest
//! writes, and `buffer_mut` gives the loader direct access regardless.

use std::collections::BTreeMap;

use crate::cpu::MemoryBus;
use crate::error::CpuFault;
use crate::utils::align_up;

/// Largest allocation a single selector can address.
pub const SEGMENT_LIMIT: u32 = 0x10000;

/// Where a selector's initial contents came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSource {
    pub file_name: String,
    pub offset: u32,
}

/// A local (sub-)heap placed inside a data segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalHeap {
    pub selector: u16,
    pub base: u16,
    pub size: u16,
}

pub trait GlobalHeap {
    /// Allocates `size` zeroed bytes. `None` when out of memory.
    fn alloc(&mut self, name: &str, flags: u16, size: u32) -> Option<u16>;

    /// Releases a selector. Returns false if it was not allocated.
    fn free(&mut self, selector: u16) -> bool;

    fn size(&self, selector: u16) -> Option<u32>;

    /// Mutable view of a selector's storage, bypassing protection.
    fn buffer_mut(&mut self, selector: u16, mark_modified: bool) -> Option<&mut [u8]>;

    fn buffer(&self, selector: u16) -> Option<&[u8]>;

    /// Tags a selector as code and/or read-only. Returns the (possibly
    /// renumbered) selector value the guest must use from now on.
    fn set_selector_attributes(&mut self, selector: u16, is_code: bool, read_only: bool) -> u16;

    fn set_file_source(&mut self, selector: u16, file_name: &str, offset: u32);

    fn create_local_heap(&mut self, selector: u16, base: u16, size: u16) -> Option<LocalHeap>;

    fn read_byte(&self, selector: u16, offset: u16) -> Result<u8, CpuFault>;

    fn write_byte(&mut self, selector: u16, offset: u16, value: u8) -> Result<(), CpuFault>;

    fn as_bus(&mut self) -> &mut dyn MemoryBus;
}

#[derive(Debug)]
struct Allocation {
    name: String,
    flags: u16,
    buffer: Vec<u8>,
    is_code: bool,
    read_only: bool,
    modified: bool,
    source: Option<FileSource>,
    local_heap: Option<LocalHeap>,
}

/// Summary of one live selector, for dumps and diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectorInfo {
    pub selector: u16,
    pub name: String,
    pub size: u32,
    pub is_code: bool,
    pub read_only: bool,
    pub source: Option<FileSource>,
}

#[derive(Debug, Default)]
pub struct SelectorHeap {
    /// Keyed by selector index (selector >> 3).
    slots: BTreeMap<u16, Allocation>,
    next_index: u16,
    free_indices: Vec<u16>,
}

impl SelectorHeap {
    pub fn new() -> Self {
        Self {
            slots: BTreeMap::new(),
            // Index 0 would produce the null selector.
            next_index: 1,
            free_indices: Vec::new(),
        }
    }

    fn selector_value(index: u16, is_code: bool) -> u16 {
        (index << 3) | if is_code { 0x02 } else { 0x03 }
    }

    fn slot(&self, selector: u16) -> Option<&Allocation> {
        self.slots.get(&(selector >> 3))
    }

    fn slot_mut(&mut self, selector: u16) -> Option<&mut Allocation> {
        self.slots.get_mut(&(selector >> 3))
    }

    pub fn is_allocated(&self, selector: u16) -> bool {
        self.slot(selector).is_some()
    }

    pub fn local_heap(&self, selector: u16) -> Option<LocalHeap> {
        self.slot(selector)?.local_heap
    }

    pub fn flags(&self, selector: u16) -> Option<u16> {
        Some(self.slot(selector)?.flags)
    }

    pub fn is_modified(&self, selector: u16) -> bool {
        self.slot(selector).is_some_and(|a| a.modified)
    }

    pub fn selectors(&self) -> Vec<SelectorInfo> {
        self.slots
            .iter()
            .map(|(index, a)| SelectorInfo {
                selector: Self::selector_value(*index, a.is_code),
                name: a.name.clone(),
                size: a.buffer.len() as u32,
                is_code: a.is_code,
                read_only: a.read_only,
                source: a.source.clone(),
            })
            .collect()
    }
}

impl GlobalHeap for SelectorHeap {
    fn alloc(&mut self, name: &str, flags: u16, size: u32) -> Option<u16> {
        let size = align_up(size.max(1), 16).filter(|&size| size <= SEGMENT_LIMIT)?;
        let index = match self.free_indices.pop() {
            Some(index) => index,
            None => {
                // Index 0x1FFF is the last one that fits in a selector.
                if self.next_index > 0x1FFF {
                    return None;
                }
                let index = self.next_index;
                self.next_index += 1;
                index
            }
        };
        self.slots.insert(
            index,
            Allocation {
                name: name.to_string(),
                flags,
                buffer: vec![0; size as usize],
                is_code: false,
                read_only: false,
                modified: false,
                source: None,
                local_heap: None,
            },
        );
        tracing::trace!("Allocated selector 0x{:04X} (0x{:X} bytes) {}", Self::selector_value(index, false), size, name);
        Some(Self::selector_value(index, false))
    }

    fn free(&mut self, selector: u16) -> bool {
        let index = selector >> 3;
        if index == 0 || self.slots.remove(&index).is_none() {
            return false;
        }
        self.free_indices.push(index);
        true
    }

    fn size(&self, selector: u16) -> Option<u32> {
        Some(self.slot(selector)?.buffer.len() as u32)
    }

    fn buffer_mut(&mut self, selector: u16, mark_modified: bool) -> Option<&mut [u8]> {
        let slot = self.slot_mut(selector)?;
        if mark_modified {
            slot.modified = true;
        }
        Some(&mut slot.buffer)
    }

    fn buffer(&self, selector: u16) -> Option<&[u8]> {
        Some(&self.slot(selector)?.buffer)
    }

    fn set_selector_attributes(&mut self, selector: u16, is_code: bool, read_only: bool) -> u16 {
        match self.slot_mut(selector) {
            Some(slot) => {
                slot.is_code = is_code;
                slot.read_only = read_only;
                Self::selector_value(selector >> 3, is_code)
            }
            None => selector,
        }
    }

    fn set_file_source(&mut self, selector: u16, file_name: &str, offset: u32) {
        if let Some(slot) = self.slot_mut(selector) {
            slot.source = Some(FileSource {
                file_name: file_name.to_string(),
                offset,
            });
        }
    }

    fn create_local_heap(&mut self, selector: u16, base: u16, size: u16) -> Option<LocalHeap> {
        let slot = self.slot_mut(selector)?;
        if base as usize + size as usize > slot.buffer.len() {
            return None;
        }
        let heap = LocalHeap {
            selector,
            base,
            size,
        };
        slot.local_heap = Some(heap);
        Some(heap)
    }

    fn read_byte(&self, selector: u16, offset: u16) -> Result<u8, CpuFault> {
        let slot = self
            .slot(selector)
            .ok_or(CpuFault::SegmentNotPresent(selector))?;
        slot.buffer
            .get(offset as usize)
            .copied()
            .ok_or(CpuFault::GeneralProtection {
                selector,
                offset,
                write: false,
            })
    }

    fn write_byte(&mut self, selector: u16, offset: u16, value: u8) -> Result<(), CpuFault> {
        let slot = self
            .slot_mut(selector)
            .ok_or(CpuFault::SegmentNotPresent(selector))?;
        let fault = CpuFault::GeneralProtection {
            selector,
            offset,
            write: true,
        };
        if slot.is_code || slot.read_only {
            return Err(fault);
        }
        let byte = slot.buffer.get_mut(offset as usize).ok_or(fault)?;
        *byte = value;
        slot.modified = true;
        Ok(())
    }

    fn as_bus(&mut self) -> &mut dyn MemoryBus {
        self
    }
}

impl MemoryBus for SelectorHeap {
    fn read_byte(&self, selector: u16, offset: u16) -> Result<u8, CpuFault> {
        GlobalHeap::read_byte(self, selector, offset)
    }

    fn write_byte(&mut self, selector: u16, offset: u16, value: u8) -> Result<(), CpuFault> {
        GlobalHeap::write_byte(self, selector, offset, value)
    }
}
