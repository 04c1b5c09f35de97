//! Segmented module loader/linker.
//!
//! `SegmentedModule` turns an [`NeImage`] into a running module:
//! 1. Load: one selector per segment. The automatic data segment grows by the
//!    local heap and, for executables, the stack.
//! 2. Link: apply every relocation record (internal references, imports by
//!    ordinal or name, FPU fixups), then patch exported entry prologues.
//! 3. Init: call a library's entry point, or create an executable's local
//!    heap.
//! 4. Run (executables): build the PSP and the initial register state.

use std::path::Path;

use crate::config::ProloguePolicy;
use crate::error::{Error, Result, UnsupportedError, VirtualError};
use crate::fixup::{self, FixupError, FixupValue};
use crate::machine::Machine;
use crate::memory::SEGMENT_LIMIT;
use crate::module::{Module, ModuleResolver, ModuleState};
use crate::ne::relocation::MOVEABLE_SEGMENT;
use crate::ne::{AddressType, NeImage, Relocation, RelocationKind};
use crate::utils::FarPtr;

/// `PUSH DS; POP AX; NOP`, emitted by compilers at every exported entry.
const EXPORT_PROLOGUE: [u8; 3] = [0x1E, 0x58, 0x90];

const PSP_SIZE: u32 = 0x100;
const PSP_ENVIRONMENT: u16 = 0x2C;
const PSP_COMMAND_LENGTH: u16 = 0x80;
const PSP_COMMAND_TAIL: u16 = 0x81;
const MAX_COMMAND_TAIL: usize = 0x7F;

/// How an import names its target.
enum ImportTarget {
    Ordinal(u16),
    Name(String),
}

pub struct SegmentedModule {
    image: NeImage,
    /// Guest path of the module file.
    guest_path: String,
    state: ModuleState,
    /// Selector per segment, in segment order.
    selectors: Vec<u16>,
    data_selector: u16,
    /// Size of the automatic data segment before the heap and stack.
    data_allocation: u32,
    psp: u16,
    show_cmd: u16,
}

impl SegmentedModule {
    pub fn new(image: NeImage) -> Self {
        let guest_path = image.file_name.clone();
        Self {
            image,
            guest_path,
            state: ModuleState::default(),
            selectors: Vec::new(),
            data_selector: 0,
            data_allocation: 0,
            psp: 0,
            show_cmd: 0,
        }
    }

    /// Reads the module at `host_path`, known to the guest as `guest_path`.
    pub fn open(host_path: &Path, guest_path: &str) -> Result<Self> {
        let image = NeImage::open(host_path)?;
        let mut module = Self::new(image);
        module.guest_path = guest_path.to_string();
        Ok(module)
    }

    pub fn image(&self) -> &NeImage {
        &self.image
    }

    pub fn is_dll(&self) -> bool {
        self.image.is_dll()
    }

    pub fn selectors(&self) -> &[u16] {
        &self.selectors
    }

    /// Selector of the automatic data segment, 0 if none.
    pub fn data_selector(&self) -> u16 {
        self.data_selector
    }

    /// Program segment prefix, 0 until `prepare_run`.
    pub fn psp(&self) -> u16 {
        self.psp
    }

    fn stack_top(&self) -> u16 {
        (self.data_allocation + self.image.header.init_stack_size as u32) as u16
    }

    fn entry_address(&self, ordinal: u16) -> Option<FarPtr> {
        let entry = self.image.entry_points.get(&ordinal)?;
        if entry.is_constant() {
            return Some(FarPtr::new(0xFFFF, entry.offset));
        }
        self.segment_address(entry.segment as u16, entry.offset)
    }

    /// `segment` is 1-based.
    fn segment_address(&self, segment: u16, offset: u16) -> Option<FarPtr> {
        let selector = *self.selectors.get((segment as usize).checked_sub(1)?)?;
        (selector != 0).then_some(FarPtr::new(selector, offset))
    }

    /// The header's CS:IP as a guest address.
    fn start_address(&self) -> Result<FarPtr> {
        let header = &self.image.header;
        self.segment_address(header.entry_segment(), header.entry_offset())
            .ok_or_else(|| {
                VirtualError::BadEntryPoint {
                    module: self.image.module_name.clone(),
                    ordinal: 0,
                }
                .into()
            })
    }

    fn require_data_segment(&self) -> Result<u16> {
        match self.data_selector {
            0 => Err(VirtualError::NoDataSegment(self.image.module_name.clone()).into()),
            selector => Ok(selector),
        }
    }

    fn bad_target(&self, segment: usize, detail: String) -> Error {
        VirtualError::BadRelocationTarget {
            module: self.image.module_name.clone(),
            segment: segment + 1,
            detail,
        }
        .into()
    }

    fn resolve_import(
        &self,
        machine: &mut Machine,
        resolver: &dyn ModuleResolver,
        index: u16,
        target: ImportTarget,
    ) -> Result<FarPtr> {
        let module_name = (index as usize)
            .checked_sub(1)
            .and_then(|i| self.image.module_references.get(i))
            .ok_or_else(|| VirtualError::BadModuleReference {
                module: self.image.module_name.clone(),
                index,
            })?;

        let missing_name = |name: String| VirtualError::MissingName {
            module: module_name.clone(),
            name,
        };
        let missing_ordinal = |ordinal: u16| VirtualError::MissingOrdinal {
            module: module_name.clone(),
            ordinal,
        };

        // Imports from ourselves can't go through the resolver: this module
        // is already borrowed for linking.
        if module_name.eq_ignore_ascii_case(&self.image.module_name) {
            let ordinal = match target {
                ImportTarget::Ordinal(ordinal) => ordinal,
                ImportTarget::Name(name) => self.image.ordinal_from_name(&name).ok_or_else(|| missing_name(name))?,
            };
            return Ok(self.entry_address(ordinal).ok_or_else(|| missing_ordinal(ordinal))?);
        }

        let module = resolver
            .resolve(module_name)
            .ok_or_else(|| VirtualError::ModuleNotFound(module_name.clone()))?;
        let mut module = module
            .try_borrow_mut()
            .map_err(|_| VirtualError::ModuleBusy(module_name.clone()))?;
        let ordinal = match target {
            ImportTarget::Ordinal(ordinal) => ordinal,
            ImportTarget::Name(name) => module.ordinal_from_name(&name).ok_or_else(|| missing_name(name))?,
        };
        Ok(module
            .proc_address(machine, ordinal)?
            .ok_or_else(|| missing_ordinal(ordinal))?)
    }

    fn resolve_target(
        &self,
        machine: &mut Machine,
        resolver: &dyn ModuleResolver,
        segment: usize,
        reloc: &Relocation,
    ) -> Result<FarPtr> {
        match reloc.kind {
            RelocationKind::InternalReference if reloc.param1 == MOVEABLE_SEGMENT => {
                self.entry_address(reloc.param2).ok_or_else(|| {
                    VirtualError::BadEntryPoint {
                        module: self.image.module_name.clone(),
                        ordinal: reloc.param2,
                    }
                    .into()
                })
            }
            RelocationKind::InternalReference => self
                .segment_address(reloc.param1, reloc.param2)
                .ok_or_else(|| self.bad_target(segment, format!("no segment {}", reloc.param1))),
            RelocationKind::ImportedOrdinal => {
                self.resolve_import(machine, resolver, reloc.param1, ImportTarget::Ordinal(reloc.param2))
            }
            RelocationKind::ImportedName => {
                let name = self
                    .image
                    .imported_names
                    .get(reloc.param2)
                    .ok_or_else(|| self.bad_target(segment, format!("no imported name at 0x{:04X}", reloc.param2)))?;
                self.resolve_import(machine, resolver, reloc.param1, ImportTarget::Name(name))
            }
            RelocationKind::OsFixup => Err(self.bad_target(segment, "OS fixup has no target".to_string())),
        }
    }

    fn apply_relocation(
        &self,
        machine: &mut Machine,
        resolver: &dyn ModuleResolver,
        segment: usize,
        reloc: &Relocation,
    ) -> Result<()> {
        let selector = self.selectors[segment];
        let trace = machine.log().relocations;
        if trace {
            tracing::trace!(
                "    {} {} at {:04X} p1={:04X} p2={:04X}{}",
                reloc.describe_kind(),
                reloc.address_type,
                reloc.offset,
                reloc.param1,
                reloc.param2,
                if reloc.additive { " additive" } else { "" }
            );
        }

        let fixup_error = |err: FixupError| match err {
            FixupError::Unsupported(err) => Error::from(err),
            other => self.bad_target(segment, other.to_string()),
        };

        if reloc.kind == RelocationKind::OsFixup {
            let data = machine
                .heap_mut()
                .buffer_mut(selector, true)
                .ok_or(VirtualError::InvalidSelector(selector))?;
            return fixup::apply_os_fixup(data, reloc).map_err(fixup_error);
        }

        let target = self.resolve_target(machine, resolver, segment, reloc)?;
        let value = match reloc.address_type {
            AddressType::Selector => FixupValue::Word(target.selector),
            AddressType::Pointer32 => FixupValue::Dword(target.to_u32()),
            AddressType::Offset16 => FixupValue::Word(target.offset),
            other => {
                return Err(UnsupportedError::Relocation {
                    module: self.image.module_name.clone(),
                    kind: reloc.describe_kind(),
                    address_type: other.to_string(),
                }
                .into())
            }
        };
        if trace {
            tracing::trace!("        -> {}", target);
        }

        let data = machine
            .heap_mut()
            .buffer_mut(selector, true)
            .ok_or(VirtualError::InvalidSelector(selector))?;
        fixup::apply(data, reloc.offset, value, reloc.additive, trace).map_err(fixup_error)?;
        Ok(())
    }

    /// Rewrites the `PUSH DS; POP AX` prologue of exported entries:
    /// shared-data entries load the module's own data selector instead, and
    /// executables drop it because callers already pass DS in AX.
    fn patch_prologues(&self, machine: &mut Machine) -> Result<()> {
        let policy = machine.config().prologue;
        let module = &self.image.module_name;

        for entry in self.image.entry_points.values() {
            if !entry.is_exported() || entry.is_constant() {
                continue;
            }
            let shared = entry.uses_shared_data();
            if !shared && self.is_dll() {
                continue;
            }

            let bad_entry = || VirtualError::BadEntryPoint {
                module: module.clone(),
                ordinal: entry.ordinal,
            };
            let address = self
                .segment_address(entry.segment as u16, entry.offset)
                .ok_or_else(bad_entry)?;
            let data = machine
                .heap_mut()
                .buffer_mut(address.selector, true)
                .ok_or(VirtualError::InvalidSelector(address.selector))?;
            let at = address.offset as usize;
            let code = data.get_mut(at..at + 3).ok_or_else(bad_entry)?;

            if *code != EXPORT_PROLOGUE {
                let found = [code[0], code[1], code[2]];
                if policy == ProloguePolicy::Strict {
                    return Err(VirtualError::BadPrologue {
                        module: module.clone(),
                        location: address.to_string(),
                        found,
                    }
                    .into());
                }
                tracing::warn!(
                    "Patching exported entry #{} of {} at {} though its prologue is {:02X?}",
                    entry.ordinal,
                    module,
                    address,
                    found
                );
            }

            if shared {
                code[0] = 0xB8; // MOV AX, data selector
                code[1..3].copy_from_slice(&self.data_selector.to_le_bytes());
            } else {
                code[0] = 0x90;
                code[1] = 0x90;
            }
        }
        Ok(())
    }

    /// Points SS:SP at the top of the stack in the automatic data segment.
    /// Executables only, before any library init runs on that stack.
    pub fn prepare_stack(&self, machine: &mut Machine) -> Result<()> {
        let ss = self.require_data_segment()?;
        let regs = machine.regs_mut();
        regs.ss = ss;
        regs.sp = self.stack_top();
        Ok(())
    }

    /// Builds the program segment prefix and sets the registers the task
    /// start-up code expects.
    pub fn prepare_run(&mut self, machine: &mut Machine, command_tail: &str, show_cmd: u16) -> Result<()> {
        if self.is_dll() {
            return Err(VirtualError::NotAnExecutable(self.image.module_name.clone()).into());
        }
        let data_selector = self.require_data_segment()?;
        if command_tail.len() > MAX_COMMAND_TAIL {
            return Err(VirtualError::CommandLineTooLong(command_tail.len()).into());
        }
        let start = self.start_address()?;

        if self.psp != 0 {
            machine.heap_mut().free(self.psp);
            self.psp = 0;
        }
        let name = format!("Module '{}' program segment prefix", self.image.module_name);
        let psp = machine
            .heap_mut()
            .alloc(&name, 0, PSP_SIZE)
            .ok_or(VirtualError::OutOfMemory { name, size: PSP_SIZE })?;
        self.psp = psp;
        self.show_cmd = show_cmd;

        let environment = machine.dos_environment_segment()?;
        machine.write_bytes(FarPtr::new(psp, 0), &[0xCD, 0x20])?;
        machine.write_word(FarPtr::new(psp, PSP_ENVIRONMENT), environment)?;
        machine.write_byte(FarPtr::new(psp, PSP_COMMAND_LENGTH), command_tail.len() as u8)?;
        let tail = FarPtr::new(psp, PSP_COMMAND_TAIL);
        machine.write_bytes(tail, command_tail.as_bytes())?;
        if command_tail.len() < MAX_COMMAND_TAIL {
            machine.write_byte(tail.add(command_tail.len() as u16), 0)?;
        }

        let header = &self.image.header;
        let regs = machine.regs_mut();
        regs.ss = data_selector;
        regs.sp = self.stack_top();
        regs.ds = data_selector;
        regs.cs = start.selector;
        regs.ip = start.offset;
        regs.bx = header.init_stack_size;
        regs.cx = header.init_heap_size;
        regs.di = self.state.handle;
        regs.si = 0;
        regs.es = psp;

        tracing::debug!("{} ready to run at {} with PSP {:04X}", self.image.module_name, start, psp);
        Ok(())
    }

    /// Task initialization as seen by the start-up code. Returns the PSP, or
    /// 0 when there is no data segment.
    ///
    /// The caller's far return address stays on top of the stack but gains a
    /// zero word beneath it, as the real implementation leaves behind.
    pub fn init_task(&self, machine: &mut Machine) -> Result<u16> {
        if self.data_selector == 0 {
            return Ok(0);
        }

        let regs = machine.regs_mut();
        regs.bx = PSP_COMMAND_TAIL;
        regs.es = self.psp;
        regs.cx = self.data_allocation as u16;
        regs.dx = self.show_cmd;
        regs.di = self.state.handle;
        regs.bp = regs.sp;
        regs.ds = self.data_selector;

        let ss = regs.ss;
        let mut sp = regs.sp;
        let return_address = machine.read_dword(FarPtr::new(ss, sp))?;
        sp = sp.wrapping_add(4).wrapping_sub(2);
        machine.write_word(FarPtr::new(ss, sp), 0)?;
        sp = sp.wrapping_sub(4);
        machine.write_dword(FarPtr::new(ss, sp), return_address)?;
        machine.regs_mut().sp = sp;

        Ok(self.psp)
    }
}

impl Module for SegmentedModule {
    fn name(&self) -> &str {
        &self.image.module_name
    }

    fn file_name(&self) -> Option<&str> {
        Some(&self.guest_path)
    }

    fn state(&self) -> &ModuleState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut ModuleState {
        &mut self.state
    }

    fn referenced_modules(&self) -> Vec<String> {
        self.image.module_references.clone()
    }

    fn load(&mut self, machine: &mut Machine) -> Result<()> {
        let data_index = self.image.data_segment_index();
        let header = self.image.header.clone();
        tracing::debug!("Loading {} ({} segments)", self.image.module_name, self.image.segments.len());

        for (index, segment) in self.image.segments.iter().enumerate() {
            let mut size = segment.allocation_size;
            if Some(index) == data_index {
                self.data_allocation = size;
                size += header.init_heap_size as u32;
                if !self.image.is_dll() {
                    size += header.init_stack_size as u32;
                }
            }

            let name = format!(
                "Module '{}' segment {} ({})",
                self.image.module_name,
                index + 1,
                segment.describe()
            );
            if size > SEGMENT_LIMIT {
                return Err(VirtualError::OutOfMemory { name, size }.into());
            }
            let heap = machine.heap_mut();
            let selector = heap
                .alloc(&name, segment.flags.bits(), size)
                .ok_or_else(|| VirtualError::OutOfMemory {
                    name: name.clone(),
                    size,
                })?;
            // Recorded straight away so an unwind frees it.
            self.selectors.push(selector);

            let buffer = heap
                .buffer_mut(selector, false)
                .ok_or(VirtualError::InvalidSelector(selector))?;
            buffer[..segment.data.len()].copy_from_slice(&segment.data);
            heap.set_file_source(selector, &self.guest_path, segment.file_offset);
            let selector = heap.set_selector_attributes(selector, !segment.is_data(), segment.is_read_only());
            self.selectors[index] = selector;

            if Some(index) == data_index {
                self.data_selector = selector;
            }
            tracing::trace!("  segment {} -> {:04X} (0x{:X} bytes)", index + 1, selector, size);
        }
        Ok(())
    }

    fn link(&mut self, machine: &mut Machine, resolver: &dyn ModuleResolver) -> Result<()> {
        tracing::debug!("Linking {}", self.image.module_name);
        for (index, segment) in self.image.segments.iter().enumerate() {
            if machine.log().relocations && !segment.relocations.is_empty() {
                tracing::trace!("  segment {}: {} relocations", index + 1, segment.relocations.len());
            }
            for reloc in &segment.relocations {
                self.apply_relocation(machine, resolver, index, reloc)?;
            }
        }
        self.patch_prologues(machine)
    }

    fn init(&mut self, machine: &mut Machine) -> Result<()> {
        let header = self.image.header.clone();

        if !self.is_dll() {
            if self.data_selector != 0 {
                let base = self.stack_top();
                let local_heap = machine
                    .heap_mut()
                    .create_local_heap(self.data_selector, base, header.init_heap_size);
                if local_heap.is_none() {
                    tracing::warn!("No room for the local heap of {}", self.image.module_name);
                }
            }
            return Ok(());
        }

        if header.entry_point == 0 || !machine.config().run_init {
            return Ok(());
        }

        let start = self.start_address()?;
        let saved_ds = machine.regs().ds;
        let regs = machine.regs_mut();
        regs.di = self.state.handle;
        regs.ds = self.data_selector;
        regs.cx = header.init_heap_size;

        let result = machine.call_into_guest(start, &format!("{}.LibMain", self.image.module_name));
        machine.regs_mut().ds = saved_ds;
        result?;

        if machine.regs().ax == 0 {
            tracing::warn!("LibMain of {} returned 0", self.image.module_name);
        }
        Ok(())
    }

    fn uninit(&mut self, machine: &mut Machine) -> Result<()> {
        if self.psp != 0 {
            machine.heap_mut().free(self.psp);
            self.psp = 0;
        }
        Ok(())
    }

    fn unload(&mut self, machine: &mut Machine) -> Result<()> {
        tracing::debug!("Unloading {}", self.image.module_name);
        for selector in self.selectors.drain(..) {
            if !machine.heap_mut().free(selector) {
                tracing::warn!("Selector {:04X} was already free", selector);
            }
        }
        self.data_selector = 0;
        Ok(())
    }

    fn ordinal_from_name(&self, name: &str) -> Option<u16> {
        self.image.ordinal_from_name(name)
    }

    fn name_from_ordinal(&self, ordinal: u16) -> Option<String> {
        self.image.name_from_ordinal(ordinal).map(str::to_string)
    }

    fn proc_address(&mut self, _machine: &mut Machine, ordinal: u16) -> Result<Option<FarPtr>> {
        Ok(self.entry_address(ordinal))
    }

    fn exports(&self) -> Vec<(u16, String)> {
        self.image
            .exports()
            .map(|(ordinal, name)| (ordinal, name.to_string()))
            .collect()
    }

    fn as_segmented(&self) -> Option<&SegmentedModule> {
        Some(self)
    }

    fn as_segmented_mut(&mut self) -> Option<&mut SegmentedModule> {
        Some(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MachineConfig;
    use crate::cpu::MiniCpu;
    use crate::marshal::Value;
    use crate::memory::SelectorHeap;
    use crate::module::ModuleRef;
    use crate::native::{NativeExport, NativeModule};
    use crate::ne::{AppFlags, EntryFlags, EntryPoint, Segment};
    use pretty_assertions::assert_eq;
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::rc::Rc;

    #[derive(Default)]
    struct Resolver(HashMap<String, ModuleRef>);

    impl Resolver {
        fn with(mut self, module: ModuleRef) -> Self {
            let name = module.borrow().name().to_string();
            self.0.insert(name, module);
            self
        }
    }

    impl ModuleResolver for Resolver {
        fn resolve(&self, name: &str) -> Option<ModuleRef> {
            self.0.get(&name.to_ascii_uppercase()).cloned()
        }
    }

    fn code_at(machine: &Machine, selector: u16, offset: usize, len: usize) -> Vec<u8> {
        machine.heap().buffer(selector).unwrap()[offset..offset + len].to_vec()
    }

    /// An executable with a code segment (chained selector fixup at 2 and 6,
    /// exported entries at 0x10 and 0x20) and a data segment.
    fn app_image() -> NeImage {
        let mut code = vec![0u8; 0x30];
        code[2..4].copy_from_slice(&6u16.to_le_bytes());
        code[6..8].copy_from_slice(&0xFFFFu16.to_le_bytes());
        code[0x10..0x13].copy_from_slice(&EXPORT_PROLOGUE);
        code[0x20..0x23].copy_from_slice(&EXPORT_PROLOGUE);

        let mut image = NeImage::new("APP");
        image.file_name = "C:\\APP\\APP.EXE".to_string();
        image.header.auto_data_segment = 2;
        image.header.init_heap_size = 0x200;
        image.header.init_stack_size = 0x400;
        image.header.entry_point = 0x0001_0010;
        image.segments.push(Segment::code(code).with_relocations(vec![Relocation::new(
            RelocationKind::InternalReference,
            AddressType::Selector,
            2,
            2,
            0,
        )]));
        image.segments.push(Segment::data(vec![1, 2, 3, 4], 0x100));
        image.add_entry_point(EntryPoint::new(1, 1, 0x10, EntryFlags::EXPORTED));
        image.add_entry_point(EntryPoint::new(2, 1, 0x20, EntryFlags::EXPORTED | EntryFlags::SHARED_DATA));
        image.add_export(1, "WndProc");
        image.add_export(2, "DlgProc");
        image
    }

    #[test]
    fn load_sizes_the_auto_data_segment() {
        let mut machine = Machine::with_defaults().unwrap();
        let mut module = SegmentedModule::new(app_image());
        module.load(&mut machine).unwrap();

        assert_eq!(module.selectors().len(), 2);
        let data = module.data_selector();
        assert_eq!(data, module.selectors()[1]);
        assert_eq!(machine.heap().size(data), Some(0x100 + 0x200 + 0x400));
        assert_eq!(code_at(&machine, data, 0, 5), vec![1, 2, 3, 4, 0]);
        assert_eq!(module.selectors()[0] & 3, 2, "code selector");

        module.prepare_stack(&mut machine).unwrap();
        assert_eq!((machine.regs().ss, machine.regs().sp), (data, 0x500));
    }

    #[test]
    fn link_walks_chains_and_patches_prologues() {
        let mut machine = Machine::with_defaults().unwrap();
        let mut module = SegmentedModule::new(app_image());
        module.load(&mut machine).unwrap();
        module.link(&mut machine, &Resolver::default()).unwrap();

        let code = module.selectors()[0];
        let data = module.data_selector().to_le_bytes();
        assert_eq!(code_at(&machine, code, 2, 2), data.to_vec());
        assert_eq!(code_at(&machine, code, 6, 2), data.to_vec());
        assert_eq!(code_at(&machine, code, 4, 2), vec![0, 0]);

        assert_eq!(code_at(&machine, code, 0x10, 3), vec![0x90, 0x90, 0x90]);
        assert_eq!(code_at(&machine, code, 0x20, 3), vec![0xB8, data[0], data[1]]);

        assert_eq!(module.proc_address(&mut machine, 2).unwrap(), Some(FarPtr::new(code, 0x20)));
        assert_eq!(module.proc_address(&mut machine, 9).unwrap(), None);
    }

    #[test]
    fn strict_policy_rejects_unexpected_prologues() {
        let config = MachineConfig {
            prologue: ProloguePolicy::Strict,
            ..MachineConfig::default()
        };
        let mut machine = Machine::new(config, Box::new(MiniCpu::new()), Box::new(SelectorHeap::new())).unwrap();
        let mut image = app_image();
        image.segments[0].data[0x20] = 0x55;
        let mut module = SegmentedModule::new(image);
        module.load(&mut machine).unwrap();

        let err = module.link(&mut machine, &Resolver::default()).unwrap_err();
        assert!(matches!(
            err,
            Error::Virtual(VirtualError::BadPrologue {
                found: [0x55, 0x58, 0x90],
                ..
            })
        ));
    }

    #[test]
    fn imports_resolve_by_ordinal_and_name() {
        let mut machine = Machine::with_defaults().unwrap();
        let gdi: ModuleRef = Rc::new(RefCell::new(
            NativeModule::new("GDI")
                .with_export(NativeExport::nop(1, "SetPixel"))
                .with_export(NativeExport::nop(2, "LineTo")),
        ));
        let resolver = Resolver::default().with(gdi.clone());

        let mut image = NeImage::new("VIEWER");
        image.header.app_flags = AppFlags::DLL;
        let gdi_index = image.add_module_reference("GDI");
        let line_to = image.imported_names.push("lineto");
        let mut code = vec![0u8; 12];
        code[0..2].copy_from_slice(&[0xFF, 0xFF]);
        code[4..6].copy_from_slice(&[0xFF, 0xFF]);
        image.segments.push(Segment::code(code).with_relocations(vec![
            Relocation::new(RelocationKind::ImportedOrdinal, AddressType::Pointer32, 0, gdi_index, 1),
            Relocation::new(RelocationKind::ImportedName, AddressType::Offset16, 4, gdi_index, line_to),
            Relocation::new(RelocationKind::ImportedName, AddressType::Selector, 8, gdi_index, line_to).additive(),
        ]));
        let mut module = SegmentedModule::new(image);
        module.load(&mut machine).unwrap();
        module.link(&mut machine, &resolver).unwrap();

        let set_pixel = gdi.borrow_mut().proc_address(&mut machine, 1).unwrap().unwrap();
        let line_to = gdi.borrow_mut().proc_address(&mut machine, 2).unwrap().unwrap();
        let code = module.selectors()[0];
        let bytes = code_at(&machine, code, 0, 10);
        assert_eq!(bytes[0..4], set_pixel.to_u32().to_le_bytes());
        assert_eq!(bytes[4..6], line_to.offset.to_le_bytes());
        assert_eq!(bytes[8..10], line_to.selector.to_le_bytes());
    }

    #[test]
    fn missing_imports_are_guest_errors() {
        let mut machine = Machine::with_defaults().unwrap();
        let tools: ModuleRef = Rc::new(RefCell::new(SegmentedModule::new(NeImage::new("TOOLS"))));
        let resolver = Resolver::default().with(tools);

        let mut image = NeImage::new("APP2");
        image.header.app_flags = AppFlags::DLL;
        let tools_index = image.add_module_reference("TOOLS");
        image.segments.push(Segment::code(vec![0u8; 4]).with_relocations(vec![Relocation::new(
            RelocationKind::ImportedOrdinal,
            AddressType::Pointer32,
            0,
            tools_index,
            0x1F,
        )]));
        let mut module = SegmentedModule::new(image);
        module.load(&mut machine).unwrap();

        let err = module.link(&mut machine, &resolver).unwrap_err();
        assert!(err.is_recoverable());
        assert_eq!(
            err.to_string(),
            "module link failed, function ordinal #001F not found in module 'TOOLS'"
        );
    }

    #[test]
    fn library_entry_point_runs_with_conventional_registers() {
        let mut machine = Machine::with_defaults().unwrap();
        let seen = Rc::new(RefCell::new(None));
        let record = seen.clone();
        let probe: ModuleRef = Rc::new(RefCell::new(NativeModule::new("PROBE").with_export(NativeExport::new(
            1,
            "Probe",
            move |m: &mut Machine, _: &mut [Value]| {
                let regs = m.regs();
                *record.borrow_mut() = Some((regs.di, regs.ds, regs.cx));
                Ok(Value::U16(1))
            },
        ).returns(crate::marshal::ReturnType::U16))));
        let resolver = Resolver::default().with(probe);

        let mut image = NeImage::new("LIB");
        image.header.app_flags = AppFlags::DLL;
        image.header.auto_data_segment = 2;
        image.header.init_heap_size = 0x80;
        image.header.entry_point = 0x0001_0000;
        let probe_index = image.add_module_reference("PROBE");
        // CALL FAR PROBE.1; RETF
        image.segments.push(
            Segment::code(vec![0x9A, 0xFF, 0xFF, 0x00, 0x00, 0xCB]).with_relocations(vec![Relocation::new(
                RelocationKind::ImportedOrdinal,
                AddressType::Pointer32,
                1,
                probe_index,
                1,
            )]),
        );
        image.segments.push(Segment::data(vec![], 0x10));

        let mut module = SegmentedModule::new(image);
        module.state_mut().handle = 0x0107;
        module.load(&mut machine).unwrap();
        module.link(&mut machine, &resolver).unwrap();
        machine.regs_mut().ds = 0x4242;
        module.init(&mut machine).unwrap();

        assert_eq!(*seen.borrow(), Some((0x0107, module.data_selector(), 0x80)));
        assert_eq!(machine.regs().ds, 0x4242);
        assert_eq!(machine.regs().ax, 1);
    }

    #[test]
    fn executables_get_a_psp_and_start_up_registers() {
        let mut machine = Machine::with_defaults().unwrap();
        let mut module = SegmentedModule::new(app_image());
        module.state_mut().handle = 0x0207;
        module.load(&mut machine).unwrap();
        module.link(&mut machine, &Resolver::default()).unwrap();
        module.init(&mut machine).unwrap();

        let too_long = "x".repeat(128);
        assert!(matches!(
            module.prepare_run(&mut machine, &too_long, 1),
            Err(Error::Virtual(VirtualError::CommandLineTooLong(128)))
        ));

        module.prepare_run(&mut machine, "/s file.txt", 5).unwrap();
        let psp = module.psp();
        let data = module.data_selector();
        let regs = machine.regs().clone();
        assert_eq!((regs.cs, regs.ip), (module.selectors()[0], 0x10));
        assert_eq!((regs.ss, regs.sp, regs.ds, regs.es), (data, 0x500, data, psp));
        assert_eq!((regs.bx, regs.cx, regs.di, regs.si), (0x400, 0x200, 0x0207, 0));

        assert_eq!(machine.read_bytes(FarPtr::new(psp, 0), 2).unwrap(), vec![0xCD, 0x20]);
        let env = machine.dos_environment_segment().unwrap();
        assert_eq!(machine.read_word(FarPtr::new(psp, 0x2C)).unwrap(), env);
        assert_eq!(machine.read_byte(FarPtr::new(psp, 0x80)).unwrap(), 11);
        assert_eq!(machine.read_string(FarPtr::new(psp, 0x81)).unwrap(), "/s file.txt");

        // Start-up code calls InitTask with a far return address on the stack.
        machine.push_dword(0x1234_5678).unwrap();
        let sp = machine.regs().sp;
        assert_eq!(module.init_task(&mut machine).unwrap(), psp);
        let regs = machine.regs().clone();
        assert_eq!((regs.bx, regs.es, regs.cx, regs.dx), (0x81, psp, 0x100, 5));
        assert_eq!(regs.sp, sp - 2);
        assert_eq!(machine.read_dword(FarPtr::new(data, regs.sp)).unwrap(), 0x1234_5678);
        assert_eq!(machine.read_word(FarPtr::new(data, regs.sp + 4)).unwrap(), 0);
    }

    #[test]
    fn running_again_replaces_the_psp() {
        let mut machine = Machine::with_defaults().unwrap();
        let mut module = SegmentedModule::new(app_image());
        module.load(&mut machine).unwrap();
        module.link(&mut machine, &Resolver::default()).unwrap();

        module.prepare_run(&mut machine, "first", 1).unwrap();
        let first = module.psp();
        module.prepare_run(&mut machine, "second", 1).unwrap();
        let second = module.psp();
        assert_eq!(machine.read_string(FarPtr::new(second, 0x81)).unwrap(), "second");

        module.uninit(&mut machine).unwrap();
        assert_eq!(module.psp(), 0);
        assert_eq!(machine.heap().size(first), None);
        assert_eq!(machine.heap().size(second), None);
    }

    #[test]
    fn libraries_cannot_run() {
        let mut machine = Machine::with_defaults().unwrap();
        let mut image = app_image();
        image.header.app_flags = AppFlags::DLL;
        let mut module = SegmentedModule::new(image);
        module.load(&mut machine).unwrap();
        assert!(matches!(
            module.prepare_run(&mut machine, "", 1),
            Err(Error::Virtual(VirtualError::NotAnExecutable(_)))
        ));
    }

    #[test]
    fn unload_frees_every_selector() {
        let mut machine = Machine::with_defaults().unwrap();
        let mut module = SegmentedModule::new(app_image());
        module.load(&mut machine).unwrap();
        let selectors = module.selectors().to_vec();
        module.unload(&mut machine).unwrap();
        assert!(module.selectors().is_empty());
        for selector in selectors {
            assert_eq!(machine.heap().size(selector), None);
        }
    }
}
