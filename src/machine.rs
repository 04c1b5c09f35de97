//! The virtual machine.
//!
//! `Machine` ties the collaborators together: a CPU, the selector heap, the
//! call bridge and the guest-visible environment. Modules and native handlers
//! only ever see a `&mut Machine`.

use crate::bridge::{CallBridge, CALL_COMPLETE_VECTOR, DISPATCH_VECTOR};
use crate::config::{LogOptions, MachineConfig};
use crate::cpu::{Cpu, MiniCpu, Registers, Step};
use crate::error::{CpuFault, Result, VirtualError};
use crate::memory::{GlobalHeap, SelectorHeap};
use crate::paths::PathMapper;
use crate::utils::FarPtr;

/// Stack used for guest calls made before an executable provides its own.
const LOADER_STACK_SIZE: u16 = 0x1000;

/// Longest string `read_string` will scan for a terminator.
const MAX_STRING: usize = 0x10000;

/// Receives `BreakBefore`/`BreakAfter` requests from native exports.
pub trait Debugger {
    fn on_break(&mut self, regs: &Registers, reason: &str);
}

pub struct Machine {
    pub(crate) cpu: Box<dyn Cpu>,
    pub(crate) heap: Box<dyn GlobalHeap>,
    pub(crate) bridge: CallBridge,
    config: MachineConfig,
    paths: PathMapper,
    environment_segment: u16,
    debugger: Option<Box<dyn Debugger>>,
}

impl Machine {
    pub fn new(config: MachineConfig, cpu: Box<dyn Cpu>, mut heap: Box<dyn GlobalHeap>) -> Result<Self> {
        let bridge = CallBridge::new(heap.as_mut())?;
        let stack_name = "Loader Stack";
        let stack = heap
            .alloc(stack_name, 0, LOADER_STACK_SIZE as u32)
            .ok_or_else(|| VirtualError::OutOfMemory {
                name: stack_name.to_string(),
                size: LOADER_STACK_SIZE as u32,
            })?;

        let mut machine = Self {
            cpu,
            heap,
            bridge,
            config,
            paths: PathMapper::new(),
            environment_segment: 0,
            debugger: None,
        };
        let regs = machine.regs_mut();
        regs.ss = stack;
        regs.sp = LOADER_STACK_SIZE;
        Ok(machine)
    }

    /// A machine with the bundled interpreter and selector heap.
    pub fn with_defaults() -> Result<Self> {
        Self::new(
            MachineConfig::default(),
            Box::new(MiniCpu::new()),
            Box::new(SelectorHeap::new()),
        )
    }

    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    pub fn log(&self) -> LogOptions {
        self.config.log
    }

    pub fn regs(&self) -> &Registers {
        self.cpu.regs()
    }

    pub fn regs_mut(&mut self) -> &mut Registers {
        self.cpu.regs_mut()
    }

    pub fn heap(&self) -> &dyn GlobalHeap {
        self.heap.as_ref()
    }

    pub fn heap_mut(&mut self) -> &mut dyn GlobalHeap {
        self.heap.as_mut()
    }

    pub fn paths(&self) -> &PathMapper {
        &self.paths
    }

    pub fn paths_mut(&mut self) -> &mut PathMapper {
        &mut self.paths
    }

    pub fn bridge(&self) -> &CallBridge {
        &self.bridge
    }

    pub fn set_debugger(&mut self, debugger: Box<dyn Debugger>) {
        self.debugger = Some(debugger);
    }

    pub fn debug_break(&mut self, reason: &str) {
        match &mut self.debugger {
            Some(debugger) => debugger.on_break(self.cpu.regs(), reason),
            None => tracing::debug!("Break requested ({}) with no debugger attached", reason),
        }
    }

    pub fn read_byte(&self, ptr: FarPtr) -> Result<u8> {
        Ok(self.heap.read_byte(ptr.selector, ptr.offset)?)
    }

    pub fn write_byte(&mut self, ptr: FarPtr, value: u8) -> Result<()> {
        Ok(self.heap.write_byte(ptr.selector, ptr.offset, value)?)
    }

    pub fn read_word(&self, ptr: FarPtr) -> Result<u16> {
        Ok(u16::from_le_bytes([self.read_byte(ptr)?, self.read_byte(ptr.add(1))?]))
    }

    pub fn write_word(&mut self, ptr: FarPtr, value: u16) -> Result<()> {
        self.write_bytes(ptr, &value.to_le_bytes())
    }

    pub fn read_dword(&self, ptr: FarPtr) -> Result<u32> {
        let lo = self.read_word(ptr)? as u32;
        let hi = self.read_word(ptr.add(2))? as u32;
        Ok(hi << 16 | lo)
    }

    pub fn write_dword(&mut self, ptr: FarPtr, value: u32) -> Result<()> {
        self.write_bytes(ptr, &value.to_le_bytes())
    }

    pub fn read_far_ptr(&self, ptr: FarPtr) -> Result<FarPtr> {
        Ok(FarPtr::from_u32(self.read_dword(ptr)?))
    }

    pub fn read_bytes(&self, ptr: FarPtr, len: usize) -> Result<Vec<u8>> {
        (0..len).map(|i| self.read_byte(ptr.add(i as u16))).collect()
    }

    pub fn write_bytes(&mut self, ptr: FarPtr, bytes: &[u8]) -> Result<()> {
        for (i, byte) in bytes.iter().enumerate() {
            self.write_byte(ptr.add(i as u16), *byte)?;
        }
        Ok(())
    }

    /// Reads a NUL-terminated string. Bytes map one-to-one onto chars.
    pub fn read_string(&self, ptr: FarPtr) -> Result<String> {
        self.read_string_max(ptr, MAX_STRING)
    }

    /// Like `read_string`, stopping after `max` bytes if no NUL was found.
    pub fn read_string_max(&self, ptr: FarPtr, max: usize) -> Result<String> {
        let mut text = String::new();
        for i in 0..max {
            match self.read_byte(ptr.add(i as u16))? {
                0 => break,
                byte => text.push(byte as char),
            }
        }
        Ok(text)
    }

    /// Writes `text` plus a terminator into a buffer of `capacity` bytes,
    /// truncating as needed. Nothing is written when `capacity` is 0.
    pub fn write_string(&mut self, ptr: FarPtr, text: &str, capacity: u16) -> Result<()> {
        if capacity == 0 {
            return Ok(());
        }
        let mut bytes: Vec<u8> = text
            .chars()
            .map(|c| u8::try_from(c as u32).unwrap_or(b'?'))
            .take(capacity as usize - 1)
            .collect();
        bytes.push(0);
        self.write_bytes(ptr, &bytes)
    }

    pub fn push_word(&mut self, value: u16) -> Result<()> {
        let regs = self.regs_mut();
        regs.sp = regs.sp.wrapping_sub(2);
        let top = FarPtr::new(regs.ss, regs.sp);
        self.write_word(top, value)
    }

    /// Pushes a far pointer so that it reads back as one at SS:SP.
    pub fn push_dword(&mut self, value: u32) -> Result<()> {
        self.push_word((value >> 16) as u16)?;
        self.push_word(value as u16)
    }

    pub fn pop_word(&mut self) -> Result<u16> {
        let top = FarPtr::new(self.regs().ss, self.regs().sp);
        let value = self.read_word(top)?;
        self.regs_mut().sp = top.offset.wrapping_add(2);
        Ok(value)
    }

    pub fn dxax(&self) -> u32 {
        self.regs().dxax()
    }

    pub fn set_dxax(&mut self, value: u32) {
        self.regs_mut().set_dxax(value);
    }

    /// Selector of the DOS environment block (`KEY=VALUE\0...\0\0`),
    /// built from the configured environment on first use.
    pub fn dos_environment_segment(&mut self) -> Result<u16> {
        if self.environment_segment != 0 {
            return Ok(self.environment_segment);
        }

        let mut block = Vec::new();
        for (key, value) in &self.config.environment {
            block.extend(format!("{key}={value}").chars().map(|c| u8::try_from(c as u32).unwrap_or(b'?')));
            block.push(0);
        }
        block.push(0);

        let name = "DOS Environment Strings";
        let selector = self
            .heap
            .alloc(name, 0, block.len() as u32)
            .ok_or_else(|| VirtualError::OutOfMemory {
                name: name.to_string(),
                size: block.len() as u32,
            })?;
        let buffer = self
            .heap
            .buffer_mut(selector, true)
            .ok_or(VirtualError::InvalidSelector(selector))?;
        buffer[..block.len()].copy_from_slice(&block);
        self.environment_segment = selector;
        Ok(selector)
    }

    /// Executes one guest instruction, routing software interrupts.
    pub fn step(&mut self) -> Result<()> {
        if let Step::Interrupt(vector) = self.cpu.step(self.heap.as_bus())? {
            self.raise_interrupt(vector)?;
        }
        Ok(())
    }

    pub fn raise_interrupt(&mut self, vector: u8) -> Result<()> {
        match vector {
            DISPATCH_VECTOR => self.dispatch_thunk(),
            CALL_COMPLETE_VECTOR => self.complete_guest_call(),
            _ => Err(self.unhandled_interrupt(vector).into()),
        }
    }

    /// Fault for an interrupt nobody handles, located at the `INT` itself.
    pub(crate) fn unhandled_interrupt(&self, vector: u8) -> CpuFault {
        CpuFault::UnhandledInterrupt {
            vector,
            cs: self.regs().cs,
            ip: self.regs().ip.wrapping_sub(2),
        }
    }
}
