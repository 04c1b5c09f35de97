//! Native/emulated call bridge.
//!
//! All generated code lives in one system code segment:
//! - offset 0 holds the shared return stub (`INT 81h`),
//! - thunks: `[PUSH AX] MOV AX,index; INT 80h; RETF [n]`,
//! - proc instances: `MOV AX,ds; JMP FAR target`.
//!
//! Guest code calling a thunk traps into `dispatch_thunk`, which runs the
//! registered handler. Native code calls guest code with `call_into_guest`,
//! which runs the CPU until the return stub brings the call depth back down.

use std::collections::{BTreeSet, VecDeque};
use std::rc::Rc;

use crate::error::{Result, VirtualError};
use crate::machine::Machine;
use crate::memory::{GlobalHeap, SEGMENT_LIMIT};
use crate::utils::FarPtr;

/// `INT` vector generated thunks use to enter native code. AX holds the
/// thunk index.
pub const DISPATCH_VECTOR: u8 = 0x80;
/// `INT` vector of the shared return stub.
pub const CALL_COMPLETE_VECTOR: u8 = 0x81;

const PROC_INSTANCE_SIZE: u16 = 8;

pub type ThunkHandler = Rc<dyn Fn(&mut Machine) -> Result<()>>;

pub struct ThunkEntry {
    pub index: u16,
    pub name: String,
    pub address: FarPtr,
    handler: ThunkHandler,
}

pub struct CallBridge {
    code_selector: u16,
    /// Next free byte in the code segment.
    gen_pos: u32,
    thunks: Vec<ThunkEntry>,
    live_proc_instances: BTreeSet<u16>,
    free_proc_instances: VecDeque<u16>,
    sys_ret: FarPtr,
    depth: u32,
}

impl CallBridge {
    pub fn new(heap: &mut dyn GlobalHeap) -> Result<Self> {
        let name = "System Thunks";
        let selector = heap
            .alloc(name, 0, SEGMENT_LIMIT)
            .ok_or_else(|| VirtualError::OutOfMemory {
                name: name.to_string(),
                size: SEGMENT_LIMIT,
            })?;
        let code_selector = heap.set_selector_attributes(selector, true, true);

        let mut bridge = Self {
            code_selector,
            gen_pos: 0,
            thunks: Vec::new(),
            live_proc_instances: BTreeSet::new(),
            free_proc_instances: VecDeque::new(),
            sys_ret: FarPtr::NULL,
            depth: 0,
        };
        bridge.sys_ret = bridge.emit(heap, &[0xCD, CALL_COMPLETE_VECTOR])?;
        Ok(bridge)
    }

    pub fn code_selector(&self) -> u16 {
        self.code_selector
    }

    pub fn sys_ret(&self) -> FarPtr {
        self.sys_ret
    }

    /// Number of native->guest calls currently in progress.
    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn thunks(&self) -> &[ThunkEntry] {
        &self.thunks
    }

    pub fn thunk(&self, index: u16) -> Option<&ThunkEntry> {
        self.thunks.get(index as usize)
    }

    pub fn thunk_at(&self, address: FarPtr) -> Option<&ThunkEntry> {
        self.thunks.iter().find(|t| t.address == address)
    }

    pub fn handler(&self, index: u16) -> Option<ThunkHandler> {
        self.thunk(index).map(|t| Rc::clone(&t.handler))
    }

    fn write_code(&self, heap: &mut dyn GlobalHeap, offset: u16, bytes: &[u8]) -> Result<()> {
        let buffer = heap
            .buffer_mut(self.code_selector, true)
            .ok_or(VirtualError::InvalidSelector(self.code_selector))?;
        let at = offset as usize;
        buffer
            .get_mut(at..at + bytes.len())
            .ok_or(VirtualError::CodeSegmentFull)?
            .copy_from_slice(bytes);
        Ok(())
    }

    /// Appends code at the generation cursor and returns its address.
    fn emit(&mut self, heap: &mut dyn GlobalHeap, bytes: &[u8]) -> Result<FarPtr> {
        if self.gen_pos + bytes.len() as u32 > SEGMENT_LIMIT {
            return Err(VirtualError::CodeSegmentFull.into());
        }
        let offset = self.gen_pos as u16;
        self.write_code(heap, offset, bytes)?;
        self.gen_pos += bytes.len() as u32;
        Ok(FarPtr::new(self.code_selector, offset))
    }

    fn push_thunk(&mut self, name: &str, address: FarPtr, handler: ThunkHandler) {
        let index = self.thunks.len() as u16;
        tracing::trace!("Thunk #{} {} at {}", index, name, address);
        self.thunks.push(ThunkEntry {
            index,
            name: name.to_string(),
            address,
            handler,
        });
    }

    pub fn register_thunk(
        &mut self,
        heap: &mut dyn GlobalHeap,
        name: &str,
        handler: ThunkHandler,
        pop_bytes: u16,
        preserve_ax: bool,
    ) -> Result<FarPtr> {
        let index = self.thunks.len() as u16;
        let mut code = Vec::with_capacity(9);
        if preserve_ax {
            code.push(0x50); // PUSH AX
        }
        code.push(0xB8); // MOV AX, index
        code.extend_from_slice(&index.to_le_bytes());
        code.extend_from_slice(&[0xCD, DISPATCH_VECTOR]);
        if pop_bytes == 0 {
            code.push(0xCB); // RETF
        } else {
            code.push(0xCA); // RETF n
            code.extend_from_slice(&pop_bytes.to_le_bytes());
        }

        let address = self.emit(heap, &code)?;
        self.push_thunk(name, address, handler);
        Ok(address)
    }

    /// A thunk that does nothing: a single `NOP` bound to an empty handler.
    pub fn register_nop_thunk(&mut self, heap: &mut dyn GlobalHeap, name: &str) -> Result<FarPtr> {
        let address = self.emit(heap, &[0x90])?;
        self.push_thunk(name, address, Rc::new(|_: &mut Machine| Ok(())));
        Ok(address)
    }

    /// Binds `ds` to `target`. Freed slots are reused oldest first.
    pub fn make_proc_instance(&mut self, heap: &mut dyn GlobalHeap, ds: u16, target: FarPtr) -> Result<FarPtr> {
        let mut code = [0u8; PROC_INSTANCE_SIZE as usize];
        code[0] = 0xB8; // MOV AX, ds
        code[1..3].copy_from_slice(&ds.to_le_bytes());
        code[3] = 0xEA; // JMP FAR target
        code[4..8].copy_from_slice(&target.to_u32().to_le_bytes());

        let address = match self.free_proc_instances.pop_front() {
            Some(offset) => {
                self.write_code(heap, offset, &code)?;
                FarPtr::new(self.code_selector, offset)
            }
            None => self.emit(heap, &code)?,
        };
        self.live_proc_instances.insert(address.offset);
        Ok(address)
    }

    pub fn free_proc_instance(&mut self, address: FarPtr) {
        if address.is_null() {
            return;
        }
        if address.selector != self.code_selector || !self.live_proc_instances.remove(&address.offset) {
            tracing::warn!("Ignoring free of {}, not a proc instance", address);
            return;
        }
        self.free_proc_instances.push_back(address.offset);
    }
}

impl Machine {
    pub fn register_thunk(&mut self, name: &str, handler: ThunkHandler, pop_bytes: u16, preserve_ax: bool) -> Result<FarPtr> {
        self.bridge
            .register_thunk(self.heap.as_mut(), name, handler, pop_bytes, preserve_ax)
    }

    pub fn register_nop_thunk(&mut self, name: &str) -> Result<FarPtr> {
        self.bridge.register_nop_thunk(self.heap.as_mut(), name)
    }

    pub fn make_proc_instance(&mut self, ds: u16, target: FarPtr) -> Result<FarPtr> {
        self.bridge.make_proc_instance(self.heap.as_mut(), ds, target)
    }

    pub fn free_proc_instance(&mut self, address: FarPtr) {
        self.bridge.free_proc_instance(address);
    }

    /// Calls guest code at `target` and returns once it has returned.
    ///
    /// The shared return stub is pushed as the return address. The CPU runs
    /// until the stub's interrupt drops the call depth below the depth this
    /// call started at, so nested guest->native->guest calls each finish in
    /// their own loop. Faults propagate out with the depth reset.
    pub fn call_into_guest(&mut self, target: FarPtr, name: &str) -> Result<()> {
        let sys_ret = self.bridge.sys_ret;
        self.push_dword(sys_ret.to_u32())?;

        let (saved_cs, saved_ip) = (self.regs().cs, self.regs().ip);
        let regs = self.regs_mut();
        regs.cs = target.selector;
        regs.ip = target.offset;
        // Entry points with a patched-out prologue expect their data
        // segment in AX.
        regs.ax = regs.ss;

        self.bridge.depth += 1;
        let at_call = self.bridge.depth;
        if self.log().transitions {
            tracing::trace!("native -> guest {} at {} (depth {})", name, target, at_call);
        }

        let mut result = Ok(());
        while self.bridge.depth >= at_call {
            if let Err(err) = self.step() {
                self.bridge.depth = at_call - 1;
                result = Err(err);
                break;
            }
        }

        if self.log().transitions {
            tracing::trace!("guest -> native {} returned (depth {})", name, self.bridge.depth);
        }
        if saved_cs != 0 {
            let regs = self.regs_mut();
            regs.cs = saved_cs;
            regs.ip = saved_ip;
        }
        result
    }

    pub(crate) fn dispatch_thunk(&mut self) -> Result<()> {
        let index = self.regs().ax;
        let handler = self
            .bridge
            .handler(index)
            .ok_or_else(|| self.unhandled_interrupt(DISPATCH_VECTOR))?;
        if self.log().transitions {
            if let Some(thunk) = self.bridge.thunk(index) {
                tracing::trace!("guest -> native {}", thunk.name);
            }
        }
        handler(self)
    }

    pub(crate) fn complete_guest_call(&mut self) -> Result<()> {
        match self.bridge.depth.checked_sub(1) {
            Some(depth) => {
                self.bridge.depth = depth;
                Ok(())
            }
            None => Err(self.unhandled_interrupt(CALL_COMPLETE_VECTOR).into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{CpuFault, Error};
    use pretty_assertions::assert_eq;
    use std::cell::RefCell;

    fn code_bytes(machine: &Machine, at: FarPtr, len: usize) -> Vec<u8> {
        machine.heap().buffer(at.selector).unwrap()[at.offset as usize..][..len].to_vec()
    }

    fn guest_code(machine: &mut Machine, code: &[u8]) -> FarPtr {
        let sel = machine.heap_mut().alloc("guest code", 0, code.len() as u32).unwrap();
        machine.heap_mut().buffer_mut(sel, false).unwrap()[..code.len()].copy_from_slice(code);
        let sel = machine.heap_mut().set_selector_attributes(sel, true, true);
        FarPtr::new(sel, 0)
    }

    #[test]
    fn generated_code_is_bit_exact() {
        let mut machine = Machine::with_defaults().unwrap();
        let sys_ret = machine.bridge().sys_ret();
        assert_eq!(sys_ret.offset, 0);
        assert_eq!(code_bytes(&machine, sys_ret, 2), vec![0xCD, 0x81]);

        let plain = machine.register_thunk("A", Rc::new(|_: &mut Machine| Ok(())), 0, false).unwrap();
        let popping = machine.register_thunk("B", Rc::new(|_: &mut Machine| Ok(())), 6, true).unwrap();
        let nop = machine.register_nop_thunk("C").unwrap();
        assert_eq!(code_bytes(&machine, plain, 6), vec![0xB8, 0x00, 0x00, 0xCD, 0x80, 0xCB]);
        assert_eq!(
            code_bytes(&machine, popping, 9),
            vec![0x50, 0xB8, 0x01, 0x00, 0xCD, 0x80, 0xCA, 0x06, 0x00]
        );
        assert_eq!(code_bytes(&machine, nop, 1), vec![0x90]);
        assert_eq!(nop.offset, popping.offset + 9);

        let target = FarPtr::new(0x1237, 0x0042);
        let instance = machine.make_proc_instance(0x0017, target).unwrap();
        assert_eq!(
            code_bytes(&machine, instance, 8),
            vec![0xB8, 0x17, 0x00, 0xEA, 0x42, 0x00, 0x37, 0x12]
        );
    }

    #[test]
    fn freed_proc_instances_are_reused() {
        let mut machine = Machine::with_defaults().unwrap();
        let a = machine.make_proc_instance(0x17, FarPtr::new(0x20, 0)).unwrap();
        let b = machine.make_proc_instance(0x17, FarPtr::new(0x20, 2)).unwrap();
        assert_ne!(a, b);

        machine.free_proc_instance(FarPtr::NULL);
        machine.free_proc_instance(FarPtr::new(0x99, a.offset));
        machine.free_proc_instance(a);
        machine.free_proc_instance(a);

        let c = machine.make_proc_instance(0x1F, FarPtr::new(0x28, 4)).unwrap();
        assert_eq!(c, a);
        assert_eq!(code_bytes(&machine, c, 3), vec![0xB8, 0x1F, 0x00]);
        let d = machine.make_proc_instance(0x1F, FarPtr::new(0x28, 4)).unwrap();
        assert_eq!(d.offset, b.offset + PROC_INSTANCE_SIZE);
    }

    #[test]
    fn guest_calls_native_through_a_thunk() {
        let mut machine = Machine::with_defaults().unwrap();
        let thunk = machine
            .register_thunk(
                "Answer",
                Rc::new(|m: &mut Machine| {
                    m.regs_mut().bx = 42;
                    Ok(())
                }),
                0,
                false,
            )
            .unwrap();
        machine.call_into_guest(thunk, "Answer").unwrap();
        assert_eq!(machine.regs().bx, 42);
        assert_eq!(machine.bridge().depth(), 0);
    }

    #[test]
    fn nested_calls_complete_inner_first() {
        let mut machine = Machine::with_defaults().unwrap();
        let inner = guest_code(&mut machine, &[0xCB]);
        let log = Rc::new(RefCell::new(Vec::new()));

        let seen = log.clone();
        let callback = machine
            .register_thunk(
                "Callback",
                Rc::new(move |m: &mut Machine| {
                    seen.borrow_mut().push(format!("enter {}", m.bridge().depth()));
                    m.call_into_guest(inner, "inner")?;
                    seen.borrow_mut().push(format!("inner done {}", m.bridge().depth()));
                    Ok(())
                }),
                0,
                false,
            )
            .unwrap();

        // CALL FAR callback; RETF
        let mut code = vec![0x9A];
        code.extend_from_slice(&callback.to_u32().to_le_bytes());
        code.push(0xCB);
        let outer = guest_code(&mut machine, &code);

        let sp = machine.regs().sp;
        machine.call_into_guest(outer, "outer").unwrap();
        log.borrow_mut().push(format!("outer done {}", machine.bridge().depth()));

        assert_eq!(
            *log.borrow(),
            vec!["enter 1", "inner done 1", "outer done 0"]
        );
        assert_eq!(machine.regs().sp, sp);
    }

    #[test]
    fn guest_faults_end_the_call() {
        let mut machine = Machine::with_defaults().unwrap();
        let bad = guest_code(&mut machine, &[0x0F]);
        let err = machine.call_into_guest(bad, "bad").unwrap_err();
        assert!(matches!(err, Error::Cpu(CpuFault::InvalidOpcode { opcode: 0x0F, .. })));
        assert_eq!(machine.bridge().depth(), 0);
    }

    #[test]
    fn unknown_thunk_index_is_an_unhandled_interrupt() {
        let mut machine = Machine::with_defaults().unwrap();
        // MOV AX,7; INT 80h
        let code = guest_code(&mut machine, &[0xB8, 0x07, 0x00, 0xCD, 0x80]);
        let err = machine.call_into_guest(code, "stray").unwrap_err();
        assert!(matches!(
            err,
            Error::Cpu(CpuFault::UnhandledInterrupt { vector: 0x80, ip: 3, .. })
        ));
    }
}
