//! CPU interface.
//!
//! The instruction emulator is a collaborator: the loader and call bridge only
//! need the register file and a way to run one instruction at a time. Software
//! interrupts are not handled by the CPU; `step` reports them back so the
//! machine can route the dispatch and call-complete vectors.
//!
//! [`MiniCpu`] implements the small real-mode subset that generated thunks,
//! proc instances and loader prologues use.

use crate::error::CpuFault;

/// 16-bit register file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Registers {
    pub ax: u16,
    pub bx: u16,
    pub cx: u16,
    pub dx: u16,
    pub si: u16,
    pub di: u16,
    pub bp: u16,
    pub sp: u16,
    pub ip: u16,
    pub cs: u16,
    pub ds: u16,
    pub es: u16,
    pub ss: u16,
    pub flags: u16,
}

impl Registers {
    /// DX:AX as a 32-bit value.
    pub fn dxax(&self) -> u32 {
        (self.dx as u32) << 16 | self.ax as u32
    }

    pub fn set_dxax(&mut self, value: u32) {
        self.dx = (value >> 16) as u16;
        self.ax = value as u16;
    }
}

/// Outcome of executing one instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Executed,
    /// `INT n` was executed; IP already points past the instruction.
    Interrupt(u8),
}

/// Byte access to segmented guest memory.
pub trait MemoryBus {
    fn read_byte(&self, selector: u16, offset: u16) -> Result<u8, CpuFault>;
    fn write_byte(&mut self, selector: u16, offset: u16, value: u8) -> Result<(), CpuFault>;
}

pub trait Cpu {
    fn regs(&self) -> &Registers;
    fn regs_mut(&mut self) -> &mut Registers;
    fn step(&mut self, bus: &mut dyn MemoryBus) -> Result<Step, CpuFault>;
}

/// Minimal interpreter for the instruction shapes the loader generates.
#[derive(Debug, Default)]
pub struct MiniCpu {
    regs: Registers,
}

impl MiniCpu {
    pub fn new() -> Self {
        Self {
            regs: Registers {
                flags: 0x0002,
                ..Registers::default()
            },
        }
    }

    fn fetch8(&mut self, bus: &dyn MemoryBus) -> Result<u8, CpuFault> {
        let value = bus.read_byte(self.regs.cs, self.regs.ip)?;
        self.regs.ip = self.regs.ip.wrapping_add(1);
        Ok(value)
    }

    fn fetch16(&mut self, bus: &dyn MemoryBus) -> Result<u16, CpuFault> {
        let lo = self.fetch8(bus)?;
        let hi = self.fetch8(bus)?;
        Ok(u16::from_le_bytes([lo, hi]))
    }

    fn push(&mut self, bus: &mut dyn MemoryBus, value: u16) -> Result<(), CpuFault> {
        self.regs.sp = self.regs.sp.wrapping_sub(2);
        let [lo, hi] = value.to_le_bytes();
        bus.write_byte(self.regs.ss, self.regs.sp, lo)?;
        bus.write_byte(self.regs.ss, self.regs.sp.wrapping_add(1), hi)
    }

    fn pop(&mut self, bus: &dyn MemoryBus) -> Result<u16, CpuFault> {
        let lo = bus.read_byte(self.regs.ss, self.regs.sp)?;
        let hi = bus.read_byte(self.regs.ss, self.regs.sp.wrapping_add(1))?;
        self.regs.sp = self.regs.sp.wrapping_add(2);
        Ok(u16::from_le_bytes([lo, hi]))
    }

    fn reg16_mut(&mut self, index: u8) -> &mut u16 {
        match index & 7 {
            0 => &mut self.regs.ax,
            1 => &mut self.regs.cx,
            2 => &mut self.regs.dx,
            3 => &mut self.regs.bx,
            4 => &mut self.regs.sp,
            5 => &mut self.regs.bp,
            6 => &mut self.regs.si,
            _ => &mut self.regs.di,
        }
    }
}

impl Cpu for MiniCpu {
    fn regs(&self) -> &Registers {
        &self.regs
    }

    fn regs_mut(&mut self) -> &mut Registers {
        &mut self.regs
    }

    fn step(&mut self, bus: &mut dyn MemoryBus) -> Result<Step, CpuFault> {
        let (cs, ip) = (self.regs.cs, self.regs.ip);
        let opcode = self.fetch8(bus)?;
        let invalid = CpuFault::InvalidOpcode { cs, ip, opcode };

        match opcode {
            0x90 => {}
            // PUSH r16 / POP r16
            0x50..=0x57 => {
                let value = *self.reg16_mut(opcode - 0x50);
                self.push(bus, value)?;
            }
            0x58..=0x5F => {
                let value = self.pop(bus)?;
                *self.reg16_mut(opcode - 0x58) = value;
            }
            // INC r16 / DEC r16
            0x40..=0x47 => {
                let reg = self.reg16_mut(opcode - 0x40);
                *reg = reg.wrapping_add(1);
            }
            0x48..=0x4F => {
                let reg = self.reg16_mut(opcode - 0x48);
                *reg = reg.wrapping_sub(1);
            }
            0x1E => {
                let ds = self.regs.ds;
                self.push(bus, ds)?;
            }
            0x1F => self.regs.ds = self.pop(bus)?,
            // MOV r16, imm16
            0xB8..=0xBF => {
                let value = self.fetch16(bus)?;
                *self.reg16_mut(opcode - 0xB8) = value;
            }
            // MOV BP, SP
            0x8B => match self.fetch8(bus)? {
                0xEC => self.regs.bp = self.regs.sp,
                _ => return Err(invalid),
            },
            // MOV DS, AX
            0x8E => match self.fetch8(bus)? {
                0xD8 => self.regs.ds = self.regs.ax,
                _ => return Err(invalid),
            },
            0xCD => {
                let vector = self.fetch8(bus)?;
                return Ok(Step::Interrupt(vector));
            }
            0xCB => {
                self.regs.ip = self.pop(bus)?;
                self.regs.cs = self.pop(bus)?;
            }
            0xCA => {
                let release = self.fetch16(bus)?;
                self.regs.ip = self.pop(bus)?;
                self.regs.cs = self.pop(bus)?;
                self.regs.sp = self.regs.sp.wrapping_add(release);
            }
            // CALL FAR ptr16:16
            0x9A => {
                let offset = self.fetch16(bus)?;
                let selector = self.fetch16(bus)?;
                let (ret_cs, ret_ip) = (self.regs.cs, self.regs.ip);
                self.push(bus, ret_cs)?;
                self.push(bus, ret_ip)?;
                self.regs.cs = selector;
                self.regs.ip = offset;
            }
            // JMP FAR ptr16:16
            0xEA => {
                let offset = self.fetch16(bus)?;
                let selector = self.fetch16(bus)?;
                self.regs.cs = selector;
                self.regs.ip = offset;
            }
            0xF4 => return Err(CpuFault::Halted { cs, ip }),
            _ => return Err(invalid),
        }

        Ok(Step::Executed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[derive(Default)]
    struct FlatBus {
        bytes: HashMap<(u16, u16), u8>,
    }

    impl FlatBus {
        fn load(&mut self, selector: u16, offset: u16, code: &[u8]) {
            for (i, b) in code.iter().enumerate() {
                self.bytes.insert((selector, offset + i as u16), *b);
            }
        }
    }

    impl MemoryBus for FlatBus {
        fn read_byte(&self, selector: u16, offset: u16) -> Result<u8, CpuFault> {
            self.bytes
                .get(&(selector, offset))
                .copied()
                .ok_or(CpuFault::GeneralProtection {
                    selector,
                    offset,
                    write: false,
                })
        }

        fn write_byte(&mut self, selector: u16, offset: u16, value: u8) -> Result<(), CpuFault> {
            self.bytes.insert((selector, offset), value);
            Ok(())
        }
    }

    #[test]
    fn far_call_and_return_with_pop() {
        let mut bus = FlatBus::default();
        // CALL FAR 0020:0000 ; NOP
        bus.load(0x10, 0, &[0x9A, 0x00, 0x00, 0x20, 0x00, 0x90]);
        // MOV AX,1234 ; RETF 4
        bus.load(0x20, 0, &[0xB8, 0x34, 0x12, 0xCA, 0x04, 0x00]);

        let mut cpu = MiniCpu::new();
        cpu.regs_mut().cs = 0x10;
        cpu.regs_mut().ss = 0x30;
        cpu.regs_mut().sp = 0x100;

        assert_eq!(cpu.step(&mut bus), Ok(Step::Executed));
        assert_eq!((cpu.regs().cs, cpu.regs().ip, cpu.regs().sp), (0x20, 0, 0xFC));
        cpu.step(&mut bus).unwrap();
        cpu.step(&mut bus).unwrap();
        assert_eq!(cpu.regs().ax, 0x1234);
        assert_eq!((cpu.regs().cs, cpu.regs().ip, cpu.regs().sp), (0x10, 5, 0x104));
    }

    #[test]
    fn interrupts_are_reported_not_handled() {
        let mut bus = FlatBus::default();
        bus.load(0x10, 0, &[0xCD, 0x80]);
        let mut cpu = MiniCpu::new();
        cpu.regs_mut().cs = 0x10;
        assert_eq!(cpu.step(&mut bus), Ok(Step::Interrupt(0x80)));
        assert_eq!(cpu.regs().ip, 2);
    }

    #[test]
    fn unknown_opcode_faults() {
        let mut bus = FlatBus::default();
        bus.load(0x10, 0, &[0x0F]);
        let mut cpu = MiniCpu::new();
        cpu.regs_mut().cs = 0x10;
        assert_eq!(
            cpu.step(&mut bus),
            Err(CpuFault::InvalidOpcode {
                cs: 0x10,
                ip: 0,
                opcode: 0x0F
            })
        );
    }
}
