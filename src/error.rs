//! Error types.
//!
//! Failures are split by who is at fault:
//! - [`VirtualError`]: something about the guest is wrong (missing export,
//!   unknown module, bad relocation target). Recoverable: the module manager
//!   unwinds the partially loaded modules and the caller decides what to do.
//! - [`UnsupportedError`]: the emulator does not cover something the guest
//!   needs (relocation shape, marshaling type, FP fixup opcode). These are
//!   defects and should abort the process with enough context to diagnose.
//! - [`CpuFault`]: the instruction stream faulted while running guest code.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Virtual(#[from] VirtualError),

    #[error(transparent)]
    Unsupported(#[from] UnsupportedError),

    #[error("cpu fault: {0}")]
    Cpu(#[from] CpuFault),
}

impl Error {
    /// Guest-level errors can be unwound; everything else is fatal.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::Virtual(_))
    }
}

/// Guest-level failures.
#[derive(Error, Debug)]
pub enum VirtualError {
    #[error("can't find module '{0}'")]
    ModuleNotFound(String),

    #[error("module '{0}' is not loaded")]
    ModuleNotLoaded(String),

    #[error("module '{module}' references invalid module index {index}")]
    BadModuleReference { module: String, index: u16 },

    #[error("module link failed, function ordinal #{ordinal:04X} not found in module '{module}'")]
    MissingOrdinal { module: String, ordinal: u16 },

    #[error("module link failed, function '{name}' not found in module '{module}'")]
    MissingName { module: String, name: String },

    #[error("invalid relocation in module '{module}' segment {segment}: {detail}")]
    BadRelocationTarget {
        module: String,
        segment: usize,
        detail: String,
    },

    #[error("module '{module}' has an invalid entry point for ordinal {ordinal}")]
    BadEntryPoint { module: String, ordinal: u16 },

    #[error("entry point prologue at {location} in module '{module}' is {found:02X?}, expected [1E, 58, 90]")]
    BadPrologue {
        module: String,
        location: String,
        found: [u8; 3],
    },

    #[error("module '{0}' has no automatic data segment")]
    NoDataSegment(String),

    #[error("can't run library module '{0}'")]
    NotAnExecutable(String),

    #[error("command line too long ({0} bytes, at most 127 allowed)")]
    CommandLineTooLong(usize),

    #[error("out of memory allocating 0x{size:X} bytes for {name}")]
    OutOfMemory { name: String, size: u32 },

    #[error("invalid selector 0x{0:04X}")]
    InvalidSelector(u16),

    #[error("module '{0}' is already being processed")]
    ModuleBusy(String),

    #[error("system code segment is full")]
    CodeSegmentFull,

    #[error("the path '{0}' can't be mapped between guest and host")]
    UnmappedPath(String),

    #[error("bad executable image: {0}")]
    BadImage(String),

    #[error("{0}")]
    Io(#[from] std::io::Error),
}

/// Implementation-level failures: coverage gaps in the emulator.
#[derive(Error, Debug)]
pub enum UnsupportedError {
    #[error("unsupported relocation type {kind}/{address_type} in module '{module}'")]
    Relocation {
        module: String,
        kind: String,
        address_type: String,
    },

    #[error("don't know how to apply OS fixup for FP operation at {offset:04X} {opcode:02X?} [p1={param1}, p2={param2}]")]
    FpFixup {
        offset: u16,
        opcode: [u8; 2],
        param1: u16,
        param2: u16,
    },

    #[error("FP OS fixup tribyte: {table:02X} {opcode:02X}")]
    FpTriByte { table: u8, opcode: u8 },

    #[error("parameter type not supported by thunking layer - {0}")]
    ParamType(String),

    #[error("return type not supported by thunking layer - {0}")]
    ReturnType(String),

    #[error("non-null pointer passed for parameter {index} of {function}")]
    NonNullPointer { function: String, index: usize },

    #[error("unsupported ordinal {ordinal} (#{ordinal:04X}) in module {module} invoked")]
    Ordinal { module: String, ordinal: u16 },
}

/// Faults raised while executing guest instructions or touching guest memory.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CpuFault {
    #[error("invalid opcode {opcode:02X} at {cs:04X}:{ip:04X}")]
    InvalidOpcode { cs: u16, ip: u16, opcode: u8 },

    #[error("general protection fault {selector:04X}:{offset:04X} ({})", access(.write))]
    GeneralProtection {
        selector: u16,
        offset: u16,
        write: bool,
    },

    #[error("segment not present {0:04X}")]
    SegmentNotPresent(u16),

    #[error("unhandled interrupt {vector:02X}h at {cs:04X}:{ip:04X}")]
    UnhandledInterrupt { vector: u8, cs: u16, ip: u16 },

    #[error("cpu halted at {cs:04X}:{ip:04X}")]
    Halted { cs: u16, ip: u16 },
}

fn access(write: &bool) -> &'static str {
    if *write {
        "write"
    } else {
        "read"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_guest_errors_are_recoverable() {
        let guest: Error = VirtualError::ModuleNotFound("FOO".into()).into();
        let defect: Error = UnsupportedError::ParamType("f64".into()).into();
        let fault: Error = CpuFault::SegmentNotPresent(0x17).into();
        assert!(guest.is_recoverable());
        assert!(!defect.is_recoverable());
        assert!(!fault.is_recoverable());
    }

    #[test]
    fn messages_carry_diagnostic_context() {
        let err = VirtualError::MissingOrdinal {
            module: "GDI".into(),
            ordinal: 0x1F,
        };
        assert_eq!(
            err.to_string(),
            "module link failed, function ordinal #001F not found in module 'GDI'"
        );

        let fault = CpuFault::GeneralProtection {
            selector: 0x1F,
            offset: 0x10,
            write: true,
        };
        assert_eq!(fault.to_string(), "general protection fault 001F:0010 (write)");
    }
}
