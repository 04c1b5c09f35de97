//! Parameter marshaling for native exports.
//!
//! A guest call into a native export arrives with the Pascal convention:
//! the first declared parameter was pushed first, so it sits at the highest
//! address and the last one sits just above the far return address at
//! SS:SP+4. Invocation runs in four steps:
//! 1. Read parameters in reverse declaration order, queueing deferred work.
//! 2. Pre-invoke: size text buffers from their size parameters.
//! 3. Call the native function.
//! 4. Post-invoke: write back buffers and by-reference values, run mapped
//!    type destructors, then pack the return value into AX or DX:AX.

use std::fmt;
use std::path::Path;

use crate::error::{Result, UnsupportedError, VirtualError};
use crate::machine::Machine;
use crate::native::{ExportFlags, NativeExport};
use crate::utils::FarPtr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
    InOut,
}

impl Direction {
    fn reads(self) -> bool {
        matches!(self, Direction::In | Direction::InOut)
    }

    fn writes(self) -> bool {
        matches!(self, Direction::Out | Direction::InOut)
    }
}

/// A guest text buffer whose capacity is given by another parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferSpec {
    pub direction: Direction,
    /// Position of the capacity parameter relative to the buffer's own.
    pub size_param: isize,
    /// Contents are a path, translated between guest and host.
    pub file_name: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefTarget {
    U16,
    I16,
    U32,
    I32,
    Bool,
    Point,
    Bytes(u16),
    Mapped(&'static MappedType),
}

/// A far pointer to a value the native function may update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefSpec {
    pub target: RefTarget,
    pub mode: Direction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    U16,
    I16,
    /// Passed in a full stack word.
    Byte,
    Bool,
    U32,
    I32,
    Str { file_name: bool },
    /// Far pointer to a string, or a 16-bit id when the selector is 0.
    StrOrId,
    Buffer(BufferSpec),
    ByRef(RefSpec),
    Mapped {
        ty: &'static MappedType,
        destroy: bool,
    },
    Point,
    /// Reserved pointer that must be null.
    NullPtr,
}

impl ParamType {
    /// Stack bytes the parameter occupies.
    pub fn stack_size(&self) -> u16 {
        match self {
            ParamType::U16 | ParamType::I16 | ParamType::Byte | ParamType::Bool => 2,
            ParamType::Mapped { ty, .. } => ty.guest.stack_size(),
            _ => 4,
        }
    }

    fn ref_target(&self) -> Option<RefTarget> {
        match self {
            ParamType::U16 => Some(RefTarget::U16),
            ParamType::I16 => Some(RefTarget::I16),
            ParamType::U32 => Some(RefTarget::U32),
            ParamType::I32 => Some(RefTarget::I32),
            ParamType::Bool => Some(RefTarget::Bool),
            ParamType::Point => Some(RefTarget::Point),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnType {
    Void,
    U16,
    I16,
    U32,
    I32,
    Bool,
    Mapped(&'static MappedType),
}

/// A native type carried over a guest representation, with conversions in
/// both directions.
pub struct MappedType {
    pub name: &'static str,
    pub guest: ParamType,
    pub to_native: fn(Value) -> Result<Value>,
    pub to_guest: fn(Value) -> Result<Value>,
    /// Releases whatever the guest value refers to once the call is done.
    pub destroy: Option<fn(&Value)>,
}

impl fmt::Debug for MappedType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MappedType({})", self.name)
    }
}

impl PartialEq for MappedType {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self, other)
    }
}

impl Eq for MappedType {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StrOrId {
    Id(u16),
    Str(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextBuffer {
    pub text: String,
    /// Bytes available in guest memory, terminator included.
    pub capacity: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Void,
    U16(u16),
    I16(i16),
    Byte(u8),
    Bool(bool),
    U32(u32),
    I32(i32),
    Str(String),
    StrOrId(StrOrId),
    Buffer(TextBuffer),
    Point { x: i16, y: i16 },
    Bytes(Vec<u8>),
    Null,
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Void => "void",
            Value::U16(_) => "u16",
            Value::I16(_) => "i16",
            Value::Byte(_) => "u8",
            Value::Bool(_) => "bool",
            Value::U32(_) => "u32",
            Value::I32(_) => "i32",
            Value::Str(_) => "string",
            Value::StrOrId(_) => "string-or-id",
            Value::Buffer(_) => "buffer",
            Value::Point { .. } => "point",
            Value::Bytes(_) => "bytes",
            Value::Null => "null",
        }
    }

    fn as_capacity(&self) -> Option<u32> {
        match *self {
            Value::U16(v) => Some(v as u32),
            Value::I16(v) => Some(v.max(0) as u32),
            Value::U32(v) => Some(v),
            Value::I32(v) => Some(v.max(0) as u32),
            _ => None,
        }
    }
}

enum PreInvoke {
    Buffer {
        index: usize,
        ptr: FarPtr,
        spec: BufferSpec,
    },
}

enum PostInvoke {
    Buffer {
        index: usize,
        ptr: FarPtr,
        file_name: bool,
    },
    WriteBack {
        index: usize,
        ptr: FarPtr,
        target: RefTarget,
    },
    Destroy {
        ty: &'static MappedType,
        guest: Value,
    },
}

/// Deferred work collected while reading one call's parameters.
struct InvokeContext<'a> {
    function: &'a str,
    pre: Vec<PreInvoke>,
    post: Vec<PostInvoke>,
}

/// Runs a guest call to `export`. Called from the export's thunk handler.
pub(crate) fn invoke(machine: &mut Machine, module: &str, export: &NativeExport) -> Result<()> {
    if export.flags.contains(ExportFlags::BREAK_BEFORE) {
        machine.debug_break(&format!("before {}.{}", module, export.name));
    }

    if let Err(err) = marshal_call(machine, module, export) {
        tracing::error!(
            "{}.{} failed: {} (stack: {})",
            module,
            export.name,
            err,
            raw_parameters(machine, export.stack_size())
        );
        return Err(err);
    }

    if export.flags.contains(ExportFlags::BREAK_AFTER) {
        machine.debug_break(&format!("after {}.{}", module, export.name));
    }
    Ok(())
}

fn raw_parameters(machine: &Machine, size: u16) -> String {
    let base = FarPtr::new(machine.regs().ss, machine.regs().sp.wrapping_add(4));
    (0..size / 2)
        .map(|i| match machine.read_word(base.add(i * 2)) {
            Ok(word) => format!("{word:04X}"),
            Err(_) => "????".to_string(),
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn marshal_call(machine: &mut Machine, module: &str, export: &NativeExport) -> Result<()> {
    if export.flags.contains(ExportFlags::PRESERVE_AX) {
        let ax = machine.pop_word()?;
        machine.regs_mut().ax = ax;
    }

    let mut ctx = InvokeContext {
        function: &export.name,
        pre: Vec::new(),
        post: Vec::new(),
    };
    let mut values = vec![Value::Void; export.params.len()];
    let (ss, sp) = (machine.regs().ss, machine.regs().sp);
    let mut offset = 4u16;
    for (index, param) in export.params.iter().enumerate().rev() {
        let ptr = FarPtr::new(ss, sp.wrapping_add(offset));
        values[index] = read_param(machine, &mut ctx, index, param, ptr)?;
        offset = offset.wrapping_add(param.stack_size());
    }

    for pre in &ctx.pre {
        match *pre {
            PreInvoke::Buffer { index, ptr, spec } => {
                let buffer = prepare_buffer(machine, &values, index, ptr, spec)?;
                values[index] = buffer;
            }
        }
    }

    if machine.log().api_calls {
        tracing::trace!("{}.{}({:?})", module, export.name, values);
    }

    let result = (export.function)(machine, &mut values)?;

    for post in ctx.post {
        match post {
            PostInvoke::Buffer {
                index,
                ptr,
                file_name,
            } => {
                if let Value::Buffer(buffer) = &values[index] {
                    let text = if file_name {
                        host_to_guest(machine, &buffer.text)?
                    } else {
                        buffer.text.clone()
                    };
                    machine.write_string(ptr, &text, buffer.capacity)?;
                }
            }
            PostInvoke::WriteBack { index, ptr, target } => {
                let value = std::mem::replace(&mut values[index], Value::Void);
                write_ref(machine, target, ptr, value)?;
            }
            PostInvoke::Destroy { ty, guest } => {
                if let Some(destroy) = ty.destroy {
                    destroy(&guest);
                }
            }
        }
    }

    if machine.log().api_calls {
        tracing::trace!("{}.{} returned {:?}", module, export.name, result);
    }
    store_return(machine, &export.returns, result)
}

fn read_param(
    machine: &mut Machine,
    ctx: &mut InvokeContext<'_>,
    index: usize,
    param: &ParamType,
    ptr: FarPtr,
) -> Result<Value> {
    let value = match *param {
        ParamType::U16 => Value::U16(machine.read_word(ptr)?),
        ParamType::I16 => Value::I16(machine.read_word(ptr)? as i16),
        ParamType::Byte => Value::Byte(machine.read_byte(ptr)?),
        ParamType::Bool => Value::Bool(machine.read_word(ptr)? != 0),
        ParamType::U32 => Value::U32(machine.read_dword(ptr)?),
        ParamType::I32 => Value::I32(machine.read_dword(ptr)? as i32),
        ParamType::Str { file_name } => {
            let target = machine.read_far_ptr(ptr)?;
            if target.is_null() {
                Value::Null
            } else {
                let text = machine.read_string(target)?;
                Value::Str(if file_name {
                    guest_to_host(machine, &text)?
                } else {
                    text
                })
            }
        }
        ParamType::StrOrId => {
            let target = machine.read_far_ptr(ptr)?;
            if target.selector == 0 {
                Value::StrOrId(StrOrId::Id(target.offset))
            } else {
                Value::StrOrId(StrOrId::Str(machine.read_string(target)?))
            }
        }
        ParamType::Buffer(spec) => {
            let target = machine.read_far_ptr(ptr)?;
            if target.is_null() {
                Value::Null
            } else {
                ctx.pre.push(PreInvoke::Buffer {
                    index,
                    ptr: target,
                    spec,
                });
                if spec.direction.writes() {
                    ctx.post.push(PostInvoke::Buffer {
                        index,
                        ptr: target,
                        file_name: spec.file_name,
                    });
                }
                Value::Void
            }
        }
        ParamType::ByRef(spec) => {
            let target = machine.read_far_ptr(ptr)?;
            let value = if target.is_null() || spec.mode == Direction::Out {
                default_value(spec.target)?
            } else {
                read_ref(machine, spec.target, target)?
            };
            if spec.mode != Direction::In && !target.is_null() {
                ctx.post.push(PostInvoke::WriteBack {
                    index,
                    ptr: target,
                    target: spec.target,
                });
            }
            value
        }
        ParamType::Mapped { ty, destroy } => {
            let guest = read_param(machine, ctx, index, &ty.guest, ptr)?;
            if destroy {
                ctx.post.push(PostInvoke::Destroy {
                    ty,
                    guest: guest.clone(),
                });
            }
            (ty.to_native)(guest)?
        }
        ParamType::Point => Value::Point {
            x: machine.read_word(ptr)? as i16,
            y: machine.read_word(ptr.add(2))? as i16,
        },
        ParamType::NullPtr => {
            if !machine.read_far_ptr(ptr)?.is_null() {
                return Err(UnsupportedError::NonNullPointer {
                    function: ctx.function.to_string(),
                    index,
                }
                .into());
            }
            Value::Null
        }
    };
    Ok(value)
}

fn prepare_buffer(machine: &Machine, values: &[Value], index: usize, ptr: FarPtr, spec: BufferSpec) -> Result<Value> {
    let size_index = index as isize + spec.size_param;
    let capacity = usize::try_from(size_index)
        .ok()
        .and_then(|i| values.get(i))
        .and_then(Value::as_capacity)
        .ok_or_else(|| {
            UnsupportedError::ParamType(format!(
                "buffer parameter {index} has no integer size parameter at {size_index}"
            ))
        })?;
    let capacity = capacity.min(u16::MAX as u32) as u16;

    let text = if spec.direction.reads() {
        let text = machine.read_string_max(ptr, capacity as usize)?;
        if spec.file_name {
            guest_to_host(machine, &text)?
        } else {
            text
        }
    } else {
        String::new()
    };
    Ok(Value::Buffer(TextBuffer { text, capacity }))
}

fn guest_to_host(machine: &Machine, guest: &str) -> Result<String> {
    let host = machine
        .paths()
        .map_guest_to_host(guest)
        .ok_or_else(|| VirtualError::UnmappedPath(guest.to_string()))?;
    Ok(host.to_string_lossy().into_owned())
}

fn host_to_guest(machine: &Machine, host: &str) -> Result<String> {
    Ok(machine
        .paths()
        .map_host_to_guest(Path::new(host))
        .ok_or_else(|| VirtualError::UnmappedPath(host.to_string()))?)
}

fn default_value(target: RefTarget) -> Result<Value> {
    Ok(match target {
        RefTarget::U16 => Value::U16(0),
        RefTarget::I16 => Value::I16(0),
        RefTarget::U32 => Value::U32(0),
        RefTarget::I32 => Value::I32(0),
        RefTarget::Bool => Value::Bool(false),
        RefTarget::Point => Value::Point { x: 0, y: 0 },
        RefTarget::Bytes(len) => Value::Bytes(vec![0; len as usize]),
        RefTarget::Mapped(ty) => (ty.to_native)(default_value(mapped_ref_target(ty)?)?)?,
    })
}

fn mapped_ref_target(ty: &MappedType) -> Result<RefTarget> {
    ty.guest
        .ref_target()
        .ok_or_else(|| UnsupportedError::ParamType(format!("{} by reference", ty.name)).into())
}

fn read_ref(machine: &Machine, target: RefTarget, ptr: FarPtr) -> Result<Value> {
    Ok(match target {
        RefTarget::U16 => Value::U16(machine.read_word(ptr)?),
        RefTarget::I16 => Value::I16(machine.read_word(ptr)? as i16),
        RefTarget::U32 => Value::U32(machine.read_dword(ptr)?),
        RefTarget::I32 => Value::I32(machine.read_dword(ptr)? as i32),
        RefTarget::Bool => Value::Bool(machine.read_word(ptr)? != 0),
        RefTarget::Point => Value::Point {
            x: machine.read_word(ptr)? as i16,
            y: machine.read_word(ptr.add(2))? as i16,
        },
        RefTarget::Bytes(len) => Value::Bytes(machine.read_bytes(ptr, len as usize)?),
        RefTarget::Mapped(ty) => (ty.to_native)(read_ref(machine, mapped_ref_target(ty)?, ptr)?)?,
    })
}

fn write_ref(machine: &mut Machine, target: RefTarget, ptr: FarPtr, value: Value) -> Result<()> {
    match (target, value) {
        (RefTarget::U16, Value::U16(v)) => machine.write_word(ptr, v),
        (RefTarget::I16, Value::I16(v)) => machine.write_word(ptr, v as u16),
        (RefTarget::U32, Value::U32(v)) => machine.write_dword(ptr, v),
        (RefTarget::I32, Value::I32(v)) => machine.write_dword(ptr, v as u32),
        (RefTarget::Bool, Value::Bool(v)) => machine.write_word(ptr, v as u16),
        (RefTarget::Point, Value::Point { x, y }) => {
            machine.write_word(ptr, x as u16)?;
            machine.write_word(ptr.add(2), y as u16)
        }
        (RefTarget::Bytes(len), Value::Bytes(bytes)) => {
            let len = bytes.len().min(len as usize);
            machine.write_bytes(ptr, &bytes[..len])
        }
        (RefTarget::Mapped(ty), value) => {
            let guest = (ty.to_guest)(value)?;
            write_ref(machine, mapped_ref_target(ty)?, ptr, guest)
        }
        (target, value) => Err(UnsupportedError::ParamType(format!(
            "{} written back through {:?}",
            value.type_name(),
            target
        ))
        .into()),
    }
}

fn store_return(machine: &mut Machine, returns: &ReturnType, value: Value) -> Result<()> {
    let regs = machine.regs_mut();
    match (returns, value) {
        (ReturnType::Void, _) => {}
        (ReturnType::U16, Value::U16(v)) => regs.ax = v,
        (ReturnType::I16, Value::I16(v)) => regs.ax = v as u16,
        (ReturnType::U32, Value::U32(v)) => regs.set_dxax(v),
        (ReturnType::I32, Value::I32(v)) => regs.set_dxax(v as u32),
        (ReturnType::Bool, Value::Bool(v)) => regs.ax = v as u16,
        (ReturnType::Mapped(ty), value) => {
            let guest = (ty.to_guest)(value)?;
            let packed = match guest {
                Value::U16(_) => ReturnType::U16,
                Value::I16(_) => ReturnType::I16,
                Value::U32(_) => ReturnType::U32,
                Value::I32(_) => ReturnType::I32,
                Value::Bool(_) => ReturnType::Bool,
                other => {
                    return Err(UnsupportedError::ReturnType(format!(
                        "{} converts to {}",
                        ty.name,
                        other.type_name()
                    ))
                    .into())
                }
            };
            return store_return(machine, &packed, guest);
        }
        (returns, value) => {
            return Err(UnsupportedError::ReturnType(format!(
                "{} returned for {:?}",
                value.type_name(),
                returns
            ))
            .into())
        }
    }
    Ok(())
}
