//! Native handler modules.
//!
//! A `NativeModule` exposes host functions as 16-bit exports. Each export is
//! declared once with its ordinal, parameter types and flags; its thunk is
//! generated on the first `proc_address` request. Ordinals nobody declared
//! still get a thunk, which fails only when the guest actually calls it.

use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use bitflags::bitflags;

use crate::bridge::ThunkHandler;
use crate::error::{Result, UnsupportedError};
use crate::machine::Machine;
use crate::marshal::{self, ParamType, ReturnType, Value};
use crate::module::{Module, ModuleResolver, ModuleState};
use crate::utils::FarPtr;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ExportFlags: u8 {
        /// The thunk saves AX before the dispatch and the call restores it.
        const PRESERVE_AX = 0x01;
        const BREAK_BEFORE = 0x02;
        const BREAK_AFTER = 0x04;
    }
}

pub type NativeFn = Rc<dyn Fn(&mut Machine, &mut [Value]) -> Result<Value>>;

pub struct NativeExport {
    pub ordinal: u16,
    pub name: String,
    pub params: Vec<ParamType>,
    pub returns: ReturnType,
    pub flags: ExportFlags,
    pub(crate) function: NativeFn,
    nop: bool,
}

impl NativeExport {
    pub fn new(
        ordinal: u16,
        name: &str,
        function: impl Fn(&mut Machine, &mut [Value]) -> Result<Value> + 'static,
    ) -> Self {
        Self {
            ordinal,
            name: name.to_string(),
            params: Vec::new(),
            returns: ReturnType::Void,
            flags: ExportFlags::empty(),
            function: Rc::new(function),
            nop: false,
        }
    }

    /// An export that is deliberately a no-op.
    pub fn nop(ordinal: u16, name: &str) -> Self {
        let mut export = Self::new(ordinal, name, |_: &mut Machine, _: &mut [Value]| Ok(Value::Void));
        export.nop = true;
        export
    }

    pub fn params(mut self, params: impl IntoIterator<Item = ParamType>) -> Self {
        self.params = params.into_iter().collect();
        self
    }

    pub fn returns(mut self, returns: ReturnType) -> Self {
        self.returns = returns;
        self
    }

    pub fn flags(mut self, flags: ExportFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Bytes of arguments the thunk pops on return.
    pub fn stack_size(&self) -> u16 {
        self.params.iter().map(ParamType::stack_size).sum()
    }
}

pub struct NativeModule {
    name: String,
    file_name: Option<String>,
    state: ModuleState,
    exports: BTreeMap<u16, Rc<NativeExport>>,
    /// Generated thunks by ordinal, including unsupported-ordinal shims.
    thunks: HashMap<u16, FarPtr>,
}

impl NativeModule {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_ascii_uppercase(),
            file_name: None,
            state: ModuleState::default(),
            exports: BTreeMap::new(),
            thunks: HashMap::new(),
        }
    }

    /// A module with no declared exports: every ordinal resolves, none can
    /// be called.
    pub fn stub(name: &str) -> Self {
        Self::new(name)
    }

    pub fn with_file_name(mut self, file_name: &str) -> Self {
        self.file_name = Some(file_name.to_string());
        self
    }

    pub fn add_export(&mut self, export: NativeExport) {
        self.exports.insert(export.ordinal, Rc::new(export));
    }

    pub fn with_export(mut self, export: NativeExport) -> Self {
        self.add_export(export);
        self
    }

    fn create_thunk(&self, machine: &mut Machine, ordinal: u16) -> Result<FarPtr> {
        let Some(export) = self.exports.get(&ordinal) else {
            let module = self.name.clone();
            let handler: ThunkHandler = Rc::new(move |_: &mut Machine| -> Result<()> {
                Err(UnsupportedError::Ordinal {
                    module: module.clone(),
                    ordinal,
                }
                .into())
            });
            let name = format!("{}.#{}", self.name, ordinal);
            tracing::debug!("Creating unsupported-ordinal thunk {}", name);
            return machine.register_thunk(&name, handler, 0, false);
        };

        let name = format!("{}.{}", self.name, export.name);
        if export.nop {
            return machine.register_nop_thunk(&name);
        }

        let module = self.name.clone();
        let target = Rc::clone(export);
        let handler: ThunkHandler = Rc::new(move |machine: &mut Machine| marshal::invoke(machine, &module, &target));
        machine.register_thunk(
            &name,
            handler,
            export.stack_size(),
            export.flags.contains(ExportFlags::PRESERVE_AX),
        )
    }
}

impl Module for NativeModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn file_name(&self) -> Option<&str> {
        self.file_name.as_deref()
    }

    fn state(&self) -> &ModuleState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut ModuleState {
        &mut self.state
    }

    fn referenced_modules(&self) -> Vec<String> {
        Vec::new()
    }

    fn load(&mut self, _machine: &mut Machine) -> Result<()> {
        Ok(())
    }

    fn link(&mut self, _machine: &mut Machine, _resolver: &dyn ModuleResolver) -> Result<()> {
        Ok(())
    }

    fn init(&mut self, _machine: &mut Machine) -> Result<()> {
        Ok(())
    }

    fn uninit(&mut self, _machine: &mut Machine) -> Result<()> {
        Ok(())
    }

    fn unload(&mut self, _machine: &mut Machine) -> Result<()> {
        // Generated code stays in the system segment; a reload reuses it.
        Ok(())
    }

    fn ordinal_from_name(&self, name: &str) -> Option<u16> {
        self.exports
            .values()
            .find(|e| e.name.eq_ignore_ascii_case(name))
            .map(|e| e.ordinal)
    }

    fn name_from_ordinal(&self, ordinal: u16) -> Option<String> {
        self.exports.get(&ordinal).map(|e| e.name.clone())
    }

    fn proc_address(&mut self, machine: &mut Machine, ordinal: u16) -> Result<Option<FarPtr>> {
        if let Some(address) = self.thunks.get(&ordinal) {
            return Ok(Some(*address));
        }
        let address = self.create_thunk(machine, ordinal)?;
        self.thunks.insert(ordinal, address);
        Ok(Some(address))
    }

    fn exports(&self) -> Vec<(u16, String)> {
        self.exports
            .values()
            .map(|e| (e.ordinal, e.name.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn unsupported_ordinals_fail_only_when_called() {
        let mut machine = Machine::with_defaults().unwrap();
        let mut module = NativeModule::stub("KERNEL");

        let first = module.proc_address(&mut machine, 9999).unwrap().unwrap();
        let second = module.proc_address(&mut machine, 9999).unwrap().unwrap();
        assert_eq!(first, second);
        assert_eq!(machine.bridge().thunks().len(), 1);
        assert_eq!(machine.bridge().thunk_at(first).unwrap().name, "KERNEL.#9999");

        let err = machine.call_into_guest(first, "KERNEL.#9999").unwrap_err();
        assert!(matches!(
            err,
            Error::Unsupported(UnsupportedError::Ordinal { ordinal: 9999, ref module }) if module == "KERNEL"
        ));
    }

    #[test]
    fn declared_exports_get_one_thunk_each() {
        let mut machine = Machine::with_defaults().unwrap();
        let mut module = NativeModule::new("user")
            .with_file_name("USER.EXE")
            .with_export(NativeExport::nop(5, "MessageBeep").params([ParamType::U16]))
            .with_export(
                NativeExport::new(6, "GetTickCount", |_: &mut Machine, _: &mut [Value]| Ok(Value::U32(0x0001_0002)))
                    .returns(ReturnType::U32),
            );

        assert_eq!(module.name(), "USER");
        assert_eq!(module.ordinal_from_name("gettickcount"), Some(6));
        assert_eq!(module.name_from_ordinal(5).as_deref(), Some("MessageBeep"));
        assert_eq!(
            module.exports(),
            vec![(5, "MessageBeep".to_string()), (6, "GetTickCount".to_string())]
        );

        let ticks = module.proc_address(&mut machine, 6).unwrap().unwrap();
        assert_eq!(module.proc_address(&mut machine, 6).unwrap(), Some(ticks));
        machine.call_into_guest(ticks, "GetTickCount").unwrap();
        assert_eq!(machine.dxax(), 0x0001_0002);

        let beep = module.proc_address(&mut machine, 5).unwrap().unwrap();
        let code = machine.heap().buffer(beep.selector).unwrap();
        assert_eq!(code[beep.offset as usize], 0x90);
    }
}
