//! The module contract.
//!
//! Both segmented (loaded from disk) and native modules go through the same
//! lifecycle, driven by the module manager:
//! 1. `load`: allocate and populate storage. Referenced modules are loaded
//!    first, but may themselves still be waiting to link.
//! 2. `link`: resolve imports and patch relocations.
//! 3. `init`: run library/task initialization.
//! 4. `uninit` and `unload` in reverse once the reference count drops to 0.

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::Result;
use crate::linker::SegmentedModule;
use crate::machine::Machine;
use crate::utils::FarPtr;

/// Bookkeeping the module manager keeps on every module.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleState {
    pub load_count: u32,
    pub initialized: bool,
    /// Instance handle, 0 until init.
    pub handle: u16,
}

pub trait Module {
    /// Upper-case module name, as imports refer to it.
    fn name(&self) -> &str;

    /// Guest path the module was loaded from, if any.
    fn file_name(&self) -> Option<&str>;

    fn state(&self) -> &ModuleState;
    fn state_mut(&mut self) -> &mut ModuleState;

    /// Names of the modules this one imports from.
    fn referenced_modules(&self) -> Vec<String>;

    fn load(&mut self, machine: &mut Machine) -> Result<()>;
    fn link(&mut self, machine: &mut Machine, resolver: &dyn ModuleResolver) -> Result<()>;
    fn init(&mut self, machine: &mut Machine) -> Result<()>;
    fn uninit(&mut self, machine: &mut Machine) -> Result<()>;
    fn unload(&mut self, machine: &mut Machine) -> Result<()>;

    fn ordinal_from_name(&self, name: &str) -> Option<u16>;
    fn name_from_ordinal(&self, ordinal: u16) -> Option<String>;

    /// Address guest code calls for `ordinal`. `None` when the module has
    /// no such entry.
    fn proc_address(&mut self, machine: &mut Machine, ordinal: u16) -> Result<Option<FarPtr>>;

    /// Named exports, by ordinal.
    fn exports(&self) -> Vec<(u16, String)>;

    fn as_segmented(&self) -> Option<&SegmentedModule> {
        None
    }

    fn as_segmented_mut(&mut self) -> Option<&mut SegmentedModule> {
        None
    }
}

pub type ModuleRef = Rc<RefCell<dyn Module>>;

/// Looks up already-loaded modules while linking.
pub trait ModuleResolver {
    fn resolve(&self, name: &str) -> Option<ModuleRef>;
}
