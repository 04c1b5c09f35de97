//! Module manager.
//!
//! Owns every loaded module and drives them through load, link and init:
//! 1. `load_module` finds a module by name (already loaded, provided natively,
//!    or on the guest search path) and registers it.
//! 2. Registering a module loads its references first. The module is in the
//!    loaded set before that, so circular references find it.
//! 3. When the outermost load returns, every module loaded on the way is
//!    linked and then initialized, in load order.
//!
//! Any failure unwinds: nothing stays half registered.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::error::{Result, VirtualError};
use crate::linker::SegmentedModule;
use crate::machine::Machine;
use crate::module::{ModuleRef, ModuleResolver};
use crate::paths::dos;

const DEFAULT_EXTENSION: &str = ".DLL";
const HANDLE_SIZE: u32 = 16;

#[derive(Default)]
pub struct ModuleManager {
    /// Keyed by upper-case module name.
    loaded: HashMap<String, ModuleRef>,
    /// Keyed by instance handle.
    instances: HashMap<u16, ModuleRef>,
    /// Modules supplied by the host, registered on first reference.
    available: HashMap<String, ModuleRef>,
    /// Modules each loaded module pulled in, released when it unloads.
    dependencies: HashMap<String, Vec<Dependency>>,
    /// Nesting of `register_module`.
    depth: u32,
    /// Loaded but not yet linked, in load order.
    pending: Vec<ModuleRef>,
    process_path: Option<String>,
}

/// A module reference as the importer names it, and what it loaded as. The
/// two names differ when a file's internal module name isn't its file name.
struct Dependency {
    reference: String,
    module: ModuleRef,
}

fn key(name: &str) -> String {
    name.to_ascii_uppercase()
}

/// Resolves one module's imports to the modules its references loaded.
struct ImportResolver<'a> {
    manager: &'a ModuleManager,
    imports: &'a [Dependency],
}

impl ModuleResolver for ImportResolver<'_> {
    fn resolve(&self, name: &str) -> Option<ModuleRef> {
        let name = name.trim_end_matches('.');
        self.imports
            .iter()
            .find(|d| d.reference.eq_ignore_ascii_case(name))
            .map(|d| d.module.clone())
            .or_else(|| self.manager.find_loaded(name))
    }
}

impl ModuleManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes a host-implemented module available under its name. It is only
    /// registered once something loads it.
    pub fn provide(&mut self, module: ModuleRef) {
        let name = key(module.borrow().name());
        self.available.insert(name, module);
    }

    /// Guest directory searched after the parent module's directory.
    pub fn set_process_path(&mut self, path: &str) {
        self.process_path = Some(path.to_string());
    }

    pub fn module(&self, name: &str) -> Option<ModuleRef> {
        self.loaded.get(&key(name)).cloned()
    }

    /// Module owning an instance handle. Handle 0 is the process executable.
    pub fn module_by_handle(&self, handle: u16) -> Option<ModuleRef> {
        if handle == 0 {
            return self
                .loaded
                .values()
                .find(|m| {
                    let m = m.borrow();
                    m.state().handle != 0 && m.as_segmented().is_some_and(|s| !s.is_dll())
                })
                .cloned();
        }
        self.instances.get(&handle).cloned()
    }

    /// Loaded modules sorted by name.
    pub fn all_modules(&self) -> Vec<ModuleRef> {
        let mut names: Vec<&String> = self.loaded.keys().collect();
        names.sort();
        names.into_iter().map(|n| self.loaded[n].clone()).collect()
    }

    /// Loads a module by module name or guest file name, bumping its
    /// reference count if it is already loaded.
    pub fn load_module(&mut self, machine: &mut Machine, name: &str) -> Result<ModuleRef> {
        self.load_module_from(machine, name, None)
    }

    fn find_loaded(&self, name: &str) -> Option<ModuleRef> {
        if let Some(module) = self.loaded.get(&key(name)) {
            return Some(module.clone());
        }
        // Modules being linked are mutably borrowed; they can't match here.
        self.loaded
            .values()
            .find(|m| {
                m.try_borrow().is_ok_and(|m| {
                    m.file_name().is_some_and(|f| {
                        let file = dos::file_name(f);
                        let stem = file.rsplit_once('.').map_or(file, |(stem, _)| stem);
                        file.eq_ignore_ascii_case(name) || stem.eq_ignore_ascii_case(name)
                    })
                })
            })
            .cloned()
    }

    fn load_module_from(&mut self, machine: &mut Machine, name: &str, parent_dir: Option<&str>) -> Result<ModuleRef> {
        // Some programs load "GDI." and the like.
        let name = name.trim_end_matches('.');

        if let Some(module) = self.find_loaded(name) {
            module.borrow_mut().state_mut().load_count += 1;
            return Ok(module);
        }

        if let Some(module) = self.available.get(&key(name)).cloned() {
            self.register_module(machine, module.clone())?;
            return Ok(module);
        }

        let guest = self
            .locate(machine, name, parent_dir)
            .ok_or_else(|| VirtualError::ModuleNotFound(name.to_string()))?;

        let existing = self
            .loaded
            .values()
            .find(|m| m.borrow().file_name() == Some(guest.as_str()))
            .cloned();
        if let Some(module) = existing {
            module.borrow_mut().state_mut().load_count += 1;
            return Ok(module);
        }

        let host = machine
            .paths()
            .map_guest_to_host(&guest)
            .ok_or_else(|| VirtualError::UnmappedPath(guest.clone()))?;
        tracing::debug!("Loading '{}' from {}", guest, host.display());
        let module: ModuleRef = Rc::new(RefCell::new(SegmentedModule::open(&host, &guest)?));
        self.register_module(machine, module.clone())?;
        Ok(module)
    }

    /// Guest path of a module file, searching the parent's directory, the
    /// process directory and then `PATH`.
    pub fn locate(&self, machine: &Machine, name: &str, parent_dir: Option<&str>) -> Option<String> {
        let mut file = name.to_string();
        if !dos::file_name(&file).contains('.') {
            file.push_str(DEFAULT_EXTENSION);
        }
        if dos::is_fully_qualified(&file) {
            return Some(file.to_ascii_uppercase());
        }

        let search_path = parent_dir
            .map(str::to_string)
            .into_iter()
            .chain(self.process_path.clone())
            .chain(
                machine
                    .config()
                    .env("PATH")
                    .into_iter()
                    .flat_map(|p| p.split(';'))
                    .map(str::to_string),
            );

        for dir in search_path {
            if !dos::is_fully_qualified(&dir) {
                continue;
            }
            let guest = dos::resolve_relative(&dir, &file);
            let Some(host) = machine.paths().map_guest_to_host(&guest) else {
                continue;
            };
            if host.is_file() {
                return Some(guest.to_ascii_uppercase());
            }
        }
        None
    }

    /// Adds a reference to `module`, loading, linking and initializing it
    /// (and whatever it imports from) if this is the first one.
    pub fn register_module(&mut self, machine: &mut Machine, module: ModuleRef) -> Result<()> {
        if self.depth == 0 {
            self.pending.clear();
        }

        self.depth += 1;
        let loaded = self.load_phase(machine, &module);
        self.depth -= 1;

        if let Err(err) = loaded {
            if self.depth == 0 {
                self.pending.clear();
            }
            return Err(err);
        }
        if self.depth > 0 {
            return Ok(());
        }

        let pending = std::mem::take(&mut self.pending);
        if let Err(err) = self.link_and_init(machine, &module, &pending) {
            self.discard(machine, &pending);
            return Err(err);
        }
        Ok(())
    }

    /// Drops every module loaded by a pass that failed to link or init,
    /// whatever its reference count. Modules loaded before the pass only lose
    /// the references the pass added.
    fn discard(&mut self, machine: &mut Machine, pending: &[ModuleRef]) {
        let in_pass = |module: &ModuleRef| pending.iter().any(|m| Rc::ptr_eq(m, module));
        let mut released = Vec::new();

        for module in pending.iter().rev() {
            let (name, state) = {
                let mut m = module.borrow_mut();
                let name = key(m.name());
                (name, std::mem::take(m.state_mut()))
            };
            tracing::debug!("Discarding module '{}'", name);
            if state.initialized {
                if let Err(err) = module.borrow_mut().uninit(machine) {
                    tracing::warn!("Unwinding '{}' failed: {}", name, err);
                }
            }
            if state.handle != 0 {
                self.instances.remove(&state.handle);
                machine.heap_mut().free(state.handle);
            }
            self.loaded.remove(&name);
            for dependency in self.dependencies.remove(&name).unwrap_or_default() {
                if !in_pass(&dependency.module) {
                    released.push(dependency.module);
                }
            }
        }

        for dependency in released {
            if let Err(err) = self.unload_module(machine, &dependency) {
                tracing::warn!("Unwinding '{}' failed: {}", dependency.borrow().name(), err);
            }
        }
        for module in pending {
            let mut m = module.borrow_mut();
            if let Err(err) = m.unload(machine) {
                tracing::warn!("Unwinding '{}' failed: {}", m.name(), err);
            }
        }
    }

    fn load_phase(&mut self, machine: &mut Machine, module: &ModuleRef) -> Result<()> {
        let (name, references, parent_dir) = {
            let mut m = module.borrow_mut();
            let state = m.state_mut();
            state.load_count += 1;
            if state.load_count != 1 {
                return Ok(());
            }
            (key(m.name()), m.referenced_modules(), m.file_name().and_then(dos::directory_of))
        };

        self.loaded.insert(name.clone(), module.clone());

        let mut dependencies = Vec::new();
        let mut result = Ok(());
        for reference in &references {
            // Self-references would keep the module alive forever.
            if key(reference) == name {
                continue;
            }
            match self.load_module_from(machine, reference, parent_dir.as_deref()) {
                Ok(module) => dependencies.push(Dependency {
                    reference: reference.trim_end_matches('.').to_string(),
                    module,
                }),
                Err(err) => {
                    result = Err(err);
                    break;
                }
            }
        }
        if result.is_ok() {
            tracing::debug!("Loading module '{}'", name);
            result = module.borrow_mut().load(machine);
        }

        if let Err(err) = result {
            for dependency in dependencies.iter().rev() {
                if let Err(unload) = self.unload_module(machine, &dependency.module) {
                    tracing::warn!("Unwinding '{}' failed: {}", dependency.module.borrow().name(), unload);
                }
            }
            self.loaded.remove(&name);
            let mut m = module.borrow_mut();
            m.state_mut().load_count -= 1;
            // Frees whatever a partial load allocated.
            if let Err(unload) = m.unload(machine) {
                tracing::warn!("Unwinding '{}' failed: {}", name, unload);
            }
            return Err(err);
        }

        self.dependencies.insert(name, dependencies);
        self.pending.push(module.clone());
        Ok(())
    }

    fn link_and_init(&mut self, machine: &mut Machine, root: &ModuleRef, pending: &[ModuleRef]) -> Result<()> {
        for module in pending {
            let name = key(module.borrow().name());
            let resolver = ImportResolver {
                manager: self,
                imports: self.dependencies.get(&name).map(Vec::as_slice).unwrap_or_default(),
            };
            tracing::debug!("Linking module '{}'", name);
            module.borrow_mut().link(machine, &resolver)?;
        }

        // A freshly loaded executable's stack must be in place before library
        // init runs on it.
        if pending.iter().any(|m| Rc::ptr_eq(m, root)) {
            if let Some(exe) = root.borrow().as_segmented().filter(|s| !s.is_dll()) {
                exe.prepare_stack(machine)?;
            }
        }

        for module in pending {
            let name = key(module.borrow().name());
            let label = format!("Module '{}' instance handle", name);
            let handle = machine
                .heap_mut()
                .alloc(&label, 0, HANDLE_SIZE)
                .ok_or(VirtualError::OutOfMemory {
                    name: label,
                    size: HANDLE_SIZE,
                })?;
            self.instances.insert(handle, module.clone());

            let mut m = module.borrow_mut();
            m.state_mut().handle = handle;
            tracing::debug!("Initializing module '{}' (handle {:04X})", name, handle);
            m.init(machine)?;
            m.state_mut().initialized = true;
        }
        Ok(())
    }

    /// Drops one reference. The last one uninitializes the module, releases
    /// the modules it loaded, and unloads it.
    pub fn unload_module(&mut self, machine: &mut Machine, module: &ModuleRef) -> Result<()> {
        let (name, initialized, handle) = {
            let mut m = module.borrow_mut();
            let name = key(m.name());
            let state = m.state_mut();
            if state.load_count == 0 {
                return Err(VirtualError::ModuleNotLoaded(name).into());
            }
            state.load_count -= 1;
            if state.load_count > 0 {
                return Ok(());
            }
            (name, state.initialized, state.handle)
        };
        tracing::debug!("Unloading module '{}'", name);

        let mut result = if initialized {
            module.borrow_mut().uninit(machine)
        } else {
            Ok(())
        };

        for dependency in self.dependencies.remove(&name).unwrap_or_default() {
            let released = self.unload_module(machine, &dependency.module);
            if result.is_ok() {
                result = released;
            }
        }

        if handle != 0 {
            self.instances.remove(&handle);
            machine.heap_mut().free(handle);
        }
        self.loaded.remove(&name);
        self.pending.retain(|m| !Rc::ptr_eq(m, module));

        let mut m = module.borrow_mut();
        let state = m.state_mut();
        state.handle = 0;
        state.initialized = false;
        let unloaded = m.unload(machine);
        result.and(unloaded)
    }
}

impl ModuleResolver for ModuleManager {
    fn resolve(&self, name: &str) -> Option<ModuleRef> {
        self.find_loaded(name)
    }
}
