//! Entry point for the nelink loader.
//!
//! This file handles high-level application flow:
//! 1. Parse command-line arguments using `clap`.
//! 2. Set up logging, the machine and its drive mappings.
//! 3. Load the input module with its imports (unknown system modules are
//!    provided as native stubs), link and initialize it.
//! 4. Prepare an executable to run, dump the relocated image, report and unload.
//!
//! Error handling is done via `anyhow`.

use anyhow::{Context, Result};
use clap::Parser;
use std::cell::RefCell;
use std::rc::Rc;
use tracing_subscriber::EnvFilter;

use nelink::config::Config;
use nelink::cpu::MiniCpu;
use nelink::machine::Machine;
use nelink::manager::ModuleManager;
use nelink::memory::SelectorHeap;
use nelink::native::NativeModule;
use nelink::paths::dos;
use nelink::writer;

/// `nCmdShow` handed to the task.
const SW_SHOWNORMAL: u16 = 1;

fn main() -> Result<()> {
    let config = Config::parse();

    let filter = EnvFilter::try_new(&config.log_level)
        .with_context(|| format!("invalid log level '{}'", config.log_level))?;
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .finish();
    let _log_guard = tracing::subscriber::set_default(subscriber);

    let mut machine = Machine::new(
        config.machine_config(),
        Box::new(MiniCpu::new()),
        Box::new(SelectorHeap::new()),
    )?;

    let input = config
        .input
        .canonicalize()
        .with_context(|| format!("failed to open {}", config.input.display()))?;
    if config.mounts.is_empty() {
        let dir = input.parent().context("input has no parent directory")?;
        machine.paths_mut().add_mount("C:\\", dir);
    }
    for (guest, host) in &config.mounts {
        machine.paths_mut().add_mount(guest, host);
    }
    let guest = machine
        .paths()
        .map_host_to_guest(&input)
        .with_context(|| format!("{} is not reachable through any mount", input.display()))?;

    let mut manager = ModuleManager::new();
    if let Some(dir) = dos::directory_of(&guest) {
        manager.set_process_path(&dir);
    }
    for name in &config.native {
        manager.provide(Rc::new(RefCell::new(NativeModule::stub(name))));
    }

    let module = manager
        .load_module(&mut machine, &guest)
        .with_context(|| format!("failed to load {}", guest))?;

    {
        let mut m = module.borrow_mut();
        if let Some(exe) = m.as_segmented_mut().filter(|s| !s.is_dll()) {
            exe.prepare_run(&mut machine, &config.command_tail, SW_SHOWNORMAL)?;
            let regs = machine.regs();
            tracing::info!(
                "Ready to run at {:04X}:{:04X}, stack {:04X}:{:04X}, PSP {:04X}",
                regs.cs,
                regs.ip,
                regs.ss,
                regs.sp,
                exe.psp()
            );
        }

        if let (Some(dir), Some(segmented)) = (&config.output, m.as_segmented()) {
            let files = writer::write_image(dir, segmented, machine.heap())?;
            tracing::info!("Wrote {} files to {}", files.len(), dir.display());
        }
    }

    for loaded in manager.all_modules() {
        let m = loaded.borrow();
        let state = m.state();
        let kind = match m.as_segmented() {
            Some(s) if s.is_dll() => "library",
            Some(_) => "executable",
            None => "native",
        };
        println!(
            "{:<8} {:<10} handle {:04X} refs {} {}",
            m.name(),
            kind,
            state.handle,
            state.load_count,
            m.file_name().unwrap_or("")
        );
    }

    manager
        .unload_module(&mut machine, &module)
        .with_context(|| format!("failed to unload {}", guest))?;
    println!("Loaded and linked {} successfully", guest);
    Ok(())
}
