//! Configuration module.
//!
//! `Config` is the command-line interface of the `nelink` tool, parsed with
//! `clap`. `MachineConfig` is what the library consumes: logging switches,
//! link policy and the guest environment. The CLI builds one from the other.

use clap::Parser;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Per-machine logging switches. Passed to `Machine::new` and consulted by
/// the linker, the call bridge and the native marshaler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogOptions {
    /// Trace every relocation record and chain link.
    pub relocations: bool,
    /// Trace native API invocations with their decoded arguments.
    pub api_calls: bool,
    /// Trace native/emulated transitions.
    pub transitions: bool,
}

/// What to do when an exported entry point does not start with the expected
/// `push ds; pop ax; nop` prologue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ProloguePolicy {
    /// Warn and patch anyway.
    #[default]
    BestEffort,
    /// Fail the link.
    Strict,
}

#[derive(Debug, Clone)]
pub struct MachineConfig {
    pub log: LogOptions,
    pub prologue: ProloguePolicy,
    /// Call library entry points during module init.
    pub run_init: bool,
    /// Guest environment. Keys are stored upper case.
    pub environment: BTreeMap<String, String>,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            log: LogOptions::default(),
            prologue: ProloguePolicy::default(),
            run_init: true,
            environment: BTreeMap::new(),
        }
    }
}

impl MachineConfig {
    pub fn set_env(&mut self, key: &str, value: &str) {
        self.environment.insert(key.to_ascii_uppercase(), value.to_string());
    }

    pub fn env(&self, key: &str) -> Option<&str> {
        self.environment.get(&key.to_ascii_uppercase()).map(String::as_str)
    }
}

/// Loads and links a 16-bit segmented (NE) executable or library.
///
/// Resolves the module's imports through the search path, applies all
/// relocations and prepares it to run. The relocated segments can be dumped
/// for inspection.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Module to load (.EXE or .DLL)
    pub input: PathBuf,

    /// Guest search path, `;`-separated (becomes PATH)
    #[arg(long, default_value = "")]
    pub path: String,

    /// Drive mapping, e.g. `C:\WINDOWS=/opt/win/windows`. Repeatable.
    #[arg(long = "mount", value_parser = parse_mount)]
    pub mounts: Vec<(String, PathBuf)>,

    /// Modules provided natively instead of from disk
    #[arg(
        long = "native",
        value_delimiter = ',',
        default_values_t = ["KERNEL", "USER", "GDI", "KEYBOARD"].map(String::from)
    )]
    pub native: Vec<String>,

    /// Directory to write the relocated segments to
    #[arg(short, long, help = "Dump relocated segments to this directory")]
    pub output: Option<PathBuf>,

    /// Command tail placed in the program segment prefix
    #[arg(long, default_value = "")]
    pub command_tail: String,

    /// Do not call library entry points
    #[arg(long)]
    pub no_init: bool,

    /// Fail when an exported entry point has an unexpected prologue
    #[arg(long)]
    pub strict_prologue: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", help = "Set the logging level")]
    pub log_level: String,

    /// Log every relocation
    #[arg(long)]
    pub log_relocations: bool,

    /// Log native API calls
    #[arg(long)]
    pub log_api_calls: bool,
}

impl Config {
    pub fn machine_config(&self) -> MachineConfig {
        let mut config = MachineConfig {
            log: LogOptions {
                relocations: self.log_relocations,
                api_calls: self.log_api_calls,
                transitions: self.log_api_calls,
            },
            prologue: if self.strict_prologue {
                ProloguePolicy::Strict
            } else {
                ProloguePolicy::BestEffort
            },
            run_init: !self.no_init,
            environment: BTreeMap::new(),
        };
        if !self.path.is_empty() {
            config.set_env("PATH", &self.path);
        }
        config
    }
}

fn parse_mount(arg: &str) -> Result<(String, PathBuf), String> {
    let (guest, host) = arg
        .split_once('=')
        .ok_or_else(|| format!("expected GUEST=HOST, got '{arg}'"))?;
    if guest.is_empty() || host.is_empty() {
        return Err(format!("expected GUEST=HOST, got '{arg}'"));
    }
    Ok((guest.to_string(), PathBuf::from(host)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_flags_reach_the_machine_config() {
        let config = Config::parse_from([
            "nelink",
            "APP.EXE",
            "--path",
            "C:\\WINDOWS;C:\\WINDOWS\\SYSTEM",
            "--mount",
            "C:\\=/tmp/drive_c",
            "--strict-prologue",
            "--no-init",
        ]);
        assert_eq!(config.mounts, vec![("C:\\".to_string(), PathBuf::from("/tmp/drive_c"))]);
        assert_eq!(config.native, vec!["KERNEL", "USER", "GDI", "KEYBOARD"]);

        let machine = config.machine_config();
        assert_eq!(machine.prologue, ProloguePolicy::Strict);
        assert!(!machine.run_init);
        assert_eq!(machine.env("path"), Some("C:\\WINDOWS;C:\\WINDOWS\\SYSTEM"));
    }

    #[test]
    fn malformed_mounts_are_rejected() {
        assert!(parse_mount("C:\\").is_err());
        assert!(parse_mount("=/tmp").is_err());
    }
}
