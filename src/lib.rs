//! 16-bit Segmented Module Loader Library.
//!
//! This library provides the core components for the `nelink` loader.
//! It is organized into several modules:
//! - `ne`: NE executable records and the file reader.
//! - `linker`: segmented module load, relocation and start-up.
//! - `manager`: module registry and the load/link/init protocol.
//! - `native`, `marshal`: host functions exposed as 16-bit exports.
//! - `bridge`, `machine`, `cpu`, `memory`: the emulated side and the
//!   transitions between it and native code.
//! - `config`, `paths`, `writer`: CLI configuration, guest paths, image dumps.

pub mod bridge;
pub mod config;
pub mod cpu;
pub mod error;
pub mod fixup;
pub mod linker;
pub mod machine;
pub mod manager;
pub mod marshal;
pub mod memory;
pub mod module;
pub mod native;
pub mod ne;
pub mod paths;
pub mod utils;
pub mod writer;

pub use error::{Error, Result};
