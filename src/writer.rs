//! Relocated image dump.
//!
//! Writes a loaded module's segments as they sit in guest memory, one file
//! per segment, plus a text map of selectors and entry points.

use anyhow::{Context, Result};
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use crate::linker::SegmentedModule;
use crate::memory::GlobalHeap;
use crate::module::Module;

/// Writes `<MODULE>.<n>.seg` for every segment and `<MODULE>.map`. Returns the
/// files written, map last.
pub fn write_image(dir: &Path, module: &SegmentedModule, heap: &dyn GlobalHeap) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;

    let image = module.image();
    let name = module.name();
    let mut written = Vec::new();
    let mut map = String::new();

    writeln!(
        map,
        "{} ({}) {}",
        name,
        module.file_name().unwrap_or("?"),
        if module.is_dll() { "library" } else { "executable" }
    )?;
    if !image.description.is_empty() {
        writeln!(map, "{}", image.description)?;
    }
    writeln!(map)?;
    writeln!(map, "segment  selector  size     kind")?;

    for (index, selector) in module.selectors().iter().enumerate() {
        let bytes = heap
            .buffer(*selector)
            .with_context(|| format!("segment {} of {} has no storage", index + 1, name))?;
        let path = dir.join(format!("{}.{}.seg", name, index + 1));
        fs::write(&path, bytes).with_context(|| format!("failed to write {}", path.display()))?;
        written.push(path);

        let segment = &image.segments[index];
        let auto_data = if *selector == module.data_selector() { " (auto data)" } else { "" };
        writeln!(
            map,
            "{:>7}  {:04X}      0x{:05X}  {}{}",
            index + 1,
            selector,
            bytes.len(),
            segment.describe(),
            auto_data
        )?;
    }

    writeln!(map)?;
    writeln!(map, "ordinal  address    name")?;
    for entry in image.entry_points.values() {
        let address = if entry.is_constant() {
            format!("const {:04X}", entry.offset)
        } else {
            match module.selectors().get((entry.segment as usize).wrapping_sub(1)) {
                Some(selector) => format!("{:04X}:{:04X}", selector, entry.offset),
                None => format!("?{}:{:04X}", entry.segment, entry.offset),
            }
        };
        let mut flags = String::new();
        if entry.is_exported() {
            flags.push_str(" exported");
        }
        if entry.uses_shared_data() {
            flags.push_str(" shared");
        }
        writeln!(
            map,
            "{:>7}  {:<10} {}{}",
            entry.ordinal,
            address,
            image.name_from_ordinal(entry.ordinal).unwrap_or("-"),
            flags
        )?;
    }

    if !image.module_references.is_empty() {
        writeln!(map)?;
        writeln!(map, "imports: {}", image.module_references.join(", "))?;
    }

    let path = dir.join(format!("{}.map", name));
    fs::write(&path, map).with_context(|| format!("failed to write {}", path.display()))?;
    written.push(path);
    Ok(written)
}
