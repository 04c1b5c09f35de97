//! Guest/host path translation.
//!
//! Guest paths are DOS style (`C:\WINDOWS\SYSTEM\GDI.EXE`, case-insensitive,
//! 8.3 names). A [`PathMapper`] maps guest prefixes onto host directories.

use std::fs;
use std::path::{Path, PathBuf};

/// DOS path helpers.
pub mod dos {
    const INVALID_CHARS: &[char] = &['"', '*', '+', ',', '/', ':', ';', '<', '=', '>', '?', '[', ']', '|', '\\', ' '];

    /// `X:\...`
    pub fn is_fully_qualified(path: &str) -> bool {
        let b = path.as_bytes();
        b.len() >= 3 && b[0].is_ascii_alphabetic() && b[1] == b':' && b[2] == b'\\'
    }

    /// Final component of a path.
    pub fn file_name(path: &str) -> &str {
        match path.rfind(['\\', ':']) {
            Some(pos) => &path[pos + 1..],
            None => path,
        }
    }

    /// Everything before the final component. A drive root keeps its slash.
    pub fn directory_of(path: &str) -> Option<String> {
        let pos = path.rfind('\\')?;
        if pos == 2 && is_fully_qualified(path) {
            return Some(path[..3].to_string());
        }
        Some(path[..pos].to_string())
    }

    /// A valid 8.3 name component.
    pub fn is_valid_name(name: &str) -> bool {
        if name == "." || name == ".." {
            return true;
        }
        let (base, ext) = match name.split_once('.') {
            Some((base, ext)) => (base, Some(ext)),
            None => (name, None),
        };
        let valid = |s: &str| s.chars().all(|c| c.is_ascii() && !c.is_ascii_control() && !INVALID_CHARS.contains(&c));
        !base.is_empty()
            && base.len() <= 8
            && valid(base)
            && ext.map_or(true, |ext| ext.len() <= 3 && !ext.contains('.') && valid(ext))
    }

    /// Resolves `path` against the directory `base`, collapsing `.` and `..`.
    pub fn resolve_relative(base: &str, path: &str) -> String {
        let joined = if is_fully_qualified(path) {
            path.to_string()
        } else if let Some(rest) = path.strip_prefix('\\') {
            format!("{}\\{}", &base[..2.min(base.len())], rest)
        } else {
            format!("{}\\{}", base.trim_end_matches('\\'), path)
        };

        let mut parts: Vec<&str> = Vec::new();
        let mut components = joined.split('\\');
        let drive = components.next().unwrap_or_default();
        for part in components {
            match part {
                "" | "." => {}
                ".." => {
                    parts.pop();
                }
                other => parts.push(other),
            }
        }
        format!("{}\\{}", drive, parts.join("\\"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    /// Upper-case guest prefix, e.g. `C:\WINDOWS`.
    pub guest: String,
    pub host: PathBuf,
}

#[derive(Debug, Clone, Default)]
pub struct PathMapper {
    /// Longest guest prefix first.
    mounts: Vec<Mount>,
}

fn prefix_matches(prefix: &str, path: &str) -> bool {
    if !path.starts_with(prefix) {
        return false;
    }
    prefix.ends_with('\\') || path.len() == prefix.len() || path.as_bytes()[prefix.len()] == b'\\'
}

/// Finds `name` in `dir` ignoring case, falling back to the name as given.
fn resolve_component(dir: &Path, name: &str) -> PathBuf {
    if let Ok(entries) = fs::read_dir(dir) {
        for entry in entries.flatten() {
            if entry.file_name().to_string_lossy().eq_ignore_ascii_case(name) {
                return dir.join(entry.file_name());
            }
        }
    }
    dir.join(name)
}

impl PathMapper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_mount(&mut self, guest: &str, host: impl Into<PathBuf>) {
        let mut guest = guest.replace('/', "\\").to_ascii_uppercase();
        if guest.len() > 3 {
            guest = guest.trim_end_matches('\\').to_string();
        } else if guest.len() == 2 {
            guest.push('\\');
        }
        self.mounts.push(Mount {
            guest,
            host: host.into(),
        });
        self.mounts.sort_by(|a, b| b.guest.len().cmp(&a.guest.len()));
    }

    pub fn mounts(&self) -> &[Mount] {
        &self.mounts
    }

    /// Host path for a guest path, or `None` if no mount covers it. Each
    /// component is matched case-insensitively against what exists on disk.
    pub fn map_guest_to_host(&self, guest: &str) -> Option<PathBuf> {
        let guest = guest.replace('/', "\\").to_ascii_uppercase();
        let mount = self.mounts.iter().find(|m| prefix_matches(&m.guest, &guest))?;
        let tail = &guest[mount.guest.len()..];
        let mut path = mount.host.clone();
        for component in tail.split('\\').filter(|c| !c.is_empty()) {
            path = resolve_component(&path, component);
        }
        Some(path)
    }

    /// Guest path for a host path. `None` if no mount covers it or a
    /// component is not a valid 8.3 name.
    pub fn map_host_to_guest(&self, host: &Path) -> Option<String> {
        let mount = self.mounts.iter().find(|m| host.starts_with(&m.host))?;
        let rest = host.strip_prefix(&mount.host).ok()?;
        let mut guest = mount.guest.clone();
        for component in rest.components() {
            let name = component.as_os_str().to_string_lossy();
            if !dos::is_valid_name(&name) {
                return None;
            }
            if !guest.ends_with('\\') {
                guest.push('\\');
            }
            guest.push_str(&name);
        }
        Some(guest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn dos_path_helpers() {
        assert!(dos::is_fully_qualified("C:\\WINDOWS"));
        assert!(!dos::is_fully_qualified("WINDOWS\\GDI.EXE"));
        assert_eq!(dos::file_name("C:\\WINDOWS\\GDI.EXE"), "GDI.EXE");
        assert_eq!(dos::file_name("C:GDI.EXE"), "GDI.EXE");
        assert_eq!(dos::directory_of("C:\\WINDOWS\\GDI.EXE").as_deref(), Some("C:\\WINDOWS"));
        assert_eq!(dos::directory_of("C:\\GDI.EXE").as_deref(), Some("C:\\"));
        assert_eq!(dos::directory_of("GDI.EXE"), None);
    }

    #[test]
    fn relative_paths_resolve_against_a_directory() {
        assert_eq!(dos::resolve_relative("C:\\WINDOWS", "GDI.EXE"), "C:\\WINDOWS\\GDI.EXE");
        assert_eq!(dos::resolve_relative("C:\\WINDOWS\\", "..\\APP\\.\\A.DLL"), "C:\\APP\\A.DLL");
        assert_eq!(dos::resolve_relative("C:\\WINDOWS", "\\TMP\\X.DAT"), "C:\\TMP\\X.DAT");
        assert_eq!(dos::resolve_relative("C:\\WINDOWS", "D:\\X.DLL"), "D:\\X.DLL");
    }

    #[test]
    fn eight_dot_three_names() {
        assert!(dos::is_valid_name("KRNL286.EXE"));
        assert!(dos::is_valid_name("system"));
        assert!(!dos::is_valid_name("thisnamecantbemapped.extension"));
        assert!(!dos::is_valid_name("A B.TXT"));
    }

    #[test]
    fn mounts_translate_both_ways() {
        let mut paths = PathMapper::new();
        paths.add_mount("C:\\", "/drive_c");
        paths.add_mount("c:\\windows\\", "/opt/win");

        assert_eq!(
            paths.map_guest_to_host("C:\\WINDOWS\\SYSTEM\\KRNL286.EXE"),
            Some(PathBuf::from("/opt/win/SYSTEM/KRNL286.EXE"))
        );
        assert_eq!(
            paths.map_guest_to_host("C:\\WINDOWSX\\A.DLL"),
            Some(PathBuf::from("/drive_c/WINDOWSX/A.DLL"))
        );
        assert_eq!(paths.map_guest_to_host("D:\\A.DLL"), None);

        assert_eq!(
            paths.map_host_to_guest(Path::new("/opt/win/system/krnl286.exe")).as_deref(),
            Some("C:\\WINDOWS\\system\\krnl286.exe")
        );
        assert_eq!(
            paths.map_host_to_guest(Path::new("/opt/win/thisnamecantbemapped.extension")),
            None
        );
    }

    #[test]
    fn guest_lookup_matches_host_case() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("System")).unwrap();
        fs::write(dir.path().join("System").join("Gdi.Exe"), b"MZ").unwrap();

        let mut paths = PathMapper::new();
        paths.add_mount("C:\\WINDOWS", dir.path());
        let host = paths.map_guest_to_host("C:\\WINDOWS\\SYSTEM\\GDI.EXE").unwrap();
        assert_eq!(host, dir.path().join("System").join("Gdi.Exe"));
        assert!(host.is_file());
    }
}
