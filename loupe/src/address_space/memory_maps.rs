//! Module enumeration from `/proc/<pid>/maps`
//!
//! All mappings of the same file are folded into one module spanning
//! `[min start, max end)`. Anonymous mappings and files that are never mapped
//! executable are not modules.

use log::debug;
use object::{Object, ObjectSegment};
use std::fmt::Write as _;
use std::fs;

use crate::domain::{AddressSpaceError, ModuleDescriptor, Pid};

/// One line of `/proc/<pid>/maps`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapEntry {
    pub start: u64,
    pub end: u64,
    pub executable: bool,
    pub inode: u64,
    pub path: String,
}

/// Parse the content of a maps file. Lines that do not parse are skipped.
#[must_use]
pub fn parse_maps(content: &str) -> Vec<MapEntry> {
    content.lines().filter_map(parse_line).collect()
}

// "start-end perms offset dev inode pathname"
fn parse_line(line: &str) -> Option<MapEntry> {
    let mut parts = line.split_whitespace();
    let (start, end) = parts.next()?.split_once('-')?;
    let perms = parts.next()?;
    let _offset = parts.next()?;
    let _dev = parts.next()?;
    let inode = parts.next()?.parse().ok()?;
    // Paths may contain spaces
    let path = parts.collect::<Vec<_>>().join(" ");

    Some(MapEntry {
        start: u64::from_str_radix(start, 16).ok()?,
        end: u64::from_str_radix(end, 16).ok()?,
        executable: perms.as_bytes().get(2) == Some(&b'x'),
        inode,
        path,
    })
}

/// Fold file-backed mappings into `(path, start, end)` in order of first mapping.
#[must_use]
pub fn group_by_file(entries: &[MapEntry]) -> Vec<(String, u64, u64)> {
    let mut modules: Vec<(String, u64, u64, bool)> = Vec::new();
    for entry in entries.iter().filter(|e| e.inode != 0 && !e.path.is_empty()) {
        if let Some(module) = modules.iter_mut().find(|m| m.0 == entry.path) {
            module.1 = module.1.min(entry.start);
            module.2 = module.2.max(entry.end);
            module.3 |= entry.executable;
        } else {
            modules.push((entry.path.clone(), entry.start, entry.end, entry.executable));
        }
    }
    modules
        .into_iter()
        .filter(|(_, _, _, executable)| *executable)
        .map(|(path, start, end, _)| (path, start, end))
        .collect()
}

/// Read the modules currently mapped into `pid`.
///
/// Files that cannot be opened or parsed as object files are skipped.
///
/// # Errors
/// Returns an error if the maps file of `pid` cannot be read
pub fn read_modules(pid: Pid) -> Result<Vec<ModuleDescriptor>, AddressSpaceError> {
    let maps_path = format!("/proc/{}/maps", pid.0);
    let content = fs::read_to_string(&maps_path).map_err(|err| match err.kind() {
        std::io::ErrorKind::NotFound => AddressSpaceError::ProcessNotFound(pid),
        std::io::ErrorKind::PermissionDenied => AddressSpaceError::Io(err),
        _ => AddressSpaceError::MemoryMapsParseFailed(pid),
    })?;

    let mut modules = Vec::new();
    for (path, start, end) in group_by_file(&parse_maps(&content)) {
        match module_from_file(&path, start, end) {
            Ok(module) => modules.push(module),
            Err(err) => debug!("Skipping mapping of {path}: {err}"),
        }
    }
    Ok(modules)
}

/// Describe the object file at `path` mapped at `[start, end)`.
///
/// # Errors
/// Returns [`AddressSpaceError::InvalidModule`] if the file is not a readable
/// object file
pub fn module_from_file(
    path: &str,
    start: u64,
    end: u64,
) -> Result<ModuleDescriptor, AddressSpaceError> {
    let invalid =
        |reason: String| AddressSpaceError::InvalidModule { path: path.to_string(), reason };

    let data = fs::read(path).map_err(|err| invalid(err.to_string()))?;
    let file = object::File::parse(&*data).map_err(|err| invalid(err.to_string()))?;

    let build_id = file
        .build_id()
        .ok()
        .flatten()
        .map(|id| {
            id.iter().fold(String::with_capacity(id.len() * 2), |mut hex, byte| {
                let _ = write!(hex, "{byte:02x}");
                hex
            })
        })
        .unwrap_or_default();
    let load_bias = file.segments().map(|segment| segment.address()).min().unwrap_or(0);

    Ok(ModuleDescriptor {
        file_path: path.to_string(),
        file_size: data.len() as u64,
        build_id,
        load_bias,
        address_start: start,
        address_end: end,
    })
}
