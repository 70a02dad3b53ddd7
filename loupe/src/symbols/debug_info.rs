//! DWARF line tables of one module
//!
//! Addresses given here are ELF addresses (module-relative offset plus load bias);
//! see the translation table in the parent module.

use addr2line::Context;
use gimli::{EndianRcSlice, RunTimeEndian, SectionId};
use object::{Object, ObjectSection};
use serde::Serialize;
use std::borrow::Cow;
use std::fs;
use std::rc::Rc;

use crate::domain::SymbolError;

type Reader = EndianRcSlice<RunTimeEndian>;

/// Line information of one object file, loaded once and queried by ELF address.
pub struct DebugInfo {
    module_path: String,
    context: Context<Reader>,
}

impl DebugInfo {
    /// Load the DWARF sections of the object file at `module_path`
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed, or carries no DWARF
    pub fn new(module_path: &str) -> Result<Self, SymbolError> {
        let data = fs::read(module_path)
            .map_err(|source| SymbolError::Read { path: module_path.to_string(), source })?;
        let file = object::File::parse(&*data).map_err(|err| SymbolError::Parse {
            path: module_path.to_string(),
            reason: err.to_string(),
        })?;
        if file.section_by_name(SectionId::DebugInfo.name()).is_none() {
            return Err(SymbolError::NoDebugInfo(module_path.to_string()));
        }

        let endian =
            if file.is_little_endian() { RunTimeEndian::Little } else { RunTimeEndian::Big };
        let context = gimli::Dwarf::load(|id| Ok::<_, gimli::Error>(section(&file, id, endian)))
            .and_then(Context::from_dwarf)
            .map_err(|_| SymbolError::NoDebugInfo(module_path.to_string()))?;

        Ok(Self { module_path: module_path.to_string(), context })
    }

    #[must_use]
    pub fn module_path(&self) -> &str {
        &self.module_path
    }

    /// File, line and column of the innermost (possibly inlined) code at
    /// `elf_address`
    ///
    /// # Errors
    /// Returns [`SymbolError::NoLineInfo`] if no line row covers `elf_address`
    pub fn line_info(&self, elf_address: u64) -> Result<SourceLocation, SymbolError> {
        let no_line_info =
            || SymbolError::NoLineInfo { path: self.module_path.clone(), address: elf_address };
        let location = self
            .context
            .find_location(elf_address)
            .map_err(|_| no_line_info())?
            .filter(|location| location.file.is_some())
            .ok_or_else(no_line_info)?;
        Ok(SourceLocation {
            file: location.file.map(str::to_string),
            line: location.line,
            column: location.column,
        })
    }
}

/// Uncompressed contents of a DWARF section; absent sections read as empty
fn section(file: &object::File<'_>, id: SectionId, endian: RunTimeEndian) -> Reader {
    let data = file
        .section_by_name(id.name())
        .and_then(|section| section.uncompressed_data().ok())
        .unwrap_or(Cow::Borrowed(&[][..]));
    EndianRcSlice::new(Rc::from(&*data), endian)
}

/// Source code location
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceLocation {
    pub file: Option<String>,
    pub line: Option<u32>,
    pub column: Option<u32>,
}

impl std::fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.file.as_deref().unwrap_or("??"))?;
        if let Some(line) = self.line {
            write!(f, ":{line}")?;
            if let Some(col) = self.column {
                write!(f, ":{col}")?;
            }
        }
        Ok(())
    }
}
