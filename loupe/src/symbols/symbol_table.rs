//! Function symbol tables read from object files

use object::{Object, ObjectSymbol, SymbolKind};
use rustc_demangle::demangle;
use std::fs;

use crate::domain::{FunctionInfo, SymbolError};

/// Function symbols of one module, sorted by ELF address.
#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    module_path: String,
    functions: Vec<FunctionInfo>,
}

impl SymbolTable {
    /// Build a table from unsorted functions; duplicates by address are dropped.
    #[must_use]
    pub fn new(module_path: impl Into<String>, mut functions: Vec<FunctionInfo>) -> Self {
        functions.sort_by_key(|f| f.address);
        functions.dedup_by_key(|f| f.address);
        Self { module_path: module_path.into(), functions }
    }

    #[must_use]
    pub fn module_path(&self) -> &str {
        &self.module_path
    }

    #[must_use]
    pub fn functions(&self) -> &[FunctionInfo] {
        &self.functions
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.functions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    #[must_use]
    pub fn find_exact(&self, elf_address: u64) -> Option<&FunctionInfo> {
        self.functions
            .binary_search_by_key(&elf_address, |f| f.address)
            .ok()
            .map(|index| &self.functions[index])
    }

    /// The function whose `[address, address + size]` contains `elf_address`
    #[must_use]
    pub fn find_containing(&self, elf_address: u64) -> Option<&FunctionInfo> {
        let index = self.functions.partition_point(|f| f.address <= elf_address);
        let candidate = self.functions.get(index.checked_sub(1)?)?;
        (elf_address <= candidate.address.saturating_add(candidate.size)).then_some(candidate)
    }

    /// Functions whose display name contains `pattern`
    pub fn search<'a>(&'a self, pattern: &'a str) -> impl Iterator<Item = &'a FunctionInfo> + 'a {
        self.functions.iter().filter(move |f| f.display_name().contains(pattern))
    }
}

/// Demangle a Rust symbol name; other names are returned unchanged
#[must_use]
pub fn demangle_symbol(symbol: &str) -> String {
    format!("{:#}", demangle(symbol))
}

/// Read the defined function symbols of the object file at `module_path`.
///
/// Both the static and the dynamic symbol tables are used.
///
/// # Errors
/// Returns an error if the file cannot be read or parsed, or if it has no function
/// symbols at all
pub fn load_symbols(module_path: &str) -> Result<SymbolTable, SymbolError> {
    let data = fs::read(module_path)
        .map_err(|source| SymbolError::Read { path: module_path.to_string(), source })?;
    let file = object::File::parse(&*data).map_err(|err| SymbolError::Parse {
        path: module_path.to_string(),
        reason: err.to_string(),
    })?;

    let functions: Vec<FunctionInfo> = file
        .symbols()
        .chain(file.dynamic_symbols())
        .filter(|symbol| symbol.kind() == SymbolKind::Text && symbol.is_definition())
        .filter_map(|symbol| {
            let name = symbol.name().ok().filter(|name| !name.is_empty())?;
            Some(FunctionInfo::new(
                name,
                demangle_symbol(name),
                module_path,
                symbol.address(),
                symbol.size(),
            ))
        })
        .collect();

    if functions.is_empty() {
        return Err(SymbolError::NoSymbols(module_path.to_string()));
    }
    Ok(SymbolTable::new(module_path, functions))
}
