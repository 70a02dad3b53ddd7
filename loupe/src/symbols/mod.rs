//! # Symbol Resolution
//!
//! Turns an absolute instruction address of a process into a function name and a
//! source location. Two collaborators do the object-file work:
//!
//! - **`symbol_table`**: function symbols (name, demangled name, ELF address, size)
//!   read with `object`
//! - **`debug_info`**: DWARF line tables read with `addr2line`/`gimli`
//!
//! Both are consumed through the [`SymbolProvider`] trait so the resolver can be
//! driven by prebuilt tables in tests.
//!
//! ## Address Translation
//!
//! ```text
//! relative address = absolute address - module.address_start
//! ELF address      = relative address + module.load_bias
//! absolute address = ELF address + module.address_start - module.load_bias
//! ```

pub mod debug_info;
pub mod symbol_table;

use log::debug;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

use crate::address_space::{AddressSpace, Resolution};
use crate::domain::{AddressInfo, ModuleDescriptor, Pid, SymbolError};

pub use debug_info::{DebugInfo, SourceLocation};
pub use symbol_table::{demangle_symbol, load_symbols, SymbolTable};

/// Function name reported when no symbol covers an address.
pub const UNKNOWN_FUNCTION: &str = "???";

/// Symbol and line-information lookups for modules on disk.
pub trait SymbolProvider {
    /// # Errors
    /// Returns an error if the module has no readable function symbols
    fn load_symbols(&self, module_path: &str) -> Result<SymbolTable, SymbolError>;

    /// # Errors
    /// Returns an error if the module has no line information for `elf_address`
    fn line_info(&self, module_path: &str, elf_address: u64)
        -> Result<SourceLocation, SymbolError>;
}

/// [`SymbolProvider`] reading object files from the local file system
#[derive(Default)]
pub struct ObjectFileSymbols {
    debug_info: RefCell<HashMap<String, Option<Rc<DebugInfo>>>>,
}

impl ObjectFileSymbols {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn debug_info(&self, module_path: &str) -> Result<Rc<DebugInfo>, SymbolError> {
        if let Some(cached) = self.debug_info.borrow().get(module_path) {
            return cached.clone().ok_or_else(|| SymbolError::NoDebugInfo(module_path.into()));
        }
        let loaded = DebugInfo::new(module_path).map(Rc::new);
        if let Err(ref err) = loaded {
            debug!("No line information for {module_path}: {err}");
        }
        self.debug_info.borrow_mut().insert(module_path.to_string(), loaded.as_ref().ok().cloned());
        loaded
    }
}

impl SymbolProvider for ObjectFileSymbols {
    fn load_symbols(&self, module_path: &str) -> Result<SymbolTable, SymbolError> {
        symbol_table::load_symbols(module_path)
    }

    fn line_info(
        &self,
        module_path: &str,
        elf_address: u64,
    ) -> Result<SourceLocation, SymbolError> {
        self.debug_info(module_path)?.line_info(elf_address)
    }
}

/// Resolves absolute addresses of a process to [`AddressInfo`].
///
/// Symbol tables are loaded lazily, once per module path; modules without symbols
/// are remembered and not retried.
pub struct SymbolResolver<P> {
    address_space: Arc<AddressSpace>,
    provider: P,
    tables: RefCell<HashMap<String, Option<Rc<SymbolTable>>>>,
}

impl<P: SymbolProvider> SymbolResolver<P> {
    pub fn new(address_space: Arc<AddressSpace>, provider: P) -> Self {
        Self { address_space, provider, tables: RefCell::new(HashMap::new()) }
    }

    fn table(&self, module_path: &str) -> Option<Rc<SymbolTable>> {
        if let Some(cached) = self.tables.borrow().get(module_path) {
            return cached.clone();
        }
        let table = match self.provider.load_symbols(module_path) {
            Ok(table) => Some(Rc::new(table)),
            Err(err) => {
                debug!("{err}");
                None
            }
        };
        self.tables.borrow_mut().insert(module_path.to_string(), table.clone());
        table
    }

    /// Function name, offset in function and module of `absolute_address` in `pid`.
    ///
    /// Never fails: unknown modules and functions are reported as such.
    pub fn resolve(&self, pid: Pid, absolute_address: u64) -> AddressInfo {
        let Resolution::Resolved { module, offset } =
            self.address_space.resolve(pid, absolute_address)
        else {
            return AddressInfo {
                absolute_address,
                function_name: UNKNOWN_FUNCTION.to_string(),
                offset_in_function: 0,
                module_path: crate::address_space::UNKNOWN_MODULE.to_string(),
            };
        };

        let elf_address = offset.wrapping_add(module.load_bias);
        let function = self.table(&module.file_path).and_then(|table| {
            table
                .find_containing(elf_address)
                .map(|f| (f.display_name().to_string(), elf_address - f.address))
        });
        let (function_name, offset_in_function) =
            function.unwrap_or_else(|| (UNKNOWN_FUNCTION.to_string(), 0));

        AddressInfo {
            absolute_address,
            function_name,
            offset_in_function,
            module_path: module.file_path,
        }
    }

    /// Source location of `absolute_address` in `pid`.
    ///
    /// # Errors
    /// Returns an error if the address is outside every module or the module has no
    /// line information for it
    pub fn source_location(
        &self,
        pid: Pid,
        absolute_address: u64,
    ) -> Result<SourceLocation, SymbolError> {
        match self.address_space.resolve(pid, absolute_address) {
            Resolution::Resolved { module, offset } => {
                self.provider.line_info(&module.file_path, offset.wrapping_add(module.load_bias))
            }
            Resolution::Unresolved => Err(SymbolError::NoLineInfo {
                path: crate::address_space::UNKNOWN_MODULE.to_string(),
                address: absolute_address,
            }),
        }
    }

    /// Symbol table of `module`, if it could be loaded
    #[must_use]
    pub fn symbols_of(&self, module: &ModuleDescriptor) -> Option<Rc<SymbolTable>> {
        self.table(&module.file_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::FunctionInfo;
    use std::cell::Cell;

    /// In-memory provider counting how often tables are loaded
    struct FakeSymbols {
        loads: Cell<usize>,
    }

    impl SymbolProvider for FakeSymbols {
        fn load_symbols(&self, module_path: &str) -> Result<SymbolTable, SymbolError> {
            self.loads.set(self.loads.get() + 1);
            if module_path != "/bin/app" {
                return Err(SymbolError::NoSymbols(module_path.to_string()));
            }
            Ok(SymbolTable::new(
                module_path,
                vec![
                    FunctionInfo::new("_ZN3app4mainE", "app::main", module_path, 0x40_1000, 0x80),
                    FunctionInfo::new("helper", "helper", module_path, 0x40_1100, 0x20),
                ],
            ))
        }

        fn line_info(
            &self,
            module_path: &str,
            elf_address: u64,
        ) -> Result<SourceLocation, SymbolError> {
            if elf_address == 0x40_1010 {
                let file = Some("src/main.rs".to_string());
                Ok(SourceLocation { file, line: Some(12), column: None })
            } else {
                Err(SymbolError::NoLineInfo { path: module_path.to_string(), address: elf_address })
            }
        }
    }

    fn resolver() -> SymbolResolver<FakeSymbols> {
        let space = Arc::new(AddressSpace::new());
        space.update_modules(
            Pid(10),
            vec![
                ModuleDescriptor {
                    file_path: "/bin/app".into(),
                    file_size: 1,
                    build_id: String::new(),
                    load_bias: 0x40_0000,
                    address_start: 0x5555_0000_0000,
                    address_end: 0x5555_0001_0000,
                },
                ModuleDescriptor {
                    file_path: "/lib/stripped.so".into(),
                    file_size: 1,
                    build_id: String::new(),
                    load_bias: 0,
                    address_start: 0x7f00_0000_0000,
                    address_end: 0x7f00_0001_0000,
                },
            ],
        );
        SymbolResolver::new(space, FakeSymbols { loads: Cell::new(0) })
    }

    #[test]
    fn test_resolve_translates_to_elf_address() {
        let resolver = resolver();
        // ELF 0x401010 = relative 0x1010 + load bias 0x400000
        let info = resolver.resolve(Pid(10), 0x5555_0000_1010);
        assert_eq!(info.function_name, "app::main");
        assert_eq!(info.offset_in_function, 0x10);
        assert_eq!(info.module_path, "/bin/app");

        let location = resolver.source_location(Pid(10), 0x5555_0000_1010).unwrap();
        assert_eq!(location.line, Some(12));
    }

    #[test]
    fn test_unknown_module_and_function() {
        let resolver = resolver();
        let info = resolver.resolve(Pid(10), 0x10);
        assert_eq!(info.function_name, UNKNOWN_FUNCTION);
        assert_eq!(info.module_path, crate::address_space::UNKNOWN_MODULE);

        let info = resolver.resolve(Pid(10), 0x7f00_0000_0042);
        assert_eq!(info.function_name, UNKNOWN_FUNCTION);
        assert_eq!(info.module_path, "/lib/stripped.so");
        assert!(resolver.source_location(Pid(10), 0x10).is_err());
    }

    #[test]
    fn test_tables_are_loaded_once() {
        let resolver = resolver();
        for _ in 0..10 {
            resolver.resolve(Pid(10), 0x5555_0000_1100);
            resolver.resolve(Pid(10), 0x7f00_0000_0042);
        }
        assert_eq!(resolver.provider.loads.get(), 2);
    }
}
