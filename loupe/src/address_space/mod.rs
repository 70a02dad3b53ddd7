//! # Address-Space Model
//!
//! Per-process mapping of loaded modules to the address ranges they occupy. Used to
//! resolve a raw instruction address to `(module, offset)` and from there to a
//! symbol (see [`crate::symbols::SymbolResolver`]).
//!
//! ## Concurrency
//!
//! The model is read-mostly. Each process owns an immutable [`ModuleSet`] behind an
//! `Arc`; a refresh builds the replacement set completely and then swaps the `Arc`
//! under a short write lock. Readers clone the `Arc` and release the lock before
//! searching, so they see either the old complete set or the new complete set.
//!
//! ```text
//!  reader ──read──▶ HashMap<Pid, Arc<ModuleSet>> ──clone──▶ Arc<ModuleSet> (old)
//!  writer ── build ModuleSet ──write──▶ swap ──────────────▶ Arc<ModuleSet> (new)
//! ```
//!
//! ## Overlapping ranges
//!
//! Ranges should never overlap, but can transiently while a module is being
//! replaced. The module that appears later in the set (the most recently loaded
//! one) wins.

pub mod memory_maps;
pub mod process_list;

use parking_lot::{RwLock, RwLockUpgradableReadGuard};
use std::collections::HashMap;
use std::sync::Arc;

use crate::domain::{AddressSpaceError, ModuleDescriptor, Pid, ProcessDescriptor};

pub use memory_maps::{parse_maps, read_modules, MapEntry};
pub use process_list::{find_process_by_name, ProcFs, ProcessList};

/// Module name reported for addresses outside every known module.
pub const UNKNOWN_MODULE: &str = "[unknown]";

/// OS process and module enumeration.
pub trait ProcessSource {
    /// # Errors
    /// Returns an error if the process table cannot be read
    fn enumerate_processes(&mut self) -> Result<Vec<ProcessDescriptor>, AddressSpaceError>;

    /// # Errors
    /// Returns an error if the process is gone or its mappings cannot be read
    fn enumerate_modules(&self, pid: Pid) -> Result<Vec<ModuleDescriptor>, AddressSpaceError>;
}

/// Immutable module list of one process, in load order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleSet {
    modules: Vec<ModuleDescriptor>,
}

impl ModuleSet {
    #[must_use]
    pub fn new(modules: Vec<ModuleDescriptor>) -> Self {
        Self { modules }
    }

    /// The module containing `address`; later modules shadow earlier ones
    #[must_use]
    pub fn find_by_address(&self, address: u64) -> Option<&ModuleDescriptor> {
        self.modules.iter().rev().find(|m| m.contains(address))
    }

    #[must_use]
    pub fn find_by_path(&self, path: &str) -> Option<&ModuleDescriptor> {
        self.modules.iter().rev().find(|m| m.file_path == path)
    }

    #[must_use]
    pub fn modules(&self) -> &[ModuleDescriptor] {
        &self.modules
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

/// Result of [`AddressSpace::resolve`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Resolved {
        module: ModuleDescriptor,
        /// `address - module.address_start`
        offset: u64,
    },
    Unresolved,
}

impl Resolution {
    /// Path of the resolved module, or [`UNKNOWN_MODULE`]
    #[must_use]
    pub fn module_path(&self) -> &str {
        match self {
            Resolution::Resolved { module, .. } => &module.file_path,
            Resolution::Unresolved => UNKNOWN_MODULE,
        }
    }
}

/// Module sets of every observed process.
#[derive(Debug, Default)]
pub struct AddressSpace {
    processes: RwLock<HashMap<Pid, Arc<ModuleSet>>>,
}

impl AddressSpace {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the module set of `pid` wholesale.
    pub fn update_modules(&self, pid: Pid, modules: Vec<ModuleDescriptor>) {
        let set = Arc::new(ModuleSet::new(modules));
        self.processes.write().insert(pid, set);
    }

    /// Record a newly loaded module. It shadows any overlapping older module.
    pub fn module_loaded(&self, pid: Pid, module: ModuleDescriptor) {
        let processes = self.processes.upgradable_read();
        let mut modules =
            processes.get(&pid).map(|set| set.modules.clone()).unwrap_or_default();
        modules.push(module);
        let set = Arc::new(ModuleSet::new(modules));
        RwLockUpgradableReadGuard::upgrade(processes).insert(pid, set);
    }

    /// Forget a module by path. Returns whether anything was removed.
    pub fn module_unloaded(&self, pid: Pid, file_path: &str) -> bool {
        let processes = self.processes.upgradable_read();
        let Some(current) = processes.get(&pid) else {
            return false;
        };
        let modules: Vec<ModuleDescriptor> =
            current.modules.iter().filter(|m| m.file_path != file_path).cloned().collect();
        if modules.len() == current.len() {
            return false;
        }
        let set = Arc::new(ModuleSet::new(modules));
        RwLockUpgradableReadGuard::upgrade(processes).insert(pid, set);
        true
    }

    pub fn remove_process(&self, pid: Pid) -> Option<Arc<ModuleSet>> {
        self.processes.write().remove(&pid)
    }

    /// Snapshot of the current module set of `pid`
    #[must_use]
    pub fn module_set(&self, pid: Pid) -> Option<Arc<ModuleSet>> {
        self.processes.read().get(&pid).cloned()
    }

    #[must_use]
    pub fn find_module_by_address(&self, pid: Pid, address: u64) -> Option<ModuleDescriptor> {
        self.module_set(pid)?.find_by_address(address).cloned()
    }

    /// Resolve `address` to its module and module-relative offset.
    ///
    /// Unknown processes and unmapped addresses are [`Resolution::Unresolved`],
    /// never an error.
    #[must_use]
    pub fn resolve(&self, pid: Pid, address: u64) -> Resolution {
        match self.find_module_by_address(pid, address) {
            Some(module) => {
                let offset = address - module.address_start;
                Resolution::Resolved { module, offset }
            }
            None => Resolution::Unresolved,
        }
    }

    #[must_use]
    pub fn processes(&self) -> Vec<Pid> {
        let mut pids: Vec<Pid> = self.processes.read().keys().copied().collect();
        pids.sort_unstable();
        pids
    }

    /// Refresh `pid` from the OS.
    ///
    /// # Errors
    /// Returns an error if the process modules cannot be enumerated; the previous set
    /// is kept in that case
    pub fn refresh(
        &self,
        source: &dyn ProcessSource,
        pid: Pid,
    ) -> Result<Arc<ModuleSet>, AddressSpaceError> {
        let modules = source.enumerate_modules(pid)?;
        self.update_modules(pid, modules);
        self.module_set(pid).ok_or(AddressSpaceError::ProcessNotFound(pid))
    }
}
