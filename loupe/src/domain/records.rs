//! Capture payload records
//!
//! Plain data carried between the protocol layer, the listener contract and the
//! in-memory capture session. All records are `serde` types so the capture file
//! codec can write them unchanged.

use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use super::types::{InternKey, Pid, Tid, TimestampNs};
use loupe_common::{HookKind, SwitchState};

/// One recorded interval: a function call or a manually instrumented zone.
///
/// Immutable once appended to the event block store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimedEvent {
    pub start: TimestampNs,
    pub end: TimestampNs,
    pub tid: Tid,
    /// Absolute address of the hooked function (or zone id for manual zones)
    pub function_id: u64,
    /// Interned call stack, when the call was sampled
    pub callstack: Option<InternKey>,
    /// Nesting depth on its thread
    pub depth: u8,
    /// Interned string attached by custom-data hooks
    pub user_data_key: Option<u64>,
}

impl TimedEvent {
    /// Duration of the interval, zero for malformed (end < start) timers
    #[must_use]
    pub fn duration(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    /// Does `[start, end]` overlap `[t_min, t_max]`?
    #[must_use]
    pub fn overlaps(&self, t_min: TimestampNs, t_max: TimestampNs) -> bool {
        self.start <= t_max && self.end >= t_min
    }
}

/// An ordered sequence of instruction addresses captured at a sampling point.
///
/// Innermost frame first.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallStack {
    pub frames: Vec<u64>,
}

impl CallStack {
    #[must_use]
    pub fn new(frames: Vec<u64>) -> Self {
        Self { frames }
    }

    #[must_use]
    pub fn depth(&self) -> usize {
        self.frames.len()
    }
}

/// A stack sample referencing an interned [`CallStack`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallstackEvent {
    pub timestamp_ns: TimestampNs,
    pub callstack_key: InternKey,
    pub tid: Tid,
}

/// One occurrence of a tracepoint referencing an interned descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TracepointEvent {
    pub tid: Tid,
    pub pid: Pid,
    pub cpu: u16,
    pub timestamp_ns: TimestampNs,
    pub tracepoint_key: InternKey,
}

/// Scheduling state of a thread over a slice of time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThreadState {
    Running,
    Runnable,
    Sleeping,
}

impl From<SwitchState> for ThreadState {
    fn from(state: SwitchState) -> Self {
        match state {
            SwitchState::Running => Self::Running,
            SwitchState::Runnable => Self::Runnable,
            SwitchState::Sleeping => Self::Sleeping,
        }
    }
}

/// A context-switch interval of one thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadStateSlice {
    pub tid: Tid,
    pub state: ThreadState,
    pub begin_ns: TimestampNs,
    pub end_ns: TimestampNs,
}

/// Symbol context of one sampled address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressInfo {
    pub absolute_address: u64,
    pub function_name: String,
    pub offset_in_function: u64,
    pub module_path: String,
}

/// A module mapped into a specific process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleDescriptor {
    pub file_path: String,
    pub file_size: u64,
    pub build_id: String,
    pub load_bias: u64,
    /// Start of the mapped range (inclusive)
    pub address_start: u64,
    /// End of the mapped range (exclusive)
    pub address_end: u64,
}

impl ModuleDescriptor {
    /// Check if an address falls within this module's `[start, end)` range
    #[must_use]
    pub fn contains(&self, address: u64) -> bool {
        address >= self.address_start && address < self.address_end
    }

    /// File name component of the module path
    #[must_use]
    pub fn name(&self) -> String {
        Path::new(&self.file_path)
            .file_name()
            .map_or_else(|| self.file_path.clone(), |n| n.to_string_lossy().into_owned())
    }
}

/// A target process and its current module set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessDescriptor {
    pub pid: Pid,
    pub name: String,
    pub full_path: String,
    pub command_line: String,
    pub is_64_bit: bool,
    /// CPU usage in percent of one core, sampled at the last refresh
    pub cpu_usage: f64,
    pub modules: Vec<ModuleDescriptor>,
}

impl ProcessDescriptor {
    #[must_use]
    pub fn new(pid: Pid, name: impl Into<String>) -> Self {
        Self {
            pid,
            name: name.into(),
            full_path: String::new(),
            command_line: String::new(),
            is_64_bit: true,
            cpu_usage: 0.0,
            modules: Vec::new(),
        }
    }

    /// Find a loaded module by its file path
    #[must_use]
    pub fn module_by_path(&self, path: &str) -> Option<&ModuleDescriptor> {
        self.modules.iter().find(|m| m.file_path == path)
    }
}

/// A function known from a module's symbol table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionInfo {
    pub name: String,
    pub pretty_name: String,
    pub module_path: String,
    /// Address as found in the object file (ELF virtual address)
    pub address: u64,
    pub size: u64,
    pub selected: bool,
    pub hook_kind: HookKind,
}

impl FunctionInfo {
    /// Create an unselected function; the hook kind is derived from its name.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        pretty_name: impl Into<String>,
        module_path: impl Into<String>,
        address: u64,
        size: u64,
    ) -> Self {
        let pretty_name = pretty_name.into();
        let hook_kind = HookKind::from_function_name(&pretty_name);
        Self {
            name: name.into(),
            pretty_name,
            module_path: module_path.into(),
            address,
            size,
            selected: false,
            hook_kind,
        }
    }

    /// Name shown to users: the demangled name when available
    #[must_use]
    pub fn display_name(&self) -> &str {
        if self.pretty_name.is_empty() {
            &self.name
        } else {
            &self.pretty_name
        }
    }

    /// Absolute address of this function inside `module` as currently mapped
    #[must_use]
    pub fn absolute_address(&self, module: &ModuleDescriptor) -> u64 {
        self.address.wrapping_add(module.address_start).wrapping_sub(module.load_bias)
    }
}

/// Index functions by their absolute address inside `modules`.
///
/// Functions whose module is not mapped are skipped with a warning.
pub fn functions_by_address<'a>(
    functions: impl IntoIterator<Item = &'a FunctionInfo>,
    modules: &[ModuleDescriptor],
) -> HashMap<u64, FunctionInfo> {
    let mut indexed = HashMap::new();
    for function in functions {
        let Some(module) = modules.iter().rev().find(|m| m.file_path == function.module_path)
        else {
            warn!(
                "Module \"{}\" of function \"{}\" is not loaded, skipping",
                function.module_path,
                function.display_name()
            );
            continue;
        };
        indexed.insert(function.absolute_address(module), function.clone());
    }
    indexed
}
