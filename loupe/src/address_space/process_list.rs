//! Process enumeration from `/proc`.

use anyhow::{bail, Context, Result};
use log::debug;
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::Read;
use std::path::Path;

use super::{memory_maps, ProcessSource};
use crate::domain::{AddressSpaceError, ModuleDescriptor, Pid, ProcessDescriptor};

/// Processes seen at the last refresh, with CPU usage between the last two.
#[derive(Debug, Default)]
pub struct ProcessList {
    processes: BTreeMap<Pid, ProcessDescriptor>,
    previous_jiffies: HashMap<Pid, u64>,
    previous_total_jiffies: u64,
}

impl ProcessList {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Re-scan `/proc`. Processes that vanished are dropped, new ones are added and
    /// existing ones are updated in place.
    ///
    /// # Errors
    /// Returns an error if `/proc` or `/proc/stat` cannot be read
    pub fn refresh(&mut self) -> Result<()> {
        let stat = fs::read_to_string("/proc/stat").context("Failed to read /proc/stat")?;
        let (total_jiffies, num_cpus) = parse_total_jiffies(&stat)?;
        let elapsed = total_jiffies.saturating_sub(self.previous_total_jiffies);

        let mut seen = BTreeMap::new();
        let mut jiffies = HashMap::new();
        for entry in fs::read_dir("/proc").context("Failed to read /proc")?.flatten() {
            let Ok(pid) = entry.file_name().to_string_lossy().parse::<u32>() else {
                continue;
            };
            let pid = Pid(pid);
            // Processes can exit while we scan
            let Ok(stat_line) = fs::read_to_string(format!("/proc/{}/stat", pid.0)) else {
                continue;
            };
            let Ok(ProcStat { comm: name, jiffies: process_jiffies }) = ProcStat::parse(&stat_line)
            else {
                continue;
            };

            let mut process =
                self.processes.remove(&pid).unwrap_or_else(|| ProcessDescriptor::new(pid, ""));
            process.name = name;
            if process.full_path.is_empty() {
                fill_static_details(&mut process);
            }
            process.cpu_usage = match self.previous_jiffies.get(&pid) {
                Some(previous) => cpu_usage_percent(
                    process_jiffies.saturating_sub(*previous),
                    elapsed,
                    num_cpus,
                ),
                None => 0.0,
            };

            jiffies.insert(pid, process_jiffies);
            seen.insert(pid, process);
        }

        debug!("Process list refreshed: {} processes", seen.len());
        self.processes = seen;
        self.previous_jiffies = jiffies;
        self.previous_total_jiffies = total_jiffies;
        Ok(())
    }

    #[must_use]
    pub fn get(&self, pid: Pid) -> Option<&ProcessDescriptor> {
        self.processes.get(&pid)
    }

    pub fn processes(&self) -> impl Iterator<Item = &ProcessDescriptor> + '_ {
        self.processes.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.processes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }
}

fn fill_static_details(process: &mut ProcessDescriptor) {
    let pid = process.pid.0;
    if let Ok(exe) = fs::read_link(format!("/proc/{pid}/exe")) {
        process.full_path = exe.to_string_lossy().into_owned();
        process.is_64_bit = is_64_bit_elf(&exe).unwrap_or(true);
    }
    if let Ok(raw) = fs::read(format!("/proc/{pid}/cmdline")) {
        process.command_line = raw
            .split(|b| *b == 0)
            .filter(|arg| !arg.is_empty())
            .map(String::from_utf8_lossy)
            .collect::<Vec<_>>()
            .join(" ");
    }
}

/// ELF class byte: 1 = 32-bit, 2 = 64-bit
fn is_64_bit_elf(path: &Path) -> Option<bool> {
    let mut ident = [0u8; 5];
    File::open(path).ok()?.read_exact(&mut ident).ok()?;
    (ident[..4] == *b"\x7fELF").then_some(ident[4] == 2)
}

/// Sum of the aggregate `cpu` line and the number of `cpuN` lines.
fn parse_total_jiffies(stat: &str) -> Result<(u64, usize)> {
    let total_line = stat.lines().next().context("Empty /proc/stat")?;
    let Some(values) = total_line.strip_prefix("cpu ") else {
        bail!("Invalid /proc/stat format");
    };
    let total = values.split_whitespace().filter_map(|v| v.parse::<u64>().ok()).sum();
    let num_cpus = stat
        .lines()
        .filter_map(|line| line.strip_prefix("cpu"))
        .filter(|rest| rest.starts_with(|c: char| c.is_ascii_digit()))
        .count();
    Ok((total, num_cpus.max(1)))
}

/// Fields of `/proc/<pid>/stat` the process list needs
struct ProcStat {
    comm: String,
    /// utime + stime
    jiffies: u64,
}

impl ProcStat {
    /// Format: `pid (comm) state ...`. `comm` may itself contain parentheses, so
    /// it spans from the first `(` to the last `)`.
    fn parse(line: &str) -> Result<Self> {
        let (head, tail) = line.rsplit_once(')').context("Invalid stat format")?;
        let (_, comm) = head.split_once('(').context("Invalid stat format")?;
        // `tail` starts at field 3 (state); utime and stime are fields 14 and 15
        let mut times = tail.split_whitespace().skip(11).map(str::parse::<u64>);
        let (Some(Ok(utime)), Some(Ok(stime))) = (times.next(), times.next()) else {
            bail!("Invalid stat format");
        };
        Ok(Self { comm: comm.to_string(), jiffies: utime + stime })
    }
}

/// Percent of one core used over an interval of `total_elapsed` jiffies summed
/// over all CPUs.
#[allow(clippy::cast_precision_loss)]
fn cpu_usage_percent(process_elapsed: u64, total_elapsed: u64, num_cpus: usize) -> f64 {
    if total_elapsed == 0 {
        return 0.0;
    }
    let per_core = total_elapsed as f64 / num_cpus as f64;
    process_elapsed as f64 / per_core * 100.0
}

/// [`ProcessSource`] backed by the local `/proc` file system
#[derive(Debug, Default)]
pub struct ProcFs {
    list: ProcessList,
}

impl ProcFs {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProcessSource for ProcFs {
    fn enumerate_processes(&mut self) -> Result<Vec<ProcessDescriptor>, AddressSpaceError> {
        self.list
            .refresh()
            .map_err(|err| AddressSpaceError::Io(std::io::Error::other(format!("{err:#}"))))?;
        Ok(self.list.processes().cloned().collect())
    }

    fn enumerate_modules(&self, pid: Pid) -> Result<Vec<ModuleDescriptor>, AddressSpaceError> {
        memory_maps::read_modules(pid)
    }
}

/// How well a process answers a name query; higher is better.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum NameMatch {
    None,
    Partial,
    Exact,
}

/// Compare `query` (a command name, executable name or path) with `process`.
fn name_match(process: &ProcessDescriptor, query: &str) -> NameMatch {
    let exe_name = file_name(&process.full_path);
    let query_name = file_name(query);
    if process.full_path == query || process.name == query_name || exe_name == query_name {
        NameMatch::Exact
    } else if process.name.contains(query) || exe_name.contains(query) {
        NameMatch::Partial
    } else {
        NameMatch::None
    }
}

fn file_name(path: &str) -> &str {
    Path::new(path).file_name().and_then(|n| n.to_str()).unwrap_or(path)
}

/// Find a process by command name, executable name or executable path.
///
/// Exact matches win over substring matches.
///
/// # Errors
/// - No processes found
/// - Multiple equally good matches (ambiguous)
pub fn find_process_by_name(name: &str) -> Result<ProcessDescriptor> {
    let mut list = ProcessList::new();
    list.refresh()?;
    let own_pid = Pid(std::process::id());
    let candidates = list.processes().filter(|p| p.pid != own_pid && !p.full_path.is_empty());
    let mut matches = best_matches(candidates, name);

    match matches.len() {
        0 => bail!(
            "No process matching '{name}' found.\n\
             Check running processes with: loupe processes {name}"
        ),
        1 => Ok(matches.remove(0)),
        _ => {
            let list: Vec<String> =
                matches.iter().map(|m| format!("  {} ({})", m.pid.0, m.name)).collect();
            bail!(
                "Multiple processes match '{name}':\n{}\n\n\
                 Specify PID explicitly: loupe modules --pid <PID>",
                list.join("\n")
            )
        }
    }
}

fn best_matches<'a>(
    processes: impl Iterator<Item = &'a ProcessDescriptor>,
    query: &str,
) -> Vec<ProcessDescriptor> {
    let ranked: Vec<(NameMatch, &ProcessDescriptor)> = processes
        .map(|p| (name_match(p, query), p))
        .filter(|(rank, _)| *rank != NameMatch::None)
        .collect();
    let Some(best) = ranked.iter().map(|(rank, _)| *rank).max() else {
        return Vec::new();
    };
    ranked.into_iter().filter(|(rank, _)| *rank == best).map(|(_, p)| p.clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const STAT: &str = "1234 (my app) S 1 1234 1234 0 -1 4194304 120 0 0 0 250 75 0 0 20 0 \
                        4 0 9999 123456 789";

    #[test]
    fn test_stat_fields() {
        let stat = ProcStat::parse(STAT).unwrap();
        assert_eq!(stat.comm, "my app");
        assert_eq!(stat.jiffies, 325);
        assert!(ProcStat::parse("1 (x) S 1").is_err());
        assert!(ProcStat::parse("garbage").is_err());
    }

    #[test]
    fn test_comm_with_parens() {
        let stat = "1234 (app (v2)) S 1 1234 1234 0 -1 4194304 120 0 0 0 7 3 0 0";
        let stat = ProcStat::parse(stat).unwrap();
        assert_eq!(stat.comm, "app (v2)");
        assert_eq!(stat.jiffies, 10);
    }

    #[test]
    fn test_total_jiffies() {
        let stat = "cpu  100 0 50 800 50 0 0 0 0 0\ncpu0 50 0 25 400 25 0 0 0 0 0\n\
                    cpu1 50 0 25 400 25 0 0 0 0 0\nintr 12345\n";
        assert_eq!(parse_total_jiffies(stat).unwrap(), (1000, 2));
        assert!(parse_total_jiffies("intr 1").is_err());
    }

    #[test]
    fn test_cpu_usage_percent_is_per_core() {
        // 2 CPUs, 1000 jiffies elapsed in total: one full core is 500 jiffies
        assert!((cpu_usage_percent(500, 1000, 2) - 100.0).abs() < f64::EPSILON);
        assert!((cpu_usage_percent(125, 1000, 2) - 25.0).abs() < f64::EPSILON);
        assert!(cpu_usage_percent(10, 0, 2).abs() < f64::EPSILON);
    }

    fn process(pid: u32, name: &str, full_path: &str) -> ProcessDescriptor {
        let mut process = ProcessDescriptor::new(Pid(pid), name);
        process.full_path = full_path.to_string();
        process
    }

    #[test]
    fn test_name_match() {
        let server = process(1, "my-server", "/usr/bin/my-server");
        assert_eq!(name_match(&server, "my-server"), NameMatch::Exact);
        assert_eq!(name_match(&server, "/usr/bin/my-server"), NameMatch::Exact);
        assert_eq!(name_match(&server, "server"), NameMatch::Partial);
        assert_eq!(name_match(&server, "other"), NameMatch::None);
    }

    #[test]
    fn test_exact_match_beats_partial_matches() {
        let processes = [
            process(1, "server", "/usr/bin/server"),
            process(2, "server-helper", "/usr/bin/server-helper"),
            process(3, "gameserver", "/opt/gameserver"),
        ];
        let found = best_matches(processes.iter(), "server");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].pid, Pid(1));

        let found = best_matches(processes.iter(), "serv");
        assert_eq!(found.len(), 3);
        assert!(best_matches(processes.iter(), "client").is_empty());
    }

    #[test]
    fn test_refresh_finds_own_process() {
        let mut list = ProcessList::new();
        list.refresh().unwrap();
        list.refresh().unwrap();
        let own = list.get(Pid(std::process::id())).expect("own process listed");
        assert!(!own.full_path.is_empty());
        assert!(own.cpu_usage >= 0.0);
        assert_eq!(own.is_64_bit, cfg!(target_pointer_width = "64"));
    }
}
