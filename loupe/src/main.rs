//! # loupe - Main Entry Point
//!
//! Subcommands:
//! - **replay**: load a capture file on a background thread and print a summary;
//!   Ctrl-C cancels the load cooperatively
//! - **processes** / **modules**: inspect the address space of running processes
//! - **symbolize**: resolve absolute addresses of a running process

// Report formatting converts durations for display
#![allow(clippy::cast_precision_loss)]

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use log::info;
use std::path::Path;
use std::sync::Arc;

use loupe::address_space::{find_process_by_name, read_modules, AddressSpace, ProcFs, ProcessList};
use loupe::cli::{Args, Command};
use loupe::domain::{ns_to_ms, Pid};
use loupe::protocol::{spawn_load, CancellationToken, LoadState};
use loupe::session::{CaptureSession, CaptureSummary, SessionOutcome};
use loupe::symbols::{ObjectFileSymbols, SymbolResolver};

// Exit codes
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_USAGE: i32 = 2;
const EXIT_NOPERM: i32 = 77;

fn main() {
    env_logger::init();
    std::process::exit(match run() {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            let code = exit_code_for(&e);
            eprintln!("error: {e:#}");
            code
        }
    });
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    let msg = format!("{err:#}").to_lowercase();
    if msg.contains("permission denied") {
        EXIT_NOPERM
    } else if msg.contains("missing required argument") {
        EXIT_USAGE
    } else {
        EXIT_ERROR
    }
}

#[tokio::main]
async fn run() -> Result<()> {
    // Usage errors exit with code 2 from here
    let args = Args::parse();
    match args.command {
        Command::Replay { file, json, top } => replay(&file, json, top, args.quiet).await,
        Command::Processes { filter } => list_processes(filter.as_deref()),
        Command::Modules { process, pid } => list_modules(process.as_deref(), pid),
        Command::Symbolize { pid, addresses } => symbolize(Pid(pid), &addresses),
    }
}

async fn replay(file: &Path, json: bool, top: usize, quiet: bool) -> Result<()> {
    let cancel = CancellationToken::new();
    let handle = spawn_load(file.to_path_buf(), CaptureSession::for_replay(), cancel.clone())
        .context("Failed to start capture loader")?;
    let mut join = tokio::task::spawn_blocking(move || handle.join());

    // Setup Ctrl+C handler
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let joined = tokio::select! {
        joined = &mut join => joined,
        _ = &mut ctrl_c => {
            info!("Interrupted, cancelling load");
            cancel.cancel();
            (&mut join).await
        }
    };
    let (session, state) = joined
        .context("Capture loader task failed")?
        .map_err(|_| anyhow!("Capture loader panicked"))?;

    match (state, session.outcome()) {
        (LoadState::Failed, Some(SessionOutcome::Failed(message))) => {
            return Err(anyhow!("{message}"));
        }
        (LoadState::Failed, _) => return Err(anyhow!("Failed to load {}", file.display())),
        (LoadState::Cancelled, _) if !quiet => eprintln!("load cancelled, partial capture"),
        _ => {}
    }

    let summary = session.summary(top);
    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&summary, quiet);
    }
    Ok(())
}

fn print_summary(summary: &CaptureSummary, quiet: bool) {
    if !quiet {
        println!(
            "process: {} (pid {})",
            summary.process.as_deref().unwrap_or("?"),
            summary.pid.map_or_else(|| "?".to_string(), |pid| pid.to_string())
        );
        println!("modules: {}", summary.modules);
        println!("threads: {}", summary.threads);
        println!(
            "timers: {}, callstacks: {} unique / {} samples, tracepoints: {}, slices: {}",
            summary.timers,
            summary.unique_callstacks,
            summary.callstack_events,
            summary.tracepoint_events,
            summary.thread_state_slices
        );
        println!();
    }

    if summary.top_functions.is_empty() {
        println!("no timers recorded");
        return;
    }
    println!(
        "{:<40} {:>8} {:>11} {:>9} {:>9} {:>9} {:>6}",
        "FUNCTION", "CALLS", "TOTAL", "AVG", "MIN", "MAX", "%"
    );
    for hotspot in &summary.top_functions {
        println!(
            "{:<40} {:>8} {:>9.2}ms {:>7.3}ms {:>7.3}ms {:>7.3}ms {:>5.1}%",
            truncate(&hotspot.name, 40),
            hotspot.count,
            ns_to_ms(hotspot.total_ns),
            ns_to_ms(hotspot.average_ns),
            ns_to_ms(hotspot.min_ns),
            ns_to_ms(hotspot.max_ns),
            hotspot.percentage
        );
    }
}

fn truncate(name: &str, width: usize) -> String {
    if name.chars().count() <= width {
        return name.to_string();
    }
    let mut short: String = name.chars().take(width - 1).collect();
    short.push('…');
    short
}

fn list_processes(filter: Option<&str>) -> Result<()> {
    let mut list = ProcessList::new();
    list.refresh()?;
    // CPU usage needs two samples
    std::thread::sleep(std::time::Duration::from_millis(200));
    list.refresh()?;

    println!("{:>8} {:>6} {:>4}  {:<24} PATH", "PID", "CPU%", "BITS", "NAME");
    for process in list
        .processes()
        .filter(|p| filter.map_or(true, |f| p.name.contains(f) || p.full_path.contains(f)))
    {
        println!(
            "{:>8} {:>6.1} {:>4}  {:<24} {}",
            process.pid.0,
            process.cpu_usage,
            if process.is_64_bit { 64 } else { 32 },
            truncate(&process.name, 24),
            process.full_path
        );
    }
    Ok(())
}

fn list_modules(process: Option<&str>, pid: Option<u32>) -> Result<()> {
    let pid = match (pid, process) {
        (Some(pid), _) => Pid(pid),
        (None, Some(name)) => find_process_by_name(name)?.pid,
        (None, None) => return Err(anyhow!("Missing required argument: PROCESS or --pid")),
    };
    let modules = read_modules(pid).with_context(|| format!("Failed to read modules of {pid}"))?;

    println!("{:<18} {:<18} {:>10}  {:<40} PATH", "START", "END", "SIZE", "BUILD ID");
    for module in &modules {
        println!(
            "0x{:016x} 0x{:016x} {:>10}  {:<40} {}",
            module.address_start,
            module.address_end,
            module.file_size,
            module.build_id,
            module.file_path
        );
    }
    Ok(())
}

fn symbolize(pid: Pid, addresses: &[u64]) -> Result<()> {
    let address_space = Arc::new(AddressSpace::new());
    address_space
        .refresh(&ProcFs::new(), pid)
        .with_context(|| format!("Failed to read modules of {pid}"))?;
    let resolver = SymbolResolver::new(Arc::clone(&address_space), ObjectFileSymbols::new());

    for &address in addresses {
        let info = resolver.resolve(pid, address);
        let location = resolver
            .source_location(pid, address)
            .map_or_else(|_| String::new(), |loc| format!("  at {loc}"));
        println!(
            "0x{address:016x} {}+0x{:x} ({}){location}",
            info.function_name, info.offset_in_function, info.module_path
        );
    }
    Ok(())
}
