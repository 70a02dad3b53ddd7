//! CLI argument definitions

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "loupe",
    version,
    about = "Inspect profiler captures and the address space of running processes",
    after_help = "\
EXAMPLES:
    loupe replay game_2024_03_09_07_05_01.loupe     Summarize a saved capture
    loupe replay capture.loupe --json               Same, as JSON
    loupe processes game                            List processes matching \"game\"
    loupe modules game                              Modules of the process named game
    loupe symbolize --pid 1234 0x55d0c0a01234       Resolve an address"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

#[derive(Subcommand)]
pub enum Command {
    /// Load a capture file and print a summary
    Replay {
        /// Capture file to load
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Print the summary as JSON
        #[arg(long)]
        json: bool,

        /// Number of functions in the report
        #[arg(long, default_value = "10")]
        top: usize,
    },

    /// List running processes with their CPU usage
    Processes {
        /// Only show processes whose name contains this string
        #[arg(value_name = "FILTER")]
        filter: Option<String>,
    },

    /// List the modules loaded by a process
    Modules {
        /// Process name (PID auto-detected)
        #[arg(value_name = "PROCESS", required_unless_present = "pid")]
        process: Option<String>,

        /// Process ID
        #[arg(short, long, conflicts_with = "process")]
        pid: Option<u32>,
    },

    /// Resolve absolute addresses of a process to module, function and source line
    Symbolize {
        /// Process ID
        #[arg(short, long)]
        pid: u32,

        /// Addresses, hex with 0x prefix or decimal
        #[arg(value_name = "ADDR", required = true, value_parser = parse_address)]
        addresses: Vec<u64>,
    },
}

fn parse_address(text: &str) -> Result<u64, String> {
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => text.parse(),
    };
    parsed.map_err(|err| format!("invalid address '{text}': {err}"))
}
