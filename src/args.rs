use cache_side_channel::{
    Config, ConfigError, OutputMode, Probe, ProbeSet, DEFAULT_QUEUE_DEPTH, DEFAULT_STALL_LIMIT,
};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

/// Watch which addresses of a binary other processes are executing, with
/// Flush+Reload.
#[derive(Debug, Parser)]
#[command(name = "spy", version)]
pub struct Args {
    /// Path to ELF binary to spy on.
    #[arg(short, long, value_name = "PATH")]
    pub elf: PathBuf,

    /// Max. L3 latency, reloads at or below it are hits.
    #[arg(short, long, value_name = "CYCLES", default_value_t = 120)]
    pub threshold: u32,

    /// Name character : offset in the file, e.g. A:0x4003.
    #[arg(short, long = "probe", value_name = "N:0xDEADBEEF", value_parser = parse_probe, required = true)]
    pub probes: Vec<Probe>,

    /// Binary output.
    #[arg(short, long)]
    pub machine_readable: bool,

    /// Minimum length of a round, 0 runs rounds back to back.
    #[arg(short, long, value_name = "CYCLES", default_value_t = 0)]
    pub slot: u64,

    /// Pin the sampling thread to this cpu.
    #[arg(short, long, value_name = "CPU")]
    pub core: Option<usize>,

    /// Rounds buffered in front of the output.
    #[arg(long, value_name = "ROUNDS", default_value_t = DEFAULT_QUEUE_DEPTH)]
    pub queue_depth: usize,

    /// Give up when the output accepts nothing for this long.
    #[arg(long, value_name = "MS", default_value_t = DEFAULT_STALL_LIMIT.as_millis() as u64)]
    pub stall_limit_ms: u64,

    /// Measure hit and miss latencies of each probe and suggest a threshold.
    #[arg(long)]
    pub calibrate: bool,

    /// More diagnostics on stderr (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

fn parse_address(s: &str) -> Option<u64> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.ok().filter(|&address| address > 0)
}

pub fn parse_probe(s: &str) -> Result<Probe, String> {
    let mut chars = s.chars();
    let (label, rest) = match (chars.next(), chars.next()) {
        (Some(label), Some(':')) => (label, chars.as_str()),
        _ => return Err("give the probe a 1-character name like A:0xDEADBEEF".into()),
    };
    let address = parse_address(rest).ok_or_else(|| format!("bad probe address {rest:?}"))?;
    Probe::new(label, address).map_err(|e| e.to_string())
}

impl Args {
    pub fn output_mode(&self) -> OutputMode {
        if self.machine_readable {
            OutputMode::Machine
        } else {
            OutputMode::Human
        }
    }

    pub fn into_config(self) -> Result<Config, ConfigError> {
        let mode = self.output_mode();
        let probes = ProbeSet::new(self.probes)?;
        Ok(Config::new(self.elf, self.threshold, probes, mode)?
            .with_slot_cycles(self.slot)
            .with_core(self.core)
            .with_queue_depth(self.queue_depth)
            .with_stall_limit(Duration::from_millis(self.stall_limit_ms)))
    }
}
