//! Command-line surface (§6): `info`, `stat`, `trace`, `report`.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::error::{CmnError, Result};
use crate::report::SampleStrategy;

#[derive(Debug, Parser)]
#[command(
    name = "cmn-pmu",
    version,
    about = "Userspace PMU driver and trace collector for Arm CMN interconnects.",
    long_about = r#"
cmn-pmu discovers an Arm CMN mesh's crosspoints and debug trace blocks,
programs watchpoints from textual event expressions, and either reads
periodic counters or captures raw flits for offline decoding.

EXAMPLES:
    # Dump the topology of mesh 0 as JSON:
    cmn-pmu info --mesh 0

    # Sample a counter every 500ms for REQ traffic leaving XP 8 downward:
    cmn-pmu stat -e "cmn0/xp=8,port=1,down,channel=req/" -I 500

    # Capture three seconds of RSP flits and decode them:
    cmn-pmu trace -e "cmn0/xp=8,port=1,up,channel=rsp/" -t 3000 -o trace.bin
    cmn-pmu report -i trace.bin -o ./csv
"#
)]
pub struct Opt {
    #[command(subcommand)]
    pub action: Action,
}

#[derive(Debug, Subcommand)]
pub enum Action {
    /// Discover a mesh's topology and print it as JSON, or load a
    /// previously saved dump.
    Info(InfoArgs),
    /// Sample counters for the given events at a fixed interval.
    Stat(StatArgs),
    /// Capture raw flits for the given events into a trace log file.
    Trace(TraceArgs),
    /// Decode a saved trace log into per-event CSV files.
    Report(ReportArgs),
}

#[derive(Debug, Args)]
pub struct InfoArgs {
    /// Mesh index to probe.
    #[arg(long, default_value = "0")]
    pub mesh: u32,
    /// Load a previously saved topology JSON instead of probing hardware.
    #[arg(long)]
    pub load: Option<PathBuf>,
    /// Write the topology JSON to this file instead of stdout.
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

/// Options shared by `stat` and `trace`.
#[derive(Debug, Args)]
pub struct RunArgs {
    /// Event expression, e.g. `cmn0/xp=8,port=1,down,channel=req/`. May be
    /// repeated, and each occurrence may itself chain comma-separated
    /// `cmn<N>/.../` tuples.
    #[arg(short = 'e', long = "event", required = true)]
    pub events: Vec<String>,
    /// Sampling interval in milliseconds, 100..=100000.
    #[arg(short = 'I', long, default_value = "1000", value_parser = parse_interval)]
    pub interval_ms: u64,
    /// Overall run timeout in milliseconds; 0 means run until Ctrl-C.
    #[arg(short = 't', long, default_value = "0")]
    pub timeout_ms: u64,
}

impl RunArgs {
    pub fn validate(&self) -> Result<()> {
        if self.timeout_ms > 0 && self.timeout_ms < self.interval_ms {
            return Err(CmnError::ParseError {
                token: self.timeout_ms.to_string(),
                reason: format!("timeout_ms must be >= interval_ms ({})", self.interval_ms),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Args)]
pub struct StatArgs {
    #[command(flatten)]
    pub run: RunArgs,
}

#[derive(Debug, Args)]
pub struct TraceArgs {
    #[command(flatten)]
    pub run: RunArgs,
    /// Gate trace-packet emission for every event on the first event's
    /// match, invalidating the other events' value/mask pairs.
    #[arg(long)]
    pub tracetag: bool,
    /// Stop once captured packet data reaches this many megabytes.
    #[arg(long, default_value = "100")]
    pub max_size: u64,
    /// Trace log output file.
    #[arg(short, long, default_value = "trace.data")]
    pub output: PathBuf,
}

#[derive(Debug, Args)]
pub struct ReportArgs {
    /// Trace log file produced by `trace`.
    #[arg(short, long, default_value = "trace.data")]
    pub input: PathBuf,
    /// Directory to write per-event CSV files into.
    #[arg(short, long, default_value = "./report")]
    pub out_dir: PathBuf,
    /// Maximum records written per event.
    #[arg(short = 'n', long, default_value = "1000")]
    pub max_records: usize,
    /// Record selection strategy: header, tail, evenly, or random.
    #[arg(short = 's', long, default_value = "header", value_parser = SampleStrategy::parse)]
    pub sample: SampleStrategy,
}

fn parse_interval(s: &str) -> std::result::Result<u64, String> {
    let v: u64 = s.parse().map_err(|_| format!("{s:?} is not a number"))?;
    if !(100..=100_000).contains(&v) {
        return Err(format!("interval_ms must be in 100..=100000, got {v}"));
    }
    Ok(v)
}
