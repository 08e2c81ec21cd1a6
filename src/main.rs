mod cli;
mod decoder;
mod error;
mod event;
mod mesh;
mod mmio;
mod packet;
mod pmu;
mod profiler;
mod register;
mod report;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use cli::{Action, InfoArgs, Opt, ReportArgs, RunArgs, StatArgs, TraceArgs};
use error::{CmnError, Result};
use event::Event;
use mesh::Mesh;
use pmu::{PmuContext, RunMode};
use profiler::RealClock;

fn main() {
    env_logger::init();
    let opt = Opt::parse();
    let result = match opt.action {
        Action::Info(args) => do_info(args),
        Action::Stat(args) => do_stat(args),
        Action::Trace(args) => do_trace(args),
        Action::Report(args) => do_report(args),
    };
    if let Err(err) = result {
        eprintln!("cmn-pmu: {err}");
        std::process::exit(exit_code_for(&err));
    }
}

fn exit_code_for(err: &CmnError) -> i32 {
    match err {
        CmnError::ParseError { .. } => 2,
        CmnError::NoResources(_) => 3,
        CmnError::UnsupportedTopology(_) => 4,
        CmnError::SnapshotTimeout(_) => 5,
        CmnError::DeviceNotPresent(_) | CmnError::AmbiguousDevice(_, _) | CmnError::MapError(_, _) => 6,
        CmnError::HardwareAssertion(_) => 7,
        CmnError::Io(_) => 1,
    }
}

/// Installs SIGINT/SIGTERM handlers that flip shared flags instead of
/// terminating the process, so the profiler loops can run their reset path
/// before exiting. `stop` is set by either signal; `killed` is set only by
/// SIGTERM, distinguishing a plain Ctrl-C (which still wants its capture
/// saved) from an explicit kill (which does not).
fn install_signal_flags() -> (Arc<AtomicBool>, Arc<AtomicBool>) {
    let stop = Arc::new(AtomicBool::new(false));
    let killed = Arc::new(AtomicBool::new(false));
    if let Err(err) = signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&stop)) {
        log::warn!("failed to install SIGINT handler: {err}");
    }
    if let Err(err) = signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&stop)) {
        log::warn!("failed to install SIGTERM handler: {err}");
    }
    if let Err(err) = signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&killed)) {
        log::warn!("failed to install SIGTERM handler: {err}");
    }
    (stop, killed)
}

fn compile_events(raw: &[String]) -> Result<Vec<Event>> {
    let mut events = Vec::new();
    for arg in raw {
        for tuple in event::split_event_tuples(arg)? {
            events.push(event::compile_event(&tuple)?);
        }
    }
    Ok(events)
}

fn do_info(args: InfoArgs) -> Result<()> {
    let topology = if let Some(path) = &args.load {
        let bytes = std::fs::read(path)?;
        serde_json::from_slice(&bytes).map_err(|e| CmnError::ParseError {
            token: path.display().to_string(),
            reason: e.to_string(),
        })?
    } else {
        let mesh = Mesh::discover(args.mesh, false)?;
        mesh.topology_info()?
    };
    let json = serde_json::to_string_pretty(&topology).map_err(|e| CmnError::ParseError {
        token: "topology".into(),
        reason: e.to_string(),
    })?;
    match &args.output {
        Some(path) => std::fs::write(path, json)?,
        None => println!("{json}"),
    }
    Ok(())
}

fn do_stat(args: StatArgs) -> Result<()> {
    args.run.validate()?;
    let RunArgs { events: raw_events, interval_ms, timeout_ms } = args.run;
    let mut events = compile_events(&raw_events)?;

    let mut ctx = PmuContext::new(RunMode::Stat);
    ctx.configure_events(&mut events)?;
    ctx.enable(None)?;

    let (stop, _killed) = install_signal_flags();
    let clock = RealClock::new();
    let interval = Duration::from_millis(interval_ms);
    let timeout = if timeout_ms > 0 { Some(Duration::from_millis(timeout_ms)) } else { None };

    profiler::run_stat(&mut ctx, &events, interval, timeout, &clock, &stop, |at, snapshot| {
        println!("--- t={:.3}s ---", at.as_secs_f64());
        for (name, value) in snapshot {
            println!("{name:<65}{value:>15}");
        }
    })
}

fn do_trace(args: TraceArgs) -> Result<()> {
    args.run.validate()?;
    let RunArgs { events: raw_events, interval_ms, timeout_ms } = args.run;
    let mut events = compile_events(&raw_events)?;

    let mut ctx = PmuContext::new(RunMode::Trace);
    ctx.configure_events(&mut events)?;

    if args.tracetag {
        for event in events.iter_mut().skip(1) {
            for group in &event.match_groups {
                if !group.is_empty() {
                    log::warn!("ignored match group on {}: tracetag only honors the first event", event.name);
                }
            }
            event.wp_val_masks = event.wp_val_masks.iter().map(|_| (0, 0)).collect();
            event.name = format!(
                "cmn{}-xp{}-port{}-{}-{}-tracetag",
                event.mesh_index,
                event.xp_nid,
                event.port,
                event.direction.as_str(),
                event.channel.as_str()
            );
        }
    }

    let tracetag_xp = if args.tracetag {
        events.first().map(|e| (e.mesh_index, e.xp_nid))
    } else {
        None
    };
    ctx.enable(tracetag_xp)?;

    let (stop, killed) = install_signal_flags();
    let clock = RealClock::new();
    let interval = Duration::from_millis(interval_ms);
    let timeout = if timeout_ms > 0 { Some(Duration::from_millis(timeout_ms)) } else { None };

    println!(
        "stop when recorded packet size reaches {}MB, or {}",
        args.max_size,
        if timeout_ms > 0 { format!("after {timeout_ms} msec") } else { "ctrl-c to stop immediately".to_string() }
    );

    let buffers = profiler::run_trace(
        &mut ctx,
        &events,
        interval,
        timeout,
        args.max_size,
        &clock,
        &stop,
        |_at, deltas| {
            println!("{}", "-".repeat(80));
            for (event, delta) in events.iter().zip(deltas.iter()) {
                println!("{:<65}{:>15}", &event.name[..event.name.len().min(64)], delta);
            }
        },
    )?;

    if !killed.load(Ordering::Relaxed) {
        report::save_trace(&events, &buffers, &args.output)?;
    } else {
        log::info!("killed before completion; trace log not saved");
    }
    Ok(())
}

fn do_report(args: ReportArgs) -> Result<()> {
    let records = report::load_trace(&args.input)?;
    let written = report::write_reports(&records, &args.out_dir, args.max_records, args.sample)?;
    for path in written {
        println!("wrote {}", path.display());
    }
    Ok(())
}
