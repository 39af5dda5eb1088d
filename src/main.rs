// spy: Flush+Reload monitor for a shared binary.
//
// Rounds go to stdout, everything else to stderr.

use anyhow::Context;
use clap::Parser;
use flush_reload::{calibrate_target, start_spying, CALIBRATION_ITERATIONS};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing_subscriber::EnvFilter;

mod args;

use args::Args;

static STOP: AtomicBool = AtomicBool::new(false);

extern "C" fn request_stop(_signal: nix::libc::c_int) {
    STOP.store(true, Ordering::Relaxed);
}

// A second signal gets the default disposition back and kills us outright.
fn install_stop_handler() -> nix::Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(request_stop),
        SaFlags::SA_RESTART | SaFlags::SA_RESETHAND,
        SigSet::empty(),
    );
    for signal in [Signal::SIGINT, Signal::SIGTERM] {
        unsafe { sigaction(signal, &action) }?;
    }
    Ok(())
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run(args: Args) -> anyhow::Result<()> {
    let calibrate = args.calibrate;
    let config = args.into_config()?;

    if calibrate {
        for (label, c) in calibrate_target(&config, CALIBRATION_ITERATIONS)? {
            println!(
                "{}: hit {} miss {} threshold {}",
                label, c.hit_median, c.miss_median, c.suggested_threshold
            );
            if !c.separated() {
                tracing::warn!(%label, "hits and misses overlap, no usable threshold");
            }
        }
        return Ok(());
    }

    install_stop_handler().context("cannot install signal handlers")?;
    let summary = start_spying(&config, &STOP, std::io::stdout())
        .with_context(|| format!("spying on {}", config.target_path().display()))?;
    tracing::info!(rounds = summary.rounds, "stopped");
    Ok(())
}

fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            // --help and --version end up here too
            let _ = e.print();
            return ExitCode::FAILURE;
        }
    };
    init_logging(args.verbose);

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("[!] {e:#}");
            ExitCode::FAILURE
        }
    }
}
