#![deny(unsafe_op_in_unsafe_fn)]

//! Flush+Reload spying on a shared file mapping.
//!
//! Setup (hardware check, mapping, address resolution) either fully succeeds
//! or aborts before the first round. Then [`SamplingScheduler`] produces
//! rounds until cancelled, and [`ThreadedSink`] writes them out.

use cache_side_channel::{Cancellation, ChannelHandle, Config};
use cache_utils::clock::{Clock, HardwareClock, UnsupportedHardwareError};
use cache_utils::mmap::{MMappedFile, MappingError};
use nix::sched::{sched_setaffinity, CpuSet};
use nix::unistd::Pid;
use std::fmt::Debug;
use std::io::{self, Write};
use thiserror::Error;

pub mod calibration;
pub mod naive;
pub mod resolver;
pub mod scheduler;
pub mod sink;

pub use calibration::{calibrate, Calibration};
pub use naive::FlushAndReload;
pub use resolver::{resolve, ResolvedProbe};
pub use scheduler::{SamplingScheduler, SchedulerState};
pub use sink::{decode_machine, RoundSink, ThreadedSink};

#[derive(Debug, Error)]
pub enum SpyError {
    #[error(transparent)]
    Mapping(#[from] MappingError),
    #[error("probe {label:?} at {offset:#x} is outside the mapping ({length:#x} bytes)")]
    AddressOutOfRange {
        label: char,
        offset: u64,
        length: usize,
    },
    #[error(transparent)]
    UnsupportedHardware(#[from] UnsupportedHardwareError),
    #[error("output failed")]
    RuntimeIo(#[from] io::Error),
    #[error("cannot pin to core {core}")]
    Affinity { core: usize, source: nix::Error },
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct RunSummary {
    pub rounds: u64,
}

pub const CALIBRATION_ITERATIONS: usize = 1 << 16;

pub fn pin_to_core(core: usize) -> Result<(), SpyError> {
    let mut cpu_set = CpuSet::new();
    cpu_set
        .set(core)
        .and_then(|()| sched_setaffinity(Pid::from_raw(0), &cpu_set))
        .map_err(|source| SpyError::Affinity { core, source })?;
    tracing::info!(core, "pinned sampling thread");
    Ok(())
}

/// Spy on `config.target_path()` with the real cycle counter until `cancel`
/// fires, writing rounds to `out`.
pub fn start_spying<W: Write + Send + 'static>(
    config: &Config,
    cancel: &impl Cancellation,
    out: W,
) -> Result<RunSummary, SpyError> {
    let clock = HardwareClock::detect()?;
    spy_with_clock(config, clock, cancel, out)
}

/// [`start_spying`] with a caller provided clock.
pub fn spy_with_clock<C: Clock + Debug, W: Write + Send + 'static>(
    config: &Config,
    clock: C,
    cancel: &impl Cancellation,
    out: W,
) -> Result<RunSummary, SpyError> {
    if let Some(core) = config.core() {
        pin_to_core(core)?;
    }
    let mapping = MMappedFile::open(config.target_path())?;
    let handles = resolve(&mapping, config.probes())?;
    tracing::info!(
        probes = handles.len(),
        threshold = config.threshold_cycles(),
        slot = config.slot_cycles(),
        mode = ?config.output_mode(),
        "spying"
    );

    let mut sink = ThreadedSink::spawn(
        out,
        config.output_mode(),
        config.queue_depth(),
        config.stall_limit(),
    )?;
    let channel = FlushAndReload::from_threshold(config.threshold_cycles(), clock);
    let mut scheduler = SamplingScheduler::new(channel, &handles, config.slot_cycles());
    let rounds = scheduler.run(&mut sink, cancel)?;
    Ok(RunSummary { rounds })
}

/// Suggest a threshold for every probe of `config`, in probe order.
pub fn calibrate_target(
    config: &Config,
    iterations: usize,
) -> Result<Vec<(char, Calibration)>, SpyError> {
    let clock = HardwareClock::detect()?;
    if let Some(core) = config.core() {
        pin_to_core(core)?;
    }
    let mapping = MMappedFile::open(config.target_path())?;
    let handles = resolve(&mapping, config.probes())?;
    Ok(handles
        .iter()
        .map(|handle| (handle.label(), calibrate(&clock, handle, iterations)))
        .collect())
}
