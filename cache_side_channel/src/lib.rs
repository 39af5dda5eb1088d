#![deny(unsafe_op_in_unsafe_fn)]

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub const THRESHOLD_MAX: u32 = 2000;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum CacheStatus {
    Hit,
    Miss,
}

impl CacheStatus {
    /// Reloads at exactly the threshold count as hits.
    pub fn classify(latency: u64, threshold: u32) -> CacheStatus {
        if latency <= threshold as u64 {
            CacheStatus::Hit
        } else {
            CacheStatus::Miss
        }
    }

    pub fn is_hit(self) -> bool {
        self == CacheStatus::Hit
    }
}

impl fmt::Display for CacheStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheStatus::Hit => f.write_str("HIT"),
            CacheStatus::Miss => f.write_str("MISS"),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum ConfigError {
    #[error("tell me which addresses you want me to probe")]
    EmptyProbeSet,
    #[error("probe name {0:?} must be a single ascii letter")]
    Label(char),
    #[error("two probes share the name {0:?}")]
    DuplicateLabel(char),
    #[error("two probes share the address {0:#x}")]
    DuplicateAddress(u64),
    #[error("bad threshold {0} cycles, must be in 1..{max}", max = THRESHOLD_MAX)]
    Threshold(u32),
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Probe {
    label: char,
    raw_address: u64,
}

impl Probe {
    pub fn new(label: char, raw_address: u64) -> Result<Probe, ConfigError> {
        if !label.is_ascii_alphabetic() {
            return Err(ConfigError::Label(label));
        }
        Ok(Probe { label, raw_address })
    }

    pub fn label(&self) -> char {
        self.label
    }

    pub fn raw_address(&self) -> u64 {
        self.raw_address
    }
}

/// Ordered probes, fixed once built. The order is the emission order of every
/// round.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct ProbeSet(Arc<[Probe]>);

impl ProbeSet {
    pub fn new(probes: Vec<Probe>) -> Result<ProbeSet, ConfigError> {
        if probes.is_empty() {
            return Err(ConfigError::EmptyProbeSet);
        }
        let mut labels = HashSet::new();
        let mut addresses = HashSet::new();
        for probe in &probes {
            if !labels.insert(probe.label) {
                return Err(ConfigError::DuplicateLabel(probe.label));
            }
            if !addresses.insert(probe.raw_address) {
                return Err(ConfigError::DuplicateAddress(probe.raw_address));
            }
        }
        Ok(ProbeSet(probes.into()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Probe> {
        self.0.iter()
    }
}

impl<'a> IntoIterator for &'a ProbeSet {
    type Item = &'a Probe;
    type IntoIter = std::slice::Iter<'a, Probe>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
pub enum OutputMode {
    #[default]
    Human,
    Machine,
}

/// Everything one spying session needs, validated once and never mutated.
#[derive(Debug, Clone)]
pub struct Config {
    target_path: PathBuf,
    threshold_cycles: u32,
    probes: ProbeSet,
    output_mode: OutputMode,
    slot_cycles: u64,
    core: Option<usize>,
    queue_depth: usize,
    stall_limit: Duration,
}

pub const DEFAULT_QUEUE_DEPTH: usize = 1024;

/// How long the sampler waits on a full output queue before giving up.
pub const DEFAULT_STALL_LIMIT: Duration = Duration::from_secs(1);

impl Config {
    pub fn new(
        target_path: impl Into<PathBuf>,
        threshold_cycles: u32,
        probes: ProbeSet,
        output_mode: OutputMode,
    ) -> Result<Config, ConfigError> {
        if threshold_cycles == 0 || threshold_cycles >= THRESHOLD_MAX {
            return Err(ConfigError::Threshold(threshold_cycles));
        }
        Ok(Config {
            target_path: target_path.into(),
            threshold_cycles,
            probes,
            output_mode,
            slot_cycles: 0,
            core: None,
            queue_depth: DEFAULT_QUEUE_DEPTH,
            stall_limit: DEFAULT_STALL_LIMIT,
        })
    }

    /// Minimum duration of a round, 0 for free running.
    pub fn with_slot_cycles(mut self, slot_cycles: u64) -> Config {
        self.slot_cycles = slot_cycles;
        self
    }

    pub fn with_core(mut self, core: Option<usize>) -> Config {
        self.core = core;
        self
    }

    pub fn with_queue_depth(mut self, queue_depth: usize) -> Config {
        self.queue_depth = queue_depth.max(1);
        self
    }

    pub fn with_stall_limit(mut self, stall_limit: Duration) -> Config {
        self.stall_limit = stall_limit;
        self
    }

    pub fn target_path(&self) -> &Path {
        &self.target_path
    }

    pub fn threshold_cycles(&self) -> u32 {
        self.threshold_cycles
    }

    pub fn probes(&self) -> &ProbeSet {
        &self.probes
    }

    pub fn output_mode(&self) -> OutputMode {
        self.output_mode
    }

    pub fn slot_cycles(&self) -> u64 {
        self.slot_cycles
    }

    pub fn core(&self) -> Option<usize> {
        self.core
    }

    pub fn queue_depth(&self) -> usize {
        self.queue_depth
    }

    pub fn stall_limit(&self) -> Duration {
        self.stall_limit
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Sample {
    pub label: char,
    pub latency_cycles: u32,
    pub status: CacheStatus,
}

impl Sample {
    /// Latencies that do not fit the 4 byte wire field saturate.
    pub fn new(label: char, latency: u64, status: CacheStatus) -> Sample {
        Sample {
            label,
            latency_cycles: u32::try_from(latency).unwrap_or(u32::MAX),
            status,
        }
    }

    pub fn hit(&self) -> bool {
        self.status.is_hit()
    }
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Round {
    pub sequence: u64,
    pub samples: Vec<Sample>,
}

/// A measurable address.
///
/// # Safety
///
/// Implementors guarantee that `to_const_u8_pointer` stays valid for reads for
/// as long as the handle is alive.
pub unsafe trait ChannelHandle {
    fn label(&self) -> char;
    fn to_const_u8_pointer(&self) -> *const u8;
}

/// Polled by the sampler at round boundaries.
pub trait Cancellation {
    fn is_cancelled(&self) -> bool;
}

impl Cancellation for AtomicBool {
    fn is_cancelled(&self) -> bool {
        self.load(Ordering::Relaxed)
    }
}

impl<T: Cancellation + ?Sized> Cancellation for &T {
    fn is_cancelled(&self) -> bool {
        (**self).is_cancelled()
    }
}

impl<T: Cancellation + ?Sized> Cancellation for Arc<T> {
    fn is_cancelled(&self) -> bool {
        (**self).is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probes(spec: &[(char, u64)]) -> Result<ProbeSet, ConfigError> {
        ProbeSet::new(
            spec.iter()
                .map(|&(l, a)| Probe::new(l, a))
                .collect::<Result<_, _>>()?,
        )
    }

    #[test]
    fn classification_is_inclusive() {
        assert_eq!(CacheStatus::classify(119, 120), CacheStatus::Hit);
        assert_eq!(CacheStatus::classify(120, 120), CacheStatus::Hit);
        assert_eq!(CacheStatus::classify(121, 120), CacheStatus::Miss);
        assert_eq!(CacheStatus::classify(u64::MAX, 1999), CacheStatus::Miss);
    }

    #[test]
    fn status_tokens() {
        assert_eq!(CacheStatus::Hit.to_string(), "HIT");
        assert_eq!(CacheStatus::Miss.to_string(), "MISS");
    }

    #[test]
    fn probe_set_keeps_order() {
        let set = probes(&[('C', 0x30), ('A', 0x10), ('B', 0x20)]).unwrap();
        let labels: String = set.iter().map(|p| p.label()).collect();
        assert_eq!(labels, "CAB");
        assert_eq!(set.iter().next().map(Probe::raw_address), Some(0x30));
    }

    #[test]
    fn probe_set_rejects_duplicates() {
        assert_eq!(
            probes(&[('A', 1), ('A', 2)]),
            Err(ConfigError::DuplicateLabel('A'))
        );
        assert_eq!(
            probes(&[('A', 1), ('B', 1)]),
            Err(ConfigError::DuplicateAddress(1))
        );
        assert_eq!(probes(&[]), Err(ConfigError::EmptyProbeSet));
    }

    #[test]
    fn probe_label_must_be_a_letter() {
        assert_eq!(Probe::new('1', 4), Err(ConfigError::Label('1')));
        assert_eq!(Probe::new('é', 4), Err(ConfigError::Label('é')));
    }

    #[test]
    fn threshold_range() {
        let set = probes(&[('A', 1)]).unwrap();
        assert!(Config::new("/bin/ls", 0, set.clone(), OutputMode::Human).is_err());
        assert!(Config::new("/bin/ls", 2000, set.clone(), OutputMode::Human).is_err());
        assert!(Config::new("/bin/ls", 1, set.clone(), OutputMode::Human).is_ok());
        let c = Config::new("/bin/ls", 1999, set, OutputMode::Machine).unwrap();
        assert_eq!(c.threshold_cycles(), 1999);
        assert_eq!(c.output_mode(), OutputMode::Machine);
        assert_eq!(c.slot_cycles(), 0);
        assert_eq!(c.queue_depth(), DEFAULT_QUEUE_DEPTH);
        assert_eq!(c.stall_limit(), DEFAULT_STALL_LIMIT);
    }

    #[test]
    fn huge_latency_saturates() {
        let s = Sample::new('A', u64::MAX, CacheStatus::Miss);
        assert_eq!(s.latency_cycles, u32::MAX);
        assert!(!s.hit());
    }

    #[test]
    fn atomic_flag_cancels() {
        let flag = AtomicBool::new(false);
        assert!(!(&flag).is_cancelled());
        flag.store(true, Ordering::Relaxed);
        assert!(flag.is_cancelled());
    }
}
