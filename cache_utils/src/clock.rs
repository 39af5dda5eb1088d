//! Cycle counter and cache line eviction.
//!
//! Everything timing related goes through [`Clock`], so that the probe and the
//! scheduler above it can be driven either by the real hardware
//! ([`HardwareClock`]) or by the scripted [`StubClock`].

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq, Clone, Copy)]
pub enum UnsupportedHardwareError {
    #[error("unsupported architecture: flush+reload needs x86_64 (clflush and rdtsc)")]
    Architecture,
    #[error("cpu does not expose {0}")]
    MissingFeature(&'static str),
}

pub trait Clock {
    /// Current value of the cycle counter, monotonically non-decreasing.
    fn now(&self) -> u64;

    /// Push the cache line holding `p` out to main memory.
    ///
    /// # Safety
    ///
    /// p must point into a live mapping.
    unsafe fn evict(&self, p: *const u8);

    /// A single load from `p`.
    ///
    /// # Safety
    ///
    /// p must be valid for reads.
    unsafe fn read(&self, p: *const u8);
}

impl<C: Clock + ?Sized> Clock for &C {
    fn now(&self) -> u64 {
        (**self).now()
    }

    unsafe fn evict(&self, p: *const u8) {
        unsafe { (**self).evict(p) }
    }

    unsafe fn read(&self, p: *const u8) {
        unsafe { (**self).read(p) }
    }
}

/// rdtsc / clflush backed clock.
///
/// Can only be obtained through [`HardwareClock::detect`], which checks the
/// cpu once, before any measurement is taken.
#[derive(Debug, Clone, Copy)]
pub struct HardwareClock {
    _private: (),
}

impl HardwareClock {
    #[cfg(target_arch = "x86_64")]
    pub fn detect() -> Result<Self, UnsupportedHardwareError> {
        use raw_cpuid::CpuId;

        let cpuid = CpuId::new();
        let features = cpuid
            .get_feature_info()
            .ok_or(UnsupportedHardwareError::MissingFeature("cpuid feature leaf"))?;
        if !features.has_tsc() {
            return Err(UnsupportedHardwareError::MissingFeature("rdtsc"));
        }
        if !features.has_clflush() {
            return Err(UnsupportedHardwareError::MissingFeature("clflush"));
        }
        match cpuid.get_advanced_power_mgmt_info() {
            Some(apm) if apm.has_invariant_tsc() => {}
            _ => tracing::warn!("tsc is not invariant, latencies may drift with frequency"),
        }
        tracing::debug!(
            cache_line = features.cflush_cache_line_size() as usize * 8,
            "hardware clock ready"
        );
        Ok(HardwareClock { _private: () })
    }

    #[cfg(not(target_arch = "x86_64"))]
    pub fn detect() -> Result<Self, UnsupportedHardwareError> {
        Err(UnsupportedHardwareError::Architecture)
    }
}

#[cfg(target_arch = "x86_64")]
impl Clock for HardwareClock {
    #[inline(always)]
    fn now(&self) -> u64 {
        unsafe { crate::rdtsc_fence() }
    }

    #[inline(always)]
    unsafe fn evict(&self, p: *const u8) {
        unsafe { crate::flush(p) }
    }

    #[inline(always)]
    unsafe fn read(&self, p: *const u8) {
        unsafe { crate::maccess(p) }
    }
}

#[cfg(not(target_arch = "x86_64"))]
impl Clock for HardwareClock {
    fn now(&self) -> u64 {
        unreachable!("HardwareClock cannot be constructed on this architecture")
    }

    unsafe fn evict(&self, _p: *const u8) {}

    unsafe fn read(&self, _p: *const u8) {}
}

/// Deterministic clock for tests.
///
/// Each `evict` arms the next scripted latency, the following `read` advances
/// the counter by exactly that amount, so an evict / now / read / now sequence
/// measures the scripted value. Latencies are replayed cyclically. `now` also
/// advances the counter by `drift` cycles after every call, which lets busy
/// waits on this clock terminate.
#[derive(Debug)]
pub struct StubClock {
    tick: Cell<u64>,
    drift: u64,
    armed: Cell<u64>,
    script: RefCell<VecDeque<u64>>,
    evictions: Cell<u64>,
    reads: Cell<u64>,
}

impl StubClock {
    pub fn new(latencies: impl IntoIterator<Item = u64>) -> Self {
        StubClock {
            tick: Cell::new(0),
            drift: 0,
            armed: Cell::new(0),
            script: RefCell::new(latencies.into_iter().collect()),
            evictions: Cell::new(0),
            reads: Cell::new(0),
        }
    }

    pub fn fixed(latency: u64) -> Self {
        Self::new([latency])
    }

    pub fn with_drift(mut self, drift: u64) -> Self {
        self.drift = drift;
        self
    }

    /// Start the counter at `tick`, to exercise wraparound.
    pub fn starting_at(self, tick: u64) -> Self {
        self.tick.set(tick);
        self
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.get()
    }

    pub fn reads(&self) -> u64 {
        self.reads.get()
    }
}

impl Clock for StubClock {
    fn now(&self) -> u64 {
        let t = self.tick.get();
        self.tick.set(t.wrapping_add(self.drift));
        t
    }

    unsafe fn evict(&self, _p: *const u8) {
        let mut script = self.script.borrow_mut();
        let next = script.pop_front().unwrap_or(0);
        script.push_back(next);
        self.armed.set(next);
        self.evictions.set(self.evictions.get() + 1);
    }

    unsafe fn read(&self, _p: *const u8) {
        self.tick.set(self.tick.get().wrapping_add(self.armed.get()));
        self.armed.set(0);
        self.reads.set(self.reads.get() + 1);
    }
}
