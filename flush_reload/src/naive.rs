use cache_side_channel::{CacheStatus, ChannelHandle, Sample};
use cache_utils::clock::Clock;

/// Single address flush+reload with a fixed threshold.
#[derive(Debug)]
pub struct FlushAndReload<C: Clock> {
    threshold: u32,
    clock: C,
}

impl<C: Clock> FlushAndReload<C> {
    pub fn from_threshold(threshold: u32, clock: C) -> Self {
        FlushAndReload { threshold, clock }
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// Evict, then time one reload of the line.
    ///
    /// No I/O and no allocation in here, anything else would show up in the
    /// measured latency. Outliers are reported as measured.
    #[inline(always)]
    pub fn sample(&self, handle: &impl ChannelHandle) -> Sample {
        let addr = handle.to_const_u8_pointer();
        unsafe { self.clock.evict(addr) };
        let t0 = self.clock.now();
        unsafe { self.clock.read(addr) };
        let t1 = self.clock.now();
        let latency = t1.wrapping_sub(t0);
        Sample::new(
            handle.label(),
            latency,
            CacheStatus::classify(latency, self.threshold),
        )
    }
}
