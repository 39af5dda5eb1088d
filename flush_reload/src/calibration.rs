use cache_side_channel::{ChannelHandle, THRESHOLD_MAX};
use cache_utils::clock::Clock;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Calibration {
    pub hit_median: u64,
    pub miss_median: u64,
    pub suggested_threshold: u32,
}

impl Calibration {
    /// Whether hits and misses are told apart at all on this address.
    pub fn separated(&self) -> bool {
        self.hit_median < self.miss_median
    }
}

fn median(samples: &mut [u64]) -> u64 {
    if samples.is_empty() {
        return 0;
    }
    samples.sort_unstable();
    samples[samples.len() / 2]
}

/// Time `iterations` reloads of a cached line, then `iterations` reloads of a
/// flushed one, and put the threshold halfway between the two medians.
pub fn calibrate<C: Clock>(
    clock: &C,
    handle: &impl ChannelHandle,
    iterations: usize,
) -> Calibration {
    let addr = handle.to_const_u8_pointer();
    let mut hits = Vec::with_capacity(iterations);
    let mut misses = Vec::with_capacity(iterations);

    unsafe { clock.read(addr) };
    for _ in 0..iterations {
        let t0 = clock.now();
        unsafe { clock.read(addr) };
        let t1 = clock.now();
        hits.push(t1.wrapping_sub(t0));
    }

    for _ in 0..iterations {
        unsafe { clock.evict(addr) };
        let t0 = clock.now();
        unsafe { clock.read(addr) };
        let t1 = clock.now();
        misses.push(t1.wrapping_sub(t0));
    }

    let hit_median = median(&mut hits);
    let miss_median = median(&mut misses);
    let midpoint = hit_median / 2 + miss_median / 2;
    let suggested_threshold = midpoint.clamp(1, THRESHOLD_MAX as u64 - 1) as u32;
    tracing::debug!(
        label = %handle.label(),
        hit_median,
        miss_median,
        suggested_threshold,
        "calibrated"
    );
    Calibration {
        hit_median,
        miss_median,
        suggested_threshold,
    }
}
