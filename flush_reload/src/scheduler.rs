use crate::naive::FlushAndReload;
use crate::sink::RoundSink;
use crate::SpyError;
use cache_side_channel::{Cancellation, ChannelHandle, Round};
use cache_utils::clock::Clock;
use core::hint::spin_loop;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum SchedulerState {
    Running,
    Draining,
    Stopped,
}

/// Drives every handle through flush+reload, round after round.
///
/// Cancellation is only looked at between rounds, a measurement is never
/// interrupted half way.
#[derive(Debug)]
pub struct SamplingScheduler<'h, C: Clock, H: ChannelHandle> {
    channel: FlushAndReload<C>,
    handles: &'h [H],
    slot_cycles: u64,
    next_sequence: u64,
    state: SchedulerState,
}

impl<'h, C: Clock, H: ChannelHandle> SamplingScheduler<'h, C, H> {
    pub fn new(channel: FlushAndReload<C>, handles: &'h [H], slot_cycles: u64) -> Self {
        SamplingScheduler {
            channel,
            handles,
            slot_cycles,
            next_sequence: 0,
            state: SchedulerState::Running,
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    /// Sample every handle once, in order, then pad the round to the slot.
    pub fn next_round(&mut self) -> Round {
        let clock = self.channel.clock();
        let start = clock.now();
        let mut samples = Vec::with_capacity(self.handles.len());
        for handle in self.handles {
            samples.push(self.channel.sample(handle));
        }
        if self.slot_cycles > 0 {
            while clock.now().wrapping_sub(start) < self.slot_cycles {
                spin_loop();
            }
        }
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        Round { sequence, samples }
    }

    /// Run until cancelled, or until the sink fails.
    ///
    /// Returns the number of rounds handed to the sink.
    pub fn run(
        &mut self,
        sink: &mut impl RoundSink,
        cancel: &impl Cancellation,
    ) -> Result<u64, SpyError> {
        loop {
            match self.state {
                SchedulerState::Running => {
                    if cancel.is_cancelled() {
                        tracing::info!(rounds = self.next_sequence, "cancelled, draining");
                        self.state = SchedulerState::Draining;
                        continue;
                    }
                    let round = self.next_round();
                    if let Err(e) = sink.emit(round) {
                        self.state = SchedulerState::Stopped;
                        return Err(SpyError::RuntimeIo(e));
                    }
                }
                SchedulerState::Draining => {
                    let flushed = sink.finish();
                    self.state = SchedulerState::Stopped;
                    flushed?;
                }
                SchedulerState::Stopped => return Ok(self.next_sequence),
            }
        }
    }
}
