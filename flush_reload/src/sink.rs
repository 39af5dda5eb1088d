//! Round serialization and the output worker.
//!
//! Human mode, one line per round:
//!
//! ```text
//! 0 A:HIT B:MISS
//! ```
//!
//! Machine mode, one record per round, little endian:
//!
//! ```text
//! sequence        u64
//! per probe:
//!     latency     u32
//!     hit         u8    1 = hit, 0 = miss
//! ```

use cache_side_channel::{CacheStatus, OutputMode, Round, Sample};
use crossbeam_queue::ArrayQueue;
use std::io::{self, BufWriter, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;

pub const SEQUENCE_LEN: usize = 8;
pub const SAMPLE_LEN: usize = 5;

pub fn record_len(probe_count: usize) -> usize {
    SEQUENCE_LEN + SAMPLE_LEN * probe_count
}

pub fn encode_human(round: &Round, out: &mut Vec<u8>) {
    // writing into a Vec cannot fail
    let _ = write!(out, "{}", round.sequence);
    for sample in &round.samples {
        let _ = write!(out, " {}:{}", sample.label, sample.status);
    }
    out.push(b'\n');
}

pub fn encode_machine(round: &Round, out: &mut Vec<u8>) {
    out.extend_from_slice(&round.sequence.to_le_bytes());
    for sample in &round.samples {
        out.extend_from_slice(&sample.latency_cycles.to_le_bytes());
        out.push(sample.hit() as u8);
    }
}

pub fn encode(mode: OutputMode, round: &Round, out: &mut Vec<u8>) {
    match mode {
        OutputMode::Human => encode_human(round, out),
        OutputMode::Machine => encode_machine(round, out),
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("stream of {len} bytes is not a whole number of {record_len} byte records")]
    Truncated { len: usize, record_len: usize },
    #[error("invalid hit byte {byte:#x} in round {sequence}")]
    HitByte { sequence: u64, byte: u8 },
}

/// Decode a Machine mode stream. Labels are not on the wire, they come from
/// the probe order the stream was recorded with.
pub fn decode_machine(bytes: &[u8], labels: &[char]) -> Result<Vec<Round>, DecodeError> {
    let record_len = record_len(labels.len());
    if bytes.len() % record_len != 0 {
        return Err(DecodeError::Truncated {
            len: bytes.len(),
            record_len,
        });
    }
    bytes
        .chunks_exact(record_len)
        .map(|record| {
            let (sequence, mut rest) = record.split_at(SEQUENCE_LEN);
            let sequence = u64::from_le_bytes(sequence.try_into().unwrap_or_default());
            let mut samples = Vec::with_capacity(labels.len());
            for &label in labels {
                let (sample, tail) = rest.split_at(SAMPLE_LEN);
                rest = tail;
                let (latency, hit) = sample.split_at(4);
                let latency_cycles = u32::from_le_bytes(latency.try_into().unwrap_or_default());
                let status = match hit[0] {
                    1 => CacheStatus::Hit,
                    0 => CacheStatus::Miss,
                    byte => return Err(DecodeError::HitByte { sequence, byte }),
                };
                samples.push(Sample {
                    label,
                    latency_cycles,
                    status,
                });
            }
            Ok(Round { sequence, samples })
        })
        .collect()
}

/// Where finished rounds go.
pub trait RoundSink {
    /// Hand over one round. Must not wait on I/O completion.
    fn emit(&mut self, round: Round) -> io::Result<()>;

    /// Flush everything emitted so far. Called once, when draining.
    fn finish(&mut self) -> io::Result<()>;
}

struct Shared {
    queue: ArrayQueue<Round>,
    closed: AtomicBool,
    failed: AtomicBool,
}

/// Bounded queue in front of a writer thread.
///
/// The sampling thread only ever pushes into the queue; encoding and the
/// actual writes happen on the worker. A full queue makes `emit` wait for room,
/// rounds are never dropped. Waiting longer than `stall_limit` for a single
/// slot is a capacity error: the writer is abandoned and `emit` fails.
pub struct ThreadedSink {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<io::Result<u64>>>,
    stall_limit: Duration,
    stalls: u64,
}

impl ThreadedSink {
    pub fn spawn<W: Write + Send + 'static>(
        out: W,
        mode: OutputMode,
        depth: usize,
        stall_limit: Duration,
    ) -> io::Result<ThreadedSink> {
        let shared = Arc::new(Shared {
            queue: ArrayQueue::new(depth.max(1)),
            closed: AtomicBool::new(false),
            failed: AtomicBool::new(false),
        });
        let worker_shared = shared.clone();
        let worker = thread::Builder::new()
            .name("spy-writer".into())
            .spawn(move || {
                let r = write_rounds(&worker_shared, out, mode);
                if r.is_err() {
                    worker_shared.failed.store(true, Ordering::Release);
                }
                r
            })?;
        Ok(ThreadedSink {
            shared,
            worker: Some(worker),
            stall_limit,
            stalls: 0,
        })
    }

    // The worker may be stuck in a write that never returns, joining it would
    // hang too.
    fn abandon(&mut self) -> io::Error {
        self.shared.closed.store(true, Ordering::Release);
        self.worker.take();
        io::Error::new(
            io::ErrorKind::TimedOut,
            format!(
                "output backlog: {} rounds queued and no progress for {:?}",
                self.shared.queue.len(),
                self.stall_limit
            ),
        )
    }

    fn join(&mut self) -> io::Result<u64> {
        self.shared.closed.store(true, Ordering::Release);
        match self.worker.take() {
            Some(worker) => {
                worker.thread().unpark();
                worker
                    .join()
                    .unwrap_or_else(|_| Err(io::Error::other("writer thread panicked")))
            }
            None => Err(io::Error::other("output already closed")),
        }
    }

    fn failure(&mut self) -> io::Error {
        match self.join() {
            Err(e) => e,
            Ok(_) => io::Error::other("writer stopped"),
        }
    }
}

impl RoundSink for ThreadedSink {
    fn emit(&mut self, round: Round) -> io::Result<()> {
        if self.shared.failed.load(Ordering::Acquire) || self.worker.is_none() {
            return Err(self.failure());
        }
        let mut round = round;
        let mut stalled_since = None;
        loop {
            match self.shared.queue.push(round) {
                Ok(()) => break,
                Err(back) => {
                    round = back;
                    if self.shared.failed.load(Ordering::Acquire) {
                        return Err(self.failure());
                    }
                    let since = *stalled_since.get_or_insert_with(|| {
                        self.stalls += 1;
                        Instant::now()
                    });
                    if since.elapsed() > self.stall_limit {
                        return Err(self.abandon());
                    }
                    thread::yield_now();
                }
            }
        }
        if let Some(worker) = &self.worker {
            worker.thread().unpark();
        }
        Ok(())
    }

    fn finish(&mut self) -> io::Result<()> {
        let written = self.join()?;
        tracing::info!(rounds = written, stalls = self.stalls, "output drained");
        Ok(())
    }
}

impl Drop for ThreadedSink {
    fn drop(&mut self) {
        if self.worker.is_some() {
            let _ = self.join();
        }
    }
}

fn write_rounds<W: Write>(shared: &Shared, out: W, mode: OutputMode) -> io::Result<u64> {
    let mut out = BufWriter::new(out);
    let mut buffer = Vec::new();
    let mut written = 0u64;
    let mut dirty = false;
    loop {
        match shared.queue.pop() {
            Some(round) => {
                buffer.clear();
                encode(mode, &round, &mut buffer);
                out.write_all(&buffer)?;
                written += 1;
                dirty = true;
            }
            None if shared.closed.load(Ordering::Acquire) => {
                if shared.queue.is_empty() {
                    break;
                }
            }
            None => {
                if dirty {
                    out.flush()?;
                    dirty = false;
                }
                thread::park_timeout(Duration::from_millis(10));
            }
        }
    }
    out.flush()?;
    Ok(written)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::mpsc::{channel, Receiver, Sender};
    use std::sync::Mutex;

    pub(crate) const STALL: Duration = Duration::from_secs(10);

    /// Cloneable in-memory output.
    #[derive(Clone, Default)]
    pub(crate) struct SharedBuffer(pub Arc<Mutex<Vec<u8>>>);

    impl SharedBuffer {
        pub fn contents(&self) -> Vec<u8> {
            self.0.lock().unwrap().clone()
        }
    }

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Blocks every write until the paired sender is dropped.
    pub(crate) struct Stuck(pub Receiver<()>);

    impl Stuck {
        pub fn new() -> (Sender<()>, Stuck) {
            let (release, wait) = channel();
            (release, Stuck(wait))
        }
    }

    impl Write for Stuck {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            while self.0.recv().is_ok() {}
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            while self.0.recv().is_ok() {}
            Ok(())
        }
    }

    /// Fails every write after the first `budget` bytes.
    pub(crate) struct BrokenPipe {
        pub budget: usize,
    }

    impl Write for BrokenPipe {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.budget == 0 {
                return Err(io::Error::from(io::ErrorKind::BrokenPipe));
            }
            let n = buf.len().min(self.budget);
            self.budget -= n;
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn sample(label: char, latency: u64, threshold: u32) -> Sample {
        Sample::new(label, latency, CacheStatus::classify(latency, threshold))
    }

    fn rounds() -> Vec<Round> {
        vec![
            Round {
                sequence: 0,
                samples: vec![sample('A', 80, 120), sample('B', 300, 120)],
            },
            Round {
                sequence: 1,
                samples: vec![sample('A', 120, 120), sample('B', 121, 120)],
            },
            Round {
                sequence: 2,
                samples: vec![sample('A', u64::MAX, 120), sample('B', 0, 120)],
            },
        ]
    }

    fn human(rounds: &[Round]) -> String {
        let mut out = Vec::new();
        rounds.iter().for_each(|r| encode_human(r, &mut out));
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn human_lines() {
        assert_eq!(human(&rounds()), "0 A:HIT B:MISS\n1 A:HIT B:MISS\n2 A:MISS B:HIT\n");
    }

    #[test]
    fn machine_layout() {
        let mut out = Vec::new();
        encode_machine(&rounds()[0], &mut out);
        assert_eq!(out.len(), record_len(2));
        assert_eq!(
            out,
            [
                0, 0, 0, 0, 0, 0, 0, 0, // sequence
                80, 0, 0, 0, 1, // A
                44, 1, 0, 0, 0, // B
            ]
        );
    }

    #[test]
    fn machine_stream_decodes_to_the_human_rendering() {
        let rounds = rounds();
        let mut stream = Vec::new();
        rounds.iter().for_each(|r| encode_machine(r, &mut stream));
        let decoded = decode_machine(&stream, &['A', 'B']).unwrap();
        assert_eq!(decoded, rounds);
        assert_eq!(human(&decoded), human(&rounds));
    }

    #[test]
    fn truncated_stream_is_rejected() {
        let mut stream = Vec::new();
        encode_machine(&rounds()[0], &mut stream);
        stream.pop();
        assert_eq!(
            decode_machine(&stream, &['A', 'B']),
            Err(DecodeError::Truncated {
                len: 17,
                record_len: 18
            })
        );
    }

    #[test]
    fn bad_hit_byte_is_rejected() {
        let mut stream = Vec::new();
        encode_machine(&rounds()[0], &mut stream);
        stream[12] = 7;
        assert_eq!(
            decode_machine(&stream, &['A', 'B']),
            Err(DecodeError::HitByte {
                sequence: 0,
                byte: 7
            })
        );
    }

    #[test]
    fn threaded_sink_writes_everything_in_order() {
        let buffer = SharedBuffer::default();
        let mut sink = ThreadedSink::spawn(buffer.clone(), OutputMode::Human, 2, STALL).unwrap();
        let mut expected = String::new();
        for sequence in 0..500 {
            let round = Round {
                sequence,
                samples: vec![sample('A', sequence, 250)],
            };
            expected.push_str(&human(std::slice::from_ref(&round)));
            sink.emit(round).unwrap();
        }
        sink.finish().unwrap();
        assert_eq!(String::from_utf8(buffer.contents()).unwrap(), expected);
    }

    #[test]
    fn write_failure_surfaces_on_emit_or_finish() {
        let mut sink =
            ThreadedSink::spawn(BrokenPipe { budget: 0 }, OutputMode::Machine, 4, STALL)
                .unwrap();
        let mut failed = false;
        for sequence in 0..100_000 {
            let round = Round {
                sequence,
                samples: vec![sample('A', 10, 120)],
            };
            if sink.emit(round).is_err() {
                failed = true;
                break;
            }
        }
        if !failed {
            failed = sink.finish().is_err();
        }
        assert!(failed);
    }

    #[test]
    fn emit_after_finish_fails() {
        let mut sink = ThreadedSink::spawn(io::sink(), OutputMode::Human, 4, STALL).unwrap();
        sink.finish().unwrap();
        assert!(sink.emit(rounds().remove(0)).is_err());
    }

    #[test]
    fn stuck_writer_is_a_capacity_error() {
        let (release, stuck) = Stuck::new();
        let mut sink =
            ThreadedSink::spawn(stuck, OutputMode::Human, 2, Duration::from_millis(50)).unwrap();
        let started = Instant::now();
        let err = (0..1_000_000u64)
            .map(|sequence| {
                sink.emit(Round {
                    sequence,
                    samples: vec![sample('A', 10, 120)],
                })
            })
            .find_map(Result::err)
            .unwrap();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(sink.emit(rounds().remove(0)).is_err());
        drop(sink);
        drop(release);
    }
}
