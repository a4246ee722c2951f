//! Reference-edge timestamp capture
//!
//! A free-running 16-bit counter clocked by the (disciplined) master clock is
//! sampled on every reference-clock edge. The edge wait is the only blocking
//! operation in the system, so it lives on its own thread and hands samples
//! to the frame loop through a lock-free single-value mailbox.

use crate::hw::{EdgeSource, EdgeWait};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// How long the sampler thread blocks before re-checking its stop flag
const EDGE_POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Marks a mailbox word as holding a sample not yet consumed
const FRESH: u64 = 1 << 32;

/// Counter values captured on one reference edge
///
/// Both fields are circular 16-bit counters. Differences must go through
/// [`counter_delta`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimestampSample {
    /// Master-clock counter at the edge
    pub master: u16,
    /// Reference edge sequence number
    pub reference: u16,
}

impl TimestampSample {
    pub fn new(master: u16, reference: u16) -> Self {
        Self { master, reference }
    }

    fn pack(self) -> u64 {
        FRESH | (u64::from(self.reference) << 16) | u64::from(self.master)
    }

    fn unpack(word: u64) -> Option<Self> {
        if word & FRESH == 0 {
            return None;
        }
        Some(Self {
            master: (word & 0xffff) as u16,
            reference: ((word >> 16) & 0xffff) as u16,
        })
    }
}

/// Forward distance from `previous` to `current` on a 16-bit circular counter
#[inline]
pub fn counter_delta(previous: u16, current: u16) -> u16 {
    current.wrapping_sub(previous)
}

/// Anything the frame loop can poll for the newest reference timestamp
pub trait TimestampSampler {
    /// Newest sample captured since the previous call, if any
    ///
    /// Never blocks.
    fn latest(&mut self) -> Option<TimestampSample>;
}

/// Lock-free latest-value mailbox
///
/// A single writer publishes, a single reader takes. Publishing overwrites an
/// unconsumed sample; the master and reference counters always travel in one
/// atomic word so a reader can never see a torn pair.
#[derive(Debug, Default)]
pub struct SampleSlot {
    word: AtomicU64,
}

impl SampleSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a freshly captured sample
    pub fn publish(&self, sample: TimestampSample) {
        self.word.store(sample.pack(), Ordering::Release);
    }

    /// Take the pending sample, leaving the slot empty
    pub fn take(&self) -> Option<TimestampSample> {
        TimestampSample::unpack(self.word.swap(0, Ordering::AcqRel))
    }

    /// Whether a sample is waiting
    pub fn is_fresh(&self) -> bool {
        self.word.load(Ordering::Acquire) & FRESH != 0
    }
}

impl TimestampSampler for SampleSlot {
    fn latest(&mut self) -> Option<TimestampSample> {
        self.take()
    }
}

impl TimestampSampler for Arc<SampleSlot> {
    fn latest(&mut self) -> Option<TimestampSample> {
        self.take()
    }
}

/// Sampler that owns the blocking edge wait on a dedicated thread
pub struct ThreadedSampler {
    slot: Arc<SampleSlot>,
    stop_flag: Arc<AtomicBool>,
    edges: Arc<AtomicU64>,
    handle: Option<JoinHandle<()>>,
}

impl ThreadedSampler {
    /// Start sampling edges from `source`
    pub fn spawn<E: EdgeSource + 'static>(source: E) -> Self {
        let slot = Arc::new(SampleSlot::new());
        let stop_flag = Arc::new(AtomicBool::new(false));
        let edges = Arc::new(AtomicU64::new(0));

        let thread_slot = slot.clone();
        let thread_stop = stop_flag.clone();
        let thread_edges = edges.clone();
        let handle = thread::spawn(move || {
            sampler_thread(source, thread_slot, thread_stop, thread_edges);
        });

        Self {
            slot,
            stop_flag,
            edges,
            handle: Some(handle),
        }
    }

    /// Number of edges captured so far
    pub fn edges_captured(&self) -> u64 {
        self.edges.load(Ordering::Relaxed)
    }

    /// Whether the sampler thread is still alive
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop the sampler thread and wait for it
    pub fn stop(&mut self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl TimestampSampler for ThreadedSampler {
    fn latest(&mut self) -> Option<TimestampSample> {
        self.slot.take()
    }
}

impl Drop for ThreadedSampler {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Sampler thread function
fn sampler_thread<E: EdgeSource>(
    mut source: E,
    slot: Arc<SampleSlot>,
    stop_flag: Arc<AtomicBool>,
    edges: Arc<AtomicU64>,
) {
    info!("Sampler thread started");
    let mut stalled = false;

    while !stop_flag.load(Ordering::Relaxed) {
        match source.wait_edge(EDGE_POLL_TIMEOUT) {
            EdgeWait::Sampled(sample) => {
                if stalled {
                    info!("Reference clock edges resumed");
                    stalled = false;
                }
                trace!(
                    "Edge {}: master counter {}",
                    sample.reference,
                    sample.master
                );
                slot.publish(sample);
                edges.fetch_add(1, Ordering::Relaxed);
            }
            EdgeWait::TimedOut => {
                if !stalled {
                    warn!(
                        "No reference clock edge for {}ms",
                        EDGE_POLL_TIMEOUT.as_millis()
                    );
                    stalled = true;
                }
            }
            EdgeWait::Closed => {
                debug!("Edge source closed");
                break;
            }
        }
    }

    info!("Sampler thread stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;
    use std::time::Instant;

    #[test]
    fn test_counter_delta_without_wrap() {
        assert_eq!(counter_delta(1000, 1256), 256);
        assert_eq!(counter_delta(7, 7), 0);
    }

    #[test]
    fn test_counter_delta_across_wrap() {
        assert_eq!(counter_delta(65500, 20), 56);
        assert_eq!(counter_delta(u16::MAX, 0), 1);
    }

    #[test]
    fn test_slot_take_empties() {
        let slot = SampleSlot::new();
        assert_eq!(slot.take(), None);

        slot.publish(TimestampSample::new(0xBEEF, 0x1234));
        assert!(slot.is_fresh());
        assert_eq!(slot.take(), Some(TimestampSample::new(0xBEEF, 0x1234)));
        assert_eq!(slot.take(), None);
    }

    #[test]
    fn test_slot_keeps_newest() {
        let mut slot = SampleSlot::new();
        slot.publish(TimestampSample::new(1, 1));
        slot.publish(TimestampSample::new(257, 2));
        assert_eq!(slot.latest(), Some(TimestampSample::new(257, 2)));
    }

    #[test]
    fn test_zero_sample_is_distinct_from_empty() {
        let slot = SampleSlot::new();
        slot.publish(TimestampSample::new(0, 0));
        assert_eq!(slot.take(), Some(TimestampSample::new(0, 0)));
    }

    #[test]
    fn test_threaded_sampler_publishes_edges() {
        let (tx, rx) = bounded::<TimestampSample>(16);
        let mut sampler = ThreadedSampler::spawn(rx);

        tx.send(TimestampSample::new(100, 1)).unwrap();
        tx.send(TimestampSample::new(356, 2)).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while sampler.edges_captured() < 2 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }

        assert_eq!(sampler.edges_captured(), 2);
        assert_eq!(sampler.latest(), Some(TimestampSample::new(356, 2)));
        assert_eq!(sampler.latest(), None);
    }

    #[test]
    fn test_threaded_sampler_exits_when_source_closes() {
        let (tx, rx) = bounded::<TimestampSample>(1);
        let mut sampler = ThreadedSampler::spawn(rx);
        drop(tx);

        let deadline = Instant::now() + Duration::from_secs(5);
        while sampler.is_running() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(!sampler.is_running());
        sampler.stop();
    }
}
