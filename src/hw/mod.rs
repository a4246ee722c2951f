//! Hardware seams between the control core and the physical link
//!
//! The core never touches a port or register directly. Each collaborator
//! is a trait so the same loop runs against real hardware or `crate::sim`.

use crate::audio::FrameBuffer;
use crate::sync::TimestampSample;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;

/// Fractional divider register of the master-clock PLL
///
/// `apply` must reach the clock generator as a single write. Implementations
/// must never split the value into partial updates.
pub trait DividerRegister {
    /// Write one complete divider setting
    fn apply(&self, value: u32);
}

impl<D: DividerRegister + ?Sized> DividerRegister for Arc<D> {
    fn apply(&self, value: u32) {
        (**self).apply(value)
    }
}

/// Outcome of waiting for a reference-clock edge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeWait {
    /// An edge was seen and the master counter sampled at that instant
    Sampled(TimestampSample),
    /// No edge within the wait timeout
    TimedOut,
    /// The edge source is gone
    Closed,
}

/// Blocking source of reference-clock edges
pub trait EdgeSource: Send {
    /// Block until the next reference edge or until `timeout` elapses
    fn wait_edge(&mut self, timeout: Duration) -> EdgeWait;
}

impl EdgeSource for Receiver<TimestampSample> {
    fn wait_edge(&mut self, timeout: Duration) -> EdgeWait {
        match self.recv_timeout(timeout) {
            Ok(sample) => EdgeWait::Sampled(sample),
            Err(RecvTimeoutError::Timeout) => EdgeWait::TimedOut,
            Err(RecvTimeoutError::Disconnected) => EdgeWait::Closed,
        }
    }
}

/// Clock block that divides the master clock onto an output pin
pub trait ClockBlock {
    /// Program the block divider; the block toggles every `half_divide` master cycles
    fn set_divide(&mut self, half_divide: u32);
    /// Start driving the output
    fn start(&mut self);
}

/// Serial audio link, one frame per frame-clock period
///
/// Both phases are infallible: link loss surfaces through the restart check,
/// never as an error inside the frame loop.
pub trait AudioInterface {
    /// Send phase: shift one frame out
    fn transmit(&mut self, frame: &FrameBuffer);
    /// Receive phase: latch the frame that was just shifted in
    fn receive(&mut self, frame: &mut FrameBuffer);
}
