//! Reference timestamp capture and software PLL clock recovery

mod pll;
mod recovery;
mod timestamp;

pub use pll::{ControlLoopState, LockPolicy, LockStatus, LoopGains, PllController};
pub use recovery::{ClockRecovery, RecoveryStats};
pub use timestamp::{
    counter_delta, SampleSlot, ThreadedSampler, TimestampSample, TimestampSampler,
};
