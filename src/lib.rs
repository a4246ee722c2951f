//! swpll - Software PLL clock recovery
//!
//! Recovers a phase-locked master clock for a serial audio link from an
//! external word clock, while the link keeps exchanging frames under a
//! per-frame deadline.

pub mod audio;
pub mod clock;
pub mod config;
pub mod error;
pub mod hw;
pub mod sim;
pub mod sync;

pub use error::{PllError, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
