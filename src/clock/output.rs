//! Recovered reference clock output
//!
//! Divides the local master clock back down to the reference rate and drives
//! it onto a pin. Purely observational: the divider is fixed at startup and
//! nothing reads it back into the control loop.

use crate::error::{PllError, Result};
use crate::hw::ClockBlock;
use tracing::info;

/// Static master-clock divider feeding an output clock block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveredClockOutput {
    divider: u32,
}

impl RecoveredClockOutput {
    /// Divider equal to the master-clock-to-reference ratio
    ///
    /// Clock blocks divide by `2 * N`, so the ratio must be even.
    pub fn new(ratio: u32) -> Result<Self> {
        if ratio < 2 || ratio % 2 != 0 {
            return Err(PllError::invalid_config(format!(
                "recovered clock divider {} must be even and at least 2",
                ratio
            )));
        }
        Ok(Self { divider: ratio })
    }

    pub fn divider(&self) -> u32 {
        self.divider
    }

    /// Frequency seen on the output pin for a given master clock
    pub fn output_hz(&self, master_clock_hz: f64) -> f64 {
        master_clock_hz / f64::from(self.divider)
    }

    /// Program and start the clock block
    pub fn configure<B: ClockBlock>(&self, block: &mut B) {
        block.set_divide(self.divider / 2);
        block.start();
        info!("Recovered clock divider: {}", self.divider);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedClockBlock;

    #[test]
    fn test_divider_from_ratio() {
        let output = RecoveredClockOutput::new(256).unwrap();
        assert_eq!(output.divider(), 256);
        assert_eq!(output.output_hz(12_288_000.0), 48_000.0);
    }

    #[test]
    fn test_rejects_odd_or_zero_ratio() {
        assert!(RecoveredClockOutput::new(0).is_err());
        assert!(RecoveredClockOutput::new(1).is_err());
        assert!(RecoveredClockOutput::new(255).is_err());
    }

    #[test]
    fn test_configure_programs_half_divide() {
        let mut block = SimulatedClockBlock::default();
        RecoveredClockOutput::new(256).unwrap().configure(&mut block);

        assert_eq!(block.half_divide(), Some(128));
        assert!(block.is_running());
        assert_eq!(block.output_hz(12_288_000.0), Some(48_000.0));
    }
}
