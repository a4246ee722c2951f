//! Application (secondary) PLL frequency model
//!
//! Used at configuration time to turn fractional register settings into the
//! master-clock frequency they produce, so the divider table can be checked
//! for monotonicity and bounded in ppm before any register is written.

use crate::error::{PllError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

const VCO_MIN_HZ: f64 = 360_000_000.0;
const VCO_MAX_HZ: f64 = 1_800_000_000.0;

/// Fractional multiplier term `numerator / denominator`
///
/// Stored in the register as `(numerator - 1) << 8 | (denominator - 1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fraction {
    pub numerator: u16,
    pub denominator: u16,
}

impl Fraction {
    /// Build a fraction usable by the register (0 < n < d <= 256)
    pub fn new(numerator: u16, denominator: u16) -> Result<Self> {
        if numerator == 0 || denominator > 256 || numerator >= denominator {
            return Err(PllError::InvalidPllSettings(format!(
                "fraction {}/{} not encodable (need 0 < n < d <= 256)",
                numerator, denominator
            )));
        }
        Ok(Self {
            numerator,
            denominator,
        })
    }

    /// Decode a fractional register value
    pub fn from_register(register: u32) -> Result<Self> {
        let f = (register >> 8) & 0xff;
        let p = register & 0xff;
        if register > 0xffff || f >= p {
            return Err(PllError::InvalidPllSettings(format!(
                "fractional register 0x{:04X} invalid (need f < p)",
                register
            )));
        }
        Self::new(f as u16 + 1, p as u16 + 1)
    }

    /// Register encoding of this fraction
    pub fn register(&self) -> u32 {
        (u32::from(self.numerator - 1) << 8) | u32::from(self.denominator - 1)
    }

    pub fn value(&self) -> f64 {
        f64::from(self.numerator) / f64::from(self.denominator)
    }
}

impl fmt::Display for Fraction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.numerator, self.denominator)
    }
}

/// Integer register fields of the application PLL
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppPllSettings {
    /// Crystal / input frequency in Hz
    pub input_hz: f64,
    /// Feedback multiplier field (F)
    pub f: u32,
    /// Input divider field (R)
    pub r: u32,
    /// Output divider field (OD)
    pub od: u32,
    /// Application clock divider field (ACD)
    pub acd: u32,
}

impl Default for AppPllSettings {
    /// 24 MHz crystal to 12.288 MHz, fractional term around 19/21
    fn default() -> Self {
        Self {
            input_hz: 24_000_000.0,
            f: 506,
            r: 3,
            od: 1,
            acd: 30,
        }
    }
}

impl AppPllSettings {
    /// Check the fields against the datasheet limits
    pub fn validate(&self) -> Result<()> {
        if !(1..=8191).contains(&self.f) {
            return Err(PllError::InvalidPllSettings(format!(
                "F = {} outside 1..=8191",
                self.f
            )));
        }
        if self.r > 63 {
            return Err(PllError::InvalidPllSettings(format!(
                "R = {} outside 0..=63",
                self.r
            )));
        }
        if self.od > 7 {
            return Err(PllError::InvalidPllSettings(format!(
                "OD = {} outside 0..=7",
                self.od
            )));
        }
        if !(self.input_hz.is_finite() && self.input_hz > 0.0) {
            return Err(PllError::InvalidPllSettings(format!(
                "input frequency {} Hz",
                self.input_hz
            )));
        }

        let vco = self.vco_hz();
        if !(VCO_MIN_HZ..=VCO_MAX_HZ).contains(&vco) {
            return Err(PllError::InvalidPllSettings(format!(
                "VCO {:.0} Hz outside {:.0}..={:.0} Hz",
                vco, VCO_MIN_HZ, VCO_MAX_HZ
            )));
        }
        Ok(())
    }

    /// Intermediate (VCO) frequency with the integer multiplier only
    pub fn vco_hz(&self) -> f64 {
        self.input_hz * (f64::from(self.f) + 1.0) / 2.0 / (f64::from(self.r) + 1.0)
    }

    /// Output frequency for a fractional term
    pub fn output_hz(&self, fraction: Fraction) -> f64 {
        self.input_hz * (f64::from(self.f) + 1.0 + fraction.value())
            / 2.0
            / (f64::from(self.r) + 1.0)
            / (f64::from(self.od) + 1.0)
            / (2.0 * (f64::from(self.acd) + 1.0))
    }
}
