//! Fractional divider lookup table
//!
//! An ordered, immutable list of divider register settings. Entry frequencies
//! are strictly increasing, so moving up the index always speeds the master
//! clock up. Built once at startup, shared read-only afterwards.

use crate::clock::app_pll::{AppPllSettings, Fraction};
use crate::error::{PllError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::RangeInclusive;
use tracing::debug;

/// Slack when comparing entry deviations against a ppm bound
const PPM_TOLERANCE: f64 = 1e-6;

/// One divider setting and the master-clock frequency it produces
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DividerEntry {
    /// Opaque value written to the divider register
    pub register: u32,
    /// Resulting master-clock frequency in Hz
    pub frequency_hz: f64,
}

impl DividerEntry {
    pub fn new(register: u32, frequency_hz: f64) -> Self {
        Self {
            register,
            frequency_hz,
        }
    }
}

/// Parameters for enumerating fractional settings
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TableGenerator {
    /// Largest fractional denominator (<= 256)
    pub max_denominator: u16,
    /// Smallest fractional term included
    pub frac_min: f64,
    /// Fractional terms must stay below this
    pub frac_max: f64,
}

impl Default for TableGenerator {
    fn default() -> Self {
        Self {
            max_denominator: 80,
            frac_min: 0.8,
            frac_max: 1.0,
        }
    }
}

impl TableGenerator {
    /// All reduced fractions in `[frac_min, frac_max)`, ascending
    pub fn fractions(&self) -> Result<Vec<Fraction>> {
        if !(2..=256).contains(&self.max_denominator) {
            return Err(PllError::malformed_table(format!(
                "max denominator {} outside 2..=256",
                self.max_denominator
            )));
        }
        if !(0.0..=1.0).contains(&self.frac_min)
            || !(0.0..=1.0).contains(&self.frac_max)
            || self.frac_min >= self.frac_max
        {
            return Err(PllError::malformed_table(format!(
                "fraction range [{}, {}) empty or outside [0, 1]",
                self.frac_min, self.frac_max
            )));
        }

        let mut fractions = Vec::new();
        for d in 2..=self.max_denominator {
            for n in 1..d {
                if gcd(n, d) != 1 {
                    continue;
                }
                let value = f64::from(n) / f64::from(d);
                if value >= self.frac_min && value < self.frac_max {
                    fractions.push(Fraction::new(n, d)?);
                }
            }
        }

        // Exact ordering by cross-multiplication
        fractions.sort_by(|a, b| {
            (u32::from(a.numerator) * u32::from(b.denominator))
                .cmp(&(u32::from(b.numerator) * u32::from(a.denominator)))
        });
        Ok(fractions)
    }
}

fn gcd(mut a: u16, mut b: u16) -> u16 {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

/// Summary figures for a table
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TableStats {
    pub entries: usize,
    pub min_hz: f64,
    pub mid_hz: f64,
    pub max_hz: f64,
    pub average_step_hz: f64,
    /// Half of the full min-to-max span, in ppm
    pub ppm_span: f64,
}

impl fmt::Display for TableStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "LUT entries:       {}", self.entries)?;
        writeln!(f, "min frequency:     {:.3} Hz", self.min_hz)?;
        writeln!(f, "mid frequency:     {:.3} Hz", self.mid_hz)?;
        writeln!(f, "max frequency:     {:.3} Hz", self.max_hz)?;
        writeln!(f, "average step size: {:.6} Hz", self.average_step_hz)?;
        write!(f, "ppm range:         +-{:.3}", self.ppm_span)
    }
}

/// Ordered fractional divider settings
#[derive(Debug, Clone, PartialEq)]
pub struct FractionalDividerTable {
    entries: Vec<DividerEntry>,
}

impl FractionalDividerTable {
    /// Build from explicit entries
    ///
    /// Rejects empty tables, non-positive frequencies and any entry that does
    /// not raise the frequency over its predecessor.
    pub fn from_entries(entries: Vec<DividerEntry>) -> Result<Self> {
        if entries.is_empty() {
            return Err(PllError::malformed_table("table has no entries"));
        }

        for (i, entry) in entries.iter().enumerate() {
            if !(entry.frequency_hz.is_finite() && entry.frequency_hz > 0.0) {
                return Err(PllError::malformed_table(format!(
                    "entry {} has frequency {}",
                    i, entry.frequency_hz
                )));
            }
        }

        if let Some(i) = entries
            .windows(2)
            .position(|w| w[1].frequency_hz <= w[0].frequency_hz)
        {
            return Err(PllError::malformed_table(format!(
                "entry {} ({:.3} Hz) does not exceed entry {} ({:.3} Hz)",
                i + 1,
                entries[i + 1].frequency_hz,
                i,
                entries[i].frequency_hz
            )));
        }

        Ok(Self { entries })
    }

    /// Decode explicit fractional register values through the PLL model
    pub fn from_registers(pll: &AppPllSettings, registers: &[u32]) -> Result<Self> {
        pll.validate()?;
        let entries = registers
            .iter()
            .map(|&register| {
                let fraction = Fraction::from_register(register)?;
                Ok(DividerEntry::new(register, pll.output_hz(fraction)))
            })
            .collect::<Result<Vec<_>>>()?;
        Self::from_entries(entries)
    }

    /// Enumerate every fractional setting the generator allows
    pub fn generate(pll: &AppPllSettings, generator: &TableGenerator) -> Result<Self> {
        pll.validate()?;
        let entries: Vec<_> = generator
            .fractions()?
            .into_iter()
            .map(|fraction| DividerEntry::new(fraction.register(), pll.output_hz(fraction)))
            .collect();

        debug!(
            "Generated {} divider entries (denominator <= {}, fraction in [{}, {}))",
            entries.len(),
            generator.max_denominator,
            generator.frac_min,
            generator.frac_max
        );

        Self::from_entries(entries)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&DividerEntry> {
        self.entries.get(index)
    }

    pub fn entries(&self) -> &[DividerEntry] {
        &self.entries
    }

    /// Index of the entry carrying `register`
    pub fn index_of_register(&self, register: u32) -> Option<usize> {
        self.entries.iter().position(|e| e.register == register)
    }

    /// Index whose frequency is closest to `frequency_hz`
    pub fn closest_to(&self, frequency_hz: f64) -> usize {
        let mut best = 0;
        let mut best_distance = f64::INFINITY;
        for (i, entry) in self.entries.iter().enumerate() {
            let distance = (entry.frequency_hz - frequency_hz).abs();
            if distance < best_distance {
                best = i;
                best_distance = distance;
            }
        }
        best
    }

    /// Deviation of entry `index` from entry `reference`, in ppm
    pub fn ppm_offset(&self, index: usize, reference: usize) -> Result<f64> {
        let entry = self.checked(index)?;
        let reference = self.checked(reference)?;
        Ok((entry.frequency_hz / reference.frequency_hz - 1.0) * 1e6)
    }

    /// Deviation of entry `index` from an absolute frequency, in ppm
    pub fn ppm_from(&self, index: usize, frequency_hz: f64) -> Result<f64> {
        Ok((self.checked(index)?.frequency_hz / frequency_hz - 1.0) * 1e6)
    }

    /// Contiguous index range deviating from `nominal` by at most `ppm`
    ///
    /// Always contains `nominal` itself.
    pub fn bounded_range(&self, nominal: usize, ppm: f64) -> Result<RangeInclusive<usize>> {
        let nominal_hz = self.checked(nominal)?.frequency_hz;
        let limit = ppm.abs() + PPM_TOLERANCE;
        let within = |i: usize| {
            let offset = (self.entries[i].frequency_hz / nominal_hz - 1.0) * 1e6;
            offset.abs() <= limit
        };

        let mut low = nominal;
        while low > 0 && within(low - 1) {
            low -= 1;
        }
        let mut high = nominal;
        while high + 1 < self.entries.len() && within(high + 1) {
            high += 1;
        }
        Ok(low..=high)
    }

    /// Summary figures
    pub fn stats(&self) -> TableStats {
        let min_hz = self.entries[0].frequency_hz;
        let mid_hz = self.entries[self.entries.len() / 2].frequency_hz;
        let max_hz = self.entries[self.entries.len() - 1].frequency_hz;
        TableStats {
            entries: self.entries.len(),
            min_hz,
            mid_hz,
            max_hz,
            average_step_hz: (max_hz - min_hz) / self.entries.len() as f64,
            ppm_span: 1e6 * (max_hz / min_hz - 1.0) / 2.0,
        }
    }

    fn checked(&self, index: usize) -> Result<&DividerEntry> {
        self.entries.get(index).ok_or(PllError::IndexOutOfRange {
            index,
            len: self.entries.len(),
        })
    }
}
