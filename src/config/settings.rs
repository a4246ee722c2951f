//! Clock recovery configuration file support

use crate::audio::StreamFormat;
use crate::clock::{AppPllSettings, FractionalDividerTable, RecoveredClockOutput, TableGenerator};
use crate::error::{PllError, Result};
use crate::sync::{LockPolicy, LoopGains};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// File name looked up in the working directory
pub const LOCAL_CONFIG_FILE: &str = "swpll.toml";

/// Clock recovery configuration loaded from TOML file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClockConfig {
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,

    /// Nominal master clock frequency in Hz
    pub master_clock_hz: u32,

    /// Audio sample (frame clock) rate in Hz
    pub sample_rate: u32,

    /// Reference clock frequency in Hz
    pub reference_hz: u32,

    /// Frames between control iterations
    pub control_period: u32,

    /// Allowed master clock deviation from nominal
    pub ppm_range: u32,

    /// Audio channels per frame
    pub channels: u16,

    /// Table index of the nominal setting (None = closest to `master_clock_hz`)
    pub nominal_index: Option<usize>,

    /// Explicit fractional register values (empty = generate the table)
    pub registers: Vec<u32>,

    pub gains: LoopGains,

    pub lock: LockPolicy,

    pub app_pll: AppPllSettings,

    pub table: TableGenerator,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            master_clock_hz: 12_288_000,
            sample_rate: 48_000,
            reference_hz: 48_000,
            control_period: 512,
            ppm_range: 150,
            channels: 2,
            nominal_index: None,
            registers: Vec::new(),
            gains: LoopGains::default(),
            lock: LockPolicy::default(),
            app_pll: AppPllSettings::default(),
            table: TableGenerator::default(),
        }
    }
}

impl ClockConfig {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> std::result::Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io {
            path: path.as_ref().to_string_lossy().to_string(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.as_ref().to_string_lossy().to_string(),
            source: e,
        })
    }

    /// Load configuration from default locations
    ///
    /// Searches in order:
    /// 1. Working directory: swpll.toml
    /// 2. User config directory: swpll/config.toml
    ///
    /// Returns the file used, if any.
    pub fn load_default() -> std::result::Result<(Self, Option<PathBuf>), ConfigError> {
        for path in Self::search_paths() {
            if path.exists() {
                debug!("Loading configuration from {}", path.display());
                return Self::load(&path).map(|config| (config, Some(path)));
            }
        }

        // Return default config if no file found
        Ok((Self::default(), None))
    }

    /// Candidate configuration files, most specific first
    pub fn search_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from(LOCAL_CONFIG_FILE)];
        if let Some(dir) = dirs::config_dir() {
            paths.push(dir.join("swpll").join("config.toml"));
        }
        paths
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> std::result::Result<(), ConfigError> {
        let content = self.to_toml()?;

        // Create parent directories if needed
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| ConfigError::Io {
                    path: parent.to_string_lossy().to_string(),
                    source: e,
                })?;
            }
        }

        std::fs::write(path.as_ref(), content).map_err(|e| ConfigError::Io {
            path: path.as_ref().to_string_lossy().to_string(),
            source: e,
        })
    }

    pub fn to_toml(&self) -> std::result::Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Check the scalar stream and controller settings
    pub fn check_stream(&self) -> Result<()> {
        if self.master_clock_hz == 0 || self.sample_rate == 0 || self.reference_hz == 0 {
            return Err(PllError::invalid_config(
                "master clock, sample rate and reference frequency must be non-zero",
            ));
        }
        if self.channels == 0 {
            return Err(PllError::invalid_config("at least one channel is required"));
        }
        if self.control_period == 0 {
            return Err(PllError::invalid_config(
                "control loop period must be at least one frame",
            ));
        }
        // Successive samples are told apart by a 16-bit edge sequence number
        let edges = self.edges_per_window();
        if edges == 0 || edges > u64::from(u16::MAX) {
            return Err(PllError::invalid_config(format!(
                "control window of {} frames spans {} reference edges (need 1..=65535)",
                self.control_period, edges
            )));
        }
        self.pll_ratio()?;
        self.mclk_frame_ratio()?;
        self.gains.validate()?;
        self.lock.validate()?;
        Ok(())
    }

    /// Report every fatal misconfiguration before streaming begins
    pub fn validate(&self) -> Result<()> {
        self.check_stream()?;
        RecoveredClockOutput::new(self.pll_ratio()?)?;

        let table = self.build_table()?;
        let nominal = self.nominal_index(&table)?;
        let range = table.bounded_range(nominal, f64::from(self.ppm_range))?;
        debug!(
            "Configuration valid: {} entries, nominal {}, clamp {}..={}",
            table.len(),
            nominal,
            range.start(),
            range.end()
        );
        Ok(())
    }

    /// Reference edges expected in one control window
    pub fn edges_per_window(&self) -> u64 {
        u64::from(self.control_period) * u64::from(self.reference_hz)
            / u64::from(self.sample_rate.max(1))
    }

    /// Reference offsets, in ppm from nominal, the loop can follow
    ///
    /// Bounded by the outermost table entries inside `ppm_range`, which a
    /// coarse table may place short of the configured bound.
    pub fn lock_range_ppm(&self, table: &FractionalDividerTable) -> Result<(f64, f64)> {
        let nominal = self.nominal_index(table)?;
        let range = table.bounded_range(nominal, f64::from(self.ppm_range))?;
        let target = f64::from(self.master_clock_hz);
        Ok((
            table.ppm_from(*range.start(), target)?,
            table.ppm_from(*range.end(), target)?,
        ))
    }

    /// Master clock cycles per reference edge
    pub fn pll_ratio(&self) -> Result<u32> {
        integral_ratio("reference", self.master_clock_hz, self.reference_hz)
    }

    /// Master clock cycles per frame clock period
    pub fn mclk_frame_ratio(&self) -> Result<u32> {
        integral_ratio("sample rate", self.master_clock_hz, self.sample_rate)
    }

    pub fn stream_format(&self) -> Result<StreamFormat> {
        Ok(StreamFormat::new(
            self.sample_rate,
            self.channels,
            self.mclk_frame_ratio()?,
        ))
    }

    /// Divider table from explicit registers, or generated
    pub fn build_table(&self) -> Result<FractionalDividerTable> {
        if self.registers.is_empty() {
            FractionalDividerTable::generate(&self.app_pll, &self.table)
        } else {
            FractionalDividerTable::from_registers(&self.app_pll, &self.registers)
        }
    }

    /// Configured nominal index, or the entry closest to the master clock
    pub fn nominal_index(&self, table: &FractionalDividerTable) -> Result<usize> {
        match self.nominal_index {
            Some(index) if index < table.len() => Ok(index),
            Some(index) => Err(PllError::IndexOutOfRange {
                index,
                len: table.len(),
            }),
            None => Ok(table.closest_to(f64::from(self.master_clock_hz))),
        }
    }

    /// Generate a sample configuration file content
    pub fn sample_config() -> String {
        r#"# swpll configuration
# Software PLL clock recovery for a serial audio link

# Log level: trace, debug, info, warn, error (default: info)
log_level = "info"

# Nominal master clock in Hz (default: 12288000)
master_clock_hz = 12288000

# Audio sample rate in Hz (default: 48000)
sample_rate = 48000

# Reference (word) clock in Hz; master_clock_hz must be a multiple (default: 48000)
reference_hz = 48000

# Frames between control iterations (default: 512)
control_period = 512

# Allowed master clock deviation from nominal in ppm (default: 150)
ppm_range = 150

# Audio channels per frame, two per data line (default: 2)
channels = 2

# Index of the nominal divider entry (default: entry closest to master_clock_hz)
# nominal_index = 35

# Explicit fractional register values, ascending in frequency (empty = generate)
# Each value is (numerator - 1) << 8 | (denominator - 1)
# Example: registers = [0x1214, 0x1213]
registers = []

# Controller gains
[gains]
kp = 0.0
ki = 1.0
kii = 0.0

# Lock detection
[lock]
# Largest per-window error in master clock counts that still counts as settled
threshold = 1
# Settled iterations in a row before LOCKED
settle_iterations = 8
# Iterations pinned at a clamp bound before UNLOCKED
unlock_iterations = 8
# Entries the set point may wind up past the clamp range
windup_margin = 8

# Application PLL: out = input * (F + 1 + frac) / 2 / (R + 1) / (OD + 1) / (2 * (ACD + 1))
[app_pll]
input_hz = 24000000.0
f = 506
r = 3
od = 1
acd = 30

# Generated table: every reduced fraction n/d in [frac_min, frac_max)
[table]
max_denominator = 80
frac_min = 0.8
frac_max = 1.0
"#
        .to_string()
    }
}

fn integral_ratio(what: &str, master_clock_hz: u32, divisor_hz: u32) -> Result<u32> {
    if divisor_hz == 0 || master_clock_hz % divisor_hz != 0 {
        return Err(PllError::invalid_config(format!(
            "master clock {} Hz is not an integer multiple of the {} {} Hz",
            master_clock_hz, what, divisor_hz
        )));
    }
    Ok(master_clock_hz / divisor_hz)
}

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    /// IO error reading/writing config file
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    /// Error parsing TOML
    #[error("Failed to parse config file '{path}': {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },

    /// Error serializing config
    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}
