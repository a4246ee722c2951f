//! Software PLL controller
//!
//! Each control iteration compares how far the master-clock counter actually
//! advanced between two reference timestamps with how far it should have
//! advanced at the nominal ratio. The difference drives a fixed-point PI(+I²)
//! loop whose output is an index into the fractional divider table.
//!
//! Nothing in here can fail once the loop is running: missing samples skip
//! the iteration, out-of-range requests are clamped before the register
//! write, and both conditions only ever show up in [`LockStatus`].

use crate::clock::FractionalDividerTable;
use crate::error::{PllError, Result};
use crate::hw::DividerRegister;
use crate::sync::timestamp::{counter_delta, TimestampSample};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::RangeInclusive;
use std::sync::Arc;
use tracing::{debug, info, trace};

/// Fractional bits of the fixed-point gains and set point
const Q: u32 = 16;

/// Largest gain representable in signed Q15.16
const MAX_GAIN: f64 = 32767.0;

/// How well the master clock tracks the reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockStatus {
    /// Master clock held at the slow end of the allowed range
    UnlockedLow,
    /// Phase error small and stable
    Locked,
    /// Master clock held at the fast end of the allowed range
    UnlockedHigh,
}

impl LockStatus {
    /// Diagnostic message for this status
    pub fn message(&self) -> &'static str {
        match self {
            LockStatus::UnlockedLow => "UNLOCKED LOW",
            LockStatus::Locked => "LOCKED",
            LockStatus::UnlockedHigh => "UNLOCKED HIGH",
        }
    }

    /// Signed code: -1 low, 0 locked, 1 high
    pub fn code(&self) -> i8 {
        match self {
            LockStatus::UnlockedLow => -1,
            LockStatus::Locked => 0,
            LockStatus::UnlockedHigh => 1,
        }
    }
}

impl fmt::Display for LockStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// Controller gains, as decimals
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopGains {
    /// Proportional gain on the per-window count error
    pub kp: f64,
    /// Integral gain (table entries per count of error)
    pub ki: f64,
    /// Double-integral gain
    pub kii: f64,
}

impl Default for LoopGains {
    fn default() -> Self {
        Self {
            kp: 0.0,
            ki: 1.0,
            kii: 0.0,
        }
    }
}

impl LoopGains {
    pub fn validate(&self) -> Result<()> {
        self.to_fixed().map(|_| ())
    }

    /// (Kp, Ki, Kii) in Q16.16
    fn to_fixed(&self) -> Result<(i64, i64, i64)> {
        let kp = to_q16("kp", self.kp)?;
        let ki = to_q16("ki", self.ki)?;
        let kii = to_q16("kii", self.kii)?;
        if kp == 0 && ki == 0 && kii == 0 {
            return Err(PllError::invalid_config("all controller gains are zero"));
        }
        Ok((kp, ki, kii))
    }
}

/// Lock classification and windup limits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockPolicy {
    /// Largest per-window error (counts) that still counts as settled
    pub threshold: u16,
    /// Consecutive settled iterations before reporting LOCKED
    pub settle_iterations: u32,
    /// Consecutive iterations pinned at a bound before reporting UNLOCKED
    pub unlock_iterations: u32,
    /// How many entries past the clamp range the set point may wind up
    pub windup_margin: u32,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            threshold: 1,
            settle_iterations: 8,
            unlock_iterations: 8,
            windup_margin: 8,
        }
    }
}

impl LockPolicy {
    pub fn validate(&self) -> Result<()> {
        if self.settle_iterations == 0 || self.unlock_iterations == 0 {
            return Err(PllError::invalid_config(
                "lock settle and unlock windows must be at least one iteration",
            ));
        }
        Ok(())
    }
}

/// Everything the controller carries from one iteration to the next
///
/// Owned by the streaming session. Only the frame countdown changes between
/// control iterations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlLoopState {
    current_index: usize,
    nominal_index: usize,
    index_range: RangeInclusive<usize>,
    ppm_range: u32,
    /// Unclamped table position, Q16
    set_point: i64,
    /// Running sum of errors for the double integrator
    error_accum: i64,
    last_error: i32,
    previous: Option<TimestampSample>,
    control_period: u32,
    frames_until_control: u32,
    lock_status: LockStatus,
    settle_run: u32,
    pinned_low_run: u32,
    pinned_high_run: u32,
}

impl ControlLoopState {
    /// Index currently applied to the divider
    pub fn current_index(&self) -> usize {
        self.current_index
    }

    pub fn nominal_index(&self) -> usize {
        self.nominal_index
    }

    /// Indices the controller may apply
    pub fn index_range(&self) -> RangeInclusive<usize> {
        self.index_range.clone()
    }

    pub fn ppm_range(&self) -> u32 {
        self.ppm_range
    }

    pub fn lock_status(&self) -> LockStatus {
        self.lock_status
    }

    /// Timestamp the next iteration measures against
    pub fn previous_sample(&self) -> Option<TimestampSample> {
        self.previous
    }

    /// Error seen by the most recent iteration, in master-clock counts
    pub fn last_error(&self) -> i32 {
        self.last_error
    }

    /// Unclamped set point in table entries
    pub fn set_point(&self) -> f64 {
        self.set_point as f64 / f64::from(1u32 << Q)
    }

    pub fn control_period(&self) -> u32 {
        self.control_period
    }

    pub fn frames_until_control(&self) -> u32 {
        self.frames_until_control
    }

    /// Count one elapsed frame; true when a control iteration is due
    pub fn count_frame(&mut self) -> bool {
        self.frames_until_control = self.frames_until_control.saturating_sub(1);
        if self.frames_until_control == 0 {
            self.frames_until_control = self.control_period;
            true
        } else {
            false
        }
    }
}

/// Converts reference timestamps into divider updates
pub struct PllController<D> {
    table: Arc<FractionalDividerTable>,
    divider: D,
    pll_ratio: u32,
    kp: i64,
    ki: i64,
    kii: i64,
    policy: LockPolicy,
    accum_limit: i64,
}

fn to_q16(name: &str, gain: f64) -> Result<i64> {
    if !gain.is_finite() || !(0.0..=MAX_GAIN).contains(&gain) {
        return Err(PllError::invalid_config(format!(
            "gain {} = {} must be within 0..={}",
            name, gain, MAX_GAIN
        )));
    }
    Ok((gain * f64::from(1u32 << Q)).round() as i64)
}

impl<D: DividerRegister> PllController<D> {
    /// Create a controller writing to `divider`
    ///
    /// `pll_ratio` is the nominal number of master-clock cycles per reference edge.
    pub fn new(
        table: Arc<FractionalDividerTable>,
        divider: D,
        pll_ratio: u32,
        gains: &LoopGains,
        policy: LockPolicy,
    ) -> Result<Self> {
        if pll_ratio == 0 {
            return Err(PllError::invalid_config("PLL ratio must be non-zero"));
        }
        policy.validate()?;

        let (kp, ki, kii) = gains.to_fixed()?;

        let accum_limit = if kii > 0 {
            ((table.len() as i64) << Q) / kii
        } else {
            i64::from(i32::MAX)
        };

        debug!(
            "PLL controller: ratio {}, Kp {} Ki {} Kii {} (Q16), {} table entries",
            pll_ratio,
            kp,
            ki,
            kii,
            table.len()
        );

        Ok(Self {
            table,
            divider,
            pll_ratio,
            kp,
            ki,
            kii,
            policy,
            accum_limit,
        })
    }

    pub fn divider(&self) -> &D {
        &self.divider
    }

    /// Build the session state and drive the divider to the nominal entry
    pub fn start(
        &self,
        nominal_index: usize,
        ppm_range: u32,
        control_period: u32,
    ) -> Result<ControlLoopState> {
        if control_period == 0 {
            return Err(PllError::invalid_config(
                "control loop period must be at least one frame",
            ));
        }
        let index_range = self
            .table
            .bounded_range(nominal_index, f64::from(ppm_range))?;
        let register = self
            .table
            .get(nominal_index)
            .map(|e| e.register)
            .ok_or(PllError::IndexOutOfRange {
                index: nominal_index,
                len: self.table.len(),
            })?;

        self.divider.apply(register);
        info!(
            "Software PLL started at index {} (0x{:08X}), clamp {}..={} for +-{} ppm",
            nominal_index,
            register,
            index_range.start(),
            index_range.end(),
            ppm_range
        );

        Ok(ControlLoopState {
            current_index: nominal_index,
            nominal_index,
            index_range,
            ppm_range,
            set_point: (nominal_index as i64) << Q,
            error_accum: 0,
            last_error: 0,
            previous: None,
            control_period,
            frames_until_control: control_period,
            lock_status: LockStatus::UnlockedLow,
            settle_run: 0,
            pinned_low_run: 0,
            pinned_high_run: 0,
        })
    }

    /// Put a running session back to its just-started condition
    ///
    /// Re-applies the nominal entry and keeps the already validated clamp range.
    pub fn restart(&self, state: &mut ControlLoopState) {
        if let Some(entry) = self.table.get(state.nominal_index) {
            self.divider.apply(entry.register);
        }
        state.current_index = state.nominal_index;
        state.set_point = (state.nominal_index as i64) << Q;
        state.error_accum = 0;
        state.last_error = 0;
        state.previous = None;
        state.frames_until_control = state.control_period;
        state.lock_status = LockStatus::UnlockedLow;
        state.settle_run = 0;
        state.pinned_low_run = 0;
        state.pinned_high_run = 0;
        debug!("Software PLL restarted at index {}", state.nominal_index);
    }

    /// Run one control iteration
    ///
    /// `None` means no reference edge arrived during the window; the state is
    /// left untouched. Returns the new status when it changed.
    pub fn do_control(
        &self,
        state: &mut ControlLoopState,
        sample: Option<TimestampSample>,
    ) -> Option<LockStatus> {
        let sample = match sample {
            Some(sample) => sample,
            None => {
                trace!("No reference timestamp this window, skipping");
                return None;
            }
        };

        let previous = match state.previous {
            Some(previous) => previous,
            None => {
                trace!("First reference timestamp {:?}", sample);
                state.previous = Some(sample);
                return None;
            }
        };

        let edges = counter_delta(previous.reference, sample.reference);
        if edges == 0 {
            trace!("Reference timestamp repeated, skipping");
            return None;
        }
        state.previous = Some(sample);

        let expected = self.pll_ratio.wrapping_mul(u32::from(edges)) as u16;
        let actual = counter_delta(previous.master, sample.master);
        let error = i32::from(expected.wrapping_sub(actual) as i16);

        // Velocity-form PI(+I²): the set point moves by the step delta
        state.error_accum = (state.error_accum + i64::from(error))
            .clamp(-self.accum_limit, self.accum_limit);
        let delta = self.ki * i64::from(error)
            + self.kp * i64::from(error - state.last_error)
            + self.kii * state.error_accum;
        state.last_error = error;

        let low = *state.index_range.start() as i64;
        let high = *state.index_range.end() as i64;
        let margin = i64::from(self.policy.windup_margin);
        state.set_point = (state.set_point + delta).clamp((low - margin) << Q, (high + margin) << Q);

        let requested = (state.set_point + (1 << (Q - 1))) >> Q;
        let index = requested.clamp(low, high) as usize;

        if index != state.current_index {
            if let Some(entry) = self.table.get(index) {
                self.divider.apply(entry.register);
                state.current_index = index;
            }
        }

        trace!(
            "edges {} expected {} actual {} error {} -> set point {:.3}, index {}",
            edges,
            expected,
            actual,
            error,
            state.set_point(),
            state.current_index
        );

        self.classify(state, error, requested, low, high)
    }

    fn classify(
        &self,
        state: &mut ControlLoopState,
        error: i32,
        requested: i64,
        low: i64,
        high: i64,
    ) -> Option<LockStatus> {
        let pinned_low = requested < low;
        let pinned_high = requested > high;

        state.pinned_low_run = if pinned_low {
            state.pinned_low_run.saturating_add(1)
        } else {
            0
        };
        state.pinned_high_run = if pinned_high {
            state.pinned_high_run.saturating_add(1)
        } else {
            0
        };
        state.settle_run =
            if !pinned_low && !pinned_high && error.unsigned_abs() <= u32::from(self.policy.threshold) {
                state.settle_run.saturating_add(1)
            } else {
                0
            };

        let next = if state.pinned_high_run >= self.policy.unlock_iterations {
            LockStatus::UnlockedHigh
        } else if state.pinned_low_run >= self.policy.unlock_iterations {
            LockStatus::UnlockedLow
        } else if state.settle_run >= self.policy.settle_iterations {
            LockStatus::Locked
        } else {
            state.lock_status
        };

        if next != state.lock_status {
            state.lock_status = next;
            Some(next)
        } else {
            None
        }
    }
}
