//! Frame-cadence driver for the software PLL

use crate::error::Result;
use crate::hw::DividerRegister;
use crate::sync::pll::{ControlLoopState, LockStatus, PllController};
use crate::sync::timestamp::TimestampSampler;
use tracing::{info, warn};

/// Counters for one recovery session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryStats {
    /// Control iterations run
    pub iterations: u64,
    /// Iterations skipped because no new timestamp arrived
    pub missed_samples: u64,
    /// Lock status transitions reported
    pub status_changes: u64,
}

/// Owns the controller, its state and the timestamp source
///
/// Call [`ClockRecovery::on_frame`] once per audio frame. Every
/// `control_period` frames it polls the sampler and runs one control
/// iteration inline.
pub struct ClockRecovery<S, D> {
    controller: PllController<D>,
    state: ControlLoopState,
    sampler: S,
    stats: RecoveryStats,
    missing_run: u32,
}

impl<S: TimestampSampler, D: DividerRegister> ClockRecovery<S, D> {
    pub fn new(
        controller: PllController<D>,
        sampler: S,
        nominal_index: usize,
        ppm_range: u32,
        control_period: u32,
    ) -> Result<Self> {
        let state = controller.start(nominal_index, ppm_range, control_period)?;
        Ok(Self {
            controller,
            state,
            sampler,
            stats: RecoveryStats::default(),
            missing_run: 0,
        })
    }

    /// Count one frame; returns a lock status transition if one happened
    pub fn on_frame(&mut self) -> Option<LockStatus> {
        if !self.state.count_frame() {
            return None;
        }

        self.stats.iterations += 1;
        let sample = self.sampler.latest();
        if sample.is_none() {
            self.stats.missed_samples += 1;
            self.missing_run += 1;
            if self.missing_run == 1 {
                warn!("No reference timestamp in control window, holding divider");
            }
        } else if self.missing_run > 0 {
            info!(
                "Reference timestamps resumed after {} missed windows",
                self.missing_run
            );
            self.missing_run = 0;
        }

        let change = self.controller.do_control(&mut self.state, sample);
        if let Some(status) = change {
            self.stats.status_changes += 1;
            info!("{}", status);
        }
        change
    }

    /// Re-arm the loop from the nominal entry, e.g. after a stream restart
    pub fn reset(&mut self) {
        self.controller.restart(&mut self.state);
        // Drop anything captured before the restart
        let _ = self.sampler.latest();
        self.missing_run = 0;
    }

    pub fn state(&self) -> &ControlLoopState {
        &self.state
    }

    pub fn lock_status(&self) -> LockStatus {
        self.state.lock_status()
    }

    pub fn sampler(&self) -> &S {
        &self.sampler
    }

    pub fn stats(&self) -> RecoveryStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{DividerEntry, FractionalDividerTable};
    use crate::sim::SimulatedDivider;
    use crate::sync::pll::{LockPolicy, LoopGains};
    use crate::sync::timestamp::{SampleSlot, TimestampSample};
    use std::sync::Arc;

    fn recovery(period: u32) -> (ClockRecovery<Arc<SampleSlot>, Arc<SimulatedDivider>>, Arc<SampleSlot>) {
        let entries = (0..11)
            .map(|i| DividerEntry::new(i, 12_288_000.0 + f64::from(i) * 100.0))
            .collect();
        let table = Arc::new(FractionalDividerTable::from_entries(entries).unwrap());
        let divider = Arc::new(SimulatedDivider::new());
        let controller = PllController::new(
            table,
            divider,
            256,
            &LoopGains::default(),
            LockPolicy::default(),
        )
        .unwrap();
        let slot = Arc::new(SampleSlot::new());
        let recovery = ClockRecovery::new(controller, slot.clone(), 5, 1000, period).unwrap();
        (recovery, slot)
    }

    #[test]
    fn test_controller_runs_every_period() {
        let (mut recovery, slot) = recovery(4);
        slot.publish(TimestampSample::new(0, 0));

        for _ in 0..3 {
            recovery.on_frame();
        }
        assert_eq!(recovery.stats().iterations, 0);
        assert!(slot.is_fresh());

        recovery.on_frame();
        assert_eq!(recovery.stats().iterations, 1);
        assert!(!slot.is_fresh());
        assert_eq!(
            recovery.state().previous_sample(),
            Some(TimestampSample::new(0, 0))
        );
    }

    #[test]
    fn test_missed_window_only_moves_countdown() {
        let (mut recovery, slot) = recovery(4);
        slot.publish(TimestampSample::new(0, 0));
        for _ in 0..4 {
            recovery.on_frame();
        }
        let before = recovery.state().clone();

        recovery.on_frame();
        assert_ne!(recovery.state(), &before);
        assert_eq!(recovery.state().frames_until_control(), 3);

        for _ in 0..3 {
            assert_eq!(recovery.on_frame(), None);
        }
        assert_eq!(recovery.state(), &before);
        assert_eq!(recovery.stats().missed_samples, 1);
    }

    #[test]
    fn test_status_change_is_counted() {
        let (mut recovery, slot) = recovery(1);
        let mut changes = Vec::new();
        for i in 0..10u16 {
            // On-ratio advance: zero error every window
            slot.publish(TimestampSample::new(i.wrapping_mul(256), i));
            if let Some(status) = recovery.on_frame() {
                changes.push(status);
            }
        }
        assert_eq!(changes, vec![LockStatus::Locked]);
        assert_eq!(recovery.stats().status_changes, 1);
    }

    #[test]
    fn test_reset_returns_to_nominal() {
        let (mut recovery, slot) = recovery(1);
        slot.publish(TimestampSample::new(0, 0));
        recovery.on_frame();
        slot.publish(TimestampSample::new(250, 1));
        recovery.on_frame();
        assert_eq!(recovery.state().current_index(), 10);

        slot.publish(TimestampSample::new(500, 2));
        recovery.reset();
        assert_eq!(recovery.state().current_index(), 5);
        assert_eq!(recovery.state().previous_sample(), None);
        assert!(!slot.is_fresh());
    }
}
