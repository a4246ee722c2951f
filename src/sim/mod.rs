//! Simulated hardware
//!
//! Deterministic stand-ins for the clock generator, the serial audio link
//! and the edge-capture port. The link doubles as the clock plant: every
//! frame it advances a 16-bit master-clock counter by the number of master
//! cycles that fit into one frame period at the frequency selected by the
//! divider register, and publishes a timestamp on each reference edge.

use crate::audio::{FrameBuffer, LoopbackApp, StreamFormat, StreamingEngine};
use crate::clock::{FractionalDividerTable, RecoveredClockOutput};
use crate::config::ClockConfig;
use crate::error::{PllError, Result};
use crate::hw::{AudioInterface, ClockBlock, DividerRegister};
use crate::sync::{
    ClockRecovery, PllController, SampleSlot, ThreadedSampler, TimestampSample, TimestampSampler,
};
use crossbeam_channel::{bounded, Sender};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Divider register backed by one atomic word
#[derive(Debug, Default)]
pub struct SimulatedDivider {
    value: AtomicU32,
    writes: AtomicU64,
}

impl SimulatedDivider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last value written
    pub fn value(&self) -> u32 {
        self.value.load(Ordering::Acquire)
    }

    /// Number of register writes so far
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }
}

impl DividerRegister for SimulatedDivider {
    fn apply(&self, value: u32) {
        self.value.store(value, Ordering::Release);
        self.writes.fetch_add(1, Ordering::Relaxed);
    }
}

/// Output clock block that just remembers how it was programmed
#[derive(Debug, Default)]
pub struct SimulatedClockBlock {
    half_divide: Option<u32>,
    running: bool,
}

impl SimulatedClockBlock {
    pub fn half_divide(&self) -> Option<u32> {
        self.half_divide
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Frequency on the output pin, if the block is running
    pub fn output_hz(&self, master_clock_hz: f64) -> Option<f64> {
        match self.half_divide {
            Some(half) if self.running && half > 0 => {
                Some(master_clock_hz / (2.0 * f64::from(half)))
            }
            _ => None,
        }
    }
}

impl ClockBlock for SimulatedClockBlock {
    fn set_divide(&mut self, half_divide: u32) {
        self.half_divide = Some(half_divide);
    }

    fn start(&mut self) {
        self.running = true;
    }
}

/// Where the simulated capture port delivers timestamps
pub enum EdgeSink {
    /// Straight into the mailbox polled by the frame loop
    Slot(Arc<SampleSlot>),
    /// Through a channel, for a [`crate::sync::ThreadedSampler`]
    Channel(Sender<TimestampSample>),
}

impl EdgeSink {
    fn publish(&self, sample: TimestampSample) {
        match self {
            EdgeSink::Slot(slot) => slot.publish(sample),
            EdgeSink::Channel(tx) => {
                let _ = tx.try_send(sample);
            }
        }
    }
}

/// Deterministic input sample for a frame and channel
pub fn input_sample(frame: u64, channel: usize) -> i32 {
    let mut x = ((frame << 8) | channel as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    x ^= x >> 29;
    (x >> 32) as i32
}

/// Serial link slaved to a reference frame clock, plus the master-clock plant
pub struct SimulatedLink {
    table: Arc<FractionalDividerTable>,
    divider: Arc<SimulatedDivider>,
    sink: EdgeSink,
    frame_hz: f64,
    frames_per_edge: u32,
    ppm_offset: f64,
    dropping: bool,
    register: Option<u32>,
    master_hz: f64,
    master: u16,
    phase: f64,
    edge: u16,
    frames_since_edge: u32,
    frame: u64,
    edges_published: u64,
    recording: bool,
    transmitted: Vec<FrameBuffer>,
    received: Vec<FrameBuffer>,
}

impl SimulatedLink {
    /// `frame_hz` is the nominal frame clock; a reference edge occurs every `frames_per_edge` frames
    pub fn new(
        table: Arc<FractionalDividerTable>,
        divider: Arc<SimulatedDivider>,
        sink: EdgeSink,
        frame_hz: f64,
        frames_per_edge: u32,
    ) -> Self {
        let master_hz = table.get(table.len() / 2).map_or(0.0, |e| e.frequency_hz);
        Self {
            table,
            divider,
            sink,
            frame_hz,
            frames_per_edge: frames_per_edge.max(1),
            ppm_offset: 0.0,
            dropping: false,
            register: None,
            master_hz,
            master: 0,
            phase: 0.5,
            edge: 0,
            frames_since_edge: 0,
            frame: 0,
            edges_published: 0,
            recording: false,
            transmitted: Vec::new(),
            received: Vec::new(),
        }
    }

    /// Offset the reference (and with it the frame clock) from nominal
    pub fn set_reference_ppm(&mut self, ppm: f64) {
        debug!("Simulated reference offset {:+.3} ppm", ppm);
        self.ppm_offset = ppm;
    }

    pub fn reference_ppm(&self) -> f64 {
        self.ppm_offset
    }

    /// Keep the clocks running but stop delivering timestamps
    pub fn set_timestamps_dropped(&mut self, dropped: bool) {
        self.dropping = dropped;
    }

    /// Keep a copy of every frame from now on
    pub fn start_recording(&mut self) {
        self.recording = true;
    }

    pub fn transmitted(&self) -> &[FrameBuffer] {
        &self.transmitted
    }

    pub fn received(&self) -> &[FrameBuffer] {
        &self.received
    }

    pub fn frames(&self) -> u64 {
        self.frame
    }

    pub fn edges_published(&self) -> u64 {
        self.edges_published
    }

    /// Master clock frequency currently produced by the divider
    pub fn master_clock_hz(&self) -> f64 {
        self.master_hz
    }

    fn refresh_master_clock(&mut self) {
        let register = self.divider.value();
        if self.register == Some(register) {
            return;
        }
        // Registers outside the table leave the generator where it was
        if let Some(entry) = self
            .table
            .index_of_register(register)
            .and_then(|i| self.table.get(i))
        {
            self.master_hz = entry.frequency_hz;
        }
        self.register = Some(register);
    }

    /// Advance the plant by one frame period
    fn advance(&mut self) {
        self.refresh_master_clock();
        let frame_hz = self.frame_hz * (1.0 + self.ppm_offset * 1e-6);
        self.phase += self.master_hz / frame_hz;
        let whole = self.phase.floor();
        self.phase -= whole;
        self.master = self.master.wrapping_add(whole as u64 as u16);

        self.frames_since_edge += 1;
        if self.frames_since_edge == self.frames_per_edge {
            self.frames_since_edge = 0;
            self.edge = self.edge.wrapping_add(1);
            if !self.dropping {
                self.sink
                    .publish(TimestampSample::new(self.master, self.edge));
                self.edges_published += 1;
            }
        }
    }
}

impl AudioInterface for SimulatedLink {
    fn transmit(&mut self, frame: &FrameBuffer) {
        if self.recording {
            self.transmitted.push(frame.clone());
        }
    }

    fn receive(&mut self, frame: &mut FrameBuffer) {
        for (channel, sample) in frame.samples_mut().iter_mut().enumerate() {
            *sample = input_sample(self.frame, channel);
        }
        if self.recording {
            self.received.push(frame.clone());
        }
        self.advance();
        self.frame += 1;
    }
}

/// Engine over simulated hardware running the loopback application
pub type SimulatedEngine<S = Arc<SampleSlot>> =
    StreamingEngine<SimulatedLink, LoopbackApp, S, Arc<SimulatedDivider>>;

/// Edges the capture channel buffers before the link starts dropping them
const EDGE_QUEUE_DEPTH: usize = 4096;

/// Every piece of a simulated system, before assembly into an engine
pub struct SimulatedParts<S = Arc<SampleSlot>> {
    pub format: StreamFormat,
    pub table: Arc<FractionalDividerTable>,
    pub divider: Arc<SimulatedDivider>,
    pub link: SimulatedLink,
    pub recovery: ClockRecovery<S, Arc<SimulatedDivider>>,
    pub output: RecoveredClockOutput,
}

impl SimulatedParts {
    /// Validate `config` and build its table and hardware
    pub fn build(config: &ClockConfig) -> Result<Self> {
        config.validate()?;
        let table = Arc::new(config.build_table()?);
        Self::with_table(config, table)
    }

    /// Build around an already constructed table
    ///
    /// The link publishes straight into the mailbox the frame loop polls.
    pub fn with_table(config: &ClockConfig, table: Arc<FractionalDividerTable>) -> Result<Self> {
        let slot = Arc::new(SampleSlot::new());
        Self::assemble(config, table, slot.clone(), EdgeSink::Slot(slot))
    }
}

impl SimulatedParts<ThreadedSampler> {
    /// Like [`SimulatedParts::build`], but edges travel through a channel to a sampler thread
    pub fn threaded(config: &ClockConfig) -> Result<Self> {
        config.validate()?;
        let table = Arc::new(config.build_table()?);
        let (tx, rx) = bounded(EDGE_QUEUE_DEPTH);
        Self::assemble(
            config,
            table,
            ThreadedSampler::spawn(rx),
            EdgeSink::Channel(tx),
        )
    }
}

impl<S: TimestampSampler> SimulatedParts<S> {
    fn assemble(
        config: &ClockConfig,
        table: Arc<FractionalDividerTable>,
        sampler: S,
        sink: EdgeSink,
    ) -> Result<Self> {
        config.check_stream()?;
        let format = config.stream_format()?;
        let ratio = config.pll_ratio()?;
        if config.sample_rate % config.reference_hz != 0 {
            return Err(PllError::invalid_config(format!(
                "simulated link needs the sample rate ({} Hz) to be a multiple of the reference ({} Hz)",
                config.sample_rate, config.reference_hz
            )));
        }
        let frames_per_edge = config.sample_rate / config.reference_hz;
        let nominal = config.nominal_index(&table)?;

        let divider = Arc::new(SimulatedDivider::new());
        let controller = PllController::new(
            table.clone(),
            divider.clone(),
            ratio,
            &config.gains,
            config.lock,
        )?;
        let recovery = ClockRecovery::new(
            controller,
            sampler,
            nominal,
            config.ppm_range,
            config.control_period,
        )?;
        let link = SimulatedLink::new(
            table.clone(),
            divider.clone(),
            sink,
            f64::from(config.sample_rate),
            frames_per_edge,
        );

        Ok(Self {
            format,
            table,
            divider,
            link,
            recovery,
            output: RecoveredClockOutput::new(ratio)?,
        })
    }
}

/// Loopback engine on simulated hardware with the recovered clock output running
pub struct SimulatedSystem<S = Arc<SampleSlot>> {
    pub engine: SimulatedEngine<S>,
    pub table: Arc<FractionalDividerTable>,
    pub divider: Arc<SimulatedDivider>,
    pub output: RecoveredClockOutput,
    pub clock_block: SimulatedClockBlock,
}

impl SimulatedSystem {
    pub fn build(config: &ClockConfig) -> Result<Self> {
        Ok(Self::from_parts(SimulatedParts::build(config)?))
    }

    pub fn with_table(config: &ClockConfig, table: Arc<FractionalDividerTable>) -> Result<Self> {
        Ok(Self::from_parts(SimulatedParts::with_table(config, table)?))
    }
}

impl SimulatedSystem<ThreadedSampler> {
    /// System whose timestamps pass through a [`ThreadedSampler`]
    pub fn threaded(config: &ClockConfig) -> Result<Self> {
        Ok(Self::from_parts(SimulatedParts::threaded(config)?))
    }
}

impl<S: TimestampSampler> SimulatedSystem<S> {
    pub fn from_parts(parts: SimulatedParts<S>) -> Self {
        let app = LoopbackApp::new(
            usize::from(parts.format.channels),
            parts.format.mclk_frame_ratio,
        );
        let mut clock_block = SimulatedClockBlock::default();
        parts.output.configure(&mut clock_block);

        Self {
            engine: StreamingEngine::new(parts.format, parts.link, app, parts.recovery),
            table: parts.table,
            divider: parts.divider,
            output: parts.output,
            clock_block,
        }
    }

    /// Run whole control periods
    pub fn run_iterations(&mut self, iterations: u64) -> Result<()> {
        let period = u64::from(self.engine.recovery().state().control_period());
        self.engine.run_frames(period * iterations)?;
        Ok(())
    }

    /// Offset of the applied entry from nominal, in ppm
    pub fn master_offset_ppm(&self) -> f64 {
        let state = self.engine.recovery().state();
        self.table
            .ppm_offset(state.current_index(), state.nominal_index())
            .unwrap_or(0.0)
    }

    /// Frequency on the recovered reference clock pin
    pub fn recovered_clock_hz(&self) -> Option<f64> {
        self.clock_block
            .output_hz(self.engine.interface().master_clock_hz())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::EngineEvent;
    use crate::clock::DividerEntry;
    use crate::sync::LockStatus;
    use crossbeam_channel::unbounded;
    use std::thread;
    use std::time::{Duration, Instant};

    /// 71 entries 5 ppm apart, nominal 35 at exactly 12.288 MHz
    fn linear_table() -> Arc<FractionalDividerTable> {
        let entries = (0..71)
            .map(|i| {
                let offset = (i as f64 - 35.0) * 5.0e-6;
                DividerEntry::new(0x100 + i as u32, 12_288_000.0 * (1.0 + offset))
            })
            .collect();
        Arc::new(FractionalDividerTable::from_entries(entries).unwrap())
    }

    fn linear_system(ppm: f64) -> SimulatedSystem {
        let config = ClockConfig {
            nominal_index: Some(35),
            ..ClockConfig::default()
        };
        let mut system = SimulatedSystem::with_table(&config, linear_table()).unwrap();
        system.engine.interface_mut().set_reference_ppm(ppm);
        system.engine.initialize().unwrap();
        system
    }

    /// Run iteration by iteration, collecting status changes
    fn run_collect(system: &mut SimulatedSystem, iterations: u64) -> Vec<LockStatus> {
        let (tx, rx) = unbounded();
        system.engine.set_event_channel(tx);
        let mut changes = Vec::new();
        for _ in 0..iterations {
            system.run_iterations(1).unwrap();
            let state = system.engine.recovery().state();
            assert!(state.index_range().contains(&state.current_index()));
            for event in rx.try_iter() {
                if let EngineEvent::LockStatusChanged(status) = event {
                    changes.push(status);
                }
            }
        }
        changes
    }

    #[test]
    fn test_divider_counts_writes() {
        let divider = SimulatedDivider::new();
        divider.apply(0x1214);
        divider.apply(0x1213);
        assert_eq!(divider.value(), 0x1213);
        assert_eq!(divider.writes(), 2);
    }

    #[test]
    fn test_clock_block_idle_until_started() {
        let mut block = SimulatedClockBlock::default();
        assert_eq!(block.output_hz(12_288_000.0), None);
        block.set_divide(128);
        assert_eq!(block.output_hz(12_288_000.0), None);
        block.start();
        assert_eq!(block.output_hz(12_288_000.0), Some(48_000.0));
    }

    #[test]
    fn test_nominal_plant_advances_ratio_per_frame() {
        let mut system = linear_system(0.0);
        let link = system.engine.interface_mut();
        let mut frame = FrameBuffer::new(2);
        let start = link.master;
        for _ in 0..10 {
            link.receive(&mut frame);
        }
        assert_eq!(link.master, start.wrapping_add(2560));
        assert_eq!(link.edges_published(), 10);
        assert_eq!(link.frames(), 10);
    }

    #[test]
    fn test_locks_for_offsets_within_bound() {
        for ppm in [-150.0, -97.3, -20.0, 0.0, 3.3, 61.0, 149.9, 150.0] {
            let mut system = linear_system(ppm);
            let changes = run_collect(&mut system, 60);
            assert_eq!(
                system.engine.lock_status(),
                LockStatus::Locked,
                "{} ppm: {:?}",
                ppm,
                changes
            );

            // And stays locked
            let changes = run_collect(&mut system, 200);
            assert!(changes.is_empty(), "{} ppm: {:?}", ppm, changes);
            assert!((system.master_offset_ppm() - ppm).abs() <= 5.0 + 1e-6);
        }
    }

    #[test]
    fn test_edge_of_bound_never_unlocks_high() {
        let mut system = linear_system(150.0);
        let changes = run_collect(&mut system, 300);

        assert!(!changes.contains(&LockStatus::UnlockedHigh));
        assert_eq!(system.engine.lock_status(), LockStatus::Locked);
        assert_eq!(system.engine.recovery().state().current_index(), 65);
    }

    #[test]
    fn test_just_past_bound_unlocks_high() {
        let mut system = linear_system(151.0);
        let changes = run_collect(&mut system, 300);

        assert_eq!(changes.last(), Some(&LockStatus::UnlockedHigh));
        assert_eq!(system.engine.lock_status(), LockStatus::UnlockedHigh);
        assert_eq!(system.engine.recovery().state().current_index(), 65);
    }

    #[test]
    fn test_far_below_bound_unlocks_low() {
        let mut system = linear_system(0.0);
        run_collect(&mut system, 20);
        assert_eq!(system.engine.lock_status(), LockStatus::Locked);

        system.engine.interface_mut().set_reference_ppm(-300.0);
        let changes = run_collect(&mut system, 60);
        assert_eq!(changes, vec![LockStatus::UnlockedLow]);
        assert_eq!(system.engine.recovery().state().current_index(), 5);
    }

    #[test]
    fn test_reference_steps_stay_in_range() {
        let mut system = linear_system(0.0);
        for ppm in [300.0, 150.0, -300.0, 0.0, -42.0] {
            system.engine.interface_mut().set_reference_ppm(ppm);
            run_collect(&mut system, 40);
        }
        assert_eq!(system.engine.lock_status(), LockStatus::Locked);
    }

    #[test]
    fn test_dropped_timestamps_hold_lock() {
        let mut system = linear_system(61.0);
        run_collect(&mut system, 60);
        assert_eq!(system.engine.lock_status(), LockStatus::Locked);

        system.engine.interface_mut().set_timestamps_dropped(true);
        let index = system.engine.recovery().state().current_index();
        let changes = run_collect(&mut system, 3);
        assert!(changes.is_empty());
        assert_eq!(system.engine.recovery().state().current_index(), index);

        system.engine.interface_mut().set_timestamps_dropped(false);
        let changes = run_collect(&mut system, 50);
        assert!(changes.is_empty());
        assert_eq!(system.engine.recovery().stats().missed_samples, 3);
        assert_eq!(system.engine.lock_status(), LockStatus::Locked);
    }

    #[test]
    fn test_loopback_over_link() {
        let mut system = linear_system(0.0);
        system.engine.interface_mut().start_recording();
        system.engine.run_frames(1000).unwrap();

        let link = system.engine.interface();
        let sent = link.transmitted();
        let got = link.received();
        assert_eq!(sent.len(), 1000);
        assert!(sent[0].is_silent());
        for k in 0..got.len() - 1 {
            assert_eq!(sent[k + 1], got[k]);
        }
    }

    #[test]
    fn test_recovered_clock_tracks_master() {
        let mut system = linear_system(0.0);
        assert_eq!(system.output.divider(), 256);
        assert_eq!(system.recovered_clock_hz(), Some(48_000.0));

        system.engine.interface_mut().set_reference_ppm(100.0);
        run_collect(&mut system, 60);
        let hz = system.recovered_clock_hz().unwrap();
        let ppm = (hz / 48_000.0 - 1.0) * 1e6;
        assert!((ppm - 100.0).abs() <= 5.0 + 1e-6, "{} ppm", ppm);
    }

    fn default_system(ppm: f64) -> SimulatedSystem {
        let mut system = SimulatedSystem::build(&ClockConfig::default()).unwrap();
        system.engine.interface_mut().set_reference_ppm(ppm);
        system.engine.initialize().unwrap();
        system
    }

    #[test]
    fn test_generated_table_locks_inside_outermost_entries() {
        let config = ClockConfig::default();
        let table = config.build_table().unwrap();
        let (low, high) = config.lock_range_ppm(&table).unwrap();
        assert!(low < -149.0 && high > 149.0);

        for ppm in [-149.0, -149.2, 149.0, 149.3] {
            let mut system = default_system(ppm);
            run_collect(&mut system, 100);
            assert_eq!(
                system.engine.lock_status(),
                LockStatus::Locked,
                "{} ppm",
                ppm
            );
            let changes = run_collect(&mut system, 300);
            assert!(changes.is_empty(), "{} ppm: {:?}", ppm, changes);
        }
    }

    #[test]
    fn test_generated_table_unlocks_past_outermost_entry() {
        // Outermost entry is about +149.6 ppm
        let mut system = default_system(150.0);
        run_collect(&mut system, 200);
        assert_eq!(system.engine.lock_status(), LockStatus::UnlockedHigh);
        let state = system.engine.recovery().state();
        assert_eq!(state.current_index(), *state.index_range().end());
    }

    #[test]
    fn test_threaded_sampler_system_locks() {
        let mut system = SimulatedSystem::threaded(&ClockConfig::default()).unwrap();
        system.engine.interface_mut().set_reference_ppm(40.0);
        system.engine.initialize().unwrap();

        for _ in 0..60 {
            system.run_iterations(1).unwrap();
            // Let the sampler thread drain the edges of this window
            let deadline = Instant::now() + Duration::from_secs(5);
            while system.engine.recovery().sampler().edges_captured()
                < system.engine.interface().edges_published()
                && Instant::now() < deadline
            {
                thread::sleep(Duration::from_millis(1));
            }
        }

        let recovery = system.engine.recovery();
        assert_eq!(recovery.lock_status(), LockStatus::Locked);
        // Only the very first window can close before the thread forwards an edge
        assert!(recovery.stats().missed_samples <= 1);
        assert_eq!(
            recovery.sampler().edges_captured(),
            system.engine.interface().edges_published()
        );
    }

    #[test]
    fn test_default_config_builds_generated_system() {
        let mut system = SimulatedSystem::build(&ClockConfig::default()).unwrap();
        assert!(system.table.len() > 100);
        system.engine.initialize().unwrap();
        system.run_iterations(30).unwrap();
        assert_eq!(system.engine.lock_status(), LockStatus::Locked);
    }

    #[test]
    fn test_link_feeds_threaded_sampler() {
        let (tx, rx) = bounded(64);
        let table = linear_table();
        let divider = Arc::new(SimulatedDivider::new());
        divider.apply(0x100 + 35);
        let mut link = SimulatedLink::new(table, divider, EdgeSink::Channel(tx), 48_000.0, 1);
        let mut sampler = ThreadedSampler::spawn(rx);

        let mut frame = FrameBuffer::new(2);
        for _ in 0..4 {
            link.receive(&mut frame);
        }

        let deadline = Instant::now() + Duration::from_secs(5);
        while sampler.edges_captured() < 4 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(sampler.edges_captured(), 4);
        let latest = sampler.latest().unwrap();
        assert_eq!(latest.reference, 4);
        assert_eq!(latest.master, 4 * 256);
    }
}
