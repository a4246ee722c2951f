//! Streaming engine - per-frame exchange loop driving clock recovery
//!
//! Each frame runs, strictly in order: restart check, produce, transmit,
//! receive, consume, then one tick of the clock-recovery cadence. Nothing
//! inside a frame can fail or block; errors are confined to `initialize`.

use crate::audio::{FrameBuffer, StreamFormat};
use crate::error::{PllError, Result};
use crate::hw::{AudioInterface, DividerRegister};
use crate::sync::{ClockRecovery, LockStatus, TimestampSampler};
use crossbeam_channel::{Sender, TrySendError};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Serial frame layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamMode {
    /// Data delayed one bit clock after the frame clock edge
    I2s,
    /// Data aligned with the frame clock edge
    LeftJustified,
}

impl fmt::Display for StreamMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamMode::I2s => f.write_str("I2S"),
            StreamMode::LeftJustified => f.write_str("left-justified"),
        }
    }
}

/// Session parameters chosen by the application at initialization
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamConfig {
    pub mode: StreamMode,
    /// Master clock cycles per frame clock period
    pub mclk_frame_ratio: u32,
}

/// Answer of the per-cycle restart check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    Continue,
    /// Tear the session down and initialize again
    Restart,
}

/// Application side of the streaming protocol
///
/// All methods run inside the frame deadline and must not block.
pub trait StreamCallbacks {
    /// Configure the session; called once before streaming and after each restart
    fn initialize(&mut self, config: &mut StreamConfig);

    /// Called once per frame before the exchange
    fn restart_check(&mut self) -> RestartDecision;

    /// Fill the frame about to be transmitted
    fn produce(&mut self, frame: &mut FrameBuffer);

    /// Accept the frame just received
    fn consume(&mut self, frame: &FrameBuffer);
}

/// Engine state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Not initialized
    Uninitialized,
    /// Initialized but not streaming
    Ready,
    /// Streaming
    Running,
    /// Stopped; must be initialized again
    Stopped,
}

/// Events from the engine that external observers might care about
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// Session configured
    Initialized(StreamConfig),
    /// Clock recovery changed lock status
    LockStatusChanged(LockStatus),
    /// Session torn down and reinitialized
    Restarted,
}

/// Counters for the current engine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Frames exchanged
    pub frames: u64,
    /// Restarts requested by the application
    pub restarts: u64,
    /// Lock status transitions observed
    pub status_changes: u64,
}

/// Single-threaded frame loop over an audio interface
pub struct StreamingEngine<I, C, S, D> {
    format: StreamFormat,
    interface: I,
    callbacks: C,
    recovery: ClockRecovery<S, D>,
    config: Option<StreamConfig>,
    state: Arc<Mutex<EngineState>>,
    out_frame: FrameBuffer,
    in_frame: FrameBuffer,
    stats: EngineStats,
    event_tx: Option<Sender<EngineEvent>>,
}

impl<I, C, S, D> StreamingEngine<I, C, S, D>
where
    I: AudioInterface,
    C: StreamCallbacks,
    S: TimestampSampler,
    D: DividerRegister,
{
    /// Create an engine; frames are allocated here, once
    pub fn new(
        format: StreamFormat,
        interface: I,
        callbacks: C,
        recovery: ClockRecovery<S, D>,
    ) -> Self {
        let channels = usize::from(format.channels);
        Self {
            format,
            interface,
            callbacks,
            recovery,
            config: None,
            state: Arc::new(Mutex::new(EngineState::Uninitialized)),
            out_frame: FrameBuffer::new(channels),
            in_frame: FrameBuffer::new(channels),
            stats: EngineStats::default(),
            event_tx: None,
        }
    }

    /// Set an event notification channel
    ///
    /// Events are dropped rather than block the frame loop when the channel is full.
    pub fn set_event_channel(&mut self, tx: Sender<EngineEvent>) {
        self.event_tx = Some(tx);
    }

    /// Get current engine state
    pub fn state(&self) -> EngineState {
        *self.state.lock()
    }

    /// Shared handle to the engine state for other threads
    pub fn state_handle(&self) -> Arc<Mutex<EngineState>> {
        self.state.clone()
    }

    pub fn format(&self) -> &StreamFormat {
        &self.format
    }

    /// Session configuration (available after initialization)
    pub fn stream_config(&self) -> Option<&StreamConfig> {
        self.config.as_ref()
    }

    pub fn stats(&self) -> EngineStats {
        self.stats
    }

    pub fn lock_status(&self) -> LockStatus {
        self.recovery.lock_status()
    }

    pub fn recovery(&self) -> &ClockRecovery<S, D> {
        &self.recovery
    }

    pub fn interface(&self) -> &I {
        &self.interface
    }

    pub fn interface_mut(&mut self) -> &mut I {
        &mut self.interface
    }

    pub fn callbacks(&self) -> &C {
        &self.callbacks
    }

    /// Configure the session through the application callbacks
    pub fn initialize(&mut self) -> Result<()> {
        {
            let state = self.state.lock();
            if matches!(*state, EngineState::Ready | EngineState::Running) {
                return Err(PllError::AlreadyInitialized);
            }
        }

        let config = self.negotiate()?;
        self.out_frame.clear();
        self.in_frame.clear();
        self.config = Some(config);
        *self.state.lock() = EngineState::Ready;

        info!("Stream initialized: {} ({})", self.format, config.mode);
        self.notify(EngineEvent::Initialized(config));
        Ok(())
    }

    /// Exchange `frames` frames, then return to ready
    pub fn run_frames(&mut self, frames: u64) -> Result<EngineStats> {
        self.begin()?;
        for _ in 0..frames {
            self.exchange_frame();
        }
        self.end();
        Ok(self.stats)
    }

    /// Exchange frames until `running` is cleared
    pub fn run(&mut self, running: &AtomicBool) -> Result<EngineStats> {
        self.begin()?;
        while running.load(Ordering::Relaxed) {
            self.exchange_frame();
        }
        self.end();
        Ok(self.stats)
    }

    /// Stop the engine
    pub fn stop(&mut self) {
        let mut state = self.state.lock();
        if *state == EngineState::Uninitialized || *state == EngineState::Stopped {
            return;
        }
        *state = EngineState::Stopped;
        self.config = None;
        info!(
            "Streaming engine stopped after {} frames ({} restarts)",
            self.stats.frames, self.stats.restarts
        );
    }

    fn begin(&mut self) -> Result<()> {
        let mut state = self.state.lock();
        match *state {
            EngineState::Ready | EngineState::Running => {
                *state = EngineState::Running;
                Ok(())
            }
            EngineState::Uninitialized | EngineState::Stopped => Err(PllError::NotInitialized),
        }
    }

    fn end(&mut self) {
        let mut state = self.state.lock();
        if *state == EngineState::Running {
            *state = EngineState::Ready;
        }
    }

    fn negotiate(&mut self) -> Result<StreamConfig> {
        let mut config = StreamConfig {
            mode: StreamMode::I2s,
            mclk_frame_ratio: self.format.mclk_frame_ratio,
        };
        self.callbacks.initialize(&mut config);

        if config.mclk_frame_ratio != self.format.mclk_frame_ratio {
            return Err(PllError::StreamMismatch {
                expected: format!("MCLK/FS {}", self.format.mclk_frame_ratio),
                actual: format!("MCLK/FS {}", config.mclk_frame_ratio),
            });
        }
        Ok(config)
    }

    fn exchange_frame(&mut self) {
        if self.callbacks.restart_check() == RestartDecision::Restart {
            self.restart();
        }

        self.callbacks.produce(&mut self.out_frame);
        self.interface.transmit(&self.out_frame);
        self.interface.receive(&mut self.in_frame);
        self.callbacks.consume(&self.in_frame);
        self.stats.frames += 1;

        if let Some(status) = self.recovery.on_frame() {
            self.stats.status_changes += 1;
            self.notify(EngineEvent::LockStatusChanged(status));
        }
    }

    fn restart(&mut self) {
        info!("Restarting stream");
        match self.negotiate() {
            Ok(config) => self.config = Some(config),
            Err(e) => warn!("Keeping previous stream configuration: {}", e),
        }
        self.out_frame.clear();
        self.in_frame.clear();
        self.recovery.reset();
        self.stats.restarts += 1;
        self.notify(EngineEvent::Restarted);
    }

    fn notify(&self, event: EngineEvent) {
        if let Some(tx) = &self.event_tx {
            match tx.try_send(event) {
                Ok(()) => {}
                Err(TrySendError::Full(event)) => debug!("Event channel full, dropped {:?}", event),
                Err(TrySendError::Disconnected(_)) => {}
            }
        }
    }
}

impl<I, C, S, D> Drop for StreamingEngine<I, C, S, D> {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        if *state == EngineState::Running {
            *state = EngineState::Stopped;
        }
    }
}
