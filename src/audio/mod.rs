//! Serial audio streaming and the loopback application

mod engine;
mod frame;
mod loopback;

pub use engine::{
    EngineEvent, EngineState, EngineStats, RestartDecision, StreamCallbacks, StreamConfig,
    StreamMode, StreamingEngine,
};
pub use frame::FrameBuffer;
pub use loopback::LoopbackApp;

use std::time::Duration;

/// Sample width on the serial link
pub const SAMPLE_BITS: u16 = 32;

/// Stream format information
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
    /// Master clock cycles per frame clock period
    pub mclk_frame_ratio: u32,
}

impl StreamFormat {
    pub fn new(sample_rate: u32, channels: u16, mclk_frame_ratio: u32) -> Self {
        Self {
            sample_rate,
            channels,
            bits_per_sample: SAMPLE_BITS,
            mclk_frame_ratio,
        }
    }

    /// Serial data lines needed, two channels per line
    pub fn data_lines(&self) -> u16 {
        self.channels.div_ceil(2)
    }

    /// Nominal master clock frequency
    pub fn master_clock_hz(&self) -> u64 {
        u64::from(self.sample_rate) * u64::from(self.mclk_frame_ratio)
    }

    /// Length of one frame period, the per-frame deadline
    pub fn frame_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.sample_rate.max(1)))
    }
}

impl std::fmt::Display for StreamFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}Hz {}ch {}bit, {} line(s), MCLK/FS {}",
            self.sample_rate,
            self.channels,
            self.bits_per_sample,
            self.data_lines(),
            self.mclk_frame_ratio
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_lines_round_up() {
        assert_eq!(StreamFormat::new(48_000, 1, 256).data_lines(), 1);
        assert_eq!(StreamFormat::new(48_000, 2, 256).data_lines(), 1);
        assert_eq!(StreamFormat::new(48_000, 3, 256).data_lines(), 2);
        assert_eq!(StreamFormat::new(48_000, 8, 256).data_lines(), 4);
    }

    #[test]
    fn test_master_clock_and_display() {
        let format = StreamFormat::new(48_000, 2, 256);
        assert_eq!(format.master_clock_hz(), 12_288_000);
        assert_eq!(format.frame_period(), Duration::from_secs_f64(1.0 / 48_000.0));
        assert_eq!(format.to_string(), "48000Hz 2ch 32bit, 1 line(s), MCLK/FS 256");
    }
}
