//! Loopback application: every received frame is sent back one period later

use crate::audio::engine::{RestartDecision, StreamCallbacks, StreamConfig, StreamMode};
use crate::audio::FrameBuffer;
use tracing::info;

/// Echoes input to output with a one-frame delay
///
/// The first frame sent after initialization is silent.
#[derive(Debug)]
pub struct LoopbackApp {
    held: FrameBuffer,
    mclk_frame_ratio: u32,
    restart_checks: u64,
}

impl LoopbackApp {
    pub fn new(channels: usize, mclk_frame_ratio: u32) -> Self {
        Self {
            held: FrameBuffer::new(channels),
            mclk_frame_ratio,
            restart_checks: 0,
        }
    }

    /// Restart checks answered so far
    pub fn restart_checks(&self) -> u64 {
        self.restart_checks
    }
}

impl StreamCallbacks for LoopbackApp {
    fn initialize(&mut self, config: &mut StreamConfig) {
        config.mode = StreamMode::I2s;
        config.mclk_frame_ratio = self.mclk_frame_ratio;
        self.held.clear();
        info!("Loopback initialized, {} channels", self.held.channels());
    }

    fn restart_check(&mut self) -> RestartDecision {
        self.restart_checks += 1;
        RestartDecision::Continue
    }

    fn produce(&mut self, frame: &mut FrameBuffer) {
        frame.copy_from(&self.held);
    }

    fn consume(&mut self, frame: &FrameBuffer) {
        self.held.copy_from(frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init(app: &mut LoopbackApp) -> StreamConfig {
        let mut config = StreamConfig {
            mode: StreamMode::LeftJustified,
            mclk_frame_ratio: 0,
        };
        app.initialize(&mut config);
        config
    }

    #[test]
    fn test_initialize_sets_session() {
        let mut app = LoopbackApp::new(2, 256);
        let config = init(&mut app);
        assert_eq!(config.mode, StreamMode::I2s);
        assert_eq!(config.mclk_frame_ratio, 256);
    }

    #[test]
    fn test_output_lags_input_by_one_frame() {
        let mut app = LoopbackApp::new(3, 256);
        init(&mut app);

        let inputs: Vec<FrameBuffer> = (0..50)
            .map(|k| FrameBuffer::from_samples(vec![k, -k, k.wrapping_mul(0x0101_0101)]))
            .collect();

        let mut out = FrameBuffer::new(3);
        let mut produced = Vec::new();
        for input in &inputs {
            assert_eq!(app.restart_check(), RestartDecision::Continue);
            app.produce(&mut out);
            produced.push(out.clone());
            app.consume(input);
        }

        assert!(produced[0].is_silent());
        for k in 0..inputs.len() - 1 {
            assert_eq!(produced[k + 1], inputs[k]);
        }
        assert_eq!(app.restart_checks(), 50);
    }

    #[test]
    fn test_reinitialize_forgets_held_frame() {
        let mut app = LoopbackApp::new(2, 256);
        init(&mut app);
        app.consume(&FrameBuffer::from_samples(vec![5, 6]));

        init(&mut app);
        let mut out = FrameBuffer::from_samples(vec![1, 1]);
        app.produce(&mut out);
        assert!(out.is_silent());
    }
}
