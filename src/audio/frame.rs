//! Fixed-size audio frame

/// One frame of 32-bit signed samples, one per channel
///
/// The channel count is fixed at construction; the engine allocates its
/// frames once and reuses them for the whole session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameBuffer {
    samples: Box<[i32]>,
}

impl FrameBuffer {
    /// Create a silent frame
    pub fn new(channels: usize) -> Self {
        Self {
            samples: vec![0; channels].into_boxed_slice(),
        }
    }

    pub fn from_samples(samples: Vec<i32>) -> Self {
        Self {
            samples: samples.into_boxed_slice(),
        }
    }

    pub fn channels(&self) -> usize {
        self.samples.len()
    }

    pub fn samples(&self) -> &[i32] {
        &self.samples
    }

    pub fn samples_mut(&mut self) -> &mut [i32] {
        &mut self.samples
    }

    /// Overwrite with silence
    pub fn clear(&mut self) {
        self.samples.fill(0);
    }

    pub fn is_silent(&self) -> bool {
        self.samples.iter().all(|&s| s == 0)
    }

    /// Copy channel by channel from `other`
    ///
    /// Channels beyond the shorter frame are left alone.
    pub fn copy_from(&mut self, other: &FrameBuffer) {
        let n = self.samples.len().min(other.samples.len());
        self.samples[..n].copy_from_slice(&other.samples[..n]);
    }
}

impl AsRef<[i32]> for FrameBuffer {
    fn as_ref(&self) -> &[i32] {
        &self.samples
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_frame_is_silent() {
        let frame = FrameBuffer::new(4);
        assert_eq!(frame.channels(), 4);
        assert!(frame.is_silent());
    }

    #[test]
    fn test_copy_preserves_channel_order() {
        let src = FrameBuffer::from_samples(vec![i32::MIN, -1, 7, i32::MAX]);
        let mut dst = FrameBuffer::new(4);
        dst.copy_from(&src);
        assert_eq!(dst, src);

        dst.clear();
        assert!(dst.is_silent());
    }

    #[test]
    fn test_copy_between_mismatched_widths() {
        let src = FrameBuffer::from_samples(vec![1, 2, 3]);
        let mut dst = FrameBuffer::from_samples(vec![9, 9]);
        dst.copy_from(&src);
        assert_eq!(dst.samples(), &[1, 2]);
    }
}
