//! Fixed-duration PCM frames

use std::sync::Arc;
use std::time::Duration;

/// Capture sample rate (16kHz mono speech)
pub const SAMPLE_RATE: u32 = 16000;

/// Duration of one frame in milliseconds
pub const FRAME_MS: u64 = 30;

/// Samples per frame at [`SAMPLE_RATE`]
#[allow(clippy::cast_possible_truncation)]
pub const FRAME_SAMPLES: usize = (SAMPLE_RATE as u64 * FRAME_MS / 1000) as usize;

/// Duration of one frame
pub const FRAME_DURATION: Duration = Duration::from_millis(FRAME_MS);

/// An immutable block of 16-bit PCM audio
///
/// Cloning is cheap: samples are shared, never copied or mutated after
/// creation.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    samples: Arc<[i16]>,
    sample_rate: u32,
    seq: u64,
}

impl AudioFrame {
    /// Create a frame from raw samples
    #[must_use]
    pub fn new(samples: impl Into<Arc<[i16]>>, sample_rate: u32, seq: u64) -> Self {
        Self {
            samples: samples.into(),
            sample_rate,
            seq,
        }
    }

    /// Create a frame from normalized `f32` samples in [-1.0, 1.0]
    #[must_use]
    pub fn from_f32(samples: &[f32], sample_rate: u32, seq: u64) -> Self {
        let pcm: Vec<i16> = samples.iter().map(|&s| f32_to_i16(s)).collect();
        Self::new(pcm, sample_rate, seq)
    }

    /// A frame of digital silence at the capture rate
    #[must_use]
    pub fn silence(seq: u64) -> Self {
        Self::new(vec![0i16; FRAME_SAMPLES], SAMPLE_RATE, seq)
    }

    #[must_use]
    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Monotonic sequence number assigned by the frame source
    #[must_use]
    pub const fn seq(&self) -> u64 {
        self.seq
    }

    /// Playing time of this frame
    #[must_use]
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(self.samples.len() as u64 * 1_000_000 / u64::from(self.sample_rate))
    }

    /// RMS energy normalized to [0, 1]
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn rms(&self) -> f32 {
        if self.samples.is_empty() {
            return 0.0;
        }

        let sum_squares: f64 = self
            .samples
            .iter()
            .map(|&s| {
                let v = f64::from(s) / 32768.0;
                v * v
            })
            .sum();

        #[allow(clippy::cast_possible_truncation)]
        let rms = (sum_squares / self.samples.len() as f64).sqrt() as f32;
        rms.min(1.0)
    }

    /// Little-endian PCM bytes, the wire format for streaming sessions
    #[must_use]
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }
}

/// Number of whole frames needed to cover `duration`, rounding up
#[must_use]
pub fn frames_for(duration: Duration) -> usize {
    let frame_us = FRAME_DURATION.as_micros();
    usize::try_from(duration.as_micros().div_ceil(frame_us)).unwrap_or(usize::MAX)
}

/// Number of whole frames that fit within `duration`, rounding down
#[must_use]
pub fn frames_within(duration: Duration) -> usize {
    let frame_us = FRAME_DURATION.as_micros();
    usize::try_from(duration.as_micros() / frame_us).unwrap_or(usize::MAX)
}

/// Convert a normalized `f32` sample to `i16`
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn f32_to_i16(sample: f32) -> i16 {
    (sample * 32767.0).clamp(-32768.0, 32767.0) as i16
}

/// Convert an `i16` sample to normalized `f32`
#[must_use]
pub fn i16_to_f32(sample: i16) -> f32 {
    f32::from(sample) / 32768.0
}
