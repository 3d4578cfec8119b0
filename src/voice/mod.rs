//! Audio I/O
//!
//! Frame source (capture), the frame queue that decouples it from the control
//! loop, output sinks, and the TTS fallback for text-only responses.

mod capture;
mod frame;
mod playback;
mod queue;
mod tts;

use std::sync::Arc;

pub use capture::{CaptureHandle, frames_from_wav, frames_to_wav, start_capture};
pub use frame::{
    AudioFrame, FRAME_DURATION, FRAME_MS, FRAME_SAMPLES, SAMPLE_RATE, f32_to_i16, frames_for,
    frames_within, i16_to_f32,
};
pub use playback::DeviceSink;
pub use queue::{FrameReceiver, FrameSender, frame_queue};
pub use tts::{DecodedAudio, TextToSpeech, decode_mp3};

use crate::Result;
use crate::playback::OutputSink;

/// Access to named audio devices
///
/// Device names are matched by case-insensitive substring; an empty name
/// selects the system default.
pub trait AudioDevices: Send + Sync {
    /// Start a frame source on the named input, pushing into `sender`
    ///
    /// # Errors
    ///
    /// Returns `Error::DeviceUnavailable` if the device is missing or busy
    fn open_input(&self, name: &str, sender: FrameSender) -> Result<CaptureHandle>;

    /// Open a sink on the named output
    ///
    /// # Errors
    ///
    /// Returns `Error::DeviceUnavailable` if the device is missing or busy
    fn open_output(&self, name: &str) -> Result<Box<dyn OutputSink>>;
}

/// System audio devices through cpal
#[derive(Default, Clone)]
pub struct CpalDevices {
    tts: Option<Arc<TextToSpeech>>,
}

impl CpalDevices {
    #[must_use]
    pub fn new(tts: Option<TextToSpeech>) -> Self {
        Self {
            tts: tts.map(Arc::new),
        }
    }
}

impl AudioDevices for CpalDevices {
    fn open_input(&self, name: &str, sender: FrameSender) -> Result<CaptureHandle> {
        start_capture(name, sender)
    }

    fn open_output(&self, name: &str) -> Result<Box<dyn OutputSink>> {
        Ok(Box::new(DeviceSink::open(name, self.tts.clone())?))
    }
}
