//! Voice-activity endpointing
//!
//! After a detection the endpointer first has to confirm that speech actually
//! started: frames enter a short onset ring, and onset is confirmed once more
//! than half of the ring is voiced. The ring becomes the head of the
//! utterance. If the onset lead time runs out first the capture is a false
//! trigger.
//!
//! Once speech is confirmed, silence is held back from the buffer until the
//! next voiced frame commits it. A silence run reaching the timeout ends the
//! utterance and the held silence is dropped. Reaching the hard cap ends it
//! with the held silence kept, so a capped utterance is exactly the cap long.

mod buffer;

use std::collections::VecDeque;

pub use buffer::{EndReason, Utterance, UtteranceBuffer};

use crate::config::EndpointConfig;
use crate::voice::{AudioFrame, frames_for, frames_within};

/// Frames in the onset confirmation ring (300ms)
pub const ONSET_RING_FRAMES: usize = 10;

/// Release threshold as a fraction of the onset threshold
const RELEASE_RATIO: f32 = 2.0 / 3.0;

/// Result of feeding one frame
#[derive(Debug)]
pub enum EndpointDecision {
    /// Keep capturing
    Continue,
    /// No speech onset within the lead time; nothing was captured
    FalseTrigger,
    /// The utterance is complete
    Complete(Utterance),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    AwaitingOnset,
    Speech,
}

/// Speech/silence classifier with hysteresis
#[derive(Debug, Clone, Copy)]
struct VoiceClassifier {
    onset: f32,
    release: f32,
    in_speech: bool,
}

impl VoiceClassifier {
    fn new(threshold: f32) -> Self {
        Self {
            onset: threshold,
            release: threshold * RELEASE_RATIO,
            in_speech: false,
        }
    }

    fn classify(&mut self, frame: &AudioFrame) -> bool {
        let energy = frame.rms();
        self.in_speech = if self.in_speech {
            energy >= self.release
        } else {
            energy >= self.onset
        };
        self.in_speech
    }
}

/// Segments one utterance out of the frames following a detection
#[derive(Debug)]
pub struct Endpointer {
    classifier: VoiceClassifier,
    phase: Phase,
    onset_ring: VecDeque<(AudioFrame, bool)>,
    ring_voiced: usize,
    awaited_frames: usize,
    onset_limit: usize,
    held_silence: Vec<AudioFrame>,
    silence_limit: usize,
    max_frames: usize,
    buffer: UtteranceBuffer,
}

impl Endpointer {
    #[must_use]
    pub fn new(config: &EndpointConfig) -> Self {
        let silence_limit = frames_for(config.silence_timeout).max(1);
        let max_frames = frames_within(config.max_utterance).max(1);

        Self {
            classifier: VoiceClassifier::new(config.speech_threshold),
            phase: Phase::AwaitingOnset,
            onset_ring: VecDeque::with_capacity(ONSET_RING_FRAMES),
            ring_voiced: 0,
            awaited_frames: 0,
            onset_limit: frames_for(config.onset_timeout).max(1),
            held_silence: Vec::with_capacity(silence_limit),
            silence_limit,
            max_frames,
            buffer: UtteranceBuffer::new(max_frames),
        }
    }

    /// Forget everything and wait for a new onset
    pub fn reset(&mut self) {
        self.classifier.in_speech = false;
        self.phase = Phase::AwaitingOnset;
        self.onset_ring.clear();
        self.ring_voiced = 0;
        self.awaited_frames = 0;
        self.held_silence.clear();
        self.buffer.clear();
    }

    /// Feed the next captured frame
    pub fn push(&mut self, frame: AudioFrame) -> EndpointDecision {
        let voiced = self.classifier.classify(&frame);
        match self.phase {
            Phase::AwaitingOnset => self.await_onset(frame, voiced),
            Phase::Speech => self.track_speech(frame, voiced),
        }
    }

    /// End the capture now
    ///
    /// Returns `None` if no speech was heard.
    pub fn stop(&mut self) -> Option<Utterance> {
        let utterance = match self.phase {
            Phase::AwaitingOnset => {
                if self.ring_voiced == 0 {
                    None
                } else {
                    for (frame, _) in self.onset_ring.drain(..) {
                        self.buffer.push(frame);
                    }
                    Some(self.buffer.take(EndReason::ExplicitStop))
                }
            }
            Phase::Speech => Some(self.buffer.take(EndReason::ExplicitStop)),
        };
        self.reset();
        utterance
    }

    fn await_onset(&mut self, frame: AudioFrame, voiced: bool) -> EndpointDecision {
        self.awaited_frames += 1;

        if self.onset_ring.len() == ONSET_RING_FRAMES {
            let evicted_voiced = self.onset_ring.pop_front().is_some_and(|(_, v)| v);
            self.ring_voiced -= usize::from(evicted_voiced);
        }
        self.onset_ring.push_back((frame, voiced));
        if voiced {
            self.ring_voiced += 1;
        }

        if self.ring_voiced * 2 > ONSET_RING_FRAMES {
            tracing::debug!(
                ring_frames = self.onset_ring.len(),
                waited_frames = self.awaited_frames,
                "speech onset confirmed"
            );
            self.phase = Phase::Speech;
            for (frame, _) in self.onset_ring.drain(..) {
                self.buffer.push(frame);
            }
            self.ring_voiced = 0;
            return self.check_cap();
        }

        if self.awaited_frames >= self.onset_limit {
            tracing::debug!(waited_frames = self.awaited_frames, "no speech onset");
            self.reset();
            return EndpointDecision::FalseTrigger;
        }

        EndpointDecision::Continue
    }

    fn track_speech(&mut self, frame: AudioFrame, voiced: bool) -> EndpointDecision {
        if voiced {
            for held in self.held_silence.drain(..) {
                self.buffer.push(held);
            }
            self.buffer.push(frame);
        } else {
            self.held_silence.push(frame);
            if self.held_silence.len() >= self.silence_limit
                && self.buffer.len() + self.held_silence.len() < self.max_frames
            {
                self.held_silence.clear();
                let utterance = self.buffer.take(EndReason::SilenceTimeout);
                self.reset();
                return EndpointDecision::Complete(utterance);
            }
        }

        self.check_cap()
    }

    fn check_cap(&mut self) -> EndpointDecision {
        if self.buffer.len() + self.held_silence.len() < self.max_frames {
            return EndpointDecision::Continue;
        }

        for held in self.held_silence.drain(..) {
            self.buffer.push(held);
        }
        let utterance = self.buffer.take(EndReason::MaxDuration);
        self.reset();
        EndpointDecision::Complete(utterance)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::voice::{FRAME_SAMPLES, SAMPLE_RATE};

    fn config(silence_ms: u64, max_ms: u64, onset_ms: u64) -> EndpointConfig {
        EndpointConfig {
            silence_timeout: Duration::from_millis(silence_ms),
            max_utterance: Duration::from_millis(max_ms),
            onset_timeout: Duration::from_millis(onset_ms),
            speech_threshold: 0.03,
        }
    }

    fn speech(seq: u64) -> AudioFrame {
        AudioFrame::from_f32(&[0.2; FRAME_SAMPLES], SAMPLE_RATE, seq)
    }

    fn run(endpointer: &mut Endpointer, frames: Vec<AudioFrame>) -> Option<EndpointDecision> {
        for frame in frames {
            match endpointer.push(frame) {
                EndpointDecision::Continue => {}
                done => return Some(done),
            }
        }
        None
    }

    #[test]
    fn silence_only_is_false_trigger() {
        let mut ep = Endpointer::new(&config(800, 15_000, 600));
        let frames = (0..40).map(AudioFrame::silence).collect();
        assert!(matches!(run(&mut ep, frames), Some(EndpointDecision::FalseTrigger)));
    }

    #[test]
    fn trailing_silence_is_dropped() {
        let mut ep = Endpointer::new(&config(800, 15_000, 2000));
        let mut frames: Vec<AudioFrame> = (0..67).map(speech).collect();
        frames.extend((67..100).map(AudioFrame::silence));

        let Some(EndpointDecision::Complete(utterance)) = run(&mut ep, frames) else {
            panic!("expected a complete utterance");
        };
        assert_eq!(utterance.end_reason(), EndReason::SilenceTimeout);
        assert_eq!(utterance.frames().len(), 67);
        assert_eq!(utterance.frames().last().unwrap().seq(), 66);
    }

    #[test]
    fn short_pause_is_kept() {
        let mut ep = Endpointer::new(&config(300, 15_000, 2000));
        let mut frames: Vec<AudioFrame> = (0..20).map(speech).collect();
        frames.extend((20..25).map(AudioFrame::silence));
        frames.extend((25..40).map(speech));
        frames.extend((40..60).map(AudioFrame::silence));

        let Some(EndpointDecision::Complete(utterance)) = run(&mut ep, frames) else {
            panic!("expected a complete utterance");
        };
        assert_eq!(utterance.frames().len(), 40);
        let seqs: Vec<u64> = utterance.frames().iter().map(AudioFrame::seq).collect();
        assert_eq!(seqs, (0..40).collect::<Vec<_>>());
    }

    #[test]
    fn endless_speech_is_capped_exactly() {
        let mut ep = Endpointer::new(&config(800, 3000, 2000));
        let frames = (0..500).map(speech).collect();

        let Some(EndpointDecision::Complete(utterance)) = run(&mut ep, frames) else {
            panic!("expected a complete utterance");
        };
        assert_eq!(utterance.end_reason(), EndReason::MaxDuration);
        assert_eq!(utterance.duration(), Duration::from_secs(3));
    }

    #[test]
    fn leading_silence_before_onset_is_not_captured() {
        let mut ep = Endpointer::new(&config(300, 15_000, 2000));
        let mut frames: Vec<AudioFrame> = (0..30).map(AudioFrame::silence).collect();
        frames.extend((30..50).map(speech));
        frames.extend((50..70).map(AudioFrame::silence));

        let Some(EndpointDecision::Complete(utterance)) = run(&mut ep, frames) else {
            panic!("expected a complete utterance");
        };
        assert_eq!(utterance.frames()[0].seq(), 26);
        assert_eq!(utterance.frames().last().unwrap().seq(), 49);
    }

    #[test]
    fn stop_without_speech_yields_nothing() {
        let mut ep = Endpointer::new(&config(800, 15_000, 2000));
        ep.push(AudioFrame::silence(0));
        assert!(ep.stop().is_none());

        ep.push(speech(1));
        let utterance = ep.stop().unwrap();
        assert_eq!(utterance.end_reason(), EndReason::ExplicitStop);
        assert_eq!(utterance.frames().len(), 1);
    }

    #[test]
    fn hysteresis_holds_speech_through_quieter_frames() {
        let mut classifier = VoiceClassifier::new(0.03);
        let quiet = AudioFrame::from_f32(&[0.025; FRAME_SAMPLES], SAMPLE_RATE, 0);

        assert!(!classifier.classify(&quiet));
        assert!(classifier.classify(&speech(1)));
        assert!(classifier.classify(&quiet));
        assert!(!classifier.classify(&AudioFrame::silence(2)));
    }
}
