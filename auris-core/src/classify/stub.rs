//! `StubClassifier` — placeholder backend that scores without a model file.
//!
//! Produces a deterministic score vector from the window's amplitude so the
//! full engine/event pipeline can be exercised end-to-end: loud windows
//! look like speech, quiet ones like an empty room.

use crate::buffering::chunk::AudioChunk;
use crate::classify::{SoundClassifier, NUM_CLASSES};
use crate::decision::SPEECH_CLASS;
use crate::error::Result;
use tracing::debug;

/// Amplitude-driven stub backend.
///
/// RMS above `speech_floor` puts most of the probability mass on the speech
/// class; anything below spreads a flat near-zero distribution, which the
/// decision layer reads as silence.
pub struct StubClassifier {
    speech_floor: f32,
    call_count: u64,
}

impl StubClassifier {
    pub fn new() -> Self {
        Self {
            speech_floor: 0.015,
            call_count: 0,
        }
    }

    fn rms(samples: &[f32]) -> f32 {
        if samples.is_empty() {
            return 0.0;
        }
        let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
        (sum_sq / samples.len() as f32).sqrt()
    }
}

impl Default for StubClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl SoundClassifier for StubClassifier {
    fn warm_up(&mut self) -> Result<()> {
        debug!("StubClassifier::warm_up — no-op");
        Ok(())
    }

    fn scores(&mut self, window: &AudioChunk) -> Result<Vec<f32>> {
        self.call_count += 1;

        let rms = Self::rms(&window.samples);
        let mut scores = vec![0.001f32; NUM_CLASSES];

        if rms >= self.speech_floor {
            scores[SPEECH_CLASS] = 0.6;
        }

        debug!(
            call = self.call_count,
            rms = format_args!("{rms:.4}"),
            "stub scores computed"
        );
        Ok(scores)
    }

    fn reset(&mut self) {
        debug!("StubClassifier::reset");
    }
}
