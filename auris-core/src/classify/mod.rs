//! Sound classifier abstraction.
//!
//! The `SoundClassifier` trait decouples the pipeline from any specific
//! backend (amplitude stub, ONNX YAMNet, etc.).
//!
//! `&mut self` on `scores` intentionally allows stateful backends (session
//! caches, recurrent state). All mutation is serialised through
//! `ClassifierHandle`'s `parking_lot::Mutex`.

pub mod stub;

#[cfg(feature = "onnx")]
pub mod onnx;

#[cfg(feature = "onnx")]
pub use onnx::{OnnxClassifier, OnnxClassifierConfig};

use std::sync::Arc;

use parking_lot::Mutex;

use crate::buffering::chunk::AudioChunk;
use crate::error::Result;

/// Samples per inference window: 0.975 s at 16 kHz.
pub const WINDOW_SAMPLES: usize = 15_600;

/// Sample rate the classifier expects (Hz).
pub const CLASSIFIER_SAMPLE_RATE: u32 = 16_000;

/// Length of the score vector: one probability per AudioSet class.
pub const NUM_CLASSES: usize = 521;

/// Contract for audio-event classification backends.
pub trait SoundClassifier: Send + 'static {
    /// One-time warm-up: load weights, run a dummy inference to populate
    /// CPU caches. Called once at engine startup.
    ///
    /// # Errors
    /// Returns an error if model files are missing or corrupt.
    fn warm_up(&mut self) -> Result<()>;

    /// Score a normalized mono window.
    ///
    /// # Parameters
    /// - `window`: exactly [`WINDOW_SAMPLES`] peak-normalized samples at
    ///   [`CLASSIFIER_SAMPLE_RATE`].
    ///
    /// # Returns
    /// A [`NUM_CLASSES`]-length probability vector.
    fn scores(&mut self, window: &AudioChunk) -> Result<Vec<f32>>;

    /// Reset any internal state (e.g. between sessions).
    fn reset(&mut self);
}

/// Thread-safe reference-counted handle to any `SoundClassifier` implementor.
///
/// Uses `parking_lot::Mutex` for:
/// - Non-poisoning on panic (unlike `std::sync::Mutex`)
/// - Faster uncontended lock on the platforms we ship to
#[derive(Clone)]
pub struct ClassifierHandle(pub Arc<Mutex<dyn SoundClassifier>>);

impl ClassifierHandle {
    /// Wrap any `SoundClassifier` in a `ClassifierHandle`.
    pub fn new<C: SoundClassifier>(classifier: C) -> Self {
        Self(Arc::new(Mutex::new(classifier)))
    }
}

impl std::fmt::Debug for ClassifierHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClassifierHandle").finish_non_exhaustive()
    }
}
