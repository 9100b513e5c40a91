//! # auris-core
//!
//! Reusable ambient sound safety engine SDK.
//!
//! ## Architecture
//!
//! ```text
//! Microphone → AudioCapture → SPSC RingBuffer → Pipeline(spawn_blocking)
//!                                                    │
//!                                          SlidingWindow + rate gate
//!                                                    │
//!                                        SoundClassifier::scores
//!                                                    │
//!                                           Verdict thresholds
//!                                                    │
//!                                    broadcast::Sender<VerdictEvent>
//! ```
//!
//! The audio callback is zero-alloc. All heap work happens in the pipeline thread.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod buffering;
pub mod classify;
pub mod decision;
pub mod engine;
pub mod error;
pub mod ipc;
pub mod session;

// Convenience re-exports for downstream crates
pub use classify::{ClassifierHandle, SoundClassifier, NUM_CLASSES, WINDOW_SAMPLES};
pub use decision::{DecisionConfig, Verdict, SAFE_CLASSES};
pub use engine::{AurisEngine, EngineConfig, EngineMode};
pub use error::AurisError;
pub use ipc::events::{
    AudioActivityEvent, EngineStatus, EngineStatusEvent, SessionSummaryEvent, VerdictEvent,
};
pub use session::{SessionOutcome, SessionVerdict};

#[cfg(feature = "onnx")]
pub use classify::{OnnxClassifier, OnnxClassifierConfig};
