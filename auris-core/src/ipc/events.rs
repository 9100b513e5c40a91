//! Event types emitted over the engine's broadcast channels.
//!
//! | Event | Channel |
//! |-------|---------|
//! | `VerdictEvent` | `subscribe_verdicts()` |
//! | `EngineStatusEvent` | `subscribe_status()` |
//! | `AudioActivityEvent` | `subscribe_activity()` |
//! | `SessionSummaryEvent` | `subscribe_sessions()` |

use serde::{Deserialize, Serialize};

use crate::decision::Verdict;
use crate::session::SessionOutcome;

// ---------------------------------------------------------------------------
// Verdict events
// ---------------------------------------------------------------------------

/// Emitted once per inference cycle with the derived safety verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerdictEvent {
    /// Monotonically increasing event sequence number.
    pub seq: u64,
    /// Derived state for this cycle.
    pub verdict: Verdict,
}

// ---------------------------------------------------------------------------
// Audio activity events
// ---------------------------------------------------------------------------

/// Emitted for each processed audio chunk, independent of inference cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioActivityEvent {
    /// Monotonically increasing event sequence number.
    pub seq: u64,
    /// Root-mean-square level of the chunk in [0.0, 1.0].
    pub rms: f32,
    /// Peak absolute amplitude of the chunk in [0.0, 1.0].
    pub peak: f32,
}

// ---------------------------------------------------------------------------
// Session summary events
// ---------------------------------------------------------------------------

/// Emitted once when a session-mode run stops.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummaryEvent {
    /// Monotonically increasing event sequence number.
    pub seq: u64,
    pub outcome: SessionOutcome,
}

// ---------------------------------------------------------------------------
// Engine status events
// ---------------------------------------------------------------------------

/// Emitted when the engine state changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatusEvent {
    pub status: EngineStatus,
    /// Optional human-readable detail (e.g. error message).
    pub detail: Option<String>,
}

/// Current state of the Auris engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineStatus {
    /// Engine created but `start()` not yet called.
    Idle,
    /// Warming up the classifier (loading weights, dummy inference).
    WarmingUp,
    /// Actively capturing audio and classifying.
    Listening,
    /// Capture stopped; engine may be restarted.
    Stopped,
    /// Unrecoverable error — restart required.
    Error,
}
