//! `AurisEngine` — top-level lifecycle controller.
//!
//! ## Lifecycle
//!
//! ```text
//! AurisEngine::new()
//!     └─► warm_up()          → classifier loaded, status = WarmingUp → Idle
//!         └─► start()        → audio open, pipeline spawned, status = Listening
//!             └─► stop()     → running=false, stream dropped, status = Stopped
//! ```
//!
//! `start()`/`stop()` are idempotent: calling them in the wrong state returns
//! an error rather than panicking.
//!
//! ## Threading
//!
//! `cpal::Stream` is `!Send` on Windows/macOS (COM / CoreAudio thread
//! affinity). `AudioCapture` is therefore created *inside* the
//! `spawn_blocking` closure so it never crosses a thread boundary. A sync
//! oneshot channel propagates any open-device errors back to the `start()`
//! caller.

pub mod pipeline;

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::info;

use crate::{
    audio::AudioCapture,
    buffering::create_audio_ring,
    classify::{ClassifierHandle, WINDOW_SAMPLES},
    decision::DecisionConfig,
    error::{AurisError, Result},
    ipc::events::{
        AudioActivityEvent, EngineStatus, EngineStatusEvent, SessionSummaryEvent, VerdictEvent,
    },
};

/// Broadcast channel capacity: 256 events buffered for slow consumers.
const BROADCAST_CAP: usize = 256;

/// How verdicts are consumed over a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineMode {
    /// Every inference cycle's verdict stands on its own.
    Continuous,
    /// Cycle verdicts are recorded and aggregated into a summary on stop.
    Session,
}

/// Configuration for `AurisEngine`.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Sample rate the classifier expects (Hz). Audio captured at other
    /// rates is resampled. Default: 16000.
    pub target_sample_rate: u32,
    /// Samples per inference window. Default: 15600 (~0.975 s at 16 kHz).
    pub window_samples: usize,
    /// Minimum time between classifier invocations. Bounds CPU cost under a
    /// saturated stream. Default: 150 ms.
    pub min_infer_interval: Duration,
    /// Continuous or session-aggregated operation. Default: Continuous.
    pub mode: EngineMode,
    /// Verdict threshold tunables.
    pub decision: DecisionConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            target_sample_rate: 16_000,
            window_samples: WINDOW_SAMPLES,
            min_infer_interval: Duration::from_millis(150),
            mode: EngineMode::Continuous,
            decision: DecisionConfig::default(),
        }
    }
}

/// The top-level engine handle.
///
/// `AurisEngine` is `Send + Sync` — all fields use interior mutability.
/// Wrap in `Arc<AurisEngine>` to share between an app's command handlers and
/// event-forwarding async tasks.
pub struct AurisEngine {
    config: EngineConfig,
    classifier: ClassifierHandle,
    /// `true` while capture + pipeline are active.
    running: Arc<AtomicBool>,
    /// Canonical status (written atomically via Mutex, read from commands).
    status: Arc<Mutex<EngineStatus>>,
    /// Broadcast sender for per-cycle verdict events.
    verdict_tx: broadcast::Sender<VerdictEvent>,
    /// Broadcast sender for status events.
    status_tx: broadcast::Sender<EngineStatusEvent>,
    /// Broadcast sender for live level activity events.
    activity_tx: broadcast::Sender<AudioActivityEvent>,
    /// Broadcast sender for session summaries (Session mode only).
    session_tx: broadcast::Sender<SessionSummaryEvent>,
    /// Monotonically increasing event sequence counter.
    seq: Arc<AtomicU64>,
    /// Shared pipeline diagnostics counters.
    diagnostics: Arc<pipeline::PipelineDiagnostics>,
}

impl AurisEngine {
    /// Create a new engine. Does not start capturing — call `warm_up()` then `start()`.
    pub fn new(config: EngineConfig, classifier: ClassifierHandle) -> Self {
        let (verdict_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (status_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (activity_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (session_tx, _) = broadcast::channel(BROADCAST_CAP);
        let diagnostics = Arc::new(pipeline::PipelineDiagnostics::default());

        Self {
            config,
            classifier,
            running: Arc::new(AtomicBool::new(false)),
            status: Arc::new(Mutex::new(EngineStatus::Idle)),
            verdict_tx,
            status_tx,
            activity_tx,
            session_tx,
            seq: Arc::new(AtomicU64::new(0)),
            diagnostics,
        }
    }

    /// Warm up the classifier (load weights, run dummy inference).
    ///
    /// Call once at application startup, before `start()`. A failure here is
    /// fatal to starting the loop: the status becomes `Error` with the load
    /// failure as its detail, and stays there until the process restarts.
    pub fn warm_up(&self) -> Result<()> {
        self.set_status(EngineStatus::WarmingUp, None);
        info!("warming up sound classifier");
        if let Err(e) = self.classifier.0.lock().warm_up() {
            self.set_status(EngineStatus::Error, Some(e.to_string()));
            return Err(e);
        }
        self.set_status(EngineStatus::Idle, None);
        info!("sound classifier ready");
        Ok(())
    }

    /// Start audio capture and the pipeline.
    ///
    /// Blocks until the audio device is confirmed open (or fails), then
    /// returns. The pipeline continues running in a background blocking
    /// thread. A device-open failure (including an OS-level microphone
    /// permission denial) means the stream never starts.
    ///
    /// # Errors
    /// - `AurisError::AlreadyRunning` if already started.
    /// - `AurisError::NoDefaultInputDevice` / `AurisError::AudioStream` on device error.
    pub fn start(&self) -> Result<()> {
        self.start_with_device(None)
    }

    /// Start the engine using a preferred input device name.
    ///
    /// If `preferred_input_device` is `None`, default input selection is used.
    pub fn start_with_device(&self, preferred_input_device: Option<String>) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            return Err(AurisError::AlreadyRunning);
        }

        self.diagnostics.reset();
        self.running.store(true, Ordering::SeqCst);
        self.set_status(EngineStatus::Listening, None);

        let (producer, consumer) = create_audio_ring();

        // Clone all Arc-wrapped state before moving into the closure.
        let config = self.config.clone();
        let classifier = self.classifier.clone();
        let running = Arc::clone(&self.running);
        let verdict_tx = self.verdict_tx.clone();
        let activity_tx = self.activity_tx.clone();
        let session_tx = self.session_tx.clone();
        let seq = Arc::clone(&self.seq);
        let diagnostics = Arc::clone(&self.diagnostics);

        // Sync oneshot: pipeline thread signals open success/failure to start().
        // Carries the actual capture sample rate on success.
        let (open_tx, open_rx) = std::sync::mpsc::channel::<Result<u32>>();

        tokio::task::spawn_blocking(move || {
            // ── Open audio device (must happen on THIS thread — cpal::Stream is !Send) ──
            let capture = match AudioCapture::open_with_preference(
                producer,
                Arc::clone(&running),
                preferred_input_device.as_deref(),
            ) {
                Ok(c) => {
                    let _ = open_tx.send(Ok(c.sample_rate));
                    c
                }
                Err(e) => {
                    let _ = open_tx.send(Err(e));
                    running.store(false, Ordering::SeqCst);
                    return;
                }
            };

            let capture_sample_rate = capture.sample_rate;

            // ── Run pipeline ──────────────────────────────────────────────────────────
            pipeline::run(pipeline::PipelineContext {
                config,
                classifier,
                consumer,
                running,
                verdict_tx,
                activity_tx,
                session_tx,
                seq,
                capture_sample_rate,
                diagnostics,
            });

            // Stream drops here, releasing the audio device on this thread.
            drop(capture);
        });

        // Block start() until device open is confirmed (receives actual sample rate).
        match open_rx.recv() {
            Ok(Ok(_rate)) => {
                info!("engine started — listening");
                Ok(())
            }
            Ok(Err(e)) => {
                self.running.store(false, Ordering::SeqCst);
                self.set_status(EngineStatus::Error, Some(e.to_string()));
                Err(e)
            }
            Err(_) => {
                // Channel closed before a message was sent — spawn_blocking panicked?
                self.running.store(false, Ordering::SeqCst);
                self.set_status(EngineStatus::Error, Some("pipeline failed to start".into()));
                Err(AurisError::Other(anyhow::anyhow!(
                    "pipeline task died unexpectedly"
                )))
            }
        }
    }

    /// Stop audio capture and the pipeline.
    ///
    /// In Session mode the pipeline emits a `SessionSummaryEvent` as it
    /// winds down.
    ///
    /// # Errors
    /// - `AurisError::NotRunning` if not currently running.
    pub fn stop(&self) -> Result<()> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(AurisError::NotRunning);
        }

        self.running.store(false, Ordering::SeqCst);
        self.set_status(EngineStatus::Stopped, None);
        info!("engine stop requested");
        Ok(())
    }

    /// Current engine status (snapshot).
    pub fn status(&self) -> EngineStatus {
        *self.status.lock()
    }

    /// Subscribe to live verdict events.
    pub fn subscribe_verdicts(&self) -> broadcast::Receiver<VerdictEvent> {
        self.verdict_tx.subscribe()
    }

    /// Subscribe to live status change events.
    pub fn subscribe_status(&self) -> broadcast::Receiver<EngineStatusEvent> {
        self.status_tx.subscribe()
    }

    /// Subscribe to live audio level events (RMS + peak per chunk).
    pub fn subscribe_activity(&self) -> broadcast::Receiver<AudioActivityEvent> {
        self.activity_tx.subscribe()
    }

    /// Subscribe to session summary events (emitted on stop in Session mode).
    pub fn subscribe_sessions(&self) -> broadcast::Receiver<SessionSummaryEvent> {
        self.session_tx.subscribe()
    }

    /// Snapshot of pipeline counters for observability.
    pub fn pipeline_diagnostics_snapshot(&self) -> pipeline::DiagnosticsSnapshot {
        self.diagnostics.snapshot()
    }

    // ── Internal helpers ─────────────────────────────────────────────────────

    fn set_status(&self, new_status: EngineStatus, detail: Option<String>) {
        *self.status.lock() = new_status;
        let _ = self.status_tx.send(EngineStatusEvent {
            status: new_status,
            detail,
        });
    }
}
