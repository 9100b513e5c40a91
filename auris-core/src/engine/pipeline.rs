//! Blocking pipeline loop.
//!
//! ## Pipeline stages (per iteration)
//!
//! ```text
//! 1. Drain ring buffer → Vec<f32> (one chunk per iteration)
//! 2. Resample to the classifier rate, append to the sliding window
//! 3. Emit an AudioActivityEvent (RMS + peak)
//! 4. Skip unless the window is primed AND ≥ min_infer_interval has
//!    elapsed since the previous classifier call
//! 5. Peak-normalize the window tail, run the classifier
//! 6. On error: count it, drop the cycle, keep looping
//! 7. On success: derive a Verdict, broadcast a VerdictEvent, and in
//!    Session mode record the cycle into the session log
//! 8. On loop exit, Session mode: broadcast the SessionSummaryEvent
//! ```
//!
//! This entire loop runs in `spawn_blocking`, keeping the Tokio async
//! executor free for I/O. Each chunk is processed to completion before the
//! next is drained, so classifier invocations never overlap.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    Arc,
};
use std::sync::OnceLock;
use std::time::Instant;

use tokio::sync::broadcast;
use tracing::{debug, error, info};

use crate::{
    audio::resample::RateConverter,
    buffering::{chunk::AudioChunk, window::SlidingWindow, AudioConsumer, Consumer},
    classify::ClassifierHandle,
    decision::{normalize_peak, Verdict},
    engine::{EngineConfig, EngineMode},
    ipc::events::{AudioActivityEvent, SessionSummaryEvent, VerdictEvent},
    session::SessionLog,
};

pub struct PipelineDiagnostics {
    pub frames_in: AtomicUsize,
    pub frames_resampled: AtomicUsize,
    pub inference_calls: AtomicUsize,
    pub inference_errors: AtomicUsize,
    pub rate_limited: AtomicUsize,
    pub verdicts_emitted: AtomicUsize,
}

impl Default for PipelineDiagnostics {
    fn default() -> Self {
        Self {
            frames_in: AtomicUsize::new(0),
            frames_resampled: AtomicUsize::new(0),
            inference_calls: AtomicUsize::new(0),
            inference_errors: AtomicUsize::new(0),
            rate_limited: AtomicUsize::new(0),
            verdicts_emitted: AtomicUsize::new(0),
        }
    }
}

impl PipelineDiagnostics {
    pub fn reset(&self) {
        self.frames_in.store(0, Ordering::Relaxed);
        self.frames_resampled.store(0, Ordering::Relaxed);
        self.inference_calls.store(0, Ordering::Relaxed);
        self.inference_errors.store(0, Ordering::Relaxed);
        self.rate_limited.store(0, Ordering::Relaxed);
        self.verdicts_emitted.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            frames_in: self.frames_in.load(Ordering::Relaxed),
            frames_resampled: self.frames_resampled.load(Ordering::Relaxed),
            inference_calls: self.inference_calls.load(Ordering::Relaxed),
            inference_errors: self.inference_errors.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            verdicts_emitted: self.verdicts_emitted.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DiagnosticsSnapshot {
    pub frames_in: usize,
    pub frames_resampled: usize,
    pub inference_calls: usize,
    pub inference_errors: usize,
    pub rate_limited: usize,
    pub verdicts_emitted: usize,
}

/// All context the pipeline needs, passed as one struct so the closure stays tidy.
pub struct PipelineContext {
    pub config: EngineConfig,
    pub classifier: ClassifierHandle,
    pub consumer: AudioConsumer,
    pub running: Arc<AtomicBool>,
    pub verdict_tx: broadcast::Sender<VerdictEvent>,
    pub activity_tx: broadcast::Sender<AudioActivityEvent>,
    pub session_tx: broadcast::Sender<SessionSummaryEvent>,
    pub seq: Arc<AtomicU64>,
    pub capture_sample_rate: u32,
    pub diagnostics: Arc<PipelineDiagnostics>,
}

/// Chunk size drained from the ring buffer per iteration.
/// 20 ms at 48 kHz = 960 samples; at 16 kHz, 60 ms. Either stride is far
/// below the inference window; the rate gate sets the classification cadence.
const DRAIN_CHUNK: usize = 960;

/// Minimum sleep when the ring is empty (avoids busy-wait burning a core).
const DEFAULT_SLEEP_EMPTY_MS: u64 = 5;

/// Run the blocking pipeline until `ctx.running` becomes false.
pub fn run(mut ctx: PipelineContext) {
    info!("pipeline started");

    // Initialise resampler (passthrough when rates match)
    let mut resampler = match RateConverter::new(
        ctx.capture_sample_rate,
        ctx.config.target_sample_rate,
        DRAIN_CHUNK,
    ) {
        Ok(r) => r,
        Err(e) => {
            error!("failed to create resampler: {e}");
            return;
        }
    };

    if !resampler.is_passthrough() {
        info!(
            "resampling enabled from={} to={}",
            ctx.capture_sample_rate, ctx.config.target_sample_rate
        );
    }

    // Temporary scratch buffer (reused each iteration)
    let mut raw = vec![0f32; DRAIN_CHUNK];
    // Sliding sample buffer the classifier windows are cut from
    let mut window = SlidingWindow::new(ctx.config.window_samples);
    // Per-session cycle history (Session mode only)
    let mut session = SessionLog::new();
    // When the classifier last ran; gates inference frequency
    let mut last_infer_at: Option<Instant> = None;
    // Independent sequence for activity events.
    let mut activity_seq = 0u64;

    loop {
        // ── 0. Check running flag ─────────────────────────────────────────
        if !ctx.running.load(Ordering::Relaxed) {
            break;
        }

        // ── 1. Drain ring buffer ──────────────────────────────────────────
        let n = ctx.consumer.pop_slice(&mut raw);

        if n == 0 {
            // Nothing to process — yield to avoid burning 100 % CPU
            std::thread::sleep(std::time::Duration::from_millis(empty_sleep_ms()));
            continue;
        }

        ctx.diagnostics.frames_in.fetch_add(n, Ordering::Relaxed);

        // ── 2. Resample and append to the sliding window ──────────────────
        let resampled = resampler.process(&raw[..n]);
        if resampled.is_empty() {
            // Partial chunk — waiting for more data to fill rubato's input buffer
            continue;
        }
        ctx.diagnostics
            .frames_resampled
            .fetch_add(resampled.len(), Ordering::Relaxed);
        let chunk = AudioChunk::new(resampled, ctx.config.target_sample_rate);
        window.extend(&chunk.samples);

        debug!(
            raw = n,
            resampled = chunk.samples.len(),
            buffered = window.len(),
            "processed audio chunk"
        );

        // ── 3. Activity event ─────────────────────────────────────────────
        let rms = compute_rms(&chunk.samples);
        let chunk_peak = compute_peak(&chunk.samples);
        let _ = ctx.activity_tx.send(AudioActivityEvent {
            seq: activity_seq,
            rms,
            peak: chunk_peak,
        });
        activity_seq = activity_seq.saturating_add(1);

        // Log audio level periodically for diagnostics
        if activity_seq % 50 == 0 {
            debug!(
                rms = format_args!("{rms:.4}"),
                peak = format_args!("{chunk_peak:.4}"),
                buffered = window.len(),
                window_len = window.window_len(),
                "audio level check"
            );
        }

        // ── 4. Gate: window primed + rate limit ───────────────────────────
        let Some(tail) = window.latest() else {
            continue;
        };
        if let Some(t) = last_infer_at {
            if t.elapsed() < ctx.config.min_infer_interval {
                ctx.diagnostics.rate_limited.fetch_add(1, Ordering::Relaxed);
                continue;
            }
        }

        // ── 5. Normalize + classify ───────────────────────────────────────
        let mut frame = tail.to_vec();
        let peak = normalize_peak(&mut frame);
        let frame = AudioChunk::new(frame, ctx.config.target_sample_rate);

        // The gate clocks attempts, successful or not.
        last_infer_at = Some(Instant::now());
        ctx.diagnostics
            .inference_calls
            .fetch_add(1, Ordering::Relaxed);

        let scores = {
            let mut classifier = ctx.classifier.0.lock();
            classifier.scores(&frame)
        };
        let scores = match scores {
            Ok(s) => s,
            Err(e) => {
                ctx.diagnostics
                    .inference_errors
                    .fetch_add(1, Ordering::Relaxed);
                error!(error = %e, "inference error — cycle dropped");
                continue;
            }
        };

        // ── 6. Verdict ────────────────────────────────────────────────────
        let verdict = Verdict::derive(&scores, peak, &ctx.config.decision);
        if ctx.config.mode == EngineMode::Session {
            session.record(verdict.is_safe);
        }

        let seq = ctx.seq.fetch_add(1, Ordering::Relaxed);
        let emit_result = ctx.verdict_tx.send(VerdictEvent { seq, verdict });
        ctx.diagnostics
            .verdicts_emitted
            .fetch_add(1, Ordering::Relaxed);

        debug!(
            seq,
            top_index = verdict.top_index,
            top_score = format_args!("{:.3}", verdict.top_score),
            speech_score = format_args!("{:.3}", verdict.speech_score),
            peak = format_args!("{:.3}", verdict.peak),
            is_safe = verdict.is_safe,
            is_silence = verdict.is_silence,
            emit_success = emit_result.is_ok(),
            "verdict emitted"
        );
    }

    // ── Session wind-down ─────────────────────────────────────────────────
    if ctx.config.mode == EngineMode::Session {
        let outcome = session.outcome();
        let seq = ctx.seq.fetch_add(1, Ordering::Relaxed);
        let emitted = ctx.session_tx.send(SessionSummaryEvent { seq, outcome }).is_ok();
        info!(
            cycles = outcome.cycles,
            safe_cycles = outcome.safe_cycles,
            verdict = ?outcome.verdict,
            emitted,
            "session summary"
        );
    }

    ctx.classifier.0.lock().reset();

    let snap = ctx.diagnostics.snapshot();
    info!(
        frames_in = snap.frames_in,
        frames_resampled = snap.frames_resampled,
        inference_calls = snap.inference_calls,
        inference_errors = snap.inference_errors,
        rate_limited = snap.rate_limited,
        verdicts_emitted = snap.verdicts_emitted,
        "pipeline stopped — diagnostics"
    );
}

fn empty_sleep_ms() -> u64 {
    static EMPTY_SLEEP_MS: OnceLock<u64> = OnceLock::new();
    *EMPTY_SLEEP_MS.get_or_init(|| {
        std::env::var("AURIS_PIPELINE_EMPTY_SLEEP_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(|v| v.clamp(1, 20))
            .unwrap_or(DEFAULT_SLEEP_EMPTY_MS)
    })
}

fn compute_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq = samples.iter().map(|s| s * s).sum::<f32>();
    (sum_sq / samples.len() as f32).sqrt()
}

fn compute_peak(samples: &[f32]) -> f32 {
    samples.iter().fold(0.0f32, |m, s| m.max(s.abs()))
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::{Duration, Instant};

    use tokio::sync::broadcast::error::TryRecvError;

    use crate::buffering::{create_audio_ring, Producer};
    use crate::classify::{SoundClassifier, NUM_CLASSES};
    use crate::decision::SPEECH_CLASS;
    use crate::error::{AurisError, Result};
    use crate::session::SessionVerdict;

    /// One scripted classifier response per call, in order.
    enum ScriptStep {
        Scores(Vec<f32>),
        Fail,
    }

    struct ScriptedClassifier {
        steps: Vec<ScriptStep>,
        calls: Arc<AtomicUsize>,
        resets: Arc<AtomicUsize>,
    }

    impl ScriptedClassifier {
        fn new(steps: Vec<ScriptStep>, calls: Arc<AtomicUsize>, resets: Arc<AtomicUsize>) -> Self {
            Self {
                steps,
                calls,
                resets,
            }
        }
    }

    impl SoundClassifier for ScriptedClassifier {
        fn warm_up(&mut self) -> Result<()> {
            Ok(())
        }

        fn scores(&mut self, _window: &AudioChunk) -> Result<Vec<f32>> {
            let idx = self.calls.fetch_add(1, Ordering::Relaxed);
            match self.steps.get(idx) {
                Some(ScriptStep::Scores(s)) => Ok(s.clone()),
                Some(ScriptStep::Fail) => {
                    Err(AurisError::Classifier("intentional test failure".into()))
                }
                None => Ok(flat_scores()),
            }
        }

        fn reset(&mut self) {
            self.resets.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn flat_scores() -> Vec<f32> {
        vec![0.001f32; NUM_CLASSES]
    }

    fn speech_scores() -> Vec<f32> {
        let mut s = flat_scores();
        s[SPEECH_CLASS] = 0.6;
        s
    }

    fn recv_event_with_timeout<T: Clone>(
        rx: &mut broadcast::Receiver<T>,
        timeout: Duration,
    ) -> T {
        let start = Instant::now();
        loop {
            match rx.try_recv() {
                Ok(ev) => return ev,
                Err(TryRecvError::Empty) => {
                    if start.elapsed() >= timeout {
                        panic!("timed out waiting for event");
                    }
                    thread::sleep(Duration::from_millis(5));
                }
                Err(TryRecvError::Lagged(_)) => continue,
                Err(TryRecvError::Closed) => panic!("channel closed unexpectedly"),
            }
        }
    }

    fn assert_no_event_for<T: Clone>(rx: &mut broadcast::Receiver<T>, timeout: Duration) {
        let start = Instant::now();
        loop {
            match rx.try_recv() {
                Ok(_) => panic!("expected no event"),
                Err(TryRecvError::Empty) => {
                    if start.elapsed() >= timeout {
                        return;
                    }
                    thread::sleep(Duration::from_millis(5));
                }
                Err(TryRecvError::Lagged(_)) => continue,
                Err(TryRecvError::Closed) => return,
            }
        }
    }

    struct TestHarness {
        ctx: PipelineContext,
        running: Arc<AtomicBool>,
        verdict_rx: broadcast::Receiver<VerdictEvent>,
        activity_rx: broadcast::Receiver<AudioActivityEvent>,
        session_rx: broadcast::Receiver<SessionSummaryEvent>,
        calls: Arc<AtomicUsize>,
        resets: Arc<AtomicUsize>,
        diagnostics: Arc<PipelineDiagnostics>,
    }

    fn harness(
        mut config: EngineConfig,
        steps: Vec<ScriptStep>,
        consumer: AudioConsumer,
    ) -> TestHarness {
        config.target_sample_rate = 16_000;

        let calls = Arc::new(AtomicUsize::new(0));
        let resets = Arc::new(AtomicUsize::new(0));
        let classifier = ClassifierHandle::new(ScriptedClassifier::new(
            steps,
            Arc::clone(&calls),
            Arc::clone(&resets),
        ));

        let (verdict_tx, verdict_rx) = broadcast::channel(16);
        let (activity_tx, activity_rx) = broadcast::channel(64);
        let (session_tx, session_rx) = broadcast::channel(8);
        let running = Arc::new(AtomicBool::new(true));
        let diagnostics = Arc::new(PipelineDiagnostics::default());

        let ctx = PipelineContext {
            config,
            classifier,
            consumer,
            running: Arc::clone(&running),
            verdict_tx,
            activity_tx,
            session_tx,
            seq: Arc::new(AtomicU64::new(0)),
            capture_sample_rate: 16_000,
            diagnostics: Arc::clone(&diagnostics),
        };

        TestHarness {
            ctx,
            running,
            verdict_rx,
            activity_rx,
            session_rx,
            calls,
            resets,
            diagnostics,
        }
    }

    fn base_config() -> EngineConfig {
        let mut cfg = EngineConfig::default();
        cfg.window_samples = 960;
        cfg.min_infer_interval = Duration::ZERO;
        cfg
    }

    #[test]
    fn verdict_emitted_once_window_primed() {
        let (mut producer, consumer) = create_audio_ring();
        producer.push_slice(&vec![0.2; 960]);

        let mut h = harness(base_config(), vec![ScriptStep::Scores(speech_scores())], consumer);
        let ctx = h.ctx;
        let handle = thread::spawn(move || run(ctx));

        let event = recv_event_with_timeout(&mut h.verdict_rx, Duration::from_secs(1));
        h.running.store(false, Ordering::SeqCst);
        handle.join().expect("pipeline thread panicked");

        assert_eq!(event.seq, 0);
        assert_eq!(event.verdict.top_index, SPEECH_CLASS);
        assert!(event.verdict.is_safe);
        assert_eq!(h.calls.load(Ordering::Relaxed), 1);
        assert_eq!(h.resets.load(Ordering::Relaxed), 1);
        assert_eq!(h.diagnostics.snapshot().verdicts_emitted, 1);
    }

    #[test]
    fn activity_events_flow_before_window_is_primed() {
        let (mut producer, consumer) = create_audio_ring();
        producer.push_slice(&vec![0.3; 960]);

        let mut cfg = base_config();
        cfg.window_samples = 4_000; // more than one chunk — never primes here

        let mut h = harness(cfg, vec![], consumer);
        let ctx = h.ctx;
        let handle = thread::spawn(move || run(ctx));

        let activity = recv_event_with_timeout(&mut h.activity_rx, Duration::from_secs(1));
        assert!(activity.peak > 0.29 && activity.peak < 0.31);
        assert_no_event_for(&mut h.verdict_rx, Duration::from_millis(100));

        h.running.store(false, Ordering::SeqCst);
        handle.join().expect("pipeline thread panicked");

        assert_eq!(h.calls.load(Ordering::Relaxed), 0);
        assert_eq!(h.diagnostics.snapshot().inference_calls, 0);
    }

    #[test]
    fn rate_limit_allows_one_call_for_back_to_back_windows() {
        let (mut producer, consumer) = create_audio_ring();
        // Two window-length chunks queued before the loop starts.
        producer.push_slice(&vec![0.2; 960]);
        producer.push_slice(&vec![0.2; 960]);

        let mut cfg = base_config();
        cfg.min_infer_interval = Duration::from_secs(10);

        let mut h = harness(
            cfg,
            vec![
                ScriptStep::Scores(speech_scores()),
                ScriptStep::Scores(speech_scores()),
            ],
            consumer,
        );
        let ctx = h.ctx;
        let handle = thread::spawn(move || run(ctx));

        let _ = recv_event_with_timeout(&mut h.verdict_rx, Duration::from_secs(1));
        // Give the loop time to process the second queued chunk.
        assert_no_event_for(&mut h.verdict_rx, Duration::from_millis(100));

        h.running.store(false, Ordering::SeqCst);
        handle.join().expect("pipeline thread panicked");

        assert_eq!(h.calls.load(Ordering::Relaxed), 1);
        let snap = h.diagnostics.snapshot();
        assert_eq!(snap.inference_calls, 1);
        assert_eq!(snap.rate_limited, 1);
    }

    #[test]
    fn inference_error_drops_cycle_and_loop_continues() {
        let (mut producer, consumer) = create_audio_ring();
        producer.push_slice(&vec![0.2; 960]);
        producer.push_slice(&vec![0.2; 960]);

        let mut h = harness(
            base_config(),
            vec![ScriptStep::Fail, ScriptStep::Scores(speech_scores())],
            consumer,
        );
        let ctx = h.ctx;
        let handle = thread::spawn(move || run(ctx));

        // The first cycle fails silently; the second produces the verdict.
        let event = recv_event_with_timeout(&mut h.verdict_rx, Duration::from_secs(1));
        h.running.store(false, Ordering::SeqCst);
        handle.join().expect("pipeline thread panicked");

        assert!(event.verdict.is_safe);
        assert_eq!(h.calls.load(Ordering::Relaxed), 2);
        let snap = h.diagnostics.snapshot();
        assert_eq!(snap.inference_errors, 1);
        assert_eq!(snap.verdicts_emitted, 1);
    }

    #[test]
    fn session_mode_emits_majority_summary_on_stop() {
        let (mut producer, consumer) = create_audio_ring();
        producer.push_slice(&vec![0.2; 960]);
        producer.push_slice(&vec![0.2; 960]);
        producer.push_slice(&vec![0.2; 960]);

        let mut cfg = base_config();
        cfg.mode = EngineMode::Session;

        // Two safe cycles, one silent (flat scores → unsafe cycle).
        let mut h = harness(
            cfg,
            vec![
                ScriptStep::Scores(speech_scores()),
                ScriptStep::Scores(speech_scores()),
                ScriptStep::Scores(flat_scores()),
            ],
            consumer,
        );
        let ctx = h.ctx;
        let handle = thread::spawn(move || run(ctx));

        for _ in 0..3 {
            let _ = recv_event_with_timeout(&mut h.verdict_rx, Duration::from_secs(1));
        }
        h.running.store(false, Ordering::SeqCst);
        handle.join().expect("pipeline thread panicked");

        let summary = recv_event_with_timeout(&mut h.session_rx, Duration::from_secs(1));
        assert_eq!(summary.outcome.verdict, SessionVerdict::Safe);
        assert_eq!(summary.outcome.cycles, 3);
        assert_eq!(summary.outcome.safe_cycles, 2);
    }

    #[test]
    fn session_with_no_cycles_reports_no_audio() {
        let (_producer, consumer) = create_audio_ring();

        let mut cfg = base_config();
        cfg.mode = EngineMode::Session;

        let mut h = harness(cfg, vec![], consumer);
        let ctx = h.ctx;
        let handle = thread::spawn(move || run(ctx));

        thread::sleep(Duration::from_millis(30));
        h.running.store(false, Ordering::SeqCst);
        handle.join().expect("pipeline thread panicked");

        let summary = recv_event_with_timeout(&mut h.session_rx, Duration::from_secs(1));
        assert_eq!(summary.outcome.verdict, SessionVerdict::NoAudio);
        assert!(!summary.outcome.is_safe());
        assert_eq!(h.calls.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn continuous_mode_emits_no_session_summary() {
        let (mut producer, consumer) = create_audio_ring();
        producer.push_slice(&vec![0.2; 960]);

        let mut h = harness(base_config(), vec![ScriptStep::Scores(speech_scores())], consumer);
        let ctx = h.ctx;
        let handle = thread::spawn(move || run(ctx));

        let _ = recv_event_with_timeout(&mut h.verdict_rx, Duration::from_secs(1));
        h.running.store(false, Ordering::SeqCst);
        handle.join().expect("pipeline thread panicked");

        assert_no_event_for(&mut h.session_rx, Duration::from_millis(100));
    }

    #[test]
    fn quiet_stream_yields_silence_verdicts() {
        let (mut producer, consumer) = create_audio_ring();
        producer.push_slice(&vec![0.0; 960]);

        let mut h = harness(base_config(), vec![ScriptStep::Scores(flat_scores())], consumer);
        let ctx = h.ctx;
        let handle = thread::spawn(move || run(ctx));

        let event = recv_event_with_timeout(&mut h.verdict_rx, Duration::from_secs(1));
        h.running.store(false, Ordering::SeqCst);
        handle.join().expect("pipeline thread panicked");

        assert!(event.verdict.is_silence);
        assert!(!event.verdict.is_safe);
    }
}
