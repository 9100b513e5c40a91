//! YAMNet ONNX backend via the `ort` crate.
//!
//! Targets the TF-Hub YAMNet export converted to ONNX:
//! - input: mono f32 waveform `[n_samples]` at 16 kHz
//! - output: per-patch class scores `[n_patches, 521]`
//!
//! A 15600-sample window spans one-to-two analysis patches; patch scores
//! are averaged into the single 521-vector the decision layer consumes.
//! Tensor names vary between converter versions, so both are resolved from
//! session metadata at warm-up rather than hard-coded.

use std::path::PathBuf;

use ndarray::Array1;
use ort::session::{Session, SessionInputValue};
use ort::value::Value;
use ort::{
    ep,
    session::builder::{GraphOptimizationLevel, SessionBuilder},
};
use tracing::{debug, info, warn};

use crate::buffering::chunk::AudioChunk;
use crate::classify::{SoundClassifier, NUM_CLASSES, WINDOW_SAMPLES};
use crate::error::{AurisError, Result};

// ── Model config ─────────────────────────────────────────────────────────────

pub struct OnnxClassifierConfig {
    pub model_path: PathBuf,
}

// ── Session construction ─────────────────────────────────────────────────────

fn build_session(model_path: &PathBuf) -> Result<Session> {
    let intra_threads = std::env::var("AURIS_ORT_INTRA_THREADS")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(2)
        .clamp(1, 32);

    let builder = SessionBuilder::new()
        .map_err(|e| AurisError::OnnxSession(e.to_string()))?
        .with_intra_threads(intra_threads)
        .map_err(|e| AurisError::OnnxSession(e.to_string()))?
        .with_optimization_level(GraphOptimizationLevel::All)
        .map_err(|e| AurisError::OnnxSession(e.to_string()))?;

    info!(intra_threads, "ONNX session threading configured");

    #[cfg(target_os = "windows")]
    let builder = builder
        .with_execution_providers([
            ep::DirectML::default().with_device_id(0).build().fail_silently(),
            ep::CPU::default().build(),
        ])
        .map_err(|e| AurisError::OnnxSession(e.to_string()))?;

    #[cfg(not(target_os = "windows"))]
    let builder = builder
        .with_execution_providers([ep::CPU::default().build()])
        .map_err(|e| AurisError::OnnxSession(e.to_string()))?;

    builder
        .commit_from_file(model_path)
        .map_err(|e| AurisError::OnnxSession(e.to_string()))
}

// ── OnnxClassifier ───────────────────────────────────────────────────────────

pub struct OnnxClassifier {
    config: OnnxClassifierConfig,
    session: Option<Session>,
    input_name: String,
    output_name: String,
    call_count: u64,
}

impl OnnxClassifier {
    pub fn new(config: OnnxClassifierConfig) -> Self {
        Self {
            config,
            session: None,
            input_name: String::new(),
            output_name: String::new(),
            call_count: 0,
        }
    }

    fn run_window(&mut self, samples: Vec<f32>) -> Result<Vec<f32>> {
        let session = self.session.as_mut().ok_or_else(|| {
            AurisError::OnnxSession("model not loaded — call warm_up()".into())
        })?;

        let wave = Array1::<f32>::from(samples);
        let wave_val = Value::from_array(wave)
            .map_err(|e: ort::Error| AurisError::OnnxSession(e.to_string()))?;

        let inputs: Vec<(String, SessionInputValue<'_>)> =
            vec![(self.input_name.clone(), SessionInputValue::from(wave_val))];
        let outputs = session
            .run(inputs)
            .map_err(|e| AurisError::OnnxSession(e.to_string()))?;

        let (shape, data) = outputs[self.output_name.as_str()]
            .try_extract_tensor::<f32>()
            .map_err(|e| AurisError::OnnxSession(e.to_string()))?;

        // Output is [n_patches, 521] (or flat [521] from some converters).
        if data.len() % NUM_CLASSES != 0 || data.is_empty() {
            return Err(AurisError::ScoreLength {
                got: data.len(),
                expected: NUM_CLASSES,
            });
        }
        let patches = data.len() / NUM_CLASSES;
        debug!(dims = shape.len(), patches, "classifier output extracted");

        if patches == 1 {
            return Ok(data.to_vec());
        }

        let mut scores = vec![0f32; NUM_CLASSES];
        for patch in data.chunks_exact(NUM_CLASSES) {
            for (acc, &s) in scores.iter_mut().zip(patch) {
                *acc += s;
            }
        }
        for acc in scores.iter_mut() {
            *acc /= patches as f32;
        }
        Ok(scores)
    }
}

impl SoundClassifier for OnnxClassifier {
    fn warm_up(&mut self) -> Result<()> {
        if !self.config.model_path.is_file() {
            return Err(AurisError::ModelNotFound {
                path: self.config.model_path.clone(),
            });
        }

        info!("loading classifier from {:?}", self.config.model_path);
        let session = build_session(&self.config.model_path)?;

        info!("  inputs:");
        for input in session.inputs().iter() {
            info!("    {}", input.name());
        }
        info!("  outputs:");
        for output in session.outputs().iter() {
            info!("    {}", output.name());
        }

        self.input_name = session
            .inputs()
            .iter()
            .next()
            .map(|i| i.name().to_string())
            .ok_or_else(|| AurisError::OnnxSession("model declares no inputs".into()))?;
        self.output_name = session
            .outputs()
            .iter()
            .next()
            .map(|o| o.name().to_string())
            .ok_or_else(|| AurisError::OnnxSession("model declares no outputs".into()))?;

        self.session = Some(session);

        // Dummy forward pass to populate CPU caches and validate the
        // waveform-in/scores-out contract before the pipeline starts.
        let scores = self.run_window(vec![0f32; WINDOW_SAMPLES])?;
        if scores.len() != NUM_CLASSES {
            return Err(AurisError::ScoreLength {
                got: scores.len(),
                expected: NUM_CLASSES,
            });
        }

        info!(
            input = self.input_name.as_str(),
            output = self.output_name.as_str(),
            "classifier warm-up complete"
        );
        Ok(())
    }

    fn scores(&mut self, window: &AudioChunk) -> Result<Vec<f32>> {
        self.call_count += 1;

        let mut samples = window.samples.clone();
        if samples.len() != WINDOW_SAMPLES {
            warn!(
                got = samples.len(),
                expected = WINDOW_SAMPLES,
                "window length off-contract; padding/trimming"
            );
            samples.resize(WINDOW_SAMPLES, 0.0);
        }

        let scores = self.run_window(samples)?;
        debug!(call = self.call_count, "classifier scores computed");
        Ok(scores)
    }

    fn reset(&mut self) {
        debug!("OnnxClassifier::reset");
    }
}
