//! Console display sink for the Auris engine.
//!
//! Live mode subscribes to the engine's broadcast channels and prints one
//! line per verdict; `--wav` replays a recording offline through the same
//! window/decision path, gated by stream time instead of wall time.

use std::path::{Path, PathBuf};
use std::time::Duration;

use auris_core::{
    audio::{device::list_input_devices, resample::RateConverter},
    buffering::{chunk::AudioChunk, window::SlidingWindow},
    classify::{stub::StubClassifier, ClassifierHandle},
    decision::{normalize_peak, Verdict},
    session::SessionLog,
    AurisEngine, EngineConfig, EngineMode,
};
use tracing::info;

#[derive(Debug)]
struct Args {
    device: Option<String>,
    list_devices: bool,
    wav: Option<PathBuf>,
    session: bool,
    model: Option<PathBuf>,
    duration_secs: Option<u64>,
}

fn parse_args() -> Result<Args, String> {
    let mut args = Args {
        device: None,
        list_devices: false,
        wav: None,
        session: false,
        model: None,
        duration_secs: None,
    };

    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--device" => {
                let Some(v) = it.next() else {
                    return Err("missing value for --device".into());
                };
                args.device = Some(v);
            }
            "--list-devices" => {
                args.list_devices = true;
            }
            "--wav" => {
                let Some(v) = it.next() else {
                    return Err("missing value for --wav".into());
                };
                args.wav = Some(PathBuf::from(v));
            }
            "--session" => {
                args.session = true;
            }
            "--model" => {
                let Some(v) = it.next() else {
                    return Err("missing value for --model".into());
                };
                args.model = Some(PathBuf::from(v));
            }
            "--duration" => {
                let Some(v) = it.next() else {
                    return Err("missing value for --duration".into());
                };
                args.duration_secs =
                    Some(v.parse::<u64>().map_err(|_| "invalid value for --duration")?);
            }
            "--help" | "-h" => {
                println!(
                    "Usage: cargo run -p auris-core --bin monitor -- \\
  [--device <name>] [--session] [--duration <secs>] \\
  [--model <yamnet.onnx>] [--wav <file>] [--list-devices]"
                );
                std::process::exit(0);
            }
            other => {
                return Err(format!("unknown argument: {other}"));
            }
        }
    }
    Ok(args)
}

fn build_classifier(model: Option<PathBuf>) -> Result<ClassifierHandle, String> {
    match model {
        None => Ok(ClassifierHandle::new(StubClassifier::new())),
        #[cfg(feature = "onnx")]
        Some(path) => {
            use auris_core::{OnnxClassifier, OnnxClassifierConfig};
            Ok(ClassifierHandle::new(OnnxClassifier::new(
                OnnxClassifierConfig { model_path: path },
            )))
        }
        #[cfg(not(feature = "onnx"))]
        Some(_) => Err("--model requires the 'onnx' feature".into()),
    }
}

fn read_wav_mono_f32(path: &Path) -> Result<(Vec<f32>, u32), String> {
    let mut reader = hound::WavReader::open(path).map_err(|e| e.to_string())?;
    let spec = reader.spec();
    let channels = usize::from(spec.channels.max(1));

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .map(|s| s.map_err(|e| e.to_string()))
            .collect::<Result<Vec<_>, _>>()?,
        hound::SampleFormat::Int => {
            if spec.bits_per_sample <= 16 {
                reader
                    .samples::<i16>()
                    .map(|s| {
                        s.map(|v| (v as f32) / (i16::MAX as f32))
                            .map_err(|e| e.to_string())
                    })
                    .collect::<Result<Vec<_>, _>>()?
            } else {
                let max = ((1_i64 << (spec.bits_per_sample - 1)) - 1) as f32;
                reader
                    .samples::<i32>()
                    .map(|s| s.map(|v| (v as f32) / max).map_err(|e| e.to_string()))
                    .collect::<Result<Vec<_>, _>>()?
            }
        }
    };

    if channels == 1 {
        return Ok((interleaved, spec.sample_rate));
    }

    let mut mono = Vec::with_capacity(interleaved.len() / channels);
    for frame in interleaved.chunks(channels) {
        let sum = frame.iter().copied().sum::<f32>();
        mono.push(sum / channels as f32);
    }
    Ok((mono, spec.sample_rate))
}

/// Replay a WAV file through the window/decision path.
///
/// The inference gate runs on stream time: one classification per 150 ms of
/// audio once the window is primed, mirroring the live pipeline's cadence.
fn run_wav(path: &Path, classifier: ClassifierHandle, cfg: &EngineConfig) -> Result<(), String> {
    let (samples, source_rate) = read_wav_mono_f32(path)?;
    println!(
        "replaying {:?}: {} samples at {} Hz",
        path,
        samples.len(),
        source_rate
    );

    if let Err(e) = classifier.0.lock().warm_up() {
        return Err(format!("classifier failed to load: {e}"));
    }

    let mut converter = RateConverter::new(source_rate, cfg.target_sample_rate, 960)
        .map_err(|e| e.to_string())?;
    let mut window = SlidingWindow::new(cfg.window_samples);
    let mut session = SessionLog::new();

    let hop_samples =
        (cfg.target_sample_rate as u128 * cfg.min_infer_interval.as_millis() / 1000) as usize;
    let mut samples_since_infer = usize::MAX; // first primed window classifies immediately

    for chunk in samples.chunks(960) {
        let resampled = converter.process(chunk);
        if resampled.is_empty() {
            continue;
        }
        samples_since_infer = samples_since_infer.saturating_add(resampled.len());
        window.extend(&resampled);

        let Some(tail) = window.latest() else {
            continue;
        };
        if samples_since_infer < hop_samples {
            continue;
        }
        samples_since_infer = 0;

        let mut frame = tail.to_vec();
        let peak = normalize_peak(&mut frame);
        let frame = AudioChunk::new(frame, cfg.target_sample_rate);

        match classifier.0.lock().scores(&frame) {
            Ok(scores) => {
                let verdict = Verdict::derive(&scores, peak, &cfg.decision);
                session.record(verdict.is_safe);
                println!("[{:>5} cycles] {}", session.cycles(), verdict.summary());
            }
            Err(e) => {
                eprintln!("inference error (cycle dropped): {e}");
            }
        }
    }

    let outcome = session.outcome();
    println!(
        "session verdict: {:?} ({}/{} cycles safe)",
        outcome.verdict, outcome.safe_cycles, outcome.cycles
    );
    Ok(())
}

async fn run_live(args: Args) -> Result<(), String> {
    let classifier = build_classifier(args.model)?;

    let config = EngineConfig {
        mode: if args.session {
            EngineMode::Session
        } else {
            EngineMode::Continuous
        },
        ..EngineConfig::default()
    };

    let engine = AurisEngine::new(config, classifier);

    if let Err(e) = engine.warm_up() {
        // Fatal: the loop never starts. Leave the message on screen.
        return Err(format!("classifier failed to load: {e}"));
    }

    let mut verdict_rx = engine.subscribe_verdicts();
    let mut status_rx = engine.subscribe_status();
    let mut session_rx = engine.subscribe_sessions();

    engine
        .start_with_device(args.device)
        .map_err(|e| format!("could not start capture: {e}"))?;

    println!("listening — ctrl-c to stop");

    let deadline = args
        .duration_secs
        .map(|secs| tokio::time::Instant::now() + Duration::from_secs(secs));
    let sleep_forever = Duration::from_secs(60 * 60 * 24);

    loop {
        let until_deadline = deadline
            .map(|d| d.saturating_duration_since(tokio::time::Instant::now()))
            .unwrap_or(sleep_forever);

        tokio::select! {
            event = verdict_rx.recv() => {
                if let Ok(event) = event {
                    println!("[{:>6}] {}", event.seq, event.verdict.summary());
                }
            }
            event = status_rx.recv() => {
                if let Ok(event) = event {
                    match event.detail {
                        Some(detail) => println!("status: {:?} — {detail}", event.status),
                        None => println!("status: {:?}", event.status),
                    }
                }
            }
            _ = tokio::time::sleep(until_deadline) => {
                info!("duration elapsed — stopping");
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                println!();
                break;
            }
        }
    }

    engine.stop().map_err(|e| e.to_string())?;

    if args.session {
        match tokio::time::timeout(Duration::from_secs(2), session_rx.recv()).await {
            Ok(Ok(summary)) => {
                println!(
                    "session verdict: {:?} ({}/{} cycles safe)",
                    summary.outcome.verdict, summary.outcome.safe_cycles, summary.outcome.cycles
                );
            }
            _ => eprintln!("no session summary received"),
        }
    }

    let snap = engine.pipeline_diagnostics_snapshot();
    println!(
        "diagnostics: {} frames in, {} inference calls ({} errors, {} rate-limited), {} verdicts",
        snap.frames_in,
        snap.inference_calls,
        snap.inference_errors,
        snap.rate_limited,
        snap.verdicts_emitted
    );
    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "auris=warn".parse().unwrap()),
        )
        .init();

    let args = match parse_args() {
        Ok(a) => a,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    if args.list_devices {
        let devices = list_input_devices();
        if devices.is_empty() {
            println!("no input devices found");
            return;
        }
        for d in devices {
            let mut tags = Vec::new();
            if d.is_default {
                tags.push("default");
            }
            if d.is_recommended {
                tags.push("recommended");
            }
            if d.is_loopback_like {
                tags.push("loopback?");
            }
            if tags.is_empty() {
                println!("  {}", d.name);
            } else {
                println!("  {} [{}]", d.name, tags.join(", "));
            }
        }
        return;
    }

    let result = if let Some(wav) = args.wav.clone() {
        let classifier = match build_classifier(args.model.clone()) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("{e}");
                std::process::exit(1);
            }
        };
        let config = EngineConfig::default();
        run_wav(&wav, classifier, &config)
    } else {
        run_live(args).await
    };

    if let Err(e) = result {
        eprintln!("{e}");
        std::process::exit(1);
    }
}
