use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use wake_engine::audio::mic::CpalTakeRecorder;
use wake_engine::inference::onnx::OnnxModelProvider;
use wake_engine::{logging, ChannelListener, EngineEvent, EngineTuning, WakeConfig, WakeEngine};

#[derive(Parser)]
#[command(name = "wake-listen")]
#[command(about = "Listen on the default microphone and report wake word detections")]
struct Args {
    /// Directory holding melspectrogram.onnx, embedding_model.onnx and the classifier
    #[arg(short, long, default_value = "models")]
    model_dir: PathBuf,

    /// Classifier model file inside the model directory
    #[arg(short, long, default_value = "hey_jarvis_v0.1.onnx")]
    classifier: String,

    /// JSON config file (enabled, sensitivity, continuousMode)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the configured sensitivity (0.0 - 1.0)
    #[arg(short, long)]
    sensitivity: Option<f32>,

    /// Feature model emits several mel rows per 80 ms sub-frame
    #[arg(long)]
    multi_row_features: bool,

    /// Emit JSON logs
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    logging::init_tracing(args.json_logs);

    let mut config = match &args.config {
        Some(path) => WakeConfig::load_from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => WakeConfig::default(),
    };
    if let Some(sensitivity) = args.sensitivity {
        config.sensitivity = sensitivity;
        config.validate()?;
    }

    let (listener, events) = ChannelListener::new();
    let engine = WakeEngine::new(
        config,
        EngineTuning {
            multi_row_features: args.multi_row_features,
            ..EngineTuning::default()
        },
        Arc::new(CpalTakeRecorder::new()),
        Arc::new(OnnxModelProvider::new(args.model_dir.clone(), args.classifier.clone())),
        Arc::new(listener),
    );

    let printer = std::thread::spawn(move || {
        for event in events {
            match event {
                EngineEvent::Detected { score } => println!(">>> DETECTED (score: {score:.3})"),
                EngineEvent::Error(message) => eprintln!("engine error: {message}"),
            }
        }
    });

    engine.start().await.context("starting wake engine")?;
    info!(
        model_dir = %args.model_dir.display(),
        classifier = %args.classifier,
        sensitivity = config.sensitivity,
        "listening (Ctrl+C to quit)"
    );

    tokio::signal::ctrl_c().await.context("waiting for Ctrl+C")?;
    engine.shutdown().await;

    let summary = serde_json::to_string_pretty(&engine.metrics().summary())?;
    println!("{summary}");

    drop(engine);
    let _ = printer.join();
    Ok(())
}
