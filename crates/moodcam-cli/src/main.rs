use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use moodcam_core::annotator::DEFAULT_FONT_PATH;
use moodcam_core::{FramePipeline, ModelArtifacts};
use moodcam_hw::{Camera, CaptureSession, ExclusiveDevice, SystemClock, V4lOpener};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "moodcam", about = "moodcam emotion annotation diagnostics")]
struct Cli {
    /// Directory holding the cascade XML and emotion ONNX model
    #[arg(long, global = true)]
    model_dir: Option<PathBuf>,
    /// Font used for label text
    #[arg(long, global = true)]
    font: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List V4L2 capture devices
    Devices,
    /// Label the faces in a still image
    Detect {
        /// Input image (any format the image crate reads)
        image: PathBuf,
        /// Write the annotated JPEG here
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Capture one frame from the camera and annotate it
    Snapshot {
        #[arg(short, long)]
        output: PathBuf,
        #[arg(long, default_value = "/dev/video0")]
        device: String,
        #[arg(long, default_value_t = 640)]
        width: u32,
        #[arg(long, default_value_t = 480)]
        height: u32,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Devices => {
            let devices = Camera::list_devices();
            if devices.is_empty() {
                println!("No capture devices found");
            }
            for d in devices {
                println!("{}  {} ({}, {})", d.path, d.name, d.driver, d.bus);
            }
        }
        Commands::Detect { image, output } => {
            let pipeline = load_pipeline(cli.model_dir, cli.font)?;
            let frame = image::open(&image)
                .with_context(|| format!("failed to read {}", image.display()))?
                .to_rgb8();
            let processed = pipeline.process(frame)?;

            println!("{}", serde_json::to_string_pretty(&processed.faces)?);
            if let Some(path) = output {
                write_jpeg(&path, &processed.jpeg)?;
            }
        }
        Commands::Snapshot {
            output,
            device,
            width,
            height,
        } => {
            let pipeline = load_pipeline(cli.model_dir, cli.font)?;
            let camera = ExclusiveDevice::new(V4lOpener {
                path: device,
                width,
                height,
            });

            let mut session = CaptureSession::open(&camera, Arc::new(SystemClock))?;
            let frame = session.next_frame();
            session.close();

            let frame = frame?
                .into_rgb_image()
                .context("captured frame does not match its dimensions")?;
            let processed = pipeline.process(frame)?;

            println!("{}", serde_json::to_string_pretty(&processed.faces)?);
            write_jpeg(&output, &processed.jpeg)?;
        }
    }

    Ok(())
}

fn load_pipeline(model_dir: Option<PathBuf>, font: Option<PathBuf>) -> Result<FramePipeline> {
    let model_dir = model_dir
        .or_else(|| std::env::var("MOODCAM_MODEL_DIR").ok().map(PathBuf::from))
        .unwrap_or_else(moodcam_core::default_model_dir);
    let font = font
        .or_else(|| std::env::var("MOODCAM_FONT_PATH").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_FONT_PATH));

    let artifacts = ModelArtifacts::in_dir(&model_dir, font);
    FramePipeline::load(&artifacts)
        .with_context(|| format!("failed to load models from {}", model_dir.display()))
}

fn write_jpeg(path: &Path, jpeg: &[u8]) -> Result<()> {
    std::fs::write(path, jpeg).with_context(|| format!("failed to write {}", path.display()))?;
    println!("wrote {}", path.display());
    Ok(())
}
