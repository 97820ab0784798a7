use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use facewatch_core::{
    crop, decode, rotate, FaceDetector, FrameSource, PixelFormat, RawFrame, RecognitionOutcome,
    RecognitionPipeline,
};
use facewatch_models::{ArcFaceMatcher, ScrfdDetector};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod config;
mod engine;
mod registry;

use config::Config;
use engine::OwnedFrame;
use registry::RegistryStore;

#[derive(Parser)]
#[command(name = "facewatch", about = "Real-time face recognition on camera frames")]
struct Cli {
    /// Maximum accepted embedding distance
    #[arg(long, global = true)]
    threshold: Option<f32>,
    /// Directory containing det_10g.onnx and w600k_r50.onnx
    #[arg(long, global = true)]
    model_dir: Option<PathBuf>,
    /// Identity registry file
    #[arg(long, global = true)]
    registry: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Detect and match faces in an image file
    Recognize {
        image: PathBuf,
    },
    /// Enroll the most confident face in an image
    Enroll {
        /// Display name for the identity
        #[arg(short, long)]
        name: String,
        image: PathBuf,
    },
    /// List enrolled identities
    List,
    /// Remove an enrolled identity
    Remove {
        /// Identity ID to remove
        id: String,
    },
    /// Decode a raw sensor dump and save it as an image
    Decode {
        raw: PathBuf,
        #[command(flatten)]
        frame: FrameArgs,
        /// Output image path (format from extension)
        #[arg(short, long)]
        out: PathBuf,
    },
    /// Stream a directory of raw sensor dumps through the recognition worker
    Replay {
        dir: PathBuf,
        #[command(flatten)]
        frame: FrameArgs,
        /// Delay between frames, simulating the camera rate
        #[arg(long, default_value_t = 33)]
        interval_ms: u64,
        /// Process every frame instead of dropping frames while busy
        #[arg(long)]
        wait: bool,
        /// Device rotation compensation to apply before streaming
        #[arg(long, allow_hyphen_values = true)]
        compensation: Option<i32>,
    },
}

#[derive(Args, Clone, Copy)]
struct FrameArgs {
    /// Sensor pixel format: nv21, bgra, or a numeric platform code
    #[arg(long)]
    format: PixelFormat,
    #[arg(long)]
    width: u32,
    #[arg(long)]
    height: u32,
    /// First-plane row stride in bytes (BGRA only)
    #[arg(long)]
    stride: Option<usize>,
}

impl FrameArgs {
    fn raw<'a>(&self, data: &'a [u8]) -> RawFrame<'a> {
        let raw = RawFrame::new(data, self.width, self.height, self.format);
        match self.stride {
            Some(stride) => raw.with_row_stride(stride),
            None => raw,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let mut config = Config::load().context("loading configuration")?;
    if let Some(threshold) = cli.threshold {
        config.threshold = threshold;
    }
    if let Some(dir) = cli.model_dir {
        config.model_dir = dir;
    }
    if let Some(path) = cli.registry {
        config.registry_path = path;
    }

    let store = RegistryStore::new(&config.registry_path);

    match cli.command {
        Commands::Recognize { image } => recognize(&config, &store, &image),
        Commands::Enroll { name, image } => enroll(&config, &store, &name, &image),
        Commands::List => list(&store),
        Commands::Remove { id } => {
            if store.remove(&id)? {
                println!("Removed identity {id}");
            } else {
                bail!("no identity with id {id} in {}", store.path().display());
            }
            Ok(())
        }
        Commands::Decode { raw, frame, out } => decode_dump(&config, &raw, frame, &out),
        Commands::Replay { dir, frame, interval_ms, wait, compensation } => {
            let opts = ReplayOptions {
                interval: Duration::from_millis(interval_ms),
                wait,
                compensation,
            };
            replay(&config, &store, &dir, frame, opts).await
        }
    }
}

fn load_detector(config: &Config) -> Result<ScrfdDetector> {
    let detector = ScrfdDetector::load(&config.scrfd_model_path())
        .context("loading SCRFD detector")?
        .with_confidence_threshold(config.detection_confidence);
    Ok(detector)
}

fn load_matcher(config: &Config) -> Result<ArcFaceMatcher> {
    ArcFaceMatcher::load(&config.arcface_model_path()).context("loading ArcFace model")
}

fn outcome_json(outcome: &RecognitionOutcome) -> serde_json::Value {
    let mut matched: Vec<_> = outcome
        .matched
        .iter()
        .map(|r| serde_json::json!({ "id": r.id, "name": r.name }))
        .collect();
    matched.sort_by(|a, b| a["name"].as_str().cmp(&b["name"].as_str()));
    serde_json::json!({
        "any_match": outcome.any_match,
        "matched": matched,
        "last_distance": outcome.last_distance,
    })
}

fn recognize(config: &Config, store: &RegistryStore, image: &Path) -> Result<()> {
    let registry = store.load()?;
    if registry.is_empty() {
        tracing::warn!(path = %store.path().display(), "registry is empty; nothing can match");
    }

    let frame = image::open(image)
        .with_context(|| format!("opening {}", image.display()))?
        .to_rgb8();

    let mut detector = load_detector(config)?;
    let mut pipeline = RecognitionPipeline::new(load_matcher(config)?, registry, config.pipeline_config());
    let outcome = pipeline.recognize_frame(FrameSource::Decoded(frame), &mut detector)?;
    pipeline.dispose();

    println!("{}", serde_json::to_string_pretty(&outcome_json(&outcome))?);
    Ok(())
}

fn enroll(config: &Config, store: &RegistryStore, name: &str, image: &Path) -> Result<()> {
    let frame = image::open(image)
        .with_context(|| format!("opening {}", image.display()))?
        .to_rgb8();

    let mut detector = load_detector(config)?;
    let faces = detector.detect(&frame)?;
    let Some(face) = faces.first() else {
        bail!("no face detected in {}", image.display());
    };
    tracing::info!(confidence = face.confidence, faces = faces.len(), "enroll: best face selected");

    let face_crop = crop(&frame, face).context("face box outside image")?;
    let embedding = load_matcher(config)?.embed(&face_crop)?;
    let record = store.enroll(name, embedding)?;

    println!("Enrolled {} as {}", record.name, record.id);
    Ok(())
}

fn list(store: &RegistryStore) -> Result<()> {
    let records = store.load()?;
    if records.is_empty() {
        println!("No identities enrolled");
        return Ok(());
    }
    for r in &records {
        println!("{}  {}  {}", r.id, r.name, r.created_at);
    }
    Ok(())
}

fn decode_dump(config: &Config, raw: &Path, frame: FrameArgs, out: &Path) -> Result<()> {
    let data = std::fs::read(raw).with_context(|| format!("reading {}", raw.display()))?;
    let image = decode(&frame.raw(&data))?;
    let angle = config
        .rotation_policy
        .angle(config.sensor_orientation, config.rotation_compensation);
    let image = rotate(image, angle as f32);
    image
        .save(out)
        .with_context(|| format!("writing {}", out.display()))?;
    println!("Wrote {}x{} image to {} (rotated {angle}°)", image.width(), image.height(), out.display());
    Ok(())
}

struct ReplayOptions {
    interval: Duration,
    wait: bool,
    compensation: Option<i32>,
}

async fn replay(
    config: &Config,
    store: &RegistryStore,
    dir: &Path,
    frame: FrameArgs,
    opts: ReplayOptions,
) -> Result<()> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("listing {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file())
        .collect();
    paths.sort();
    if paths.is_empty() {
        bail!("no frame dumps in {}", dir.display());
    }

    let pipeline = RecognitionPipeline::new(load_matcher(config)?, store.load()?, config.pipeline_config());
    let (handle, join) = engine::spawn_engine(pipeline, load_detector(config)?, config.queue_depth)?;
    if let Some(degrees) = opts.compensation {
        handle.set_rotation_compensation(degrees).await?;
    }

    let mut pending = None;
    let mut processed = 0u64;

    for (seq, path) in paths.iter().enumerate() {
        let data = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        let owned = OwnedFrame {
            data,
            width: frame.width,
            height: frame.height,
            row_stride: frame.stride,
            format: frame.format,
            sequence: seq as u64,
        };

        if opts.wait {
            match handle.recognize(owned).await {
                Ok(outcome) => {
                    println!("frame {seq}: {}", outcome_json(&outcome));
                    processed += 1;
                }
                Err(err) => tracing::warn!(frame = seq, error = %err, "frame failed"),
            }
        } else if let Some(rx) = handle.try_submit(owned) {
            if let Some((prev_seq, prev_rx)) = pending.replace((seq, rx)) {
                processed += report(prev_seq, prev_rx).await;
            }
        }
        tokio::time::sleep(opts.interval).await;
    }

    if let Some((seq, rx)) = pending.take() {
        processed += report(seq, rx).await;
    }

    println!(
        "{} frames offered, {processed} recognized, {} dropped while busy",
        paths.len(),
        handle.dropped_frames()
    );

    drop(handle);
    tokio::task::spawn_blocking(move || join.join())
        .await?
        .map_err(|_| anyhow::anyhow!("engine thread panicked"))?;
    Ok(())
}

async fn report(
    seq: usize,
    rx: tokio::sync::oneshot::Receiver<Result<RecognitionOutcome, engine::EngineError>>,
) -> u64 {
    match rx.await {
        Ok(Ok(outcome)) => {
            println!("frame {seq}: {}", outcome_json(&outcome));
            1
        }
        Ok(Err(err)) => {
            tracing::warn!(frame = seq, error = %err, "frame failed");
            0
        }
        Err(_) => {
            tracing::warn!(frame = seq, "engine dropped the reply");
            0
        }
    }
}
