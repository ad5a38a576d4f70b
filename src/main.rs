//! Object detection server binary.
//!
use std::{
    net::SocketAddr,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use clap::{Parser, ValueEnum};
use detect_server::{
    endpoints::{app, AppState},
    nn::{Detector, YoloModel},
    pipeline,
    sensors::{get_capture_fn, CameraSettings},
    utils::ensure_model,
    Error,
};
use env_logger::TimestampPrecision;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Mode {
    /// Background capture/detection threads feed a shared frame slot
    Live,
    /// The camera is opened and inference runs inside each /video request
    PerRequest,
}

#[derive(Parser, Debug)]
#[clap(author, version)]
struct Args {
    /// Port on which to serve
    #[clap(short, long, default_value_t = 8080)]
    port: u16,

    /// Bind to all IP addresses
    #[clap(short, long)]
    bindall: bool,

    /// Video device to capture from
    #[clap(long, default_value = "/dev/video0")]
    device: String,

    /// Capture resolution as WIDTHxHEIGHT; the camera maximum when omitted
    #[clap(long)]
    resolution: Option<String>,

    /// Capture frame rate; the camera maximum when omitted
    #[clap(long)]
    fps: Option<u32>,

    /// Path of the ONNX detection model
    #[clap(long, default_value = "yolov8n.onnx")]
    model: PathBuf,

    /// URL to download the model from when it is missing
    #[clap(long)]
    model_url: Option<String>,

    /// Square inference input size in pixels
    #[clap(long, default_value_t = 640)]
    imgsz: u32,

    /// Minimum confidence for reported detections
    #[clap(long, default_value_t = 0.5)]
    confidence: f32,

    /// Maximum IoU between reported boxes before suppression
    #[clap(long, default_value_t = 0.5)]
    max_iou: f32,

    /// Run inference on every Kth captured frame; frames in between pass
    /// through unannotated
    #[clap(long, default_value_t = 3, value_parser = clap::value_parser!(u64).range(1..))]
    detect_every: u64,

    /// Directory for uploaded images
    #[clap(long, default_value = "uploads")]
    upload_dir: PathBuf,

    /// Path of the annotated single-image result
    #[clap(long, default_value = "static/result.jpg")]
    result_path: PathBuf,

    /// Pipeline mode for the /video stream
    #[clap(long, value_enum, default_value_t = Mode::Live)]
    mode: Mode,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    // Setup logger
    env_logger::builder()
        .format_timestamp(Some(TimestampPrecision::Millis))
        .init();

    std::fs::create_dir_all(&args.upload_dir)?;
    if let Some(parent) = args.result_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    if let Some(url) = &args.model_url {
        ensure_model(url, &args.model).await?;
    }

    let detector: Arc<dyn Detector> = Arc::new(YoloModel::load(
        &args.model,
        args.imgsz,
        args.confidence,
        args.max_iou,
    )?);

    let camera = CameraSettings {
        device: args.device.clone(),
        resolution: parse_resolution(args.resolution.as_deref())?,
        fps: args.fps,
    };

    let running = Arc::new(AtomicBool::new(true));
    let (frames, workers) = match args.mode {
        Mode::Live => {
            let capture_fn = get_capture_fn(&camera)?;
            let pipeline = pipeline::start(
                capture_fn,
                Arc::clone(&detector),
                args.detect_every,
                Arc::clone(&running),
            );
            (Some(pipeline.frames()), Some(pipeline))
        }
        Mode::PerRequest => (None, None),
    };

    let state = Arc::new(AppState {
        detector,
        upload_dir: args.upload_dir,
        result_path: args.result_path,
        camera,
        frames,
    });

    let bind_ip = if args.bindall { [0, 0, 0, 0] } else { [127, 0, 0, 1] };
    let addr = SocketAddr::from((bind_ip, args.port));
    log::info!("Serving on {addr}");

    axum::Server::bind(&addr)
        .serve(app(state).into_make_service())
        .await?;

    // Reached only once the server future completes. The flag-clear sits
    // after the blocking serve call, so on a normal exit the workers never
    // see it in time; the ordering is kept as-is instead of guessing at a
    // different shutdown story.
    running.store(false, Ordering::Relaxed);
    if let Some(pipeline) = workers {
        pipeline.join();
    }

    Ok(())
}

/// Parse a `WIDTHxHEIGHT` argument.
fn parse_resolution(arg: Option<&str>) -> Result<Option<(u32, u32)>, Error> {
    match arg {
        None => Ok(None),
        Some(s) => {
            let (width, height) = s
                .split_once('x')
                .ok_or("resolution must be WIDTHxHEIGHT")?;
            Ok(Some((width.parse()?, height.parse()?)))
        }
    }
}
