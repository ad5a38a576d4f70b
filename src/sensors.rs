//! Sensors module.
//!
use anyhow::{anyhow, Result};
use image::RgbImage;
use rscam::{Camera, Config};

/// Pixel format requested from the camera. MJPG is decoded to RGB before the
/// frame enters the pipeline.
const CAPTURE_FORMAT: &[u8] = b"MJPG";

pub type CaptureFn = Box<dyn Fn() -> Option<RgbImage> + Send + Sync>;

/// Camera device selection and capture parameters.
#[derive(Clone, Debug)]
pub struct CameraSettings {
    pub device: String,
    /// Capture resolution; the maximum supported one when `None`.
    pub resolution: Option<(u32, u32)>,
    /// Frames per second; the maximum supported rate when `None`.
    pub fps: Option<u32>,
}

/// Get a capture function to a video device on a Linux machine.
///
/// The returned closure yields decoded RGB frames and `None` on read
/// failures. Dropping the closure releases the device.
pub fn get_capture_fn(settings: &CameraSettings) -> Result<CaptureFn> {
    let mut cam = Camera::new(&settings.device)?;
    log_supported_formats(&cam);

    log::info!("Using camera {}", &settings.device);

    let resolution = settings
        .resolution
        .map(Ok)
        .unwrap_or_else(|| get_max_resolution(&cam, CAPTURE_FORMAT))?;

    let interval = match settings.fps {
        Some(fps) => (1, fps),
        None => get_max_frame_rate(&cam, CAPTURE_FORMAT, resolution)?,
    };

    cam.start(&Config {
        interval,
        resolution,
        format: CAPTURE_FORMAT,
        ..Default::default()
    })?;

    let callback = move || {
        let frame = cam.capture().ok()?;
        decode_frame(&frame[..])
    };
    Ok(Box::new(callback))
}

/// Decode one captured MJPG frame into an RGB bitmap.
fn decode_frame(data: &[u8]) -> Option<RgbImage> {
    image::load_from_memory(data).ok().map(|img| img.to_rgb8())
}

/// Get the maximum supported resolution for the capture format.
fn get_max_resolution(cam: &Camera, format: &[u8]) -> Result<(u32, u32)> {
    let resolution_info = cam.resolutions(format)?;
    log::debug!("Found resolutions: {:?}", &resolution_info);
    match resolution_info {
        rscam::ResolutionInfo::Discretes(resolutions) => resolutions
            .iter()
            // Highest resolution in terms of number of pixels
            .map(|res| (res, res.0 * res.1))
            .max_by(|a, b| a.1.cmp(&b.1))
            .map(|res| *res.0),
        rscam::ResolutionInfo::Stepwise {
            min: _,
            max,
            step: _,
        } => Some(max),
    }
    .ok_or_else(|| anyhow!("no resolution found"))
}

/// Get the maximum supported frame rate for the capture format and resolution.
fn get_max_frame_rate(cam: &Camera, format: &[u8], resolution: (u32, u32)) -> Result<(u32, u32)> {
    let interval_info = cam.intervals(format, resolution)?;
    log::debug!("Found frame rates: {:?}", &interval_info);
    match interval_info {
        rscam::IntervalInfo::Discretes(frame_rates) => frame_rates
            .iter()
            .map(|(denominator, numerator)| ((denominator, numerator), numerator / denominator))
            .max_by(|a, b| a.1.cmp(&b.1))
            .map(|((&d, &n), _)| (d, n)),
        rscam::IntervalInfo::Stepwise {
            min: _,
            max,
            step: _,
        } => Some(max),
    }
    .ok_or_else(|| anyhow!("no frame rate found"))
}

fn log_supported_formats(cam: &Camera) {
    let formats: Vec<_> = cam.formats().map(|fmt| fmt.ok()).collect();
    log::debug!(
        "Supported formats: {:?}, using format {:?}",
        formats,
        CAPTURE_FORMAT
    );
}
