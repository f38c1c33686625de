//! Sensors module.
//!
use anyhow::{anyhow, Result};
use bytes::Bytes;
use rscam::{Camera, Config};

/// Frames are captured as Motion-JPEG so every frame is a complete JPEG image.
const FORMAT: &[u8] = b"MJPG";

/// Capture function of an opened camera. Returns `None` when a frame cannot be read.
pub type CaptureFn = Box<dyn FnMut() -> Option<Bytes>>;

/// Camera settings.
#[derive(Clone, Debug)]
pub struct CameraConfig {
    pub device: String,
    /// `(width, height)`, the maximum supported one if unset.
    pub resolution: Option<(u32, u32)>,
    /// Frame interval as `(numerator, denominator)` seconds, the fastest supported one if unset.
    pub interval: Option<(u32, u32)>,
}

/// Open a video device on a Linux machine and get its capture function.
///
/// The device stays open until the capture function is dropped.
pub fn get_capture_fn_linux(config: &CameraConfig) -> Result<CaptureFn> {
    let mut cam = Camera::new(&config.device)?;
    log_supported_formats(&cam);

    log::info!("Using camera {}", &config.device);

    let resolution = config
        .resolution
        .map(Ok)
        .unwrap_or_else(|| get_max_resolution(&cam))?;

    let interval = config
        .interval
        .map(Ok)
        .unwrap_or_else(|| get_min_interval(&cam, resolution))?;

    log::info!(
        "Capturing {}x{} at {}/{} s per frame",
        resolution.0,
        resolution.1,
        interval.0,
        interval.1
    );

    cam.start(&Config {
        interval,
        resolution,
        format: FORMAT,
        ..Default::default()
    })?;

    let callback = move || match cam.capture() {
        Ok(frame) => Some(Bytes::copy_from_slice(&frame[..])),
        Err(err) => {
            log::error!("Error capturing frame: {}", err);
            None
        }
    };
    Ok(Box::new(callback))
}

/// Get the maximum supported resolution.
fn get_max_resolution(cam: &Camera) -> Result<(u32, u32)> {
    let resolution_info = cam.resolutions(FORMAT)?;
    log::debug!("Found resolutions: {:?}", &resolution_info);
    match resolution_info {
        rscam::ResolutionInfo::Discretes(resolutions) => resolutions
            .iter()
            // Get the highest resolution in terms of number of pixels
            .max_by_key(|res| res.0 * res.1)
            .copied(),
        rscam::ResolutionInfo::Stepwise { max, .. } => Some(max),
    }
    .ok_or_else(|| anyhow!("No resolution found"))
}

/// Get the shortest supported frame interval for the given resolution.
fn get_min_interval(cam: &Camera, resolution: (u32, u32)) -> Result<(u32, u32)> {
    let interval_info = cam.intervals(FORMAT, resolution)?;
    log::debug!("Found frame intervals: {:?}", &interval_info);
    match interval_info {
        rscam::IntervalInfo::Discretes(intervals) => intervals
            .iter()
            // Intervals are fractions of seconds, the highest frame rate has the smallest one
            .min_by(|a, b| (a.0 as f64 / a.1 as f64).total_cmp(&(b.0 as f64 / b.1 as f64)))
            .copied(),
        rscam::IntervalInfo::Stepwise { min, .. } => Some(min),
    }
    .ok_or_else(|| anyhow!("No frame interval found"))
}

fn log_supported_formats(cam: &Camera) {
    let formats: Vec<_> = cam.formats().filter_map(|fmt| fmt.ok()).collect();
    log::debug!(
        "Supported formats: {:?}, using format {:?}",
        formats,
        String::from_utf8_lossy(FORMAT)
    );
}
