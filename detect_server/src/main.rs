//! Detection server binary.
//!
use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Result;
use clap::Parser;
use common::{init_logger, model::ModelSource};
use detect_server::{
    annotate::load_font,
    app,
    feed::{Annotator, VideoFeed},
    nn::YoloModel,
    sensors::{get_capture_fn_linux, CameraConfig},
    stats::spawn_stats_logger,
};

#[derive(Parser, Debug)]
#[clap(author, version)]
struct Args {
    /// Address to serve HTTP on
    #[clap(long, default_value = "0.0.0.0:5001")]
    server_address: String,

    /// Path or http(s) URL of the ONNX detection model
    #[clap(long, default_value = "yolo11s.onnx")]
    model: ModelSource,

    /// Width of the detector input
    #[clap(long, default_value_t = 640)]
    input_width: u32,

    /// Height of the detector input
    #[clap(long, default_value_t = 640)]
    input_height: u32,

    /// Minimum confidence of a detection
    #[clap(long, default_value_t = 0.25)]
    min_confidence: f32,

    /// Maximum overlap of two detections of the same class
    #[clap(long, default_value_t = 0.7)]
    max_iou: f32,

    /// Class ID to count and draw, `0` is "person" for COCO models
    #[clap(long, default_value_t = 0)]
    target_class: usize,

    /// Label of the count written on the frames
    #[clap(long, default_value = "People Count")]
    count_label: String,

    /// TrueType font for the count, frames carry no text if it cannot be loaded
    #[clap(long, default_value = "/usr/share/fonts/truetype/dejavu/DejaVuSansMono.ttf")]
    font: PathBuf,

    /// Quality of the streamed JPEG frames
    #[clap(long, default_value_t = 90)]
    jpeg_quality: i32,

    /// Video device to capture from
    #[clap(long, default_value = "/dev/video0")]
    device: String,

    /// Capture width, requires --height, the maximum supported resolution if unset
    #[clap(long, requires = "height")]
    width: Option<u32>,

    /// Capture height, requires --width
    #[clap(long, requires = "width")]
    height: Option<u32>,

    /// Capture frame rate, the highest supported one if unset
    #[clap(long)]
    fps: Option<u32>,

    /// Seconds between two throughput log lines
    #[clap(long, default_value_t = 2)]
    stats_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logger();

    let model_path = args.model.fetch().await?;
    let detector = YoloModel::new(
        &model_path,
        args.input_width,
        args.input_height,
        args.min_confidence,
        args.max_iou,
    )?;

    let font = match load_font(&args.font) {
        Ok(font) => Some(font),
        Err(err) => {
            log::warn!("Drawing frames without count: {:#}", err);
            None
        }
    };

    let annotator = Annotator::new(
        detector,
        args.target_class,
        args.count_label,
        font,
        args.jpeg_quality,
    );

    let camera_config = CameraConfig {
        device: args.device,
        resolution: args.width.zip(args.height),
        interval: args.fps.map(|fps| (1, fps)),
    };
    let open_camera = Box::new(move || get_capture_fn_linux(&camera_config));

    let feed = Arc::new(VideoFeed::new(open_camera, annotator));

    spawn_stats_logger(feed.clone(), Duration::from_secs(args.stats_interval.max(1)));

    let app = app(feed);

    let addr: SocketAddr = args.server_address.parse()?;
    log::info!("Listening on {}", addr);
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await?;

    Ok(())
}
