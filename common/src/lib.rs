//! Code shared between `classify_server` and `detect_server`.
pub mod model;
pub mod utils;

use env_logger::TimestampPrecision;
use image::RgbImage;

/// A pretrained model that runs inference on a single image.
pub trait InferModel {
    type Output;

    fn run(&self, input: &RgbImage) -> anyhow::Result<Self::Output>;
}

/// Setup the logger with millisecond timestamps, filtered by `RUST_LOG`.
pub fn init_logger() {
    env_logger::builder()
        .format_timestamp(Some(TimestampPrecision::Millis))
        .init();
}
