//! Live detection feed.
//!
//! A single capture loop per camera reads frames, runs the detector, draws the detections and
//! broadcasts the JPEG-encoded result to every connected client. The camera is opened when the
//! first client subscribes and released as soon as no client is left or capturing fails.
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Result;
use bytes::Bytes;
use common::InferModel;
use image::RgbImage;
use rusttype::Font;
use tokio::sync::broadcast;

use crate::{annotate::count_and_draw, nn::Detection, sensors::CaptureFn, stats::FeedStats};

/// Number of frames a slow client may fall behind before it skips frames.
const FRAME_BUFFER: usize = 4;

pub type FrameSender = broadcast::Sender<Bytes>;
pub type FrameReceiver = broadcast::Receiver<Bytes>;

/// Opens the camera and hands out its capture function.
pub type OpenCamera = Box<dyn Fn() -> Result<CaptureFn> + Send + Sync>;

type Detector = dyn InferModel<Output = Vec<Detection>> + Send + Sync;

/// Wrap a JPEG image as one part of a `multipart/x-mixed-replace; boundary=frame` stream.
pub fn as_jpeg_stream_item(data: &[u8]) -> Bytes {
    Bytes::copy_from_slice(
        &[
            "--frame\r\nContent-Type: image/jpeg\r\n\r\n".as_bytes(),
            data,
            "\r\n".as_bytes(),
        ]
        .concat(),
    )
}

/// JPEG-encoded annotated frame.
pub struct AnnotatedFrame {
    pub jpeg: Vec<u8>,
    /// Number of detections of the target class.
    pub count: usize,
}

/// Detects objects on a frame, counts and draws those of one class and encodes the result.
pub struct Annotator {
    detector: Box<Detector>,
    target_class: usize,
    label: String,
    font: Option<Font<'static>>,
    jpeg_quality: i32,
}

impl Annotator {
    pub fn new(
        detector: impl InferModel<Output = Vec<Detection>> + Send + Sync + 'static,
        target_class: usize,
        label: String,
        font: Option<Font<'static>>,
        jpeg_quality: i32,
    ) -> Self {
        Self {
            detector: Box::new(detector),
            target_class,
            label,
            font,
            jpeg_quality,
        }
    }

    /// Decode a captured JPEG frame, annotate it at its original resolution and encode it again.
    pub fn process(&self, jpeg: &[u8]) -> Result<AnnotatedFrame> {
        let mut frame: RgbImage = turbojpeg::decompress_image(jpeg)?;

        let detections = self.detector.run(&frame)?;
        let count = count_and_draw(
            &mut frame,
            &detections,
            self.target_class,
            &self.label,
            self.font.as_ref(),
        );
        log::debug!("{}: {} of {} detections", &self.label, count, detections.len());

        let buf = turbojpeg::compress_image(&frame, self.jpeg_quality, turbojpeg::Subsamp::Sub2x2)?;
        Ok(AnnotatedFrame {
            jpeg: buf.to_vec(),
            count,
        })
    }
}

/// Shared handle to the annotated camera stream.
pub struct VideoFeed {
    open_camera: OpenCamera,
    annotator: Annotator,
    /// Sender of the running capture loop, if any.
    active: Mutex<Option<FrameSender>>,
    /// Held by a capture loop for as long as it has the camera open.
    device: Mutex<()>,
    stats: FeedStats,
}

impl VideoFeed {
    pub fn new(open_camera: OpenCamera, annotator: Annotator) -> Self {
        Self {
            open_camera,
            annotator,
            active: Mutex::new(None),
            device: Mutex::new(()),
            stats: FeedStats::default(),
        }
    }

    pub fn stats(&self) -> &FeedStats {
        &self.stats
    }

    /// Subscribe to annotated frames, starting the capture loop if it is not running.
    ///
    /// The receiver reports `Closed` once the camera cannot be opened or stops delivering frames.
    pub fn subscribe(self: &Arc<Self>) -> FrameReceiver {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = active.as_ref() {
            log::debug!("Joining running capture ({} viewers)", tx.receiver_count());
            return tx.subscribe();
        }

        let (tx, rx) = broadcast::channel(FRAME_BUFFER);
        *active = Some(tx.clone());

        let feed = Arc::clone(self);
        tokio::task::spawn_blocking(move || feed.run_capture(tx));

        rx
    }

    /// Whether a capture loop is currently running.
    pub fn is_active(&self) -> bool {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Number of clients subscribed to the running capture loop.
    pub fn viewer_count(&self) -> usize {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(0, |tx| tx.receiver_count())
    }

    fn run_capture(&self, tx: FrameSender) {
        // Wait for a previous loop to release the camera
        let _device = self.device.lock().unwrap_or_else(PoisonError::into_inner);

        let mut capture = match (self.open_camera)() {
            Ok(capture) => capture,
            Err(err) => {
                log::error!("Could not access the camera: {:#}", err);
                self.deactivate();
                return;
            }
        };
        log::info!("Camera opened");

        loop {
            let Some(jpeg) = capture() else {
                log::error!("Unable to capture video frame, stopping stream");
                self.deactivate();
                break;
            };

            match self.annotator.process(&jpeg) {
                Ok(frame) => {
                    self.stats.record_frame(frame.count);
                    tx.send(as_jpeg_stream_item(&frame.jpeg)).ok();
                }
                Err(err) => log::warn!("Dropping frame: {:#}", err),
            }

            if self.deactivate_if_unwatched(&tx) {
                log::info!("No viewers left, releasing camera");
                break;
            }
        }
    }

    /// Forget the running loop if nobody is subscribed. Checked under the lock that
    /// `subscribe` takes, so no new viewer can join a loop that is about to stop.
    fn deactivate_if_unwatched(&self, tx: &FrameSender) -> bool {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if tx.receiver_count() == 0 {
            *active = None;
            true
        } else {
            false
        }
    }

    fn deactivate(&self) {
        *self.active.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}
