use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{anyhow, Result};
use axum::{
    body::Body,
    http::{header, Request, StatusCode},
};
use bytes::Bytes;
use common::InferModel;
use detect_server::{
    app,
    feed::{Annotator, FrameReceiver, OpenCamera, VideoFeed},
    nn::Detection,
    sensors::CaptureFn,
};
use hyper::body::HttpBody;
use image::{Rgb, RgbImage};
use tokio::{sync::broadcast::error::RecvError, time::timeout};
use tower::ServiceExt;

const PART_HEADER: &[u8] = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n";
const WAIT: Duration = Duration::from_secs(5);

/// Detector that finds one person in the middle of every frame.
struct FixedDetector;

impl InferModel for FixedDetector {
    type Output = Vec<Detection>;

    fn run(&self, _input: &RgbImage) -> Result<Vec<Detection>> {
        Ok(vec![
            Detection {
                bbox: [0.25, 0.25, 0.75, 0.75],
                confidence: 0.9,
                class_id: 0,
            },
            Detection {
                bbox: [0.1, 0.1, 0.2, 0.2],
                confidence: 0.8,
                class_id: 5,
            },
        ])
    }
}

fn jpeg_frame() -> Bytes {
    let image = RgbImage::from_pixel(64, 48, Rgb([30, 120, 60]));
    let buf = turbojpeg::compress_image(&image, 90, turbojpeg::Subsamp::Sub2x2).unwrap();
    Bytes::copy_from_slice(&buf)
}

fn annotator() -> Annotator {
    Annotator::new(FixedDetector, 0, "People Count".into(), None, 90)
}

/// Camera delivering `num_frames` frames before failing to read.
fn finite_camera(num_frames: usize) -> OpenCamera {
    Box::new(move || {
        let mut remaining = num_frames;
        let frame = jpeg_frame();
        let capture: CaptureFn = Box::new(move || {
            if remaining == 0 {
                return None;
            }
            remaining -= 1;
            Some(frame.clone())
        });
        Ok(capture)
    })
}

fn broken_camera() -> OpenCamera {
    Box::new(|| Err(anyhow!("Could not open /dev/video0")))
}

/// Sets its flag when the camera is released.
struct CameraHandle(Arc<AtomicBool>);

impl Drop for CameraHandle {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Camera that never runs out of frames, counting how often it is opened.
fn endless_camera(opened: Arc<AtomicUsize>, released: Arc<AtomicBool>) -> OpenCamera {
    Box::new(move || {
        opened.fetch_add(1, Ordering::SeqCst);
        released.store(false, Ordering::SeqCst);
        let handle = CameraHandle(released.clone());
        let frame = jpeg_frame();
        let capture: CaptureFn = Box::new(move || {
            let _handle = &handle;
            std::thread::sleep(Duration::from_millis(5));
            Some(frame.clone())
        });
        Ok(capture)
    })
}

async fn next_frame(rx: &mut FrameReceiver) -> Option<Bytes> {
    loop {
        match rx.recv().await {
            Ok(frame) => return Some(frame),
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => return None,
        }
    }
}

fn video_feed_request() -> Request<Body> {
    Request::builder()
        .uri("/video_feed")
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn video_feed_streams_multipart_jpegs() {
    let feed = Arc::new(VideoFeed::new(finite_camera(3), annotator()));
    let response = app(feed.clone())
        .oneshot(video_feed_request())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "multipart/x-mixed-replace; boundary=frame"
    );

    let mut body = response.into_body();
    let mut num_frames = 0;
    while let Some(chunk) = timeout(WAIT, body.data()).await.unwrap() {
        let chunk = chunk.unwrap();
        assert!(chunk.starts_with(PART_HEADER));
        assert!(chunk.ends_with(b"\r\n"));

        let jpeg = &chunk[PART_HEADER.len()..chunk.len() - 2];
        let frame: RgbImage = turbojpeg::decompress_image(jpeg).unwrap();
        assert_eq!(frame.dimensions(), (64, 48));

        num_frames += 1;
    }

    // The stream ends once the camera stops delivering frames
    assert_eq!(num_frames, 3);

    let window = feed.stats().take_window(Duration::from_secs(1)).unwrap();
    assert_eq!(window.captured_fps, 3.0);
    assert_eq!(window.streamed_fps, 3.0);
    assert_eq!(window.last_count, 1);
    assert_eq!(feed.viewer_count(), 0);
}

#[tokio::test]
async fn unavailable_camera_ends_stream_without_frames() {
    let feed = Arc::new(VideoFeed::new(broken_camera(), annotator()));
    let response = app(feed.clone()).oneshot(video_feed_request()).await.unwrap();

    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "multipart/x-mixed-replace; boundary=frame"
    );

    let mut body = response.into_body();
    assert!(timeout(WAIT, body.data()).await.unwrap().is_none());
    assert!(!feed.is_active());
}

#[tokio::test]
async fn viewers_share_one_camera_which_is_released_afterwards() {
    let opened = Arc::new(AtomicUsize::new(0));
    let released = Arc::new(AtomicBool::new(false));
    let feed = Arc::new(VideoFeed::new(
        endless_camera(opened.clone(), released.clone()),
        annotator(),
    ));

    let mut rx_a = feed.subscribe();
    let mut rx_b = feed.subscribe();

    let frame_a = timeout(WAIT, next_frame(&mut rx_a)).await.unwrap().unwrap();
    let frame_b = timeout(WAIT, next_frame(&mut rx_b)).await.unwrap().unwrap();
    assert!(frame_a.starts_with(PART_HEADER));
    assert!(frame_b.starts_with(PART_HEADER));
    assert_eq!(opened.load(Ordering::SeqCst), 1);
    assert_eq!(feed.viewer_count(), 2);

    drop(rx_a);
    drop(rx_b);

    timeout(WAIT, async {
        while !released.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert!(!feed.is_active());

    // A new viewer opens the camera again
    let mut rx_c = feed.subscribe();
    assert!(timeout(WAIT, next_frame(&mut rx_c)).await.unwrap().is_some());
    assert_eq!(opened.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn healthcheck() {
    let feed = Arc::new(VideoFeed::new(broken_camera(), annotator()));
    let response = app(feed)
        .oneshot(
            Request::builder()
                .uri("/healthcheck")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
}

#[test]
fn annotated_frame_keeps_capture_resolution() {
    let annotated = annotator().process(&jpeg_frame()).unwrap();
    assert_eq!(annotated.count, 1);
    let frame: RgbImage = turbojpeg::decompress_image(&annotated.jpeg).unwrap();

    assert_eq!(frame.dimensions(), (64, 48));
    // Border of the person box turns the green background blue
    let pixel = frame[(16, 24)];
    assert!(pixel[2] > pixel[1], "unexpected pixel {:?}", pixel);
    let background = frame[(2, 40)];
    assert!(background[1] > background[2]);
}
