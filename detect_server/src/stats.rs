//! Throughput and people count of a video feed.
//!
use std::{
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use tokio::{task::JoinHandle, time::interval};

use crate::feed::VideoFeed;

/// Counters updated by the capture loop and the client streams of one feed.
#[derive(Debug, Default)]
pub struct FeedStats {
    captured_frames: AtomicU64,
    streamed_frames: AtomicU64,
    last_count: AtomicUsize,
}

/// Rates over one reporting window.
#[derive(Clone, Debug, PartialEq)]
pub struct StatsWindow {
    pub captured_fps: f32,
    /// Frames sent summed over all clients.
    pub streamed_fps: f32,
    /// Count of the target class on the latest annotated frame.
    pub last_count: usize,
}

impl FeedStats {
    /// Record a frame that went through the detector with `count` matches.
    pub fn record_frame(&self, count: usize) {
        self.captured_frames.fetch_add(1, Ordering::Relaxed);
        self.last_count.store(count, Ordering::Relaxed);
    }

    pub fn record_streamed(&self) {
        self.streamed_frames.fetch_add(1, Ordering::Relaxed);
    }

    /// Take the frames recorded since the last call as rates over `elapsed`.
    ///
    /// Returns `None` for an idle window.
    pub fn take_window(&self, elapsed: Duration) -> Option<StatsWindow> {
        let captured = self.captured_frames.swap(0, Ordering::Relaxed);
        let streamed = self.streamed_frames.swap(0, Ordering::Relaxed);
        if captured == 0 && streamed == 0 {
            return None;
        }

        let secs = elapsed.as_secs_f32().max(f32::EPSILON);
        Some(StatsWindow {
            captured_fps: captured as f32 / secs,
            streamed_fps: streamed as f32 / secs,
            last_count: self.last_count.load(Ordering::Relaxed),
        })
    }
}

/// Periodically log the feed's frame rates, viewers and latest count while it is in use.
pub fn spawn_stats_logger(feed: Arc<VideoFeed>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.tick().await;
        let mut window_start = Instant::now();

        loop {
            ticker.tick().await;
            let now = Instant::now();

            if let Some(window) = feed.stats().take_window(now.duration_since(window_start)) {
                log::info!(
                    "Capturing {:.2} fps, streaming {:.2} fps to {} viewers, count {}",
                    window.captured_fps,
                    window.streamed_fps,
                    feed.viewer_count(),
                    window.last_count
                );
            }
            window_start = now;
        }
    })
}
