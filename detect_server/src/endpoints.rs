//! Endpoints of HTTP server.
//!
use std::{convert::Infallible, sync::Arc};

use axum::{
    body::StreamBody,
    http::header,
    response::{Html, IntoResponse},
    Extension,
};
use tokio_stream::{wrappers::BroadcastStream, StreamExt};

use crate::feed::VideoFeed;

/// Health check endpoint.
pub async fn healthcheck() -> &'static str {
    "healthy"
}

/// Page showing the live feed.
pub async fn index() -> Html<&'static str> {
    Html(include_str!("../resources/index.html"))
}

/// Endpoint of the annotated camera stream.
pub async fn video_feed(Extension(feed): Extension<Arc<VideoFeed>>) -> impl IntoResponse {
    log::info!("Video feed requested");

    // Subscribe to the broadcasted annotated frames, starting the camera if needed
    let rx = feed.subscribe();

    let stream = BroadcastStream::new(rx).filter_map(move |item| match item {
        Ok(frame) => {
            feed.stats().record_streamed();
            Some(Ok::<_, Infallible>(frame))
        }
        Err(err) => {
            // Slow clients skip frames instead of holding back the capture loop
            log::debug!("Client lagging behind: {}", err);
            None
        }
    });

    // Set body and headers for multipart streaming
    let body = StreamBody::new(stream);
    let headers = [(
        header::CONTENT_TYPE,
        "multipart/x-mixed-replace; boundary=frame",
    )];

    (headers, body)
}
