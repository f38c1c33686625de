//! Live person-detection streaming service.
pub mod annotate;
pub mod endpoints;
pub mod feed;
pub mod nn;
pub mod sensors;
pub mod stats;

use std::sync::Arc;

use axum::{routing::get, Extension, Router};
use tower_http::cors::CorsLayer;

use crate::{
    endpoints::{healthcheck, index, video_feed},
    feed::VideoFeed,
};

/// Build the HTTP router with all endpoints of the detection service.
pub fn app(feed: Arc<VideoFeed>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/healthcheck", get(healthcheck))
        .route("/video_feed", get(video_feed))
        .layer(Extension(feed))
        .layer(CorsLayer::permissive())
}
