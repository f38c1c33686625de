//! Image classification service.
//!
//! Uploaded images are stored in a scoped temporary file, resized and normalized, and passed
//! through a pretrained classification model. The most probable label is returned as JSON.
pub mod endpoints;
pub mod nn;
pub mod uploads;

use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Extension, Router,
};

use crate::endpoints::{healthcheck, index, predict, ClassifyState};

/// Build the HTTP router with all endpoints of the classification service.
pub fn app(state: Arc<ClassifyState>, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/healthcheck", get(healthcheck))
        .route("/predict", post(predict))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(Extension(state))
}
