//! Endpoints of HTTP server.
//!
use std::sync::Arc;

use axum::{
    extract::{multipart::MultipartError, Multipart},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    Extension, Json,
};
use common::InferModel;
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinError;

use crate::{nn::Prediction, uploads::UploadDir};

type Classifier = dyn InferModel<Output = Prediction> + Send + Sync;

/// Shared state of the classification endpoints.
pub struct ClassifyState {
    model: Box<Classifier>,
    uploads: UploadDir,
}

impl ClassifyState {
    pub fn new(
        model: impl InferModel<Output = Prediction> + Send + Sync + 'static,
        uploads: UploadDir,
    ) -> Self {
        Self {
            model: Box::new(model),
            uploads,
        }
    }

    /// Store the upload, decode it and run the classifier. The stored file is removed on return.
    pub fn classify_upload(&self, file_name: &str, data: &[u8]) -> Result<Prediction, PredictError> {
        let file = self.uploads.persist(file_name, data)?;
        let image = image::io::Reader::open(file.path())?
            .with_guessed_format()?
            .decode()?
            .to_rgb8();

        self.model.run(&image).map_err(PredictError::Inference)
    }
}

/// JSON body returned by `/predict`.
#[derive(Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum PredictResponse {
    Prediction {
        predicted_class: String,
        confidence: String,
    },
    Error {
        error: String,
    },
}

impl PredictResponse {
    fn error(msg: &str) -> Self {
        PredictResponse::Error { error: msg.into() }
    }
}

impl From<Prediction> for PredictResponse {
    fn from(prediction: Prediction) -> Self {
        PredictResponse::Prediction {
            confidence: prediction.confidence_percent(),
            predicted_class: prediction.predicted_class,
        }
    }
}

#[derive(Error, Debug)]
pub enum PredictError {
    #[error("failed to read upload: {0}")]
    Upload(#[from] MultipartError),
    #[error("failed to store upload: {0}")]
    Storage(#[from] std::io::Error),
    #[error("failed to decode image: {0}")]
    Decode(#[from] image::ImageError),
    #[error("inference failed: {0:#}")]
    Inference(anyhow::Error),
    #[error("inference task failed: {0}")]
    Task(#[from] JoinError),
}

impl IntoResponse for PredictError {
    fn into_response(self) -> Response {
        let status = match self {
            PredictError::Upload(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        log::warn!("Prediction failed: {}", self);
        (status, format!("Something went wrong: {}", self)).into_response()
    }
}

/// Health check endpoint.
pub async fn healthcheck() -> &'static str {
    "healthy"
}

/// Upload page.
pub async fn index() -> Html<&'static str> {
    Html(include_str!("../resources/index.html"))
}

/// Classify the image uploaded in the multipart field `file`.
pub async fn predict(
    Extension(state): Extension<Arc<ClassifyState>>,
    mut multipart: Multipart,
) -> Result<Json<PredictResponse>, PredictError> {
    let mut upload = None;
    while let Some(field) = multipart.next_field().await? {
        // Only file parts count as uploads, plain form values are skipped
        if field.name() != Some("file") {
            continue;
        }
        if let Some(file_name) = field.file_name().map(str::to_owned) {
            let data = field.bytes().await?;
            upload = Some((file_name, data));
            break;
        }
    }

    let Some((file_name, data)) = upload else {
        return Ok(Json(PredictResponse::error("No file uploaded")));
    };
    if file_name.is_empty() {
        return Ok(Json(PredictResponse::error("No file selected")));
    }

    log::info!("Classifying {} ({} bytes)", &file_name, data.len());

    let prediction = tokio::task::spawn_blocking(move || state.classify_upload(&file_name, &data))
        .await??;

    log::info!(
        "Predicted {} with {}",
        &prediction.predicted_class,
        prediction.confidence_percent()
    );

    Ok(Json(prediction.into()))
}
