//! Locating and loading ONNX models.
//!
use std::{
    convert::Infallible,
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::{bail, Context, Result};
use tract_onnx::prelude::*;

use crate::utils::{download_file, url_file_name};

/// Runnable, optimized tract model.
pub type NnModel = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

/// Where to get a model file from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ModelSource {
    Path(PathBuf),
    Url(String),
}

impl FromStr for ModelSource {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.starts_with("http://") || s.starts_with("https://") {
            Ok(ModelSource::Url(s.to_owned()))
        } else {
            Ok(ModelSource::Path(PathBuf::from(s)))
        }
    }
}

impl fmt::Display for ModelSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelSource::Path(path) => write!(f, "{}", path.display()),
            ModelSource::Url(url) => f.write_str(url),
        }
    }
}

impl ModelSource {
    /// Resolve the source to a local file, downloading it to the cache directory if needed.
    pub async fn fetch(&self) -> Result<PathBuf> {
        match self {
            ModelSource::Path(path) => {
                if !path.is_file() {
                    bail!("model file {} does not exist", path.display());
                }
                Ok(path.clone())
            }
            ModelSource::Url(url) => {
                let file_name = url_file_name(url)
                    .with_context(|| format!("no file name in model URL {url}"))?;
                let cache_dir = model_cache_dir()?;
                std::fs::create_dir_all(&cache_dir)?;

                let filepath = cache_dir.join(file_name);
                if filepath.is_file() {
                    log::info!("Using cached model {}", filepath.display());
                } else {
                    log::info!("Downloading model from {url}");
                    download_file(&reqwest::Client::new(), url, &filepath).await?;
                }

                Ok(filepath)
            }
        }
    }
}

/// Directory where downloaded models are kept.
pub fn model_cache_dir() -> Result<PathBuf> {
    let base = dirs::cache_dir().context("no cache directory on this platform")?;
    Ok(base.join("model_server"))
}

/// Load an ONNX model with a fixed `f32` input shape and make it runnable.
pub fn load_onnx_model(path: impl AsRef<Path>, input_shape: TVec<usize>) -> Result<NnModel> {
    let path = path.as_ref();
    let input_fact = InferenceFact::dt_shape(f32::datum_type(), input_shape);
    let model = tract_onnx::onnx()
        .model_for_path(path)
        .with_context(|| format!("failed to read model {}", path.display()))?
        .with_input_fact(0, input_fact)?
        .into_optimized()?
        .into_runnable()?;

    log::info!("Loaded model {}", path.display());

    Ok(model)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_model_source() {
        assert_eq!(
            "https://example.com/yolo11s.onnx".parse::<ModelSource>(),
            Ok(ModelSource::Url("https://example.com/yolo11s.onnx".into()))
        );
        assert_eq!(
            "models/classifier.onnx".parse::<ModelSource>(),
            Ok(ModelSource::Path(PathBuf::from("models/classifier.onnx")))
        );
    }

    #[tokio::test]
    async fn missing_model_path_fails() {
        let dir = tempfile::tempdir().unwrap();
        let source = ModelSource::Path(dir.path().join("missing.onnx"));
        assert!(source.fetch().await.is_err());
    }

    #[tokio::test]
    async fn existing_model_path_resolves() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.onnx");
        std::fs::write(&path, b"not really onnx").unwrap();

        let source = ModelSource::Path(path.clone());
        assert_eq!(source.fetch().await.unwrap(), path);
    }

    #[test]
    fn loading_garbage_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.onnx");
        std::fs::write(&path, b"not really onnx").unwrap();

        assert!(load_onnx_model(&path, tvec!(1, 3, 8, 8)).is_err());
    }
}
