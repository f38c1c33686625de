use std::path::Path;

use anyhow::{bail, Context, Result};
use common::{
    model::{load_onnx_model, NnModel},
    InferModel,
};
use image::RgbImage;
use tract_onnx::prelude::*;

/// Memory layout of the model input tensor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum InputLayout {
    /// `[batch, height, width, channels]`, the default of Keras models.
    Nhwc,
    /// `[batch, channels, height, width]`
    Nchw,
}

/// Most probable class of an image.
#[derive(Clone, Debug, PartialEq)]
pub struct Prediction {
    pub class_index: usize,
    pub predicted_class: String,
    /// Probability of the predicted class in percent.
    pub confidence: f32,
}

impl Prediction {
    /// Confidence formatted as a percentage with two decimals, e.g. `87.35%`.
    pub fn confidence_percent(&self) -> String {
        format!("{:.2}%", self.confidence)
    }
}

/// Image classifier backed by an ONNX model with a square input and one probability per label.
pub struct ImageClassifier {
    model: NnModel,
    input_size: u32,
    layout: InputLayout,
    labels: Vec<String>,
}

impl ImageClassifier {
    pub fn new(
        model_path: impl AsRef<Path>,
        input_size: u32,
        layout: InputLayout,
        labels: Vec<String>,
    ) -> Result<Self> {
        if labels.is_empty() {
            bail!("at least one class label is required");
        }

        let size = input_size as usize;
        let input_shape = match layout {
            InputLayout::Nhwc => tvec!(1, size, size, 3),
            InputLayout::Nchw => tvec!(1, 3, size, size),
        };
        let model = load_onnx_model(model_path, input_shape)?;

        let classifier = Self {
            model,
            input_size,
            layout,
            labels,
        };
        classifier.check_labels()?;

        Ok(classifier)
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    /// Run the model once on a blank image and compare the number of outputs to the labels.
    fn check_labels(&self) -> Result<()> {
        let blank = RgbImage::new(self.input_size, self.input_size);
        let num_classes = self.probabilities(&blank)?.len();
        if num_classes != self.labels.len() {
            bail!(
                "model predicts {} classes but {} labels are configured",
                num_classes,
                self.labels.len()
            );
        }

        Ok(())
    }

    fn probabilities(&self, input: &RgbImage) -> Result<Vec<f32>> {
        let tensor = preproc(input, self.input_size, self.layout);
        let raw_nn_out = self.model.run(tvec!(tensor.into()))?;
        let probabilities = raw_nn_out[0]
            .to_array_view::<f32>()?
            .iter()
            .copied()
            .collect();

        Ok(probabilities)
    }
}

impl InferModel for ImageClassifier {
    type Output = Prediction;

    fn run(&self, input: &RgbImage) -> Result<Prediction> {
        let probabilities = self.probabilities(input)?;
        postproc(&probabilities, &self.labels)
    }
}

/// Resize to a `size`×`size` square, scale pixel values to `[0, 1]` and add a batch dimension.
///
/// Resizing samples the nearest pixel, the way Keras loads training images.
pub fn preproc(input: &RgbImage, size: u32, layout: InputLayout) -> Tensor {
    let resized: RgbImage = image::imageops::resize(
        input,
        size,
        size,
        image::imageops::FilterType::Nearest,
    );

    let size = size as usize;
    match layout {
        InputLayout::Nhwc => {
            tract_ndarray::Array4::from_shape_fn((1, size, size, 3), |(_, y, x, c)| {
                resized[(x as _, y as _)][c] as f32 / 255.0
            })
            .into()
        }
        InputLayout::Nchw => {
            tract_ndarray::Array4::from_shape_fn((1, 3, size, size), |(_, c, y, x)| {
                resized[(x as _, y as _)][c] as f32 / 255.0
            })
            .into()
        }
    }
}

/// Pick the most probable class.
///
/// On ties the first class wins. The confidence is the probability of the winner in percent.
pub fn postproc(probabilities: &[f32], labels: &[String]) -> Result<Prediction> {
    let (class_index, probability) = probabilities
        .iter()
        .copied()
        .enumerate()
        .fold(None, |best: Option<(usize, f32)>, (idx, p)| match best {
            Some((_, best_p)) if best_p >= p || p.is_nan() => best,
            _ => Some((idx, p)),
        })
        .context("model produced no output")?;

    let predicted_class = labels
        .get(class_index)
        .with_context(|| format!("no label for class index {class_index}"))?
        .clone();

    Ok(Prediction {
        class_index,
        predicted_class,
        confidence: probability * 100.0,
    })
}
