use std::path::Path;

use anyhow::{bail, Result};
use common::{
    model::{load_onnx_model, NnModel},
    InferModel,
};
use image::RgbImage;
use ndarray::{s, ArrayViewD, Axis, Ix3};
use tract_onnx::prelude::*;

/// Positive additive constant to avoid divide-by-zero.
const EPS: f32 = 1.0e-7;

/// Object found by the detector.
#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    /// `[x_top_left, y_top_left, x_bottom_right, y_bottom_right]`, normalized to `[0, 1]`.
    pub bbox: [f32; 4],
    pub confidence: f32,
    pub class_id: usize,
}

/// YOLO detector (v8 and later heads) exported to ONNX.
///
/// The model output has the shape `[1, 4 + num_classes, num_anchors]`. Every anchor holds the
/// box center, width and height in input pixels, followed by one score per class.
pub struct YoloModel {
    model: NnModel,
    width: u32,
    height: u32,
    min_confidence: f32,
    max_iou: f32,
}

impl YoloModel {
    pub fn new(
        model_path: impl AsRef<Path>,
        width: u32,
        height: u32,
        min_confidence: f32,
        max_iou: f32,
    ) -> Result<Self> {
        let model = load_onnx_model(model_path, tvec!(1, 3, height as usize, width as usize))?;
        Ok(Self {
            model,
            width,
            height,
            min_confidence,
            max_iou,
        })
    }

    fn preproc(&self, input: &RgbImage) -> Tensor {
        let resized: RgbImage = image::imageops::resize(
            input,
            self.width,
            self.height,
            image::imageops::FilterType::Triangle,
        );

        tract_ndarray::Array4::from_shape_fn(
            (1, 3, self.height as usize, self.width as usize),
            |(_, c, y, x)| resized[(x as _, y as _)][c] as f32 / 255.0,
        )
        .into()
    }
}

impl InferModel for YoloModel {
    type Output = Vec<Detection>;

    fn run(&self, input: &RgbImage) -> Result<Vec<Detection>> {
        let valid_input = tvec!(self.preproc(input).into());
        let raw_nn_out = self.model.run(valid_input)?;

        decode_output(
            raw_nn_out[0].to_array_view::<f32>()?,
            self.width,
            self.height,
            self.min_confidence,
            self.max_iou,
        )
    }
}

/// Turn the raw YOLO output into normalized detections.
///
/// Every anchor is assigned its best scoring class. Anchors below `min_confidence` are dropped
/// and the remaining ones go through non-maximum suppression.
pub fn decode_output(
    output: ArrayViewD<f32>,
    width: u32,
    height: u32,
    min_confidence: f32,
    max_iou: f32,
) -> Result<Vec<Detection>> {
    let output = output.into_dimensionality::<Ix3>()?;
    if output.shape()[0] != 1 || output.shape()[1] <= 4 {
        bail!("unexpected detector output shape {:?}", output.shape());
    }

    let (width, height) = (width as f32, height as f32);

    let candidates: Vec<Detection> = output
        .slice(s![0usize, .., ..])
        .axis_iter(Axis(1))
        .filter_map(|anchor| {
            let (class_id, confidence) = anchor
                .iter()
                .skip(4)
                .copied()
                .enumerate()
                .filter(|(_, score)| !score.is_nan())
                .fold(None, |best: Option<(usize, f32)>, (idx, score)| match best {
                    Some((_, best_score)) if best_score >= score => best,
                    _ => Some((idx, score)),
                })?;

            if confidence < min_confidence {
                return None;
            }

            let (cx, cy, w, h) = (anchor[0], anchor[1], anchor[2], anchor[3]);
            let bbox = [
                ((cx - w / 2.0) / width).clamp(0.0, 1.0),
                ((cy - h / 2.0) / height).clamp(0.0, 1.0),
                ((cx + w / 2.0) / width).clamp(0.0, 1.0),
                ((cy + h / 2.0) / height).clamp(0.0, 1.0),
            ];

            Some(Detection {
                bbox,
                confidence,
                class_id,
            })
        })
        .collect();

    Ok(non_maximum_suppression(candidates, max_iou))
}

/// Run class-aware non-maximum-suppression on candidate detections.
///
/// Iterate over the candidates in the order of sinking confidence and keep a candidate only if
/// it has an IoU of at most `max_iou` with every already selected detection of the same class.
fn non_maximum_suppression(mut candidates: Vec<Detection>, max_iou: f32) -> Vec<Detection> {
    candidates.sort_by(|a, b| a.confidence.total_cmp(&b.confidence));

    let mut selected: Vec<Detection> = vec![];
    // Most confident candidates sit at the back of the ascending-sorted vector
    'candidates: while let Some(candidate) = candidates.pop() {
        for chosen in selected.iter() {
            if chosen.class_id == candidate.class_id && iou(&candidate.bbox, &chosen.bbox) > max_iou
            {
                continue 'candidates;
            }
        }

        selected.push(candidate);
    }

    selected
}

/// Calculate the intersection-over-union metric for two bounding boxes.
fn iou(bbox_a: &[f32; 4], bbox_b: &[f32; 4]) -> f32 {
    // For disjoint boxes the overlap corners are swapped and the area is zero
    let overlap_box: [f32; 4] = [
        f32::max(bbox_a[0], bbox_b[0]),
        f32::max(bbox_a[1], bbox_b[1]),
        f32::min(bbox_a[2], bbox_b[2]),
        f32::min(bbox_a[3], bbox_b[3]),
    ];

    let overlap_area = bbox_area(&overlap_box);

    overlap_area / (bbox_area(bbox_a) + bbox_area(bbox_b) - overlap_area + EPS)
}

/// Calculate the area enclosed by a bounding box.
///
/// If the bottom-right point lies above or left of the top-left point, the area is zero.
fn bbox_area(bbox: &[f32; 4]) -> f32 {
    let width = bbox[2] - bbox[0];
    let height = bbox[3] - bbox[1];
    if width < 0.0 || height < 0.0 {
        return 0.0;
    }

    width * height
}
