#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::imageops::{self, FilterType};
use tract_onnx::prelude::*;

use crate::detect::backend::DetectorBackend;
use crate::detect::labels::LabelMap;
use crate::detect::result::{Detection, DetectionResult};
use crate::frame::Frame;

/// Decoding parameters for YOLOv8-style heads.
#[derive(Clone, Debug)]
pub struct YoloParams {
    /// Square model input size (640 for stock exports).
    pub input_size: u32,
    pub confidence: f32,
    pub iou: f32,
    pub max_detections: usize,
}

impl Default for YoloParams {
    fn default() -> Self {
        Self {
            input_size: 640,
            confidence: 0.25,
            iou: 0.45,
            max_detections: 100,
        }
    }
}

/// Tract-based backend for YOLOv8 ONNX exports.
///
/// Expects a single `[1, 3, S, S]` float input and a `[1, 4 + classes, N]`
/// (or transposed `[1, N, 4 + classes]`) output of centre/size boxes followed
/// by per-class scores.
pub struct TractBackend {
    model: TypedRunnableModel<TypedModel>,
    params: YoloParams,
    labels: LabelMap,
}

impl TractBackend {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(model_path: P, params: YoloParams, labels: LabelMap) -> Result<Self> {
        let model_path = model_path.as_ref();
        let size = params.input_size as usize;
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, size, size)),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self {
            model,
            params,
            labels,
        })
    }

    fn build_input(&self, frame: &Frame) -> Result<Tensor> {
        let size = self.params.input_size;
        let image = frame.to_image()?;
        let resized = imageops::resize(&image, size, size, FilterType::Triangle);
        let size = size as usize;
        let input = tract_ndarray::Array4::from_shape_fn((1, 3, size, size), |(_, c, y, x)| {
            resized.get_pixel(x as u32, y as u32)[c] as f32 / 255.0
        });
        Ok(input.into_tensor())
    }

    fn decode(&self, outputs: TVec<TValue>, frame: &Frame) -> Result<Vec<Detection>> {
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let view = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        let shape = view.shape().to_vec();
        if shape.len() != 3 || shape[0] != 1 {
            return Err(anyhow!("unexpected model output shape {:?}", shape));
        }
        // [1, 4 + classes, N] is the stock export; some exports transpose it.
        let transposed = shape[1] > shape[2];
        let (rows, proposals) = if transposed {
            (shape[2], shape[1])
        } else {
            (shape[1], shape[2])
        };
        if rows <= 4 {
            return Err(anyhow!("model output has no class scores: {:?}", shape));
        }
        let at = |row: usize, i: usize| -> f32 {
            if transposed {
                view[&[0, i, row][..]]
            } else {
                view[&[0, row, i][..]]
            }
        };

        let scale_x = frame.width as f32 / self.params.input_size as f32;
        let scale_y = frame.height as f32 / self.params.input_size as f32;

        let mut candidates = Vec::new();
        for i in 0..proposals {
            let (class_id, score) = (4..rows)
                .map(|row| (row - 4, at(row, i)))
                .fold((0usize, f32::NEG_INFINITY), |best, cur| {
                    if cur.1 > best.1 {
                        cur
                    } else {
                        best
                    }
                });
            if score < self.params.confidence {
                continue;
            }
            let (cx, cy, w, h) = (at(0, i), at(1, i), at(2, i), at(3, i));
            candidates.push(Detection {
                x1: ((cx - w / 2.0) * scale_x).max(0.0),
                y1: ((cy - h / 2.0) * scale_y).max(0.0),
                x2: ((cx + w / 2.0) * scale_x).min(frame.width as f32),
                y2: ((cy + h / 2.0) * scale_y).min(frame.height as f32),
                confidence: Some(score),
                class_id,
                label: self.labels.lookup(class_id),
            });
        }

        let mut kept = nms(candidates, self.params.iou);
        kept.truncate(self.params.max_detections);
        Ok(kept)
    }
}

impl DetectorBackend for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn detect(&mut self, frame: &Frame) -> Result<DetectionResult> {
        let input = self.build_input(frame)?;
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        let detections = self.decode(outputs, frame)?;
        log::trace!("tract: {} detections", detections.len());
        Ok(DetectionResult { detections })
    }
}

/// Greedy class-aware NMS: highest score first, suppress same-class overlaps.
pub(crate) fn nms(mut boxes: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    boxes.sort_by(|a, b| {
        b.confidence
            .unwrap_or(0.0)
            .total_cmp(&a.confidence.unwrap_or(0.0))
    });

    let mut kept: Vec<Detection> = Vec::new();
    for candidate in boxes {
        let overlaps = kept.iter().any(|existing| {
            existing.class_id == candidate.class_id && existing.iou(&candidate) > iou_threshold
        });
        if !overlaps {
            kept.push(candidate);
        }
    }
    kept
}
