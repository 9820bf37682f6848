//! SCRFD face detector via ONNX Runtime.
//!
//! Runs on a letterboxed 640×640 RGB tensor and decodes the three
//! anchor-free stride heads into frame-space face regions, followed by NMS.

use crate::analysis::AnalysisError;
use crate::types::FaceRegion;
use image::imageops::FilterType;
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;

const INPUT_SIZE: u32 = 640;
const PIXEL_MEAN: f32 = 127.5;
const PIXEL_STD: f32 = 128.0;
const SCORE_THRESHOLD: f32 = 0.5;
const NMS_IOU: f32 = 0.4;
const STRIDES: [u32; 3] = [8, 16, 32];
const ANCHORS_PER_CELL: usize = 2;

/// Output tensor positions for one stride head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct HeadOutputs {
    score: usize,
    bbox: usize,
}

/// Mapping between frame space and the letterboxed tensor.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: u32,
    pad_y: u32,
}

impl Letterbox {
    fn to_frame(&self, x: f32, y: f32) -> (f32, f32) {
        (
            (x - self.pad_x as f32) / self.scale,
            (y - self.pad_y as f32) / self.scale,
        )
    }
}

pub struct FaceDetector {
    session: Session,
    heads: [HeadOutputs; 3],
}

impl FaceDetector {
    pub fn load(model_path: &Path) -> Result<Self, AnalysisError> {
        if !model_path.exists() {
            return Err(AnalysisError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        if names.len() < 6 {
            return Err(AnalysisError::InferenceFailed(format!(
                "SCRFD model needs score and bbox outputs for 3 strides, got {} outputs",
                names.len()
            )));
        }
        let heads = head_outputs(&names);

        tracing::info!(path = %model_path.display(), outputs = ?names, ?heads, "loaded SCRFD model");
        Ok(Self { session, heads })
    }

    /// Detect faces, highest confidence first.
    pub fn detect(&mut self, image: &RgbImage) -> Result<Vec<FaceRegion>, AnalysisError> {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Ok(Vec::new());
        }
        let (input, letterbox) = letterbox(image);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut found = Vec::new();
        for (head, stride) in self.heads.iter().zip(STRIDES) {
            let (_, scores) = outputs[head.score]
                .try_extract_tensor::<f32>()
                .map_err(|e| AnalysisError::InferenceFailed(format!("scores stride {stride}: {e}")))?;
            let (_, boxes) = outputs[head.bbox]
                .try_extract_tensor::<f32>()
                .map_err(|e| AnalysisError::InferenceFailed(format!("boxes stride {stride}: {e}")))?;
            found.extend(decode_head(scores, boxes, stride, &letterbox, width, height));
        }

        Ok(nms(found, NMS_IOU))
    }
}

/// Locate `score_<stride>` / `bbox_<stride>` outputs by name, falling back
/// to the stock export order (scores 0–2, boxes 3–5) per stride.
fn head_outputs(names: &[String]) -> [HeadOutputs; 3] {
    let position = |kind: &str, stride: u32| {
        let wanted = format!("{kind}_{stride}");
        names.iter().position(|n| *n == wanted)
    };

    let mut heads: [HeadOutputs; 3] = std::array::from_fn(|i| HeadOutputs { score: i, bbox: i + 3 });
    for (head, stride) in heads.iter_mut().zip(STRIDES) {
        if let (Some(score), Some(bbox)) = (position("score", stride), position("bbox", stride)) {
            *head = HeadOutputs { score, bbox };
        }
    }
    heads
}

/// Resize into the 640×640 input keeping aspect ratio; padding is mean
/// grey, i.e. zero after normalization.
fn letterbox(image: &RgbImage) -> (Array4<f32>, Letterbox) {
    let (w, h) = image.dimensions();
    let scale = (INPUT_SIZE as f32 / w as f32).min(INPUT_SIZE as f32 / h as f32);
    let new_w = ((w as f32 * scale).round() as u32).clamp(1, INPUT_SIZE);
    let new_h = ((h as f32 * scale).round() as u32).clamp(1, INPUT_SIZE);
    let pad_x = (INPUT_SIZE - new_w) / 2;
    let pad_y = (INPUT_SIZE - new_h) / 2;

    let resized = image::imageops::resize(image, new_w, new_h, FilterType::Triangle);
    let size = INPUT_SIZE as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, pixel) in resized.enumerate_pixels() {
        let (tx, ty) = ((x + pad_x) as usize, (y + pad_y) as usize);
        for c in 0..3 {
            tensor[[0, c, ty, tx]] = (pixel.0[c] as f32 - PIXEL_MEAN) / PIXEL_STD;
        }
    }

    (tensor, Letterbox { scale, pad_x, pad_y })
}

/// Decode one stride head. Box outputs are distances (left, top, right,
/// bottom) from the anchor point, in stride units.
fn decode_head(
    scores: &[f32],
    boxes: &[f32],
    stride: u32,
    letterbox: &Letterbox,
    frame_w: u32,
    frame_h: u32,
) -> Vec<FaceRegion> {
    let grid = (INPUT_SIZE / stride) as usize;
    let s = stride as f32;
    let mut regions = Vec::new();

    for cell in 0..grid * grid {
        let ax = (cell % grid) as f32 * s;
        let ay = (cell / grid) as f32 * s;

        for anchor in 0..ANCHORS_PER_CELL {
            let idx = cell * ANCHORS_PER_CELL + anchor;
            let score = scores.get(idx).copied().unwrap_or(0.0);
            if score < SCORE_THRESHOLD {
                continue;
            }
            let Some(d) = boxes.get(idx * 4..idx * 4 + 4) else {
                continue;
            };

            let (x1, y1) = letterbox.to_frame(ax - d[0] * s, ay - d[1] * s);
            let (x2, y2) = letterbox.to_frame(ax + d[2] * s, ay + d[3] * s);
            let clip = |v: f32, max: u32| v.round().clamp(0.0, max as f32) as u32;

            let region = FaceRegion {
                top: clip(y1, frame_h),
                right: clip(x2, frame_w),
                bottom: clip(y2, frame_h),
                left: clip(x1, frame_w),
                confidence: score,
            };
            if region.width() > 0 && region.height() > 0 {
                regions.push(region);
            }
        }
    }

    regions
}

fn nms(mut regions: Vec<FaceRegion>, iou_threshold: f32) -> Vec<FaceRegion> {
    regions.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept: Vec<FaceRegion> = Vec::new();
    for region in regions {
        if kept.iter().all(|k| iou(k, &region) <= iou_threshold) {
            kept.push(region);
        }
    }
    kept
}

fn iou(a: &FaceRegion, b: &FaceRegion) -> f32 {
    let inter_w = a.right.min(b.right).saturating_sub(a.left.max(b.left)) as f32;
    let inter_h = a.bottom.min(b.bottom).saturating_sub(a.top.max(b.top)) as f32;
    let inter = inter_w * inter_h;
    let area = |r: &FaceRegion| r.width() as f32 * r.height() as f32;
    let union = area(a) + area(b) - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}
