//! ArcFace template encoder via ONNX Runtime.
//!
//! Encodes a square crop around each detected face, resized to 112×112,
//! into a 512-dimensional L2-normalized template.

use crate::analysis::AnalysisError;
use crate::types::{FaceRegion, Template};
use image::imageops::FilterType;
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;

const INPUT_SIZE: u32 = 112;
const PIXEL_MEAN: f32 = 127.5;
const PIXEL_STD: f32 = 127.5;
const TEMPLATE_DIM: usize = 512;

pub struct FaceEncoder {
    session: Session,
}

impl FaceEncoder {
    pub fn load(model_path: &Path) -> Result<Self, AnalysisError> {
        if !model_path.exists() {
            return Err(AnalysisError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(path = %model_path.display(), "loaded ArcFace model");
        Ok(Self { session })
    }

    pub fn encode(&mut self, image: &RgbImage, region: &FaceRegion) -> Result<Template, AnalysisError> {
        let crop = square_crop(image, region)
            .ok_or_else(|| AnalysisError::InferenceFailed("face region outside image".into()))?;
        let face = image::imageops::resize(&crop, INPUT_SIZE, INPUT_SIZE, FilterType::Triangle);
        let input = preprocess(&face);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| AnalysisError::InferenceFailed(format!("template extraction: {e}")))?;

        if raw.len() != TEMPLATE_DIM {
            return Err(AnalysisError::InferenceFailed(format!(
                "expected {TEMPLATE_DIM}-dim template, got {}",
                raw.len()
            )));
        }
        Ok(Template::new(l2_normalize(raw)))
    }
}

/// Square crop centred on the region, side = longer region edge.
fn square_crop(image: &RgbImage, region: &FaceRegion) -> Option<RgbImage> {
    let side = region.width().max(region.height());
    let cx = region.left + region.width() / 2;
    let cy = region.top + region.height() / 2;
    let square = FaceRegion {
        top: cy.saturating_sub(side / 2),
        right: cx + side / 2,
        bottom: cy + side / 2,
        left: cx.saturating_sub(side / 2),
        confidence: region.confidence,
    };
    square.crop(image)
}

fn preprocess(face: &RgbImage) -> Array4<f32> {
    let size = INPUT_SIZE as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, pixel) in face.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (pixel.0[c] as f32 - PIXEL_MEAN) / PIXEL_STD;
        }
    }
    tensor
}

fn l2_normalize(raw: &[f32]) -> Vec<f32> {
    let norm = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        raw.iter().map(|x| x / norm).collect()
    } else {
        raw.to_vec()
    }
}
