//! Face analysis capability: detection and template encoding.
//!
//! The gallery and the frame loop only see [`FaceAnalyzer`]; the ONNX
//! backend below is one implementation of it.

use crate::detector::FaceDetector;
use crate::encoder::FaceEncoder;
use crate::types::{FaceRegion, Template};
use image::RgbImage;
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Detector + encoder pair the pipeline calls into.
pub trait FaceAnalyzer: Send {
    /// Find zero or more faces in `image`.
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<FaceRegion>, AnalysisError>;

    /// One template per region, in the same order.
    fn encode(
        &mut self,
        image: &RgbImage,
        regions: &[FaceRegion],
    ) -> Result<Vec<Template>, AnalysisError>;
}

/// Analyzer shared between the frame loop and enrollment.
pub type SharedAnalyzer = Arc<Mutex<Box<dyn FaceAnalyzer>>>;

pub fn shared(analyzer: impl FaceAnalyzer + 'static) -> SharedAnalyzer {
    Arc::new(Mutex::new(Box::new(analyzer)))
}

const DETECTOR_MODEL: &str = "det_10g.onnx";
const ENCODER_MODEL: &str = "w600k_r50.onnx";

/// SCRFD detection + ArcFace encoding via ONNX Runtime.
pub struct OnnxAnalyzer {
    detector: FaceDetector,
    encoder: FaceEncoder,
}

impl OnnxAnalyzer {
    /// Load both models from `model_dir`.
    pub fn load(model_dir: &Path) -> Result<Self, AnalysisError> {
        let detector = FaceDetector::load(&model_dir.join(DETECTOR_MODEL))?;
        let encoder = FaceEncoder::load(&model_dir.join(ENCODER_MODEL))?;
        Ok(Self { detector, encoder })
    }
}

impl FaceAnalyzer for OnnxAnalyzer {
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<FaceRegion>, AnalysisError> {
        self.detector.detect(image)
    }

    fn encode(
        &mut self,
        image: &RgbImage,
        regions: &[FaceRegion],
    ) -> Result<Vec<Template>, AnalysisError> {
        regions
            .iter()
            .map(|region| self.encoder.encode(image, region))
            .collect()
    }
}
