use chrono::{DateTime, Utc};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A detected face in frame pixel coordinates (edges inclusive-exclusive).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FaceRegion {
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
    pub left: u32,
    pub confidence: f32,
}

impl FaceRegion {
    pub fn width(&self) -> u32 {
        self.right.saturating_sub(self.left)
    }

    pub fn height(&self) -> u32 {
        self.bottom.saturating_sub(self.top)
    }

    /// Clip the region to an image of the given size.
    ///
    /// Returns `None` when nothing of the region lies inside the image.
    pub fn clamp_to(&self, width: u32, height: u32) -> Option<FaceRegion> {
        let clipped = FaceRegion {
            top: self.top.min(height),
            right: self.right.min(width),
            bottom: self.bottom.min(height),
            left: self.left.min(width),
            confidence: self.confidence,
        };
        (clipped.width() > 0 && clipped.height() > 0).then_some(clipped)
    }

    /// Grow the region by `margin` pixels on every side, clipped to the image.
    pub fn expand(&self, margin: u32, width: u32, height: u32) -> FaceRegion {
        FaceRegion {
            top: self.top.saturating_sub(margin),
            right: self.right.saturating_add(margin).min(width),
            bottom: self.bottom.saturating_add(margin).min(height),
            left: self.left.saturating_sub(margin),
            confidence: self.confidence,
        }
    }

    /// Copy the region out of `image`, clipped to its bounds.
    pub fn crop(&self, image: &RgbImage) -> Option<RgbImage> {
        let r = self.clamp_to(image.width(), image.height())?;
        Some(image::imageops::crop_imm(image, r.left, r.top, r.width(), r.height()).to_image())
    }
}

/// Face template (embedding vector) produced by the encoder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub values: Vec<f32>,
}

impl Template {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn dimension(&self) -> usize {
        self.values.len()
    }

    /// Compute Euclidean distance between two templates of equal dimension.
    pub fn euclidean_distance(&self, other: &Template) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }

    /// Little-endian byte image of the vector; round-trips bit for bit.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    pub fn from_le_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() % 4 != 0 {
            return None;
        }
        let values = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Some(Self { values })
    }
}

/// An enrolled identity with its template.
#[derive(Debug, Clone)]
pub struct KnownEntry {
    pub name: String,
    pub template: Template,
    pub created_at: DateTime<Utc>,
}

/// A known face as listed from storage, without re-encoding its image.
#[derive(Debug, Clone, Serialize)]
pub struct KnownRecord {
    pub name: String,
    pub image: PathBuf,
    pub created_at: DateTime<Utc>,
}

/// Operator promotion stamp on a pending capture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Promotion {
    pub to: String,
    pub at: DateTime<Utc>,
}

/// An automatically captured unknown face awaiting review.
#[derive(Debug, Clone, Serialize)]
pub struct PendingEntry {
    pub capture_id: String,
    pub image: PathBuf,
    #[serde(skip_serializing)]
    pub template: Template,
    pub observed_at: DateTime<Utc>,
    pub promoted: Option<Promotion>,
}

/// Outcome of classifying one observed template.
#[derive(Debug, Clone, PartialEq)]
pub enum Identity {
    Known { name: String, distance: f32 },
    /// No candidate within tolerance. `nearest` is the closest distance seen,
    /// absent when the gallery was empty.
    Unknown { nearest: Option<f32> },
}

impl Identity {
    pub fn name(&self) -> Option<&str> {
        match self {
            Identity::Known { name, .. } => Some(name),
            Identity::Unknown { .. } => None,
        }
    }
}
