//! lookout-core: identity matching and enrollment pipeline.
//!
//! Classifies face templates against an in-memory gallery snapshot, gates
//! greetings and unknown-face captures, and manages the directory-backed
//! gallery with at-rest template sealing. Face detection and encoding sit
//! behind [`analysis::FaceAnalyzer`]; an ONNX Runtime backend is included.

pub mod analysis;
pub mod codec;
pub mod debounce;
pub mod detector;
pub mod encoder;
pub mod enrollment;
pub mod gallery;
pub mod matcher;
pub mod quality;
pub mod throttle;
pub mod types;

pub use analysis::{AnalysisError, FaceAnalyzer, OnnxAnalyzer, SharedAnalyzer};
pub use codec::{CodecError, KeyOrigin, TemplateCodec, TemplateKey};
pub use debounce::{CaptureDebouncer, Observation, TrackingKey};
pub use enrollment::{sanitize_name, EnrollError, EnrollmentManager};
pub use gallery::{BackupManifest, GalleryError, GalleryLayout, GalleryStore, QualityPolicy};
pub use matcher::{EuclideanMatcher, GallerySnapshot, MatchError, Matcher, SnapshotCell};
pub use throttle::{Greetings, KnownThrottle};
pub use types::{FaceRegion, Identity, KnownEntry, KnownRecord, PendingEntry, Template};
