//! lookout-hw: frame acquisition.
//!
//! Provides the [`FrameSource`] capability with a V4L2 camera and a
//! directory replay variant, plus pixel-format conversion to RGB.

pub mod camera;
pub mod frame;

pub use camera::{FrameSource, ReplaySource, SourceError, SourceSpec, V4l2Camera};
pub use frame::{Frame, FrameError};
