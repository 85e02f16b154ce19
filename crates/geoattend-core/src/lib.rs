//! geoattend-core — Face detection and matching engine.
//!
//! Uses a Haar cascade for face detection and Local Binary Pattern
//! Histograms (LBPH) for face matching, both in pure Rust on grayscale
//! frames.

pub mod detector;
mod opencv_xml;
pub mod recognizer;
pub mod types;

pub use detector::{CascadeDetector, DetectorError, FaceDetector, HaarCascade};
pub use recognizer::{FaceMatcher, LbphMatcher, MatcherError, TemplateStore};
pub use types::{BoundingBox, DetectedFace, DetectorParams, Identity, MatchResult};
