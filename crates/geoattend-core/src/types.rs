use image::GrayImage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;

/// Enrolled identity label (enrollment number). Templates are keyed by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(pub u64);

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Identity {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(Identity)
    }
}

/// Bounding box for a detected face, in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    /// Number of raw detector windows merged into this box.
    pub neighbors: u32,
}

impl BoundingBox {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height, neighbors: 1 }
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Clamp the box so it lies entirely inside a `width` × `height` frame.
    pub fn clamped(&self, width: u32, height: u32) -> Self {
        let x = self.x.min(width);
        let y = self.y.min(height);
        Self {
            x,
            y,
            width: self.width.min(width - x),
            height: self.height.min(height - y),
            neighbors: self.neighbors,
        }
    }
}

/// A face located in one frame: its box plus the cropped grayscale region.
///
/// Lives for one frame iteration; the region is an owned copy so the frame
/// buffer can be reused.
#[derive(Debug, Clone)]
pub struct DetectedFace {
    pub bbox: BoundingBox,
    pub region: GrayImage,
}

impl DetectedFace {
    /// Crop `bbox` out of `frame`. The box is clamped to the frame bounds.
    pub fn crop(frame: &GrayImage, bbox: BoundingBox) -> Self {
        let bbox = bbox.clamped(frame.width(), frame.height());
        let region =
            image::imageops::crop_imm(frame, bbox.x, bbox.y, bbox.width, bbox.height).to_image();
        Self { bbox, region }
    }
}

/// Result of scoring a face against the template store.
///
/// `distance` is a dissimilarity: lower = more confident. Not a probability.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchResult {
    pub identity: Identity,
    pub distance: f64,
}

impl MatchResult {
    /// Strictly below the threshold counts as a match.
    pub fn is_match(&self, threshold: f64) -> bool {
        self.distance < threshold
    }
}

/// Sliding-window detection parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DetectorParams {
    /// Window growth factor between scales. Must be > 1.0.
    pub scale_factor: f64,
    /// Raw hits a group needs (strictly more than this) to be reported.
    pub min_neighbors: u32,
    /// Smallest window edge in pixels; 0 means the cascade's base window.
    #[serde(default)]
    pub min_size: u32,
}

impl DetectorParams {
    /// Parameters used while taking attendance.
    pub const ATTENDANCE: Self = Self { scale_factor: 1.2, min_neighbors: 5, min_size: 0 };
    /// Parameters used while capturing enrollment samples.
    pub const ENROLLMENT: Self = Self { scale_factor: 1.3, min_neighbors: 5, min_size: 0 };
}

impl Default for DetectorParams {
    fn default() -> Self {
        Self::ATTENDANCE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_parse_trims() {
        assert_eq!(" 101 ".parse::<Identity>().unwrap(), Identity(101));
        assert!("abc".parse::<Identity>().is_err());
        assert!("".parse::<Identity>().is_err());
        assert!("-4".parse::<Identity>().is_err());
    }

    #[test]
    fn test_bbox_clamped_to_frame() {
        let b = BoundingBox::new(90, 40, 30, 30).clamped(100, 50);
        assert_eq!((b.x, b.y, b.width, b.height), (90, 40, 10, 10));

        let outside = BoundingBox::new(200, 200, 10, 10).clamped(100, 50);
        assert_eq!(outside.area(), 0);
    }

    #[test]
    fn test_crop_copies_region() {
        let frame = GrayImage::from_fn(8, 8, |x, y| image::Luma([(y * 8 + x) as u8]));
        let face = DetectedFace::crop(&frame, BoundingBox::new(2, 3, 2, 2));
        assert_eq!(face.region.dimensions(), (2, 2));
        assert_eq!(face.region.get_pixel(0, 0)[0], 26);
        assert_eq!(face.region.get_pixel(1, 1)[0], 35);
    }

    #[test]
    fn test_match_threshold_is_strict() {
        let m = MatchResult { identity: Identity(1), distance: 70.0 };
        assert!(!m.is_match(70.0));
        assert!(m.is_match(70.5));
    }
}
