//! Haar cascade face detector.
//!
//! Viola-Jones sliding-window evaluation over integral images. Raw window
//! hits are merged with the same grouping rule OpenCV's `detectMultiScale`
//! applies, so cascades exported from OpenCV behave as they do there.

use crate::types::{BoundingBox, DetectedFace, DetectorParams};
use image::GrayImage;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

// --- Named constants ---
/// Relative edge tolerance when merging window hits into one face.
const GROUP_EPS: f64 = 0.2;
/// Stage sums this close below the stage threshold still pass.
const STAGE_THRESHOLD_EPS: f64 = 1e-5;
/// Smallest base window that leaves a non-empty normalisation area.
const MIN_BASE_WINDOW: u32 = 3;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("cascade file not found: {0}")]
    ModelNotFound(String),
    #[error("cascade {path} is malformed: {reason}")]
    Malformed { path: String, reason: String },
    #[error("invalid detector parameters: {0}")]
    InvalidParams(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Strategy for locating candidate face regions in a grayscale frame.
///
/// Implementations may keep per-frame scratch state, hence `&mut self`.
pub trait FaceDetector {
    fn detect(&mut self, frame: &GrayImage) -> Result<Vec<DetectedFace>, DetectorError>;
}

/// Haar cascade description, as exported by the offline training tooling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HaarCascade {
    /// Base window width in pixels.
    pub width: u32,
    /// Base window height in pixels.
    pub height: u32,
    pub stages: Vec<Stage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    pub threshold: f32,
    pub classifiers: Vec<WeakClassifier>,
}

/// Decision stump over one Haar-like feature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeakClassifier {
    pub rects: Vec<FeatureRect>,
    pub threshold: f32,
    /// Vote when the normalised feature value is below `threshold`.
    pub left: f32,
    /// Vote otherwise.
    pub right: f32,
}

/// Weighted rectangle of a Haar-like feature, in base window coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub weight: f32,
}

impl HaarCascade {
    /// Load a cascade from `path`: OpenCV cascade XML (as shipped with
    /// OpenCV, e.g. `haarcascade_frontalface_default.xml`) or the JSON form
    /// of this struct. The format is picked from the content.
    pub fn load(path: &str) -> Result<Self, DetectorError> {
        if !Path::new(path).exists() {
            return Err(DetectorError::ModelNotFound(path.to_string()));
        }

        let raw = std::fs::read_to_string(path)?;
        let malformed = |reason: String| DetectorError::Malformed {
            path: path.to_string(),
            reason,
        };
        let cascade = if raw.trim_start().starts_with('<') {
            crate::opencv_xml::parse(&raw).map_err(malformed)?
        } else {
            serde_json::from_str::<HaarCascade>(&raw).map_err(|e| malformed(e.to_string()))?
        };
        cascade.validate().map_err(|reason| DetectorError::Malformed {
            path: path.to_string(),
            reason,
        })?;

        tracing::info!(
            path,
            width = cascade.width,
            height = cascade.height,
            stages = cascade.stages.len(),
            "loaded Haar cascade"
        );

        Ok(cascade)
    }

    fn validate(&self) -> Result<(), String> {
        if self.width < MIN_BASE_WINDOW || self.height < MIN_BASE_WINDOW {
            return Err(format!("base window {}x{} is too small", self.width, self.height));
        }
        if self.stages.is_empty() {
            return Err("cascade has no stages".into());
        }
        for (si, stage) in self.stages.iter().enumerate() {
            if stage.classifiers.is_empty() {
                return Err(format!("stage {si} has no classifiers"));
            }
            for classifier in &stage.classifiers {
                if classifier.rects.is_empty() {
                    return Err(format!("stage {si} has a feature with no rectangles"));
                }
                for r in &classifier.rects {
                    if r.width == 0
                        || r.height == 0
                        || r.x + r.width > self.width
                        || r.y + r.height > self.height
                    {
                        return Err(format!(
                            "stage {si}: rect ({}, {}, {}, {}) outside {}x{} window",
                            r.x, r.y, r.width, r.height, self.width, self.height
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    /// Rescale every feature to a window `factor` times the base size.
    fn scaled(&self, factor: f64) -> ScaledCascade {
        let s = |v: u32| (v as f64 * factor).round() as usize;
        let win_w = s(self.width);
        let win_h = s(self.height);
        let border = s(1);
        let norm = (
            border,
            border,
            win_w.saturating_sub(2 * border).max(1),
            win_h.saturating_sub(2 * border).max(1),
        );

        let stages = self
            .stages
            .iter()
            .map(|stage| ScaledStage {
                threshold: stage.threshold as f64,
                classifiers: stage
                    .classifiers
                    .iter()
                    .map(|c| {
                        let mut rects: Vec<ScaledRect> = c
                            .rects
                            .iter()
                            .map(|r| {
                                let x = s(r.x).min(win_w - 1);
                                let y = s(r.y).min(win_h - 1);
                                ScaledRect {
                                    x,
                                    y,
                                    width: s(r.width).clamp(1, win_w - x),
                                    height: s(r.height).clamp(1, win_h - y),
                                    weight: r.weight as f64,
                                }
                            })
                            .collect();

                        // Rounding changes rect areas; re-balance the first
                        // weight so the feature stays zero-mean.
                        if rects.len() > 1 {
                            let rest: f64 = rects[1..].iter().map(|r| r.weight * r.area()).sum();
                            rects[0].weight = -rest / rects[0].area();
                        }

                        ScaledClassifier {
                            rects,
                            threshold: c.threshold as f64,
                            left: c.left as f64,
                            right: c.right as f64,
                        }
                    })
                    .collect(),
            })
            .collect();

        ScaledCascade { win_w, win_h, norm, stages }
    }
}

struct ScaledRect {
    x: usize,
    y: usize,
    width: usize,
    height: usize,
    weight: f64,
}

impl ScaledRect {
    fn area(&self) -> f64 {
        (self.width * self.height) as f64
    }
}

struct ScaledClassifier {
    rects: Vec<ScaledRect>,
    threshold: f64,
    left: f64,
    right: f64,
}

struct ScaledStage {
    threshold: f64,
    classifiers: Vec<ScaledClassifier>,
}

struct ScaledCascade {
    win_w: usize,
    win_h: usize,
    /// Variance normalisation rect (x, y, w, h): the window minus a 1-px border.
    norm: (usize, usize, usize, usize),
    stages: Vec<ScaledStage>,
}

impl ScaledCascade {
    /// Run every stage on the window whose top-left corner is (`x`, `y`).
    fn evaluate(&self, ii: &IntegralImage, x: usize, y: usize) -> bool {
        let (nx, ny, nw, nh) = self.norm;
        let area = (nw * nh) as f64;
        let mean = ii.sum(x + nx, y + ny, nw, nh) / area;
        let variance = ii.sq_sum(x + nx, y + ny, nw, nh) / area - mean * mean;
        let std_dev = if variance > 0.0 { variance.sqrt() } else { 1.0 };
        let inv_norm = 1.0 / (area * std_dev);

        for stage in &self.stages {
            let mut stage_sum = 0.0;
            for c in &stage.classifiers {
                let value = c
                    .rects
                    .iter()
                    .map(|r| r.weight * ii.sum(x + r.x, y + r.y, r.width, r.height))
                    .sum::<f64>()
                    * inv_norm;
                stage_sum += if value < c.threshold { c.left } else { c.right };
            }
            if stage_sum < stage.threshold - STAGE_THRESHOLD_EPS {
                return false;
            }
        }
        true
    }
}

/// Summed-area tables of pixel values and squared pixel values.
struct IntegralImage {
    sum: Array2<u64>,
    sq_sum: Array2<f64>,
}

impl IntegralImage {
    fn new(frame: &GrayImage) -> Self {
        let (w, h) = (frame.width() as usize, frame.height() as usize);
        let mut sum = Array2::<u64>::zeros((h + 1, w + 1));
        let mut sq_sum = Array2::<f64>::zeros((h + 1, w + 1));

        for y in 0..h {
            let mut row = 0u64;
            let mut row_sq = 0f64;
            for x in 0..w {
                let p = frame.get_pixel(x as u32, y as u32)[0] as u64;
                row += p;
                row_sq += (p * p) as f64;
                sum[[y + 1, x + 1]] = sum[[y, x + 1]] + row;
                sq_sum[[y + 1, x + 1]] = sq_sum[[y, x + 1]] + row_sq;
            }
        }

        Self { sum, sq_sum }
    }

    fn sum(&self, x: usize, y: usize, w: usize, h: usize) -> f64 {
        let t = &self.sum;
        ((t[[y + h, x + w]] + t[[y, x]]) - (t[[y, x + w]] + t[[y + h, x]])) as f64
    }

    fn sq_sum(&self, x: usize, y: usize, w: usize, h: usize) -> f64 {
        let t = &self.sq_sum;
        t[[y + h, x + w]] + t[[y, x]] - t[[y, x + w]] - t[[y + h, x]]
    }
}

/// Haar cascade detector with fixed detection parameters.
pub struct CascadeDetector {
    cascade: HaarCascade,
    params: DetectorParams,
}

impl CascadeDetector {
    pub fn new(cascade: HaarCascade, params: DetectorParams) -> Result<Self, DetectorError> {
        if !params.scale_factor.is_finite() || params.scale_factor <= 1.0 {
            return Err(DetectorError::InvalidParams(format!(
                "scale_factor must be greater than 1.0, got {}",
                params.scale_factor
            )));
        }
        Ok(Self { cascade, params })
    }

    /// Load the cascade at `path` and bind it to `params`.
    pub fn load(path: &str, params: DetectorParams) -> Result<Self, DetectorError> {
        Self::new(HaarCascade::load(path)?, params)
    }

    pub fn params(&self) -> &DetectorParams {
        &self.params
    }

    /// Collect every window position, at every scale, that passes all stages.
    fn scan(&self, frame: &GrayImage) -> Vec<BoundingBox> {
        let ii = IntegralImage::new(frame);
        let (fw, fh) = (frame.width() as usize, frame.height() as usize);
        let min_size = self.params.min_size as usize;

        let mut hits = Vec::new();
        let mut factor = 1.0f64;
        loop {
            let scaled = self.cascade.scaled(factor);
            if scaled.win_w > fw || scaled.win_h > fh {
                break;
            }

            if scaled.win_w >= min_size && scaled.win_h >= min_size {
                // Two base pixels per step at small scales, one at large ones.
                let step = if factor > 2.0 { factor } else { 2.0 * factor };
                let step = (step.round() as usize).max(1);

                for y in (0..=fh - scaled.win_h).step_by(step) {
                    for x in (0..=fw - scaled.win_w).step_by(step) {
                        if scaled.evaluate(&ii, x, y) {
                            hits.push(BoundingBox::new(
                                x as u32,
                                y as u32,
                                scaled.win_w as u32,
                                scaled.win_h as u32,
                            ));
                        }
                    }
                }
            }

            factor *= self.params.scale_factor;
        }

        hits
    }
}

impl FaceDetector for CascadeDetector {
    /// Detect faces, strongest (most merged windows) first, then top-to-bottom.
    fn detect(&mut self, frame: &GrayImage) -> Result<Vec<DetectedFace>, DetectorError> {
        if frame.width() == 0 || frame.height() == 0 {
            return Ok(Vec::new());
        }

        let hits = self.scan(frame);
        let raw = hits.len();
        let mut boxes = group_rectangles(hits, self.params.min_neighbors, GROUP_EPS);
        boxes.sort_by(|a, b| {
            b.neighbors
                .cmp(&a.neighbors)
                .then(a.y.cmp(&b.y))
                .then(a.x.cmp(&b.x))
        });

        tracing::trace!(raw, faces = boxes.len(), "cascade detection");

        Ok(boxes.into_iter().map(|b| DetectedFace::crop(frame, b)).collect())
    }
}

/// Merge overlapping window hits.
///
/// Similar boxes are averaged into one; groups of `min_neighbors` or fewer
/// hits are dropped, as are groups nested inside a better-supported group.
/// `min_neighbors == 0` returns the raw hits unchanged.
fn group_rectangles(hits: Vec<BoundingBox>, min_neighbors: u32, eps: f64) -> Vec<BoundingBox> {
    if min_neighbors == 0 || hits.is_empty() {
        return hits;
    }

    let labels = partition(&hits, |a, b| similar(a, b, eps));
    let classes = labels.iter().copied().max().map_or(0, |m| m + 1);

    let mut sums = vec![[0f64; 4]; classes];
    let mut counts = vec![0u32; classes];
    for (r, &label) in hits.iter().zip(&labels) {
        let s = &mut sums[label];
        s[0] += r.x as f64;
        s[1] += r.y as f64;
        s[2] += r.width as f64;
        s[3] += r.height as f64;
        counts[label] += 1;
    }

    let averaged: Vec<BoundingBox> = sums
        .iter()
        .zip(&counts)
        .map(|(s, &n)| {
            let inv = 1.0 / n as f64;
            BoundingBox {
                x: (s[0] * inv).round() as u32,
                y: (s[1] * inv).round() as u32,
                width: (s[2] * inv).round() as u32,
                height: (s[3] * inv).round() as u32,
                neighbors: n,
            }
        })
        .collect();

    let mut out = Vec::new();
    for (i, r1) in averaged.iter().enumerate() {
        let n1 = r1.neighbors;
        if n1 <= min_neighbors {
            continue;
        }

        let nested = averaged.iter().enumerate().any(|(j, r2)| {
            let n2 = r2.neighbors;
            if j == i || n2 <= min_neighbors {
                return false;
            }
            let dx = (r2.width as f64 * eps).round() as i64;
            let dy = (r2.height as f64 * eps).round() as i64;
            let (x1, y1, w1, h1) = (r1.x as i64, r1.y as i64, r1.width as i64, r1.height as i64);
            let (x2, y2, w2, h2) = (r2.x as i64, r2.y as i64, r2.width as i64, r2.height as i64);
            x1 >= x2 - dx
                && y1 >= y2 - dy
                && x1 + w1 <= x2 + w2 + dx
                && y1 + h1 <= y2 + h2 + dy
                && (n2 > n1.max(3) || n1 < 3)
        });

        if !nested {
            out.push(*r1);
        }
    }

    out
}

fn similar(a: &BoundingBox, b: &BoundingBox, eps: f64) -> bool {
    let delta = eps * (a.width.min(b.width) + a.height.min(b.height)) as f64 * 0.5;
    let close = |p: u32, q: u32| (p as f64 - q as f64).abs() <= delta;
    close(a.x, b.x)
        && close(a.y, b.y)
        && close(a.x + a.width, b.x + b.width)
        && close(a.y + a.height, b.y + b.height)
}

/// Union-find equivalence classes. Labels are numbered by first appearance.
fn partition<F>(items: &[BoundingBox], eq: F) -> Vec<usize>
where
    F: Fn(&BoundingBox, &BoundingBox) -> bool,
{
    fn find(parent: &mut [usize], mut i: usize) -> usize {
        while parent[i] != i {
            parent[i] = parent[parent[i]];
            i = parent[i];
        }
        i
    }

    let n = items.len();
    let mut parent: Vec<usize> = (0..n).collect();
    for i in 0..n {
        for j in (i + 1)..n {
            if eq(&items[i], &items[j]) {
                let ri = find(&mut parent, i);
                let rj = find(&mut parent, j);
                if ri != rj {
                    parent[rj] = ri;
                }
            }
        }
    }

    let mut label_of_root = HashMap::new();
    (0..n)
        .map(|i| {
            let root = find(&mut parent, i);
            let next = label_of_root.len();
            *label_of_root.entry(root).or_insert(next)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    /// 6x6 window, one stump: bright 2x2 centre against a dark surround.
    fn blob_cascade() -> HaarCascade {
        HaarCascade {
            width: 6,
            height: 6,
            stages: vec![Stage {
                threshold: 0.5,
                classifiers: vec![WeakClassifier {
                    rects: vec![
                        FeatureRect { x: 0, y: 0, width: 6, height: 6, weight: -1.0 },
                        FeatureRect { x: 2, y: 2, width: 2, height: 2, weight: 9.0 },
                    ],
                    threshold: 1.0,
                    left: 0.0,
                    right: 1.0,
                }],
            }],
        }
    }

    fn frame_with_blob(x: u32, y: u32) -> GrayImage {
        let mut frame = GrayImage::new(40, 40);
        for dy in 0..2 {
            for dx in 0..2 {
                frame.put_pixel(x + dx, y + dy, Luma([255]));
            }
        }
        frame
    }

    fn hits_at(n: u32, x: u32, y: u32, size: u32) -> Vec<BoundingBox> {
        (0..n).map(|i| BoundingBox::new(x + i % 2, y + i % 3, size, size)).collect()
    }

    #[test]
    fn test_integral_image_sums() {
        let frame = GrayImage::from_fn(4, 3, |x, y| Luma([(x + y * 4) as u8]));
        let ii = IntegralImage::new(&frame);
        assert_eq!(ii.sum(0, 0, 4, 3), (0..12).sum::<u32>() as f64);
        // Pixels 5, 6, 9, 10
        assert_eq!(ii.sum(1, 1, 2, 2), 30.0);
        assert_eq!(ii.sq_sum(1, 1, 2, 2), (25 + 36 + 81 + 100) as f64);
    }

    #[test]
    fn test_detects_centred_blob() {
        let mut detector = CascadeDetector::new(
            blob_cascade(),
            DetectorParams { scale_factor: 1.2, min_neighbors: 0, min_size: 0 },
        )
        .unwrap();

        let faces = detector.detect(&frame_with_blob(12, 12)).unwrap();
        assert!(!faces.is_empty());
        assert!(faces
            .iter()
            .any(|f| (f.bbox.x, f.bbox.y, f.bbox.width, f.bbox.height) == (10, 10, 6, 6)));
        for f in &faces {
            assert_eq!(f.region.dimensions(), (f.bbox.width, f.bbox.height));
        }
    }

    #[test]
    fn test_blank_frame_has_no_faces() {
        let mut detector = CascadeDetector::new(blob_cascade(), DetectorParams::ATTENDANCE).unwrap();
        let faces = detector.detect(&GrayImage::new(40, 40)).unwrap();
        assert!(faces.is_empty());
    }

    #[test]
    fn test_frame_smaller_than_window() {
        let mut detector = CascadeDetector::new(blob_cascade(), DetectorParams::ATTENDANCE).unwrap();
        assert!(detector.detect(&GrayImage::new(4, 4)).unwrap().is_empty());
        assert!(detector.detect(&GrayImage::new(0, 0)).unwrap().is_empty());
    }

    #[test]
    fn test_min_size_skips_small_windows() {
        let mut detector = CascadeDetector::new(
            blob_cascade(),
            DetectorParams { scale_factor: 1.2, min_neighbors: 0, min_size: 12 },
        )
        .unwrap();
        let faces = detector.detect(&frame_with_blob(12, 12)).unwrap();
        assert!(faces.iter().all(|f| f.bbox.width >= 12));
    }

    #[test]
    fn test_rejects_scale_factor_not_above_one() {
        for scale_factor in [1.0, 0.5, f64::NAN] {
            let params = DetectorParams { scale_factor, min_neighbors: 5, min_size: 0 };
            assert!(matches!(
                CascadeDetector::new(blob_cascade(), params),
                Err(DetectorError::InvalidParams(_))
            ));
        }
    }

    #[test]
    fn test_validate_rejects_rect_outside_window() {
        let mut cascade = blob_cascade();
        cascade.stages[0].classifiers[0].rects[1].x = 5;
        assert!(cascade.validate().is_err());

        let mut empty = blob_cascade();
        empty.stages.clear();
        assert!(empty.validate().is_err());
    }

    #[test]
    fn test_load_opencv_xml_cascade() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("haarcascade_blob.xml");
        std::fs::write(
            &path,
            r#"<?xml version="1.0"?>
<opencv_storage>
<cascade type_id="opencv-cascade-classifier"><stageType>BOOST</stageType>
  <featureType>HAAR</featureType>
  <height>6</height>
  <width>6</width>
  <stages>
    <_>
      <maxWeakCount>1</maxWeakCount>
      <stageThreshold>5.0000000000000000e-01</stageThreshold>
      <weakClassifiers>
        <_>
          <internalNodes>
            0 -1 0 1.</internalNodes>
          <leafValues>
            0. 1.</leafValues></_></weakClassifiers></_></stages>
  <features>
    <_>
      <rects>
        <_>
          0 0 6 6 -1.</_>
        <_>
          2 2 2 2 9.</_></rects></_></features></cascade>
</opencv_storage>
"#,
        )
        .unwrap();

        let cascade = HaarCascade::load(path.to_str().unwrap()).unwrap();
        assert_eq!(cascade, blob_cascade());

        let mut detector = CascadeDetector::new(
            cascade,
            DetectorParams { scale_factor: 1.2, min_neighbors: 0, min_size: 0 },
        )
        .unwrap();
        assert!(!detector.detect(&frame_with_blob(12, 12)).unwrap().is_empty());
    }

    #[test]
    fn test_load_json_cascade() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("blob.json");
        std::fs::write(&path, serde_json::to_string(&blob_cascade()).unwrap()).unwrap();
        assert_eq!(HaarCascade::load(path.to_str().unwrap()).unwrap(), blob_cascade());
    }

    #[test]
    fn test_load_malformed_xml_cascade() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("broken.xml");
        std::fs::write(&path, "<opencv_storage><cascade><width>6</width></cascade></opencv_storage>").unwrap();
        let err = HaarCascade::load(path.to_str().unwrap()).unwrap_err();
        assert!(matches!(err, DetectorError::Malformed { .. }));
    }

    #[test]
    fn test_load_missing_cascade() {
        let err = HaarCascade::load("/nonexistent/cascade.json").unwrap_err();
        assert!(matches!(err, DetectorError::ModelNotFound(_)));
    }

    #[test]
    fn test_scaled_keeps_feature_zero_mean() {
        let scaled = blob_cascade().scaled(1.44);
        let c = &scaled.stages[0].classifiers[0];
        let total: f64 = c.rects.iter().map(|r| r.weight * r.area()).sum();
        assert!(total.abs() < 1e-9, "feature not balanced: {total}");
    }

    #[test]
    fn test_group_merges_similar_hits() {
        let mut hits = hits_at(6, 100, 100, 50);
        hits.extend(hits_at(2, 300, 300, 50));

        let grouped = group_rectangles(hits.clone(), 5, GROUP_EPS);
        assert_eq!(grouped.len(), 1);
        assert_eq!(grouped[0].neighbors, 6);
        assert!((grouped[0].x as i64 - 100).abs() <= 1);
        assert_eq!(grouped[0].width, 50);

        let loose = group_rectangles(hits, 1, GROUP_EPS);
        assert_eq!(loose.len(), 2);
    }

    #[test]
    fn test_group_suppresses_nested_weaker_group() {
        let mut hits = hits_at(8, 100, 100, 100);
        hits.extend(hits_at(6, 130, 130, 30));
        let grouped = group_rectangles(hits, 5, GROUP_EPS);
        assert_eq!(grouped.len(), 1);
        assert_eq!(grouped[0].width, 100);
    }

    #[test]
    fn test_group_zero_neighbors_passthrough() {
        let hits = hits_at(3, 10, 10, 20);
        assert_eq!(group_rectangles(hits.clone(), 0, GROUP_EPS), hits);
    }

    #[test]
    fn test_partition_labels_by_first_appearance() {
        let items = vec![
            BoundingBox::new(0, 0, 10, 10),
            BoundingBox::new(500, 500, 10, 10),
            BoundingBox::new(1, 0, 10, 10),
        ];
        let labels = partition(&items, |a, b| similar(a, b, GROUP_EPS));
        assert_eq!(labels, vec![0, 1, 0]);
    }
}
