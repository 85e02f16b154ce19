//! LBPH face matcher.
//!
//! Local Binary Pattern Histograms: each face is encoded as a grid of
//! per-cell LBP histograms and compared against every trained template with
//! a chi-square distance. The nearest template wins.

use crate::types::{DetectedFace, Identity, MatchResult};
use image::GrayImage;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

// --- Named constants ---
const LBP_RADIUS: usize = 1;
const LBP_NEIGHBORS: usize = 8;
const LBP_BINS: usize = 1 << LBP_NEIGHBORS;
const GRID_X: usize = 8;
const GRID_Y: usize = 8;
const HISTOGRAM_LEN: usize = GRID_X * GRID_Y * LBP_BINS;
const TEMPLATE_STORE_VERSION: u32 = 1;
/// Sampled neighbours this close to the centre count as equal.
const LBP_EQ_EPS: f64 = 1e-6;

#[derive(Error, Debug)]
pub enum MatcherError {
    #[error("template store not found: {0}; enroll faces and run `geoattend train` first")]
    ModelNotLoaded(String),
    #[error("template store {path} is malformed: {reason}")]
    Malformed { path: String, reason: String },
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("template store encoding: {0}")]
    Json(#[from] serde_json::Error),
}

/// Strategy for scoring a face region against trained templates.
pub trait FaceMatcher {
    fn predict(&self, face: &DetectedFace) -> MatchResult;
}

/// One trained sample: its label and spatial LBP histogram.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub identity: Identity,
    pub histogram: Vec<f32>,
}

/// Trained LBPH templates, persisted as JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateStore {
    pub version: u32,
    pub radius: usize,
    pub neighbors: usize,
    pub grid_x: usize,
    pub grid_y: usize,
    pub templates: Vec<Template>,
}

impl TemplateStore {
    /// Encode every sample image into a template.
    pub fn train<I>(samples: I) -> Self
    where
        I: IntoIterator<Item = (Identity, GrayImage)>,
    {
        let templates = samples
            .into_iter()
            .map(|(identity, image)| Template {
                identity,
                histogram: spatial_histogram(&image),
            })
            .collect();

        Self {
            version: TEMPLATE_STORE_VERSION,
            radius: LBP_RADIUS,
            neighbors: LBP_NEIGHBORS,
            grid_x: GRID_X,
            grid_y: GRID_Y,
            templates,
        }
    }

    /// Load and validate a template store from `path`.
    pub fn load(path: &Path) -> Result<Self, MatcherError> {
        if !path.exists() {
            return Err(MatcherError::ModelNotLoaded(path.display().to_string()));
        }

        let raw = std::fs::read_to_string(path)?;
        let malformed = |reason: String| MatcherError::Malformed {
            path: path.display().to_string(),
            reason,
        };
        let store: TemplateStore = serde_json::from_str(&raw).map_err(|e| malformed(e.to_string()))?;
        store.validate().map_err(malformed)?;

        tracing::info!(
            path = %path.display(),
            templates = store.templates.len(),
            "loaded template store"
        );

        Ok(store)
    }

    /// Write the store as JSON, creating parent directories as needed.
    pub fn save(&self, path: &Path) -> Result<(), MatcherError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string(self)?;
        std::fs::write(path, json)?;
        tracing::info!(path = %path.display(), templates = self.templates.len(), "saved template store");
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    fn validate(&self) -> Result<(), String> {
        if self.version != TEMPLATE_STORE_VERSION {
            return Err(format!("unsupported version {}", self.version));
        }
        if (self.radius, self.neighbors, self.grid_x, self.grid_y)
            != (LBP_RADIUS, LBP_NEIGHBORS, GRID_X, GRID_Y)
        {
            return Err(format!(
                "LBPH geometry radius={} neighbors={} grid={}x{} does not match this matcher",
                self.radius, self.neighbors, self.grid_x, self.grid_y
            ));
        }
        if self.templates.is_empty() {
            return Err("store holds no templates".into());
        }
        if let Some(t) = self.templates.iter().find(|t| t.histogram.len() != HISTOGRAM_LEN) {
            return Err(format!(
                "template for {} has {} bins, expected {HISTOGRAM_LEN}",
                t.identity,
                t.histogram.len()
            ));
        }
        Ok(())
    }
}

/// Nearest-template LBPH matcher.
pub struct LbphMatcher {
    store: TemplateStore,
}

impl LbphMatcher {
    /// Wrap an in-memory store. Fails if the store would be rejected on load.
    pub fn new(store: TemplateStore) -> Result<Self, MatcherError> {
        store.validate().map_err(|reason| MatcherError::Malformed {
            path: "<memory>".into(),
            reason,
        })?;
        Ok(Self { store })
    }

    pub fn load(path: &Path) -> Result<Self, MatcherError> {
        Ok(Self { store: TemplateStore::load(path)? })
    }

    pub fn store(&self) -> &TemplateStore {
        &self.store
    }
}

impl FaceMatcher for LbphMatcher {
    fn predict(&self, face: &DetectedFace) -> MatchResult {
        // Validated stores are never empty.
        let first = self.store.templates[0].identity;

        if face.region.width() == 0 || face.region.height() == 0 {
            return MatchResult { identity: first, distance: f64::INFINITY };
        }

        let query = spatial_histogram(&face.region);
        self.store
            .templates
            .iter()
            .map(|t| MatchResult {
                identity: t.identity,
                distance: chi_square(&query, &t.histogram),
            })
            .fold(
                MatchResult { identity: first, distance: f64::INFINITY },
                |best, m| if m.distance < best.distance { m } else { best },
            )
    }
}

/// Circular LBP codes with bilinear sampling. The output is `2 * radius`
/// smaller than the input in each dimension.
fn lbp_codes(image: &GrayImage) -> Array2<u8> {
    let (w, h) = (image.width() as usize, image.height() as usize);
    let r = LBP_RADIUS;
    if w <= 2 * r || h <= 2 * r {
        return Array2::zeros((0, 0));
    }

    let px = |x: usize, y: usize| image.get_pixel(x as u32, y as u32)[0] as f64;
    let mut codes = Array2::<u8>::zeros((h - 2 * r, w - 2 * r));

    for n in 0..LBP_NEIGHBORS {
        let angle = 2.0 * std::f64::consts::PI * n as f64 / LBP_NEIGHBORS as f64;
        let sx = r as f64 * angle.cos();
        let sy = -(r as f64) * angle.sin();

        let (fx, fy) = (sx.floor(), sy.floor());
        let (cx, cy) = (sx.ceil(), sy.ceil());
        let (tx, ty) = (sx - fx, sy - fy);
        let w1 = (1.0 - tx) * (1.0 - ty);
        let w2 = tx * (1.0 - ty);
        let w3 = (1.0 - tx) * ty;
        let w4 = tx * ty;

        let offset = |base: usize, d: f64| (base as i64 + d as i64) as usize;

        for y in r..h - r {
            for x in r..w - r {
                let center = px(x, y);
                let t = w1 * px(offset(x, fx), offset(y, fy))
                    + w2 * px(offset(x, cx), offset(y, fy))
                    + w3 * px(offset(x, fx), offset(y, cy))
                    + w4 * px(offset(x, cx), offset(y, cy));
                if t > center || (t - center).abs() < LBP_EQ_EPS {
                    codes[[y - r, x - r]] |= 1 << n;
                }
            }
        }
    }

    codes
}

/// Concatenated per-cell LBP histograms, each normalised by its cell area.
///
/// Images too small for the grid yield an all-zero histogram.
pub fn spatial_histogram(image: &GrayImage) -> Vec<f32> {
    let codes = lbp_codes(image);
    let (rows, cols) = codes.dim();
    let cell_w = cols / GRID_X;
    let cell_h = rows / GRID_Y;

    let mut hist = vec![0f32; HISTOGRAM_LEN];
    if cell_w == 0 || cell_h == 0 {
        return hist;
    }

    let cell_area = (cell_w * cell_h) as f32;
    for gy in 0..GRID_Y {
        for gx in 0..GRID_X {
            let base = (gy * GRID_X + gx) * LBP_BINS;
            for y in gy * cell_h..(gy + 1) * cell_h {
                for x in gx * cell_w..(gx + 1) * cell_w {
                    hist[base + codes[[y, x]] as usize] += 1.0;
                }
            }
            for bin in &mut hist[base..base + LBP_BINS] {
                *bin /= cell_area;
            }
        }
    }

    hist
}

/// Alternative chi-square distance: `Σ 2(a-b)² / (a+b)`, skipping empty bins.
fn chi_square(a: &[f32], b: &[f32]) -> f64 {
    2.0 * a
        .iter()
        .zip(b)
        .map(|(&p, &q)| {
            let (p, q) = (p as f64, q as f64);
            let sum = p + q;
            if sum.abs() > f64::EPSILON {
                (p - q).powi(2) / sum
            } else {
                0.0
            }
        })
        .sum::<f64>()
}
