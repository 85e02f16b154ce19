//! OpenCV cascade XML (`opencv-cascade-classifier`, BOOST + HAAR), the format
//! of `haarcascade_frontalface_default.xml`.
//!
//! Only stump classifiers (one internal node, two leaves) and upright
//! features are supported; that covers the stock frontal face cascades.

use crate::detector::{FeatureRect, HaarCascade, Stage, WeakClassifier};
use roxmltree::{Document, Node};

type Elem<'a, 'i> = Node<'a, 'i>;

fn elements<'a, 'i>(node: Elem<'a, 'i>) -> impl Iterator<Item = Elem<'a, 'i>> {
    node.children().filter(|n| n.is_element())
}

fn child<'a, 'i>(node: Elem<'a, 'i>, name: &str) -> Result<Elem<'a, 'i>, String> {
    elements(node)
        .find(|n| n.has_tag_name(name))
        .ok_or_else(|| format!("<{}> has no <{name}>", node.tag_name().name()))
}

fn text<'a>(node: Elem<'a, '_>) -> &'a str {
    node.text().map(str::trim).unwrap_or("")
}

fn child_text<'a>(node: Elem<'a, '_>, name: &str) -> Result<&'a str, String> {
    child(node, name).map(text)
}

fn numbers<T: std::str::FromStr>(raw: &str, what: &str) -> Result<Vec<T>, String> {
    raw.split_whitespace()
        .map(|v| v.parse().map_err(|_| format!("{what}: bad number {v:?}")))
        .collect()
}

fn number<T: std::str::FromStr>(raw: &str, what: &str) -> Result<T, String> {
    raw.parse().map_err(|_| format!("{what}: bad number {raw:?}"))
}

/// Parse an OpenCV cascade document into a [`HaarCascade`].
pub(crate) fn parse(xml: &str) -> Result<HaarCascade, String> {
    let doc = Document::parse(xml).map_err(|e| format!("invalid XML: {e}"))?;
    let cascade = doc
        .descendants()
        .find(|n| n.has_tag_name("cascade"))
        .ok_or("no <cascade> element (old-style haar cascades are not supported)")?;

    if let Ok(kind) = child_text(cascade, "featureType") {
        if !kind.eq_ignore_ascii_case("HAAR") {
            return Err(format!("featureType {kind} is not HAAR"));
        }
    }
    if let Ok(kind) = child_text(cascade, "stageType") {
        if !kind.eq_ignore_ascii_case("BOOST") {
            return Err(format!("stageType {kind} is not BOOST"));
        }
    }

    let width = number(child_text(cascade, "width")?, "width")?;
    let height = number(child_text(cascade, "height")?, "height")?;
    let features = parse_features(child(cascade, "features")?)?;

    let stages = elements(child(cascade, "stages")?)
        .enumerate()
        .map(|(si, stage)| parse_stage(stage, &features).map_err(|e| format!("stage {si}: {e}")))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(HaarCascade { width, height, stages })
}

fn parse_features(node: Elem<'_, '_>) -> Result<Vec<Vec<FeatureRect>>, String> {
    elements(node)
        .enumerate()
        .map(|(fi, feature)| {
            if child_text(feature, "tilted").is_ok_and(|t| t != "0") {
                return Err(format!("feature {fi} is tilted"));
            }
            elements(child(feature, "rects")?)
                .map(|rect| {
                    let v: Vec<f32> = numbers(text(rect), "rect")?;
                    let [x, y, w, h, weight] = v[..] else {
                        return Err(format!("feature {fi}: rect needs 5 values, got {}", v.len()));
                    };
                    if [x, y, w, h].iter().any(|c| *c < 0.0 || c.fract() != 0.0) {
                        return Err(format!("feature {fi}: rect ({x}, {y}, {w}, {h}) is not integral"));
                    }
                    Ok(FeatureRect {
                        x: x as u32,
                        y: y as u32,
                        width: w as u32,
                        height: h as u32,
                        weight,
                    })
                })
                .collect()
        })
        .collect()
}

fn parse_stage(node: Elem<'_, '_>, features: &[Vec<FeatureRect>]) -> Result<Stage, String> {
    let threshold = number(child_text(node, "stageThreshold")?, "stageThreshold")?;
    let classifiers = elements(child(node, "weakClassifiers")?)
        .map(|weak| {
            // internalNodes: left right featureIdx threshold; a child <= 0
            // names leaf -child.
            let nodes: Vec<f64> = numbers(child_text(weak, "internalNodes")?, "internalNodes")?;
            let leaves: Vec<f32> = numbers(child_text(weak, "leafValues")?, "leafValues")?;
            let [left, right, feature, threshold] = nodes[..] else {
                return Err(format!(
                    "only stump classifiers are supported ({} internal node values)",
                    nodes.len()
                ));
            };
            let leaf = |reference: f64| {
                let idx = -reference;
                (reference <= 0.0 && idx.fract() == 0.0)
                    .then(|| leaves.get(idx as usize).copied())
                    .flatten()
                    .ok_or_else(|| format!("bad leaf reference {reference}"))
            };
            let rects = features
                .get(feature as usize)
                .filter(|_| feature >= 0.0)
                .ok_or_else(|| format!("feature index {feature} out of range"))?
                .clone();

            Ok(WeakClassifier {
                rects,
                threshold: threshold as f32,
                left: leaf(left)?,
                right: leaf(right)?,
            })
        })
        .collect::<Result<Vec<_>, String>>()?;

    Ok(Stage { threshold, classifiers })
}
