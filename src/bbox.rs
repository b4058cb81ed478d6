use std::ops::Add;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Floor applied to areas and overlaps so degenerate boxes never divide by zero.
pub const EPS: f64 = 1e-6;

/// Default intersection ratio used by [`BBox::is_inside`] callers.
pub const DEFAULT_INSIDE_THRESHOLD: f64 = 0.8;

const DEFAULT_LABEL: &str = "0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CoordSpace {
    /// Fractions of the image width/height.
    Normalized,
    /// Whole pixels of one specific image resolution.
    Absolute,
}

/// An axis-aligned box with detection and recognition metadata.
///
/// Boxes are values: every geometric operation returns a new box. Combining
/// two boxes that live in different [`CoordSpace`]s is a programming error and
/// panics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    x1: f64,
    y1: f64,
    x2: f64,
    y2: f64,
    space: CoordSpace,
    confidence: f32,
    label: String,
    text: String,
    text_confidence: f32,
}

fn snap(value: f64, space: CoordSpace) -> f64 {
    match space {
        CoordSpace::Normalized => value,
        CoordSpace::Absolute => value.round(),
    }
}

impl BBox {
    pub fn new(x1: f64, y1: f64, x2: f64, y2: f64, space: CoordSpace) -> Self {
        Self {
            x1: snap(x1, space),
            y1: snap(y1, space),
            x2: snap(x2, space),
            y2: snap(y2, space),
            space,
            confidence: 1.0,
            label: DEFAULT_LABEL.to_string(),
            text: String::new(),
            text_confidence: 0.0,
        }
    }

    pub fn from_xywh(x: f64, y: f64, w: f64, h: f64, space: CoordSpace) -> Self {
        Self::new(x, y, x + w, y + h, space)
    }

    pub fn from_cxcywh(cx: f64, cy: f64, w: f64, h: f64, space: CoordSpace) -> Self {
        Self::new(cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0, space)
    }

    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = confidence;
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_text(mut self, text: impl Into<String>, text_confidence: f32) -> Self {
        self.text = text.into();
        self.text_confidence = text_confidence;
        self
    }

    pub fn x1(&self) -> f64 {
        self.x1
    }

    pub fn y1(&self) -> f64 {
        self.y1
    }

    pub fn x2(&self) -> f64 {
        self.x2
    }

    pub fn y2(&self) -> f64 {
        self.y2
    }

    /// `[x1, y1, x2, y2]`
    pub fn values(&self) -> [f64; 4] {
        [self.x1, self.y1, self.x2, self.y2]
    }

    pub fn space(&self) -> CoordSpace {
        self.space
    }

    pub fn is_normalized(&self) -> bool {
        self.space == CoordSpace::Normalized
    }

    pub fn confidence(&self) -> f32 {
        self.confidence
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn text_confidence(&self) -> f32 {
        self.text_confidence
    }

    pub fn width(&self) -> f64 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f64 {
        self.y2 - self.y1
    }

    pub fn center(&self) -> (f64, f64) {
        ((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }

    pub fn area(&self) -> f64 {
        self.width() * self.height()
    }

    /// The area, or [`EPS`] when the box is degenerate.
    pub fn eps_area(&self) -> f64 {
        let area = self.area();
        if area > EPS {
            area
        } else {
            EPS
        }
    }

    fn assert_same_space(&self, other: &BBox) {
        assert_eq!(
            self.space, other.space,
            "bounding boxes must share a coordinate space"
        );
    }

    fn with_coords(&self, x1: f64, y1: f64, x2: f64, y2: f64, space: CoordSpace) -> Self {
        Self {
            x1: snap(x1, space),
            y1: snap(y1, space),
            x2: snap(x2, space),
            y2: snap(y2, space),
            space,
            confidence: self.confidence,
            label: self.label.clone(),
            text: self.text.clone(),
            text_confidence: self.text_confidence,
        }
    }

    /// Converts to pixel coordinates of a `width` x `height` image. No-op for
    /// boxes that are already absolute.
    pub fn denormalize(&self, width: u32, height: u32) -> Self {
        if self.space == CoordSpace::Absolute {
            return self.clone();
        }
        let (w, h) = (width as f64, height as f64);
        self.with_coords(
            self.x1 * w,
            self.y1 * h,
            self.x2 * w,
            self.y2 * h,
            CoordSpace::Absolute,
        )
    }

    /// Converts to fractions of a `width` x `height` image. No-op for boxes
    /// that are already normalized.
    pub fn normalize(&self, width: u32, height: u32) -> Self {
        if self.space == CoordSpace::Normalized {
            return self.clone();
        }
        let (w, h) = (width as f64, height as f64);
        self.with_coords(
            self.x1 / w,
            self.y1 / h,
            self.x2 / w,
            self.y2 / h,
            CoordSpace::Normalized,
        )
    }

    pub fn expand(&self, up: f64, down: f64, left: f64, right: f64) -> Self {
        self.with_coords(
            self.x1 - left,
            self.y1 - up,
            self.x2 + right,
            self.y2 + down,
            self.space,
        )
    }

    /// # Panics
    ///
    /// Panics if the boxes are in different coordinate spaces.
    pub fn intersection_area(&self, other: &BBox) -> f64 {
        self.assert_same_space(other);
        let x1 = self.x1.max(other.x1);
        let y1 = self.y1.max(other.y1);
        let x2 = self.x2.min(other.x2);
        let y2 = self.y2.min(other.y2);
        (x2 - x1 + EPS).max(0.0) * (y2 - y1 + EPS).max(0.0)
    }

    /// True when at least `thresh` of this box's area overlaps `other`.
    ///
    /// # Panics
    ///
    /// Panics if the boxes are in different coordinate spaces.
    pub fn is_inside(&self, other: &BBox, thresh: f64) -> bool {
        self.intersection_area(other) / self.eps_area() >= thresh
    }

    /// Order-`p` distance between the top-left corners.
    ///
    /// # Panics
    ///
    /// Panics if `p <= 0` or the boxes are in different coordinate spaces.
    pub fn dist(&self, other: &BBox, p: f64) -> f64 {
        assert!(p > 0.0, "p should be > 0");
        self.assert_same_space(other);
        let dx = (self.x1 - other.x1).abs();
        let dy = (self.y1 - other.y1).abs();
        (dx.powf(p) + dy.powf(p)).powf(1.0 / p)
    }

    /// Minimal box enclosing both. Keeps this box's label and joins the texts
    /// with a space.
    ///
    /// # Panics
    ///
    /// Panics if the boxes are in different coordinate spaces.
    pub fn union(&self, other: &BBox) -> BBox {
        self.assert_same_space(other);
        BBox {
            x1: self.x1.min(other.x1),
            y1: self.y1.min(other.y1),
            x2: self.x2.max(other.x2),
            y2: self.y2.max(other.y2),
            space: self.space,
            confidence: self.confidence.max(other.confidence),
            label: self.label.clone(),
            text: [self.text.as_str(), other.text.as_str()].join(" "),
            text_confidence: self.text_confidence.max(other.text_confidence),
        }
    }

    /// Folds boxes with [`BBox::union`] in iteration order.
    pub fn union_all<I>(boxes: I) -> Option<BBox>
    where
        I: IntoIterator<Item = BBox>,
    {
        boxes.into_iter().reduce(|acc, bbox| acc + bbox)
    }

    pub fn apply_text_op<F>(&self, op: F, lowercase: bool) -> Self
    where
        F: FnOnce(&str) -> String,
    {
        let text = if lowercase {
            op(&self.text.to_lowercase())
        } else {
            op(&self.text)
        };
        Self {
            text,
            ..self.clone()
        }
    }

    /// Flat row used by the detection archive:
    /// `x1, y1, x2, y2, normalized, confidence, label, text, text_confidence`.
    pub fn encode(&self) -> Vec<String> {
        vec![
            self.x1.to_string(),
            self.y1.to_string(),
            self.x2.to_string(),
            self.y2.to_string(),
            if self.is_normalized() { "True" } else { "False" }.to_string(),
            self.confidence.to_string(),
            self.label.clone(),
            self.text.clone(),
            self.text_confidence.to_string(),
        ]
    }

    /// Inverse of [`BBox::encode`]. Trailing fields may be missing.
    pub fn decode<S: AsRef<str>>(row: &[S]) -> Result<Self> {
        if row.len() < 4 {
            return Err(Error::decode(
                "bbox",
                format!("expected at least 4 fields, got {}", row.len()),
            ));
        }
        let field = |idx: usize| row.get(idx).map(|it| it.as_ref().trim());
        let float = |idx: usize| -> Result<Option<f64>> {
            field(idx)
                .map(|value| value.parse::<f64>().map_err(|err| Error::decode("bbox", err)))
                .transpose()
        };

        let mut coords = [0.0; 4];
        for (idx, coord) in coords.iter_mut().enumerate() {
            *coord = float(idx)?.unwrap_or_default();
        }
        let space = match field(4) {
            None => CoordSpace::Absolute,
            Some("True" | "true" | "1") => CoordSpace::Normalized,
            Some("False" | "false" | "0") => CoordSpace::Absolute,
            Some(other) => {
                return Err(Error::decode(
                    "bbox",
                    format!("invalid normalized flag {other:?}"),
                ))
            }
        };
        let confidence = float(5)?.unwrap_or(1.0) as f32;
        let label = field(6).unwrap_or(DEFAULT_LABEL).to_string();
        let text = row.get(7).map(|it| it.as_ref().to_string()).unwrap_or_default();
        let text_confidence = float(8)?.unwrap_or(1.0) as f32;

        let [x1, y1, x2, y2] = coords;
        Ok(Self::new(x1, y1, x2, y2, space)
            .with_confidence(confidence)
            .with_label(label)
            .with_text(text, text_confidence))
    }
}

impl Add for BBox {
    type Output = BBox;

    fn add(self, other: BBox) -> BBox {
        self.union(&other)
    }
}

impl Add<&BBox> for &BBox {
    type Output = BBox;

    fn add(self, other: &BBox) -> BBox {
        self.union(other)
    }
}

/// Adding nothing leaves the box unchanged.
impl Add<Option<BBox>> for BBox {
    type Output = BBox;

    fn add(self, other: Option<BBox>) -> BBox {
        match other {
            Some(other) => self.union(&other),
            None => self,
        }
    }
}
