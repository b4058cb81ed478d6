use std::collections::HashMap;

use float_ord::FloatOrd;
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use tracing::instrument;
use uuid::Uuid;

use crate::{
    dataset::{Dataset, DatasetOptions, Item},
    layout::{resolve_lines, LayoutInput, LayoutOptions},
    util::part_image,
    BBox, CoordSpace, Error, Result,
};

/// Outputs that carry the name of the image they were produced from.
pub trait Named {
    fn name(&self) -> &str;
    fn set_name(&mut self, name: &str);
}

/// Detections for one image. Boxes are kept in pixel coordinates of a
/// `width` x `height` image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionResults {
    bboxes: Vec<BBox>,
    width: u32,
    height: u32,
    name: String,
}

impl DetectionResults {
    /// Normalized input boxes are denormalized against `width` x `height`.
    pub fn new(bboxes: Vec<BBox>, width: u32, height: u32, name: impl Into<String>) -> Self {
        let bboxes = bboxes
            .into_iter()
            .map(|bbox| bbox.denormalize(width, height))
            .collect();
        Self {
            bboxes,
            width,
            height,
            name: name.into(),
        }
    }

    pub fn empty(width: u32, height: u32, name: impl Into<String>) -> Self {
        Self::new(Vec::new(), width, height, name)
    }

    fn with_bboxes(&self, bboxes: Vec<BBox>) -> Self {
        Self::new(bboxes, self.width, self.height, self.name.clone())
    }

    pub fn len(&self) -> usize {
        self.bboxes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bboxes.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, BBox> {
        self.bboxes.iter()
    }

    pub fn bboxes(&self) -> &[BBox] {
        &self.bboxes
    }

    pub fn into_bboxes(self) -> Vec<BBox> {
        self.bboxes
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// Boxes as fractions of the image.
    pub fn normalized_bboxes(&self) -> Vec<BBox> {
        self.bboxes
            .iter()
            .map(|bbox| bbox.normalize(self.width, self.height))
            .collect()
    }

    pub fn filter_by_confidence(&self, min_confidence: f32) -> Self {
        self.with_bboxes(
            self.bboxes
                .iter()
                .filter(|bbox| bbox.confidence() >= min_confidence)
                .cloned()
                .collect(),
        )
    }

    /// One collection per entry of `labels`, in that order. Labels without
    /// boxes yield empty collections. With `only_max_conf`, every box tied at
    /// the highest confidence of its label is kept.
    pub fn split_by_labels<S: AsRef<str>>(&self, labels: &[S], only_max_conf: bool) -> Vec<Self> {
        labels
            .iter()
            .map(|label| {
                let mut matching = self
                    .bboxes
                    .iter()
                    .filter(|bbox| bbox.label() == label.as_ref())
                    .cloned()
                    .collect::<Vec<_>>();
                if only_max_conf {
                    let max = matching.iter().map(|bbox| FloatOrd(bbox.confidence())).max();
                    if let Some(FloatOrd(max)) = max {
                        matching.retain(|bbox| bbox.confidence() == max);
                    }
                }
                self.with_bboxes(matching)
            })
            .collect()
    }

    /// Boxes whose label is in `labels`, keeping their original order.
    pub fn filter_by_labels<S: AsRef<str>>(&self, labels: &[S], only_max_conf: bool) -> Self {
        if !only_max_conf {
            return self.with_bboxes(
                self.bboxes
                    .iter()
                    .filter(|bbox| labels.iter().any(|label| label.as_ref() == bbox.label()))
                    .cloned()
                    .collect(),
            );
        }
        let mut max_conf = HashMap::new();
        for bbox in &self.bboxes {
            let entry = max_conf.entry(bbox.label()).or_insert(f32::NEG_INFINITY);
            *entry = entry.max(bbox.confidence());
        }
        self.with_bboxes(
            self.bboxes
                .iter()
                .filter(|bbox| labels.iter().any(|label| label.as_ref() == bbox.label()))
                .filter(|bbox| max_conf.get(bbox.label()) == Some(&bbox.confidence()))
                .cloned()
                .collect(),
        )
    }

    /// Keeps boxes whose overlap with `region` reaches `thresh` (or, with
    /// `inside == false`, those whose overlap does not).
    pub fn filter_by_bbox(&self, region: &BBox, thresh: f64, inside: bool) -> Self {
        if self.is_empty() {
            return self.clone();
        }
        let region = region.denormalize(self.width, self.height);
        self.with_bboxes(
            self.bboxes
                .iter()
                .filter(|bbox| bbox.is_inside(&region, thresh) == inside)
                .cloned()
                .collect(),
        )
    }

    /// [`filter_by_bbox`](Self::filter_by_bbox) with a region given as
    /// fractions of the image.
    pub fn filter_by_region(
        &self,
        x1: f64,
        y1: f64,
        x2: f64,
        y2: f64,
        thresh: f64,
        inside: bool,
    ) -> Self {
        let region = BBox::new(x1, y1, x2, y2, CoordSpace::Normalized);
        self.filter_by_bbox(&region, thresh, inside)
    }

    /// Reading-order index groups of the boxes.
    #[instrument(level = "debug", skip(self), fields(name = %self.name, boxes = self.len()))]
    pub fn line_groups(&self, layout: &LayoutOptions) -> Vec<Vec<usize>> {
        let boxes = self
            .normalized_bboxes()
            .iter()
            .map(BBox::values)
            .collect::<Vec<_>>();
        let layout = LayoutOptions {
            orig_shape: (self.height as usize, self.width as usize),
            ..*layout
        };
        resolve_lines(&LayoutInput::Straight(boxes), &layout)
    }

    /// Merges every index group into one box. Without explicit groups the
    /// boxes are grouped into lines first.
    pub fn group_bboxes(
        &self,
        groups: Option<&[Vec<usize>]>,
        layout: &LayoutOptions,
    ) -> Result<Self> {
        if self.is_empty() {
            return Ok(self.clone());
        }
        let resolved;
        let groups = match groups {
            Some(groups) => groups,
            None => {
                resolved = self.line_groups(layout);
                resolved.as_slice()
            }
        };

        let mut merged = Vec::with_capacity(groups.len());
        for group in groups {
            let members = group
                .iter()
                .map(|&index| {
                    self.bboxes.get(index).cloned().ok_or(Error::IndexOutOfRange {
                        index,
                        len: self.len(),
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            if let Some(bbox) = BBox::union_all(members) {
                merged.push(bbox);
            }
        }
        log::debug!("Grouped {} boxes into {}", self.len(), merged.len());
        Ok(self.with_bboxes(merged))
    }

    /// Grows each box by fractions of its own height (`up`, `down`) and width
    /// (`left`, `right`).
    pub fn expand_bboxes(&self, up: f64, down: f64, left: f64, right: f64) -> Self {
        self.with_bboxes(
            self.bboxes
                .iter()
                .map(|bbox| {
                    let (w, h) = (bbox.width(), bbox.height());
                    bbox.expand(up * h, down * h, left * w, right * w)
                })
                .collect(),
        )
    }

    /// Stable in-place sort by left edge.
    pub fn sort_lr(&mut self) {
        self.bboxes.sort_by_key(|bbox| FloatOrd(bbox.x1()));
    }

    /// Copies recognized text onto the boxes, pairing them in order.
    pub fn attach_text(&self, texts: &[RecognitionResults]) -> Result<Self> {
        if texts.len() != self.len() {
            return Err(Error::invalid_argument(format!(
                "{} recognition results for {} boxes",
                texts.len(),
                self.len()
            )));
        }
        Ok(self.with_bboxes(
            self.bboxes
                .iter()
                .zip(texts)
                .map(|(bbox, text)| bbox.clone().with_text(text.text.clone(), text.confidence))
                .collect(),
        ))
    }

    /// Crops every box out of `image`. Boxes are rescaled when the image
    /// resolution differs from the one they were detected on.
    #[instrument(level = "debug", skip_all, fields(name = %self.name))]
    pub fn get_crops(&self, image: &DynamicImage) -> Vec<DynamicImage> {
        self.normalized_bboxes()
            .iter()
            .map(|bbox| part_image(image, bbox))
            .collect()
    }

    /// In-memory dataset of the crops, kept at their native resolution.
    pub fn create_ds(&self, image: &DynamicImage) -> Result<Dataset> {
        let crops = self.get_crops(image);
        let names = self
            .bboxes
            .iter()
            .map(|bbox| format!("{}__{}__{}", Uuid::new_v4(), bbox.label(), self.name))
            .collect();
        let options = DatasetOptions::default().size(None).grayscale(false);
        Ok(
            Dataset::from_items(crops.into_iter().map(Item::Image).collect(), Some(names), options)?
                .with_parent(self.name.clone()),
        )
    }
}

impl Named for DetectionResults {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_name(&mut self, name: &str) {
        self.name = name.to_string();
    }
}

impl<'a> IntoIterator for &'a DetectionResults {
    type Item = &'a BBox;
    type IntoIter = std::slice::Iter<'a, BBox>;

    fn into_iter(self) -> Self::IntoIter {
        self.bboxes.iter()
    }
}

/// Text read from one crop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecognitionResults {
    pub text: String,
    pub confidence: f32,
    pub width: u32,
    pub height: u32,
    pub name: String,
}

impl RecognitionResults {
    pub fn new(text: impl Into<String>, confidence: f32, width: u32, height: u32) -> Self {
        Self {
            text: text.into(),
            confidence,
            width,
            height,
            name: String::new(),
        }
    }
}

impl Named for RecognitionResults {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_name(&mut self, name: &str) {
        self.name = name.to_string();
    }
}
