//! Reading-order reconstruction.
//!
//! Scattered word boxes are sorted top-to-bottom, clustered into lines by
//! their vertical centres, and each line is split into sub-lines wherever the
//! horizontal gap reaches `paragraph_break`. The output is a list of index
//! groups, one per line, ready for [`DetectionResults::group_bboxes`].
//!
//! [`DetectionResults::group_bboxes`]: crate::DetectionResults::group_bboxes

use float_ord::FloatOrd;
use tracing::instrument;

use crate::{
    bbox::EPS,
    geometry::{estimate_page_angle, median, quad_envelope, rotate_boxes, Quad},
};

/// Boxes handed to the layout engine, in relative page coordinates.
#[derive(Debug, Clone, PartialEq)]
pub enum LayoutInput {
    /// Axis-aligned `[x1, y1, x2, y2]` boxes. No skew correction is applied.
    Straight(Vec<[f64; 4]>),
    /// Reading-oriented quads, deskewed before sorting.
    Quads(Vec<Quad>),
}

impl LayoutInput {
    pub fn len(&self) -> usize {
        match self {
            LayoutInput::Straight(boxes) => boxes.len(),
            LayoutInput::Quads(quads) => quads.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LayoutOptions {
    /// Horizontal gap, in relative page units, that starts a new sub-line.
    pub paragraph_break: f64,
    /// Skew (degrees) below which the page counts as level.
    pub min_angle: f64,
    /// `(height, width)` the relative quads are rotated in.
    pub orig_shape: (usize, usize),
    /// Optional `(height, width)` to remap rotated quads into.
    pub target_shape: Option<(usize, usize)>,
}

impl Default for LayoutOptions {
    fn default() -> Self {
        Self {
            paragraph_break: 0.035,
            min_angle: 5.0,
            orig_shape: (1024, 1024),
            target_shape: None,
        }
    }
}

impl LayoutOptions {
    pub fn paragraph_break(mut self, paragraph_break: f64) -> Self {
        self.paragraph_break = paragraph_break;
        self
    }

    pub fn min_angle(mut self, min_angle: f64) -> Self {
        self.min_angle = min_angle;
        self
    }

    pub fn target_shape(mut self, target_shape: Option<(usize, usize)>) -> Self {
        self.target_shape = target_shape;
        self
    }
}

fn heights(boxes: &[[f64; 4]]) -> Vec<f64> {
    boxes.iter().map(|it| it[3] - it[1]).collect()
}

fn vertical_center(bbox: &[f64; 4]) -> f64 {
    (bbox[1] + bbox[3]) / 2.0
}

/// Sorts boxes roughly top-to-bottom then left-to-right.
///
/// Returns the sort order together with the (deskewed) axis-aligned boxes the
/// order refers to.
#[instrument(level = "debug", skip(input), fields(boxes = input.len()))]
pub fn sort_boxes(input: &LayoutInput, options: &LayoutOptions) -> (Vec<usize>, Vec<[f64; 4]>) {
    let boxes = match input {
        LayoutInput::Straight(boxes) => boxes.clone(),
        LayoutInput::Quads(quads) => {
            let angle = -estimate_page_angle(quads);
            log::debug!("Estimated page skew {:.2} degrees", -angle);
            rotate_boxes(
                quads,
                angle,
                options.orig_shape,
                options.min_angle,
                options.target_shape,
            )
            .iter()
            .map(quad_envelope)
            .collect()
        }
    };
    let median_height = median(&mut heights(&boxes)).unwrap_or(0.0).max(EPS);

    let mut order = (0..boxes.len()).collect::<Vec<_>>();
    order.sort_by_key(|idx| {
        let bbox = &boxes[*idx];
        FloatOrd(bbox[0] + 2.0 * bbox[3] / median_height)
    });
    (order, boxes)
}

/// Splits one line into sub-lines at horizontal gaps of at least
/// `paragraph_break`.
pub fn resolve_sub_lines(
    boxes: &[[f64; 4]],
    word_idcs: &[usize],
    paragraph_break: f64,
) -> Vec<Vec<usize>> {
    let mut word_idcs = word_idcs.to_vec();
    word_idcs.sort_by_key(|idx| FloatOrd(boxes[*idx][0]));

    let Some((&first, rest)) = word_idcs.split_first() else {
        return vec![word_idcs];
    };

    let mut lines = Vec::new();
    let mut sub_line = vec![first];
    for &idx in rest {
        let previous = sub_line[sub_line.len() - 1];
        if boxes[idx][0] - boxes[previous][2] < paragraph_break {
            sub_line.push(idx);
        } else {
            lines.push(std::mem::replace(&mut sub_line, vec![idx]));
        }
    }
    lines.push(sub_line);
    lines
}

/// Groups box indices into reading-ordered lines.
#[instrument(level = "debug", skip(input), fields(boxes = input.len()))]
pub fn resolve_lines(input: &LayoutInput, options: &LayoutOptions) -> Vec<Vec<usize>> {
    if input.is_empty() {
        return Vec::new();
    }
    let (order, boxes) = sort_boxes(input, options);
    let y_med = median(&mut heights(&boxes)).unwrap_or(0.0);

    let mut lines = Vec::new();
    let mut words = vec![order[0]];
    let mut y_center_sum = vertical_center(&boxes[order[0]]);
    for &idx in &order[1..] {
        let center = vertical_center(&boxes[idx]);
        let y_dist = (center - y_center_sum / words.len() as f64).abs();
        if y_dist < y_med / 2.0 {
            words.push(idx);
            y_center_sum += center;
        } else {
            lines.extend(resolve_sub_lines(&boxes, &words, options.paragraph_break));
            words = vec![idx];
            y_center_sum = center;
        }
    }
    lines.extend(resolve_sub_lines(&boxes, &words, options.paragraph_break));

    log::debug!("Resolved {} boxes into {} lines", boxes.len(), lines.len());
    lines
}
