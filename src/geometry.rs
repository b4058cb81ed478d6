//! Skew estimation and rotation of page boxes.
//!
//! Boxes are handled as [`Quad`]s: four corners ordered in reading direction
//! (top-left, top-right, bottom-right, bottom-left), expressed as fractions of
//! the page. Shapes are `(height, width)`.

use float_ord::FloatOrd;
use geo::{MinimumRotatedRect, Polygon};
use nalgebra::{Matrix2, Vector2};
use tracing::instrument;

pub type Quad = [[f64; 2]; 4];

/// Corners of an axis-aligned `[x1, y1, x2, y2]` box.
pub fn quad_from_straight([x1, y1, x2, y2]: [f64; 4]) -> Quad {
    [[x1, y1], [x2, y1], [x2, y2], [x1, y2]]
}

/// Axis-aligned envelope `[xmin, ymin, xmax, ymax]` of a quad.
pub fn quad_envelope(quad: &Quad) -> [f64; 4] {
    quad.iter().fold(
        [f64::INFINITY, f64::INFINITY, f64::NEG_INFINITY, f64::NEG_INFINITY],
        |[xmin, ymin, xmax, ymax], [x, y]| [xmin.min(*x), ymin.min(*y), xmax.max(*x), ymax.max(*y)],
    )
}

/// Reading-ordered quad of the minimum rotated rectangle around `polygon`.
///
/// Detectors that emit free-form text polygons go through this before layout
/// reconstruction. Returns `None` for empty polygons.
pub fn quad_from_polygon(polygon: &Polygon<f64>) -> Option<Quad> {
    let rect = polygon.minimum_rotated_rect()?;
    let mut corners = rect
        .exterior()
        .coords()
        .take(4)
        .map(|coord| [coord.x, coord.y])
        .collect::<Vec<_>>();
    if corners.len() != 4 {
        return None;
    }
    let cx = corners.iter().map(|point| point[0]).sum::<f64>() / 4.0;
    let cy = corners.iter().map(|point| point[1]).sum::<f64>() / 4.0;

    // Image y axis points down, so ascending angle walks clockwise on screen.
    corners.sort_by_key(|point| FloatOrd((point[1] - cy).atan2(point[0] - cx)));
    let start = corners
        .iter()
        .enumerate()
        .min_by_key(|(_, point)| FloatOrd(point[0] + point[1]))
        .map_or(0, |(idx, _)| idx);
    corners.rotate_left(start);
    Some([corners[0], corners[1], corners[2], corners[3]])
}

pub(crate) fn median(values: &mut [f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by_key(|value| FloatOrd(*value));
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        Some((values[mid - 1] + values[mid]) / 2.0)
    } else {
        Some(values[mid])
    }
}

/// Median counter-clockwise angle, in degrees, of reading-oriented quads.
///
/// Quads with no horizontal extent make the slope undefined; in that case (and
/// for an empty page) the page is treated as level.
#[instrument(level = "trace", skip(quads))]
pub fn estimate_page_angle(quads: &[Quad]) -> f64 {
    let mut angles = Vec::with_capacity(quads.len());
    for quad in quads {
        let xleft = quad[0][0] + quad[3][0];
        let yleft = quad[0][1] + quad[3][1];
        let xright = quad[1][0] + quad[2][0];
        let yright = quad[1][1] + quad[2][1];
        let run = xright - xleft;
        if run == 0.0 {
            log::trace!("Degenerate quad {quad:?}, treating page as level");
            return 0.0;
        }
        // Y axis goes from top to bottom.
        angles.push(((yleft - yright) / run).atan().to_degrees());
    }
    median(&mut angles).unwrap_or(0.0)
}

/// Re-expresses relative quads of an `orig_shape` image inside a centred
/// `dest_shape` canvas.
pub fn remap_boxes(
    quads: &[Quad],
    orig_shape: (usize, usize),
    dest_shape: (usize, usize),
) -> Vec<Quad> {
    let (orig_height, orig_width) = (orig_shape.0 as f64, orig_shape.1 as f64);
    let (dest_height, dest_width) = (dest_shape.0 as f64, dest_shape.1 as f64);
    quads
        .iter()
        .map(|quad| {
            quad.map(|[x, y]| {
                [
                    (x * orig_width + (dest_width - orig_width) / 2.0) / dest_width,
                    (y * orig_height + (dest_height - orig_height) / 2.0) / dest_height,
                ]
            })
        })
        .collect()
}

/// Rotates relative quads by `angle` degrees around the page centre.
///
/// Angles closer than `min_angle` to either axis leave the quads untouched.
/// When `target_shape` is given the result is remapped into it, which undoes
/// the padding added by an expanding page rotation.
#[instrument(level = "trace", skip(quads))]
pub fn rotate_boxes(
    quads: &[Quad],
    angle: f64,
    orig_shape: (usize, usize),
    min_angle: f64,
    target_shape: Option<(usize, usize)>,
) -> Vec<Quad> {
    if angle.abs() < min_angle || angle.abs() > 90.0 - min_angle {
        return quads.to_vec();
    }
    let (height, width) = (orig_shape.0 as f64, orig_shape.1 as f64);
    let (sin, cos) = angle.to_radians().sin_cos();
    // Points are row vectors multiplied on the left of the rotation matrix.
    let rotation = Matrix2::new(cos, -sin, sin, cos).transpose();
    let center = Vector2::new(width / 2.0, height / 2.0);

    let rotated = quads
        .iter()
        .map(|quad| {
            quad.map(|[x, y]| {
                let point = Vector2::new(x * width, y * height);
                let moved = center + rotation * (point - center);
                [moved.x / width, moved.y / height]
            })
        })
        .collect::<Vec<_>>();

    match target_shape {
        Some(target_shape) => remap_boxes(&rotated, orig_shape, target_shape),
        None => rotated,
    }
}

#[cfg(test)]
mod tests {
    use geo::polygon;

    use super::*;

    fn tilted(y: f64, degrees: f64) -> Quad {
        let rise = 0.4 * degrees.to_radians().tan();
        [
            [0.3, y],
            [0.7, y - rise],
            [0.7, y - rise + 0.05],
            [0.3, y + 0.05],
        ]
    }

    #[test]
    fn level_page_has_zero_angle() {
        let quads = [
            quad_from_straight([0.1, 0.1, 0.3, 0.15]),
            quad_from_straight([0.4, 0.1, 0.6, 0.15]),
        ];
        assert_eq!(estimate_page_angle(&quads), 0.0);
        assert_eq!(estimate_page_angle(&[]), 0.0);
    }

    #[test]
    fn zero_width_quad_is_not_an_error() {
        let quads = [quad_from_straight([0.1, 0.1, 0.1, 0.2]), tilted(0.5, 10.0)];
        assert_eq!(estimate_page_angle(&quads), 0.0);
    }

    #[test]
    fn median_angle_ignores_outliers() {
        let quads = [tilted(0.2, 10.0), tilted(0.4, 10.0), tilted(0.6, 45.0)];
        assert!((estimate_page_angle(&quads) - 10.0).abs() < 1e-6);
    }

    #[test]
    fn rotation_levels_skewed_boxes() {
        let quads = [tilted(0.3, 12.0), tilted(0.6, 12.0)];
        let angle = estimate_page_angle(&quads);
        let levelled = rotate_boxes(&quads, -angle, (1024, 1024), 5.0, None);
        assert!(estimate_page_angle(&levelled).abs() < 1e-6);
    }

    #[test]
    fn small_angles_are_skipped() {
        let quads = [tilted(0.3, 2.0)];
        assert_eq!(rotate_boxes(&quads, -2.0, (1024, 1024), 5.0, None), quads);
        assert_eq!(rotate_boxes(&quads, 88.0, (1024, 1024), 5.0, None), quads);
    }

    #[test]
    fn remap_centres_into_larger_canvas() {
        let quads = [quad_from_straight([0.0, 0.0, 1.0, 1.0])];
        let remapped = remap_boxes(&quads, (100, 100), (200, 200));
        assert_eq!(quad_envelope(&remapped[0]), [0.25, 0.25, 0.75, 0.75]);
    }

    #[test]
    fn polygon_corners_start_top_left() {
        let polygon = polygon![
            (x: 10.0, y: 20.0),
            (x: 10.0, y: 0.0),
            (x: 0.0, y: 0.0),
            (x: 0.0, y: 20.0),
        ];
        let quad = quad_from_polygon(&polygon).unwrap();
        let expected = [[0.0, 0.0], [10.0, 0.0], [10.0, 20.0], [0.0, 20.0]];
        for (corner, expected) in quad.iter().zip(expected) {
            assert!((corner[0] - expected[0]).abs() < 1e-6, "{quad:?}");
            assert!((corner[1] - expected[1]).abs() < 1e-6, "{quad:?}");
        }
    }
}
