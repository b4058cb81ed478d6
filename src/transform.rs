//! Named steps of the dataset transform pipeline.

use image::{imageops::FilterType, DynamicImage};

use crate::{dataset::Item, Result};

/// One pure step applied lazily every time a dataset item is read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transform {
    /// Opens a path item or copies an in-memory image.
    Decode,
    /// Exact resize to `(width, height)`.
    Resize { width: u32, height: u32 },
    Grayscale,
    /// Expands to three 8-bit channels.
    ToRgb,
}

impl Transform {
    pub fn name(&self) -> &'static str {
        match self {
            Transform::Decode => "decode",
            Transform::Resize { .. } => "resize",
            Transform::Grayscale => "grayscale",
            Transform::ToRgb => "to_rgb",
        }
    }

    fn apply(&self, item: &Item, image: Option<DynamicImage>) -> Result<DynamicImage> {
        let image = match (self, image) {
            (Transform::Decode, _) | (_, None) => item.decode()?,
            (_, Some(image)) => image,
        };
        Ok(match self {
            Transform::Decode => image,
            Transform::Resize { width, height } => {
                image.resize_exact(*width, *height, FilterType::CatmullRom)
            }
            Transform::Grayscale => image.grayscale(),
            Transform::ToRgb => DynamicImage::ImageRgb8(image.to_rgb8()),
        })
    }
}

/// Standard pipeline: decode, optional resize, optional grayscale, RGB.
pub fn pipeline(size: Option<(u32, u32)>, grayscale: bool) -> Vec<Transform> {
    let mut steps = vec![Transform::Decode];
    if let Some((width, height)) = size {
        steps.push(Transform::Resize { width, height });
    }
    if grayscale {
        steps.push(Transform::Grayscale);
    }
    steps.push(Transform::ToRgb);
    steps
}

/// Runs `steps` on `item`. Nothing is cached between calls.
pub(crate) fn apply_all(item: &Item, steps: &[Transform]) -> Result<DynamicImage> {
    let mut image = None;
    for step in steps {
        image = Some(step.apply(item, image)?);
    }
    match image {
        Some(image) => Ok(image),
        None => item.decode(),
    }
}
