use std::{
    collections::HashSet,
    io::Cursor,
    path::{Path, PathBuf},
};

use image::{DynamicImage, ImageFormat, Pixel, Rgb};
use ndarray::Array3;
use tracing::instrument;

use crate::{BBox, Result};

/// Image extensions picked up when a dataset is built from a directory.
pub const DEFAULT_IMAGE_EXTENSIONS: &[&str] = &["png", "jpeg", "jpg", "tif", "tiff", "bmp"];

/// Scales RGB pixels to `[0, 1]`, applies `(pixel - mean) * norm` per channel
/// and lays the result out as CHW.
#[instrument(level = "trace", skip(image))]
pub fn subtract_mean_normalize(
    image: &DynamicImage,
    mean_vals: &[f32; 3],
    norm_vals: &[f32; 3],
) -> Array3<f32> {
    let mut image = image.to_rgb32f();
    let norm = Rgb::<f32>(*norm_vals);
    let mean_vals = Rgb::<f32>(*mean_vals).map2(&norm, |c1, c2| c1 * c2);
    for pixel in image.pixels_mut() {
        *pixel = pixel
            .map2(&norm, |c1, c2| c1 * c2)
            .map2(&mean_vals, |c1, c2| c1 - c2);
    }
    Array3::<f32>::from_shape_fn(
        (3, image.height() as usize, image.width() as usize),
        |(ch, y, x)| image.get_pixel(x as u32, y as u32).channels()[ch],
    )
}

/// Crops the absolute `bbox` out of `image`, clamped to the image bounds.
pub(crate) fn part_image(image: &DynamicImage, bbox: &BBox) -> DynamicImage {
    let bbox = bbox.denormalize(image.width(), image.height());
    let x = (bbox.x1().max(0.0) as u32).min(image.width());
    let y = (bbox.y1().max(0.0) as u32).min(image.height());
    let x2 = (bbox.x2().max(0.0) as u32).clamp(x, image.width());
    let y2 = (bbox.y2().max(0.0) as u32).clamp(y, image.height());
    log::trace!("Slicing subimage to ({x}, {y}, {x2}, {y2})");
    image.crop_imm(x, y, x2 - x, y2 - y)
}

/// Lossless byte form of an in-memory image, used by the dataset archive.
pub fn encode_png(image: &DynamicImage) -> Result<Vec<u8>> {
    let mut bytes = Cursor::new(Vec::new());
    image.write_to(&mut bytes, ImageFormat::Png)?;
    Ok(bytes.into_inner())
}

pub fn decode_image(bytes: &[u8]) -> Result<DynamicImage> {
    Ok(image::load_from_memory(bytes)?)
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.starts_with('.'))
}

/// Image files directly inside `dir`, sorted by path.
///
/// `skip_hidden` drops dot-files only. `dir` itself is always listed, even
/// when its own name starts with a dot.
#[instrument(level = "debug", skip(extensions))]
pub fn list_image_files<S: AsRef<str>>(
    dir: &Path,
    extensions: &[S],
    skip_hidden: bool,
) -> Result<Vec<PathBuf>> {
    let extensions = extensions
        .iter()
        .map(|ext| ext.as_ref().trim_start_matches('.').to_lowercase())
        .collect::<HashSet<_>>();

    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() || (skip_hidden && is_hidden(&path)) {
            continue;
        }
        let matches = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| extensions.contains(&ext.to_lowercase()));
        if matches {
            files.push(path);
        }
    }
    files.sort();
    log::info!("Found {} image files in {}", files.len(), dir.display());
    Ok(files)
}
