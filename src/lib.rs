//! Toolkit around OCR and document-detection backends.
//!
//! Images go into a lazy [`Dataset`], through a [`Model`] via the
//! [`detector`] and [`recognizer`] drivers, and come out as
//! [`DetectionResults`] that can be filtered, grouped into reading-order
//! lines, cropped and annotated with recognized text.

mod bbox;
pub mod dataset;
pub mod detector;
mod error;
pub mod geometry;
pub mod io;
pub mod layout;
pub mod model;
pub mod recognizer;
mod result;
pub mod transform;
pub mod util;

pub use bbox::*;
pub use dataset::{Dataset, DatasetOptions, Item, ItemKey, Source};
pub use detector::{detect, detect_batches, detect_to_dir};
pub use error::{Error, Result};
pub use layout::LayoutOptions;
pub use model::{
    DetectionModel, Model, ModelConfig, ModelRegistry, PredictOptions, RecognitionModel,
};
pub use recognizer::recognize;
pub use result::*;

pub use image;
