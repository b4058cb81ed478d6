use std::{path::PathBuf, time::Instant};

use ocrtoolkit::{io, LayoutOptions};
use tracing_subscriber::{fmt::format::FmtSpan, EnvFilter};

/// Usage: `ocrtoolkit <images dir> <class names file> <output json> [label]`
///
/// Loads a YOLO-labelled folder, merges the boxes of `label` (all boxes when
/// omitted) into reading-order lines and writes them as Label Studio tasks.
fn main() {
    tracing_subscriber::fmt()
        .with_span_events(FmtSpan::CLOSE)
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let mut args = std::env::args().skip(1);
    let (Some(images_dir), Some(classes), Some(output)) = (args.next(), args.next(), args.next())
    else {
        eprintln!("usage: ocrtoolkit <images dir> <class names file> <output json> [label]");
        std::process::exit(2);
    };
    let label = args.next();
    let images_dir = PathBuf::from(images_dir);

    let start = Instant::now();
    let class_names =
        io::read_class_names(&PathBuf::from(classes)).expect("Failed to read class names");
    let (ds, dets) = io::load_yolo(&images_dir, &class_names).expect("Failed to load YOLO folder");
    log::info!("{} images with labels", ds.len());

    let layout = LayoutOptions::default();
    let lines = dets
        .iter()
        .map(|dets| match &label {
            Some(label) => dets.filter_by_labels(&[label], false),
            None => dets.clone(),
        })
        .map(|dets| dets.group_bboxes(None, &layout))
        .collect::<Result<Vec<_>, _>>()
        .expect("Failed to group boxes");
    log::debug!("{:?}", start.elapsed());

    let subdir = images_dir
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "images".to_string());
    io::save_dets_as_label_studio(&lines, &PathBuf::from(output), &subdir)
        .expect("Failed to write Label Studio tasks");
}
