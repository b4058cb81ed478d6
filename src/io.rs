//! Persistence and exchange formats for detections.

use std::{
    fs::{self, File},
    io::{BufReader, BufWriter},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::instrument;

use crate::{
    util, BBox, CoordSpace, Dataset, DatasetOptions, DetectionResults, Error, Result, Source,
};

#[derive(Serialize, Deserialize)]
struct ArchivedDets {
    key: String,
    width: u32,
    height: u32,
    img_name: String,
    rows: Vec<Vec<String>>,
}

#[derive(Serialize, Deserialize)]
struct DetsArchive {
    dets: Vec<ArchivedDets>,
}

fn key_index(key: &str) -> usize {
    key.rsplit('_')
        .next()
        .and_then(|idx| idx.parse().ok())
        .unwrap_or(usize::MAX)
}

#[instrument(skip(dets), fields(count = dets.len()))]
pub fn save_dets(dets: &[DetectionResults], path: &Path) -> Result<()> {
    let archive = DetsArchive {
        dets: dets
            .iter()
            .enumerate()
            .map(|(idx, dets)| ArchivedDets {
                key: format!("dets_{idx}"),
                width: dets.width(),
                height: dets.height(),
                img_name: dets.name().to_string(),
                rows: dets.iter().map(BBox::encode).collect(),
            })
            .collect(),
    };
    let writer = BufWriter::new(File::create(path)?);
    bincode::serialize_into(writer, &archive)?;
    log::info!("Detections saved to {}", path.display());
    Ok(())
}

#[instrument]
pub fn load_dets(path: &Path) -> Result<Vec<DetectionResults>> {
    let reader = BufReader::new(File::open(path)?);
    let mut archive: DetsArchive = bincode::deserialize_from(reader)?;
    archive.dets.sort_by_key(|dets| key_index(&dets.key));
    archive
        .dets
        .into_iter()
        .map(|dets| {
            let bboxes = dets
                .rows
                .iter()
                .map(|row| BBox::decode(row))
                .collect::<Result<Vec<_>>>()?;
            Ok(DetectionResults::new(
                bboxes,
                dets.width,
                dets.height,
                dets.img_name,
            ))
        })
        .collect()
}

/// Label Studio task list with one rectangle prediction per box.
pub fn to_label_studio(dets: &[DetectionResults], subdir: &str) -> Value {
    let tasks = dets
        .iter()
        .map(|dets| {
            let image = Path::new(subdir).join(dets.name());
            let results = dets
                .normalized_bboxes()
                .iter()
                .enumerate()
                .map(|(idx, bbox)| {
                    json!({
                        "id": format!("bbox{}", idx + 1),
                        "type": "rectanglelabels",
                        "from_name": "label",
                        "to_name": "image",
                        "original_width": dets.width(),
                        "original_height": dets.height(),
                        "image_rotation": 0,
                        "value": {
                            "rotation": 0,
                            "x": bbox.x1() * 100.0,
                            "y": bbox.y1() * 100.0,
                            "width": bbox.width() * 100.0,
                            "height": bbox.height() * 100.0,
                            "rectanglelabels": [bbox.label()],
                        },
                    })
                })
                .collect::<Vec<_>>();
            json!({
                "data": {
                    "image": format!(
                        "/data/local-files/?d={}",
                        image.to_string_lossy().replace('\\', "/")
                    ),
                },
                "predictions": [{
                    "model_version": "one",
                    "score": 0.5,
                    "result": results,
                }],
            })
        })
        .collect::<Vec<_>>();
    Value::Array(tasks)
}

#[instrument(skip(dets), fields(count = dets.len()))]
pub fn save_dets_as_label_studio(
    dets: &[DetectionResults],
    path: &Path,
    subdir: &str,
) -> Result<()> {
    let writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(writer, &to_label_studio(dets, subdir))?;
    log::info!("Label Studio tasks saved to {}", path.display());
    Ok(())
}

/// One class name per non-empty line.
pub fn read_class_names(path: &Path) -> Result<Vec<String>> {
    Ok(fs::read_to_string(path)?
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

/// YOLO label file of `image`: `<images_dir>/../labels/<stem>.txt`.
pub fn label_path(image: &Path) -> Option<PathBuf> {
    let images_dir = image.parent()?;
    let stem = image.file_stem()?;
    Some(
        images_dir
            .parent()?
            .join("labels")
            .join(format!("{}.txt", stem.to_string_lossy())),
    )
}

fn parse_yolo_line(line: &str, class_names: &[String]) -> Result<BBox> {
    let fields = line.split_whitespace().collect::<Vec<_>>();
    let [class, cx, cy, w, h] = fields[..] else {
        return Err(Error::decode(
            "yolo label",
            format!("expected 5 fields, got {}", fields.len()),
        ));
    };
    let class = class
        .parse::<usize>()
        .map_err(|err| Error::decode("yolo label", err))?;
    let label = class_names
        .get(class)
        .ok_or_else(|| Error::decode("yolo label", format!("unknown class index {class}")))?;
    let mut coords = [0.0; 4];
    for (coord, value) in coords.iter_mut().zip([cx, cy, w, h]) {
        *coord = value
            .parse::<f64>()
            .map_err(|err| Error::decode("yolo label", err))?;
    }
    let [cx, cy, w, h] = coords;
    Ok(BBox::from_cxcywh(cx, cy, w, h, CoordSpace::Normalized).with_label(label.clone()))
}

/// Loads a YOLO folder: the images under `images_dir` that have a label file,
/// and their boxes in pixel coordinates.
#[instrument(skip(class_names))]
pub fn load_yolo(
    images_dir: &Path,
    class_names: &[String],
) -> Result<(Dataset, Vec<DetectionResults>)> {
    let images = util::list_image_files(images_dir, util::DEFAULT_IMAGE_EXTENSIONS, true)?;
    let mut valid = Vec::with_capacity(images.len());
    let mut dets = Vec::with_capacity(images.len());
    for image in images {
        let Some(labels) = label_path(&image).filter(|path| path.is_file()) else {
            log::warn!("No label file for {}, skipping", image.display());
            continue;
        };
        let (width, height) = image::image_dimensions(&image)?;
        let bboxes = fs::read_to_string(&labels)?
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| parse_yolo_line(line, class_names))
            .collect::<Result<Vec<_>>>()?;
        let name = image
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        dets.push(DetectionResults::new(bboxes, width, height, name));
        valid.push(image);
    }
    log::info!("Loaded {} labelled images from {}", dets.len(), images_dir.display());

    let options = DatasetOptions::default().size(None).grayscale(false);
    let ds = Dataset::from_source(Source::Paths(valid), options)?
        .with_source(Some(images_dir.to_string_lossy().into_owned()));
    Ok((ds, dets))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_files_live_next_to_images() {
        let path = label_path(Path::new("data/train/images/cheque_01.png")).unwrap();
        assert_eq!(path, Path::new("data/train/labels/cheque_01.txt"));
    }

    #[test]
    fn yolo_lines() {
        let classes = vec!["date".to_string(), "amount".to_string()];
        let bbox = parse_yolo_line("1 0.5 0.5 0.2 0.1", &classes).unwrap();
        assert_eq!(bbox.label(), "amount");
        assert!(bbox.is_normalized());
        assert!((bbox.x1() - 0.4).abs() < 1e-9);
        assert!((bbox.y2() - 0.55).abs() < 1e-9);

        assert!(matches!(
            parse_yolo_line("2 0.5 0.5 0.2 0.1", &classes),
            Err(Error::Decode { .. })
        ));
        assert!(parse_yolo_line("0 0.5 0.5", &classes).is_err());
        assert!(parse_yolo_line("0 a 0.5 0.2 0.1", &classes).is_err());
    }

    #[test]
    fn label_studio_layout() {
        let dets = DetectionResults::new(
            vec![BBox::new(10.0, 20.0, 60.0, 70.0, CoordSpace::Absolute).with_label("payee")],
            200,
            100,
            "cheque.jpg",
        );
        let tasks = to_label_studio(&[dets], "images");
        let task = &tasks[0];
        assert_eq!(task["data"]["image"], "/data/local-files/?d=images/cheque.jpg");
        let result = &task["predictions"][0]["result"][0];
        assert_eq!(result["id"], "bbox1");
        assert_eq!(result["original_width"], 200);
        assert_eq!(result["value"]["rectanglelabels"][0], "payee");
        assert!((result["value"]["x"].as_f64().unwrap() - 5.0).abs() < 1e-9);
        assert!((result["value"]["height"].as_f64().unwrap() - 50.0).abs() < 1e-9);
    }

    #[test]
    fn class_names_skip_blank_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("classes.txt");
        fs::write(&path, "date\n\n amount \npayee\n").unwrap();
        assert_eq!(read_class_names(&path).unwrap(), vec!["date", "amount", "payee"]);
    }
}
