use std::{fs, path::Path};

use ocrtoolkit::{
    detect, detector,
    image::{DynamicImage, Rgb, RgbImage},
    io,
    model::Tensor,
    recognize, BBox, CoordSpace, Dataset, DatasetOptions, DetectionModel, DetectionResults,
    LayoutOptions, Model, ModelConfig, ModelRegistry, PredictOptions, RecognitionResults, Result,
    Source,
};

/// Finds the dark words on a page: every maximal run of dark columns inside a
/// dark row band becomes one box.
struct InkDetector;

impl Model for InkDetector {
    type Output = DetectionResults;

    fn name(&self) -> &str {
        "ink"
    }

    fn predict(
        &self,
        inputs: &[Tensor],
        _options: &PredictOptions,
    ) -> Result<Vec<DetectionResults>> {
        Ok(inputs.iter().map(find_ink).collect())
    }
}

fn find_ink(input: &Tensor) -> DetectionResults {
    let (_, height, width) = input.dim();
    let dark = |x: usize, y: usize| input[[0, y, x]] < 0.5;
    let mut bboxes = Vec::new();
    let mut y = 0;
    while y < height {
        if !(0..width).any(|x| dark(x, y)) {
            y += 1;
            continue;
        }
        let top = y;
        while y < height && (0..width).any(|x| dark(x, y)) {
            y += 1;
        }
        let mut x = 0;
        while x < width {
            if !(top..y).any(|row| dark(x, row)) {
                x += 1;
                continue;
            }
            let left = x;
            while x < width && (top..y).any(|row| dark(x, row)) {
                x += 1;
            }
            bboxes.push(
                BBox::new(left as f64, top as f64, x as f64, y as f64, CoordSpace::Absolute)
                    .with_confidence(0.9)
                    .with_label("word"),
            );
        }
    }
    DetectionResults::new(bboxes, width as u32, height as u32, "")
}

/// Reads a crop's width as its text.
struct WidthReader;

impl Model for WidthReader {
    type Output = RecognitionResults;

    fn name(&self) -> &str {
        "width"
    }

    fn predict(
        &self,
        inputs: &[Tensor],
        _options: &PredictOptions,
    ) -> Result<Vec<RecognitionResults>> {
        Ok(inputs
            .iter()
            .map(|input| {
                let (_, h, w) = input.dim();
                RecognitionResults::new(format!("w{w}"), 0.75, w as u32, h as u32)
            })
            .collect())
    }
}

/// White 200x100 page with two words on the first line and one below.
fn page() -> DynamicImage {
    let mut page = RgbImage::from_pixel(200, 100, Rgb([255, 255, 255]));
    for (x1, y1, x2, y2) in [(10, 10, 40, 20), (45, 10, 90, 20), (10, 40, 60, 50)] {
        for y in y1..y2 {
            for x in x1..x2 {
                page.put_pixel(x, y, Rgb([0, 0, 0]));
            }
        }
    }
    DynamicImage::ImageRgb8(page)
}

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn write_pages(dir: &Path, count: usize) {
    for idx in 0..count {
        page().save(dir.join(format!("page_{idx}.png"))).unwrap();
    }
}

#[test]
fn detect_group_and_read_lines() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    write_pages(dir.path(), 2);

    let options = DatasetOptions::default().size(None).grayscale(false);
    let ds = Dataset::from_source(Source::Path(dir.path().to_path_buf()), options).unwrap();
    assert_eq!(ds.names(), ["page_0.png", "page_1.png"]);

    let dets = detect(&InkDetector, &ds, &PredictOptions::default())
        .collect::<Result<Vec<_>>>()
        .unwrap();
    assert_eq!(dets[1].name(), "page_1.png");
    assert_eq!(dets[0].len(), 3);

    let layout = LayoutOptions::default();
    assert_eq!(dets[0].line_groups(&layout), vec![vec![0, 1], vec![2]]);
    let lines = dets[0].group_bboxes(None, &layout).unwrap();
    assert_eq!(lines.bboxes()[0].values(), [10.0, 10.0, 90.0, 20.0]);
    assert_eq!(lines.bboxes()[1].values(), [10.0, 40.0, 60.0, 50.0]);

    let image = ds.get("page_0.png").unwrap();
    let crops = lines.create_ds(&image).unwrap();
    let texts = recognize(&WidthReader, &crops, &PredictOptions::default())
        .collect::<Result<Vec<_>>>()
        .unwrap();
    let read = lines.attach_text(&texts).unwrap();
    let words = read.iter().map(BBox::text).collect::<Vec<_>>();
    assert_eq!(words, vec!["w80", "w50"]);
}

#[test]
fn resumable_batches_match_streaming() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let pages = dir.path().join("pages");
    let out = dir.path().join("dets");
    fs::create_dir(&pages).unwrap();
    write_pages(&pages, 5);

    let options = DatasetOptions::default().size(None);
    let ds = Dataset::from_source(Source::Path(pages), options).unwrap();
    fn ink(_config: &ModelConfig) -> Result<Box<DetectionModel>> {
        Ok(Box::new(InkDetector))
    }
    let registry = ModelRegistry::<DetectionModel>::new().register("ink", ink);
    let model = registry.load("ink", &ModelConfig::default()).unwrap();

    // First run stops after two batches, the second one resumes.
    let first = detector::detect_batches(model.as_ref(), &ds, 2, 0, &PredictOptions::default())
        .unwrap()
        .take(2)
        .map(|(_, dets)| dets.unwrap())
        .collect::<Vec<_>>();
    let options = PredictOptions::default();
    let written = detector::detect_to_dir(model.as_ref(), &ds, 2, 2, &out, &options).unwrap();
    assert_eq!(written, 1);
    assert_eq!(detector::load_batches(&out).unwrap().len(), 1);

    let written = detector::detect_to_dir(model.as_ref(), &ds, 2, 0, &out, &options).unwrap();
    assert_eq!(written, 3);
    let resumed = detector::load_batches(&out).unwrap();
    let streamed = detect(model.as_ref(), &ds, &PredictOptions::default().verbose(false))
        .collect::<Result<Vec<_>>>()
        .unwrap();
    assert_eq!(resumed, streamed);
    assert_eq!(first.concat(), streamed[..4]);
}

#[test]
fn yolo_folder_to_label_studio() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let images = dir.path().join("images");
    let labels = dir.path().join("labels");
    fs::create_dir(&images).unwrap();
    fs::create_dir(&labels).unwrap();
    write_pages(&images, 2);
    let label_file = "0 0.125 0.15 0.15 0.1\n1 0.3375 0.15 0.225 0.1\n";
    fs::write(labels.join("page_0.txt"), label_file).unwrap();
    fs::write(dir.path().join("classes.txt"), "word\nnumber\n").unwrap();

    let class_names = io::read_class_names(&dir.path().join("classes.txt")).unwrap();
    let (ds, dets) = io::load_yolo(&images, &class_names).unwrap();
    assert_eq!(ds.names(), ["page_0.png"]);
    assert_eq!(dets.len(), 1);
    assert_eq!(dets[0].bboxes()[0].values(), [10.0, 10.0, 40.0, 20.0]);
    assert_eq!(dets[0].bboxes()[1].label(), "number");

    let json_path = dir.path().join("tasks.json");
    io::save_dets_as_label_studio(&dets, &json_path, "images").unwrap();
    let tasks: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&json_path).unwrap()).unwrap();
    assert_eq!(tasks[0]["data"]["image"], "/data/local-files/?d=images/page_0.png");
    assert_eq!(tasks[0]["predictions"][0]["result"].as_array().unwrap().len(), 2);

    let archive = dir.path().join("dets.bin");
    io::save_dets(&dets, &archive).unwrap();
    assert_eq!(io::load_dets(&archive).unwrap(), dets);
}

#[test]
fn dataset_archive_round_trip() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    write_pages(dir.path(), 5);
    let options = DatasetOptions::default()
        .size(Some((100, 50)))
        .grayscale(false)
        .batched(true);
    let ds = Dataset::from_source(Source::Path(dir.path().to_path_buf()), options)
        .unwrap()
        .get_as_ds(["page_3.png", "page_1.png", "page_4.png", "page_0.png", "page_2.png"])
        .unwrap();
    let archive = dir.path().join("ds.bin");
    ds.save(&archive).unwrap();

    let loaded = Dataset::load(&archive).unwrap();
    assert_eq!(loaded.len(), 5);
    assert_eq!(loaded.names(), ds.names());
    assert!(loaded.batched());
    assert_eq!(loaded.options(), ds.options());
    let image = loaded.get("page_4.png").unwrap();
    assert_eq!((image.width(), image.height()), (100, 50));
}
