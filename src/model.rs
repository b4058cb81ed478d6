//! Contract between the drivers and detection/recognition backends.

use std::{collections::BTreeMap, fmt, path::PathBuf, str::FromStr};

use image::DynamicImage;
use ndarray::Array3;
use tracing::instrument;

use crate::{
    result::Named, util::subtract_mean_normalize, Dataset, DetectionResults, Error,
    RecognitionResults, Result,
};

/// CHW float image handed to [`Model::predict`].
pub type Tensor = Array3<f32>;

/// A detection or recognition backend.
///
/// Drivers call [`preprocess`](Model::preprocess) on the transformed dataset
/// images and pass the result to [`predict`](Model::predict), which must
/// return exactly one output per input, in input order.
pub trait Model {
    type Output;

    fn name(&self) -> &str;

    /// Option keys [`predict`](Model::predict) understands. Anything else is
    /// dropped before the call.
    fn valid_options(&self) -> &[&str] {
        &[]
    }

    fn preprocess(&self, images: Vec<DynamicImage>) -> Result<Vec<Tensor>> {
        Ok(images
            .iter()
            .map(|image| subtract_mean_normalize(image, &[0.0; 3], &[1.0; 3]))
            .collect())
    }

    fn predict(&self, inputs: &[Tensor], options: &PredictOptions) -> Result<Vec<Self::Output>>;
}

pub type DetectionModel = dyn Model<Output = DetectionResults>;
pub type RecognitionModel = dyn Model<Output = RecognitionResults>;

/// Free-form backend options plus the driver's own `verbose` flag.
#[derive(Debug, Clone, PartialEq)]
pub struct PredictOptions {
    pub verbose: bool,
    values: BTreeMap<String, String>,
}

impl Default for PredictOptions {
    fn default() -> Self {
        Self {
            verbose: true,
            values: BTreeMap::new(),
        }
    }
}

impl PredictOptions {
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn set(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.values.insert(key.into(), value.to_string());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn get_parsed<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        self.get(key)
            .map(|value| {
                value.parse::<T>().map_err(|err| {
                    Error::invalid_argument(format!("option {key}={value:?}: {err}"))
                })
            })
            .transpose()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    /// Copy restricted to the keys in `valid`.
    pub fn filtered(&self, valid: &[&str]) -> Self {
        let values = self
            .values
            .iter()
            .filter(|(key, _)| valid.contains(&key.as_str()))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect::<BTreeMap<_, _>>();
        if values.len() != self.values.len() {
            log::debug!(
                "Dropping unsupported options {:?}",
                self.keys()
                    .filter(|key| !values.contains_key(*key))
                    .collect::<Vec<_>>()
            );
        }
        Self {
            verbose: self.verbose,
            values,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelConfig {
    pub path: PathBuf,
    pub device: String,
    pub options: PredictOptions,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::new(),
            device: "cpu".to_string(),
            options: PredictOptions::default(),
        }
    }
}

impl ModelConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn device(mut self, device: impl Into<String>) -> Self {
        self.device = device.into();
        self
    }

    pub fn options(mut self, options: PredictOptions) -> Self {
        self.options = options;
        self
    }
}

pub type Constructor<M> = fn(&ModelConfig) -> Result<Box<M>>;

/// Backend constructors keyed by name.
pub struct ModelRegistry<M: ?Sized> {
    constructors: BTreeMap<String, Constructor<M>>,
}

impl<M: ?Sized> Default for ModelRegistry<M> {
    fn default() -> Self {
        Self {
            constructors: BTreeMap::new(),
        }
    }
}

impl<M: ?Sized> ModelRegistry<M> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, key: impl Into<String>, constructor: Constructor<M>) -> Self {
        self.constructors.insert(key.into(), constructor);
        self
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.constructors.keys().map(String::as_str)
    }

    #[instrument(level = "debug", skip(self, config))]
    pub fn load(&self, key: &str, config: &ModelConfig) -> Result<Box<M>> {
        let constructor = self
            .constructors
            .get(key)
            .ok_or_else(|| Error::UnsupportedModel(key.to_string()))?;
        log::info!("Loading {key} model from {}", config.path.display());
        constructor(config)
    }
}

fn predict_range<M>(
    model: &M,
    ds: &Dataset,
    indices: std::ops::Range<usize>,
    options: &PredictOptions,
) -> Result<Vec<M::Output>>
where
    M: Model + ?Sized,
    M::Output: Named,
{
    let images = indices
        .clone()
        .map(|idx| ds.get(idx))
        .collect::<Result<Vec<_>>>()?;
    let inputs = model.preprocess(images)?;
    let mut outputs = model.predict(&inputs, options)?;
    if outputs.len() != indices.len() {
        return Err(Error::Backend(format!(
            "{} returned {} outputs for {} inputs",
            model.name(),
            outputs.len(),
            indices.len()
        )));
    }
    for (output, name) in outputs.iter_mut().zip(&ds.names()[indices]) {
        output.set_name(name);
    }
    Ok(outputs)
}

/// Streams model outputs for `ds` in dataset order. Batched datasets go
/// through a single `predict` call, others one item at a time.
pub(crate) fn run<'a, M>(
    model: &'a M,
    ds: &'a Dataset,
    options: &PredictOptions,
) -> Box<dyn Iterator<Item = Result<M::Output>> + 'a>
where
    M: Model + ?Sized,
    M::Output: Named + 'a,
{
    let options = options.filtered(model.valid_options());
    let total = ds.len();
    if ds.batched() {
        log::debug!("Predicting {total} items in one batch with {}", model.name());
        let outputs = std::iter::once_with(move || predict_range(model, ds, 0..total, &options));
        return Box::new(outputs.flat_map(|result| match result {
            Ok(outputs) => outputs.into_iter().map(Ok).collect::<Vec<_>>(),
            Err(err) => vec![Err(err)],
        }));
    }
    Box::new((0..total).map(move |idx| {
        let output = predict_range(model, ds, idx..idx + 1, &options)?
            .pop()
            .ok_or_else(|| Error::Backend(format!("{} returned no output", model.name())))?;
        if options.verbose {
            log::info!("{}: {}/{total} {}", model.name(), idx + 1, ds.names()[idx]);
        }
        Ok(output)
    }))
}

#[cfg(test)]
mod tests {
    use image::{Rgb, RgbImage};

    use super::*;
    use crate::{DatasetOptions, Source};

    struct Echo;

    impl Model for Echo {
        type Output = RecognitionResults;

        fn name(&self) -> &str {
            "echo"
        }

        fn valid_options(&self) -> &[&str] {
            &["prefix"]
        }

        fn predict(
            &self,
            inputs: &[Tensor],
            options: &PredictOptions,
        ) -> Result<Vec<Self::Output>> {
            let prefix = options.get("prefix").unwrap_or_default();
            assert!(options.get("ignored").is_none());
            Ok(inputs
                .iter()
                .map(|input| {
                    let (_, h, w) = input.dim();
                    RecognitionResults::new(format!("{prefix}{w}"), 1.0, w as u32, h as u32)
                })
                .collect())
        }
    }

    struct Lossy;

    impl Model for Lossy {
        type Output = RecognitionResults;

        fn name(&self) -> &str {
            "lossy"
        }

        fn predict(
            &self,
            _inputs: &[Tensor],
            _options: &PredictOptions,
        ) -> Result<Vec<Self::Output>> {
            Ok(Vec::new())
        }
    }

    fn dataset(batched: bool) -> Dataset {
        let images = (1..=3)
            .map(|w| DynamicImage::ImageRgb8(RgbImage::from_pixel(w, 2, Rgb([0, 0, 0]))))
            .collect();
        let options = DatasetOptions::default().size(None).batched(batched);
        Dataset::from_source(Source::Images(images), options).unwrap()
    }

    #[test]
    fn outputs_follow_dataset_order() {
        let options = PredictOptions::default().set("prefix", "w=").set("ignored", 1);
        for batched in [false, true] {
            let ds = dataset(batched);
            let outputs = run(&Echo, &ds, &options).collect::<Result<Vec<_>>>().unwrap();
            let texts = outputs.iter().map(|it| it.text.as_str()).collect::<Vec<_>>();
            assert_eq!(texts, vec!["w=1", "w=2", "w=3"]);
            assert_eq!(outputs[2].name, "Image: 2");
        }
    }

    #[test]
    fn output_count_mismatch_is_a_backend_error() {
        let ds = dataset(true);
        let results = run(&Lossy, &ds, &PredictOptions::default()).collect::<Vec<_>>();
        assert_eq!(results.len(), 1);
        assert!(matches!(results[0], Err(Error::Backend(_))));
    }

    #[test]
    fn option_parsing() {
        let options = PredictOptions::default().set("conf", 0.25).set("bad", "x");
        assert_eq!(options.get_parsed::<f32>("conf").unwrap(), Some(0.25));
        assert_eq!(options.get_parsed::<f32>("missing").unwrap(), None);
        assert!(options.get_parsed::<f32>("bad").is_err());
        let filtered = options.filtered(&["conf"]);
        assert_eq!(filtered.keys().collect::<Vec<_>>(), vec!["conf"]);
    }

    #[test]
    fn registry_dispatch() {
        fn echo(_config: &ModelConfig) -> Result<Box<RecognitionModel>> {
            Ok(Box::new(Echo))
        }
        let registry = ModelRegistry::<RecognitionModel>::new().register("echo", echo);
        assert_eq!(registry.keys().collect::<Vec<_>>(), vec!["echo"]);
        let model = registry.load("echo", &ModelConfig::new("weights.onnx")).unwrap();
        assert_eq!(model.name(), "echo");
        assert!(matches!(
            registry.load("gcv", &ModelConfig::default()),
            Err(Error::UnsupportedModel(key)) if key == "gcv"
        ));
    }
}
