//! Lazy, keyed, batchable image datasets.
//!
//! A [`Dataset`] owns raw items (paths or in-memory images) and their unique
//! names. Items are only decoded when read, and the transform pipeline runs
//! again on every read. Sub-datasets (`sample`, `batch`, `get_as_ds`,
//! `train_test_split`) are independent values that share nothing with their
//! parent.

use std::{
    collections::HashMap,
    fmt,
    fs::File,
    io::{BufReader, BufWriter},
    ops::Range,
    path::{Path, PathBuf},
};

use image::DynamicImage;
use rand::{seq::SliceRandom, Rng};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::{
    transform::{apply_all, pipeline, Transform},
    util::{self, DEFAULT_IMAGE_EXTENSIONS},
    Error, Result,
};

/// One raw dataset entry.
#[derive(Clone)]
pub enum Item {
    Path(PathBuf),
    Image(DynamicImage),
}

impl fmt::Debug for Item {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Item::Path(path) => f.debug_tuple("Path").field(path).finish(),
            Item::Image(image) => f
                .debug_struct("Image")
                .field("width", &image.width())
                .field("height", &image.height())
                .finish(),
        }
    }
}

impl Item {
    pub(crate) fn decode(&self) -> Result<DynamicImage> {
        match self {
            Item::Path(path) => Ok(image::open(path)?),
            Item::Image(image) => Ok(image.clone()),
        }
    }

    fn default_name(&self, idx: usize) -> String {
        match self {
            Item::Path(path) => path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.to_string_lossy().into_owned()),
            Item::Image(_) => format!("Image: {idx}"),
        }
    }
}

/// What a dataset is built from.
#[derive(Debug, Clone)]
pub enum Source {
    /// A single image file or a directory of images.
    Path(PathBuf),
    Paths(Vec<PathBuf>),
    Image(DynamicImage),
    Images(Vec<DynamicImage>),
}

/// Key accepted by [`Dataset::get`]. Negative indices count from the end.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ItemKey {
    Index(isize),
    Name(String),
}

impl fmt::Display for ItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemKey::Index(idx) => write!(f, "{idx}"),
            ItemKey::Name(name) => write!(f, "{name:?}"),
        }
    }
}

impl From<usize> for ItemKey {
    fn from(idx: usize) -> Self {
        ItemKey::Index(idx as isize)
    }
}

impl From<isize> for ItemKey {
    fn from(idx: isize) -> Self {
        ItemKey::Index(idx)
    }
}

impl From<i32> for ItemKey {
    fn from(idx: i32) -> Self {
        ItemKey::Index(idx as isize)
    }
}

impl From<&str> for ItemKey {
    fn from(name: &str) -> Self {
        ItemKey::Name(name.to_string())
    }
}

impl From<String> for ItemKey {
    fn from(name: String) -> Self {
        ItemKey::Name(name)
    }
}

impl From<&String> for ItemKey {
    fn from(name: &String) -> Self {
        ItemKey::Name(name.clone())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DatasetOptions {
    /// Target `(width, height)`; `None` keeps the original resolution.
    pub size: Option<(u32, u32)>,
    pub grayscale: bool,
    /// Consumers should submit the whole dataset as one unit.
    pub batched: bool,
    /// Extensions picked up when expanding a directory.
    pub extensions: Vec<String>,
    /// Skip dot-files inside expanded directories. The directory given as
    /// the source is expanded regardless of its own name.
    pub skip_hidden: bool,
}

impl Default for DatasetOptions {
    fn default() -> Self {
        Self {
            size: Some((640, 320)),
            grayscale: true,
            batched: false,
            extensions: DEFAULT_IMAGE_EXTENSIONS
                .iter()
                .map(|ext| ext.to_string())
                .collect(),
            skip_hidden: true,
        }
    }
}

impl DatasetOptions {
    pub fn size(mut self, size: Option<(u32, u32)>) -> Self {
        self.size = size;
        self
    }

    pub fn grayscale(mut self, grayscale: bool) -> Self {
        self.grayscale = grayscale;
        self
    }

    pub fn batched(mut self, batched: bool) -> Self {
        self.batched = batched;
        self
    }

    pub fn extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extensions = extensions.into_iter().map(Into::into).collect();
        self
    }

    pub fn skip_hidden(mut self, skip_hidden: bool) -> Self {
        self.skip_hidden = skip_hidden;
        self
    }
}

#[derive(Debug, Clone)]
pub struct Dataset {
    source: Option<String>,
    parent: Option<String>,
    items: Vec<Item>,
    names: Vec<String>,
    lookup: HashMap<ItemKey, usize>,
    transforms: Vec<Transform>,
    options: DatasetOptions,
}

#[derive(Serialize, Deserialize)]
struct ClassAttributes {
    source: Option<String>,
    size: Option<(u32, u32)>,
    grayscale: bool,
    batched: bool,
    names: Vec<String>,
}

#[derive(Serialize, Deserialize)]
enum ItemData {
    Path(String),
    Encoded(Vec<u8>),
}

#[derive(Serialize, Deserialize)]
struct ArchivedItem {
    key: String,
    data: ItemData,
}

#[derive(Serialize, Deserialize)]
struct DatasetArchive {
    class_attributes: ClassAttributes,
    items: Vec<ArchivedItem>,
}

impl Dataset {
    /// Builds a dataset from a path, a list of paths or in-memory images.
    #[instrument(level = "debug", skip(source))]
    pub fn from_source(source: Source, options: DatasetOptions) -> Result<Self> {
        let (descriptor, items) = match source {
            Source::Path(path) => {
                let items = if path.is_file() {
                    vec![path.clone()]
                } else if path.is_dir() {
                    util::list_image_files(&path, &options.extensions, options.skip_hidden)?
                } else {
                    return Err(Error::InvalidSource(path));
                };
                (
                    Some(path.to_string_lossy().into_owned()),
                    items.into_iter().map(Item::Path).collect(),
                )
            }
            Source::Paths(paths) => (None, paths.into_iter().map(Item::Path).collect()),
            Source::Image(image) => (None, vec![Item::Image(image)]),
            Source::Images(images) => (None, images.into_iter().map(Item::Image).collect()),
        };
        Ok(Self::from_items(items, None, options)?.with_source(descriptor))
    }

    /// Builds a dataset from already resolved items. Names default to the
    /// file name of path items and `"Image: {i}"` for in-memory images.
    pub fn from_items(
        items: Vec<Item>,
        names: Option<Vec<String>>,
        options: DatasetOptions,
    ) -> Result<Self> {
        let names = match names {
            Some(names) => names,
            None => items
                .iter()
                .enumerate()
                .map(|(idx, item)| item.default_name(idx))
                .collect(),
        };
        if names.len() != items.len() {
            return Err(Error::invalid_argument(format!(
                "{} names given for {} items",
                names.len(),
                items.len()
            )));
        }

        let mut lookup = HashMap::with_capacity(names.len() * 2);
        for (idx, name) in names.iter().enumerate() {
            if lookup.insert(ItemKey::Name(name.clone()), idx).is_some() {
                return Err(Error::DuplicateName(name.clone()));
            }
            lookup.insert(ItemKey::Index(idx as isize), idx);
        }

        Ok(Self {
            source: None,
            parent: None,
            items,
            names,
            lookup,
            transforms: pipeline(options.size, options.grayscale),
            options,
        })
    }

    pub fn with_source(mut self, source: Option<String>) -> Self {
        self.source = source;
        self
    }

    /// Records the image this dataset was cropped from.
    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    pub fn empty_like(other: &Dataset) -> Self {
        Self {
            source: other.source.clone(),
            parent: other.parent.clone(),
            items: Vec::new(),
            names: Vec::new(),
            lookup: HashMap::new(),
            transforms: other.transforms.clone(),
            options: other.options.clone(),
        }
    }

    /// Concatenates datasets, taking the configuration of the first one.
    pub fn concat(datasets: &[Dataset], reset_names: bool) -> Result<Self> {
        let Some(first) = datasets.first() else {
            return Err(Error::invalid_argument("nothing to concatenate"));
        };
        let items = datasets
            .iter()
            .flat_map(|ds| ds.items.iter().cloned())
            .collect::<Vec<_>>();
        let names = (!reset_names).then(|| {
            datasets
                .iter()
                .flat_map(|ds| ds.names.iter().cloned())
                .collect()
        });
        let options = first.options.clone().batched(false);
        Ok(Self::from_items(items, names, options)?.with_source(first.source.clone()))
    }

    fn derive(&self, indices: &[usize], batched: bool) -> Result<Self> {
        let items = indices.iter().map(|idx| self.items[*idx].clone()).collect();
        let names = indices.iter().map(|idx| self.names[*idx].clone()).collect();
        let mut derived =
            Self::from_items(items, Some(names), self.options.clone().batched(batched))?
                .with_source(self.source.clone());
        derived.parent = self.parent.clone();
        Ok(derived)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn items(&self) -> &[Item] {
        &self.items
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn batched(&self) -> bool {
        self.options.batched
    }

    pub fn options(&self) -> &DatasetOptions {
        &self.options
    }

    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    pub fn parent(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    pub fn transforms(&self) -> &[Transform] {
        &self.transforms
    }

    /// Position of `key` in the dataset.
    pub fn resolve(&self, key: impl Into<ItemKey>) -> Result<usize> {
        let key = match key.into() {
            ItemKey::Index(idx) if idx < 0 => ItemKey::Index(idx + self.len() as isize),
            key => key,
        };
        self.lookup
            .get(&key)
            .copied()
            .ok_or_else(|| Error::KeyNotFound(key.to_string()))
    }

    /// Decodes and transforms the item identified by `key`.
    pub fn get(&self, key: impl Into<ItemKey>) -> Result<DynamicImage> {
        let idx = self.resolve(key)?;
        apply_all(&self.items[idx], &self.transforms)
    }

    pub fn iter(&self) -> impl Iterator<Item = Result<DynamicImage>> + '_ {
        self.items
            .iter()
            .map(|item| apply_all(item, &self.transforms))
    }

    /// Random sample of `min(k, len)` distinct items.
    pub fn sample(&self, k: i64, batched: bool) -> Result<Self> {
        self.sample_with_rng(k, batched, &mut rand::thread_rng())
    }

    pub fn sample_with_rng<R: Rng + ?Sized>(
        &self,
        k: i64,
        batched: bool,
        rng: &mut R,
    ) -> Result<Self> {
        if k < 0 {
            log::error!("k cannot be negative");
            return Err(Error::invalid_argument("k cannot be negative"));
        }
        let amount = (k as usize).min(self.len());
        let indices = rand::seq::index::sample(rng, self.len(), amount).into_vec();
        self.derive(&indices, batched)
    }

    pub fn num_batches(&self, size: usize) -> usize {
        if size == 0 {
            return 0;
        }
        self.len().div_ceil(size)
    }

    /// Batch `index` of `size` items. `size` is clamped to the dataset length,
    /// negative indices count from the last batch, and the last batch may be
    /// short.
    pub fn batch(&self, size: usize, index: isize) -> Result<Self> {
        if size == 0 {
            return Err(Error::invalid_argument("batch size must be positive"));
        }
        if self.is_empty() {
            return self.derive(&[], true);
        }
        let size = size.min(self.len());
        let index = if index < 0 {
            index + self.num_batches(size) as isize
        } else {
            index
        };
        let start = (index.max(0) as usize).saturating_mul(size).min(self.len());
        let end = (start + size).min(self.len());
        let indices = (start..end).collect::<Vec<_>>();
        self.derive(&indices, true)
    }

    /// Sub-dataset of the items identified by `keys`, in the given order.
    pub fn get_as_ds<I, K>(&self, keys: I) -> Result<Self>
    where
        I: IntoIterator<Item = K>,
        K: Into<ItemKey>,
    {
        let indices = keys
            .into_iter()
            .map(|key| self.resolve(key))
            .collect::<Result<Vec<_>>>()?;
        self.derive(&indices, self.batched())
    }

    pub fn slice(&self, range: Range<usize>) -> Result<Self> {
        let end = range.end.min(self.len());
        let start = range.start.min(end);
        let indices = (start..end).collect::<Vec<_>>();
        self.derive(&indices, self.batched())
    }

    /// Random, non-stratified train/test split. Sizes follow
    /// `ceil(test * len)` and `floor(train * len)`.
    pub fn train_test_split(&self, train_size: f64, test_size: f64) -> Result<(Self, Self)> {
        self.train_test_split_with_rng(train_size, test_size, &mut rand::thread_rng())
    }

    pub fn train_test_split_with_rng<R: Rng + ?Sized>(
        &self,
        train_size: f64,
        test_size: f64,
        rng: &mut R,
    ) -> Result<(Self, Self)> {
        if train_size + test_size > 1.0 + 1e-9 {
            return Err(Error::invalid_argument(
                "train_size + test_size must be <= 1",
            ));
        }
        if train_size <= 0.0 || test_size <= 0.0 {
            return Err(Error::invalid_argument(
                "train_size and test_size must be positive",
            ));
        }
        let len = self.len();
        let n_test = (test_size * len as f64).ceil() as usize;
        let n_train = (train_size * len as f64).floor() as usize;
        if n_train == 0 || n_test + n_train > len {
            return Err(Error::invalid_argument(format!(
                "cannot split {len} items into {n_train} train and {n_test} test items"
            )));
        }

        let mut indices = (0..len).collect::<Vec<_>>();
        indices.shuffle(rng);
        let test = self.derive(&indices[..n_test], self.batched())?;
        let train = self.derive(&indices[n_test..n_test + n_train], self.batched())?;
        Ok((train, test))
    }

    /// Writes items, names and configuration to one binary archive.
    #[instrument(skip(self), fields(items = self.len()))]
    pub fn save(&self, path: impl AsRef<Path> + fmt::Debug) -> Result<()> {
        let items = self
            .items
            .iter()
            .enumerate()
            .map(|(idx, item)| {
                let data = match item {
                    Item::Path(path) => ItemData::Path(path.to_string_lossy().into_owned()),
                    Item::Image(image) => ItemData::Encoded(util::encode_png(image)?),
                };
                Ok(ArchivedItem {
                    key: format!("item_{idx}"),
                    data,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let archive = DatasetArchive {
            class_attributes: ClassAttributes {
                source: self.source.clone(),
                size: self.options.size,
                grayscale: self.options.grayscale,
                batched: self.options.batched,
                names: self.names.clone(),
            },
            items,
        };
        let writer = BufWriter::new(File::create(path.as_ref())?);
        bincode::serialize_into(writer, &archive)?;
        log::info!("Dataset saved to {}", path.as_ref().display());
        Ok(())
    }

    #[instrument]
    pub fn load(path: impl AsRef<Path> + fmt::Debug) -> Result<Self> {
        let reader = BufReader::new(File::open(path.as_ref())?);
        let mut archive: DatasetArchive = bincode::deserialize_from(reader)?;

        archive.items.sort_by_key(|item| {
            item.key
                .rsplit('_')
                .next()
                .and_then(|idx| idx.parse::<usize>().ok())
                .unwrap_or(usize::MAX)
        });
        let items = archive
            .items
            .into_iter()
            .map(|item| match item.data {
                ItemData::Path(path) => Ok(Item::Path(PathBuf::from(path))),
                ItemData::Encoded(bytes) => Ok(Item::Image(util::decode_image(&bytes)?)),
            })
            .collect::<Result<Vec<_>>>()?;

        let attributes = archive.class_attributes;
        let options = DatasetOptions::default()
            .size(attributes.size)
            .grayscale(attributes.grayscale)
            .batched(attributes.batched);
        let dataset = Self::from_items(items, Some(attributes.names), options)?
            .with_source(attributes.source);
        log::info!("Dataset loaded from {}", path.as_ref().display());
        Ok(dataset)
    }
}
