//! Detection driver: streams datasets through a detection backend.

use std::{
    fs,
    path::{Path, PathBuf},
};

use tracing::instrument;

use crate::{
    io,
    model::{run, Model, PredictOptions},
    Dataset, DetectionResults, Error, Result,
};

const BATCH_FILE_PREFIX: &str = "dets_batch_";

/// Detections for every item of `ds`, in order. Nothing runs until the
/// iterator is advanced.
pub fn detect<'a, M>(
    model: &'a M,
    ds: &'a Dataset,
    options: &PredictOptions,
) -> impl Iterator<Item = Result<DetectionResults>> + 'a
where
    M: Model<Output = DetectionResults> + ?Sized,
{
    run(model, ds, options)
}

/// Per-batch detections starting at batch `start_batch_idx`, yielded as
/// `(batch_idx, detections)`. Each batch is submitted to the backend as a
/// whole.
pub fn detect_batches<'a, M>(
    model: &'a M,
    ds: &'a Dataset,
    batch_size: usize,
    start_batch_idx: usize,
    options: &PredictOptions,
) -> Result<impl Iterator<Item = (usize, Result<Vec<DetectionResults>>)> + 'a>
where
    M: Model<Output = DetectionResults> + ?Sized,
{
    if batch_size == 0 {
        return Err(Error::invalid_argument("batch size must be positive"));
    }
    let num_batches = ds.num_batches(batch_size);
    let options = options.clone();
    Ok((start_batch_idx..num_batches).map(move |batch_idx| {
        log::debug!("Detecting batch {}/{num_batches}", batch_idx + 1);
        let dets = ds
            .batch(batch_size, batch_idx as isize)
            .and_then(|batch| run(model, &batch, &options).collect::<Result<Vec<_>>>());
        (batch_idx, dets)
    }))
}

fn batch_file(out_dir: &Path, batch_idx: usize) -> PathBuf {
    out_dir.join(format!("{BATCH_FILE_PREFIX}{batch_idx}.bin"))
}

/// Runs [`detect_batches`] and writes every batch to
/// `out_dir/dets_batch_{idx}.bin` as soon as it completes. Returns the number
/// of batches written. After a failure, pass the index of the first missing
/// file as `start_batch_idx` to resume.
#[instrument(skip(model, ds, options), fields(items = ds.len()))]
pub fn detect_to_dir<M>(
    model: &M,
    ds: &Dataset,
    batch_size: usize,
    start_batch_idx: usize,
    out_dir: &Path,
    options: &PredictOptions,
) -> Result<usize>
where
    M: Model<Output = DetectionResults> + ?Sized,
{
    fs::create_dir_all(out_dir)?;
    let mut written = 0;
    for (batch_idx, dets) in detect_batches(model, ds, batch_size, start_batch_idx, options)? {
        let dets = dets.inspect_err(|err| {
            log::warn!("Batch {batch_idx} failed, resume with start_batch_idx={batch_idx}: {err}")
        })?;
        io::save_dets(&dets, &batch_file(out_dir, batch_idx))?;
        written += 1;
    }
    log::info!("Wrote {written} detection batches to {}", out_dir.display());
    Ok(written)
}

/// Reads back every `dets_batch_{idx}.bin` in `dir`, in batch order.
#[instrument]
pub fn load_batches(dir: &Path) -> Result<Vec<DetectionResults>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let batch_idx = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .and_then(|stem| stem.strip_prefix(BATCH_FILE_PREFIX))
            .and_then(|idx| idx.parse::<usize>().ok());
        if let Some(batch_idx) = batch_idx {
            files.push((batch_idx, path));
        }
    }
    files.sort_by_key(|(batch_idx, _)| *batch_idx);

    let mut dets = Vec::new();
    for (_, path) in files {
        dets.extend(io::load_dets(&path)?);
    }
    Ok(dets)
}
