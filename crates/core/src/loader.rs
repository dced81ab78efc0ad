//! Parallel batch loading.
//!
//! Instances of one batch are read on blocking worker tasks, at most
//! `workers` at a time. The producer waits for every instance of the batch,
//! collates them in order and hands the batch to a bounded channel, so at most
//! `buffer_size` batches are prefetched ahead of the consumer.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::collate::{collate, Batch};
use crate::config::LoaderConfig;
use crate::dataset::{ATrainDataset, InstanceRecord};
use crate::transforms::TransformPipeline;

pub const DEFAULT_BUFFER_SIZE: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoaderOptions {
    pub batch_size: usize,
    pub workers: usize,
    pub buffer_size: usize,
    pub shuffle: bool,
    pub seed: Option<u64>,
    pub drop_last: bool,
}

impl LoaderOptions {
    pub fn from_config(config: &LoaderConfig) -> Self {
        Self {
            batch_size: config.batch_size.max(1),
            workers: config.workers.max(1),
            buffer_size: config.buffer_size.max(1),
            shuffle: config.shuffle,
            seed: config.seed,
            drop_last: config.drop_last,
        }
    }
}

impl Default for LoaderOptions {
    fn default() -> Self {
        Self::from_config(&LoaderConfig::default())
    }
}

pub struct BatchLoader {
    dataset: Arc<ATrainDataset>,
    options: LoaderOptions,
}

impl BatchLoader {
    pub fn new(dataset: Arc<ATrainDataset>, options: LoaderOptions) -> Self {
        Self { dataset, options }
    }

    pub fn dataset(&self) -> &Arc<ATrainDataset> {
        &self.dataset
    }

    pub fn options(&self) -> &LoaderOptions {
        &self.options
    }

    /// Dataset indices of every batch of `epoch`, in delivery order.
    ///
    /// A seeded shuffle is reproducible per epoch.
    pub fn batch_plan(&self, epoch: u64) -> Vec<Vec<usize>> {
        let mut order: Vec<usize> = (0..self.dataset.len()).collect();
        if self.options.shuffle {
            let mut rng = match self.options.seed {
                Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(epoch)),
                None => StdRng::from_os_rng(),
            };
            order.shuffle(&mut rng);
        }

        let batch_size = self.options.batch_size.max(1);
        order
            .chunks(batch_size)
            .filter(|chunk| !self.options.drop_last || chunk.len() == batch_size)
            .map(<[usize]>::to_vec)
            .collect()
    }

    pub fn num_batches(&self) -> usize {
        let len = self.dataset.len();
        let batch_size = self.options.batch_size.max(1);
        if self.options.drop_last {
            len / batch_size
        } else {
            len.div_ceil(batch_size)
        }
    }

    /// Start producing the batches of `epoch`.
    ///
    /// The stream ends after the last batch, after the first error, or once
    /// `cancel` turns true. Cancellation is checked between batches.
    pub fn stream(&self, epoch: u64, cancel: watch::Receiver<bool>) -> BatchStream {
        let plan = self.batch_plan(epoch);
        let (tx, rx) = mpsc::channel(self.options.buffer_size.max(1));
        let workers = Arc::new(Semaphore::new(self.options.workers.max(1)));

        info!(
            epoch,
            batches = plan.len(),
            workers = self.options.workers,
            "Starting batch loader"
        );
        let handle = tokio::spawn(run_producer(
            Arc::clone(&self.dataset),
            plan,
            workers,
            tx,
            cancel,
        ));

        BatchStream {
            rx,
            handle,
            transforms: None,
        }
    }
}

pub struct BatchStream {
    rx: mpsc::Receiver<Result<Batch>>,
    handle: JoinHandle<()>,
    transforms: Option<TransformPipeline>,
}

impl BatchStream {
    /// Apply `transforms` to every batch on the consumer side.
    pub fn with_transforms(mut self, transforms: TransformPipeline) -> Self {
        self.transforms = Some(transforms);
        self
    }

    pub async fn next(&mut self) -> Option<Result<Batch>> {
        let item = self.rx.recv().await?;
        Some(item.map(|mut batch| {
            if let Some(transforms) = self.transforms.as_mut() {
                transforms.apply(&mut batch);
            }
            batch
        }))
    }

    /// Drain the stream, stopping at the first error.
    pub async fn collect(mut self) -> Result<Vec<Batch>> {
        let mut batches = Vec::new();
        while let Some(item) = self.next().await {
            batches.push(item?);
        }
        Ok(batches)
    }
}

impl Drop for BatchStream {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn run_producer(
    dataset: Arc<ATrainDataset>,
    plan: Vec<Vec<usize>>,
    workers: Arc<Semaphore>,
    output: mpsc::Sender<Result<Batch>>,
    cancel: watch::Receiver<bool>,
) {
    for (batch_no, indices) in plan.into_iter().enumerate() {
        if *cancel.borrow() {
            debug!(batch_no, "Batch loader cancelled");
            return;
        }

        let result = load_batch(&dataset, &indices, &workers)
            .await
            .with_context(|| format!("failed to build batch {batch_no}"));
        let failed = result.is_err();
        if output.send(result).await.is_err() {
            debug!(batch_no, "Batch consumer went away");
            return;
        }
        if failed {
            return;
        }
    }
}

async fn load_batch(
    dataset: &Arc<ATrainDataset>,
    indices: &[usize],
    workers: &Arc<Semaphore>,
) -> Result<Batch> {
    let mut handles = Vec::with_capacity(indices.len());
    for &idx in indices {
        let permit = Arc::clone(workers)
            .acquire_owned()
            .await
            .context("loader worker pool closed")?;
        let dataset = Arc::clone(dataset);
        handles.push(tokio::task::spawn_blocking(move || {
            let _permit = permit;
            dataset.get(idx)
        }));
    }

    // Collation waits for every instance of the batch.
    let mut records: Vec<InstanceRecord> = Vec::with_capacity(handles.len());
    let mut first_error: Option<anyhow::Error> = None;
    for (handle, &idx) in handles.into_iter().zip(indices) {
        match handle.await {
            Ok(Ok(record)) => records.push(record),
            Ok(Err(error)) => {
                if first_error.is_none() {
                    first_error = Some(anyhow::Error::new(error).context(format!(
                        "failed to load instance at index {idx}"
                    )));
                }
            }
            Err(join_error) => {
                if first_error.is_none() {
                    first_error = Some(anyhow!("loader worker panicked: {join_error}"));
                }
            }
        }
    }
    if let Some(error) = first_error {
        return Err(error);
    }

    let batch = tokio::task::spawn_blocking(move || collate(&records))
        .await
        .map_err(|join_error| anyhow!("collation task panicked: {join_error}"))??;
    debug!(
        instances = batch.len(),
        points = batch.num_points(),
        "Collated batch"
    );
    Ok(batch)
}
