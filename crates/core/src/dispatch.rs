//! Job splitting and per-batch workers.
//!
//! A job with a single target is processed inline and handed straight back.
//! Larger jobs go through a bounded queue; the queue task splits each job
//! into contiguous batches, and every batch runs as its own tokio task that
//! processes its items one at a time. Sending into a full queue waits
//! indefinitely for a free slot.

use std::ops::Range;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::archive;
use crate::asset::{sanitize_file_name, ImageAsset};
use crate::inference::{InferenceClient, InferenceError, InferenceParams, SwapSettings};
use crate::progress::{ProgressRegistry, Tracking};

/// Used when a job's name prefix has no usable file-name segment.
const DEFAULT_NAME_PREFIX: &str = "IMG";

#[derive(Debug, Clone)]
pub struct Job {
    pub source_images: Vec<ImageAsset>,
    pub target_images: Vec<ImageAsset>,
    pub name_prefix: String,
    pub endpoint: String,
    pub quality: u8,
    pub batch_count: usize,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("no target images were submitted")]
    NoTargets,
    #[error(transparent)]
    Inference(#[from] InferenceError),
    #[error("submission queue is closed")]
    QueueClosed,
}

#[derive(Debug)]
pub enum Dispatched {
    /// Single-target fast path result.
    Immediate(ImageAsset),
    /// Accepted into the background queue.
    Queued,
}

/// Handle to one running batch. Nothing aborts batches today.
#[derive(Debug)]
pub struct BatchHandle {
    pub counter: u64,
    pub range: Range<usize>,
    pub task: JoinHandle<()>,
}

/// Contiguous, non-empty index ranges of at most `ceil(len / batch_count)` items.
/// Asking for more batches than items yields one batch per item.
pub fn batch_ranges(len: usize, batch_count: usize) -> Vec<Range<usize>> {
    if len == 0 {
        return Vec::new();
    }
    let size = len.div_ceil(batch_count.clamp(1, len));
    (0..len)
        .step_by(size)
        .map(|start| start..(start + size).min(len))
        .collect()
}

/// Shared state every batch task works against.
#[derive(Debug)]
pub struct BatchWorker {
    registry: ProgressRegistry,
    client: InferenceClient,
    params: InferenceParams,
    output_dir: PathBuf,
}

impl BatchWorker {
    pub fn new(
        registry: ProgressRegistry,
        client: InferenceClient,
        params: InferenceParams,
        output_dir: PathBuf,
    ) -> Self {
        Self {
            registry,
            client,
            params,
            output_dir,
        }
    }

    pub fn registry(&self) -> &ProgressRegistry {
        &self.registry
    }

    fn settings_for(&self, job: &Job) -> SwapSettings {
        SwapSettings {
            endpoint: job.endpoint.clone(),
            name_prefix: job.name_prefix.clone(),
            quality: job.quality,
            params: self.params.clone(),
        }
    }

    async fn run_item(
        &self,
        target: &ImageAsset,
        source: Option<&ImageAsset>,
        settings: &SwapSettings,
        tracking: &Tracking,
    ) -> Result<ImageAsset, InferenceError> {
        let outcome = self.client.infer(target, source, settings).await;
        tracking.advance();
        outcome
    }

    /// Synchronous fast path; errors go back to the caller.
    pub async fn process_single(&self, job: &Job) -> Result<ImageAsset, DispatchError> {
        let target = job.target_images.first().ok_or(DispatchError::NoTargets)?;
        let settings = self.settings_for(job);
        let result = self
            .run_item(target, job.source_images.first(), &settings, &Tracking::Untracked)
            .await?;
        Ok(result)
    }

    /// Run every target sequentially, turning each failure into an error-log artifact.
    async fn process_items(
        &self,
        targets: &[ImageAsset],
        source: Option<&ImageAsset>,
        settings: &SwapSettings,
        tracking: &Tracking,
    ) -> Vec<ImageAsset> {
        let mut outcomes = Vec::with_capacity(targets.len());
        for target in targets {
            outcomes.push((target, self.run_item(target, source, settings, tracking).await));
        }

        outcomes
            .into_iter()
            .map(|(target, outcome)| match outcome {
                Ok(artifact) => artifact,
                Err(err) => {
                    warn!(target = %target.name, error = %err, "Item failed; recording error log");
                    ImageAsset::error_placeholder(&target.name, err)
                }
            })
            .collect()
    }

    async fn archive_batch(
        &self,
        artifacts: Vec<ImageAsset>,
        batch_prefix: &str,
    ) -> anyhow::Result<PathBuf> {
        let prefix = batch_prefix.to_string();
        let built = tokio::task::spawn_blocking(move || archive::build(artifacts, &prefix))
            .await
            .context("archive task panicked")??;
        archive::persist(&self.output_dir, &built)
            .await
            .with_context(|| format!("failed to persist {}", built.filename))
    }

    /// Process `job.target_images[range]` under `counter`. Always leaves the
    /// record terminal with some artifact path.
    pub async fn run_batch(&self, counter: u64, job: &Job, range: Range<usize>) {
        self.registry.start(counter, range.len());
        info!(
            counter,
            start = range.start,
            end = range.end,
            name_prefix = %job.name_prefix,
            "Start processing batch"
        );

        let tracking = Tracking::Tracked {
            registry: self.registry.clone(),
            counter,
        };
        let settings = self.settings_for(job);
        let artifacts = self
            .process_items(
                &job.target_images[range.clone()],
                job.source_images.first(),
                &settings,
                &tracking,
            )
            .await;

        let batch_prefix = format!(
            "{}_{counter:04}",
            sanitize_file_name(&job.name_prefix, DEFAULT_NAME_PREFIX)
        );
        let output_file = match self.archive_batch(artifacts, &batch_prefix).await {
            Ok(path) => path,
            Err(err) => {
                error!(counter, error = %format!("{err:#}"), "Failed to archive batch");
                let (path, written) =
                    archive::write_error_log(&self.output_dir, &batch_prefix, format!("{err:#}"))
                        .await;
                if let Err(write_err) = written {
                    error!(
                        counter,
                        path = %path.display(),
                        error = %write_err,
                        "Failed to write batch error log"
                    );
                }
                path
            }
        };

        info!(
            counter,
            start = range.start,
            end = range.end,
            output_file = %output_file.display(),
            "Done processing batch"
        );
        self.registry.complete(counter, output_file);
    }
}

/// Split `job` and spawn one task per non-empty batch.
pub fn launch_batches(worker: &Arc<BatchWorker>, job: Job) -> Vec<BatchHandle> {
    let ranges = batch_ranges(job.target_images.len(), job.batch_count);
    let job = Arc::new(job);

    ranges
        .into_iter()
        .map(|range| {
            let counter = worker.registry.allocate_counter();
            let task = tokio::spawn({
                let worker = Arc::clone(worker);
                let job = Arc::clone(&job);
                let range = range.clone();
                async move { worker.run_batch(counter, &job, range).await }
            });
            BatchHandle {
                counter,
                range,
                task,
            }
        })
        .collect()
}

async fn run_queue(worker: Arc<BatchWorker>, mut receiver: mpsc::Receiver<Job>) {
    let mut running: Vec<BatchHandle> = Vec::new();
    while let Some(job) = receiver.recv().await {
        running.retain(|batch| !batch.task.is_finished());
        let launched = launch_batches(&worker, job);
        info!(
            batches = launched.len(),
            counters = ?launched.iter().map(|batch| batch.counter).collect::<Vec<_>>(),
            "Job split into batches"
        );
        running.extend(launched);
    }
    info!("Submission queue closed");
}

#[derive(Debug, Clone)]
pub struct Dispatcher {
    sender: mpsc::Sender<Job>,
    worker: Arc<BatchWorker>,
}

impl Dispatcher {
    /// Start the queue task. The returned handle ends once every dispatcher clone is dropped.
    pub fn spawn(worker: BatchWorker, queue_capacity: usize) -> (Self, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(queue_capacity.max(1));
        let worker = Arc::new(worker);
        let queue_task = tokio::spawn(run_queue(Arc::clone(&worker), receiver));
        (Self { sender, worker }, queue_task)
    }

    pub fn registry(&self) -> &ProgressRegistry {
        self.worker.registry()
    }

    /// Enqueue a multi-target job; waits while the queue is full.
    pub async fn submit(&self, job: Job) -> Result<(), DispatchError> {
        self.sender
            .send(job)
            .await
            .map_err(|_| DispatchError::QueueClosed)
    }

    pub async fn dispatch(&self, job: Job) -> Result<Dispatched, DispatchError> {
        match job.target_images.len() {
            0 => Err(DispatchError::NoTargets),
            1 => Ok(Dispatched::Immediate(self.worker.process_single(&job).await?)),
            _ => {
                self.submit(job).await?;
                Ok(Dispatched::Queued)
            }
        }
    }
}
