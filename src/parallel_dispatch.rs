// THEORY:
// The `parallel_dispatch` module is the only concurrent part of the engine.
// Tiles are independent until the merge barrier, and a capability invocation
// is heavy (GPU- or CPU-bound), so tiles are fanned out to a fixed pool of
// workers and the pipeline simply waits for every tile's outcome before the
// pure stages run.
//
// Key architectural principles:
// 1.  **Bounded worker pool**: A dispatcher task round-robins tile tasks
//     from a single inbound channel onto per-worker channels. The pool size
//     is the configured concurrency limit, so at most that many capability
//     invocations are in flight at once regardless of tile count.
// 2.  **One slot per tile**: Every task carries its own oneshot reply
//     channel. Each slot is written exactly once by exactly one worker and
//     read only after all tiles resolve, so there is no shared mutable
//     accumulation and no locking during dispatch.
// 3.  **Failure is data**: A tile whose invocation still fails after the
//     configured retries produces a `Failed` outcome and the run continues.
//     Only whole-run conditions (a cancelled run) surface as `Err`.
// 4.  **Cancellation between tiles**: A cancelled run stops workers from
//     picking up new tiles; whatever is in flight finishes (or hits its
//     timeout) and is discarded. No partial result ever leaves a cancelled
//     run.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::future;
use tokio::sync::{mpsc, oneshot};
use tokio::task;
use tokio::time::timeout;

use crate::core_modules::detection::{Detector, TileOutcome};
use crate::core_modules::image_source::{ImageSource, TileObserver};
use crate::core_modules::tile_planner::Tile;
use crate::error::PipelineError;
use crate::pipeline::PipelineConfig;

/// Shared run-level cancellation flag.
///
/// Cheap to clone; setting it stops workers from starting new tiles.
#[derive(Clone, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

struct TileTask {
    tile: Tile,
    result_sender: oneshot::Sender<TileOutcome>,
}

/// Fixed pool of tile workers sharing the read-only source image and the
/// detection capability.
pub struct WorkerPool {
    task_sender: mpsc::UnboundedSender<TileTask>,
    cancel: CancelHandle,
    workers: Vec<task::JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(
        image: Arc<ImageSource>,
        detector: Arc<dyn Detector>,
        observer: Option<Arc<dyn TileObserver>>,
        config: PipelineConfig,
        cancel: CancelHandle,
    ) -> Self {
        let pool_size = config.concurrency_limit.max(1);
        let (task_sender, mut task_receiver) = mpsc::unbounded_channel::<TileTask>();

        // Round-robin dispatcher feeding one channel per worker.
        let (worker_senders, worker_receivers): (Vec<_>, Vec<_>) = (0..pool_size)
            .map(|_| mpsc::unbounded_channel::<TileTask>())
            .unzip();

        tokio::spawn(async move {
            let mut worker_idx = 0;
            while let Some(task) = task_receiver.recv().await {
                let _ = worker_senders[worker_idx].send(task);
                worker_idx = (worker_idx + 1) % pool_size;
            }
        });

        let mut workers = Vec::with_capacity(pool_size);
        for mut worker_receiver in worker_receivers {
            let image = Arc::clone(&image);
            let detector = Arc::clone(&detector);
            let observer = observer.clone();
            let config = config.clone();
            let cancel = cancel.clone();

            workers.push(tokio::spawn(async move {
                while let Some(task) = worker_receiver.recv().await {
                    // A cancelled run stops picking up new tiles; dropping the
                    // reply sender marks the slot as abandoned.
                    if cancel.is_cancelled() {
                        continue;
                    }
                    let outcome =
                        Self::process_tile(&image, &detector, observer.as_deref(), &config, task.tile)
                            .await;
                    let _ = task.result_sender.send(outcome);
                }
            }));
        }

        Self {
            task_sender,
            cancel,
            workers,
        }
    }

    /// Crops one tile, notifies the observer, and invokes the capability
    /// with the configured retry and timeout policy.
    async fn process_tile(
        image: &ImageSource,
        detector: &Arc<dyn Detector>,
        observer: Option<&dyn TileObserver>,
        config: &PipelineConfig,
        tile: Tile,
    ) -> TileOutcome {
        let pixels = image.crop(tile.rect);
        if let Some(observer) = observer {
            observer.tile_cropped(&tile, &pixels);
        }

        let mut last_error = String::new();
        for attempt in 0..=config.max_retries {
            let detector = Arc::clone(detector);
            let pixels = pixels.clone();
            let confidence_threshold = config.confidence_threshold;
            let input_size = config.input_size;

            // The capability is blocking and heavy; keep it off the runtime.
            let invocation = task::spawn_blocking(move || {
                detector.infer(&pixels, confidence_threshold, input_size)
            });

            let result = match config.infer_timeout {
                Some(limit) => match timeout(limit, invocation).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        last_error = format!("inference timed out after {limit:?}");
                        log_attempt(tile.id, attempt, config.max_retries, &last_error);
                        continue;
                    }
                },
                None => invocation.await,
            };

            match result {
                Ok(Ok(mut detections)) => {
                    for detection in &mut detections {
                        detection.tile_id = tile.id;
                    }
                    return TileOutcome::success(tile.id, detections);
                }
                Ok(Err(e)) => {
                    last_error = e.to_string();
                }
                Err(e) => {
                    last_error = format!("inference task aborted: {e}");
                }
            }
            log_attempt(tile.id, attempt, config.max_retries, &last_error);
        }

        let error = PipelineError::Inference {
            tile_id: tile.id,
            message: last_error,
        };
        TileOutcome::failed(tile.id, error.to_string())
    }

    /// Dispatches every tile of the plan and waits for all outcomes.
    ///
    /// Returns one outcome per tile in tile-id order, regardless of which
    /// workers finished first. Fails only with
    /// [`PipelineError::Cancelled`] when the run's cancel handle was set.
    pub async fn dispatch(&self, tiles: &[Tile]) -> Result<Vec<TileOutcome>, PipelineError> {
        let mut receivers = Vec::with_capacity(tiles.len());
        for tile in tiles {
            let (result_sender, result_receiver) = oneshot::channel();
            let task = TileTask {
                tile: *tile,
                result_sender,
            };
            if self.task_sender.send(task).is_err() {
                return Err(PipelineError::Cancelled);
            }
            receivers.push(result_receiver);
        }

        // The barrier: every slot resolves, by outcome or by the worker
        // dropping it, before anything downstream sees a result.
        let results = future::join_all(receivers).await;
        if self.cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        let mut outcomes = Vec::with_capacity(results.len());
        for result in results {
            match result {
                Ok(outcome) => outcomes.push(outcome),
                // A dropped slot outside cancellation means the worker died.
                // Either way the run has no complete detection set.
                Err(_) => return Err(PipelineError::Cancelled),
            }
        }
        Ok(outcomes)
    }

    /// Closes the task channel; workers drain and exit.
    pub fn shutdown(self) {
        drop(self.task_sender);
        for worker in self.workers {
            worker.abort();
        }
    }
}

fn log_attempt(tile_id: u32, attempt: u32, max_retries: u32, error: &str) {
    if attempt < max_retries {
        log::warn!("tile {tile_id}: attempt {} failed, retrying: {error}", attempt + 1);
    } else {
        log::warn!("tile {tile_id}: failed after {} attempts: {error}", max_retries + 1);
    }
}
