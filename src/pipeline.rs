// THEORY:
// The `pipeline` module is the top-level API for the engine. It wires the
// stages together in their fixed order (plan the tile grid, dispatch tiles
// to the capability under bounded concurrency, remap tile-local boxes to
// image-global coordinates, merge cross-tile duplicates, aggregate the
// report) and owns the configuration surface for all of them.
//
// The dispatch stage is the only concurrent one; everything after it runs
// once, single-threaded, on the complete detection set. Waiting for every
// tile outcome before mapping/merging is what makes the merge a true
// synchronization barrier: global deduplication needs the full set, and the
// final report is deterministic no matter which tiles finished first.

use std::sync::Arc;
use std::time::Duration;

use crate::core_modules::aggregator::{ProgressInfo, Report};
use crate::core_modules::detection::{Detector, map_to_global};
use crate::core_modules::image_source::{ImageSource, TileObserver};
use crate::core_modules::merge_engine::merge_detections;
use crate::core_modules::tile_planner::TilePlan;
use crate::error::PipelineError;
use crate::parallel_dispatch::{CancelHandle, WorkerPool};

// Re-export the key data structures for the public API.
pub use crate::core_modules::detection::{GlobalDetection, RawDetection, TileOutcome, TileStatus};

/// Configuration for a detection run, allowing for tunable behavior.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Side length of a square tile in pixels.
    pub tile_size: u32,
    /// Pixels shared between adjacent tiles. Must be smaller than
    /// `tile_size`. Non-zero overlap catches objects on tile boundaries at
    /// the cost of duplicate detections, which the merge stage removes.
    pub overlap: u32,
    /// Minimum capability confidence for a detection to be kept.
    pub confidence_threshold: f32,
    /// IoU above which two same-class detections are considered the same
    /// object.
    pub iou_threshold: f64,
    /// Native input resolution of the detection capability.
    pub input_size: u32,
    /// Number of tile workers. Defaults to the number of available CPUs.
    pub concurrency_limit: usize,
    /// Additional capability invocations after a failed one.
    pub max_retries: u32,
    /// Optional per-invocation timeout for the capability.
    ///
    /// A timed-out invocation cannot be aborted mid-inference; its blocking
    /// thread keeps running while the retry starts, so under timeouts a tile
    /// can briefly have more than one inference in flight and the pool can
    /// exceed `concurrency_limit` by the number of timed-out attempts.
    pub infer_timeout: Option<Duration>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            tile_size: 1024,
            overlap: 0,
            confidence_threshold: 0.25,
            iou_threshold: 0.5,
            input_size: 1024,
            concurrency_limit: num_cpus::get().max(1),
            max_retries: 1,
            infer_timeout: None,
        }
    }
}

impl PipelineConfig {
    /// Validates the configuration. Called once before a run starts; a bad
    /// configuration never reaches the dispatch stage.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.tile_size == 0 {
            return Err(PipelineError::InvalidConfig(
                "tile_size must be positive".into(),
            ));
        }
        if self.overlap >= self.tile_size {
            return Err(PipelineError::InvalidConfig(format!(
                "overlap ({}) must be smaller than tile_size ({})",
                self.overlap, self.tile_size
            )));
        }
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(PipelineError::InvalidConfig(format!(
                "confidence_threshold {} outside [0, 1]",
                self.confidence_threshold
            )));
        }
        if !(0.0..=1.0).contains(&self.iou_threshold) {
            return Err(PipelineError::InvalidConfig(format!(
                "iou_threshold {} outside [0, 1]",
                self.iou_threshold
            )));
        }
        if self.concurrency_limit == 0 {
            return Err(PipelineError::InvalidConfig(
                "concurrency_limit must be at least 1".into(),
            ));
        }
        if self.input_size == 0 {
            return Err(PipelineError::InvalidConfig(
                "input_size must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// The main, top-level struct for the detection engine.
///
/// One `DetectionPipeline` describes a configuration; each call to
/// [`run`](Self::run) performs a full plan → dispatch → map → merge →
/// aggregate pass over one image. Runs are independent: the pipeline holds
/// no per-run state, so it can be reused (or shared) across any number of
/// runs.
pub struct DetectionPipeline {
    config: PipelineConfig,
}

impl DetectionPipeline {
    /// Creates a pipeline, rejecting invalid configurations up front.
    pub fn new(config: PipelineConfig) -> Result<Self, PipelineError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Runs the full pipeline over one image and produces the report.
    ///
    /// Per-tile capability failures are retried and then absorbed into the
    /// report's `failed_tiles`; only configuration errors, an unreadable
    /// source image, or cancellation fail the run itself. For a run that can
    /// be cancelled from another task, use
    /// [`run_cancellable`](Self::run_cancellable).
    pub async fn run(
        &self,
        image: Arc<ImageSource>,
        detector: Arc<dyn Detector>,
        observer: Option<Arc<dyn TileObserver>>,
        progress: ProgressInfo,
    ) -> Result<Report, PipelineError> {
        self.run_cancellable(image, detector, observer, progress, CancelHandle::new())
            .await
    }

    /// Like [`run`](Self::run), under an external cancellation handle.
    ///
    /// The handle is scoped to this run alone: setting it makes this run
    /// return [`PipelineError::Cancelled`] with no partial report, and has
    /// no effect on any other run of the same pipeline, past or future.
    pub async fn run_cancellable(
        &self,
        image: Arc<ImageSource>,
        detector: Arc<dyn Detector>,
        observer: Option<Arc<dyn TileObserver>>,
        progress: ProgressInfo,
        cancel: CancelHandle,
    ) -> Result<Report, PipelineError> {
        // Stage 1: Tile planning.
        let plan = TilePlan::build(
            image.width(),
            image.height(),
            self.config.tile_size,
            self.config.overlap,
        )?;
        log::info!(
            "planned {} tiles of {}px (overlap {}px) over {}x{}",
            plan.len(),
            self.config.tile_size,
            self.config.overlap,
            image.width(),
            image.height()
        );

        // Stage 2: Bounded-concurrency dispatch. Acts as the barrier: every
        // tile resolves (success or failure) before anything below runs.
        let pool = WorkerPool::new(
            Arc::clone(&image),
            detector,
            observer,
            self.config.clone(),
            cancel,
        );
        let outcomes = pool.dispatch(plan.tiles()).await;
        pool.shutdown();
        let outcomes = outcomes?;

        // Stage 3: Coordinate remapping. Malformed boxes are dropped with a
        // log line; they never abort the run.
        let mut failed_tiles = Vec::new();
        let mut global_detections = Vec::new();
        for outcome in &outcomes {
            match outcome.status {
                TileStatus::Failed => failed_tiles.push(outcome.tile_id),
                TileStatus::Success => {
                    let tile = plan.tiles()[outcome.tile_id as usize];
                    for raw in &outcome.detections {
                        match map_to_global(&tile, raw, image.width(), image.height()) {
                            Ok(global) => global_detections.push(global),
                            Err(e) => log::warn!("dropping malformed detection: {e}"),
                        }
                    }
                }
            }
        }

        // Stage 4: Cross-tile merge.
        let before_merge = global_detections.len();
        let merged = merge_detections(global_detections, self.config.iou_threshold);
        log::info!(
            "{} detections after merge ({} duplicates removed, {} tiles failed)",
            merged.len(),
            before_merge - merged.len(),
            failed_tiles.len()
        );

        // Stage 5: Aggregation.
        Ok(Report::build(merged, failed_tiles, progress))
    }
}
