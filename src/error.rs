//! Error taxonomy for the detection engine.
//!
//! Two tiers: fatal errors (`InvalidConfig`, `Decode`, `Cancelled`) abort the
//! whole run, while per-tile and per-detection failures (`Inference`,
//! `OutOfBounds`) are absorbed into the run's report and never escape the
//! pipeline as `Err`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Bad tiling or threshold parameters. Rejected before the run starts.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The source image could not be read or decoded. Fatal for the run.
    #[error("failed to decode source image: {0}")]
    Decode(#[from] image::ImageError),

    /// A tile's capability invocation failed after all retries. Recorded in
    /// the report's failed-tile list by the dispatcher; surfaces as an error
    /// only through [`crate::core_modules::detection::TileOutcome`].
    #[error("inference failed for tile {tile_id}: {message}")]
    Inference { tile_id: u32, message: String },

    /// The capability returned a box outside its tile's extent. The single
    /// detection is logged and dropped.
    #[error("detection box {detail} lies outside tile {tile_id}")]
    OutOfBounds { tile_id: u32, detail: String },

    /// The run was cancelled before all tiles completed. No partial report
    /// is ever emitted for a cancelled run.
    #[error("run cancelled before completion")]
    Cancelled,
}
