// THEORY:
// This file is the main entry point for the `ortho_vision` library crate.
// It follows the standard Rust convention of using `lib.rs` to define the
// public API that will be exposed to external consumers (such as a reporting
// web service).
//
// The primary goal is to export the `DetectionPipeline` and its associated
// data structures (`PipelineConfig`, `Report`, the `Detector` seam) as the
// clean, high-level interface for the entire engine. The internal layers
// (`core_modules`) stay encapsulated behind it.

pub mod core_modules;
pub mod error;
pub mod parallel_dispatch;
pub mod pipeline;

pub use crate::core_modules::aggregator::{ProgressInfo, Report};
pub use crate::core_modules::detection::{Detector, InferenceError};
pub use crate::core_modules::geometry::Rect;
pub use crate::core_modules::image_source::{CropWriter, ImageSource, TileObserver};
pub use crate::core_modules::tile_planner::{Tile, TilePlan};
pub use crate::error::PipelineError;
pub use crate::parallel_dispatch::CancelHandle;
pub use crate::pipeline::{DetectionPipeline, PipelineConfig};
