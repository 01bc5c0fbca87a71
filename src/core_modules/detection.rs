// THEORY:
// The `detection` module defines the data that flows between the dispatch
// layer and the merge layer, plus the two seams to the outside world:
//
// 1.  **The capability seam**: Object detection itself is a black box, a
//     different model family or inference runtime per deployment. The engine
//     consumes it purely through the `Detector` trait: pixels in, a list of
//     (class, confidence, box) out. Nothing in this crate knows or cares how
//     the boxes were produced.
// 2.  **Local vs. global coordinates**: The capability only ever sees a tile,
//     so its boxes are relative to the tile's own top-left origin. The
//     coordinate mapper (`map_to_global`) is the single place where
//     tile-local boxes become image-global ones: a pure translation by the
//     tile origin followed by a clip to the image extent. Keeping this a pure
//     function makes the remap trivially testable and keeps the dispatch
//     layer free of geometry.
// 3.  **Dumb containers**: `RawDetection`, `GlobalDetection` and
//     `TileOutcome` are plain data. A `GlobalDetection` additionally carries
//     the set of tiles that contributed to it: size one when it is first
//     mapped, larger after the merge layer folds cross-tile duplicates
//     together.

use std::collections::BTreeSet;

use image::RgbImage;
use serde::Serialize;

use crate::core_modules::geometry::Rect;
use crate::core_modules::tile_planner::Tile;
use crate::error::PipelineError;

/// A single detection as reported by the capability, in tile-local
/// coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct RawDetection {
    /// The tile this detection came from. Stamped by the dispatcher; the
    /// capability itself has no notion of tile ids and leaves this zero.
    pub tile_id: u32,
    /// Class label, e.g. "excavator" or "crane".
    pub class_name: String,
    /// Capability confidence in `[0, 1]`.
    pub confidence: f32,
    /// Bounding box relative to the tile's own top-left origin.
    pub local_box: Rect,
}

/// A detection in image-global coordinates, after remapping and (possibly)
/// cross-tile merging.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GlobalDetection {
    /// Class label, serialized as `type` to match the report schema.
    #[serde(rename = "type")]
    pub class_name: String,
    /// Highest confidence among the merged duplicates.
    pub confidence: f32,
    /// Bounding box in full-image pixel coordinates, serialized as `box`.
    #[serde(rename = "box")]
    pub global_box: Rect,
    /// Ids of every tile that contributed a detection merged into this one.
    /// Ordered set so serialization is deterministic.
    #[serde(rename = "source_tiles")]
    pub source_tile_ids: BTreeSet<u32>,
}

/// Whether a tile's capability invocation ultimately succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileStatus {
    Success,
    Failed,
}

/// The per-tile result of the dispatch stage: one outcome per planned tile,
/// written exactly once, keyed by `tile_id`.
#[derive(Debug, Clone)]
pub struct TileOutcome {
    pub tile_id: u32,
    pub status: TileStatus,
    /// Raw detections for a successful tile; empty for a failed one.
    pub detections: Vec<RawDetection>,
    /// Human-readable failure description for a failed tile.
    pub error: Option<String>,
}

impl TileOutcome {
    pub fn success(tile_id: u32, detections: Vec<RawDetection>) -> Self {
        Self {
            tile_id,
            status: TileStatus::Success,
            detections,
            error: None,
        }
    }

    pub fn failed(tile_id: u32, error: String) -> Self {
        Self {
            tile_id,
            status: TileStatus::Failed,
            detections: Vec::new(),
            error: Some(error),
        }
    }
}

/// The object-detection capability consumed by the dispatch layer.
///
/// Implementations wrap whatever inference stack a deployment uses. The call
/// is blocking and may be arbitrarily heavy (GPU- or CPU-bound); the
/// dispatcher runs it on a blocking thread and applies retry and timeout
/// policy around it. Returned detections are tile-local; `tile_id` is
/// assigned by the dispatcher afterwards.
pub trait Detector: Send + Sync {
    fn infer(
        &self,
        pixels: &RgbImage,
        confidence_threshold: f32,
        input_size: u32,
    ) -> Result<Vec<RawDetection>, InferenceError>;
}

/// Opaque failure from a capability invocation. The dispatcher only ever
/// logs and stringifies it, so implementations may use whatever error type
/// their inference stack produces.
pub type InferenceError = Box<dyn std::error::Error + Send + Sync>;

/// Remaps a tile-local detection into image-global coordinates.
///
/// Pure translation by the tile origin followed by a clip to
/// `[0, image_width) x [0, image_height)`. Fails with
/// [`PipelineError::OutOfBounds`] when the local box does not fit inside the
/// tile's own extent: the capability produced a malformed box, and the
/// caller drops that single detection rather than aborting the run.
pub fn map_to_global(
    tile: &Tile,
    raw: &RawDetection,
    image_width: u32,
    image_height: u32,
) -> Result<GlobalDetection, PipelineError> {
    let local = raw.local_box;
    if !local.is_valid() || local.right > tile.rect.width() || local.bottom > tile.rect.height() {
        return Err(PipelineError::OutOfBounds {
            tile_id: tile.id,
            detail: format!(
                "({},{},{},{}) vs tile extent {}x{}",
                local.left,
                local.top,
                local.right,
                local.bottom,
                tile.rect.width(),
                tile.rect.height()
            ),
        });
    }

    let translated = local.translate(tile.rect.left, tile.rect.top);
    // The tile lies inside the image, so the clip is a safeguard only; it can
    // never empty a box that passed the extent check above.
    let global_box = translated
        .clip(image_width, image_height)
        .ok_or_else(|| PipelineError::OutOfBounds {
            tile_id: tile.id,
            detail: format!(
                "translated box ({},{},{},{}) outside image {}x{}",
                translated.left,
                translated.top,
                translated.right,
                translated.bottom,
                image_width,
                image_height
            ),
        })?;

    Ok(GlobalDetection {
        class_name: raw.class_name.clone(),
        confidence: raw.confidence,
        global_box,
        source_tile_ids: BTreeSet::from([tile.id]),
    })
}
