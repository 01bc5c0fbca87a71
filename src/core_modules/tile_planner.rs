// THEORY:
// The `tile_planner` module computes the deterministic grid of tiles that the
// dispatcher will fan out to the detection capability. An orthophoto is often
// an order of magnitude larger than the detector's native input resolution,
// so the image must be covered by fixed-size windows.
//
// Key architectural principles:
// 1.  **Determinism first**: Tiles are enumerated in row-major order
//     (top-to-bottom, left-to-right) and ids are assigned from that order.
//     Everything downstream (outcome slots, merge tie-breaking, the final
//     report) leans on those ids being stable across runs.
// 2.  **Clip, never pad**: Edge tiles are clipped to the image extent rather
//     than padded, so the union of all tile rects is exactly
//     `[0, W) x [0, H)` with no synthetic pixels. Padding, when a detector
//     needs it, is the codec layer's concern.
// 3.  **Overlap as a stride**: A configured overlap shrinks the step between
//     tile origins to `tile_size - overlap`, so adjacent tiles share exactly
//     `overlap` pixels along their common edge. Overlapping tiles produce
//     duplicate detections by construction; the merge layer removes them.

use crate::core_modules::geometry::Rect;
use crate::error::PipelineError;

/// A single rectangular sub-region of the source image, processed
/// independently by the detection capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tile {
    /// Row-major index of this tile within the plan. Stable across runs.
    pub id: u32,
    /// The tile's extent in image-global pixel coordinates.
    pub rect: Rect,
}

/// The ordered set of tiles covering the full image extent.
#[derive(Debug, Clone)]
pub struct TilePlan {
    tiles: Vec<Tile>,
    image_width: u32,
    image_height: u32,
}

impl TilePlan {
    /// Computes the tile grid for an image of `width` x `height` pixels.
    ///
    /// Steps both axes by `tile_size - overlap`, clipping the final row and
    /// column to the image edge. A `tile_size` at least as large as both
    /// dimensions yields a single tile equal to the full image.
    ///
    /// Fails with [`PipelineError::InvalidConfig`] when `tile_size` is zero,
    /// `overlap >= tile_size`, or the image has no pixels.
    pub fn build(
        width: u32,
        height: u32,
        tile_size: u32,
        overlap: u32,
    ) -> Result<Self, PipelineError> {
        if tile_size == 0 {
            return Err(PipelineError::InvalidConfig(
                "tile_size must be positive".into(),
            ));
        }
        if overlap >= tile_size {
            return Err(PipelineError::InvalidConfig(format!(
                "overlap ({overlap}) must be smaller than tile_size ({tile_size})"
            )));
        }
        if width == 0 || height == 0 {
            return Err(PipelineError::InvalidConfig(format!(
                "image extent {width}x{height} has no pixels"
            )));
        }

        let stride = tile_size - overlap;
        let mut tiles = Vec::new();
        let mut id = 0u32;

        let mut top = 0u32;
        while top < height {
            let mut left = 0u32;
            while left < width {
                let rect = Rect::new(
                    left,
                    top,
                    left.saturating_add(tile_size).min(width),
                    top.saturating_add(tile_size).min(height),
                );
                tiles.push(Tile { id, rect });
                id += 1;

                // Once a tile reaches the right edge the row is covered;
                // a smaller stride would otherwise emit redundant slivers.
                if rect.right == width {
                    break;
                }
                left += stride;
            }
            if tiles.last().map(|t| t.rect.bottom) == Some(height) {
                break;
            }
            top += stride;
        }

        Ok(Self {
            tiles,
            image_width: width,
            image_height: height,
        })
    }

    pub fn tiles(&self) -> &[Tile] {
        &self.tiles
    }

    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    pub const fn image_width(&self) -> u32 {
        self.image_width
    }

    pub const fn image_height(&self) -> u32 {
        self.image_height
    }

    pub fn iter(&self) -> impl Iterator<Item = &Tile> {
        self.tiles.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Every pixel of the image must be covered by exactly one tile when
    /// overlap is zero.
    fn assert_exact_cover(plan: &TilePlan, width: u32, height: u32) {
        let covered: u64 = plan.iter().map(|t| t.rect.area()).sum();
        assert_eq!(covered, width as u64 * height as u64);
        for tile in plan.iter() {
            assert!(tile.rect.is_valid());
            assert!(tile.rect.right <= width);
            assert!(tile.rect.bottom <= height);
        }
    }

    #[test]
    fn four_tile_scenario() {
        let plan = TilePlan::build(2000, 1500, 1024, 0).unwrap();
        let rects: Vec<Rect> = plan.iter().map(|t| t.rect).collect();
        assert_eq!(
            rects,
            vec![
                Rect::new(0, 0, 1024, 1024),
                Rect::new(1024, 0, 2000, 1024),
                Rect::new(0, 1024, 1024, 1500),
                Rect::new(1024, 1024, 2000, 1500),
            ]
        );
        let ids: Vec<u32> = plan.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![0, 1, 2, 3]);
        assert_exact_cover(&plan, 2000, 1500);
    }

    #[test]
    fn single_tile_when_image_fits() {
        let plan = TilePlan::build(640, 480, 1024, 0).unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.tiles()[0].rect, Rect::new(0, 0, 640, 480));
    }

    #[test]
    fn exact_multiple_has_no_sliver_tiles() {
        let plan = TilePlan::build(2048, 1024, 1024, 0).unwrap();
        assert_eq!(plan.len(), 2);
        assert_exact_cover(&plan, 2048, 1024);
    }

    #[test]
    fn zero_overlap_tiles_are_disjoint() {
        let plan = TilePlan::build(3000, 2200, 1024, 0).unwrap();
        let tiles = plan.tiles();
        for a in tiles {
            for b in tiles {
                if a.id != b.id {
                    assert_eq!(a.rect.intersection(&b.rect), None);
                }
            }
        }
        assert_exact_cover(&plan, 3000, 2200);
    }

    #[test]
    fn overlap_is_exact_on_shared_edges() {
        let plan = TilePlan::build(1000, 400, 400, 100).unwrap();
        // Horizontal neighbors in the first row step by 300.
        let row: Vec<&Tile> = plan.iter().filter(|t| t.rect.top == 0).collect();
        for pair in row.windows(2) {
            let shared = pair[0].rect.intersection(&pair[1].rect);
            // Interior neighbors overlap by exactly 100 pixels; the clipped
            // edge tile may share less.
            if pair[1].rect.width() == 400 {
                let shared = shared.expect("adjacent tiles must overlap");
                assert_eq!(shared.width(), 100);
            }
        }
    }

    #[test]
    fn overlapping_plan_still_covers_image() {
        let plan = TilePlan::build(2000, 1500, 1024, 128).unwrap();
        // Union coverage: every sampled pixel falls inside some tile.
        for y in (0..1500).step_by(37) {
            for x in (0..2000).step_by(41) {
                assert!(
                    plan.iter().any(|t| x >= t.rect.left
                        && x < t.rect.right
                        && y >= t.rect.top
                        && y < t.rect.bottom),
                    "pixel ({x},{y}) uncovered"
                );
            }
        }
    }

    #[test]
    fn rejects_bad_parameters() {
        assert!(matches!(
            TilePlan::build(100, 100, 0, 0),
            Err(PipelineError::InvalidConfig(_))
        ));
        assert!(matches!(
            TilePlan::build(100, 100, 64, 64),
            Err(PipelineError::InvalidConfig(_))
        ));
        assert!(matches!(
            TilePlan::build(0, 100, 64, 0),
            Err(PipelineError::InvalidConfig(_))
        ));
    }
}
