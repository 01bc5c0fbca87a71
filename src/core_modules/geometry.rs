// THEORY:
// The `geometry` module is the foundation of the entire engine. Every later
// layer (tile planning, coordinate remapping, cross-tile merging) is
// ultimately arithmetic over axis-aligned rectangles, so all of that
// arithmetic lives here in one "dumb" data type.
//
// Key architectural principles:
// 1.  **Half-open convention**: A `Rect` spans `[left, right) x [top, bottom)`
//     in integer pixel coordinates. Two rects that merely touch along an edge
//     therefore have zero intersection, which is exactly the property the
//     merge layer relies on: tiles planned with `overlap = 0` can never
//     produce a spurious IoU between their extents.
// 2.  **Pure data container**: A `Rect` knows how to measure and transform
//     itself (area, translation, clipping, intersection, IoU) but has no idea
//     whether it represents a tile extent or a detection box. Both layers use
//     the same type.
// 3.  **Integer in, float out**: Coordinates stay `u32` end to end; only the
//     derived ratios (IoU) are floating point, computed over `u64` areas so
//     large orthophoto extents cannot overflow.

use serde::Serialize;

/// An axis-aligned rectangle in pixel coordinates, spanning
/// `[left, right) x [top, bottom)`.
///
/// Used both for tile extents and for detection bounding boxes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Rect {
    pub left: u32,
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
}

impl Rect {
    /// Creates a new rectangle. Callers are expected to uphold
    /// `right > left` and `bottom > top`; [`Rect::is_valid`] checks it.
    pub const fn new(left: u32, top: u32, right: u32, bottom: u32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    /// A rectangle is valid when it encloses at least one pixel.
    pub const fn is_valid(&self) -> bool {
        self.right > self.left && self.bottom > self.top
    }

    pub const fn width(&self) -> u32 {
        self.right.saturating_sub(self.left)
    }

    pub const fn height(&self) -> u32 {
        self.bottom.saturating_sub(self.top)
    }

    /// Area in pixels. `u64` so that full-orthophoto extents cannot overflow.
    pub const fn area(&self) -> u64 {
        self.width() as u64 * self.height() as u64
    }

    /// Translates the rectangle by a non-negative offset.
    pub const fn translate(&self, dx: u32, dy: u32) -> Self {
        Self {
            left: self.left + dx,
            top: self.top + dy,
            right: self.right + dx,
            bottom: self.bottom + dy,
        }
    }

    /// Clips the rectangle to `[0, width) x [0, height)`.
    ///
    /// Returns `None` when nothing of the rectangle survives the clip.
    pub fn clip(&self, width: u32, height: u32) -> Option<Self> {
        let clipped = Self {
            left: self.left.min(width),
            top: self.top.min(height),
            right: self.right.min(width),
            bottom: self.bottom.min(height),
        };
        clipped.is_valid().then_some(clipped)
    }

    /// The overlapping region of two rectangles, if any.
    pub fn intersection(&self, other: &Self) -> Option<Self> {
        let candidate = Self {
            left: self.left.max(other.left),
            top: self.top.max(other.top),
            right: self.right.min(other.right),
            bottom: self.bottom.min(other.bottom),
        };
        candidate.is_valid().then_some(candidate)
    }

    /// Intersection-over-union with another rectangle.
    ///
    /// Returns 0.0 for disjoint (or merely edge-touching) rectangles, 1.0 for
    /// identical ones. This is the overlap measure the merge layer uses to
    /// decide whether two detections describe the same real-world object.
    pub fn iou(&self, other: &Self) -> f64 {
        let intersection = match self.intersection(other) {
            Some(overlap) => overlap.area(),
            None => return 0.0,
        };
        let union = self.area() + other.area() - intersection;
        if union == 0 {
            return 0.0;
        }
        intersection as f64 / union as f64
    }
}
