// THEORY:
// The `image_source` module is the codec seam of the engine. Orthophotos
// arrive in whatever raster format the survey tooling produced (frequently
// multi-band TIFF); everything past this module works on plain RGB8 pixels
// and never touches a file format again.
//
// Key architectural principles:
// 1.  **Decode once, crop many**: The full image is decoded and converted to
//     RGB up front. A decode failure is the one fatal I/O error of a run.
//     Crops are cheap owned copies taken from the shared decoded buffer, so
//     every dispatch worker can cut its own tile concurrently; the source
//     is never mutated.
// 2.  **Incidental I/O stays at the edge**: Writing tile crops (or an RGB
//     working copy of the source) to disk is useful for debugging and for
//     downstream annotation tooling, but it is not part of the detection
//     logic. It is modeled as an optional `TileObserver` the dispatcher
//     notifies after cropping; observer failures are logged and ignored.

use std::path::{Path, PathBuf};

use image::{ImageReader, RgbImage};

use crate::core_modules::geometry::Rect;
use crate::core_modules::tile_planner::Tile;
use crate::error::PipelineError;

/// The decoded, read-only source image shared by all dispatch workers.
pub struct ImageSource {
    pixels: RgbImage,
}

impl ImageSource {
    /// Loads and decodes a raster file, converting it to RGB8.
    ///
    /// Fails with [`PipelineError::Decode`] on unsupported or corrupt input;
    /// this aborts the whole run.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PipelineError> {
        let decoded = ImageReader::open(path.as_ref())
            .map_err(|e| PipelineError::Decode(image::ImageError::IoError(e)))?
            .decode()?;
        Ok(Self {
            pixels: decoded.to_rgb8(),
        })
    }

    /// Wraps an already-decoded RGB image.
    pub fn from_pixels(pixels: RgbImage) -> Self {
        Self { pixels }
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    /// Cuts an owned copy of the given region.
    ///
    /// The rect must lie inside the image; tile rects from the planner
    /// always do.
    pub fn crop(&self, rect: Rect) -> RgbImage {
        image::imageops::crop_imm(
            &self.pixels,
            rect.left,
            rect.top,
            rect.width(),
            rect.height(),
        )
        .to_image()
    }

    /// Writes an RGB working copy of the source, for viewers that cannot
    /// open the original format.
    pub fn save_rgb_copy(&self, path: impl AsRef<Path>) -> Result<(), PipelineError> {
        self.pixels.save(path.as_ref()).map_err(PipelineError::from)
    }
}

/// Observer notified with each tile's pixels right after cropping.
///
/// Purely a side-channel: the detection flow does not depend on it, and a
/// failing observer never fails a tile.
pub trait TileObserver: Send + Sync {
    fn tile_cropped(&self, tile: &Tile, pixels: &RgbImage);
}

/// A `TileObserver` that saves every crop as `tile_NNNN.jpg` under a
/// directory, mirroring what annotation tooling expects.
pub struct CropWriter {
    directory: PathBuf,
}

impl CropWriter {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }
}

impl TileObserver for CropWriter {
    fn tile_cropped(&self, tile: &Tile, pixels: &RgbImage) {
        let path = self.directory.join(format!("tile_{:04}.jpg", tile.id));
        if let Err(e) = pixels.save(&path) {
            log::warn!("failed to write crop for tile {}: {e}", tile.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn gradient_source(width: u32, height: u32) -> ImageSource {
        let pixels = RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8])
        });
        ImageSource::from_pixels(pixels)
    }

    #[test]
    fn crop_matches_source_pixels() {
        let source = gradient_source(64, 48);
        let crop = source.crop(Rect::new(10, 20, 30, 40));
        assert_eq!(crop.dimensions(), (20, 20));
        assert_eq!(crop.get_pixel(0, 0), &Rgb([10, 20, 30]));
        assert_eq!(crop.get_pixel(19, 19), &Rgb([29, 39, 68]));
    }

    #[test]
    fn edge_crop_is_clipped_size() {
        let source = gradient_source(100, 100);
        let crop = source.crop(Rect::new(90, 95, 100, 100));
        assert_eq!(crop.dimensions(), (10, 5));
    }
}
