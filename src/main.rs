// Example runner for the `ortho_vision` library: a dry-run tiler.
//
// Loads an orthophoto, runs the full pipeline with a no-op detection
// capability, and prints the resulting report JSON. Useful for checking the
// tile grid and crop output for an image before wiring in a real detector.
//
// Usage: ortho_vision <image> [crop-output-dir]

use std::sync::Arc;

use anyhow::{Context, Result};
use image::RgbImage;
use ortho_vision::core_modules::detection::{Detector, InferenceError, RawDetection};
use ortho_vision::{CropWriter, DetectionPipeline, ImageSource, PipelineConfig, ProgressInfo, TileObserver};

/// Stand-in capability: detects nothing, so the run exercises planning,
/// dispatch, cropping and aggregation only.
struct NullDetector;

impl Detector for NullDetector {
    fn infer(
        &self,
        _pixels: &RgbImage,
        _confidence_threshold: f32,
        _input_size: u32,
    ) -> Result<Vec<RawDetection>, InferenceError> {
        Ok(Vec::new())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let image_path = args.next().context("usage: ortho_vision <image> [crop-output-dir]")?;
    let crop_dir = args.next();

    let image = Arc::new(ImageSource::open(&image_path).context("loading source image")?);

    let observer: Option<Arc<dyn TileObserver>> = match crop_dir {
        Some(dir) => {
            std::fs::create_dir_all(&dir).context("creating crop output directory")?;
            Some(Arc::new(CropWriter::new(dir)))
        }
        None => None,
    };

    let pipeline = DetectionPipeline::new(PipelineConfig::default())?;
    let report = pipeline
        .run(
            image,
            Arc::new(NullDetector),
            observer,
            ProgressInfo::default(),
        )
        .await?;

    println!("{}", report.to_json()?);
    Ok(())
}
