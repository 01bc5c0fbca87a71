// End-to-end pipeline tests against a scripted mock capability.
//
// The mock detector identifies which tile it was handed by reading the
// crop's top-left pixel: test images are built with `R = x, G = y`, so the
// origin pixel of a crop carries the tile's global origin. That keeps the
// capability a true black box (pixels in, boxes out) while letting each
// scenario script per-tile behavior.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use image::{Rgb, RgbImage};
use ortho_vision::core_modules::detection::{Detector, InferenceError, RawDetection};
use ortho_vision::core_modules::tile_planner::Tile;
use ortho_vision::{
    CancelHandle, DetectionPipeline, ImageSource, PipelineConfig, PipelineError, ProgressInfo,
    Rect, TileObserver,
};

/// Builds a test image whose pixel at (x, y) is (x, y, 0), so any crop's
/// origin pixel reveals the tile origin. Dimensions must stay under 256.
fn coordinate_image(width: u32, height: u32) -> Arc<ImageSource> {
    assert!(width <= 255 && height <= 255);
    let pixels = RgbImage::from_fn(width, height, |x, y| Rgb([x as u8, y as u8, 0]));
    Arc::new(ImageSource::from_pixels(pixels))
}

fn tile_origin(pixels: &RgbImage) -> (u32, u32) {
    let p = pixels.get_pixel(0, 0);
    (p[0] as u32, p[1] as u32)
}

fn raw(class: &str, confidence: f32, local_box: Rect) -> RawDetection {
    RawDetection {
        tile_id: 0,
        class_name: class.into(),
        confidence,
        local_box,
    }
}

/// Scripted capability: a closure from tile origin to a per-tile result,
/// with an optional artificial delay to shuffle completion order.
struct ScriptedDetector<F> {
    script: F,
    delay: Option<Duration>,
    calls: AtomicU32,
}

impl<F> ScriptedDetector<F>
where
    F: Fn(u32, u32, u32) -> Result<Vec<RawDetection>, String> + Send + Sync,
{
    fn new(script: F) -> Self {
        Self {
            script,
            delay: None,
            calls: AtomicU32::new(0),
        }
    }

    fn with_delay(script: F, delay: Duration) -> Self {
        Self {
            script,
            delay: Some(delay),
            calls: AtomicU32::new(0),
        }
    }
}

impl<F> Detector for ScriptedDetector<F>
where
    F: Fn(u32, u32, u32) -> Result<Vec<RawDetection>, String> + Send + Sync,
{
    fn infer(
        &self,
        pixels: &RgbImage,
        _confidence_threshold: f32,
        _input_size: u32,
    ) -> Result<Vec<RawDetection>, InferenceError> {
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let (left, top) = tile_origin(pixels);
        (self.script)(left, top, call).map_err(InferenceError::from)
    }
}

fn config(tile_size: u32, overlap: u32) -> PipelineConfig {
    PipelineConfig {
        tile_size,
        overlap,
        concurrency_limit: 4,
        ..PipelineConfig::default()
    }
}

#[tokio::test]
async fn detections_are_remapped_to_global_coordinates() {
    // 200x100, two 100px tiles side by side. Each tile reports one object
    // at local (10, 20)-(40, 60).
    let image = coordinate_image(200, 100);
    let detector = ScriptedDetector::new(|_, _, _| {
        Ok(vec![raw("excavator", 0.9, Rect::new(10, 20, 40, 60))])
    });

    let pipeline = DetectionPipeline::new(config(100, 0)).unwrap();
    let report = pipeline
        .run(image, Arc::new(detector), None, ProgressInfo::default())
        .await
        .unwrap();

    assert_eq!(report.detections.len(), 2);
    assert_eq!(report.detections[0].global_box, Rect::new(10, 20, 40, 60));
    assert_eq!(report.detections[1].global_box, Rect::new(110, 20, 140, 60));
    assert_eq!(report.class_counts.get("excavator"), Some(&2));
    assert!(report.failed_tiles.is_empty());
}

#[tokio::test]
async fn object_straddling_overlapping_tiles_is_merged_once() {
    // 160x100 with tile_size 100, overlap 40: tiles at x=0 and x=60. An
    // object at global (62, 20)-(98, 60) is fully visible in both tiles.
    let image = coordinate_image(160, 100);
    let detector = ScriptedDetector::new(|left, _, _| match left {
        0 => Ok(vec![raw("crane", 0.91, Rect::new(62, 20, 98, 60))]),
        60 => Ok(vec![raw("crane", 0.88, Rect::new(2, 20, 38, 60))]),
        other => Err(format!("unexpected tile origin {other}")),
    });

    let pipeline = DetectionPipeline::new(config(100, 40)).unwrap();
    let report = pipeline
        .run(image, Arc::new(detector), None, ProgressInfo::default())
        .await
        .unwrap();

    assert_eq!(report.detections.len(), 1);
    let merged = &report.detections[0];
    assert_eq!(merged.confidence, 0.91);
    assert_eq!(merged.global_box, Rect::new(62, 20, 98, 60));
    assert_eq!(merged.source_tile_ids, BTreeSet::from([0, 1]));
    assert_eq!(report.class_counts.get("crane"), Some(&1));
}

#[tokio::test]
async fn failed_tile_is_reported_and_does_not_poison_the_run() {
    // 200x200, four tiles. The tile at (100, 0) fails every attempt.
    let image = coordinate_image(200, 200);
    let detector = ScriptedDetector::new(|left, top, _| {
        if (left, top) == (100, 0) {
            Err("synthetic capability failure".into())
        } else {
            Ok(vec![raw("truck", 0.7, Rect::new(5, 5, 25, 25))])
        }
    });

    let pipeline = DetectionPipeline::new(config(100, 0)).unwrap();
    let report = pipeline
        .run(image, Arc::new(detector), None, ProgressInfo::default())
        .await
        .unwrap();

    assert_eq!(report.failed_tiles, vec![1]);
    assert_eq!(report.detections.len(), 3);
    assert!(report.summary.contains("1 tile failed"));
}

#[tokio::test]
async fn transient_failure_is_retried_to_success() {
    let image = coordinate_image(100, 100);
    // First invocation fails, the retry succeeds.
    let detector = ScriptedDetector::new(|_, _, call| {
        if call == 0 {
            Err("transient".into())
        } else {
            Ok(vec![raw("truck", 0.8, Rect::new(0, 0, 10, 10))])
        }
    });

    let pipeline = DetectionPipeline::new(config(100, 0)).unwrap();
    let report = pipeline
        .run(image, Arc::new(detector), None, ProgressInfo::default())
        .await
        .unwrap();

    assert!(report.failed_tiles.is_empty());
    assert_eq!(report.detections.len(), 1);
}

#[tokio::test]
async fn out_of_bounds_box_is_dropped_not_fatal() {
    let image = coordinate_image(100, 100);
    let detector = ScriptedDetector::new(|_, _, _| {
        Ok(vec![
            raw("truck", 0.9, Rect::new(50, 50, 160, 160)), // outside the tile
            raw("crane", 0.8, Rect::new(0, 0, 20, 20)),
        ])
    });

    let pipeline = DetectionPipeline::new(config(100, 0)).unwrap();
    let report = pipeline
        .run(image, Arc::new(detector), None, ProgressInfo::default())
        .await
        .unwrap();

    assert!(report.failed_tiles.is_empty());
    assert_eq!(report.detections.len(), 1);
    assert_eq!(report.detections[0].class_name, "crane");
}

#[tokio::test]
async fn report_is_byte_identical_across_shuffled_completion_order() {
    let run_once = |delay_ms: u64| async move {
        let image = coordinate_image(200, 200);
        // Confidence varies per tile so ordering bugs would be visible.
        let script = |left: u32, top: u32, _| {
            let confidence = 0.5 + (left + top) as f32 / 1000.0;
            Ok(vec![raw("excavator", confidence, Rect::new(10, 10, 40, 40))])
        };
        // Different artificial delays reshuffle which worker finishes first.
        let detector = ScriptedDetector::with_delay(script, Duration::from_millis(delay_ms));
        let pipeline = DetectionPipeline::new(config(100, 0)).unwrap();
        let progress = ProgressInfo {
            percent_complete: 42,
            notes: "Earthworks phase ongoing".into(),
        };
        pipeline
            .run(image, Arc::new(detector), None, progress)
            .await
            .unwrap()
            .to_json()
            .unwrap()
    };

    let fast = run_once(0).await;
    let slow = run_once(15).await;
    assert_eq!(fast, slow);
}

#[tokio::test]
async fn cancelled_run_yields_no_report() {
    // Nine slow tiles on a single worker; cancel while the first is in
    // flight.
    let image = coordinate_image(240, 240);
    let detector = ScriptedDetector::with_delay(
        |_, _, _| Ok(vec![raw("truck", 0.9, Rect::new(0, 0, 10, 10))]),
        Duration::from_millis(40),
    );

    let pipeline = DetectionPipeline::new(PipelineConfig {
        tile_size: 80,
        concurrency_limit: 1,
        ..PipelineConfig::default()
    })
    .unwrap();

    let cancel = CancelHandle::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(60)).await;
        trigger.cancel();
    });

    let result = pipeline
        .run_cancellable(
            image,
            Arc::new(detector),
            None,
            ProgressInfo::default(),
            cancel,
        )
        .await;
    assert!(matches!(result, Err(PipelineError::Cancelled)));
}

#[tokio::test]
async fn cancelling_one_run_leaves_the_pipeline_reusable() {
    // The handle is scoped to a single run: after one run is cancelled, the
    // same pipeline must serve later runs normally.
    let pipeline = DetectionPipeline::new(config(100, 0)).unwrap();

    let slow = ScriptedDetector::with_delay(
        |_, _, _| Ok(vec![raw("truck", 0.9, Rect::new(0, 0, 10, 10))]),
        Duration::from_millis(40),
    );
    let cancel = CancelHandle::new();
    cancel.cancel();
    let cancelled = pipeline
        .run_cancellable(
            coordinate_image(100, 100),
            Arc::new(slow),
            None,
            ProgressInfo::default(),
            cancel,
        )
        .await;
    assert!(matches!(cancelled, Err(PipelineError::Cancelled)));

    let fast = ScriptedDetector::new(|_, _, _| {
        Ok(vec![raw("crane", 0.8, Rect::new(10, 10, 30, 30))])
    });
    let report = pipeline
        .run(
            coordinate_image(100, 100),
            Arc::new(fast),
            None,
            ProgressInfo::default(),
        )
        .await
        .expect("a later, never-cancelled run must succeed");
    assert_eq!(report.detections.len(), 1);
    assert!(report.failed_tiles.is_empty());
}

#[tokio::test]
async fn slow_inference_times_out_into_failed_tile() {
    let image = coordinate_image(100, 100);
    let detector = ScriptedDetector::with_delay(
        |_, _, _| Ok(vec![raw("truck", 0.9, Rect::new(0, 0, 10, 10))]),
        Duration::from_millis(200),
    );

    let pipeline = DetectionPipeline::new(PipelineConfig {
        tile_size: 100,
        max_retries: 0,
        infer_timeout: Some(Duration::from_millis(20)),
        ..PipelineConfig::default()
    })
    .unwrap();

    let report = pipeline
        .run(image, Arc::new(detector), None, ProgressInfo::default())
        .await
        .unwrap();
    assert_eq!(report.failed_tiles, vec![0]);
    assert!(report.detections.is_empty());
}

/// Observer that records which tiles it saw; exercises the crop side-channel
/// without touching the filesystem.
struct RecordingObserver {
    seen: Mutex<Vec<u32>>,
}

impl TileObserver for RecordingObserver {
    fn tile_cropped(&self, tile: &Tile, pixels: &RgbImage) {
        assert_eq!(pixels.dimensions(), (tile.rect.width(), tile.rect.height()));
        self.seen.lock().unwrap().push(tile.id);
    }
}

#[tokio::test]
async fn observer_sees_every_cropped_tile_once() {
    let image = coordinate_image(200, 100);
    let detector = ScriptedDetector::new(|_, _, _| Ok(Vec::new()));
    let observer = Arc::new(RecordingObserver {
        seen: Mutex::new(Vec::new()),
    });

    let pipeline = DetectionPipeline::new(config(100, 0)).unwrap();
    pipeline
        .run(
            image,
            Arc::new(detector),
            Some(observer.clone()),
            ProgressInfo::default(),
        )
        .await
        .unwrap();

    let mut seen = observer.seen.lock().unwrap().clone();
    seen.sort_unstable();
    assert_eq!(seen, vec![0, 1]);
}
