// THEORY:
// The `aggregator` module assembles the run's single durable output: the
// Report. It runs strictly after the merge barrier, so it is a read-only
// fold over data that is already final: no filtering, no mutation of the
// detection set happens here.
//
// Key architectural principles:
// 1.  **Single owner**: All the run-wide counters (class counts, failed
//     tiles) that informally accumulate during a run live here as fields of
//     one value, populated once. No shared mutable counters anywhere in the
//     engine.
// 2.  **Schema is the contract**: The reporting layer above this crate
//     serves the Report as JSON verbatim. Field names and ordering are
//     therefore part of the interface; `BTreeMap` for counts and ordered
//     detections guarantee that the same run always serializes to the same
//     bytes.
// 3.  **Partial failure is a normal report**: Failed tiles do not poison the
//     output; they are surfaced in `failed_tiles` next to the detections
//     from the tiles that succeeded.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::core_modules::detection::GlobalDetection;

/// Opaque progress snapshot supplied by the surrounding system, passed
/// through to the report untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProgressInfo {
    pub percent_complete: u32,
    pub notes: String,
}

/// The final, deduplicated result of a run.
///
/// Serializes to the JSON shape the reporting layer serves: `detections`,
/// `class_counts`, `failed_tiles`, `progress`, `summary`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Report {
    /// The canonical global detection set, in stable position order.
    pub detections: Vec<GlobalDetection>,
    /// Number of merged detections per class.
    pub class_counts: BTreeMap<String, usize>,
    /// Ids of tiles whose capability invocation failed on every retry.
    pub failed_tiles: Vec<u32>,
    /// External progress snapshot.
    pub progress: ProgressInfo,
    /// Free-text summary derived from the counts.
    pub summary: String,
}

impl Report {
    /// Builds the report from the merged detection set, the failed-tile list
    /// collected during dispatch, and an external progress snapshot.
    pub fn build(
        detections: Vec<GlobalDetection>,
        mut failed_tiles: Vec<u32>,
        progress: ProgressInfo,
    ) -> Self {
        failed_tiles.sort_unstable();
        failed_tiles.dedup();

        let mut class_counts: BTreeMap<String, usize> = BTreeMap::new();
        for detection in &detections {
            *class_counts.entry(detection.class_name.clone()).or_insert(0) += 1;
        }

        let summary = summarize(detections.len(), class_counts.len(), failed_tiles.len());

        Self {
            detections,
            class_counts,
            failed_tiles,
            progress,
            summary,
        }
    }

    /// Serializes the report to the JSON served by the reporting layer.
    /// Deterministic: the same run always yields the same bytes.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

fn summarize(detections: usize, classes: usize, failed: usize) -> String {
    let mut summary = match detections {
        0 => "No objects detected".to_string(),
        1 => "1 object detected".to_string(),
        n => format!("{n} objects detected across {classes} classes"),
    };
    match failed {
        0 => {}
        1 => summary.push_str("; 1 tile failed"),
        n => summary.push_str(&format!("; {n} tiles failed")),
    }
    summary
}
