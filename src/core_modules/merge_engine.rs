// THEORY:
// The `merge_engine` module collapses the per-tile detection sets into one
// canonical global set. Two effects make this mandatory: an object that
// straddles a tile boundary is detected once per tile it touches, and the
// capability itself can emit redundant overlapping boxes within a single
// tile. Both collapse under the same algorithm: class-aware greedy
// non-maximum suppression over the full global set, run once after every
// tile has completed.
//
// Key architectural principles:
// 1.  **Class awareness**: Suppression only ever happens within a class. A
//     crane box overlapping an excavator box describes two objects, not a
//     duplicate.
// 2.  **Total, deterministic ordering**: Confidence descending, then
//     ascending contributing tile id, then ascending left edge. Float
//     confidence alone is not a total order across runs once tiles complete
//     in arbitrary order, so the tie-breaks are what make the final report
//     byte-identical run to run.
// 3.  **Provenance survives suppression**: When a detection is suppressed,
//     its `source_tile_ids` are folded into the survivor. A cross-tile
//     duplicate therefore leaves exactly one detection that names both
//     tiles.
// 4.  **Idempotence**: Survivors of one pass are pairwise below the IoU
//     threshold by construction, so a second pass changes nothing.

use std::collections::BTreeMap;

use crate::core_modules::detection::GlobalDetection;

/// Deduplicates the global detection set with class-aware greedy NMS.
///
/// Detections of the same class whose boxes overlap beyond `iou_threshold`
/// are collapsed into the highest-confidence one, which inherits the union
/// of their `source_tile_ids`. Survivors are returned sorted by position
/// (top-to-bottom, then left-to-right) for stable report output.
pub fn merge_detections(
    detections: Vec<GlobalDetection>,
    iou_threshold: f64,
) -> Vec<GlobalDetection> {
    // Partition by class; BTreeMap so class iteration order is stable.
    let mut by_class: BTreeMap<String, Vec<GlobalDetection>> = BTreeMap::new();
    for detection in detections {
        by_class
            .entry(detection.class_name.clone())
            .or_default()
            .push(detection);
    }

    let mut survivors = Vec::new();
    for (_, mut class_detections) in by_class {
        sort_for_suppression(&mut class_detections);

        let mut suppressed = vec![false; class_detections.len()];
        for i in 0..class_detections.len() {
            if suppressed[i] {
                continue;
            }
            for j in (i + 1)..class_detections.len() {
                if suppressed[j] {
                    continue;
                }
                let iou = class_detections[i]
                    .global_box
                    .iou(&class_detections[j].global_box);
                if iou > iou_threshold {
                    suppressed[j] = true;
                    let absorbed = std::mem::take(&mut class_detections[j].source_tile_ids);
                    class_detections[i].source_tile_ids.extend(absorbed);
                }
            }
        }

        survivors.extend(
            class_detections
                .into_iter()
                .zip(suppressed)
                .filter_map(|(detection, dead)| (!dead).then_some(detection)),
        );
    }

    // Stable output order for the report: top-to-bottom, left-to-right,
    // then class and confidence as final ties.
    survivors.sort_by(|a, b| {
        (a.global_box.top, a.global_box.left, &a.class_name)
            .cmp(&(b.global_box.top, b.global_box.left, &b.class_name))
            .then(
                b.confidence
                    .partial_cmp(&a.confidence)
                    .unwrap_or(std::cmp::Ordering::Equal),
            )
    });
    survivors
}

/// Confidence descending; ties broken by the smallest contributing tile id,
/// then by the left edge of the box.
fn sort_for_suppression(detections: &mut [GlobalDetection]) {
    detections.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| min_tile(a).cmp(&min_tile(b)))
            .then_with(|| a.global_box.left.cmp(&b.global_box.left))
    });
}

fn min_tile(detection: &GlobalDetection) -> u32 {
    detection
        .source_tile_ids
        .first()
        .copied()
        .unwrap_or(u32::MAX)
}
