use std::collections::HashSet;

use crate::models::Feature;

/// Concatenate per-tile results in tile order.
///
/// Features seen in two overlapping tiles stay duplicated; use
/// [`dedup_by_id`] when a unique collection is wanted.
pub fn aggregate(per_tile_results: Vec<Vec<Feature>>) -> Vec<Feature> {
    let total = per_tile_results.iter().map(Vec::len).sum();
    let mut features = Vec::with_capacity(total);
    for tile_features in per_tile_results {
        features.extend(tile_features);
    }
    features
}

/// Keep the first feature seen for every id, preserving order.
pub fn dedup_by_id(features: Vec<Feature>) -> Vec<Feature> {
    let mut seen = HashSet::with_capacity(features.len());
    features
        .into_iter()
        .filter(|feature| seen.insert(feature.id.clone()))
        .collect()
}
