// Shared data structures passed between pipeline stages
use serde::{Deserialize, Serialize};

use crate::detections::{self, PixelPolygon};
use crate::error::PipelineError;
use crate::tiles::TileCoordinate;

// Geometry part of a feature, kept in its GeoJSON shape
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct FeatureGeometry {
    pub r#type: String,
    pub coordinates: serde_json::Value, // Point and Polygon have different nesting
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ImageDescriptor {
    pub id: String,
    pub source_url: String,
    pub width: u32,
    pub height: u32,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Detection {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "value")]
    pub label: String,
    // Base64 vector tile as delivered by the detections endpoint
    #[serde(rename = "geometry")]
    pub raw_polygon: String,
    #[serde(default, skip_deserializing)]
    pub pixel_polygon: Option<PixelPolygon>,
}

impl Detection {
    /// Decode the raw polygon into the pixel space of a `width` x `height` image.
    pub fn resolve(&mut self, width: u32, height: u32) -> Result<&PixelPolygon, PipelineError> {
        let polygon = detections::decode_text(&self.raw_polygon, width, height)?;
        Ok(self.pixel_polygon.insert(polygon))
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Feature {
    pub id: String,
    pub object_value: String,
    pub geometry: FeatureGeometry,
    #[serde(default)]
    pub image: Option<ImageDescriptor>,
    #[serde(default)]
    pub symbol_url: Option<String>,
    #[serde(default)]
    pub detections: Vec<Detection>,
}

impl Feature {
    pub fn image_ref(&self) -> Option<&str> {
        self.image.as_ref().map(|image| image.source_url.as_str())
    }

    /// GeoJSON Feature with the enrichment results folded into its properties.
    pub fn to_geojson(&self) -> serde_json::Value {
        let detections: Vec<serde_json::Value> = self
            .detections
            .iter()
            .map(|d| {
                serde_json::json!({
                    "id": d.id,
                    "label": d.label,
                    "pixel_polygon": d.pixel_polygon,
                })
            })
            .collect();

        serde_json::json!({
            "type": "Feature",
            "geometry": self.geometry,
            "properties": {
                "id": self.id,
                "object_value": self.object_value,
                "symbol_url": self.symbol_url,
                "image_url": self.image_ref(),
                "detections": detections,
            }
        })
    }
}

/// One page of the feature API: `{"data": [...]}`.
#[derive(Deserialize, Debug)]
pub struct FeaturePage {
    #[serde(default)]
    pub data: Vec<Feature>,
}

/// A tile whose fetch produced no features because of an error.
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct TileFailure {
    pub tile: TileCoordinate,
    pub transient: bool,
    pub message: String,
}

#[derive(Serialize, Default, Clone, Copy, Debug, PartialEq, Eq)]
pub struct EnrichStats {
    pub images_resolved: usize,
    pub images_missing: usize,
    pub detections_decoded: usize,
    pub detections_skipped: usize,
    pub detection_lists_missing: usize,
    pub symbols_resolved: usize,
}

impl EnrichStats {
    pub fn merge(&mut self, other: &EnrichStats) {
        self.images_resolved += other.images_resolved;
        self.images_missing += other.images_missing;
        self.detections_decoded += other.detections_decoded;
        self.detections_skipped += other.detections_skipped;
        self.detection_lists_missing += other.detection_lists_missing;
        self.symbols_resolved += other.symbols_resolved;
    }
}

/// Outcome of one complete pipeline run.
#[derive(Serialize, Clone, Debug)]
pub struct RunReport {
    pub run_id: String,
    pub tiles_total: usize,
    pub features: Vec<Feature>,
    pub tile_failures: Vec<TileFailure>,
    pub enrich_stats: EnrichStats,
}

impl RunReport {
    pub fn feature_count(&self) -> usize {
        self.features.len()
    }

    pub fn failure_count(&self) -> usize {
        self.tile_failures.len()
            + self.enrich_stats.images_missing
            + self.enrich_stats.detections_skipped
            + self.enrich_stats.detection_lists_missing
    }

    pub fn summary(&self) -> String {
        format!(
            "Found {} features across {} tiles ({} tile failures, {} enrichment failures)",
            self.feature_count(),
            self.tiles_total,
            self.tile_failures.len(),
            self.failure_count() - self.tile_failures.len()
        )
    }

    pub fn to_feature_collection(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "FeatureCollection",
            "features": self.features.iter().map(Feature::to_geojson).collect::<Vec<_>>(),
        })
    }
}
