use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::client::FeatureClient;
use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::models::{Detection, EnrichStats, Feature, ImageDescriptor};
use crate::symbols::SymbolResolver;

// Thumbnail fields from best to worst quality
const THUMBNAIL_FIELDS: [&str; 4] = [
    "thumb_original_url",
    "thumb_2048_url",
    "thumb_1024_url",
    "thumb_256_url",
];
const DETECTION_FIELDS: &str = "id,value,geometry";

#[derive(Deserialize)]
struct ImageList {
    images: Option<ImageRefs>,
}

#[derive(Deserialize)]
struct ImageRefs {
    #[serde(default)]
    data: Vec<ImageRef>,
}

#[derive(Deserialize)]
struct ImageRef {
    id: String,
}

#[derive(Deserialize)]
struct ImageMetadata {
    #[serde(flatten)]
    fields: HashMap<String, serde_json::Value>,
}

impl ImageMetadata {
    fn best_thumbnail(&self) -> Option<String> {
        THUMBNAIL_FIELDS
            .iter()
            .filter_map(|field| self.fields.get(*field).and_then(|v| v.as_str()))
            .find(|url| !url.is_empty())
            .map(str::to_string)
    }

    fn dimension(&self, field: &str) -> Option<u32> {
        self.fields
            .get(field)
            .and_then(|v| v.as_u64())
            .and_then(|v| u32::try_from(v).ok())
            .filter(|v| *v > 0)
    }
}

#[derive(Deserialize)]
struct DetectionPage {
    #[serde(default)]
    data: Vec<Detection>,
}

#[derive(Debug, Clone, Copy)]
pub struct EnrichOptions {
    pub images: bool,
    pub detections: bool,
    pub symbols: bool,
}

impl From<&PipelineConfig> for EnrichOptions {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            images: config.enrich_images,
            detections: config.enrich_detections,
            symbols: config.resolve_symbols,
        }
    }
}

impl EnrichOptions {
    pub fn any(&self) -> bool {
        self.images || self.detections || self.symbols
    }
}

/// Attaches image, detections and symbol to features. One instance lives for
/// one run so its image cache never outlives the run.
///
/// Concurrent lookups of the same image share one metadata request.
pub struct Enricher {
    client: FeatureClient,
    symbols: SymbolResolver,
    options: EnrichOptions,
    images: Mutex<HashMap<String, Arc<OnceCell<ImageDescriptor>>>>,
}

impl Enricher {
    pub fn new(client: FeatureClient, symbols: SymbolResolver, options: EnrichOptions) -> Self {
        Self {
            client,
            symbols,
            options,
            images: Mutex::new(HashMap::new()),
        }
    }

    pub fn cached_images(&self) -> usize {
        self.images.lock().values().filter(|cell| cell.initialized()).count()
    }

    async fn first_image_id(&self, feature_id: &str) -> Result<String, PipelineError> {
        let url = self.client.api_url(feature_id, &[("fields", "images")])?;
        let list: ImageList = self.client.get_json(&url).await?;
        list.images
            .and_then(|refs| refs.data.into_iter().next())
            .map(|image| image.id)
            .ok_or_else(|| PipelineError::MissingImageData(format!("feature {} has no images", feature_id)))
    }

    /// Thumbnail URL and size of the first image showing the feature.
    pub async fn resolve_image(&self, feature_id: &str) -> Result<ImageDescriptor, PipelineError> {
        let image_id = self.first_image_id(feature_id).await?;

        // Lock only to find the slot; waiting happens on the cell
        let cell = self.images.lock().entry(image_id.clone()).or_default().clone();
        if cell.initialized() {
            debug!(%image_id, "image descriptor cache hit");
        }
        // A failed lookup leaves the cell empty for the next caller
        let descriptor = cell.get_or_try_init(|| self.fetch_image_metadata(&image_id)).await?;
        Ok(descriptor.clone())
    }

    async fn fetch_image_metadata(&self, image_id: &str) -> Result<ImageDescriptor, PipelineError> {
        let fields = format!("{},width,height", THUMBNAIL_FIELDS.join(","));
        let url = self.client.api_url(image_id, &[("fields", &fields)])?;
        let metadata: ImageMetadata = self.client.get_json(&url).await?;

        let source_url = metadata
            .best_thumbnail()
            .ok_or_else(|| PipelineError::MissingImageData(format!("image {} has no thumbnail", image_id)))?;
        let (width, height) = match (metadata.dimension("width"), metadata.dimension("height")) {
            (Some(w), Some(h)) => (w, h),
            _ => {
                return Err(PipelineError::MissingImageData(format!(
                    "image {} has no usable dimensions",
                    image_id
                )))
            }
        };

        Ok(ImageDescriptor {
            id: image_id.to_string(),
            source_url,
            width,
            height,
        })
    }

    /// Raw detections of an image; geometries are still encoded.
    pub async fn fetch_detections(&self, image: &ImageDescriptor) -> Result<Vec<Detection>, PipelineError> {
        let url = self
            .client
            .api_url(&format!("{}/detections", image.id), &[("fields", DETECTION_FIELDS)])?;
        let page: DetectionPage = self.client.get_json(&url).await?;
        Ok(page.data)
    }

    /// Downloads the image bytes behind a descriptor.
    pub async fn fetch_image_bytes(&self, image: &ImageDescriptor) -> Result<Vec<u8>, PipelineError> {
        let response = self.client.get_with_retry(&image.source_url).await?;
        Ok(response.body)
    }

    /// Best effort: each step that fails leaves its field absent and is
    /// counted in the returned stats.
    pub async fn enrich(&self, mut feature: Feature) -> (Feature, EnrichStats) {
        let mut stats = EnrichStats::default();

        if self.options.symbols {
            feature.symbol_url = self.symbols.resolve(&feature.object_value).await.url().map(str::to_string);
            if feature.symbol_url.is_some() {
                stats.symbols_resolved += 1;
            }
        }

        if !(self.options.images || self.options.detections) {
            return (feature, stats);
        }

        let image = match self.resolve_image(&feature.id).await {
            Ok(image) => image,
            Err(err) => {
                debug!(feature = %feature.id, error = %err, "no image for feature");
                stats.images_missing += 1;
                return (feature, stats);
            }
        };
        stats.images_resolved += 1;

        if self.options.detections {
            match self.fetch_detections(&image).await {
                Ok(mut detections) => {
                    for detection in detections.iter_mut() {
                        let outcome = detection.resolve(image.width, image.height).map(|_| ());
                        match outcome {
                            Ok(()) => stats.detections_decoded += 1,
                            Err(err) => {
                                warn!(feature = %feature.id, label = %detection.label, error = %err, "skipping detection");
                                stats.detections_skipped += 1;
                            }
                        }
                    }
                    feature.detections = detections;
                }
                Err(err) => {
                    debug!(image = %image.id, error = %err, "detections unavailable");
                    stats.detection_lists_missing += 1;
                }
            }
        }

        feature.image = Some(image);
        (feature, stats)
    }
}
