use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::aggregate::{aggregate, dedup_by_id};
use crate::cancellation::CancellationToken;
use crate::client::FeatureClient;
use crate::config::PipelineConfig;
use crate::enrich::{EnrichOptions, Enricher};
use crate::error::PipelineError;
use crate::models::{EnrichStats, Feature, RunReport, TileFailure};
use crate::symbols::SymbolResolver;
use crate::tiles::{tile_bounds, tiles_within_limit, BoundingBox, TileCoordinate};
use crate::transport::{ReqwestTransport, Transport};

/// Tile fetches after decomposition, before aggregation.
pub struct TileFetch {
    pub tiles_total: usize,
    pub per_tile: Vec<Vec<Feature>>,
    pub failures: Vec<TileFailure>,
}

pub struct Pipeline {
    config: PipelineConfig,
    client: FeatureClient,
}

impl Pipeline {
    pub fn new(transport: Arc<dyn Transport>, config: PipelineConfig) -> Result<Self, PipelineError> {
        config.validate()?;
        let client = FeatureClient::new(transport, &config);
        Ok(Self { config, client })
    }

    /// Pipeline talking to the real API over HTTPS.
    pub fn from_config(config: PipelineConfig) -> Result<Self, PipelineError> {
        let transport = ReqwestTransport::new(config.request_timeout())
            .map_err(|e| PipelineError::Config(e.to_string()))?;
        Self::new(Arc::new(transport), config)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn client(&self) -> &FeatureClient {
        &self.client
    }

    /// Fresh enricher with an empty image cache.
    pub fn enricher(&self) -> Enricher {
        let symbols = SymbolResolver::new(self.client.transport().clone(), self.config.symbol_sources.clone());
        Enricher::new(self.client.clone(), symbols, EnrichOptions::from(&self.config))
    }

    /// Fetch every tile covering `bbox` with at most `fetch_workers` requests in
    /// flight. Results come back in tile order.
    pub async fn fetch_tiles(&self, bbox: &BoundingBox) -> Result<TileFetch, PipelineError> {
        let tiles = tiles_within_limit(bbox, self.config.zoom, self.config.max_tiles)?;
        info!(tiles = tiles.len(), zoom = self.config.zoom, "fetching features for bbox");

        let results: Vec<(TileCoordinate, Result<Vec<Feature>, PipelineError>)> = stream::iter(tiles.iter().copied())
            .map(|tile| async move {
                let part = tile_bounds(&tile);
                (tile, self.client.fetch(&part).await)
            })
            .buffered(self.config.fetch_workers)
            .collect()
            .await;

        let mut per_tile = Vec::with_capacity(results.len());
        let mut failures = Vec::new();
        for (tile, result) in results {
            match result {
                Ok(features) => per_tile.push(features),
                Err(err) => {
                    warn!(tile = %tile.key(), error = %err, "tile contributed no features");
                    failures.push(TileFailure {
                        tile,
                        transient: matches!(err, PipelineError::TransientFetchError { .. }),
                        message: err.to_string(),
                    });
                }
            }
        }

        Ok(TileFetch {
            tiles_total: tiles.len(),
            per_tile,
            failures,
        })
    }

    /// Enrich features with at most `enrich_workers` in flight, keeping order.
    pub async fn enrich_all(&self, features: Vec<Feature>) -> (Vec<Feature>, EnrichStats) {
        let options = EnrichOptions::from(&self.config);
        if !options.any() || features.is_empty() {
            return (features, EnrichStats::default());
        }

        let enricher = self.enricher();
        let enriched: Vec<(Feature, EnrichStats)> = stream::iter(features)
            .map(|feature| enricher.enrich(feature))
            .buffered(self.config.enrich_workers)
            .collect()
            .await;

        let mut stats = EnrichStats::default();
        let features = enriched
            .into_iter()
            .map(|(feature, feature_stats)| {
                stats.merge(&feature_stats);
                feature
            })
            .collect();
        debug!(cached_images = enricher.cached_images(), "enrichment finished");
        (features, stats)
    }

    async fn execute(&self, bbox: &BoundingBox, token: &CancellationToken) -> Result<RunReport, PipelineError> {
        token.throw_if_cancelled()?;
        let fetch = self.fetch_tiles(bbox).await?;

        let mut features = aggregate(fetch.per_tile);
        if self.config.dedup_by_id {
            let before = features.len();
            features = dedup_by_id(features);
            debug!(removed = before - features.len(), "deduplicated features by id");
        }
        info!(
            features = features.len(),
            failed_tiles = fetch.failures.len(),
            "aggregated tile results"
        );

        token.throw_if_cancelled()?;
        let (features, enrich_stats) = self.enrich_all(features).await;

        Ok(RunReport {
            run_id: token.id.clone(),
            tiles_total: fetch.tiles_total,
            features,
            tile_failures: fetch.failures,
            enrich_stats,
        })
    }

    /// Full run over `bbox`. Cancelling `token` drops every in-flight request
    /// and discards partial results.
    pub async fn run(&self, bbox: &BoundingBox, token: &CancellationToken) -> Result<RunReport, PipelineError> {
        tokio::select! {
            biased;
            _ = token.cancelled() => {
                info!(run = %token.id, "run cancelled");
                Err(PipelineError::Cancelled(token.id.clone()))
            }
            report = self.execute(bbox, token) => report,
        }
    }

    /// Download the image of every enriched feature, `enrich_workers` at a time.
    /// Features whose image cannot be fetched are left out.
    pub async fn fetch_images(&self, features: &[Feature]) -> Vec<(String, Vec<u8>)> {
        let enricher = self.enricher();
        stream::iter(features.iter().filter(|f| f.image.is_some()))
            .map(|feature| {
                let enricher = &enricher;
                async move {
                    let image = feature.image.as_ref()?;
                    match enricher.fetch_image_bytes(image).await {
                        Ok(bytes) => Some((feature.id.clone(), bytes)),
                        Err(err) => {
                            warn!(feature = %feature.id, error = %err, "image download failed, skipping render");
                            None
                        }
                    }
                }
            })
            .buffered(self.config.enrich_workers)
            .filter_map(|item| async move { item })
            .collect()
            .await
    }
}
