use reqwest::Url;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::PipelineConfig;
use crate::error::{PipelineError, TransportError, TransportErrorKind};
use crate::models::{Feature, FeaturePage};
use crate::tiles::BoundingBox;
use crate::transport::{HttpResponse, Transport};

pub const FEATURE_FIELDS: &str = "id,object_value,geometry";
const STATUS_TOO_MANY_REQUESTS: u16 = 429;

/// Feature API client with bounded retries and a per-call timeout.
#[derive(Clone)]
pub struct FeatureClient {
    transport: Arc<dyn Transport>,
    api_base_url: String,
    access_token: String,
    max_attempts: u32,
    retry_delay: Duration,
    request_timeout: Duration,
    retry_rate_limited: bool,
}

impl FeatureClient {
    pub fn new(transport: Arc<dyn Transport>, config: &PipelineConfig) -> Self {
        Self {
            transport,
            api_base_url: config.api_base_url.trim_end_matches('/').to_string(),
            access_token: config.access_token.clone(),
            max_attempts: config.max_retries.max(1),
            retry_delay: config.retry_delay(),
            request_timeout: config.request_timeout(),
            retry_rate_limited: config.retry_rate_limited,
        }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// `{base}/{path}` with the access token and any extra query pairs.
    pub fn api_url(&self, path: &str, params: &[(&str, &str)]) -> Result<String, PipelineError> {
        let base = format!("{}/{}", self.api_base_url, path.trim_start_matches('/'));
        let query = std::iter::once(("access_token", self.access_token.as_str())).chain(params.iter().copied());
        Url::parse_with_params(&base, query)
            .map(String::from)
            .map_err(|e| PipelineError::Config(format!("invalid api url {}: {}", base, e)))
    }

    pub fn feature_url(&self, bbox: &BoundingBox) -> Result<String, PipelineError> {
        let bbox_str = bbox.to_query_value();
        self.api_url("map_features", &[("fields", FEATURE_FIELDS), ("bbox", &bbox_str)])
    }

    // One bounded call; an elapsed timeout is reported like a transport timeout
    async fn attempt(&self, url: &str) -> Result<HttpResponse, TransportError> {
        match tokio::time::timeout(self.request_timeout, self.transport.get(url)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::new(
                TransportErrorKind::Timeout,
                format!("no response within {:?}", self.request_timeout),
            )),
        }
    }

    /// GET with the retry policy applied.
    ///
    /// Transport failures are retried up to `max_retries` attempts in total with a
    /// fixed delay. Non-2xx statuses are returned as `RemoteError` without retrying,
    /// except 429 when `retry_rate_limited` is set.
    pub async fn get_with_retry(&self, url: &str) -> Result<HttpResponse, PipelineError> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let can_retry = attempts < self.max_attempts;

            match self.attempt(url).await {
                Ok(response) if response.is_success() => return Ok(response),
                Ok(response)
                    if response.status == STATUS_TOO_MANY_REQUESTS && self.retry_rate_limited && can_retry =>
                {
                    warn!(attempt = attempts, "rate limited, backing off");
                }
                Ok(response) => return Err(PipelineError::RemoteError { status: response.status }),
                Err(err) if err.is_transient() && can_retry => {
                    debug!(attempt = attempts, error = %err, "transient failure, retrying");
                }
                Err(err) => {
                    return Err(PipelineError::TransientFetchError { attempts, source: err });
                }
            }

            tokio::time::sleep(self.retry_delay).await;
        }
    }

    pub async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, PipelineError> {
        let response = self.get_with_retry(url).await?;
        serde_json::from_slice(&response.body).map_err(|e| PipelineError::MalformedResponse(e.to_string()))
    }

    /// Features inside one sub-bbox.
    pub async fn fetch(&self, bbox: &BoundingBox) -> Result<Vec<Feature>, PipelineError> {
        let url = self.feature_url(bbox)?;
        let page: FeaturePage = self.get_json(&url).await?;
        debug!(bbox = %bbox.to_query_value(), count = page.data.len(), "fetched tile features");
        Ok(page.data)
    }
}
