//! Static satellite map thumbnails.
//!
//! [`MapThumbnailFetcher`] builds a static-map request for a coordinate and
//! downloads it through an [`HttpTransport`]. There is no retry and no
//! timeout beyond the transport's own; any failure becomes
//! [`MapOutcome::Failure`] and the overlay is composed without a map.

use anyhow::{Context, Result};
use image::RgbaImage;
use reqwest::Client;
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::config::MapConfig;
use crate::geo::Coordinate;

/// Everything needed to request one map thumbnail.
#[derive(Debug, Clone, PartialEq)]
pub struct MapRequest {
    pub coordinate: Coordinate,
    pub width: u32,
    pub height: u32,
    pub zoom: u8,
    pub api_key: String,
}

impl MapRequest {
    /// Build from config; `None` when no API key is configured.
    pub fn from_config(coordinate: Coordinate, config: &MapConfig) -> Option<Self> {
        let api_key = config.api_key.as_deref()?.trim();
        if api_key.is_empty() {
            return None;
        }
        Some(Self {
            coordinate,
            width: config.width,
            height: config.height,
            zoom: config.zoom,
            api_key: api_key.to_string(),
        })
    }
}

/// Result of a map fetch. Failure is an expected outcome, not an error.
#[derive(Debug, Clone)]
pub enum MapOutcome {
    Fetched(RgbaImage),
    Failure(String),
}

impl MapOutcome {
    pub fn into_image(self) -> Option<RgbaImage> {
        match self {
            Self::Fetched(img) => Some(img),
            Self::Failure(_) => None,
        }
    }
}

/// Build the static map URL: satellite imagery centered on the coordinate
/// with a red marker on it.
pub fn static_map_url(base_url: &str, request: &MapRequest) -> String {
    let center = format!(
        "{},{}",
        request.coordinate.latitude, request.coordinate.longitude
    );
    format!(
        "{base_url}?center={center}&zoom={}&size={}x{}&markers=color:red%7C{center}&maptype=satellite&key={}",
        request.zoom, request.width, request.height, request.api_key
    )
}

/// Minimal GET seam so the fetcher can run against a fake in tests.
#[async_trait::async_trait]
pub trait HttpTransport: Send + Sync {
    /// GET the URL and return the body. Non-2xx responses are errors.
    async fn get_bytes(&self, url: &str) -> Result<Vec<u8>>;
}

/// [`HttpTransport`] over a shared reqwest client.
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl HttpTransport for ReqwestTransport {
    async fn get_bytes(&self, url: &str) -> Result<Vec<u8>> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .context("Map request failed")?;

        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("Map API error ({status})");
        }

        let body = resp.bytes().await.context("Failed to read map response")?;
        Ok(body.to_vec())
    }
}

/// Downloads and decodes static map thumbnails.
pub struct MapThumbnailFetcher {
    base_url: String,
    transport: Arc<dyn HttpTransport>,
}

impl MapThumbnailFetcher {
    pub fn new(base_url: String, transport: Arc<dyn HttpTransport>) -> Self {
        Self {
            base_url,
            transport,
        }
    }

    /// A fetcher using reqwest and the configured endpoint.
    pub fn from_config(config: &MapConfig) -> Self {
        Self::new(config.base_url.clone(), Arc::new(ReqwestTransport::new()))
    }

    /// Fetch and decode one thumbnail. Never returns an error.
    pub async fn fetch(&self, request: &MapRequest) -> MapOutcome {
        let url = static_map_url(&self.base_url, request);
        log::debug!(
            "Fetching map thumbnail {}x{} at {} (zoom {})",
            request.width,
            request.height,
            request.coordinate,
            request.zoom
        );

        let bytes = match self.transport.get_bytes(&url).await {
            Ok(b) => b,
            Err(e) => {
                log::warn!("Map fetch failed: {e:#}");
                return MapOutcome::Failure(format!("{e:#}"));
            }
        };

        match image::load_from_memory(&bytes) {
            Ok(img) => MapOutcome::Fetched(img.to_rgba8()),
            Err(e) => {
                log::warn!("Map response is not a decodable image: {e}");
                MapOutcome::Failure(format!("undecodable map image: {e}"))
            }
        }
    }

    /// Run [`fetch`](Self::fetch) on a background task.
    pub fn spawn_fetch(self: &Arc<Self>, request: MapRequest) -> JoinHandle<MapOutcome> {
        let fetcher = Arc::clone(self);
        tokio::spawn(async move { fetcher.fetch(&request).await })
    }
}
