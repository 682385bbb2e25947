use super::{http_client, TileService, DEFAULT_TIMEOUT};
use crate::error::ServiceError;
use panocore::TileKey;

pub const DEFAULT_TILE_URL: &str = "https://cbk0.google.com/cbk";

/// Client for the `cbk` tile endpoint. Plain-HTTP base URLs are upgraded
/// to HTTPS.
#[derive(Debug, Clone)]
pub struct CbkTileClient {
    http: reqwest::Client,
    base_url: String,
}

impl CbkTileClient {
    pub fn new(base_url: &str, max_idle: usize) -> Result<Self, ServiceError> {
        let base_url = match base_url.strip_prefix("http://") {
            Some(rest) => format!("https://{rest}"),
            None => base_url.to_string(),
        };
        Ok(Self {
            http: http_client(DEFAULT_TIMEOUT, max_idle)?,
            base_url,
        })
    }

    fn tile_url(&self, panorama_id: &str, zoom: u8, key: TileKey) -> String {
        format!(
            "{}?output=tile&panoid={panorama_id}&zoom={zoom}&x={}&y={}",
            self.base_url, key.col, key.row
        )
    }
}

impl TileService for CbkTileClient {
    async fn fetch_tile(&self, panorama_id: &str, zoom: u8, key: TileKey) -> Result<Vec<u8>, ServiceError> {
        let resp = self.http.get(self.tile_url(panorama_id, zoom, key)).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(match ServiceError::from_status(status) {
                // The endpoint answers 400 for tiles outside a panorama's grid.
                ServiceError::Invalid(_) if status == reqwest::StatusCode::BAD_REQUEST => ServiceError::NotFound,
                other => other,
            });
        }
        let bytes = resp.bytes().await?;
        if bytes.is_empty() {
            return Err(ServiceError::Unavailable(format!(
                "empty body for tile ({}, {}) of {panorama_id}",
                key.row, key.col
            )));
        }
        Ok(bytes.to_vec())
    }
}
