//! 衛星画像の取得
//!
//! 地図プロキシ `GET {functions_url}/get-mapbox` から指定座標の静的衛星画像を取得し、
//! 次の会話ターンにそのまま載せられる `data:` URL として返す。

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, error, info};

use crate::config::Settings;
use crate::error::LocateError;

use super::prompts::{SATELLITE_HEIGHT, SATELLITE_WIDTH, SATELLITE_ZOOM};
use super::types::ImageRef;

/// 座標から衛星画像を得る
#[async_trait]
pub trait SatelliteSource: Send + Sync {
    async fn fetch(&self, latitude: f64, longitude: f64) -> Result<ImageRef, LocateError>;
}

/// 地図プロキシ関数を使う取得器
pub struct MapProxyClient {
    http: reqwest::Client,
    endpoint: String,
}

impl MapProxyClient {
    pub fn from_settings(settings: &Settings) -> Result<Self, LocateError> {
        Self::new(&settings.provider.functions_url)
    }

    pub fn new(functions_url: &str) -> Result<Self, LocateError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            http,
            endpoint: format!("{}/get-mapbox", functions_url.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl SatelliteSource for MapProxyClient {
    async fn fetch(&self, latitude: f64, longitude: f64) -> Result<ImageRef, LocateError> {
        debug!(endpoint = %self.endpoint, latitude, longitude, "Fetching satellite image");

        let response = self
            .http
            .get(&self.endpoint)
            .query(&[
                ("lat", latitude.to_string()),
                ("lon", longitude.to_string()),
                ("zoom", SATELLITE_ZOOM.to_string()),
                ("width", SATELLITE_WIDTH.to_string()),
                ("height", SATELLITE_HEIGHT.to_string()),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, "Satellite image request failed");
            let message = serde_json::from_str::<Value>(&body)
                .ok()
                .and_then(|v| v.get("error").and_then(Value::as_str).map(str::to_string))
                .unwrap_or_else(|| status.canonical_reason().unwrap_or("unknown").to_string());
            return Err(LocateError::SatelliteFetch {
                status: status.as_u16(),
                message,
            });
        }

        let mime = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(';').next())
            .map(str::trim)
            .filter(|v| v.starts_with("image/"))
            .unwrap_or("image/png")
            .to_string();
        let bytes = response.bytes().await?;

        info!(latitude, longitude, bytes = bytes.len(), mime = %mime, "Satellite image fetched");
        Ok(ImageRef::from_bytes(&mime, &bytes))
    }
}
