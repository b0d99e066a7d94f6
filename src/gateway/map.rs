//! `GET /get-mapbox`: 指定座標の衛星画像（赤いピン付き）を中継する。

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use tracing::{debug, error};

use super::{AppState, GatewayError};

#[derive(Debug, Deserialize)]
pub(super) struct MapQuery {
    lat: Option<String>,
    lon: Option<String>,
    zoom: Option<String>,
    width: Option<String>,
    height: Option<String>,
}

fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// 上流の静止画 URL（トークンを除く）を組み立てる。
fn static_image_url(base_url: &str, query: &MapQuery, lat: &str, lon: &str) -> String {
    let zoom = present(&query.zoom).unwrap_or("14");
    let width = present(&query.width).unwrap_or("800");
    let height = present(&query.height).unwrap_or("600");
    format!(
        "{}/pin-s+ff0000({lon},{lat})/{lon},{lat},{zoom}/{width}x{height}",
        base_url.trim_end_matches('/')
    )
}

pub(super) async fn static_image(
    State(state): State<Arc<AppState>>,
    Query(query): Query<MapQuery>,
) -> Result<Response, GatewayError> {
    let Some(token) = state.config.mapbox_token.as_deref() else {
        error!("MAPBOX_TOKEN is not set");
        return Err(GatewayError::Misconfigured(
            "MAPBOX_TOKEN environment variable not configured".to_string(),
        ));
    };

    let (Some(lat), Some(lon)) = (present(&query.lat), present(&query.lon)) else {
        return Err(GatewayError::BadRequest(
            "Missing required parameters: lat and lon".to_string(),
        ));
    };

    let url = static_image_url(&state.config.mapbox_base_url, &query, lat, lon);
    debug!(url = %url, "Fetching static map");

    let response = state
        .http
        .get(&url)
        .query(&[("access_token", token)])
        .send()
        .await?;

    let upstream = response.status();
    if !upstream.is_success() {
        let status =
            StatusCode::from_u16(upstream.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
        return Err(GatewayError::Map {
            status,
            reason: upstream.canonical_reason().unwrap_or("unknown").to_string(),
        });
    }

    let bytes = response.bytes().await?;
    debug!(lat, lon, bytes = bytes.len(), "Static map relayed");
    Ok(([(header::CONTENT_TYPE, "image/png")], bytes).into_response())
}
