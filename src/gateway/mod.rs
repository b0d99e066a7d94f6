//! ゲートウェイ
//!
//! マネージド関数（`POST /gemini`）と地図プロキシ（`GET /get-mapbox`）を
//! HTTP で提供する。上流の API キーはサーバー側の環境変数だけが持ち、
//! クライアントには渡さない。
//!
//! - `GET /ping` / `GET /gemini/ping` / `GET /get-mapbox/ping` → `Pong`

mod error;
mod map;
mod vision;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::routing::{get, post};
use axum::Router;
use tracing::{debug, info, warn};

pub use error::GatewayError;

const DEFAULT_GEMINI_MODEL: &str = "gemini-2.5-flash-preview-05-20";
const DEFAULT_GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";
const DEFAULT_MAPBOX_BASE_URL: &str = "https://api.mapbox.com/styles/v1/mapbox/satellite-v9/static";

/// ゲートウェイの設定（環境変数から読む）
#[derive(Debug, Clone, Default)]
pub struct GatewayConfig {
    /// モデル API のキー（`GEMINI_API_KEY`）
    pub gemini_api_key: Option<String>,
    /// リクエストでモデルが指定されなかった場合に使うモデル
    pub gemini_model: String,
    pub gemini_base_url: String,
    /// 地図 API のトークン（`MAPBOX_TOKEN`）
    pub mapbox_token: Option<String>,
    pub mapbox_base_url: String,
}

impl GatewayConfig {
    pub fn from_env() -> Self {
        fn env(name: &str) -> Option<String> {
            std::env::var(name).ok().filter(|v| !v.trim().is_empty())
        }

        Self {
            gemini_api_key: env("GEMINI_API_KEY"),
            gemini_model: env("GEMINI_MODEL").unwrap_or_else(|| DEFAULT_GEMINI_MODEL.to_string()),
            gemini_base_url: env("GEMINI_BASE_URL")
                .unwrap_or_else(|| DEFAULT_GEMINI_BASE_URL.to_string()),
            mapbox_token: env("MAPBOX_TOKEN"),
            mapbox_base_url: env("MAPBOX_BASE_URL")
                .unwrap_or_else(|| DEFAULT_MAPBOX_BASE_URL.to_string()),
        }
    }
}

/// 全ハンドラで共有する状態
pub struct AppState {
    http: reqwest::Client,
    config: GatewayConfig,
}

impl AppState {
    pub fn new(config: GatewayConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { http, config })
    }
}

async fn pong() -> &'static str {
    "Pong"
}

/// ルーティングを組み立てる。
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ping", get(pong))
        .route("/gemini", post(vision::analyze))
        .route("/gemini/ping", get(pong))
        .route("/get-mapbox", get(map::static_image))
        .route("/get-mapbox/ping", get(pong))
        .with_state(state)
}

/// 指定アドレスで待ち受け、終了シグナル（Ctrl-C）まで処理を続ける。
pub async fn serve(addr: SocketAddr, config: GatewayConfig) -> Result<()> {
    if config.gemini_api_key.is_none() {
        warn!("GEMINI_API_KEY is not set, /gemini will answer 500");
    }
    if config.mapbox_token.is_none() {
        warn!("MAPBOX_TOKEN is not set, /get-mapbox will answer 500");
    }

    let state = Arc::new(AppState::new(config)?);
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(address = %addr, "gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await
        .context("gateway server error")?;
    Ok(())
}

/// `GET {base_url}/ping` を呼んで応答本文を返す。
pub async fn probe(base_url: &str) -> Result<String> {
    let url = format!("{}/ping", base_url.trim_end_matches('/'));
    let response = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .context("failed to build HTTP client")?
        .get(&url)
        .send()
        .await
        .with_context(|| format!("failed to reach {url}"))?;

    let status = response.status();
    let body = response.text().await.context("failed to read ping reply")?;
    if !status.is_success() {
        anyhow::bail!("{url} answered {status}");
    }
    debug!(url = %url, body = %body, "Ping answered");
    Ok(body)
}

#[cfg(test)]
pub(crate) fn test_server(config: GatewayConfig) -> axum_test::TestServer {
    let state = Arc::new(AppState::new(config).unwrap());
    axum_test::TestServer::new(router(state)).unwrap()
}
