//! ゲートウェイのエラー型
//!
//! [`GatewayError`] は [`axum::response::IntoResponse`] を実装しており、
//! ハンドラは `Result<_, GatewayError>` をそのまま返せる。
//! 本文は常に `{"error": "..."}`（地図エラーは `status` も含む）。

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// リクエストの内容が不正
    #[error("{0}")]
    BadRequest(String),

    /// 未ログインでは許可されない操作
    #[error("{0}")]
    Unauthorized(String),

    /// サーバー側の設定不足（API キー未設定など）
    #[error("{0}")]
    Misconfigured(String),

    /// モデル API が失敗を返した。詳細はログにのみ残す。
    #[error("Gemini API error")]
    Upstream,

    /// 地図 API が失敗を返した。上流のステータスをそのまま返す。
    #[error("Mapbox API error: {reason}")]
    Map { status: StatusCode, reason: String },

    /// 想定外の失敗。詳細はログにのみ残す。
    #[error("Internal server error")]
    Internal(String),
}

impl From<reqwest::Error> for GatewayError {
    fn from(e: reqwest::Error) -> Self {
        Self::Internal(e.to_string())
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let message = self.to_string();
        match self {
            Self::Map { status, .. } => {
                tracing::warn!(%status, error = %message, "map request failed");
                (
                    status,
                    Json(json!({ "error": message, "status": status.as_u16() })),
                )
                    .into_response()
            }
            other => {
                let status = match &other {
                    Self::BadRequest(_) => StatusCode::BAD_REQUEST,
                    Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
                    Self::Upstream => StatusCode::BAD_GATEWAY,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                if let Self::Internal(detail) = &other {
                    tracing::error!(%status, detail = %detail, "request failed");
                } else {
                    tracing::warn!(%status, error = %message, "request rejected");
                }
                (status, Json(json!({ "error": message }))).into_response()
            }
        }
    }
}
