//! クライアント側のエラー型
//!
//! ビジョンモデル呼び出し・衛星画像取得・ストリーム処理で発生する失敗を
//! [`LocateError`] に集約する。リファインメントループはこれを握りつぶさず、
//! そのまま呼び出し元へ伝播する。

use std::time::Duration;

/// 位置推定処理で発生するエラー
#[derive(Debug, thiserror::Error)]
pub enum LocateError {
    /// ネットワーク・HTTP レベルでの到達失敗
    #[error("failed to reach upstream: {0}")]
    Transport(#[from] reqwest::Error),

    /// プロバイダが非成功ステータスを返した（メッセージはプロバイダ由来または汎用文言）
    #[error("{0}")]
    Provider(String),

    /// 要求したモデルを利用する権限がない（HTTP 401）
    #[error("{0}")]
    Unauthorized(String),

    /// 送信前に検出できるリクエスト不備（画像枚数・画像形式など）
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// 衛星画像の取得失敗。上流のステータスコードを保持する。
    #[error("satellite image fetch failed (status {status}): {message}")]
    SatelliteFetch { status: u16, message: String },

    /// 上流（接続後の応答待ち・ストリーム）が一定時間以上沈黙した
    #[error("no response from upstream for more than {}s", .0.as_secs())]
    Timeout(Duration),

    /// ストリーム途中の読み取りエラー
    #[error("stream error: {0}")]
    Stream(String),

    /// JSON のシリアライズ / デシリアライズ失敗
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
