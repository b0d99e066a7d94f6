//! リファインメントループ
//!
//! 画像を送ってモデル応答を解釈し、衛星画像の要求があれば取得して会話に追加し、
//! 再びモデルに問い合わせる。`<answer>` が得られるか、呼び出し回数の上限に
//! 達するまで繰り返す。
//!
//! ```text
//! Start -> AwaitingReply -> Answered                      (終了: 回答あり)
//!                        -> AwaitingSatellite -> AwaitingReply
//!                        -> Incomplete        -> AwaitingReply
//!          (上限到達)     -> Exhausted                     (終了: 回答なし)
//! ```
//!
//! モデル呼び出しと衛星画像取得の失敗はそのまま返して実行を打ち切る。
//! どちらも `idle_timeout` 以内に応答がなければ [`LocateError::Timeout`] になる。
//! 応答の解釈失敗だけは `Incomplete` として扱い、次のラウンドへ進む。

use std::future::Future;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::LocateError;

use super::client::VisionModel;
use super::directive;
use super::prompts::{first_turn_text, satellite_turn_text, SYSTEM_PROMPT};
use super::satellite::SatelliteSource;
use super::stream::accumulate;
use super::types::{Conversation, ImageRef, Location, ParsedDirective, Turn};

/// ループの進行状況を受け取るフック。既定実装は何もしない。
pub trait RefineObserver {
    /// モデル呼び出しの直前（`round` は 1 始まり）
    fn on_round_start(&mut self, _round: usize, _budget: usize) {}
    /// 応答テキストの差分を受信した
    fn on_text(&mut self, _delta: &str, _full_text: &str) {}
    /// 1 回分の応答を受信し終えた
    fn on_reply_end(&mut self, _directive: &ParsedDirective) {}
    /// 衛星画像を取得する直前
    fn on_satellite(&mut self, _latitude: f64, _longitude: f64) {}
}

/// 何もしないオブザーバー
pub struct NoopObserver;

impl RefineObserver for NoopObserver {}

/// 1 回の実行の入力
#[derive(Debug, Clone)]
pub struct RefineRequest {
    /// 位置を推定したい写真（1 枚以上）
    pub images: Vec<ImageRef>,
    /// 任意の補足テキスト
    pub context: String,
}

/// 1 回の実行の結果
#[derive(Debug, Clone)]
pub struct RefineReport {
    /// 回答。上限に達して回答が得られなかった場合は None（エラーではない）
    pub answer: Option<Location>,
    /// 実行したモデル呼び出し回数
    pub model_calls: usize,
    /// 実行した衛星画像取得回数
    pub satellite_fetches: usize,
}

/// リファインメントループ本体
pub struct Refiner<'a> {
    model: &'a dyn VisionModel,
    satellite: &'a dyn SatelliteSource,
    max_iterations: usize,
    idle_timeout: Duration,
}

impl<'a> Refiner<'a> {
    pub fn new(
        model: &'a dyn VisionModel,
        satellite: &'a dyn SatelliteSource,
        max_iterations: usize,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            model,
            satellite,
            max_iterations: max_iterations.max(1),
            idle_timeout,
        }
    }

    /// 初期会話（システム指示 + 元写真と補足テキスト）を作る。
    fn seed(request: &RefineRequest) -> Conversation {
        let mut conversation = Conversation::new();
        conversation.push(Turn::system(SYSTEM_PROMPT));
        conversation.push(Turn::user(
            first_turn_text(&request.context),
            request.images.clone(),
        ));
        conversation
    }

    /// 上流の応答待ちを `idle_timeout` で打ち切る。
    async fn bounded<T, F>(&self, call: F) -> Result<T, LocateError>
    where
        F: Future<Output = Result<T, LocateError>>,
    {
        match tokio::time::timeout(self.idle_timeout, call).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    idle_secs = self.idle_timeout.as_secs(),
                    "Upstream did not respond in time"
                );
                Err(LocateError::Timeout(self.idle_timeout))
            }
        }
    }

    /// ループを実行する。
    pub async fn run(
        &self,
        request: &RefineRequest,
        observer: &mut dyn RefineObserver,
    ) -> Result<RefineReport, LocateError> {
        if request.images.is_empty() {
            return Err(LocateError::InvalidRequest(
                "at least one image is required".to_string(),
            ));
        }

        let mut conversation = Self::seed(request);
        let mut report = RefineReport {
            answer: None,
            model_calls: 0,
            satellite_fetches: 0,
        };

        info!(
            backend = self.model.backend_name(),
            image_count = request.images.len(),
            budget = self.max_iterations,
            "Refinement started"
        );

        for round in 1..=self.max_iterations {
            observer.on_round_start(round, self.max_iterations);
            debug!(round, turns = conversation.len(), "Awaiting model reply");

            report.model_calls += 1;
            let deltas = self.bounded(self.model.call(&conversation)).await?;
            let reply = accumulate(deltas, self.idle_timeout, |delta, full| {
                observer.on_text(delta, full)
            })
            .await?;

            let directive = directive::parse(&reply);
            observer.on_reply_end(&directive);

            match directive {
                ParsedDirective::FinalAnswer(location) => {
                    info!(
                        round,
                        city = %location.city,
                        country = %location.country,
                        confidence = %location.confidence,
                        "Refinement answered"
                    );
                    report.answer = Some(location);
                    return Ok(report);
                }
                ParsedDirective::RequestSatellite {
                    latitude,
                    longitude,
                } => {
                    info!(round, latitude, longitude, "Model requested a satellite view");
                    observer.on_satellite(latitude, longitude);
                    report.satellite_fetches += 1;
                    let image = self
                        .bounded(self.satellite.fetch(latitude, longitude))
                        .await?;
                    conversation.push(Turn::assistant(reply));
                    conversation.push(Turn::user(
                        satellite_turn_text(latitude, longitude),
                        vec![image],
                    ));
                }
                ParsedDirective::Incomplete => {
                    warn!(
                        round,
                        reply_length = reply.len(),
                        "Reply had neither answer nor satellite request"
                    );
                    if !reply.trim().is_empty() {
                        conversation.push(Turn::assistant(reply));
                    }
                }
            }
        }

        info!(
            model_calls = report.model_calls,
            satellite_fetches = report.satellite_fetches,
            "Refinement exhausted without an answer"
        );
        Ok(report)
    }
}
