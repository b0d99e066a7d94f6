//! マネージド関数クライアント
//!
//! API キーを持つバックエンド関数 `POST {functions_url}/gemini` に画像を渡して
//! 位置推定を依頼する。クライアントは API キーを持たない。
//!
//! - 画像 1 枚なら `image`、2〜5 枚なら `images` として送る
//! - 未ログインの場合、要求モデルは事前に Lite モデルへ切り替える
//! - 関数の 401 は [`LocateError::Unauthorized`] として通信エラーと区別する
//! - 応答は一括で届くため、差分列は 1 要素になる

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::config::{SessionConfig, Settings};
use crate::error::LocateError;

use super::client::VisionModel;
use super::prompts::{FIRST_TURN_TEXT, LITE_MODEL, MAX_FUNCTION_IMAGES};
use super::stream::{single_delta, TextDeltas};
use super::types::{Conversation, Role};

const GENERIC_FAILURE: &str = "Failed to get location (Gemini)";
const UNAUTHORIZED_MESSAGE: &str = "Unauthorized: Non-logged users can only use Lite model";

/// 関数へ送るリクエストボディ
#[derive(Debug, Serialize, PartialEq)]
struct FunctionRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    images: Option<Vec<String>>,
    model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    context: Option<String>,
}

/// マネージド関数経由でビジョンモデルを呼び出すクライアント
pub struct ManagedFunctionClient {
    http: reqwest::Client,
    endpoint: String,
    model: String,
    session: SessionConfig,
}

impl ManagedFunctionClient {
    pub fn from_settings(settings: &Settings) -> Result<Self, LocateError> {
        let session = settings.session.clone();
        let requested = settings.provider.function_model.trim();
        let model = if session.is_authenticated() || requested == LITE_MODEL {
            requested.to_string()
        } else {
            warn!(
                requested_model = %requested,
                model = LITE_MODEL,
                "Not logged in, downgrading to the lite model"
            );
            LITE_MODEL.to_string()
        };

        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            http,
            endpoint: format!(
                "{}/gemini",
                settings.provider.functions_url.trim_end_matches('/')
            ),
            model,
            session,
        })
    }

    /// 会話からリクエストボディを組み立てる。
    fn build_payload(&self, conversation: &Conversation) -> Result<FunctionRequest, LocateError> {
        let mut images = select_images(conversation)?;
        let (image, images) = if images.len() == 1 {
            (images.pop(), None)
        } else {
            (None, Some(images))
        };

        Ok(FunctionRequest {
            image,
            images,
            model: self.model.clone(),
            context: build_context(conversation),
        })
    }
}

/// 送信する画像を base64 文字列として選ぶ。
///
/// 合計が上限を超える場合、元写真を優先して残し、残りの枠を新しい衛星画像から埋める。
/// ただし最新の衛星画像は必ず送る。元写真で枠が埋まっていれば、最後の元写真を外す。
/// 送信順は会話中の出現順を保つ。
fn select_images(conversation: &Conversation) -> Result<Vec<String>, LocateError> {
    let originals = conversation
        .first_user_turn()
        .map(|t| t.images.len())
        .unwrap_or(0);
    if originals == 0 {
        return Err(LocateError::InvalidRequest(
            "no image to analyse in the first user turn".to_string(),
        ));
    }
    if originals > MAX_FUNCTION_IMAGES {
        return Err(LocateError::InvalidRequest(format!(
            "the managed function accepts at most {MAX_FUNCTION_IMAGES} images, got {originals}"
        )));
    }

    let mut all = Vec::new();
    for image in conversation.images() {
        let data = image.base64_data().ok_or_else(|| {
            LocateError::InvalidRequest(format!(
                "the managed function needs embedded image data, not a link: {}",
                image.url()
            ))
        })?;
        all.push(data.to_string());
    }

    if all.len() > MAX_FUNCTION_IMAGES {
        let satellites = all.len() - originals;
        let kept_satellites = MAX_FUNCTION_IMAGES.saturating_sub(originals).max(1);
        let kept_originals = MAX_FUNCTION_IMAGES - kept_satellites;
        if kept_originals < originals {
            warn!(
                originals,
                kept_originals,
                "Leaving out original photos to make room for the satellite view"
            );
        }
        debug!(
            dropped_satellites = satellites - kept_satellites,
            "Dropping oldest satellite views to fit the image limit"
        );
        let mut satellite_views = all.split_off(originals);
        satellite_views.drain(..satellites - kept_satellites);
        all.truncate(kept_originals);
        all.extend(satellite_views);
    }
    Ok(all)
}

/// 関数へ渡す補足テキスト。ユーザーの補足と、これまでのモデル応答を含める。
fn build_context(conversation: &Conversation) -> Option<String> {
    let mut parts = Vec::new();
    let mut seen_first_user = false;

    for turn in conversation.turns() {
        match turn.role {
            Role::System => {}
            Role::User if !seen_first_user => {
                seen_first_user = true;
                let extra = turn.text.trim_start_matches(FIRST_TURN_TEXT).trim();
                if !extra.is_empty() {
                    parts.push(extra.to_string());
                }
            }
            Role::User => parts.push(turn.text.trim().to_string()),
            Role::Assistant => parts.push(format!("Previous reply:\n{}", turn.text.trim())),
        }
    }

    let context = parts.join("\n\n");
    (!context.is_empty()).then_some(context)
}

/// 関数実行のエンベロープ `{responseStatusCode, responseBody}` であれば中身を取り出す。
/// そうでなければ HTTP ステータスとボディをそのまま返す。
fn unwrap_envelope(status: u16, body: &str) -> (u16, String) {
    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(body) {
        let code = map.get("responseStatusCode").and_then(Value::as_u64);
        let inner = map.get("responseBody").and_then(Value::as_str);
        if let (Some(code), Some(inner)) = (code, inner) {
            if let Ok(code) = u16::try_from(code) {
                return (code, inner.to_string());
            }
        }
    }
    (status, body.to_string())
}

fn error_message(body: &str) -> Option<String> {
    serde_json::from_str::<Value>(body)
        .ok()?
        .get("error")?
        .as_str()
        .map(str::to_string)
        .filter(|m| !m.trim().is_empty())
}

/// 成功レスポンスから応答テキストを取り出す。
fn extract_content(body: &str) -> Result<String, LocateError> {
    let value: Value = serde_json::from_str(body)?;
    if let Some(content) = value
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
    {
        return Ok(content.to_string());
    }
    if let Some(text) = value.as_str() {
        return Ok(text.to_string());
    }
    Err(LocateError::Provider(
        "Unexpected Gemini function response".to_string(),
    ))
}

#[async_trait]
impl VisionModel for ManagedFunctionClient {
    async fn call(&self, conversation: &Conversation) -> Result<TextDeltas, LocateError> {
        let payload = self.build_payload(conversation)?;

        debug!(
            endpoint = %self.endpoint,
            model = %self.model,
            image_count = payload.images.as_ref().map_or(1, Vec::len),
            has_context = payload.context.is_some(),
            authenticated = self.session.is_authenticated(),
            "Calling managed vision function"
        );

        let mut request = self.http.post(&self.endpoint).json(&payload);
        if !self.session.user_id.trim().is_empty() {
            request = request.header("x-appwrite-user-id", self.session.user_id.trim());
        }
        if !self.session.token.trim().is_empty() {
            request = request.bearer_auth(self.session.token.trim());
        }

        let response = request.send().await?;
        let http_status = response.status().as_u16();
        let raw = response.text().await?;
        let (status, body) = unwrap_envelope(http_status, &raw);

        if status == 401 {
            warn!(model = %self.model, "Managed function rejected the requested model");
            return Err(LocateError::Unauthorized(
                error_message(&body).unwrap_or_else(|| UNAUTHORIZED_MESSAGE.to_string()),
            ));
        }
        if !(200..300).contains(&status) {
            error!(status, body = %body, "Managed function call failed");
            return Err(LocateError::Provider(
                error_message(&body).unwrap_or_else(|| GENERIC_FAILURE.to_string()),
            ));
        }

        let content = extract_content(&body)?;
        info!(
            status,
            response_length = content.len(),
            "Managed function responded"
        );
        Ok(single_delta(content))
    }

    fn backend_name(&self) -> &'static str {
        "managed-function"
    }
}
