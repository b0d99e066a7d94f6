//! チャット補完互換 API クライアント（直接バックエンド）
//!
//! `POST {base_url}/chat/completions` にストリーミング要求を送り、
//! `data: <json>` フレームの `choices[0].delta.content` を差分として流す。
//! `data: [DONE]` で終了する。

use std::time::Duration;

use async_openai::types::{
    ChatCompletionRequestAssistantMessage, ChatCompletionRequestAssistantMessageContent,
    ChatCompletionRequestMessage, ChatCompletionRequestMessageContentPartImage,
    ChatCompletionRequestMessageContentPartText, ChatCompletionRequestSystemMessage,
    ChatCompletionRequestSystemMessageContent, ChatCompletionRequestUserMessage,
    ChatCompletionRequestUserMessageContent, ChatCompletionRequestUserMessageContentPart,
    CreateChatCompletionRequest, ImageUrl,
};
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures_util::{future, StreamExt};
use serde::Deserialize;
use tracing::{debug, error, info};

use crate::config::Settings;
use crate::error::LocateError;

use super::client::VisionModel;
use super::stream::TextDeltas;
use super::types::{Conversation, Role, Turn};

const DONE_SENTINEL: &str = "[DONE]";
const GENERIC_FAILURE: &str = "Failed to get location";

/// ストリームフレームのうち必要な部分だけを読む
#[derive(Debug, Deserialize)]
struct StreamFrame {
    #[serde(default)]
    choices: Vec<FrameChoice>,
}

#[derive(Debug, Deserialize)]
struct FrameChoice {
    #[serde(default)]
    delta: FrameDelta,
}

#[derive(Debug, Default, Deserialize)]
struct FrameDelta {
    content: Option<String>,
}

/// 非成功レスポンスのボディ `{"error": {"message": ...}}`
#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

/// チャット補完互換エンドポイントへ直接接続するクライアント
pub struct ChatCompletionClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    max_tokens: u32,
}

impl ChatCompletionClient {
    /// 設定からクライアントを初期化する。API キーが未設定ならエラー。
    pub fn from_settings(settings: &Settings) -> Result<Self, LocateError> {
        let api_key = settings.provider.api_key.trim();
        if api_key.is_empty() || api_key == "your_openai_api_key" {
            return Err(LocateError::InvalidRequest(
                "API key is not configured. Set provider.api_key or OPENAI_API_KEY".to_string(),
            ));
        }

        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            http,
            base_url: settings.provider.base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: settings.provider.model.clone(),
            max_tokens: settings.refine.max_tokens,
        })
    }

    /// 会話からリクエストボディを組み立てる。
    #[allow(deprecated)] // 互換エンドポイントの多くは `max_tokens` しか解釈しない
    fn build_request(&self, conversation: &Conversation) -> CreateChatCompletionRequest {
        CreateChatCompletionRequest {
            model: self.model.clone(),
            messages: conversation.turns().iter().map(to_request_message).collect(),
            max_tokens: Some(self.max_tokens),
            stream: Some(true),
            ..Default::default()
        }
    }
}

/// 会話ターンを API のメッセージ型に変換する。
fn to_request_message(turn: &Turn) -> ChatCompletionRequestMessage {
    match turn.role {
        Role::System => ChatCompletionRequestMessage::System(ChatCompletionRequestSystemMessage {
            content: ChatCompletionRequestSystemMessageContent::Text(turn.text.clone()),
            name: None,
        }),
        Role::User if turn.images.is_empty() => {
            ChatCompletionRequestMessage::User(ChatCompletionRequestUserMessage {
                content: ChatCompletionRequestUserMessageContent::Text(turn.text.clone()),
                name: None,
            })
        }
        Role::User => {
            let mut parts = Vec::with_capacity(turn.images.len() + 1);
            if !turn.text.is_empty() {
                parts.push(ChatCompletionRequestUserMessageContentPart::Text(
                    ChatCompletionRequestMessageContentPartText {
                        text: turn.text.clone(),
                    },
                ));
            }
            parts.extend(turn.images.iter().map(|image| {
                ChatCompletionRequestUserMessageContentPart::ImageUrl(
                    ChatCompletionRequestMessageContentPartImage {
                        image_url: ImageUrl {
                            url: image.url().to_string(),
                            detail: None,
                        },
                    },
                )
            }));
            ChatCompletionRequestMessage::User(ChatCompletionRequestUserMessage {
                content: ChatCompletionRequestUserMessageContent::Array(parts),
                name: None,
            })
        }
        Role::Assistant => {
            ChatCompletionRequestMessage::Assistant(ChatCompletionRequestAssistantMessage {
                content: Some(ChatCompletionRequestAssistantMessageContent::Text(
                    turn.text.clone(),
                )),
                ..Default::default()
            })
        }
    }
}

/// フレームの `data` からテキスト差分を取り出す。読めないフレームは読み飛ばす。
fn frame_delta(data: &str) -> Option<String> {
    match serde_json::from_str::<StreamFrame>(data) {
        Ok(frame) => frame
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.delta.content)
            .filter(|content| !content.is_empty()),
        Err(e) => {
            debug!(error = %e, data = %data, "Skipping undecodable stream frame");
            None
        }
    }
}

/// 非成功レスポンスのボディからプロバイダのメッセージを取り出す。
fn provider_message(body: &str) -> String {
    serde_json::from_str::<ApiErrorBody>(body)
        .map(|b| b.error.message)
        .ok()
        .filter(|m| !m.trim().is_empty())
        .unwrap_or_else(|| GENERIC_FAILURE.to_string())
}

#[async_trait]
impl VisionModel for ChatCompletionClient {
    async fn call(&self, conversation: &Conversation) -> Result<TextDeltas, LocateError> {
        let request = self.build_request(conversation);
        let url = format!("{}/chat/completions", self.base_url);

        debug!(
            url = %url,
            model = %self.model,
            message_count = request.messages.len(),
            image_count = conversation.images().count(),
            stream = true,
            "Sending chat completion request"
        );

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, "Chat completion request failed");
            return Err(LocateError::Provider(provider_message(&body)));
        }

        info!(status = %status, "Chat completion stream opened");

        let deltas = response
            .bytes_stream()
            .eventsource()
            .take_while(|event| {
                let done = matches!(event, Ok(ev) if ev.data.trim() == DONE_SENTINEL);
                future::ready(!done)
            })
            .filter_map(|event| {
                future::ready(match event {
                    Ok(ev) => frame_delta(&ev.data).map(Ok),
                    Err(e) => Some(Err(LocateError::Stream(e.to_string()))),
                })
            })
            .boxed();

        Ok(deltas)
    }

    fn backend_name(&self) -> &'static str {
        "chat-completion"
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use axum::extract::State;
    use axum::http::{header, HeaderMap, StatusCode};
    use axum::response::IntoResponse;
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::{json, Value};

    use super::*;
    use crate::ai::stream::accumulate;
    use crate::ai::types::ImageRef;
    use crate::test_support::spawn_server;

    fn client_for(base_url: &str) -> ChatCompletionClient {
        let mut settings = Settings::default();
        settings.provider.api_key = "sk-test".to_string();
        settings.provider.base_url = base_url.to_string();
        settings.provider.model = "vision-test".to_string();
        settings.refine.max_tokens = 321;
        ChatCompletionClient::from_settings(&settings).unwrap()
    }

    fn sample_conversation() -> Conversation {
        let mut conv = Conversation::new();
        conv.push(Turn::system("system prompt"));
        conv.push(Turn::user(
            "Identify this location:",
            vec![ImageRef::new("data:image/jpeg;base64,AAAA")],
        ));
        conv.push(Turn::assistant("<satellite>..</satellite>"));
        conv.push(Turn::user(
            "Satellite view at 10, 20:",
            vec![ImageRef::new("data:image/png;base64,BBBB")],
        ));
        conv
    }

    fn frame(content: &str) -> String {
        let chunk = json!({
            "id": "chatcmpl-1",
            "object": "chat.completion.chunk",
            "created": 1,
            "model": "vision-test",
            "choices": [{"index": 0, "delta": {"content": content}, "finish_reason": null}]
        });
        format!("data: {chunk}\n\n")
    }

    #[test]
    fn rejects_missing_api_key() {
        let settings = Settings::default();
        assert!(ChatCompletionClient::from_settings(&settings).is_err());
    }

    #[test]
    fn request_carries_images_and_history() {
        let client = client_for("http://localhost:1/v1/");
        let request = client.build_request(&sample_conversation());
        let body = serde_json::to_value(&request).unwrap();

        assert_eq!(body["model"], "vision-test");
        assert_eq!(body["stream"], true);
        assert_eq!(body["max_tokens"], 321);

        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[1]["role"], "user");
        assert_eq!(messages[1]["content"][0]["type"], "text");
        assert_eq!(messages[1]["content"][1]["type"], "image_url");
        assert_eq!(
            messages[1]["content"][1]["image_url"]["url"],
            "data:image/jpeg;base64,AAAA"
        );
        assert_eq!(messages[2]["role"], "assistant");
        assert_eq!(messages[2]["content"], "<satellite>..</satellite>");
        assert_eq!(
            messages[3]["content"][1]["image_url"]["url"],
            "data:image/png;base64,BBBB"
        );
    }

    #[test]
    fn text_only_user_turn_is_plain_string() {
        let message = to_request_message(&Turn::user("hello", vec![]));
        let body = serde_json::to_value(&message).unwrap();
        assert_eq!(body["content"], "hello");
    }

    #[test]
    fn frame_delta_extracts_content() {
        assert_eq!(
            frame_delta(r#"{"choices":[{"delta":{"content":"<ans"}}]}"#),
            Some("<ans".to_string())
        );
        assert_eq!(frame_delta(r#"{"choices":[{"delta":{"role":"assistant"}}]}"#), None);
        assert_eq!(frame_delta(r#"{"choices":[]}"#), None);
        assert_eq!(frame_delta("not json"), None);
    }

    #[test]
    fn provider_message_falls_back_to_generic() {
        assert_eq!(
            provider_message(r#"{"error":{"message":"Incorrect API key provided"}}"#),
            "Incorrect API key provided"
        );
        assert_eq!(provider_message("<html>502</html>"), "Failed to get location");
        assert_eq!(provider_message(""), "Failed to get location");
    }

    #[tokio::test]
    async fn streams_deltas_until_done() {
        let captured: Arc<Mutex<Vec<(Option<String>, Value)>>> = Arc::default();

        async fn handler(
            State(captured): State<Arc<Mutex<Vec<(Option<String>, Value)>>>>,
            headers: HeaderMap,
            Json(body): Json<Value>,
        ) -> impl IntoResponse {
            let auth = headers
                .get(header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            captured.lock().unwrap().push((auth, body));

            let mut sse = String::new();
            sse.push_str(&frame("<answer><city>"));
            sse.push_str(": keep-alive comment\n\n");
            sse.push_str("data: {not json}\n\n");
            sse.push_str(&frame("Paris"));
            sse.push_str(&frame("</city></answer>"));
            sse.push_str("data: [DONE]\n\n");
            sse.push_str(&frame("ignored after done"));
            ([(header::CONTENT_TYPE, "text/event-stream")], sse)
        }

        let router = Router::new()
            .route("/v1/chat/completions", post(handler))
            .with_state(Arc::clone(&captured));
        let base = spawn_server(router).await;
        let client = client_for(&format!("{base}/v1"));

        let deltas = client.call(&sample_conversation()).await.unwrap();
        let mut seen = Vec::new();
        let text = accumulate(deltas, Duration::from_secs(5), |d, _| seen.push(d.to_string()))
            .await
            .unwrap();

        assert_eq!(text, "<answer><city>Paris</city></answer>");
        assert_eq!(seen, vec!["<answer><city>", "Paris", "</city></answer>"]);

        let captured = captured.lock().unwrap();
        assert_eq!(captured.len(), 1);
        assert_eq!(captured[0].0.as_deref(), Some("Bearer sk-test"));
        assert_eq!(captured[0].1["stream"], true);
    }

    #[tokio::test]
    async fn surfaces_provider_error_message() {
        let router = Router::new().route(
            "/v1/chat/completions",
            post(|| async {
                (
                    StatusCode::UNAUTHORIZED,
                    Json(json!({"error": {"message": "Incorrect API key provided", "type": "invalid_request_error"}})),
                )
            }),
        );
        let base = spawn_server(router).await;
        let client = client_for(&format!("{base}/v1"));

        let err = client.call(&sample_conversation()).await.err().unwrap();
        match err {
            LocateError::Provider(message) => assert_eq!(message, "Incorrect API key provided"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unparseable_error_body_uses_generic_message() {
        let router = Router::new().route(
            "/v1/chat/completions",
            post(|| async { (StatusCode::BAD_GATEWAY, "upstream exploded") }),
        );
        let base = spawn_server(router).await;
        let client = client_for(&format!("{base}/v1"));

        let err = client.call(&sample_conversation()).await.err().unwrap();
        assert_eq!(err.to_string(), "Failed to get location");
    }
}
