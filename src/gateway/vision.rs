//! `POST /gemini`: 画像をモデル API に渡し、チャット補完形式で返す。
//!
//! 検査は次の順に行い、いずれかで弾かれた場合は上流を呼ばない。
//! JSON 解析 → 未ログインのモデル制限 → 画像枚数 → API キー → 単一画像の有無

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use serde_json::{json, Value};
use tracing::{debug, error, info};

use super::{AppState, GatewayError};
use crate::ai::prompts::{LITE_MODEL, MAX_FUNCTION_IMAGES, SYSTEM_PROMPT};

const SINGLE_IMAGE_INSTRUCTION: &str = "Identify the location from this satellite image";
const MULTI_IMAGE_INSTRUCTION: &str = "Identify location from MULTIPLE related images";
const TEMPERATURE: f64 = 0.2;

/// ログインしているとみなすヘッダー
fn is_logged_in(headers: &HeaderMap) -> bool {
    headers.contains_key("x-appwrite-user-id") || headers.contains_key("authorization")
}

/// 上流へ送るパーツを組み立てる。
fn build_parts(instruction: &str, context: Option<&str>, images: &[&str]) -> Vec<Value> {
    let mut parts = vec![json!({ "text": SYSTEM_PROMPT }), json!({ "text": instruction })];
    if let Some(context) = context.filter(|c| !c.trim().is_empty()) {
        parts.push(json!({ "text": context }));
    }
    parts.extend(images.iter().map(|data| {
        json!({
            "inline_data": {
                "mime_type": "image/jpeg",
                "data": data,
            }
        })
    }));
    parts
}

/// 上流の応答からテキストを取り出す。テキストパーツは空行で連結する。
fn extract_text(result: &Value) -> String {
    let content = &result["candidates"][0]["content"];
    if let Some(parts) = content["parts"].as_array() {
        return parts
            .iter()
            .filter_map(|part| part["text"].as_str())
            .filter(|text| !text.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n");
    }
    content["content"].as_str().unwrap_or_default().to_string()
}

pub(super) async fn analyze(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, GatewayError> {
    let body: Value = if body.is_empty() {
        json!({})
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| GatewayError::Internal(format!("invalid JSON body: {e}")))?
    };

    let requested_model = body["model"].as_str().filter(|m| !m.is_empty());
    if !is_logged_in(&headers) && requested_model != Some(LITE_MODEL) {
        return Err(GatewayError::Unauthorized(
            "Unauthorized: Non-logged users can only use Lite model".to_string(),
        ));
    }

    let images: Vec<&str> = match body["images"].as_array() {
        Some(list) => {
            if list.len() < 2 || list.len() > MAX_FUNCTION_IMAGES {
                return Err(GatewayError::BadRequest(
                    "You must provide 2-5 images for multi-image analysis".to_string(),
                ));
            }
            list.iter().filter_map(Value::as_str).collect()
        }
        None => Vec::new(),
    };

    let Some(api_key) = state.config.gemini_api_key.as_deref() else {
        return Err(GatewayError::Misconfigured(
            "GEMINI_API_KEY not set".to_string(),
        ));
    };

    let context = body["context"].as_str();
    let parts = if images.is_empty() {
        let Some(image) = body["image"].as_str().filter(|i| !i.is_empty()) else {
            return Err(GatewayError::BadRequest(
                "Missing 'image' field in request".to_string(),
            ));
        };
        build_parts(SINGLE_IMAGE_INSTRUCTION, context, &[image])
    } else {
        build_parts(MULTI_IMAGE_INSTRUCTION, context, &images)
    };

    let model = requested_model.unwrap_or(state.config.gemini_model.as_str());
    let url = format!(
        "{}/{}:generateContent",
        state.config.gemini_base_url.trim_end_matches('/'),
        model
    );
    let payload = json!({
        "contents": [{ "parts": parts }],
        "generationConfig": { "temperature": TEMPERATURE },
    });

    info!(
        model = %model,
        image_count = images.len().max(1),
        logged_in = is_logged_in(&headers),
        "Forwarding image analysis"
    );

    let response = state
        .http
        .post(&url)
        .query(&[("key", api_key)])
        .json(&payload)
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        error!(status = status.as_u16(), body = %text, "Gemini error");
        return Err(GatewayError::Upstream);
    }

    let result: Value = response.json().await?;
    let content = extract_text(&result);
    debug!(content_length = content.len(), "Gemini reply received");

    Ok(Json(json!({
        "choices": [{ "message": { "content": content } }]
    })))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use axum::extract::Path;
    use axum::http::{HeaderName, HeaderValue, StatusCode};
    use axum::routing::post;
    use axum::Router;

    use super::*;
    use crate::gateway::{test_server, GatewayConfig};
    use crate::test_support::spawn_server;

    /// 呼び出し回数と最後のリクエストを記録する上流スタブ
    #[derive(Default)]
    struct Upstream {
        calls: AtomicUsize,
        last: Mutex<Option<(String, Value)>>,
    }

    async fn spawn_upstream(status: StatusCode, reply: Value) -> (String, Arc<Upstream>) {
        let upstream = Arc::new(Upstream::default());
        let recorder = upstream.clone();
        let router = Router::new().route(
            "/models/{call}",
            post(move |Path(call): Path<String>, Json(body): Json<Value>| {
                let recorder = recorder.clone();
                let reply = reply.clone();
                async move {
                    recorder.calls.fetch_add(1, Ordering::SeqCst);
                    *recorder.last.lock().unwrap() = Some((call, body));
                    (status, Json(reply))
                }
            }),
        );
        let base = spawn_server(router).await;
        (format!("{base}/models"), upstream)
    }

    fn config(base_url: &str) -> GatewayConfig {
        GatewayConfig {
            gemini_api_key: Some("g-key".to_string()),
            gemini_model: "gemini-default".to_string(),
            gemini_base_url: base_url.to_string(),
            ..GatewayConfig::default()
        }
    }

    fn user_header() -> (HeaderName, HeaderValue) {
        (
            HeaderName::from_static("x-appwrite-user-id"),
            HeaderValue::from_static("user-1"),
        )
    }

    #[tokio::test]
    async fn anonymous_non_lite_request_is_unauthorized_before_upstream() {
        let (base, upstream) = spawn_upstream(StatusCode::OK, json!({})).await;
        let server = test_server(config(&base));

        let response = server
            .post("/gemini")
            .json(&json!({ "image": "AAAA", "model": "gemini-pro" }))
            .await;

        response.assert_status(StatusCode::UNAUTHORIZED);
        assert_eq!(
            response.json::<Value>()["error"],
            "Unauthorized: Non-logged users can only use Lite model"
        );
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn image_count_outside_range_is_rejected() {
        let (base, upstream) = spawn_upstream(StatusCode::OK, json!({})).await;
        let server = test_server(config(&base));

        for count in [1, 6] {
            let images: Vec<&str> = vec!["AAAA"; count];
            let response = server
                .post("/gemini")
                .json(&json!({ "images": images, "model": LITE_MODEL }))
                .await;
            response.assert_status(StatusCode::BAD_REQUEST);
            assert_eq!(
                response.json::<Value>()["error"],
                "You must provide 2-5 images for multi-image analysis"
            );
        }
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn missing_api_key_is_a_server_error() {
        let server = test_server(GatewayConfig::default());
        let response = server
            .post("/gemini")
            .json(&json!({ "image": "AAAA", "model": LITE_MODEL }))
            .await;
        response.assert_status(StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(response.json::<Value>()["error"], "GEMINI_API_KEY not set");
    }

    #[tokio::test]
    async fn missing_image_is_a_bad_request() {
        let (base, upstream) = spawn_upstream(StatusCode::OK, json!({})).await;
        let server = test_server(config(&base));
        let (name, value) = user_header();

        let response = server
            .post("/gemini")
            .add_header(name, value)
            .json(&json!({ "model": "gemini-pro" }))
            .await;

        response.assert_status(StatusCode::BAD_REQUEST);
        assert_eq!(
            response.json::<Value>()["error"],
            "Missing 'image' field in request"
        );
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn invalid_json_is_an_internal_error() {
        let server = test_server(GatewayConfig::default());
        let response = server.post("/gemini").text("not json").await;
        response.assert_status(StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(response.json::<Value>()["error"], "Internal server error");
    }

    #[tokio::test]
    async fn successful_reply_is_wrapped_as_chat_completion() {
        let reply = json!({
            "candidates": [{
                "content": {
                    "parts": [
                        { "text": "<thinking>Eiffel tower</thinking>" },
                        { "text": "<answer><city>Paris</city></answer>" }
                    ]
                }
            }]
        });
        let (base, upstream) = spawn_upstream(StatusCode::OK, reply).await;
        let server = test_server(config(&base));

        let response = server
            .post("/gemini")
            .json(&json!({
                "images": ["AAAA", "BBBB"],
                "model": LITE_MODEL,
                "context": "Previous reply:\nhi"
            }))
            .await;

        response.assert_status_ok();
        assert_eq!(
            response.json::<Value>()["choices"][0]["message"]["content"],
            "<thinking>Eiffel tower</thinking>\n\n<answer><city>Paris</city></answer>"
        );
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 1);

        let (call, body) = upstream.last.lock().unwrap().clone().unwrap();
        assert_eq!(call, format!("{LITE_MODEL}:generateContent"));
        let parts = body["contents"][0]["parts"].as_array().unwrap();
        assert_eq!(parts.len(), 5);
        assert_eq!(parts[1]["text"], MULTI_IMAGE_INSTRUCTION);
        assert_eq!(parts[2]["text"], "Previous reply:\nhi");
        assert_eq!(parts[3]["inline_data"]["data"], "AAAA");
        assert_eq!(parts[4]["inline_data"]["mime_type"], "image/jpeg");
        assert_eq!(body["generationConfig"]["temperature"], 0.2);
    }

    #[tokio::test]
    async fn logged_in_request_without_model_uses_default() {
        let reply = json!({ "candidates": [{ "content": { "parts": [{ "text": "ok" }] } }] });
        let (base, upstream) = spawn_upstream(StatusCode::OK, reply).await;
        let server = test_server(config(&base));
        let (name, value) = user_header();

        let response = server
            .post("/gemini")
            .add_header(name, value)
            .json(&json!({ "image": "AAAA" }))
            .await;

        response.assert_status_ok();
        let (call, body) = upstream.last.lock().unwrap().clone().unwrap();
        assert_eq!(call, "gemini-default:generateContent");
        assert_eq!(body["contents"][0]["parts"][1]["text"], SINGLE_IMAGE_INSTRUCTION);
    }

    #[tokio::test]
    async fn upstream_failure_becomes_bad_gateway() {
        let (base, _upstream) =
            spawn_upstream(StatusCode::TOO_MANY_REQUESTS, json!({ "error": "quota" })).await;
        let server = test_server(config(&base));

        let response = server
            .post("/gemini")
            .json(&json!({ "image": "AAAA", "model": LITE_MODEL }))
            .await;

        response.assert_status(StatusCode::BAD_GATEWAY);
        assert_eq!(response.json::<Value>()["error"], "Gemini API error");
    }

    #[test]
    fn text_falls_back_to_nested_content() {
        let result = json!({ "candidates": [{ "content": { "content": "plain" } }] });
        assert_eq!(extract_text(&result), "plain");
        assert_eq!(extract_text(&json!({})), "");
    }
}
