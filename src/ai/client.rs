//! ビジョンモデルクライアント
//!
//! 会話を送ってモデル応答（テキスト差分列）を受け取る共通インターフェース。
//! バックエンドは設定に応じて構築時に一度だけ選択する。

use async_trait::async_trait;
use tracing::info;

use crate::config::{ProviderKind, Settings};
use crate::error::LocateError;

use super::managed::ManagedFunctionClient;
use super::openai::ChatCompletionClient;
use super::stream::TextDeltas;
use super::types::Conversation;

/// ビジョンモデルへの 1 回の呼び出し
#[async_trait]
pub trait VisionModel: Send + Sync {
    /// 会話全体を送信し、応答テキストを差分列として返す。
    async fn call(&self, conversation: &Conversation) -> Result<TextDeltas, LocateError>;

    /// ログ・表示用のバックエンド名
    fn backend_name(&self) -> &'static str;
}

/// 設定からバックエンドを構築する。
pub fn build_client(settings: &Settings) -> Result<Box<dyn VisionModel>, LocateError> {
    let client: Box<dyn VisionModel> = match settings.provider.kind {
        ProviderKind::OpenAI => Box::new(ChatCompletionClient::from_settings(settings)?),
        ProviderKind::Gemini => Box::new(ManagedFunctionClient::from_settings(settings)?),
    };
    info!(backend = client.backend_name(), "Vision client initialized");
    Ok(client)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openai_backend_requires_api_key() {
        let settings = Settings::default();
        let err = build_client(&settings).err().unwrap();
        assert!(matches!(err, LocateError::InvalidRequest(_)));
    }

    #[test]
    fn openai_backend_is_selected_with_key() {
        let mut settings = Settings::default();
        settings.provider.api_key = "sk-test".to_string();
        let client = build_client(&settings).unwrap();
        assert_eq!(client.backend_name(), "chat-completion");
    }

    #[test]
    fn gemini_backend_needs_no_api_key() {
        let mut settings = Settings::default();
        settings.provider.kind = ProviderKind::Gemini;
        let client = build_client(&settings).unwrap();
        assert_eq!(client.backend_name(), "managed-function");
    }
}
