//! システムプロンプトと定数

/// 直接バックエンド（チャット補完互換 API）の既定モデル
pub const DEFAULT_CHAT_MODEL: &str = "gpt-4o";

/// 未ログイン利用者が使える唯一のマネージド関数モデル
pub const LITE_MODEL: &str = "gemini-2.0-flash-lite";

/// リファインメントループの既定ラウンド数
pub const DEFAULT_MAX_ITERATIONS: usize = 5;

/// 直接バックエンドの既定 `max_tokens`
pub const DEFAULT_MAX_TOKENS: u32 = 1000;

/// マネージド関数へ一度に渡せる画像枚数の上限
pub const MAX_FUNCTION_IMAGES: usize = 5;

/// 衛星画像の取得パラメータ
pub const SATELLITE_ZOOM: u32 = 15;
pub const SATELLITE_WIDTH: u32 = 800;
pub const SATELLITE_HEIGHT: u32 = 600;

pub const SYSTEM_PROMPT: &str = r#"You are an expert geolocation AI. Your task is to identify where a photograph was taken.
Respond EXCLUSIVELY using these XML tags:

<thinking>[Your reasoning process]</thinking>
<satellite>
  <latitude>[Decimal coordinate]</latitude>
  <longitude>[Decimal coordinate]</longitude>
</satellite>
<answer>
  <city>[City name]</city>
  <country>[Country name]</country>
  <latitude>[Decimal coordinate]</latitude>
  <longitude>[Decimal coordinate]</longitude>
  <confidence>[0-100 confidence score]</confidence>
</answer>

Rules:
1. First analyze the image features (architecture, vegetation, signage, road markings, terrain).
2. When you want to verify a candidate, send ONLY a <satellite> request. You will receive a satellite view of those coordinates.
3. When you are confident, send an <answer>. An <answer> ends the conversation.
4. Never send <satellite> and <answer> in the same reply."#;

/// 最初のユーザーターンの文言
pub const FIRST_TURN_TEXT: &str = "Identify this location:";

/// 衛星画像ターンの文言
pub fn satellite_turn_text(latitude: f64, longitude: f64) -> String {
    format!("Satellite view at {latitude}, {longitude}:")
}

/// 最初のユーザーターンのテキストを組み立てる。任意の補足コンテキストを末尾に付ける。
pub fn first_turn_text(context: &str) -> String {
    let context = context.trim();
    if context.is_empty() {
        FIRST_TURN_TEXT.to_string()
    } else {
        format!("{FIRST_TURN_TEXT}\n\nAdditional context from the user: {context}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_turn_without_context() {
        assert_eq!(first_turn_text("  "), "Identify this location:");
    }

    #[test]
    fn first_turn_with_context() {
        let text = first_turn_text("taken in summer");
        assert!(text.starts_with("Identify this location:"));
        assert!(text.ends_with("taken in summer"));
    }

    #[test]
    fn satellite_text_mentions_coordinates() {
        assert_eq!(satellite_turn_text(10.0, 20.5), "Satellite view at 10, 20.5:");
    }
}
