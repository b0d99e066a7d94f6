//! AI モジュールの公開型定義

use serde::Serialize;

/// 会話ターンの話者
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
}

/// 画像ペイロードへの参照。`data:` URL または `http(s)` URL を保持する。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    url: String,
}

impl ImageRef {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    /// MIME タイプとバイト列から `data:` URL 形式の参照を作る。
    pub fn from_bytes(mime: &str, bytes: &[u8]) -> Self {
        use base64::engine::general_purpose::STANDARD as BASE64;
        use base64::Engine as _;

        Self::new(format!("data:{mime};base64,{}", BASE64.encode(bytes)))
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// `data:` URL の場合、プレフィックスを除いた base64 部分を返す。
    /// プレフィックスのない生の base64 文字列はそのまま返す。
    /// `http(s)` URL は base64 を持たないため None。
    pub fn base64_data(&self) -> Option<&str> {
        if let Some(rest) = self.url.strip_prefix("data:") {
            return rest.split_once(',').map(|(_, data)| data);
        }
        if self.url.starts_with("http://") || self.url.starts_with("https://") {
            return None;
        }
        Some(&self.url)
    }
}

/// 会話の 1 ターン。テキストと 0 個以上の画像を持つ。
#[derive(Debug, Clone, PartialEq)]
pub struct Turn {
    pub role: Role,
    pub text: String,
    pub images: Vec<ImageRef>,
}

impl Turn {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            text: text.into(),
            images: Vec::new(),
        }
    }

    pub fn user(text: impl Into<String>, images: Vec<ImageRef>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
            images,
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            text: text.into(),
            images: Vec::new(),
        }
    }
}

/// ビジョンモデルとの会話。
///
/// 追記専用で、既存ターンの書き換え・削除は提供しない。
/// 1 回のリファインメント実行の間だけ存在し、終了時に破棄される。
#[derive(Debug, Clone, Default)]
pub struct Conversation {
    turns: Vec<Turn>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, turn: Turn) {
        self.turns.push(turn);
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    /// 会話中のすべての画像を出現順に返す。
    pub fn images(&self) -> impl Iterator<Item = &ImageRef> {
        self.turns.iter().flat_map(|t| t.images.iter())
    }

    /// 最初のユーザーターン（元写真）を返す。
    pub fn first_user_turn(&self) -> Option<&Turn> {
        self.turns.iter().find(|t| t.role == Role::User)
    }
}

/// 推定された位置。各フィールドはモデル応答のテキストをそのまま保持する。
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Location {
    pub city: String,
    pub country: String,
    pub latitude: String,
    pub longitude: String,
    pub confidence: String,
}

/// モデル応答 1 回分の解釈結果
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedDirective {
    /// 衛星画像の参照を要求している
    RequestSatellite { latitude: f64, longitude: f64 },
    /// 最終回答
    FinalAnswer(Location),
    /// どちらのタグもない、または XML として読めない
    Incomplete,
}
