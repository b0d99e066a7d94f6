//! 設定ファイル管理
//!
//! `~/.config/geolocatr/config.toml` から TOML 形式の設定を読み込む。
//! ファイルが存在しない場合はテンプレートを生成し、デフォルト値を使用する。
//! 変更時は設定全体を上書き保存する（単一レコード）。
//!
//! # 設定ファイル例
//!
//! ```toml
//! theme = "dark"
//!
//! [provider]
//! kind = "openai"
//! api_key = "sk-..."
//! base_url = "https://api.openai.com/v1"
//! model = "gpt-4o"
//!
//! [refine]
//! max_iterations = 5
//! context = "Photo taken during a road trip"
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::ai::prompts::{DEFAULT_CHAT_MODEL, DEFAULT_MAX_ITERATIONS, DEFAULT_MAX_TOKENS, LITE_MODEL};

/// ビジョンモデルの接続先
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// チャット補完互換エンドポイントへ直接接続する
    #[default]
    OpenAI,
    /// API キーを持つバックエンド関数（Gemini）経由で呼び出す
    Gemini,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OpenAI => write!(f, "openai"),
            Self::Gemini => write!(f, "gemini"),
        }
    }
}

impl FromStr for ProviderKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::OpenAI),
            "gemini" => Ok(Self::Gemini),
            other => bail!("unknown provider '{other}' (expected 'openai' or 'gemini')"),
        }
    }
}

/// 端末出力の配色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    #[default]
    Dark,
    Light,
    /// ANSI カラーを出力しない
    Plain,
}

impl FromStr for Theme {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "dark" => Ok(Self::Dark),
            "light" => Ok(Self::Light),
            "plain" => Ok(Self::Plain),
            other => bail!("unknown theme '{other}' (expected 'dark', 'light' or 'plain')"),
        }
    }
}

/// geolocatr の設定全体
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// 端末出力の配色
    pub theme: Theme,
    /// モデル接続設定
    pub provider: ProviderConfig,
    /// リファインメントループ設定
    pub refine: RefineConfig,
    /// マネージド関数に提示するログインセッション
    pub session: SessionConfig,
}

/// モデル接続設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    /// 直接バックエンドの API キー
    pub api_key: String,
    /// 直接バックエンドのベース URL（`/chat/completions` の手前まで）
    pub base_url: String,
    /// 直接バックエンドのモデル名
    pub model: String,
    /// マネージド関数に要求するモデル名
    pub function_model: String,
    /// マネージド関数（`/gemini`, `/get-mapbox`）のベース URL
    pub functions_url: String,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: ProviderKind::OpenAI,
            api_key: String::new(),
            base_url: "https://api.openai.com/v1".to_string(),
            model: DEFAULT_CHAT_MODEL.to_string(),
            function_model: LITE_MODEL.to_string(),
            functions_url: "http://127.0.0.1:8787".to_string(),
        }
    }
}

/// リファインメントループ設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RefineConfig {
    /// モデル呼び出しの最大回数
    pub max_iterations: usize,
    /// 最初のターンに添える補足テキスト
    pub context: String,
    /// 直接バックエンドの `max_tokens`
    pub max_tokens: u32,
    /// ストリームの無通信タイムアウト（秒）
    pub idle_timeout_secs: u64,
}

impl Default for RefineConfig {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            context: String::new(),
            max_tokens: DEFAULT_MAX_TOKENS,
            idle_timeout_secs: 120,
        }
    }
}

impl RefineConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs.max(1))
    }
}

/// ログインセッション。どちらも空なら未ログイン扱い。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub user_id: String,
    pub token: String,
}

impl SessionConfig {
    pub fn is_authenticated(&self) -> bool {
        !self.user_id.trim().is_empty() || !self.token.trim().is_empty()
    }
}

/// `config set` で変更できるキー
pub const SETTABLE_KEYS: &[&str] = &[
    "theme",
    "provider.kind",
    "provider.api_key",
    "provider.base_url",
    "provider.model",
    "provider.function_model",
    "provider.functions_url",
    "refine.max_iterations",
    "refine.context",
    "refine.max_tokens",
    "refine.idle_timeout_secs",
    "session.user_id",
    "session.token",
];

const TEMPLATE: &str = r#"# geolocatr configuration
#
# You can write setting like this:

# theme = "dark"            # dark | light | plain

[provider]
# kind = "openai"           # openai | gemini
# api_key = ""
# base_url = "https://api.openai.com/v1"
# model = "gpt-4o"
# function_model = "gemini-2.0-flash-lite"
# functions_url = "http://127.0.0.1:8787"

[refine]
# max_iterations = 5
# context = ""
# max_tokens = 1000
# idle_timeout_secs = 120

[session]
# user_id = ""
# token = ""
"#;

impl Settings {
    /// 設定ファイルを読み込む。
    ///
    /// `~/.config/geolocatr/config.toml` が存在すればパースし、
    /// 存在しなければテンプレートを生成してデフォルト値を返す。
    /// パースエラーの場合は警告を表示してデフォルト値を返す。
    pub fn load() -> Self {
        Self::load_from(&Self::config_path())
    }

    /// 指定パスから設定を読み込む（テスト用にも使用）。
    pub fn load_from(path: &Path) -> Self {
        debug!(path = %path.display(), "Loading config file");

        if !path.exists() {
            Self::create_default_config(path);
            return Self::default();
        }

        match std::fs::read_to_string(path) {
            Ok(content) => match toml::from_str::<Settings>(&content) {
                Ok(settings) => {
                    info!(
                        path = %path.display(),
                        provider = %settings.provider.kind,
                        max_iterations = settings.refine.max_iterations,
                        "Config loaded successfully"
                    );
                    settings
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to parse config file");
                    eprintln!("geolocatr: warning: failed to parse config file: {e}");
                    Self::default()
                }
            },
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read config file");
                eprintln!("geolocatr: warning: failed to read config file: {e}");
                Self::default()
            }
        }
    }

    /// 設定ファイルのパスを返す。
    ///
    /// `GEOLOCATR_CONFIG` があればそれを使い、なければ `~/.config/geolocatr/config.toml`。
    /// `$HOME` が取得できない場合は `./.config/geolocatr/config.toml` にフォールバックする。
    pub fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var("GEOLOCATR_CONFIG") {
            if !path.trim().is_empty() {
                return PathBuf::from(path);
            }
        }
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(".config/geolocatr/config.toml")
    }

    /// 設定全体を上書き保存する。
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create config directory: {}", parent.display())
            })?;
        }
        let content = toml::to_string_pretty(self).context("failed to serialize settings")?;
        std::fs::write(path, content)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;
        info!(path = %path.display(), "Config saved");
        Ok(())
    }

    /// 環境変数による上書きを適用する。ディスクには書き戻さない。
    pub fn with_env_overrides(mut self) -> Self {
        fn env(name: &str) -> Option<String> {
            std::env::var(name).ok().filter(|v| !v.trim().is_empty())
        }

        if let Some(key) = env("OPENAI_API_KEY") {
            if self.provider.api_key.is_empty() {
                self.provider.api_key = key;
            }
        }
        if let Some(url) = env("OPENAI_BASE_URL") {
            self.provider.base_url = url;
        }
        if let Some(model) = env("GEOLOCATR_MODEL") {
            self.provider.model = model;
        }
        if let Some(url) = env("GEOLOCATR_FUNCTIONS_URL") {
            self.provider.functions_url = url;
        }
        if let Some(token) = env("GEOLOCATR_SESSION_TOKEN") {
            self.session.token = token;
        }
        if let Some(user_id) = env("GEOLOCATR_USER_ID") {
            self.session.user_id = user_id;
        }
        self
    }

    /// ドット区切りのキーで 1 項目を変更する。値は型に合わせて検証する。
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "theme" => self.theme = value.parse()?,
            "provider.kind" => self.provider.kind = value.parse()?,
            "provider.api_key" => self.provider.api_key = value.to_string(),
            "provider.base_url" => {
                self.provider.base_url = value.trim_end_matches('/').to_string()
            }
            "provider.model" => self.provider.model = value.to_string(),
            "provider.function_model" => self.provider.function_model = value.to_string(),
            "provider.functions_url" => {
                self.provider.functions_url = value.trim_end_matches('/').to_string()
            }
            "refine.max_iterations" => {
                let n: usize = value
                    .parse()
                    .with_context(|| format!("'{value}' is not a valid iteration count"))?;
                if n == 0 {
                    bail!("refine.max_iterations must be at least 1");
                }
                self.refine.max_iterations = n;
            }
            "refine.context" => self.refine.context = value.to_string(),
            "refine.max_tokens" => {
                self.refine.max_tokens = value
                    .parse()
                    .with_context(|| format!("'{value}' is not a valid token count"))?
            }
            "refine.idle_timeout_secs" => {
                self.refine.idle_timeout_secs = value
                    .parse()
                    .with_context(|| format!("'{value}' is not a valid number of seconds"))?
            }
            "session.user_id" => self.session.user_id = value.to_string(),
            "session.token" => self.session.token = value.to_string(),
            other => bail!(
                "unknown setting '{other}'. Available keys: {}",
                SETTABLE_KEYS.join(", ")
            ),
        }
        debug!(key = %key, "Setting updated");
        Ok(())
    }

    /// 表示用の TOML。秘密情報はマスクする。
    pub fn to_display_toml(&self) -> Result<String> {
        let mut masked = self.clone();
        masked.provider.api_key = mask_secret(&masked.provider.api_key);
        masked.session.token = mask_secret(&masked.session.token);
        toml::to_string_pretty(&masked).context("failed to serialize settings")
    }

    /// 設定ファイルが存在しない場合にテンプレートから生成する。
    ///
    /// 親ディレクトリが存在しなければ再帰的に作成する。
    /// 生成に失敗した場合は警告を表示するが、処理は継続する。
    fn create_default_config(path: &Path) {
        if let Some(parent) = path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                warn!(path = %parent.display(), error = %e, "Failed to create config directory");
                eprintln!("geolocatr: warning: failed to create config directory: {e}");
                return;
            }
        }

        match std::fs::write(path, TEMPLATE) {
            Ok(()) => {
                info!(path = %path.display(), "Created default config file");
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to create default config file");
                eprintln!("geolocatr: warning: failed to create config file: {e}");
            }
        }
    }
}

fn mask_secret(secret: &str) -> String {
    let count = secret.chars().count();
    if count == 0 {
        return String::new();
    }
    if count <= 8 {
        return "*".repeat(count);
    }
    let tail: String = secret.chars().skip(count - 4).collect();
    format!("{}{tail}", "*".repeat(count - 4))
}
