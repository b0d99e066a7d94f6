//! コマンドライン定義と端末表示

pub mod color;
pub mod console;

use std::net::SocketAddr;

use clap::{Parser, Subcommand};

use crate::config::ProviderKind;

/// 写真の撮影場所を推定する。
#[derive(Debug, Parser)]
#[command(name = "geolocatr", version, about = "Find where a photo was taken")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// 写真から撮影場所を推定する
    Locate(LocateArgs),
    /// 設定ファイルを表示・変更する
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// マネージド関数と地図プロキシを HTTP で提供する
    Serve {
        /// 待ち受けアドレス
        #[arg(long, default_value = "127.0.0.1:8787")]
        listen: SocketAddr,
    },
    /// ゲートウェイの死活確認
    Ping {
        /// ゲートウェイのベース URL（省略時は設定の functions_url）
        #[arg(long)]
        url: Option<String>,
    },
}

#[derive(Debug, clap::Args)]
pub struct LocateArgs {
    /// 画像ファイルのパス、または data:/http(s) URL
    #[arg(required = true, value_name = "IMAGE")]
    pub images: Vec<String>,

    /// モデルに渡す補足情報
    #[arg(short = 'c', long)]
    pub context: Option<String>,

    /// 接続先 (openai | gemini)
    #[arg(long, value_parser = parse_provider)]
    pub provider: Option<ProviderKind>,

    /// 使用するモデル名
    #[arg(long)]
    pub model: Option<String>,

    /// モデル呼び出し回数の上限
    #[arg(short = 'n', long)]
    pub max_iterations: Option<usize>,

    /// 結果を JSON で出力する
    #[arg(long)]
    pub json: bool,

    /// 途中経過を表示しない
    #[arg(short = 'q', long)]
    pub quiet: bool,
}

#[derive(Debug, Subcommand)]
pub enum ConfigAction {
    /// 現在の設定を表示する（秘密情報はマスク）
    Show,
    /// 設定ファイルのパスを表示する
    Path,
    /// 1 項目を変更して保存する
    Set { key: String, value: String },
}

fn parse_provider(value: &str) -> Result<ProviderKind, String> {
    value.parse().map_err(|e: anyhow::Error| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locate_parses_images_and_flags() {
        let cli = Cli::try_parse_from([
            "geolocatr", "locate", "a.jpg", "b.png", "-c", "near a lake", "-n", "3", "--json",
        ])
        .unwrap();
        let Command::Locate(args) = cli.command else {
            panic!("expected locate");
        };
        assert_eq!(args.images, vec!["a.jpg", "b.png"]);
        assert_eq!(args.context.as_deref(), Some("near a lake"));
        assert_eq!(args.max_iterations, Some(3));
        assert!(args.json);
        assert!(!args.quiet);
        assert!(args.provider.is_none());
    }

    #[test]
    fn locate_requires_an_image() {
        assert!(Cli::try_parse_from(["geolocatr", "locate"]).is_err());
    }

    #[test]
    fn provider_flag_is_validated() {
        let cli =
            Cli::try_parse_from(["geolocatr", "locate", "a.jpg", "--provider", "gemini"]).unwrap();
        let Command::Locate(args) = cli.command else {
            panic!("expected locate");
        };
        assert_eq!(args.provider, Some(ProviderKind::Gemini));

        assert!(Cli::try_parse_from(["geolocatr", "locate", "a.jpg", "--provider", "x"]).is_err());
    }

    #[test]
    fn config_set_takes_key_and_value() {
        let cli =
            Cli::try_parse_from(["geolocatr", "config", "set", "provider.kind", "gemini"]).unwrap();
        match cli.command {
            Command::Config {
                action: ConfigAction::Set { key, value },
            } => {
                assert_eq!(key, "provider.kind");
                assert_eq!(value, "gemini");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn serve_has_default_listen_address() {
        let cli = Cli::try_parse_from(["geolocatr", "serve"]).unwrap();
        match cli.command {
            Command::Serve { listen } => assert_eq!(listen.to_string(), "127.0.0.1:8787"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
