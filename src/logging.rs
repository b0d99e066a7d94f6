//! ログ初期化モジュール
//!
//! `tracing` + `tracing-subscriber` を使用する。
//! CLI 実行時は端末出力を汚さないよう、ログを外部ファイルに日次ローテーション
//! （ローカル日付基準）で書き出す。`serve` 実行時は標準エラー出力に書く。

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use directories::ProjectDirs;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::{fmt, EnvFilter};

/// ログレベルを指定する環境変数
const LOG_ENV: &str = "GEOLOCATR_LOG";

// ---------------------------------------------------------------------------
// ローカル時刻タイマー
// ---------------------------------------------------------------------------

/// ログ行のタイムスタンプをローカル時刻（オフセット付き）で出力するタイマー
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut fmt::format::Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", Local::now().format("%Y-%m-%dT%H:%M:%S%.3f%:z"))
    }
}

// ---------------------------------------------------------------------------
// 日次ローテーションするファイルアペンダー
// ---------------------------------------------------------------------------

/// ローカル日付が変わるたびに新しいファイルへ切り替えるアペンダー。
///
/// `tracing_appender::non_blocking` と組み合わせて使用する。
struct DailyAppender {
    dir: PathBuf,
    prefix: String,
    current_date: NaiveDate,
    file: File,
}

impl DailyAppender {
    fn new(dir: PathBuf, prefix: &str) -> std::io::Result<Self> {
        let today = Local::now().date_naive();
        let file = Self::open_log_file(&dir, prefix, today)?;
        Ok(Self {
            dir,
            prefix: prefix.to_string(),
            current_date: today,
            file,
        })
    }

    /// `{prefix}.YYYY-MM-DD` を追記モードで開く（なければ作成）。
    fn open_log_file(dir: &Path, prefix: &str, date: NaiveDate) -> std::io::Result<File> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(log_file_name(prefix, date)))
    }
}

impl Write for DailyAppender {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let today = Local::now().date_naive();
        if today != self.current_date {
            self.file = Self::open_log_file(&self.dir, &self.prefix, today)?;
            self.current_date = today;
        }
        self.file.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.file.flush()
    }
}

fn log_file_name(prefix: &str, date: NaiveDate) -> String {
    format!("{}.{}", prefix, date.format("%Y-%m-%d"))
}

// ---------------------------------------------------------------------------
// ログ初期化
// ---------------------------------------------------------------------------

/// ログの出力先ディレクトリを決定する。
///
/// `GEOLOCATR_LOG_DIR` → プラットフォームのデータディレクトリ配下 `logs/` →
/// カレントディレクトリの `var/logs/` の順に決める。
pub fn log_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("GEOLOCATR_LOG_DIR") {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }

    if let Some(proj_dirs) = ProjectDirs::from("", "", "geolocatr") {
        return proj_dirs.data_local_dir().join("logs");
    }

    std::env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join("var")
        .join("logs")
}

fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// CLI 用のファイルログを初期化する。
///
/// - ログレベルは `GEOLOCATR_LOG` 環境変数で制御（デフォルト: `debug`）
/// - ログファイルは `geolocatr.log.YYYY-MM-DD` に日次ローテーションで出力
///
/// 返り値のガードは `main()` で保持し続ける必要がある（ドロップするとログ出力が停止する）。
pub fn init_file_logging() -> Result<tracing_appender::non_blocking::WorkerGuard> {
    let dir = log_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create log directory {}", dir.display()))?;

    let appender = DailyAppender::new(dir.clone(), "geolocatr.log")
        .with_context(|| format!("failed to create log file in {}", dir.display()))?;
    let (non_blocking, guard) = tracing_appender::non_blocking(appender);

    fmt()
        .with_env_filter(env_filter("debug"))
        .with_writer(non_blocking)
        .with_timer(LocalTimer)
        .with_ansi(false) // ファイル出力には ANSI カラーコードを含めない
        .with_target(true)
        .with_thread_ids(false)
        .with_line_number(true)
        .with_file(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))?;

    Ok(guard)
}

/// `serve` 用に標準エラー出力へのログを初期化する（デフォルト: `info`）。
pub fn init_stderr_logging() {
    let _ = fmt()
        .with_env_filter(env_filter("info"))
        .with_writer(std::io::stderr)
        .with_timer(LocalTimer)
        .with_target(true)
        .try_init();
}
