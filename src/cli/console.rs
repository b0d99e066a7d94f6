use std::io::{self, Write};
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};

use super::color::Palette;
use crate::ai::{Location, ParsedDirective, RefineObserver, RefineReport};

/// モデル応答待ちの間に表示するスピナーを生成・開始する。
fn thinking_spinner(round: usize, budget: usize) -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner().template("🌍 {spinner} {msg}") {
        spinner.set_style(style);
    }
    spinner.set_message(format!("round {round}/{budget}"));
    spinner.enable_steady_tick(Duration::from_millis(80));
    spinner
}

/// リファインメントの進行状況を端末に表示するオブザーバー。
///
/// 応答テキストは受信した順にそのまま流す。`quiet` のときは何も表示しない。
pub struct ConsoleObserver {
    palette: Palette,
    quiet: bool,
    spinner: Option<ProgressBar>,
    streaming: bool,
}

impl ConsoleObserver {
    pub fn new(palette: Palette, quiet: bool) -> Self {
        Self {
            palette,
            quiet,
            spinner: None,
            streaming: false,
        }
    }

    fn stop_spinner(&mut self) {
        if let Some(spinner) = self.spinner.take() {
            spinner.finish_and_clear();
        }
    }
}

impl RefineObserver for ConsoleObserver {
    fn on_round_start(&mut self, round: usize, budget: usize) {
        if self.quiet {
            return;
        }
        self.streaming = false;
        self.spinner = Some(thinking_spinner(round, budget));
    }

    fn on_text(&mut self, delta: &str, _full_text: &str) {
        if self.quiet {
            return;
        }
        if !self.streaming {
            self.stop_spinner();
            print!("🤖 ");
            self.streaming = true;
        }
        print!("{}", self.palette.text(delta));
        let _ = io::stdout().flush();
    }

    fn on_reply_end(&mut self, directive: &ParsedDirective) {
        if self.quiet {
            return;
        }
        self.stop_spinner();
        if self.streaming {
            println!();
        }
        if matches!(directive, ParsedDirective::Incomplete) {
            println!(
                "{}",
                self.palette
                    .warning("No answer or satellite request in this reply, asking again.")
            );
        }
    }

    fn on_satellite(&mut self, latitude: f64, longitude: f64) {
        if self.quiet {
            return;
        }
        println!(
            "\n🛰  {}\n",
            self.palette.accent(&format!(
                "Fetching satellite view at {latitude}, {longitude}"
            ))
        );
    }
}

impl Drop for ConsoleObserver {
    fn drop(&mut self) {
        self.stop_spinner();
    }
}

/// 回答を人間向けに整形する。
pub fn render_location(palette: &Palette, location: &Location) -> String {
    format!(
        "{}\n  {} {}, {}\n  {} {}, {}\n  {} {}",
        palette.success("📍 Location found"),
        palette.accent("place:"),
        location.city,
        location.country,
        palette.accent("coordinates:"),
        location.latitude,
        location.longitude,
        palette.accent("confidence:"),
        location.confidence,
    )
}

/// 実行結果を JSON で整形する（`--json`）。
pub fn render_json(report: &RefineReport) -> Result<String, serde_json::Error> {
    let value = serde_json::json!({
        "answer": report.answer,
        "model_calls": report.model_calls,
        "satellite_fetches": report.satellite_fetches,
    });
    serde_json::to_string_pretty(&value)
}
