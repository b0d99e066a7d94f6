use nu_ansi_term::{Color, Style};

use crate::config::Theme;

/// テーマに応じて文字列を着色するパレット
#[derive(Debug, Clone, Copy)]
pub struct Palette {
    theme: Theme,
}

impl Palette {
    pub fn new(theme: Theme) -> Self {
        Self { theme }
    }

    fn styled(&self, dark: Color, light: Color, text: &str, is_bold: bool) -> String {
        let color = match self.theme {
            Theme::Plain => return text.to_string(),
            Theme::Dark => dark,
            Theme::Light => light,
        };
        let style = if is_bold {
            color.bold()
        } else {
            Style::new().fg(color)
        };
        style.paint(text).to_string()
    }

    /// 通常のテキスト（ストリーミング中の応答など）
    pub fn text(&self, text: &str) -> String {
        self.styled(Color::LightGray, Color::DarkGray, text, false)
    }

    pub fn accent(&self, text: &str) -> String {
        self.styled(Color::Cyan, Color::Blue, text, true)
    }

    pub fn success(&self, text: &str) -> String {
        self.styled(Color::LightGreen, Color::Green, text, true)
    }

    pub fn warning(&self, text: &str) -> String {
        self.styled(Color::Yellow, Color::Purple, text, false)
    }
}
