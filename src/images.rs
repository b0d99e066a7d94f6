//! 入力画像の読み込み
//!
//! コマンドライン引数で渡された写真を、会話に載せられる [`ImageRef`] に変換する。
//! ローカルファイルは base64 の `data:` URL に、`data:` / `http(s)` URL はそのまま使う。

use std::path::Path;

use anyhow::{bail, Context, Result};
use tracing::debug;

use crate::ai::ImageRef;

/// 拡張子から画像の MIME タイプを推定する。
pub fn mime_for_path(path: &Path) -> Option<&'static str> {
    let ext = path
        .extension()
        .and_then(|value| value.to_str())
        .map(|value| value.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "webp" => Some("image/webp"),
        "gif" => Some("image/gif"),
        "heic" => Some("image/heic"),
        _ => None,
    }
}

/// 引数 1 つを画像参照に変換する。
pub fn load_image(source: &str) -> Result<ImageRef> {
    let trimmed = source.trim();
    if trimmed.starts_with("data:image/")
        || trimmed.starts_with("http://")
        || trimmed.starts_with("https://")
    {
        return Ok(ImageRef::new(trimmed));
    }

    let path = Path::new(trimmed);
    let Some(mime) = mime_for_path(path) else {
        bail!(
            "unsupported image type: {} (expected png, jpg, jpeg, webp, gif or heic)",
            path.display()
        );
    };
    let bytes =
        std::fs::read(path).with_context(|| format!("failed to read image {}", path.display()))?;
    if bytes.is_empty() {
        bail!("image file is empty: {}", path.display());
    }

    debug!(path = %path.display(), mime, bytes = bytes.len(), "Image loaded");
    Ok(ImageRef::from_bytes(mime, &bytes))
}

/// 複数の引数をまとめて変換する。
pub fn load_images(sources: &[String]) -> Result<Vec<ImageRef>> {
    sources.iter().map(|s| load_image(s)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mime_is_detected_case_insensitively() {
        assert_eq!(mime_for_path(Path::new("a/B.JPG")), Some("image/jpeg"));
        assert_eq!(mime_for_path(Path::new("x.png")), Some("image/png"));
        assert_eq!(mime_for_path(Path::new("x.txt")), None);
        assert_eq!(mime_for_path(Path::new("noext")), None);
    }

    #[test]
    fn urls_are_passed_through() {
        let img = load_image("https://example.com/photo.jpg").unwrap();
        assert_eq!(img.url(), "https://example.com/photo.jpg");

        let img = load_image("data:image/png;base64,AAAA").unwrap();
        assert_eq!(img.base64_data(), Some("AAAA"));
    }

    #[test]
    fn local_file_becomes_data_url() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("street.jpg");
        std::fs::write(&path, b"abc").unwrap();

        let img = load_image(path.to_str().unwrap()).unwrap();
        assert_eq!(img.url(), "data:image/jpeg;base64,YWJj");
    }

    #[test]
    fn missing_and_unsupported_files_fail() {
        let tmp = tempfile::TempDir::new().unwrap();
        assert!(load_image(tmp.path().join("missing.png").to_str().unwrap()).is_err());

        let text = tmp.path().join("notes.txt");
        std::fs::write(&text, b"hello").unwrap();
        assert!(load_image(text.to_str().unwrap()).is_err());

        let empty = tmp.path().join("empty.png");
        std::fs::write(&empty, b"").unwrap();
        assert!(load_image(empty.to_str().unwrap()).is_err());
    }

    #[test]
    fn load_images_keeps_order() {
        let sources = vec![
            "https://example.com/1.jpg".to_string(),
            "https://example.com/2.jpg".to_string(),
        ];
        let images = load_images(&sources).unwrap();
        assert_eq!(images[1].url(), "https://example.com/2.jpg");
    }
}
