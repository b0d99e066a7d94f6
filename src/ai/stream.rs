//! AI ストリーミングレスポンス処理
//!
//! バックエンドはモデル応答を「テキスト差分の遅延シーケンス」として返す。
//! ここではそれを到着順に連結して応答全文を組み立てる。
//! 差分の並べ替え・重複除去は行わない。

use std::time::Duration;

use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use tracing::{debug, warn};

use crate::error::LocateError;

/// モデル応答のテキスト差分列。有限で、再開はできない。
/// 読み取りを止めて drop すれば、進行中の受信は破棄される。
pub type TextDeltas = BoxStream<'static, Result<String, LocateError>>;

/// 単一のテキストを 1 差分として流すシーケンスを作る（非ストリーミング応答用）。
pub fn single_delta(text: String) -> TextDeltas {
    futures_util::stream::once(async move { Ok(text) }).boxed()
}

/// 差分列を最後まで読み、応答全文を返す。
///
/// 差分を受け取るたびに `on_delta(delta, full_text_so_far)` を呼ぶ。
/// 次の差分が `idle_timeout` 以内に届かなければ [`LocateError::Timeout`] を返す。
pub async fn accumulate<F>(
    mut deltas: TextDeltas,
    idle_timeout: Duration,
    mut on_delta: F,
) -> Result<String, LocateError>
where
    F: FnMut(&str, &str),
{
    let mut full_text = String::new();
    let mut chunk_count: u32 = 0;

    loop {
        let next = match tokio::time::timeout(idle_timeout, deltas.next()).await {
            Ok(next) => next,
            Err(_) => {
                warn!(
                    chunks_received = chunk_count,
                    text_so_far_len = full_text.len(),
                    idle_secs = idle_timeout.as_secs(),
                    "Model stream went idle"
                );
                return Err(LocateError::Timeout(idle_timeout));
            }
        };

        let Some(result) = next else {
            break; // ストリーム終了
        };

        chunk_count += 1;
        let delta = match result {
            Ok(d) => d,
            Err(e) => {
                warn!(
                    error = %e,
                    chunks_received = chunk_count,
                    text_so_far_len = full_text.len(),
                    "Stream error occurred"
                );
                return Err(e);
            }
        };

        if delta.is_empty() {
            continue;
        }
        full_text.push_str(&delta);
        on_delta(&delta, &full_text);
    }

    debug!(
        total_chunks = chunk_count,
        full_text_length = full_text.len(),
        "Stream processing completed"
    );

    Ok(full_text)
}
