//! 改行区切り JSON ストリームのデコード
//!
//! デーモンのレスポンスボディを 1 行ずつ独立した JSON として解釈し、
//! 型付きの行を遅延シーケンスとして返します。ストリームは有限で、
//! 再開はできません。

use crate::daemon::{ByteStream, DaemonError};
use futures_util::stream::{self, BoxStream, StreamExt};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error(transparent)]
    Transport(#[from] DaemonError),

    #[error("malformed JSON on line {line}: {source}")]
    Malformed {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}

/// エラー詳細 (`errorDetail`)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ErrorDetail {
    pub code: Option<i64>,
    pub message: Option<String>,
}

/// ビルド API の 1 行
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BuildLine {
    pub stream: Option<String>,
    pub status: Option<String>,
    pub error: Option<String>,
    #[serde(rename = "errorDetail")]
    pub error_detail: Option<ErrorDetail>,
    pub aux: Option<serde_json::Value>,
}

impl BuildLine {
    /// デーモンがストリーム内で報告したビルド失敗
    pub fn failure(&self) -> Option<String> {
        non_empty(self.error.as_deref())
            .or_else(|| non_empty(self.error_detail.as_ref().and_then(|d| d.message.as_deref())))
    }

    /// `aux.ID` に入るイメージ ID
    pub fn image_id(&self) -> Option<&str> {
        self.aux.as_ref()?.get("ID")?.as_str()
    }
}

/// プッシュ API の 1 行
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PushLine {
    pub status: Option<String>,
    pub progress: Option<String>,
    pub error: Option<String>,
    #[serde(rename = "errorDetail")]
    pub error_detail: Option<ErrorDetail>,
}

impl PushLine {
    pub fn failure(&self) -> Option<String> {
        non_empty(self.error.as_deref())
            .or_else(|| non_empty(self.error_detail.as_ref().and_then(|d| d.message.as_deref())))
    }
}

fn non_empty(s: Option<&str>) -> Option<String> {
    s.filter(|s| !s.trim().is_empty()).map(str::to_string)
}

struct LineState {
    body: ByteStream,
    buf: Vec<u8>,
    line: usize,
    finished: bool,
}

impl LineState {
    /// バッファから次の 1 行を取り出す（空行は呼び出し側で捨てる）
    fn take_line(&mut self) -> Option<Vec<u8>> {
        if let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            self.line += 1;
            return Some(line);
        }
        if self.finished && !self.buf.is_empty() {
            self.line += 1;
            return Some(std::mem::take(&mut self.buf));
        }
        None
    }
}

/// ボディを行単位でデコードする
///
/// 最初のトランスポートエラーの後は何も返しません。
pub fn decode_lines<T>(body: ByteStream) -> BoxStream<'static, Result<T, DecodeError>>
where
    T: DeserializeOwned + Send + 'static,
{
    let state = LineState {
        body,
        buf: Vec::new(),
        line: 0,
        finished: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(raw) = state.take_line() {
                let trimmed = raw.trim_ascii();
                if trimmed.is_empty() {
                    continue;
                }
                let item = serde_json::from_slice::<T>(trimmed).map_err(|source| {
                    DecodeError::Malformed {
                        line: state.line,
                        source,
                    }
                });
                return Some((item, state));
            }

            if state.finished {
                return None;
            }

            match state.body.next().await {
                Some(Ok(chunk)) => state.buf.extend_from_slice(&chunk),
                Some(Err(e)) => {
                    state.finished = true;
                    state.buf.clear();
                    return Some((Err(DecodeError::Transport(e)), state));
                }
                None => state.finished = true,
            }
        }
    })
    .boxed()
}
