//! ジョブ全体で共有する期限
//!
//! 実行開始時に一度だけ決め、すべてのステージが同じ期限を見ます。
//! 各ブロッキング呼び出しは `Deadline::run` で包み、期限を過ぎたら
//! `PipelineError::DeadlineExceeded` で中断します。

use crate::error::{PipelineError, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// 指定しうる最長の予算（`Instant` のオーバーフロー回避）
const MAX_BUDGET: Duration = Duration::from_secs(60 * 60 * 24 * 365);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    /// 現在時刻から `budget` 後に切れる期限
    pub fn after(budget: Duration) -> Self {
        Self {
            at: Instant::now() + budget.min(MAX_BUDGET),
        }
    }

    pub fn instant(&self) -> Instant {
        self.at
    }

    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    pub fn is_elapsed(&self) -> bool {
        Instant::now() >= self.at
    }

    /// 期限切れなら I/O を始める前に失敗させる
    pub fn check(&self, stage: &str) -> Result<()> {
        if self.is_elapsed() {
            return Err(PipelineError::DeadlineExceeded {
                stage: stage.to_string(),
            });
        }
        Ok(())
    }

    /// 期限付きで future を実行
    pub async fn run<T, F>(&self, stage: &str, future: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.check(stage)?;
        match tokio::time::timeout_at(self.at, future).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!("Deadline exceeded while {}", stage);
                Err(PipelineError::DeadlineExceeded {
                    stage: stage.to_string(),
                })
            }
        }
    }
}
