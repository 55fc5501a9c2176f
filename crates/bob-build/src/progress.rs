//! 進捗イベントと観測者
//!
//! 各ステージはイベントを生成した順に、同期的に観測者へ渡します。
//! 観測者は書き込み専用のシンクで、パイプラインの制御には関与しません。

use colored::Colorize;
use std::fmt;
use std::io::Write;
use std::sync::Mutex;

/// デーモンのレスポンス 1 行（または clone 出力 1 行）に対応するイベント
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    /// git clone の進捗（表示専用）
    FetchProgress(String),
    /// ビルドログの `stream` テキスト（改行を含むまま）
    BuildLog(String),
    /// プッシュの `status` テキスト
    PushStatus(String),
    /// プッシュ中にレジストリが返したエラー
    PushError(String),
}

/// パイプラインの状態
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stage {
    Fetching,
    Archiving,
    Building,
    Pushing { index: usize, reference: String },
    Done,
    Failed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Fetching => write!(f, "fetching source"),
            Stage::Archiving => write!(f, "archiving build context"),
            Stage::Building => write!(f, "building image"),
            Stage::Pushing { reference, .. } => write!(f, "pushing {}", reference),
            Stage::Done => write!(f, "done"),
            Stage::Failed => write!(f, "failed"),
        }
    }
}

pub trait ProgressObserver: Send + Sync {
    fn on_stage(&self, _stage: &Stage) {}

    fn on_event(&self, event: &ProgressEvent);
}

/// 標準出力にそのまま流す観測者
#[derive(Debug, Default)]
pub struct ConsoleObserver;

impl ProgressObserver for ConsoleObserver {
    fn on_stage(&self, stage: &Stage) {
        match stage {
            Stage::Fetching => println!("{}", "📥 ソースを取得中...".blue().bold()),
            Stage::Archiving => println!("{}", "📦 ビルドコンテキストを作成中...".blue().bold()),
            Stage::Building => println!("{}", "🔨 イメージをビルド中...".green().bold()),
            Stage::Pushing { reference, .. } => {
                println!("{} {}", "📤 プッシュ中:".blue().bold(), reference.cyan())
            }
            Stage::Done => println!("{}", "✓ 完了".green().bold()),
            Stage::Failed => {}
        }
    }

    fn on_event(&self, event: &ProgressEvent) {
        let mut out = std::io::stdout().lock();
        // 書き込み失敗でパイプラインを止めない
        let _ = match event {
            ProgressEvent::FetchProgress(line) => writeln!(out, "  {}", line.dimmed()),
            ProgressEvent::BuildLog(text) => write!(out, "{}", text),
            ProgressEvent::PushStatus(status) => writeln!(out, "  ↑ {}", status),
            ProgressEvent::PushError(message) => writeln!(out, "  {} {}", "✗".red(), message),
        };
        let _ = out.flush();
    }
}

/// 受け取ったものを順番どおりに記録する観測者
#[derive(Debug, Default)]
pub struct MemoryObserver {
    stages: Mutex<Vec<Stage>>,
    events: Mutex<Vec<ProgressEvent>>,
}

impl MemoryObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stages(&self) -> Vec<Stage> {
        self.stages.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// ビルドログだけを連結したテキスト
    pub fn build_log(&self) -> String {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                ProgressEvent::BuildLog(text) => Some(text),
                _ => None,
            })
            .collect()
    }
}

impl ProgressObserver for MemoryObserver {
    fn on_stage(&self, stage: &Stage) {
        if let Ok(mut stages) = self.stages.lock() {
            stages.push(stage.clone());
        }
    }

    fn on_event(&self, event: &ProgressEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_observer_keeps_order() {
        let observer = MemoryObserver::new();
        observer.on_stage(&Stage::Building);
        observer.on_event(&ProgressEvent::BuildLog("Step 1/2\n".into()));
        observer.on_event(&ProgressEvent::BuildLog("Step 2/2\n".into()));
        observer.on_event(&ProgressEvent::PushStatus("Pushed".into()));

        assert_eq!(observer.stages(), vec![Stage::Building]);
        assert_eq!(observer.events().len(), 3);
        assert_eq!(observer.build_log(), "Step 1/2\nStep 2/2\n");
    }

    #[test]
    fn test_stage_display() {
        let stage = Stage::Pushing {
            index: 1,
            reference: "app:v2".into(),
        };
        assert_eq!(stage.to_string(), "pushing app:v2");
        assert_eq!(Stage::Fetching.to_string(), "fetching source");
    }
}
