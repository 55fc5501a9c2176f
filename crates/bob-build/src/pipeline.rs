//! パイプライン全体の制御
//!
//! 取得 → アーカイブ → ビルド → タグごとのプッシュ、を 1 つの期限の下で順に実行します。
//! 状態遷移は前進のみで、最初の失敗で実行全体を終了します。再試行はしません。

use crate::builder::ImageBuilder;
use crate::context::ContextBuilder;
use crate::daemon::ImageDaemon;
use crate::deadline::Deadline;
use crate::error::{PipelineError, Result};
use crate::progress::{ProgressObserver, Stage};
use crate::pusher::{ImagePusher, validate_tag};
use crate::source::SourceFetcher;
use bob_config::{BuildRequest, RegistryCredentials};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct PipelineOptions {
    /// レイヤーキャッシュを使わない
    pub no_cache: bool,
    /// 作成したビルドコンテキストのコピー先
    pub dump_context: Option<PathBuf>,
}

/// 成功した実行の結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineReport {
    /// チェックアウトしたコミットの完全な ID
    pub commit: String,
    pub image_id: Option<String>,
    /// プッシュ済みの参照（プッシュ順）
    pub published: Vec<String>,
}

pub struct Pipeline {
    fetcher: Arc<dyn SourceFetcher>,
    builder: ImageBuilder,
    pusher: ImagePusher,
    observer: Arc<dyn ProgressObserver>,
    options: PipelineOptions,
}

impl Pipeline {
    pub fn new(
        fetcher: Arc<dyn SourceFetcher>,
        daemon: Arc<dyn ImageDaemon>,
        credentials: RegistryCredentials,
        observer: Arc<dyn ProgressObserver>,
    ) -> Self {
        Self {
            fetcher,
            builder: ImageBuilder::new(daemon.clone()),
            pusher: ImagePusher::new(daemon, credentials),
            observer,
            options: PipelineOptions::default(),
        }
    }

    pub fn with_options(mut self, options: PipelineOptions) -> Self {
        self.options = options;
        self
    }

    /// 1 回分のビルドを実行
    ///
    /// 期限は開始時に一度だけ決まり、全ステージで共有されます。
    pub async fn run(&self, request: &BuildRequest) -> Result<PipelineReport> {
        self.run_with(request, Deadline::after(request.timeout())).await
    }

    /// 呼び出し側が先に決めた期限で実行
    ///
    /// デーモンへの接続など、パイプラインの外で使った時間も同じ予算に含めたいときに使う。
    pub async fn run_with(
        &self,
        request: &BuildRequest,
        deadline: Deadline,
    ) -> Result<PipelineReport> {
        match self.execute(request, deadline).await {
            Ok(report) => {
                self.observer.on_stage(&Stage::Done);
                tracing::info!("Published {}", report.published.join(", "));
                Ok(report)
            }
            Err(e) => {
                self.observer.on_stage(&Stage::Failed);
                tracing::error!("Run failed: {}", e);
                Err(e)
            }
        }
    }

    fn enter(&self, stage: Stage, deadline: &Deadline) -> Result<()> {
        tracing::info!("Stage: {}", stage);
        deadline.check(&stage.to_string())?;
        self.observer.on_stage(&stage);
        Ok(())
    }

    async fn execute(&self, request: &BuildRequest, deadline: Deadline) -> Result<PipelineReport> {
        for tag in request.tags() {
            validate_tag(tag)?;
        }
        let observer = self.observer.as_ref();

        self.enter(Stage::Fetching, &deadline)?;
        let tree = self
            .fetcher
            .fetch(request.repository(), request.commit(), deadline, observer)
            .await?;

        self.enter(Stage::Archiving, &deadline)?;
        let archive = ContextBuilder::archive(&tree, &request.archive_name(), deadline).await?;
        if let Some(dest) = &self.options.dump_context {
            archive
                .dump_to(dest)
                .map_err(|e| PipelineError::archive(dest, e))?;
            tracing::info!("Build context written to {}", dest.display());
        }

        // ここから先のタグは name:tag 形式
        let references = request.references();

        self.enter(Stage::Building, &deadline)?;
        let image_id = self
            .builder
            .build_image(
                archive.bytes(),
                request.image(),
                &references,
                self.options.no_cache,
                deadline,
                observer,
            )
            .await?;

        let mut published = Vec::with_capacity(references.len());
        for (index, reference) in references.iter().enumerate() {
            self.enter(
                Stage::Pushing {
                    index,
                    reference: reference.clone(),
                },
                &deadline,
            )?;
            self.pusher
                .push(reference, index, deadline, observer)
                .await?;
            published.push(reference.clone());
        }

        Ok(PipelineReport {
            commit: tree.commit().to_string(),
            image_id,
            published,
        })
    }
}
