//! イメージデーモンとの境界
//!
//! パイプラインはデーモンに対して「ビルド」と「プッシュ」の 2 つの呼び出しだけを行い、
//! どちらも改行区切り JSON のレスポンスボディを返します。
//! 実装は bollard 経由の Docker ですが、テストでは偽のデーモンに差し替えます。

use crate::auth::AuthConfig;
use crate::pusher::split_image_tag;
use async_trait::async_trait;
use bollard::Docker;
use bollard::models::{BuildInfo, PushImageInfo};
use bytes::Bytes;
use futures_util::stream::{self, BoxStream, StreamExt};
use http_body_util::{Either, Full};
use serde_json::json;
use thiserror::Error;
use tokio::sync::mpsc;

/// レスポンスボディのチャンク列
pub type ByteStream = BoxStream<'static, Result<Bytes, DaemonError>>;

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("Docker connection error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("invalid registry auth: {0}")]
    Auth(String),

    #[error("{0}")]
    Other(String),
}

/// ビルド要求のオプション
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildSpec {
    /// `name:tag` 形式の参照（すべて同じイメージに付与）
    pub tags: Vec<String>,
    pub dockerfile: String,
    pub no_cache: bool,
    pub force_remove: bool,
    pub pull_parent: bool,
}

impl BuildSpec {
    /// コンテキスト直下の `Dockerfile` を使い、中間コンテナは常に削除し、
    /// ベースイメージは毎回 pull する
    pub fn new(tags: Vec<String>, no_cache: bool) -> Self {
        Self {
            tags,
            dockerfile: "Dockerfile".to_string(),
            no_cache,
            force_remove: true,
            pull_parent: true,
        }
    }
}

#[async_trait]
pub trait ImageDaemon: Send + Sync {
    /// tar.gz のビルドコンテキストを送ってビルドし、ビルドログのボディを返す
    async fn build_image(
        &self,
        context: Bytes,
        spec: &BuildSpec,
    ) -> Result<ByteStream, DaemonError>;

    /// `name:tag` をプッシュし、進捗のボディを返す
    ///
    /// `registry_auth` は `AuthConfig::encode` の結果。
    async fn push_image(
        &self,
        reference: &str,
        registry_auth: &str,
    ) -> Result<ByteStream, DaemonError>;
}

/// bollard で Docker Engine API を叩く実装
#[derive(Clone)]
pub struct DockerDaemon {
    docker: Docker,
}

impl DockerDaemon {
    pub fn new(docker: Docker) -> Self {
        Self { docker }
    }

    pub fn docker(&self) -> &Docker {
        &self.docker
    }
}

/// 転送タスクとボディの間のバッファ（行数）
const BODY_BUFFER: usize = 64;

type Chunk = Result<Bytes, DaemonError>;

/// 1 行の JSON にして改行を付ける
fn json_line(message: &serde_json::Value) -> Chunk {
    let mut line = serde_json::to_vec(message)
        .map_err(|e| DaemonError::Other(format!("Failed to encode daemon message: {}", e)))?;
    line.push(b'\n');
    Ok(Bytes::from(line))
}

/// bollard がデコード済みのビルドメッセージを 1 行に戻す
fn build_info_line(info: BuildInfo) -> Chunk {
    json_line(&json!({
        "stream": info.stream,
        "status": info.status,
        "error": info.error,
        "errorDetail": info.error_detail.map(|d| json!({ "message": d.message })),
        "aux": info.aux.and_then(|a| a.id).map(|id| json!({ "ID": id })),
    }))
}

fn push_info_line(info: PushImageInfo) -> Chunk {
    json_line(&json!({
        "status": info.status,
        "progress": info.progress,
        "error": info.error,
    }))
}

/// チャネルの受信側をボディにする
///
/// ボディを捨てると送信が失敗し、転送タスクは bollard のストリームごと終了する。
fn channel_body(rx: mpsc::Receiver<Chunk>) -> ByteStream {
    stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|chunk| (chunk, rx)) }).boxed()
}

#[async_trait]
impl ImageDaemon for DockerDaemon {
    async fn build_image(
        &self,
        context: Bytes,
        spec: &BuildSpec,
    ) -> Result<ByteStream, DaemonError> {
        let (first, rest) = spec
            .tags
            .split_first()
            .ok_or_else(|| DaemonError::Other("no tags given for build".to_string()))?;

        // Engine API は t を複数受け付けるが bollard は 1 つだけなので、
        // 残りはビルド完了後に tag_image で付与する
        #[allow(deprecated)]
        let options = bollard::image::BuildImageOptions {
            dockerfile: spec.dockerfile.clone(),
            t: first.clone(),
            nocache: spec.no_cache,
            rm: true,
            forcerm: spec.force_remove,
            pull: spec.pull_parent,
            ..Default::default()
        };
        tracing::debug!("Build options: {:?}", options);

        let docker = self.docker.clone();
        let source = first.clone();
        let targets = rest.to_vec();
        let (tx, rx) = mpsc::channel(BODY_BUFFER);

        tokio::spawn(async move {
            let body = Full::new(context);
            let mut build = docker.build_image(options, None, Some(Either::Left(body)));
            let mut failed = false;

            while let Some(msg) = build.next().await {
                let chunk = match msg {
                    Ok(info) => {
                        failed |= info.error.is_some() || info.error_detail.is_some();
                        build_info_line(info)
                    }
                    Err(e) => Err(DaemonError::from(e)),
                };
                let stop = chunk.is_err();
                if tx.send(chunk).await.is_err() || stop {
                    return;
                }
            }
            drop(build);

            // 失敗したビルドでは古いイメージにタグを付けない
            if failed {
                return;
            }

            for target in targets {
                let (repo, tag) = split_image_tag(&target);
                #[allow(deprecated)]
                let options = bollard::image::TagImageOptions { repo, tag };
                let chunk = match docker.tag_image(&source, Some(options)).await {
                    Ok(()) => json_line(&json!({
                        "stream": format!("Successfully tagged {}\n", target)
                    })),
                    Err(e) => Err(DaemonError::from(e)),
                };
                let stop = chunk.is_err();
                if tx.send(chunk).await.is_err() || stop {
                    return;
                }
            }
        });

        Ok(channel_body(rx))
    }

    async fn push_image(
        &self,
        reference: &str,
        registry_auth: &str,
    ) -> Result<ByteStream, DaemonError> {
        let credentials = AuthConfig::decode(registry_auth)?;
        let (image, tag) = split_image_tag(reference);

        #[allow(deprecated)]
        let options = bollard::image::PushImageOptions::<String> { tag };

        let docker = self.docker.clone();
        let (tx, rx) = mpsc::channel(BODY_BUFFER);

        tokio::spawn(async move {
            #[allow(deprecated)]
            let mut push = docker.push_image(&image, Some(options), Some(credentials.into()));

            while let Some(msg) = push.next().await {
                let chunk = msg.map_err(DaemonError::from).and_then(push_info_line);
                let stop = chunk.is_err();
                if tx.send(chunk).await.is_err() || stop {
                    return;
                }
            }
        });

        Ok(channel_body(rx))
    }
}
