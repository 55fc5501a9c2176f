use crate::daemon::{BuildSpec, ImageDaemon};
use crate::deadline::Deadline;
use crate::decode::{BuildLine, DecodeError, decode_lines};
use crate::error::{PipelineError, Result};
use crate::progress::{ProgressEvent, ProgressObserver, Stage};
use bytes::Bytes;
use futures_util::stream::StreamExt;
use std::sync::Arc;

pub struct ImageBuilder {
    daemon: Arc<dyn ImageDaemon>,
}

impl ImageBuilder {
    pub fn new(daemon: Arc<dyn ImageDaemon>) -> Self {
        Self { daemon }
    }

    /// イメージをビルド
    ///
    /// `references` はすべて `name:tag` 形式で、1 回のビルドで同時に付与されます。
    /// ビルドログの `stream` は 1 行ごとにそのまま観測者へ渡します。
    /// 成功時、デーモンが報告したイメージ ID を返します。
    pub async fn build_image(
        &self,
        context: Bytes,
        image: &str,
        references: &[String],
        no_cache: bool,
        deadline: Deadline,
        observer: &dyn ProgressObserver,
    ) -> Result<Option<String>> {
        tracing::info!("Building image: {}", references.join(", "));

        let stage = Stage::Building.to_string();
        let spec = BuildSpec::new(references.to_vec(), no_cache);

        let body = deadline
            .run(&stage, async {
                self.daemon
                    .build_image(context, &spec)
                    .await
                    .map_err(|e| PipelineError::build(image, e.to_string()))
            })
            .await?;

        let mut lines = decode_lines::<BuildLine>(body);
        let mut image_id = None;

        loop {
            let next = deadline.run(&stage, async { Ok(lines.next().await) }).await?;
            let line = match next {
                None => break,
                Some(Ok(line)) => line,
                Some(Err(DecodeError::Malformed { line, source })) => {
                    return Err(PipelineError::build(
                        image,
                        format!("malformed build output on line {}: {}", line, source),
                    ));
                }
                Some(Err(e)) => return Err(PipelineError::build(image, e.to_string())),
            };

            if let Some(error) = line.failure() {
                return Err(PipelineError::build(image, error));
            }

            if let Some(id) = line.image_id() {
                tracing::debug!("Built image id: {}", id);
                image_id = Some(id.to_string());
            }

            if let Some(text) = line.stream {
                observer.on_event(&ProgressEvent::BuildLog(text));
            }
        }

        tracing::info!("Successfully built: {}", image);
        Ok(image_id)
    }
}
