//! イメージプッシュ処理
//!
//! ビルドしたイメージをタグごとにコンテナレジストリへプッシュします。

use crate::auth::AuthConfig;
use crate::daemon::ImageDaemon;
use crate::deadline::Deadline;
use crate::decode::{PushLine, decode_lines};
use crate::error::{PipelineError, Result};
use crate::progress::{ProgressEvent, ProgressObserver, Stage};
use bob_config::RegistryCredentials;
use futures_util::StreamExt;
use std::sync::Arc;

/// イメージプッシュを実行するハンドラ
pub struct ImagePusher {
    daemon: Arc<dyn ImageDaemon>,
    credentials: RegistryCredentials,
}

impl ImagePusher {
    pub fn new(daemon: Arc<dyn ImageDaemon>, credentials: RegistryCredentials) -> Self {
        Self {
            daemon,
            credentials,
        }
    }

    /// `name:tag` をレジストリにプッシュ
    ///
    /// 認証ヘッダは呼び出しごとに作り直します。ストリーム中にエラー行が現れたら、
    /// 残りの行は読まずにその場で失敗します。
    pub async fn push(
        &self,
        reference: &str,
        index: usize,
        deadline: Deadline,
        observer: &dyn ProgressObserver,
    ) -> Result<()> {
        let stage = Stage::Pushing {
            index,
            reference: reference.to_string(),
        }
        .to_string();

        let registry_auth = AuthConfig::from_credentials(&self.credentials)
            .encode()
            .map_err(|e| PipelineError::push(reference, format!("failed to encode auth: {}", e)))?;

        let body = deadline
            .run(&stage, async {
                self.daemon
                    .push_image(reference, &registry_auth)
                    .await
                    .map_err(|e| PipelineError::push(reference, e.to_string()))
            })
            .await?;

        let mut lines = decode_lines::<PushLine>(body);
        loop {
            let line = match deadline.run(&stage, async { Ok(lines.next().await) }).await? {
                None => break,
                Some(Ok(line)) => line,
                Some(Err(e)) => return Err(PipelineError::push(reference, e.to_string())),
            };

            if let Some(error) = line.failure() {
                observer.on_event(&ProgressEvent::PushError(error.clone()));
                return Err(PipelineError::push(reference, error));
            }

            if let Some(status) = line.status {
                observer.on_event(&ProgressEvent::PushStatus(status));
            }
        }

        tracing::info!("Pushed {}", reference);
        Ok(())
    }
}

/// Docker のタグ制約を検証
///
/// - 128文字以下
/// - 英数字、ピリオド、ハイフン、アンダースコアのみ
/// - 先頭はピリオドまたはハイフンではない
pub fn validate_tag(tag: &str) -> Result<()> {
    if tag.is_empty() {
        return Err(PipelineError::InvalidRequest("empty tag".to_string()));
    }

    if tag.len() > 128 {
        return Err(PipelineError::InvalidRequest(format!(
            "tag too long ({} characters, max 128)",
            tag.len()
        )));
    }

    if tag.starts_with('.') || tag.starts_with('-') {
        return Err(PipelineError::InvalidRequest(format!(
            "tag must not start with '.' or '-': {}",
            tag
        )));
    }

    if let Some(c) = tag
        .chars()
        .find(|c| !c.is_ascii_alphanumeric() && *c != '.' && *c != '-' && *c != '_')
    {
        return Err(PipelineError::InvalidRequest(format!(
            "invalid character '{}' in tag: {}",
            c, tag
        )));
    }

    Ok(())
}

/// イメージ名とタグを分離
///
/// # Examples
/// - `ghcr.io/org/app:v1.0` -> `("ghcr.io/org/app", "v1.0")`
/// - `ghcr.io/org/app` -> `("ghcr.io/org/app", "latest")`
/// - `localhost:5000/app:dev` -> `("localhost:5000/app", "dev")`
pub fn split_image_tag(image: &str) -> (String, String) {
    if let Some(pos) = image.rfind(':') {
        let potential_tag = &image[pos + 1..];
        let potential_image = &image[..pos];

        // ポート番号は / を含まない純粋な数字
        if !potential_tag.contains('/') && !potential_tag.chars().all(|c| c.is_ascii_digit()) {
            return (potential_image.to_string(), potential_tag.to_string());
        }
    }

    (image.to_string(), "latest".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::{BuildSpec, ByteStream, DaemonError};
    use crate::progress::MemoryObserver;
    use async_trait::async_trait;
    use bytes::Bytes;
    use futures_util::stream;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// 1 チャンク 1 行で返し、読まれた行数を数えるデーモン
    struct CountingDaemon {
        lines: Vec<&'static str>,
        pulled: Arc<AtomicUsize>,
        auth: Mutex<Vec<String>>,
    }

    impl CountingDaemon {
        fn new(lines: Vec<&'static str>) -> Arc<Self> {
            Arc::new(Self {
                lines,
                pulled: Arc::new(AtomicUsize::new(0)),
                auth: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ImageDaemon for CountingDaemon {
        async fn build_image(
            &self,
            _context: Bytes,
            _spec: &BuildSpec,
        ) -> std::result::Result<ByteStream, DaemonError> {
            unreachable!("build is not used by the pusher")
        }

        async fn push_image(
            &self,
            _reference: &str,
            registry_auth: &str,
        ) -> std::result::Result<ByteStream, DaemonError> {
            self.auth.lock().unwrap().push(registry_auth.to_string());
            let pulled = self.pulled.clone();
            let chunks: Vec<std::result::Result<Bytes, DaemonError>> = self
                .lines
                .iter()
                .map(|l| Ok(Bytes::from(format!("{}\n", l))))
                .collect();
            Ok(stream::iter(chunks)
                .inspect(move |_| {
                    pulled.fetch_add(1, Ordering::SeqCst);
                })
                .boxed())
        }
    }

    fn credentials() -> RegistryCredentials {
        RegistryCredentials {
            username: "ci".into(),
            password: "pw".into(),
            server_address: Some("registry.example.com".into()),
        }
    }

    fn deadline() -> Deadline {
        Deadline::after(Duration::from_secs(30))
    }

    #[tokio::test]
    async fn test_push_forwards_status_lines() {
        let daemon = CountingDaemon::new(vec![
            r#"{"status":"The push refers to repository [docker.io/library/app]"}"#,
            r#"{"status":"Pushed","progressDetail":{},"id":"a1b2"}"#,
            r#"{"status":"v1: digest: sha256:abc size: 528"}"#,
        ]);
        let observer = MemoryObserver::new();

        ImagePusher::new(daemon.clone(), credentials())
            .push("app:v1", 0, deadline(), &observer)
            .await
            .unwrap();

        assert_eq!(
            observer.events(),
            vec![
                ProgressEvent::PushStatus(
                    "The push refers to repository [docker.io/library/app]".into()
                ),
                ProgressEvent::PushStatus("Pushed".into()),
                ProgressEvent::PushStatus("v1: digest: sha256:abc size: 528".into()),
            ]
        );

        let auth = daemon.auth.lock().unwrap();
        let decoded = AuthConfig::decode(&auth[0]).unwrap();
        assert_eq!(decoded.username, "ci");
        assert_eq!(decoded.serveraddress.as_deref(), Some("registry.example.com"));
    }

    #[tokio::test]
    async fn test_push_stops_at_first_error_line() {
        let daemon = CountingDaemon::new(vec![
            r#"{"status":"Preparing"}"#,
            r#"{"status":"Pushing"}"#,
            r#"{"errorDetail":{"message":"denied: requested access to the resource is denied"},"error":"denied: requested access to the resource is denied"}"#,
            r#"{"status":"should never be read"}"#,
            r#"{"status":"nor this"}"#,
        ]);
        let observer = MemoryObserver::new();

        let err = ImagePusher::new(daemon.clone(), credentials())
            .push("app:v2", 1, deadline(), &observer)
            .await
            .unwrap_err();

        match &err {
            PipelineError::Push { reference, message } => {
                assert_eq!(reference, "app:v2");
                assert!(message.starts_with("denied"));
            }
            other => panic!("expected push error, got {:?}", other),
        }
        assert_eq!(daemon.pulled.load(Ordering::SeqCst), 3);
        assert_eq!(observer.events().len(), 3);
        assert!(matches!(
            observer.events().last(),
            Some(ProgressEvent::PushError(_))
        ));
    }

    #[tokio::test]
    async fn test_push_error_on_first_line() {
        let daemon = CountingDaemon::new(vec![r#"{"error":"unauthorized"}"#, r#"{"status":"x"}"#]);

        let err = ImagePusher::new(daemon.clone(), credentials())
            .push("app:v2", 1, deadline(), &MemoryObserver::new())
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "failed to push app:v2: unauthorized");
        assert_eq!(daemon.pulled.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_push_empty_error_is_not_a_failure() {
        let daemon = CountingDaemon::new(vec![r#"{"status":"Pushed","error":""}"#]);
        let observer = MemoryObserver::new();

        ImagePusher::new(daemon, credentials())
            .push("app:v1", 0, deadline(), &observer)
            .await
            .unwrap();
        assert_eq!(observer.events(), vec![ProgressEvent::PushStatus("Pushed".into())]);
    }

    #[tokio::test]
    async fn test_push_malformed_line() {
        let daemon = CountingDaemon::new(vec![r#"{"status":"#]);

        let err = ImagePusher::new(daemon, credentials())
            .push("app:v1", 0, deadline(), &MemoryObserver::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Push { .. }));
    }

    #[test]
    fn test_validate_tag() {
        assert!(validate_tag("latest").is_ok());
        assert!(validate_tag("v1.2.3_rc-1").is_ok());
        assert!(validate_tag(&"a".repeat(40)).is_ok());

        assert!(validate_tag("").is_err());
        assert!(validate_tag(".hidden").is_err());
        assert!(validate_tag("-dash").is_err());
        assert!(validate_tag("has space").is_err());
        assert!(validate_tag("feature/x").is_err());
        assert!(validate_tag(&"a".repeat(129)).is_err());
    }

    #[test]
    fn test_split_image_tag_with_tag() {
        let (image, tag) = split_image_tag("ghcr.io/org/app:v1.0");
        assert_eq!(image, "ghcr.io/org/app");
        assert_eq!(tag, "v1.0");
    }

    #[test]
    fn test_split_image_tag_without_tag() {
        let (image, tag) = split_image_tag("ghcr.io/org/app");
        assert_eq!(image, "ghcr.io/org/app");
        assert_eq!(tag, "latest");
    }

    #[test]
    fn test_split_image_tag_with_port() {
        // localhost:5000/app はポート番号を含むレジストリ
        let (image, tag) = split_image_tag("localhost:5000/app");
        assert_eq!(image, "localhost:5000/app");
        assert_eq!(tag, "latest");
    }

    #[test]
    fn test_split_image_tag_with_port_and_tag() {
        let (image, tag) = split_image_tag("localhost:5000/app:dev");
        assert_eq!(image, "localhost:5000/app");
        assert_eq!(tag, "dev");
    }

    enum Fault {
        Refused,
        ResetMidStream,
        Stalled,
    }

    /// 1 行だけ返してから壊れるデーモン
    struct FaultyDaemon(Fault);

    #[async_trait]
    impl ImageDaemon for FaultyDaemon {
        async fn build_image(
            &self,
            _context: Bytes,
            _spec: &BuildSpec,
        ) -> std::result::Result<ByteStream, DaemonError> {
            unreachable!("build is not used by the pusher")
        }

        async fn push_image(
            &self,
            _reference: &str,
            _registry_auth: &str,
        ) -> std::result::Result<ByteStream, DaemonError> {
            let first: std::result::Result<Bytes, DaemonError> =
                Ok(Bytes::from_static(b"{\"status\":\"Preparing\"}\n"));
            match self.0 {
                Fault::Refused => Err(DaemonError::Other("connection refused".into())),
                Fault::ResetMidStream => Ok(stream::iter(vec![
                    first,
                    Err(DaemonError::Other("connection reset by peer".into())),
                ])
                .boxed()),
                Fault::Stalled => Ok(stream::iter(vec![first])
                    .chain(stream::pending())
                    .boxed()),
            }
        }
    }

    async fn push_with(fault: Fault, observer: &MemoryObserver) -> Result<()> {
        ImagePusher::new(Arc::new(FaultyDaemon(fault)), credentials())
            .push("app:v1", 0, deadline(), observer)
            .await
    }

    #[tokio::test]
    async fn test_refused_push_request_is_push_error() {
        let observer = MemoryObserver::new();
        let err = push_with(Fault::Refused, &observer).await.unwrap_err();

        match err {
            PipelineError::Push { reference, message } => {
                assert_eq!(reference, "app:v1");
                assert!(message.contains("connection refused"));
            }
            other => panic!("expected push error, got {:?}", other),
        }
        assert!(observer.events().is_empty());
    }

    #[tokio::test]
    async fn test_transport_error_mid_stream_is_push_error() {
        let observer = MemoryObserver::new();
        let err = push_with(Fault::ResetMidStream, &observer)
            .await
            .unwrap_err();

        match err {
            PipelineError::Push { reference, message } => {
                assert_eq!(reference, "app:v1");
                assert!(message.contains("connection reset by peer"));
            }
            other => panic!("expected push error, got {:?}", other),
        }
        assert_eq!(
            observer.events(),
            vec![ProgressEvent::PushStatus("Preparing".into())]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_push_hits_deadline() {
        let observer = MemoryObserver::new();
        let err = push_with(Fault::Stalled, &observer).await.unwrap_err();

        assert!(err.is_deadline());
        assert_eq!(
            observer.events(),
            vec![ProgressEvent::PushStatus("Preparing".into())]
        );
    }
}

