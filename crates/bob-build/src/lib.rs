//! bob のビルドパイプライン
//!
//! Git リポジトリの特定コミットを取得し、ビルドコンテキストにまとめ、
//! イメージデーモンでビルドして、各タグをレジストリへプッシュします。

pub mod auth;
pub mod builder;
pub mod context;
pub mod daemon;
pub mod deadline;
pub mod decode;
pub mod error;
pub mod pipeline;
pub mod progress;
pub mod pusher;
pub mod source;

pub use auth::AuthConfig;
pub use builder::ImageBuilder;
pub use context::{ArchiveEntry, ContextArchive, ContextBuilder};
pub use daemon::{BuildSpec, ByteStream, DaemonError, DockerDaemon, ImageDaemon};
pub use deadline::Deadline;
pub use error::{PipelineError, Result};
pub use pipeline::{Pipeline, PipelineOptions, PipelineReport};
pub use progress::{ConsoleObserver, MemoryObserver, ProgressEvent, ProgressObserver, Stage};
pub use pusher::{ImagePusher, split_image_tag, validate_tag};
pub use source::{GitFetcher, SourceFetcher, SourceTree};
