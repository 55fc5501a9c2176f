use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("failed to fetch {repository} at {commit}: {message}")]
    Fetch {
        repository: String,
        commit: String,
        message: String,
    },

    #[error("failed to archive {}: {source}", path.display())]
    Archive {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to build image {image}: {message}")]
    Build { image: String, message: String },

    #[error("failed to push {reference}: {message}")]
    Push { reference: String, message: String },

    #[error("deadline exceeded while {stage}")]
    DeadlineExceeded { stage: String },

    #[error("invalid build request: {0}")]
    InvalidRequest(String),
}

impl PipelineError {
    pub(crate) fn fetch(repository: &str, commit: &str, message: impl Into<String>) -> Self {
        PipelineError::Fetch {
            repository: repository.to_string(),
            commit: commit.to_string(),
            message: message.into(),
        }
    }

    pub(crate) fn archive(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PipelineError::Archive {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn build(image: &str, message: impl Into<String>) -> Self {
        PipelineError::Build {
            image: image.to_string(),
            message: message.into(),
        }
    }

    pub(crate) fn push(reference: &str, message: impl Into<String>) -> Self {
        PipelineError::Push {
            reference: reference.to_string(),
            message: message.into(),
        }
    }

    /// 期限切れかどうか
    pub fn is_deadline(&self) -> bool {
        matches!(self, PipelineError::DeadlineExceeded { .. })
    }

    /// ユーザー向けの分かりやすいエラーメッセージ
    pub fn user_message(&self) -> String {
        match self {
            PipelineError::Fetch {
                repository, commit, ..
            } => {
                format!(
                    "{}\n\
                     \n\
                     解決方法:\n\
                     1. リポジトリ {} にアクセスできるか確認してください\n\
                     2. コミット {} がリポジトリに存在するか確認してください",
                    self, repository, commit
                )
            }
            PipelineError::Build { .. } => {
                format!(
                    "{}\n\
                     \n\
                     コンテキスト直下の Dockerfile の内容を確認してください。",
                    self
                )
            }
            PipelineError::Push { .. } => {
                format!(
                    "{}\n\
                     \n\
                     レジストリの認証情報 (-u / -p) と push 権限を確認してください。\n\
                     これより前にプッシュ済みのタグは取り消されません。",
                    self
                )
            }
            PipelineError::DeadlineExceeded { .. } => {
                format!(
                    "{}\n\
                     \n\
                     --timeout でジョブ全体の制限時間を延ばしてください。",
                    self
                )
            }
            _ => format!("{}", self),
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
