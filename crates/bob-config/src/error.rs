use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid duration '{0}': expected forms like 90s, 5m, 1h30m or 500ms")]
    InvalidDuration(String),

    #[error("missing required option: {0}")]
    MissingOption(&'static str),

    #[error("no tags to publish for image '{0}'")]
    NoTags(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;
