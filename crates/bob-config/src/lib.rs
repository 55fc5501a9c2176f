//! bob の実行オプション
//!
//! CLI 層が組み立て、パイプラインが読み取り専用で消費する設定値を定義します。

pub mod error;

pub use error::*;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// 既定のジョブタイムアウト
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// レジストリ既定ユーザー（トークン認証向けのダミー ID）
pub const DEFAULT_USERNAME: &str = "00000000-0000-0000-0000-000000000000";

/// 1 回のビルド実行の入力
///
/// 実行中は変更されません。タグは `name:tag` に結合される前の素のタグです。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRequest {
    repository: String,
    commit: String,
    image: String,
    tags: Vec<String>,
    timeout: Duration,
}

impl BuildRequest {
    pub fn new(
        repository: impl Into<String>,
        commit: impl Into<String>,
        image: impl Into<String>,
        tags: Vec<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let repository = repository.into();
        let commit = commit.into();
        let image = image.into();

        if repository.trim().is_empty() {
            return Err(ConfigError::MissingOption("git-repo"));
        }
        if commit.trim().is_empty() {
            return Err(ConfigError::MissingOption("commit"));
        }
        if image.trim().is_empty() {
            return Err(ConfigError::MissingOption("image"));
        }
        if tags.is_empty() {
            return Err(ConfigError::NoTags(image));
        }

        Ok(Self {
            repository,
            commit,
            image,
            tags,
            timeout,
        })
    }

    /// ソースリポジトリ参照（例: `github.com/example/app`）
    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn commit(&self) -> &str {
        &self.commit
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// `image:tag` 形式の完全なイメージ参照を、指定順のまま返す
    pub fn references(&self) -> Vec<String> {
        self.tags
            .iter()
            .map(|tag| format!("{}:{}", self.image, tag))
            .collect()
    }

    /// ビルドコンテキストのアーカイブ名
    ///
    /// リポジトリ参照の最後のパス要素を使います。
    /// - `github.com/example/app` -> `app.tar.gz`
    pub fn archive_name(&self) -> String {
        let name = self
            .repository
            .trim_end_matches('/')
            .trim_end_matches(".git")
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .unwrap_or("context");
        format!("{}.tar.gz", name)
    }
}

/// ソース取得に使うトランスポート
///
/// 参照文字列からの推測はせず、設定で明示的に選択します。
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum GitTransport {
    /// `https://<repository>`
    #[default]
    Https,
    /// `git@<host>:<path>.git`、鍵ファイルを指定可能
    Ssh { key: Option<PathBuf> },
    /// ローカルのパス（ミラーやテスト用）
    Local,
}

impl GitTransport {
    /// リポジトリ参照を clone 用 URL に変換
    pub fn url_for(&self, repository: &str) -> String {
        let repository = repository.trim_end_matches('/');
        match self {
            GitTransport::Https => format!("https://{}", repository),
            GitTransport::Ssh { .. } => match repository.split_once('/') {
                Some((host, path)) => {
                    let path = path.trim_end_matches(".git");
                    format!("git@{}:{}.git", host, path)
                }
                None => format!("git@{}", repository),
            },
            GitTransport::Local => repository.to_string(),
        }
    }
}

/// レジストリ認証情報
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RegistryCredentials {
    pub username: String,
    pub password: String,
    pub server_address: Option<String>,
}

/// 公開するタグを決定
///
/// 追加タグ（カンマ区切り、空白は除去）→ `latest` → コミット ID の順。
/// 空要素は捨て、重複は最初の出現位置を残して取り除きます。
pub fn resolve_tags(extra: Option<&str>, commit: &str) -> Vec<String> {
    let mut tags: Vec<String> = Vec::new();

    let extra: Vec<String> = extra
        .map(|s| s.replace(' ', ""))
        .map(|s| s.split(',').map(str::to_string).collect())
        .unwrap_or_default();

    for tag in extra
        .into_iter()
        .chain(["latest".to_string(), commit.trim().to_string()])
    {
        if tag.is_empty() || tags.contains(&tag) {
            continue;
        }
        tags.push(tag);
    }

    tags
}

/// `90s`、`5m`、`1h30m`、`500ms` 形式の期間を解析
///
/// 単位のない数値は秒として扱います。
pub fn parse_duration(input: &str) -> Result<Duration> {
    let invalid = || ConfigError::InvalidDuration(input.to_string());
    let s = input.trim();
    if s.is_empty() {
        return Err(invalid());
    }

    if s.chars().all(|c| c.is_ascii_digit()) {
        return s.parse::<u64>().map(Duration::from_secs).map_err(|_| invalid());
    }

    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let digits = rest.find(|c: char| !c.is_ascii_digit()).ok_or_else(invalid)?;
        if digits == 0 {
            return Err(invalid());
        }
        let value: u64 = rest[..digits].parse().map_err(|_| invalid())?;
        rest = &rest[digits..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(rest.len());
        let unit = &rest[..unit_len];
        rest = &rest[unit_len..];

        let secs_per_unit = match unit {
            "ms" => {
                total = total
                    .checked_add(Duration::from_millis(value))
                    .ok_or_else(invalid)?;
                continue;
            }
            "s" => 1,
            "m" => 60,
            "h" => 60 * 60,
            _ => return Err(invalid()),
        };
        let secs = value.checked_mul(secs_per_unit).ok_or_else(invalid)?;
        total = total
            .checked_add(Duration::from_secs(secs))
            .ok_or_else(invalid)?;
    }

    Ok(total)
}
