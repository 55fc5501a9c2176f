//! ソース取得
//!
//! リポジトリを一時ディレクトリへ完全に clone し、指定されたコミットを
//! そのオブジェクト ID でチェックアウトします。ブランチやタグ名は受け付けません。

use crate::deadline::Deadline;
use crate::error::{PipelineError, Result};
use crate::progress::{ProgressEvent, ProgressObserver, Stage};
use async_trait::async_trait;
use bob_config::GitTransport;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

/// 1 回の実行だけが所有するチェックアウト済みツリー
///
/// drop されるとディレクトリごと削除されます。
#[derive(Debug)]
pub struct SourceTree {
    dir: TempDir,
    commit: String,
}

impl SourceTree {
    pub fn new(dir: TempDir, commit: impl Into<String>) -> Self {
        Self {
            dir,
            commit: commit.into(),
        }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// チェックアウトしたコミットの完全なオブジェクト ID
    pub fn commit(&self) -> &str {
        &self.commit
    }
}

#[async_trait]
pub trait SourceFetcher: Send + Sync {
    async fn fetch(
        &self,
        repository: &str,
        commit: &str,
        deadline: Deadline,
        observer: &dyn ProgressObserver,
    ) -> Result<SourceTree>;
}

/// コミット ID として妥当か（16 進 4〜64 文字）
pub fn is_commit_id(commit: &str) -> bool {
    (4..=64).contains(&commit.len()) && commit.chars().all(|c| c.is_ascii_hexdigit())
}

/// git CLI で取得する実装
#[derive(Debug, Clone)]
pub struct GitFetcher {
    transport: GitTransport,
    program: PathBuf,
}

impl GitFetcher {
    pub fn new(transport: GitTransport) -> Self {
        Self {
            transport,
            program: PathBuf::from("git"),
        }
    }

    /// 使用する git 実行ファイルを指定
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .kill_on_drop(true);

        if let GitTransport::Ssh { key: Some(key) } = &self.transport {
            cmd.env("GIT_SSH_COMMAND", ssh_command(key));
        }

        cmd
    }

    /// `git -C <dir> <args>` を実行して出力を返す
    async fn git(&self, dir: &Path, args: &[&str]) -> std::io::Result<Output> {
        self.command()
            .arg("-C")
            .arg(dir)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
    }

    /// clone し、stderr の進捗を観測者へ流す
    ///
    /// 失敗時は git が最後に出力した行を返します。
    async fn clone_into(
        &self,
        url: &str,
        dir: &Path,
        observer: &dyn ProgressObserver,
    ) -> std::result::Result<(), String> {
        let mut child = self
            .command()
            .args(["clone", "--progress", "--no-checkout", url])
            .arg(dir)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| format!("failed to run git: {}", e))?;

        let mut last_line = String::new();
        if let Some(stderr) = child.stderr.take() {
            let mut reader = BufReader::new(stderr);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                let n = reader
                    .read_until(b'\n', &mut buf)
                    .await
                    .map_err(|e| format!("failed to read git output: {}", e))?;
                if n == 0 {
                    break;
                }
                // 進捗は \r で同じ行を上書きしてくる
                for segment in buf.split(|b| *b == b'\r' || *b == b'\n') {
                    let text = String::from_utf8_lossy(segment);
                    let text = text.trim();
                    if text.is_empty() {
                        continue;
                    }
                    observer.on_event(&ProgressEvent::FetchProgress(text.to_string()));
                    last_line = text.to_string();
                }
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| format!("failed to wait for git: {}", e))?;
        if !status.success() {
            if last_line.is_empty() {
                last_line = format!("git clone exited with {}", status);
            }
            return Err(last_line);
        }
        Ok(())
    }

    async fn clone_and_checkout(
        &self,
        repository: &str,
        commit: &str,
        observer: &dyn ProgressObserver,
    ) -> Result<SourceTree> {
        let fail = |message: String| PipelineError::fetch(repository, commit, message);

        let dir = tempfile::Builder::new()
            .prefix("bob-src-")
            .tempdir()
            .map_err(|e| fail(format!("failed to create work tree: {}", e)))?;

        let url = self.transport.url_for(repository);
        tracing::info!("Cloning {}", url);
        self.clone_into(&url, dir.path(), observer)
            .await
            .map_err(|e| fail(format!("failed to clone repository: {}", e)))?;

        let spec = format!("{}^{{commit}}", commit);
        let output = self
            .git(dir.path(), &["rev-parse", "--verify", "--quiet", &spec])
            .await
            .map_err(|e| fail(format!("failed to run git: {}", e)))?;
        if !output.status.success() {
            return Err(fail("commit not found in repository".to_string()));
        }
        let resolved = String::from_utf8_lossy(&output.stdout).trim().to_string();

        let output = self
            .git(
                dir.path(),
                &[
                    "-c",
                    "advice.detachedHead=false",
                    "checkout",
                    "--quiet",
                    "--detach",
                    &resolved,
                ],
            )
            .await
            .map_err(|e| fail(format!("failed to run git: {}", e)))?;
        if !output.status.success() {
            return Err(fail(format!(
                "failed to checkout: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        tracing::info!("Checked out {} at {}", repository, resolved);
        Ok(SourceTree::new(dir, resolved))
    }
}

#[async_trait]
impl SourceFetcher for GitFetcher {
    async fn fetch(
        &self,
        repository: &str,
        commit: &str,
        deadline: Deadline,
        observer: &dyn ProgressObserver,
    ) -> Result<SourceTree> {
        if !is_commit_id(commit) {
            return Err(PipelineError::fetch(
                repository,
                commit,
                "not a commit id (expected 4-64 hex characters)",
            ));
        }

        let stage = Stage::Fetching.to_string();
        deadline
            .run(&stage, self.clone_and_checkout(repository, commit, observer))
            .await
    }
}

/// `GIT_SSH_COMMAND` はシェル経由で解釈されるので、鍵のパスは単一引用符で囲む
fn ssh_command(key: &Path) -> String {
    let quoted = key.display().to_string().replace('\'', r"'\''");
    format!(
        "ssh -i '{}' -o IdentitiesOnly=yes -o StrictHostKeyChecking=accept-new",
        quoted
    )
}
