use crate::deadline::Deadline;
use crate::error::{PipelineError, Result};
use crate::progress::Stage;
use crate::source::SourceTree;
use bytes::Bytes;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tar::{Builder, EntryType, Header, HeaderMode};

/// パスに含まれていたらアーカイブしない名前
const EXCLUDED_NAMES: [&str; 2] = [".git", ".github"];

/// 作成済みのビルドコンテキスト（tar.gz）
#[derive(Debug, Clone)]
pub struct ContextArchive {
    path: PathBuf,
    data: Bytes,
}

/// アーカイブ内の 1 エントリ
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub path: String,
    pub is_dir: bool,
    pub mode: u32,
    /// シンボリックリンクの場合のリンク先
    pub link: Option<String>,
    pub content: Vec<u8>,
}

impl ContextArchive {
    /// ツリー内に書き出したアーカイブファイルのパス
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn bytes(&self) -> Bytes {
        self.data.clone()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// 展開してエントリ一覧を返す
    pub fn entries(&self) -> std::io::Result<Vec<ArchiveEntry>> {
        let mut archive = tar::Archive::new(GzDecoder::new(&self.data[..]));
        let mut entries = Vec::new();

        for entry in archive.entries()? {
            let mut entry = entry?;
            let header = entry.header();
            let path = entry.path()?.to_string_lossy().into_owned();
            let is_dir = header.entry_type().is_dir();
            let mode = header.mode()?;
            let link = entry
                .link_name()?
                .map(|l| l.to_string_lossy().into_owned());

            let mut content = Vec::new();
            entry.read_to_end(&mut content)?;

            entries.push(ArchiveEntry {
                path,
                is_dir,
                mode,
                link,
                content,
            });
        }

        Ok(entries)
    }

    /// アーカイブをツリーの外へコピー（デバッグ用）
    pub fn dump_to(&self, dest: &Path) -> std::io::Result<()> {
        if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(dest, &self.data)
    }
}

/// アーカイブから除外するパスか
///
/// セグメント一致ではなく文字列の包含で判定します。アーカイブ自身は
/// 走査の途中でツリー内に作られるため、毎回その場で判定する必要があります。
pub fn is_excluded(relative_path: &str, archive_name: &str) -> bool {
    relative_path.contains(archive_name)
        || EXCLUDED_NAMES
            .iter()
            .any(|name| relative_path.contains(name))
}

pub struct ContextBuilder;

impl ContextBuilder {
    /// ソースツリーをアーカイブする（期限付き、ブロッキング I/O は別スレッド）
    pub async fn archive(
        tree: &SourceTree,
        archive_name: &str,
        deadline: Deadline,
    ) -> Result<ContextArchive> {
        let root = tree.root().to_path_buf();
        let archive_name = archive_name.to_string();
        let stage = Stage::Archiving.to_string();

        deadline
            .run(&stage, async move {
                tokio::task::spawn_blocking(move || {
                    Self::create_context(&root, &archive_name, deadline)
                })
                    .await
                    .map_err(|e| {
                        PipelineError::archive(PathBuf::new(), std::io::Error::other(e.to_string()))
                    })?
            })
            .await
    }

    /// ビルドコンテキストを tar.gz としてツリー直下に作成
    ///
    /// 走査中もエントリごとに期限を確認し、切れたら書きかけのアーカイブを消して止まる。
    pub fn create_context(
        root: &Path,
        archive_name: &str,
        deadline: Deadline,
    ) -> Result<ContextArchive> {
        tracing::debug!("Creating build context from: {}", root.display());

        if !root.join("Dockerfile").is_file() {
            tracing::warn!("Dockerfile not found at the context root: {}", root.display());
        }

        let archive_path = root.join(archive_name);
        let file =
            File::create(&archive_path).map_err(|e| PipelineError::archive(&archive_path, e))?;

        let encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
        let mut tar = Builder::new(encoder);
        tar.mode(HeaderMode::Deterministic);
        tar.follow_symlinks(false);

        if let Err(e) = Self::add_directory(&mut tar, root, "", archive_name, &deadline) {
            drop(tar);
            fs::remove_file(&archive_path).ok();
            return Err(e);
        }

        // tar を閉じてから gzip を閉じる（逆順だと壊れたアーカイブになる）
        let encoder = tar
            .into_inner()
            .map_err(|e| PipelineError::archive(&archive_path, e))?;
        let mut writer = encoder
            .finish()
            .map_err(|e| PipelineError::archive(&archive_path, e))?;
        writer
            .flush()
            .map_err(|e| PipelineError::archive(&archive_path, e))?;
        drop(writer);

        let data = fs::read(&archive_path).map_err(|e| PipelineError::archive(&archive_path, e))?;
        tracing::debug!("Build context created: {} bytes", data.len());

        Self::check_context_size(data.len());

        Ok(ContextArchive {
            path: archive_path,
            data: Bytes::from(data),
        })
    }

    /// ディレクトリを深さ優先で追加（名前順）
    fn add_directory<W: Write>(
        tar: &mut Builder<W>,
        root: &Path,
        relative: &str,
        archive_name: &str,
        deadline: &Deadline,
    ) -> Result<()> {
        let dir = root.join(relative);
        let mut entries = fs::read_dir(&dir)
            .and_then(|it| it.collect::<std::io::Result<Vec<_>>>())
            .map_err(|e| PipelineError::archive(&dir, e))?;
        entries.sort_by_key(|e| e.file_name());

        for entry in entries {
            deadline.check(&Stage::Archiving.to_string())?;

            let name = entry.file_name().to_string_lossy().into_owned();
            let path = if relative.is_empty() {
                name
            } else {
                format!("{}/{}", relative, name)
            };

            if is_excluded(&path, archive_name) {
                tracing::debug!("Skipping {}", path);
                continue;
            }

            let full_path = entry.path();
            let file_type = entry
                .file_type()
                .map_err(|e| PipelineError::archive(&full_path, e))?;

            if file_type.is_dir() {
                Self::add_directory(tar, root, &path, archive_name, deadline)?;
            } else if file_type.is_symlink() {
                Self::add_symlink(tar, &full_path, &path)?;
            } else {
                Self::add_file(tar, &full_path, &path)?;
            }
        }

        Ok(())
    }

    fn add_file<W: Write>(tar: &mut Builder<W>, full_path: &Path, path: &str) -> Result<()> {
        let mut file = File::open(full_path).map_err(|e| PipelineError::archive(full_path, e))?;
        tar.append_file(path, &mut file)
            .map_err(|e| PipelineError::archive(full_path, e))
    }

    fn add_symlink<W: Write>(tar: &mut Builder<W>, full_path: &Path, path: &str) -> Result<()> {
        let target = fs::read_link(full_path).map_err(|e| PipelineError::archive(full_path, e))?;

        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Symlink);
        header.set_size(0);
        header.set_mode(0o777);
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);

        tar.append_link(&mut header, path, &target)
            .map_err(|e| PipelineError::archive(full_path, e))
    }

    /// コンテキストサイズのチェックと警告
    fn check_context_size(size: usize) {
        const MAX_CONTEXT_SIZE: usize = 500 * 1024 * 1024; // 500MB

        if size > MAX_CONTEXT_SIZE {
            tracing::warn!(
                "Build context is large ({}MB); consider trimming the repository",
                size / 1024 / 1024
            );
        }
    }
}
