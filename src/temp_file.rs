use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, warn};

/// 本地临时产物（帧图片、音频、上传的视频）
///
/// 文件在 `TempFile` 被释放时删除，无论调用方是正常返回、提前 `?` 返回还是 panic。
#[derive(Debug)]
pub struct TempFile {
    path: PathBuf,
}

impl TempFile {
    /// 在 `dir` 下创建一个唯一命名的空文件
    pub fn create_in(dir: &Path, prefix: &str, suffix: &str) -> std::io::Result<Self> {
        let named = tempfile::Builder::new()
            .prefix(prefix)
            .suffix(suffix)
            .tempfile_in(dir)?;
        // 交出自动删除，由 Drop 负责，这样删除失败可以记日志
        let path = named
            .into_temp_path()
            .keep()
            .map_err(|e| e.error)?;
        Ok(Self { path })
    }

    /// 创建并写入内容
    pub async fn write_in(
        dir: &Path,
        prefix: &str,
        suffix: &str,
        contents: &[u8],
    ) -> std::io::Result<Self> {
        let file = Self::create_in(dir, prefix, suffix)?;
        tokio::fs::write(&file.path, contents).await?;
        Ok(file)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempFile {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!("🧹 [临时文件] 已删除: {}", self.path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("⚠️  [临时文件] 删除失败: {} - {}", self.path.display(), e),
        }
    }
}

/// 为一次处理创建独立的临时目录，目录随返回值一起释放
pub fn scratch_dir(root: Option<&Path>) -> Result<TempDir> {
    let mut builder = tempfile::Builder::new();
    builder.prefix("video-analyze-");
    match root {
        Some(root) => {
            std::fs::create_dir_all(root)
                .context(format!("创建临时根目录失败: {}", root.display()))?;
            builder
                .tempdir_in(root)
                .context(format!("创建临时目录失败: {}", root.display()))
        }
        None => builder.tempdir().context("创建临时目录失败"),
    }
}
