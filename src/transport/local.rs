use super::{ensure_parent, partial_path, Downloader};
use crate::core::snapshot::normalize_relative_path;
use crate::error::TransferError;
use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use tokio::fs;

/// 从本地目录提供文件的下载器
///
/// `base_url` 之后的路径部分映射到 `root` 下的文件，适用于挂载的共享目录。
pub struct LocalMirror {
    base_url: String,
    root: PathBuf,
    name: String,
}

impl LocalMirror {
    pub fn new(base_url: &str, root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let name = format!("local:{}", root.display());
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            root,
            name,
        }
    }

    /// 把 URL 解析为镜像目录中的路径
    fn resolve_url(&self, url: &str) -> Result<PathBuf, TransferError> {
        let rest = url
            .strip_prefix(&self.base_url)
            .ok_or_else(|| TransferError::NotFound(url.to_string()))?;

        let mut decoded = Vec::new();
        for segment in rest.split('/').filter(|s| !s.is_empty()) {
            let segment = urlencoding::decode(segment)
                .map_err(|_| TransferError::NotFound(url.to_string()))?;
            decoded.push(segment.into_owned());
        }

        let relative = normalize_relative_path(&decoded.join("/"))
            .map_err(|_| TransferError::NotFound(url.to_string()))?;
        Ok(self.root.join(relative))
    }
}

fn map_read_error(url: &str, path: &Path, e: std::io::Error) -> TransferError {
    if e.kind() == std::io::ErrorKind::NotFound {
        TransferError::NotFound(url.to_string())
    } else {
        TransferError::Io {
            path: path.to_path_buf(),
            source: e,
        }
    }
}

#[async_trait]
impl Downloader for LocalMirror {
    async fn fetch_to_file(&self, url: &str, destination: &Path) -> Result<u64, TransferError> {
        let source = self.resolve_url(url)?;

        ensure_parent(destination).await?;

        let temp_path = partial_path(destination);
        let copied = match fs::copy(&source, &temp_path).await {
            Ok(n) => n,
            Err(e) => {
                let _ = fs::remove_file(&temp_path).await;
                return Err(map_read_error(url, &source, e));
            }
        };

        fs::rename(&temp_path, destination)
            .await
            .map_err(|e| TransferError::Io {
                path: destination.to_path_buf(),
                source: e,
            })?;

        Ok(copied)
    }

    async fn fetch_bytes(&self, url: &str) -> Result<Bytes, TransferError> {
        let source = self.resolve_url(url)?;
        let data = fs::read(&source)
            .await
            .map_err(|e| map_read_error(url, &source, e))?;
        Ok(Bytes::from(data))
    }

    fn name(&self) -> &str {
        &self.name
    }
}
