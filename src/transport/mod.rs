pub mod http;
pub mod local;

use crate::core::manifest::{decode_manifest, ManifestRecord};
use crate::error::{FetchError, TransferError};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

pub use http::HttpDownloader;
pub use local::LocalMirror;

// ============ 公共常量 ============

/// 连接超时（秒）
pub const CONNECT_TIMEOUT_SECS: u64 = 30;
/// 单个请求的默认超时（秒）
pub const IO_TIMEOUT_SECS: u64 = 300;

/// 下载能力抽象，传输细节（HTTP、TLS、重定向）由实现负责
#[async_trait]
pub trait Downloader: Send + Sync {
    /// 下载到指定文件，返回写入的字节数
    async fn fetch_to_file(&self, url: &str, destination: &Path) -> Result<u64, TransferError>;

    /// 下载到内存
    async fn fetch_bytes(&self, url: &str) -> Result<Bytes, TransferError>;

    /// 获取名称（用于日志）
    fn name(&self) -> &str;
}

/// 远程清单获取能力
#[async_trait]
pub trait ManifestFetcher: Send + Sync {
    async fn fetch_manifest(&self) -> Result<Vec<ManifestRecord>, FetchError>;
}

/// 通过 [`Downloader`] 从固定地址获取 JSON 清单
pub struct HttpManifestFetcher {
    downloader: Arc<dyn Downloader>,
    url: String,
}

impl HttpManifestFetcher {
    pub fn new(downloader: Arc<dyn Downloader>, base_url: &str, manifest_path: &str) -> Self {
        Self {
            downloader,
            url: build_url(base_url, manifest_path),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl ManifestFetcher for HttpManifestFetcher {
    async fn fetch_manifest(&self) -> Result<Vec<ManifestRecord>, FetchError> {
        info!("获取远程清单: {} (via {})", self.url, self.downloader.name());
        let payload = self.downloader.fetch_bytes(&self.url).await?;
        debug!("清单大小: {} 字节", payload.len());
        Ok(decode_manifest(&payload)?)
    }
}

/// 拼接下载地址，相对路径的每一段都会做百分号编码
pub fn build_url(base_url: &str, relative_path: &str) -> String {
    let encoded: Vec<String> = relative_path
        .split('/')
        .filter(|s| !s.is_empty())
        .map(|s| urlencoding::encode(s).into_owned())
        .collect();
    format!("{}/{}", base_url.trim_end_matches('/'), encoded.join("/"))
}

/// 下载时使用的临时文件路径：`<name>.<uuid>.part`，每次调用都不同
pub(crate) fn partial_path(destination: &Path) -> PathBuf {
    let mut name = destination
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(format!(".{}.part", uuid::Uuid::new_v4().simple()));
    destination.with_file_name(name)
}

/// 确保父目录存在，目录已存在不视为错误
pub(crate) async fn ensure_parent(destination: &Path) -> Result<(), TransferError> {
    if let Some(parent) = destination.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| TransferError::Io {
                path: parent.to_path_buf(),
                source: e,
            })?;
    }
    Ok(())
}
