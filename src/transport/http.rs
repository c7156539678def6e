use super::{ensure_parent, partial_path, Downloader, CONNECT_TIMEOUT_SECS};
use crate::error::TransferError;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// 基于 reqwest 的 HTTP 下载器
pub struct HttpDownloader {
    client: reqwest::Client,
    name: String,
}

impl HttpDownloader {
    pub fn new(request_timeout: Duration) -> Result<Self, TransferError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .timeout(request_timeout)
            .user_agent(concat!("httpsync/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            name: "http".to_string(),
        })
    }

    async fn get(&self, url: &str) -> Result<reqwest::Response, TransferError> {
        let response = self.client.get(url).send().await?;
        let status = response.status();

        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(TransferError::NotFound(url.to_string()));
        }
        if !status.is_success() {
            return Err(TransferError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        Ok(response)
    }

    /// 把响应体流式写入临时文件
    async fn write_body(
        response: reqwest::Response,
        temp_path: &Path,
    ) -> Result<u64, TransferError> {
        let io_err = |e| TransferError::Io {
            path: temp_path.to_path_buf(),
            source: e,
        };

        let mut file = tokio::fs::File::create(temp_path).await.map_err(io_err)?;
        let mut stream = response.bytes_stream();
        let mut written = 0u64;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await.map_err(io_err)?;
            written += chunk.len() as u64;
        }

        file.flush().await.map_err(io_err)?;
        Ok(written)
    }
}

#[async_trait]
impl Downloader for HttpDownloader {
    async fn fetch_to_file(&self, url: &str, destination: &Path) -> Result<u64, TransferError> {
        let response = self.get(url).await?;

        ensure_parent(destination).await?;

        // 先写入临时文件，完成后再重命名
        let temp_path = partial_path(destination);
        let written = match Self::write_body(response, &temp_path).await {
            Ok(n) => n,
            Err(e) => {
                let _ = tokio::fs::remove_file(&temp_path).await;
                return Err(e);
            }
        };

        tokio::fs::rename(&temp_path, destination)
            .await
            .map_err(|e| TransferError::Io {
                path: destination.to_path_buf(),
                source: e,
            })?;

        debug!("下载完成: {} -> {} ({} 字节)", url, destination.display(), written);
        Ok(written)
    }

    async fn fetch_bytes(&self, url: &str) -> Result<Bytes, TransferError> {
        let response = self.get(url).await?;
        Ok(response.bytes().await?)
    }

    fn name(&self) -> &str {
        &self.name
    }
}
