//! 错误类型定义

use std::path::PathBuf;
use thiserror::Error;

/// 配置错误（构造时校验，不进行任何 IO）
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("同步根目录不存在: {0}")]
    RootMissing(PathBuf),

    #[error("同步根路径不是目录: {0}")]
    RootNotDirectory(PathBuf),

    #[error("无法创建同步根目录 {path}: {source}")]
    RootCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("无效的配置项 {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// 本地扫描错误
#[derive(Error, Debug)]
pub enum ScanError {
    #[error("无法读取 {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("遍历目录失败 {path}: {source}")]
    Walk {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },

    #[error("路径不是有效的 UTF-8: {0}")]
    InvalidPath(PathBuf),

    #[error("扫描任务异常终止: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// 远程清单解析错误
#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("第 {index} 条记录缺少字段 `{field}`")]
    MissingField { index: usize, field: &'static str },

    #[error("第 {index} 条记录的 size 不是非负整数: {value}")]
    InvalidSize { index: usize, value: String },

    #[error("第 {index} 条记录的路径无效 `{path}`: {reason}")]
    InvalidPath {
        index: usize,
        path: String,
        reason: &'static str,
    },

    #[error("清单格式无效: {0}")]
    Decode(String),
}

/// 单个文件的传输错误
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("请求失败: {0}")]
    Request(String),

    #[error("服务器返回 HTTP {status}: {url}")]
    Status { status: u16, url: String },

    #[error("资源不存在: {0}")]
    NotFound(String),

    #[error("写入 {path} 失败: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("校验失败 {path}: 期望 {expected}, 实际 {actual}")]
    DigestMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("传输任务异常终止")]
    Aborted,
}

impl From<reqwest::Error> for TransferError {
    fn from(e: reqwest::Error) -> Self {
        TransferError::Request(e.to_string())
    }
}

/// 获取远程清单的错误
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("下载清单失败: {0}")]
    Transfer(#[from] TransferError),

    #[error("{0}")]
    Manifest(#[from] ManifestError),
}
