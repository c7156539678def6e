//! 基于 HTTP 清单的单向目录同步
//!
//! 扫描本地目录，与服务器发布的清单比较，下载新增和变更的文件，
//! 最后删除服务器上已经不存在的文件和空目录。

pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod transport;

pub use config::SyncSettings;
pub use self::core::{ReconciliationSession, SessionState, SyncEvents, SyncReport};
pub use error::{ConfigError, FetchError, ManifestError, ScanError, TransferError};

/// 应用目录名
pub const APP_DIR_NAME: &str = "httpsync";
