//! 同步配置模块

use crate::core::hasher::DigestAlgorithm;
use crate::core::scanner::ScanConfig;
use crate::core::session::SessionOptions;
use crate::core::transfer::TransferConfig;
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// 配置文件名
pub const CONFIG_FILE: &str = "config.json";

/// 本应用的默认配置目录：`<系统配置目录>/httpsync`
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .map(|p| p.join(crate::APP_DIR_NAME))
        .unwrap_or_else(|| PathBuf::from(format!(".{}", crate::APP_DIR_NAME)))
}

/// 同步配置（`config.json` 中的 `sync` 节点）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSettings {
    /// 服务器地址，必填
    #[serde(default)]
    pub base_url: String,
    /// 清单相对于 base_url 的路径
    #[serde(default = "default_manifest_path")]
    pub manifest_path: String,
    /// 本地同步根目录，必填
    #[serde(default)]
    pub local_path: PathBuf,
    #[serde(default = "default_max_concurrent_transfers")]
    pub max_concurrent_transfers: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default)]
    pub digest_algorithm: DigestAlgorithm,
    /// 下载后校验摘要
    #[serde(default = "default_true")]
    pub verify_digest: bool,
    /// 根目录不存在时自动创建
    #[serde(default)]
    pub create_root: bool,
    #[serde(default)]
    pub follow_links: bool,
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
    /// 单个请求超时（秒）
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_manifest_path() -> String {
    "md5".to_string()
}

fn default_max_concurrent_transfers() -> usize {
    4
}

fn default_max_retries() -> u32 {
    2
}

fn default_retry_base_delay_ms() -> u64 {
    500
}

fn default_true() -> bool {
    true
}

fn default_max_depth() -> usize {
    64
}

fn default_request_timeout_secs() -> u64 {
    crate::transport::IO_TIMEOUT_SECS
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            manifest_path: default_manifest_path(),
            local_path: PathBuf::new(),
            max_concurrent_transfers: default_max_concurrent_transfers(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            digest_algorithm: DigestAlgorithm::default(),
            verify_digest: default_true(),
            create_root: false,
            follow_links: false,
            max_depth: default_max_depth(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl SyncSettings {
    /// 从配置文件加载同步配置，读取失败时返回默认值（由 validate 报告缺失项）
    pub fn load(config_dir: &Path) -> Self {
        read_section(config_dir, "sync").unwrap_or_default()
    }

    /// 保存同步配置，保留文件中的其他节点
    pub fn save(&self, config_dir: &Path) -> io::Result<()> {
        write_section(config_dir, "sync", self)
    }

    /// 校验配置（不进行任何 IO）
    pub fn validate(&self) -> Result<(), ConfigError> {
        let base_url = self.base_url.trim();
        if base_url.is_empty() {
            return Err(ConfigError::Invalid {
                field: "baseUrl",
                reason: "不能为空".to_string(),
            });
        }
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(ConfigError::Invalid {
                field: "baseUrl",
                reason: format!("只支持 http/https 地址: {}", base_url),
            });
        }
        if self.local_path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid {
                field: "localPath",
                reason: "不能为空".to_string(),
            });
        }
        if self.max_concurrent_transfers == 0 {
            return Err(ConfigError::Invalid {
                field: "maxConcurrentTransfers",
                reason: "必须大于 0".to_string(),
            });
        }
        Ok(())
    }

    /// 返回同步根目录，开启 create_root 时自动创建
    pub fn prepare_root(&self) -> Result<PathBuf, ConfigError> {
        let root = self.local_path.clone();
        if self.create_root && !root.exists() {
            fs::create_dir_all(&root).map_err(|e| ConfigError::RootCreate {
                path: root.clone(),
                source: e,
            })?;
            tracing::info!("已创建同步根目录: {}", root.display());
        }
        Ok(root)
    }

    pub fn scan_config(&self) -> ScanConfig {
        ScanConfig {
            follow_links: self.follow_links,
            max_depth: self.max_depth,
        }
    }

    pub fn transfer_config(&self) -> TransferConfig {
        TransferConfig {
            max_concurrent_transfers: self.max_concurrent_transfers,
            max_retries: self.max_retries,
            retry_base_delay_ms: self.retry_base_delay_ms,
            verify_digest: self.verify_digest,
        }
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            digest_algorithm: self.digest_algorithm,
            scan: self.scan_config(),
            transfer: self.transfer_config(),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// 读取 `config.json` 中的一个节点
pub(crate) fn read_section<T: serde::de::DeserializeOwned>(config_dir: &Path, key: &str) -> Option<T> {
    let content = fs::read_to_string(config_dir.join(CONFIG_FILE)).ok()?;
    let config = serde_json::from_str::<serde_json::Value>(&content).ok()?;
    let section = config.get(key)?;
    match serde_json::from_value::<T>(section.clone()) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!("配置节点 {} 格式错误，使用默认值: {}", key, e);
            None
        }
    }
}

/// 更新 `config.json` 中的一个节点
pub(crate) fn write_section<T: Serialize>(config_dir: &Path, key: &str, value: &T) -> io::Result<()> {
    let config_file = config_dir.join(CONFIG_FILE);

    // 读取现有配置
    let mut config: serde_json::Value = if config_file.exists() {
        let content = fs::read_to_string(&config_file)?;
        serde_json::from_str(&content).unwrap_or_else(|_| serde_json::json!({}))
    } else {
        serde_json::json!({})
    };
    if !config.is_object() {
        config = serde_json::json!({});
    }

    config[key] = serde_json::to_value(value).map_err(io::Error::other)?;

    fs::create_dir_all(config_dir)?;
    let content = serde_json::to_string_pretty(&config).map_err(io::Error::other)?;
    fs::write(&config_file, content)
}
