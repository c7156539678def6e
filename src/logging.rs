//! 日志模块 - 按天滚动的文件日志

use crate::config::{read_section, write_section};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// 日志文件名前缀
const LOG_FILE_PREFIX: &str = "httpsync";
const LOG_FILE_SUFFIX: &str = "log";

/// 日志配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogConfig {
    /// 是否启用日志记录
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// 日志级别: "error", "warn", "info", "debug", "trace"
    #[serde(default = "default_level")]
    pub level: String,
    /// 保留的日志文件数量（按天）
    #[serde(default = "default_max_files")]
    pub max_files: usize,
}

fn default_enabled() -> bool {
    true
}

fn default_level() -> String {
    "info".to_string()
}

fn default_max_files() -> usize {
    7
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            level: default_level(),
            max_files: default_max_files(),
        }
    }
}

impl LogConfig {
    /// 从配置文件加载日志配置
    pub fn load(config_dir: &Path) -> Self {
        read_section(config_dir, "log").unwrap_or_default()
    }

    /// 保存日志配置
    pub fn save(&self, config_dir: &Path) -> io::Result<()> {
        write_section(config_dir, "log", self)
    }

    /// 将配置的日志级别转换为 tracing Level
    pub fn tracing_level(&self) -> tracing::Level {
        match self.level.to_lowercase().as_str() {
            "error" => tracing::Level::ERROR,
            "warn" => tracing::Level::WARN,
            "debug" => tracing::Level::DEBUG,
            "trace" => tracing::Level::TRACE,
            _ => tracing::Level::INFO,
        }
    }

    fn env_filter(&self) -> EnvFilter {
        let filter = EnvFilter::from_default_env().add_directive(self.tracing_level().into());
        // 第三方库只输出警告
        ["hyper=warn", "hyper_util=warn", "reqwest=warn"]
            .iter()
            .filter_map(|d| d.parse().ok())
            .fold(filter, |filter, directive| filter.add_directive(directive))
    }
}

/// 日志目录：`<config_dir>/logs`
pub fn log_dir(config_dir: &Path) -> PathBuf {
    config_dir.join("logs")
}

/// 初始化日志系统
///
/// 返回的 guard 必须在程序结束前保持存活，否则缓冲中的日志会丢失。
/// 日志禁用时返回 `None`。
pub fn init_logging(log_dir: &Path, config: &LogConfig) -> io::Result<Option<WorkerGuard>> {
    if !config.enabled {
        // 日志已禁用，只初始化一个空的 subscriber
        let _ = tracing::subscriber::set_global_default(tracing_subscriber::registry());
        return Ok(None);
    }

    std::fs::create_dir_all(log_dir)?;

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix(LOG_FILE_SUFFIX)
        .max_log_files(config.max_files.max(1))
        .build(log_dir)
        .map_err(io::Error::other)?;
    let (file_writer, guard) = tracing_appender::non_blocking(appender);

    // 文件日志层 - 始终输出到文件
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(file_writer)
        .with_ansi(false)
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false);

    // 在 debug 模式下也输出到控制台
    let console_layer = cfg!(debug_assertions).then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
    });

    let subscriber = tracing_subscriber::registry()
        .with(config.env_filter())
        .with(file_layer)
        .with(console_layer);
    let _ = tracing::subscriber::set_global_default(subscriber);

    Ok(Some(guard))
}
