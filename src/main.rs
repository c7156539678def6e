use anyhow::Context;
use httpsync_lib::config::default_config_dir;
use httpsync_lib::core::SyncEvents;
use httpsync_lib::logging::{init_logging, log_dir, LogConfig};
use httpsync_lib::transport::HttpDownloader;
use httpsync_lib::{ReconciliationSession, SyncSettings};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};

/// 打印所有事件的回调
fn logging_events() -> SyncEvents {
    SyncEvents::new()
        .on_local_tree_scanned(|snapshot| {
            info!("本地文件: {} 个 ({} 字节)", snapshot.len(), snapshot.total_size())
        })
        .on_remote_manifest_parsed(|snapshot| {
            info!("远程文件: {} 个 ({} 字节)", snapshot.len(), snapshot.total_size())
        })
        .on_diff_computed(|entries| info!("差异: {} 项", entries.len()))
        .on_file_created(|path| info!("已下载: {}", path))
        .on_file_deleted(|path| info!("已删除文件: {}", path))
        .on_folder_deleted(|path| info!("已删除目录: {}", path))
        .on_cleanup_failed(|path, reason| warn!("清理失败: {} - {}", path, reason))
}

async fn run(config_dir: PathBuf) -> anyhow::Result<bool> {
    let settings = SyncSettings::load(&config_dir);
    settings
        .validate()
        .with_context(|| format!("配置无效: {}", config_dir.join("config.json").display()))?;

    let downloader = Arc::new(HttpDownloader::new(settings.request_timeout())?);
    let session = ReconciliationSession::from_settings(&settings, downloader)
        .context("无法创建同步会话")?
        .with_events(logging_events());

    let report = session.sync().await;
    match serde_json::to_string_pretty(&report) {
        Ok(json) => println!("{}", json),
        Err(e) => warn!("无法序列化同步报告: {}", e),
    }

    Ok(report.success)
}

#[tokio::main]
async fn main() -> ExitCode {
    let config_dir = std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(default_config_dir);

    let log_config = LogConfig::load(&config_dir);
    let _guard = match init_logging(&log_dir(&config_dir), &log_config) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("无法初始化日志: {}", e);
            None
        }
    };

    info!("使用配置目录: {}", config_dir.display());

    match run(config_dir).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("错误: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
