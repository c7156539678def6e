use crate::config::SyncSettings;
use crate::core::comparator::{self, DiffEntry, DiffSummary};
use crate::core::hasher::{ContentHasher, DigestAlgorithm};
use crate::core::manifest::ManifestStore;
use crate::core::scanner::{LocalTreeScanner, ScanConfig};
use crate::core::snapshot::TreeSnapshot;
use crate::core::transfer::{SyncOutcome, TransferConfig, TransferCoordinator, TransferProgress};
use crate::error::ConfigError;
use crate::transport::{Downloader, HttpManifestFetcher, ManifestFetcher};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

/// 同步会话状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    Idle,
    Scanning,
    ManifestFetch,
    Diffing,
    Transferring,
    Cleanup,
    Done { success: bool },
}

type SnapshotHandler = Arc<dyn Fn(&TreeSnapshot) + Send + Sync>;
type DiffHandler = Arc<dyn Fn(&[DiffEntry]) + Send + Sync>;
type PathHandler = Arc<dyn Fn(&str) + Send + Sync>;
type PathErrorHandler = Arc<dyn Fn(&str, &str) + Send + Sync>;
type StateHandler = Arc<dyn Fn(SessionState) + Send + Sync>;
type CompleteHandler = Arc<dyn Fn(bool, &str) + Send + Sync>;

/// 会话事件回调，全部可选，未注册的事件直接忽略
#[derive(Clone, Default)]
pub struct SyncEvents {
    remote_manifest_parsed: Option<SnapshotHandler>,
    local_tree_scanned: Option<SnapshotHandler>,
    diff_computed: Option<DiffHandler>,
    file_created: Option<PathHandler>,
    file_deleted: Option<PathHandler>,
    folder_deleted: Option<PathHandler>,
    cleanup_failed: Option<PathErrorHandler>,
    state_changed: Option<StateHandler>,
    sync_complete: Option<CompleteHandler>,
}

impl SyncEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_remote_manifest_parsed(
        mut self,
        f: impl Fn(&TreeSnapshot) + Send + Sync + 'static,
    ) -> Self {
        self.remote_manifest_parsed = Some(Arc::new(f));
        self
    }

    pub fn on_local_tree_scanned(mut self, f: impl Fn(&TreeSnapshot) + Send + Sync + 'static) -> Self {
        self.local_tree_scanned = Some(Arc::new(f));
        self
    }

    pub fn on_diff_computed(mut self, f: impl Fn(&[DiffEntry]) + Send + Sync + 'static) -> Self {
        self.diff_computed = Some(Arc::new(f));
        self
    }

    pub fn on_file_created(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.file_created = Some(Arc::new(f));
        self
    }

    pub fn on_file_deleted(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.file_deleted = Some(Arc::new(f));
        self
    }

    pub fn on_folder_deleted(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.folder_deleted = Some(Arc::new(f));
        self
    }

    /// 清理阶段的错误（不会导致同步失败）
    pub fn on_cleanup_failed(mut self, f: impl Fn(&str, &str) + Send + Sync + 'static) -> Self {
        self.cleanup_failed = Some(Arc::new(f));
        self
    }

    pub fn on_state_changed(mut self, f: impl Fn(SessionState) + Send + Sync + 'static) -> Self {
        self.state_changed = Some(Arc::new(f));
        self
    }

    pub fn on_sync_complete(mut self, f: impl Fn(bool, &str) + Send + Sync + 'static) -> Self {
        self.sync_complete = Some(Arc::new(f));
        self
    }
}

/// 会话选项
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    pub digest_algorithm: DigestAlgorithm,
    pub scan: ScanConfig,
    pub transfer: TransferConfig,
}

/// 同步报告
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub session_id: String,
    pub success: bool,
    pub message: String,
    pub state: SessionState,
    pub diff: DiffSummary,
    pub outcome: SyncOutcome,
    pub deleted_files: Vec<String>,
    pub deleted_dirs: Vec<String>,
    /// (路径, 原因)
    pub cleanup_errors: Vec<(String, String)>,
    pub start_time: i64,
    pub end_time: i64,
    pub duration_ms: u64,
}

impl SyncReport {
    fn new(start_time: i64) -> Self {
        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            success: false,
            message: String::new(),
            state: SessionState::Idle,
            diff: DiffSummary::default(),
            outcome: SyncOutcome::default(),
            deleted_files: Vec::new(),
            deleted_dirs: Vec::new(),
            cleanup_errors: Vec::new(),
            start_time,
            end_time: start_time,
            duration_ms: 0,
        }
    }
}

/// 清理阶段中单个目录的处理结果
enum DirRemoval {
    Removed(String),
    Failed(String, String),
}

/// 一次完整的协调过程：扫描 → 获取清单 → 比较 → 传输 → 清理 → 报告
pub struct ReconciliationSession {
    scanner: LocalTreeScanner,
    hasher: ContentHasher,
    fetcher: Arc<dyn ManifestFetcher>,
    downloader: Arc<dyn Downloader>,
    base_url: String,
    transfer_config: TransferConfig,
    events: SyncEvents,
    state: Mutex<SessionState>,
    running: AtomicBool,
}

impl ReconciliationSession {
    pub fn new(
        local_root: impl Into<PathBuf>,
        base_url: &str,
        downloader: Arc<dyn Downloader>,
        fetcher: Arc<dyn ManifestFetcher>,
        options: SessionOptions,
    ) -> Result<Self, ConfigError> {
        let hasher = ContentHasher::new(options.digest_algorithm);
        let scanner = LocalTreeScanner::with_config(local_root, hasher, options.scan)?;

        Ok(Self {
            scanner,
            hasher,
            fetcher,
            downloader,
            base_url: base_url.to_string(),
            transfer_config: options.transfer,
            events: SyncEvents::default(),
            state: Mutex::new(SessionState::Idle),
            running: AtomicBool::new(false),
        })
    }

    /// 根据配置创建会话，清单通过同一个下载器获取
    pub fn from_settings(
        settings: &SyncSettings,
        downloader: Arc<dyn Downloader>,
    ) -> Result<Self, ConfigError> {
        settings.validate()?;
        let root = settings.prepare_root()?;
        let fetcher = Arc::new(HttpManifestFetcher::new(
            downloader.clone(),
            &settings.base_url,
            &settings.manifest_path,
        ));

        Self::new(
            root,
            &settings.base_url,
            downloader,
            fetcher,
            settings.session_options(),
        )
    }

    pub fn with_events(mut self, events: SyncEvents) -> Self {
        self.events = events;
        self
    }

    pub fn root(&self) -> &Path {
        self.scanner.root()
    }

    /// 当前状态
    pub fn state(&self) -> SessionState {
        self.state.lock().map(|s| *s).unwrap_or(SessionState::Idle)
    }

    /// 运行一次同步
    pub async fn sync(&self) -> SyncReport {
        self.sync_with(|_, _| {}).await
    }

    /// 运行一次同步，结束时调用一次 `on_complete(success, message)`
    pub async fn sync_with<F>(&self, on_complete: F) -> SyncReport
    where
        F: FnOnce(bool, &str),
    {
        let started = Instant::now();
        let mut report = SyncReport::new(chrono::Utc::now().timestamp());

        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            // 正在运行的同步拥有会话状态，这里只结束本次调用
            warn!("同步正在进行中，忽略本次请求");
            report.message = "同步正在进行中".to_string();
            report.state = SessionState::Done { success: false };
            report.end_time = chrono::Utc::now().timestamp();
            self.complete(&report, on_complete);
            return report;
        }
        scopeguard::defer! {
            self.running.store(false, Ordering::SeqCst);
        }

        info!("开始同步: {} ({})", self.root().display(), report.session_id);
        let (success, message) = match self.run(&mut report).await {
            Ok(message) => (true, message),
            Err(message) => (false, message),
        };

        report.success = success;
        report.message = message;
        report.end_time = chrono::Utc::now().timestamp();
        report.duration_ms = started.elapsed().as_millis() as u64;
        report.state = SessionState::Done { success };
        self.transition(report.state);

        if success {
            info!("同步完成: {} ({}ms)", report.message, report.duration_ms);
        } else {
            error!("同步失败: {}", report.message);
        }

        self.complete(&report, on_complete);
        report
    }

    fn complete<F>(&self, report: &SyncReport, on_complete: F)
    where
        F: FnOnce(bool, &str),
    {
        if let Some(f) = &self.events.sync_complete {
            f(report.success, &report.message);
        }
        on_complete(report.success, &report.message);
    }

    async fn run(&self, report: &mut SyncReport) -> Result<String, String> {
        self.transition(SessionState::Scanning);
        let local = self
            .scanner
            .scan()
            .await
            .map_err(|e| format!("扫描本地目录失败: {}", e))?;
        if let Some(f) = &self.events.local_tree_scanned {
            f(&local);
        }

        self.transition(SessionState::ManifestFetch);
        let records = self
            .fetcher
            .fetch_manifest()
            .await
            .map_err(|e| format!("获取远程清单失败: {}", e))?;

        self.transition(SessionState::Diffing);
        let remote = ManifestStore::parse(&records).map_err(|e| format!("解析远程清单失败: {}", e))?;
        let remote = Arc::new(remote);
        if let Some(f) = &self.events.remote_manifest_parsed {
            f(&remote);
        }

        let diff = comparator::diff(&local, &remote);
        report.diff = DiffSummary::from_entries(&diff);
        debug!(
            "比较完成: 新增 {}, 更新 {}, 删除 {} ({} 字节待传输)",
            report.diff.create_count,
            report.diff.update_count,
            report.diff.delete_count,
            report.diff.transfer_bytes
        );
        if let Some(f) = &self.events.diff_computed {
            f(&diff);
        }

        if report.diff.transfer_count() > 0 {
            self.transition(SessionState::Transferring);
            let outcome = self.transfer(&diff, remote.clone()).await;
            report.outcome = outcome;
            if !report.outcome.success {
                // 不回滚，保留已经下载的文件
                return Err(report.outcome.message.clone());
            }
        } else {
            report.outcome = SyncOutcome::succeeded("没有需要传输的文件");
        }

        self.transition(SessionState::Cleanup);
        self.cleanup(&remote, report).await;

        Ok(if report.diff.is_empty() && report.deleted_dirs.is_empty() {
            "本地目录已是最新".to_string()
        } else {
            format!(
                "传输 {} 个文件, 删除 {} 个文件, {} 个目录",
                report.outcome.transferred.len(),
                report.deleted_files.len(),
                report.deleted_dirs.len()
            )
        })
    }

    /// 传输阶段，逐项转发 file_created 事件
    async fn transfer(&self, diff: &[DiffEntry], remote: Arc<TreeSnapshot>) -> SyncOutcome {
        let coordinator = TransferCoordinator::new(
            self.downloader.clone(),
            self.base_url.clone(),
            self.root(),
            self.transfer_config.clone(),
        )
        .with_verification(self.hasher, remote);

        let (progress_tx, mut progress_rx) = mpsc::channel(64);
        let events = &self.events;
        let forward = async move {
            while let Some(progress) = progress_rx.recv().await {
                if let TransferProgress::Completed { path, .. } = &progress {
                    if let Some(f) = &events.file_created {
                        f(path);
                    }
                }
            }
        };

        let (outcome, ()) = tokio::join!(
            coordinator.transfer_with_progress(diff, Some(progress_tx)),
            forward
        );
        outcome
    }

    /// 清理阶段：删除远程清单中不存在的文件，然后删除空目录
    ///
    /// 清理失败只记录并通知，不影响同步结果。
    async fn cleanup(&self, remote: &TreeSnapshot, report: &mut SyncReport) {
        let local = match self.scanner.scan().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("清理前重新扫描失败: {}", e);
                self.record_cleanup_error(report, "", &e.to_string());
                return;
            }
        };

        for record in local.iter() {
            let path = record.relative_path();
            if remote.contains(path) {
                continue;
            }

            match tokio::fs::remove_file(self.root().join(path)).await {
                Ok(()) => {
                    info!("删除过期文件: {}", path);
                    report.deleted_files.push(path.to_string());
                    if let Some(f) = &self.events.file_deleted {
                        f(path);
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!("删除文件失败: {} - {}", path, e);
                    self.record_cleanup_error(report, path, &e.to_string());
                }
            }
        }

        let root = self.root().to_path_buf();
        let removals = match tokio::task::spawn_blocking(move || remove_empty_dirs(&root)).await {
            Ok(removals) => removals,
            Err(e) => {
                warn!("清理空目录任务异常: {}", e);
                self.record_cleanup_error(report, "", &e.to_string());
                return;
            }
        };

        for removal in removals {
            match removal {
                DirRemoval::Removed(path) => {
                    info!("删除空目录: {}", path);
                    if let Some(f) = &self.events.folder_deleted {
                        f(&path);
                    }
                    report.deleted_dirs.push(path);
                }
                DirRemoval::Failed(path, reason) => {
                    warn!("删除目录失败: {} - {}", path, reason);
                    self.record_cleanup_error(report, &path, &reason);
                }
            }
        }
    }

    fn record_cleanup_error(&self, report: &mut SyncReport, path: &str, reason: &str) {
        if let Some(f) = &self.events.cleanup_failed {
            f(path, reason);
        }
        report
            .cleanup_errors
            .push((path.to_string(), reason.to_string()));
    }

    fn transition(&self, next: SessionState) {
        if let Ok(mut state) = self.state.lock() {
            *state = next;
        }
        debug!("会话状态: {:?}", next);
        if let Some(f) = &self.events.state_changed {
            f(next);
        }
    }
}

/// 自底向上删除根目录下的空目录（根目录本身保留）
fn remove_empty_dirs(root: &Path) -> Vec<DirRemoval> {
    let mut removals = Vec::new();

    // contents_first 保证子目录先于父目录处理
    for entry in WalkDir::new(root).min_depth(1).contents_first(true) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                let path = e.path().map(|p| p.display().to_string()).unwrap_or_default();
                removals.push(DirRemoval::Failed(path, e.to_string()));
                continue;
            }
        };
        if !entry.file_type().is_dir() {
            continue;
        }

        let is_empty = match std::fs::read_dir(entry.path()) {
            Ok(mut children) => children.next().is_none(),
            Err(e) => {
                removals.push(DirRemoval::Failed(relative_display(root, entry.path()), e.to_string()));
                continue;
            }
        };
        if !is_empty {
            continue;
        }

        let relative = relative_display(root, entry.path());
        match std::fs::remove_dir(entry.path()) {
            Ok(()) => removals.push(DirRemoval::Removed(relative)),
            Err(e) => removals.push(DirRemoval::Failed(relative, e.to_string())),
        }
    }

    removals
}

fn relative_display(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
