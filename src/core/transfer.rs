//! 并发传输协调
//!
//! 每个 Create/Update 条目由独立任务下载，结果通过同一个通道汇总到协调循环，
//! 只有在全部任务上报终态之后才给出整体结果。

use crate::core::comparator::DiffEntry;
use crate::core::hasher::ContentHasher;
use crate::core::snapshot::TreeSnapshot;
use crate::error::TransferError;
use crate::transport::{build_url, Downloader};
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, warn};

/// 单次重试等待的上限（毫秒）
const MAX_RETRY_DELAY_MS: u64 = 60_000;

/// 第 attempt 次重试前的等待时间：base * 2^attempt，不超过上限
fn backoff_delay(base_ms: u64, attempt: u32) -> u64 {
    2_u64
        .checked_pow(attempt)
        .map_or(u64::MAX, |factor| base_ms.saturating_mul(factor))
        .min(MAX_RETRY_DELAY_MS)
}

/// 传输配置
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// 最大并发传输数
    pub max_concurrent_transfers: usize,
    /// 最大重试次数
    pub max_retries: u32,
    /// 重试基础延迟（毫秒）
    pub retry_base_delay_ms: u64,
    /// 下载完成后是否校验摘要
    pub verify_digest: bool,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_concurrent_transfers: 4,
            max_retries: 2,
            retry_base_delay_ms: 500,
            verify_digest: true,
        }
    }
}

/// 一批传输的汇总结果
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncOutcome {
    pub success: bool,
    pub message: String,
    pub transferred: Vec<String>,
    /// (相对路径, 失败原因)
    pub failed: Vec<(String, String)>,
}

impl SyncOutcome {
    pub fn succeeded(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            ..Default::default()
        }
    }
}

/// 流式传输中的进度事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferProgress {
    Completed { path: String, bytes: u64 },
    Failed { path: String, reason: String },
    /// 最后一个事件
    Finished(SyncOutcome),
}

/// 单个任务上报的终态
struct TransferResult {
    path: String,
    result: Result<u64, TransferError>,
}

/// 摘要校验所需的信息
#[derive(Clone)]
struct Verification {
    hasher: ContentHasher,
    remote: Arc<TreeSnapshot>,
}

/// 传输协调器
#[derive(Clone)]
pub struct TransferCoordinator {
    downloader: Arc<dyn Downloader>,
    base_url: String,
    local_root: PathBuf,
    config: TransferConfig,
    verification: Option<Verification>,
}

impl TransferCoordinator {
    pub fn new(
        downloader: Arc<dyn Downloader>,
        base_url: impl Into<String>,
        local_root: impl Into<PathBuf>,
        config: TransferConfig,
    ) -> Self {
        Self {
            downloader,
            base_url: base_url.into(),
            local_root: local_root.into(),
            config,
            verification: None,
        }
    }

    /// 设置下载后校验使用的远程快照（仅在 `verify_digest` 开启时生效）
    ///
    /// `verify_digest` 开启但未设置快照时不会校验，传输开始时记录一条警告。
    pub fn with_verification(mut self, hasher: ContentHasher, remote: Arc<TreeSnapshot>) -> Self {
        self.verification = Some(Verification { hasher, remote });
        self
    }

    /// 下载结果是否会被校验
    pub fn verifies_digests(&self) -> bool {
        self.config.verify_digest && self.verification.is_some()
    }

    /// 传输全部 Create/Update 条目，Delete 条目由清理阶段处理
    pub async fn transfer_all(&self, entries: &[DiffEntry]) -> SyncOutcome {
        self.transfer_with_progress(entries, None).await
    }

    /// 流式版本：每个条目结束时产生一个事件，最后产生 [`TransferProgress::Finished`]
    pub fn transfer_stream(&self, entries: Vec<DiffEntry>) -> ReceiverStream<TransferProgress> {
        let (tx, rx) = mpsc::channel(64);
        let this = self.clone();

        tokio::spawn(async move {
            let outcome = this.transfer_with_progress(&entries, Some(tx.clone())).await;
            let _ = tx.send(TransferProgress::Finished(outcome)).await;
        });

        ReceiverStream::new(rx)
    }

    /// 并发传输并汇总结果，可选地发送逐项进度
    pub async fn transfer_with_progress(
        &self,
        entries: &[DiffEntry],
        progress_tx: Option<mpsc::Sender<TransferProgress>>,
    ) -> SyncOutcome {
        // 同一路径只传输一次
        let mut seen = HashSet::new();
        let jobs: Vec<DiffEntry> = entries
            .iter()
            .filter(|e| e.needs_transfer())
            .filter(|e| seen.insert(e.relative_path.clone()))
            .cloned()
            .collect();

        if jobs.is_empty() {
            debug!("没有需要传输的文件");
            return SyncOutcome::succeeded("没有需要传输的文件");
        }

        if self.config.verify_digest && self.verification.is_none() {
            warn!("已开启摘要校验但未提供远程快照，本次传输不校验摘要");
        }

        let total = jobs.len();
        info!(
            "开始传输 {} 个文件 (并发 {}, via {})",
            total,
            self.config.max_concurrent_transfers,
            self.downloader.name()
        );

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_transfers.max(1)));
        let (result_tx, mut result_rx) = mpsc::channel::<TransferResult>(total);
        let mut outstanding: HashSet<String> = HashSet::with_capacity(total);

        for entry in jobs {
            outstanding.insert(entry.relative_path.clone());

            let this = self.clone();
            let semaphore = semaphore.clone();
            let result_tx = result_tx.clone();

            tokio::spawn(async move {
                let result = match semaphore.acquire_owned().await {
                    Ok(_permit) => this.transfer_with_retry(&entry).await,
                    Err(_) => Err(TransferError::Aborted),
                };
                let _ = result_tx
                    .send(TransferResult {
                        path: entry.relative_path,
                        result,
                    })
                    .await;
            });
        }
        // 只保留任务持有的发送端，全部任务结束后通道关闭
        drop(result_tx);

        let mut pending = total;
        let mut transferred = Vec::with_capacity(total);
        let mut failed = Vec::new();

        while pending > 0 {
            let Some(TransferResult { path, result }) = result_rx.recv().await else {
                break;
            };
            if !outstanding.remove(&path) {
                continue;
            }
            pending -= 1;

            let event = match result {
                Ok(bytes) => {
                    debug!("传输完成: {} ({} 字节), 剩余 {}", path, bytes, pending);
                    transferred.push(path.clone());
                    TransferProgress::Completed { path, bytes }
                }
                Err(e) => {
                    warn!("传输失败: {} - {}", path, e);
                    let reason = e.to_string();
                    failed.push((path.clone(), reason.clone()));
                    TransferProgress::Failed { path, reason }
                }
            };

            if let Some(tx) = &progress_tx {
                let _ = tx.send(event).await;
            }
        }

        // 通道提前关闭：任务未上报结果便终止
        for path in outstanding {
            error!("传输任务未上报结果: {}", path);
            let reason = TransferError::Aborted.to_string();
            if let Some(tx) = &progress_tx {
                let _ = tx
                    .send(TransferProgress::Failed {
                        path: path.clone(),
                        reason: reason.clone(),
                    })
                    .await;
            }
            failed.push((path, reason));
        }

        transferred.sort();
        failed.sort();

        let success = failed.is_empty();
        let message = if success {
            format!("已传输 {} 个文件", transferred.len())
        } else {
            format!(
                "{} 个文件传输失败 (共 {} 个): {}: {}",
                failed.len(),
                total,
                failed[0].0,
                failed[0].1
            )
        };

        info!(
            "传输结束: 成功 {}, 失败 {}",
            transferred.len(),
            failed.len()
        );

        SyncOutcome {
            success,
            message,
            transferred,
            failed,
        }
    }

    /// 带重试的单文件传输
    async fn transfer_with_retry(&self, entry: &DiffEntry) -> Result<u64, TransferError> {
        let max_retries = self.config.max_retries;
        let mut attempt = 0u32;

        loop {
            match self.transfer_one(entry).await {
                Ok(bytes) => return Ok(bytes),
                // 资源不存在不会因重试而改变
                Err(e @ TransferError::NotFound(_)) => return Err(e),
                Err(e) if attempt < max_retries => {
                    let delay = backoff_delay(self.config.retry_base_delay_ms, attempt);
                    warn!(
                        "传输失败，{}ms 后重试 ({}/{}): {} - {}",
                        delay,
                        attempt + 1,
                        max_retries,
                        entry.relative_path,
                        e
                    );
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn transfer_one(&self, entry: &DiffEntry) -> Result<u64, TransferError> {
        let url = build_url(&self.base_url, &entry.relative_path);
        let destination = self.local_root.join(&entry.relative_path);

        debug!("下载: {} -> {}", url, destination.display());
        let bytes = self.downloader.fetch_to_file(&url, &destination).await?;

        if self.verifies_digests() {
            self.verify(entry, &destination).await?;
        }

        Ok(bytes)
    }

    /// 校验下载结果，不一致时删除文件
    async fn verify(&self, entry: &DiffEntry, destination: &Path) -> Result<(), TransferError> {
        let Some(verification) = &self.verification else {
            return Ok(());
        };
        let Some(expected) = verification.remote.get(&entry.relative_path) else {
            return Ok(());
        };

        let hasher = verification.hasher;
        let path = destination.to_path_buf();
        let actual = tokio::task::spawn_blocking(move || hasher.digest_file(&path))
            .await
            .map_err(|_| TransferError::Aborted)?
            .map_err(|e| TransferError::Io {
                path: destination.to_path_buf(),
                source: e,
            })?;

        if actual != expected.digest() {
            let _ = tokio::fs::remove_file(destination).await;
            return Err(TransferError::DigestMismatch {
                path: entry.relative_path.clone(),
                expected: expected.digest().to_string(),
                actual,
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::comparator::DiffKind;
    use crate::core::snapshot::FileRecord;
    use async_trait::async_trait;
    use bytes::Bytes;
    use futures::StreamExt;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// 内存中的下载器：按 URL 返回内容，未登记的 URL 视为网络错误
    struct MockDownloader {
        files: HashMap<String, Vec<u8>>,
        /// 每个 URL 的延迟（毫秒），用于打乱完成顺序
        delays: HashMap<String, u64>,
        calls: Mutex<Vec<String>>,
        failures_before_success: AtomicUsize,
        /// 请求这些 URL 时任务直接 panic
        panics: HashSet<String>,
    }

    impl MockDownloader {
        fn new(files: &[(&str, &[u8])]) -> Self {
            Self {
                files: files
                    .iter()
                    .map(|(p, d)| (build_url(BASE, p), d.to_vec()))
                    .collect(),
                delays: HashMap::new(),
                calls: Mutex::new(Vec::new()),
                failures_before_success: AtomicUsize::new(0),
                panics: HashSet::new(),
            }
        }

        fn with_panic(mut self, path: &str) -> Self {
            self.panics.insert(build_url(BASE, path));
            self
        }

        fn with_delay(mut self, path: &str, ms: u64) -> Self {
            self.delays.insert(build_url(BASE, path), ms);
            self
        }

        fn calls(&self) -> Vec<String> {
            let mut calls = self.calls.lock().unwrap().clone();
            calls.sort();
            calls
        }
    }

    #[async_trait]
    impl Downloader for MockDownloader {
        async fn fetch_to_file(&self, url: &str, destination: &Path) -> Result<u64, TransferError> {
            self.calls.lock().unwrap().push(url.to_string());
            if let Some(ms) = self.delays.get(url) {
                tokio::time::sleep(Duration::from_millis(*ms)).await;
            }
            if self.panics.contains(url) {
                panic!("downloader crashed on {url}");
            }
            if self
                .failures_before_success
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(TransferError::Request("connection reset".to_string()));
            }
            let data = self
                .files
                .get(url)
                .ok_or_else(|| TransferError::Request(format!("unreachable: {url}")))?;
            crate::transport::ensure_parent(destination).await?;
            tokio::fs::write(destination, data).await.unwrap();
            Ok(data.len() as u64)
        }

        async fn fetch_bytes(&self, url: &str) -> Result<Bytes, TransferError> {
            self.files
                .get(url)
                .map(|d| Bytes::from(d.clone()))
                .ok_or_else(|| TransferError::NotFound(url.to_string()))
        }

        fn name(&self) -> &str {
            "mock"
        }
    }

    const BASE: &str = "http://server";

    fn entry(path: &str, kind: DiffKind) -> DiffEntry {
        DiffEntry {
            relative_path: path.to_string(),
            size: 1,
            kind,
        }
    }

    fn quick_config() -> TransferConfig {
        TransferConfig {
            max_concurrent_transfers: 4,
            max_retries: 0,
            retry_base_delay_ms: 1,
            verify_digest: false,
        }
    }

    fn coordinator(downloader: Arc<MockDownloader>, root: &Path) -> TransferCoordinator {
        TransferCoordinator::new(downloader, BASE, root, quick_config())
    }

    #[tokio::test]
    async fn test_empty_entries_succeed_immediately() {
        let dir = TempDir::new().unwrap();
        let downloader = Arc::new(MockDownloader::new(&[]));
        let outcome = coordinator(downloader.clone(), dir.path())
            .transfer_all(&[entry("gone.txt", DiffKind::Delete)])
            .await;

        assert!(outcome.success);
        assert!(outcome.transferred.is_empty());
        assert!(downloader.calls().is_empty());
    }

    #[tokio::test]
    async fn test_all_succeed_in_any_order() {
        let dir = TempDir::new().unwrap();
        let downloader = Arc::new(
            MockDownloader::new(&[("a.txt", b"a"), ("b/c.txt", b"c"), ("d.txt", b"d")])
                .with_delay("a.txt", 30)
                .with_delay("b/c.txt", 10),
        );

        let outcome = coordinator(downloader.clone(), dir.path())
            .transfer_all(&[
                entry("a.txt", DiffKind::Create),
                entry("b/c.txt", DiffKind::Update),
                entry("d.txt", DiffKind::Create),
                entry("old.txt", DiffKind::Delete),
            ])
            .await;

        assert!(outcome.success, "{}", outcome.message);
        assert_eq!(outcome.transferred, vec!["a.txt", "b/c.txt", "d.txt"]);
        assert!(outcome.failed.is_empty());
        assert_eq!(std::fs::read(dir.path().join("b/c.txt")).unwrap(), b"c");
        assert_eq!(downloader.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_failure_is_isolated() {
        let dir = TempDir::new().unwrap();
        let downloader = Arc::new(
            MockDownloader::new(&[("a.txt", b"a"), ("c.txt", b"c")]).with_delay("c.txt", 20),
        );

        let outcome = coordinator(downloader, dir.path())
            .transfer_all(&[
                entry("a.txt", DiffKind::Create),
                entry("broken.txt", DiffKind::Create),
                entry("c.txt", DiffKind::Create),
            ])
            .await;

        assert!(!outcome.success);
        assert_eq!(outcome.transferred, vec!["a.txt", "c.txt"]);
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(outcome.failed[0].0, "broken.txt");
        // 失败不会取消其他任务
        assert!(dir.path().join("c.txt").exists());
    }

    #[tokio::test]
    async fn test_duplicate_entries_transfer_once() {
        let dir = TempDir::new().unwrap();
        let downloader = Arc::new(MockDownloader::new(&[("a.txt", b"a")]));

        let outcome = coordinator(downloader.clone(), dir.path())
            .transfer_all(&[entry("a.txt", DiffKind::Create), entry("a.txt", DiffKind::Update)])
            .await;

        assert!(outcome.success);
        assert_eq!(outcome.transferred, vec!["a.txt"]);
        assert_eq!(downloader.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_retry_recovers_transient_failure() {
        let dir = TempDir::new().unwrap();
        let downloader = Arc::new(MockDownloader::new(&[("a.txt", b"a")]));
        downloader.failures_before_success.store(2, Ordering::SeqCst);

        let config = TransferConfig {
            max_retries: 2,
            ..quick_config()
        };
        let outcome = TransferCoordinator::new(downloader.clone(), BASE, dir.path(), config)
            .transfer_all(&[entry("a.txt", DiffKind::Create)])
            .await;

        assert!(outcome.success, "{}", outcome.message);
        assert_eq!(downloader.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_panicking_task_is_reported_as_aborted() {
        let dir = TempDir::new().unwrap();
        let downloader = Arc::new(
            MockDownloader::new(&[("boom.txt", b"x"), ("ok.txt", b"ok")])
                .with_panic("boom.txt")
                .with_delay("ok.txt", 20),
        );

        let outcome = coordinator(downloader, dir.path())
            .transfer_all(&[entry("boom.txt", DiffKind::Create), entry("ok.txt", DiffKind::Create)])
            .await;

        assert!(!outcome.success);
        assert_eq!(outcome.transferred, vec!["ok.txt"]);
        assert_eq!(
            outcome.failed,
            vec![("boom.txt".to_string(), TransferError::Aborted.to_string())]
        );
        assert!(dir.path().join("ok.txt").exists());
    }

    #[test]
    fn test_backoff_delay_is_capped() {
        assert_eq!(backoff_delay(500, 0), 500);
        assert_eq!(backoff_delay(500, 3), 4_000);
        assert_eq!(backoff_delay(500, 10), MAX_RETRY_DELAY_MS);
        // 指数或乘法溢出时不会 panic
        assert_eq!(backoff_delay(500, 64), MAX_RETRY_DELAY_MS);
        assert_eq!(backoff_delay(u64::MAX, 100), MAX_RETRY_DELAY_MS);
        assert_eq!(backoff_delay(0, 100), 0);
    }

    #[tokio::test]
    async fn test_verify_without_snapshot_is_skipped() {
        let dir = TempDir::new().unwrap();
        let hasher = ContentHasher::default();
        let downloader = Arc::new(MockDownloader::new(&[("a.txt", b"tampered")]));
        let config = TransferConfig {
            verify_digest: true,
            ..quick_config()
        };

        let unverified = TransferCoordinator::new(downloader.clone(), BASE, dir.path(), config.clone());
        assert!(!unverified.verifies_digests());
        let outcome = unverified
            .transfer_all(&[entry("a.txt", DiffKind::Create)])
            .await;
        assert!(outcome.success, "{}", outcome.message);

        let remote: TreeSnapshot = [FileRecord::new("a.txt", 8, hasher.digest(b"original")).unwrap()]
            .into_iter()
            .collect();
        let verified = unverified.with_verification(hasher, Arc::new(remote));
        assert!(verified.verifies_digests());
        let outcome = verified.transfer_all(&[entry("a.txt", DiffKind::Create)]).await;
        assert!(!outcome.success);

        let disabled = TransferCoordinator::new(downloader, BASE, dir.path(), quick_config())
            .with_verification(hasher, Arc::new(TreeSnapshot::new()));
        assert!(!disabled.verifies_digests());
    }

    #[tokio::test]
    async fn test_digest_mismatch_fails_and_removes_file() {
        let dir = TempDir::new().unwrap();
        let hasher = ContentHasher::default();
        let downloader = Arc::new(MockDownloader::new(&[("a.txt", b"tampered"), ("b.txt", b"b")]));

        let remote: TreeSnapshot = [
            FileRecord::new("a.txt", 8, hasher.digest(b"original")).unwrap(),
            FileRecord::new("b.txt", 1, hasher.digest(b"b")).unwrap(),
        ]
        .into_iter()
        .collect();

        let config = TransferConfig {
            verify_digest: true,
            ..quick_config()
        };
        let outcome = TransferCoordinator::new(downloader, BASE, dir.path(), config)
            .with_verification(hasher, Arc::new(remote))
            .transfer_all(&[entry("a.txt", DiffKind::Create), entry("b.txt", DiffKind::Create)])
            .await;

        assert!(!outcome.success);
        assert_eq!(outcome.transferred, vec!["b.txt"]);
        assert_eq!(outcome.failed[0].0, "a.txt");
        assert!(!dir.path().join("a.txt").exists());
    }

    #[tokio::test]
    async fn test_stream_reports_each_item_then_finished() {
        let dir = TempDir::new().unwrap();
        let downloader = Arc::new(MockDownloader::new(&[("a.txt", b"a"), ("b.txt", b"bb")]));

        let events: Vec<_> = coordinator(downloader, dir.path())
            .transfer_stream(vec![
                entry("a.txt", DiffKind::Create),
                entry("b.txt", DiffKind::Create),
                entry("missing.txt", DiffKind::Create),
            ])
            .collect()
            .await;

        assert_eq!(events.len(), 4);
        let completed = events
            .iter()
            .filter(|e| matches!(e, TransferProgress::Completed { .. }))
            .count();
        assert_eq!(completed, 2);

        match events.last().unwrap() {
            TransferProgress::Finished(outcome) => {
                assert!(!outcome.success);
                assert_eq!(outcome.failed[0].0, "missing.txt");
            }
            other => panic!("unexpected last event: {other:?}"),
        }
    }
}
