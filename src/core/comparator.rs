use crate::core::snapshot::TreeSnapshot;
use serde::Serialize;

/// 差异类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DiffKind {
    /// 远程有，本地没有
    Create,
    /// 两边都有但摘要不同
    Update,
    /// 本地有，远程没有
    Delete,
}

/// 单条差异
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffEntry {
    pub relative_path: String,
    /// Create/Update 为远程大小，Delete 为本地大小
    pub size: u64,
    pub kind: DiffKind,
}

impl DiffEntry {
    /// 是否需要下载
    pub fn needs_transfer(&self) -> bool {
        matches!(self.kind, DiffKind::Create | DiffKind::Update)
    }
}

/// 按路径排序的差异集合，同一路径最多出现一次
pub type DiffSet = Vec<DiffEntry>;

/// 比较本地快照与远程快照
pub fn diff(local: &TreeSnapshot, remote: &TreeSnapshot) -> DiffSet {
    let mut entries = Vec::new();

    for remote_file in remote.iter() {
        let path = remote_file.relative_path();
        match local.get(path) {
            None => entries.push(DiffEntry {
                relative_path: path.to_string(),
                size: remote_file.size(),
                kind: DiffKind::Create,
            }),
            Some(local_file) if local_file.digest() != remote_file.digest() => {
                entries.push(DiffEntry {
                    relative_path: path.to_string(),
                    size: remote_file.size(),
                    kind: DiffKind::Update,
                })
            }
            Some(_) => {}
        }
    }

    for local_file in local.iter() {
        if !remote.contains(local_file.relative_path()) {
            entries.push(DiffEntry {
                relative_path: local_file.relative_path().to_string(),
                size: local_file.size(),
                kind: DiffKind::Delete,
            });
        }
    }

    // 按路径排序，确保结果稳定
    entries.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    entries
}

/// 差异统计
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffSummary {
    pub create_count: usize,
    pub update_count: usize,
    pub delete_count: usize,
    pub transfer_bytes: u64,
}

impl DiffSummary {
    pub fn from_entries(entries: &[DiffEntry]) -> Self {
        let mut summary = DiffSummary::default();

        for entry in entries {
            match entry.kind {
                DiffKind::Create => summary.create_count += 1,
                DiffKind::Update => summary.update_count += 1,
                DiffKind::Delete => summary.delete_count += 1,
            }
            if entry.needs_transfer() {
                summary.transfer_bytes += entry.size;
            }
        }

        summary
    }

    pub fn transfer_count(&self) -> usize {
        self.create_count + self.update_count
    }

    pub fn is_empty(&self) -> bool {
        self.transfer_count() + self.delete_count == 0
    }
}
