//! 远程清单解析
//!
//! 清单在传输层解码为 [`ManifestRecord`] 序列，这里只负责把记录转换为
//! [`TreeSnapshot`]，不会访问文件系统。

use crate::core::snapshot::{FileRecord, TreeSnapshot};
use crate::error::ManifestError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// 清单中的一条原始记录，字段缺失在解析阶段报告
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ManifestRecord {
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub size: Option<Value>,
    #[serde(default)]
    pub md5: Option<String>,
}

impl ManifestRecord {
    pub fn new(path: &str, size: u64, digest: &str) -> Self {
        Self {
            path: Some(path.to_string()),
            size: Some(Value::from(size)),
            md5: Some(digest.to_string()),
        }
    }
}

/// 以路径为键的对象格式中的值
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum KeyedValue {
    /// 只有摘要：`{"<path>": "<digest>"}`
    Digest(String),
    Entry(KeyedEntry),
}

#[derive(Debug, Deserialize)]
struct KeyedEntry {
    #[serde(default)]
    size: Option<Value>,
    #[serde(default)]
    md5: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireManifest {
    List(Vec<ManifestRecord>),
    Keyed(BTreeMap<String, KeyedValue>),
}

/// 解码清单的 JSON 载荷
///
/// 支持三种格式：记录数组 `[{"path", "size", "md5"}]`，
/// 以路径为键的对象 `{"<path>": {"size", "md5"}}`，
/// 以及只有摘要的对象 `{"<path>": "<digest>"}`。
///
/// 只有摘要的条目没有大小信息，记为 0，只影响报告中的传输字节数。
pub fn decode_manifest(payload: &[u8]) -> Result<Vec<ManifestRecord>, ManifestError> {
    let wire: WireManifest =
        serde_json::from_slice(payload).map_err(|e| ManifestError::Decode(e.to_string()))?;

    Ok(match wire {
        WireManifest::List(records) => records,
        WireManifest::Keyed(map) => map
            .into_iter()
            .map(|(path, value)| match value {
                KeyedValue::Digest(digest) => ManifestRecord {
                    path: Some(path),
                    size: Some(Value::from(0u64)),
                    md5: Some(digest),
                },
                KeyedValue::Entry(entry) => ManifestRecord {
                    path: Some(path),
                    size: entry.size,
                    md5: entry.md5,
                },
            })
            .collect(),
    })
}

/// 清单存储：保存最近一次解析的远程快照
#[derive(Debug, Default)]
pub struct ManifestStore {
    snapshot: TreeSnapshot,
}

impl ManifestStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 解析记录并替换当前快照，重复路径以最后一次出现为准
    pub fn load(&mut self, records: &[ManifestRecord]) -> Result<&TreeSnapshot, ManifestError> {
        self.snapshot = Self::parse(records)?;
        Ok(&self.snapshot)
    }

    pub fn snapshot(&self) -> &TreeSnapshot {
        &self.snapshot
    }

    pub fn into_snapshot(self) -> TreeSnapshot {
        self.snapshot
    }

    /// 把原始记录转换为快照
    pub fn parse(records: &[ManifestRecord]) -> Result<TreeSnapshot, ManifestError> {
        let mut snapshot = TreeSnapshot::new();

        for (index, record) in records.iter().enumerate() {
            let path = record
                .path
                .as_deref()
                .ok_or(ManifestError::MissingField { index, field: "path" })?;
            let size = record
                .size
                .as_ref()
                .ok_or(ManifestError::MissingField { index, field: "size" })?;
            let digest = record
                .md5
                .as_deref()
                .ok_or(ManifestError::MissingField { index, field: "md5" })?;

            let size = parse_size(size).ok_or_else(|| ManifestError::InvalidSize {
                index,
                value: size.to_string(),
            })?;

            let record = FileRecord::new(path, size, digest).map_err(|reason| {
                ManifestError::InvalidPath {
                    index,
                    path: path.to_string(),
                    reason,
                }
            })?;

            if let Some(previous) = snapshot.insert(record) {
                warn!("清单中存在重复路径，使用后出现的记录: {}", previous.relative_path());
            }
        }

        debug!("解析清单完成: {} 条记录, {} 个文件", records.len(), snapshot.len());
        Ok(snapshot)
    }
}

/// size 必须是非负整数，也接受数字字符串
fn parse_size(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    }
}
