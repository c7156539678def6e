//! 文件树快照

use serde::Serialize;
use std::collections::BTreeMap;

/// 单个文件的记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileRecord {
    relative_path: String,
    size: u64,
    digest: String,
}

impl FileRecord {
    /// 创建记录，路径会被规范化为以 `/` 分隔的相对路径
    pub fn new(
        relative_path: &str,
        size: u64,
        digest: impl Into<String>,
    ) -> Result<Self, &'static str> {
        Ok(Self {
            relative_path: normalize_relative_path(relative_path)?,
            size,
            digest: digest.into(),
        })
    }

    /// 由本地文件系统的路径分量创建记录
    ///
    /// 分量原样以 `/` 连接，不做反斜杠或盘符的改写。
    pub fn from_components<I, S>(
        components: I,
        size: u64,
        digest: impl Into<String>,
    ) -> Result<Self, &'static str>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut segments = Vec::new();
        for component in components {
            let segment = component.as_ref();
            match segment {
                "" | "." => return Err("路径分量为空"),
                ".." => return Err("不能包含 `..`"),
                s if s.contains('/') => return Err("路径分量不能包含 `/`"),
                s => segments.push(s.to_string()),
            }
        }

        if segments.is_empty() {
            return Err("路径为空");
        }

        Ok(Self {
            relative_path: segments.join("/"),
            size,
            digest: digest.into(),
        })
    }

    pub fn relative_path(&self) -> &str {
        &self.relative_path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }
}

/// 某一时刻的文件树：相对路径 -> 文件记录
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TreeSnapshot {
    files: BTreeMap<String, FileRecord>,
}

impl TreeSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// 插入记录，同一路径后插入的覆盖先前的
    pub fn insert(&mut self, record: FileRecord) -> Option<FileRecord> {
        self.files.insert(record.relative_path.clone(), record)
    }

    pub fn get(&self, path: &str) -> Option<&FileRecord> {
        self.files.get(path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.files.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// 按路径顺序遍历
    pub fn iter(&self) -> impl Iterator<Item = &FileRecord> {
        self.files.values()
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(String::as_str)
    }

    pub fn total_size(&self) -> u64 {
        self.files.values().map(|r| r.size).sum()
    }
}

impl FromIterator<FileRecord> for TreeSnapshot {
    fn from_iter<I: IntoIterator<Item = FileRecord>>(iter: I) -> Self {
        let mut snapshot = TreeSnapshot::new();
        for record in iter {
            snapshot.insert(record);
        }
        snapshot
    }
}

/// 规范化相对路径：统一使用 `/`，去掉开头的 `/` 和 `.` 段
///
/// 空路径、绝对路径（盘符）以及包含 `..` 的路径会被拒绝。
pub fn normalize_relative_path(path: &str) -> Result<String, &'static str> {
    let unified = path.replace('\\', "/");

    let bytes = unified.as_bytes();
    if bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' {
        return Err("不能是绝对路径");
    }

    let mut segments = Vec::new();
    for segment in unified.split('/') {
        match segment {
            "" | "." => continue,
            ".." => return Err("不能包含 `..`"),
            s => segments.push(s),
        }
    }

    if segments.is_empty() {
        return Err("路径为空");
    }

    Ok(segments.join("/"))
}
