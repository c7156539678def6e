use crate::core::hasher::ContentHasher;
use crate::core::snapshot::{FileRecord, TreeSnapshot};
use crate::error::{ConfigError, ScanError};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

/// 文件扫描器配置
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// 是否跟随符号链接（跟随时由 walkdir 检测循环）
    pub follow_links: bool,
    /// 最大递归深度
    pub max_depth: usize,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            follow_links: false,
            max_depth: 64,
        }
    }
}

/// 本地文件树扫描器
#[derive(Debug, Clone)]
pub struct LocalTreeScanner {
    root: PathBuf,
    hasher: ContentHasher,
    config: ScanConfig,
}

impl LocalTreeScanner {
    /// 创建扫描器，根目录必须已存在且是目录
    pub fn new(root: impl Into<PathBuf>, hasher: ContentHasher) -> Result<Self, ConfigError> {
        Self::with_config(root, hasher, ScanConfig::default())
    }

    pub fn with_config(
        root: impl Into<PathBuf>,
        hasher: ContentHasher,
        config: ScanConfig,
    ) -> Result<Self, ConfigError> {
        let root = root.into();
        if !root.exists() {
            return Err(ConfigError::RootMissing(root));
        }
        if !root.is_dir() {
            return Err(ConfigError::RootNotDirectory(root));
        }
        Ok(Self {
            root,
            hasher,
            config,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// 扫描根目录，返回全新的快照
    ///
    /// 任何无法读取的条目都会使扫描失败，不会被静默跳过。
    pub async fn scan(&self) -> Result<TreeSnapshot, ScanError> {
        info!("开始扫描本地目录: {}", self.root.display());

        // 使用 spawn_blocking 避免阻塞 async runtime
        let scanner = self.clone();
        let snapshot = tokio::task::spawn_blocking(move || scanner.scan_blocking()).await??;

        info!(
            "扫描完成: {} 个文件, 共 {} 字节",
            snapshot.len(),
            snapshot.total_size()
        );
        Ok(snapshot)
    }

    fn scan_blocking(&self) -> Result<TreeSnapshot, ScanError> {
        let mut snapshot = TreeSnapshot::new();

        let walker = WalkDir::new(&self.root)
            .follow_links(self.config.follow_links)
            .max_depth(self.config.max_depth)
            .sort_by_file_name();

        for entry in walker {
            let entry = entry.map_err(|e| ScanError::Walk {
                path: e.path().map_or_else(|| self.root.clone(), Path::to_path_buf),
                source: e,
            })?;

            // 目录本身不产生记录，未跟随的符号链接也不是普通文件
            if !entry.file_type().is_file() {
                continue;
            }

            let path = entry.path();
            let components = self.relative_components(path)?;
            let size = entry
                .metadata()
                .map_err(|e| ScanError::Walk {
                    path: path.to_path_buf(),
                    source: e,
                })?
                .len();
            let digest = self.hasher.digest_file(path).map_err(|e| ScanError::Io {
                path: path.to_path_buf(),
                source: e,
            })?;

            let record = FileRecord::from_components(components, size, digest)
                .map_err(|_| ScanError::InvalidPath(path.to_path_buf()))?;
            debug!("扫描文件: {} ({} 字节)", record.relative_path(), size);
            snapshot.insert(record);
        }

        Ok(snapshot)
    }

    /// 相对于根目录的路径分量，文件名原样保留
    fn relative_components<'a>(&self, path: &'a Path) -> Result<Vec<&'a str>, ScanError> {
        let relative = path
            .strip_prefix(&self.root)
            .map_err(|_| ScanError::InvalidPath(path.to_path_buf()))?;

        let mut segments = Vec::new();
        for component in relative.components() {
            let segment = component
                .as_os_str()
                .to_str()
                .ok_or_else(|| ScanError::InvalidPath(path.to_path_buf()))?;
            segments.push(segment);
        }
        Ok(segments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_scan_nested_directories() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("sub/deeper")).unwrap();
        fs::create_dir_all(dir.path().join("empty")).unwrap();
        fs::write(dir.path().join("root.txt"), "root").unwrap();
        fs::write(dir.path().join("sub/deeper/leaf.txt"), "leaf!").unwrap();

        let hasher = ContentHasher::default();
        let scanner = LocalTreeScanner::new(dir.path(), hasher).unwrap();
        let snapshot = scanner.scan().await.unwrap();

        let paths: Vec<_> = snapshot.paths().collect();
        assert_eq!(paths, vec!["root.txt", "sub/deeper/leaf.txt"]);

        let leaf = snapshot.get("sub/deeper/leaf.txt").unwrap();
        assert_eq!(leaf.size(), 5);
        assert_eq!(leaf.digest(), hasher.digest(b"leaf!"));
    }

    #[tokio::test]
    async fn test_scan_empty_file() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("empty.txt"), "").unwrap();

        let hasher = ContentHasher::default();
        let snapshot = LocalTreeScanner::new(dir.path(), hasher)
            .unwrap()
            .scan()
            .await
            .unwrap();

        let record = snapshot.get("empty.txt").unwrap();
        assert_eq!(record.size(), 0);
        assert_eq!(record.digest(), hasher.digest(b""));
    }

    #[test]
    fn test_invalid_root() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("file.txt");
        fs::write(&file, "x").unwrap();

        assert!(matches!(
            LocalTreeScanner::new(dir.path().join("missing"), ContentHasher::default()),
            Err(ConfigError::RootMissing(_))
        ));
        assert!(matches!(
            LocalTreeScanner::new(&file, ContentHasher::default()),
            Err(ConfigError::RootNotDirectory(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlink_loop_is_bounded() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("a")).unwrap();
        fs::write(dir.path().join("a/file.txt"), "x").unwrap();
        std::os::unix::fs::symlink(dir.path(), dir.path().join("a/loop")).unwrap();

        // 默认不跟随链接，链接本身不产生记录
        let snapshot = LocalTreeScanner::new(dir.path(), ContentHasher::default())
            .unwrap()
            .scan()
            .await
            .unwrap();
        assert_eq!(snapshot.paths().collect::<Vec<_>>(), vec!["a/file.txt"]);

        // 跟随链接时循环被检测为错误
        let config = ScanConfig {
            follow_links: true,
            ..Default::default()
        };
        let result = LocalTreeScanner::with_config(dir.path(), ContentHasher::default(), config)
            .unwrap()
            .scan()
            .await;
        assert!(matches!(result, Err(ScanError::Walk { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_scan_keeps_unusual_file_names() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("c:notes.txt"), "notes").unwrap();
        fs::write(dir.path().join("a\\b.txt"), "slash").unwrap();

        let snapshot = LocalTreeScanner::new(dir.path(), ContentHasher::default())
            .unwrap()
            .scan()
            .await
            .unwrap();

        assert_eq!(
            snapshot.paths().collect::<Vec<_>>(),
            vec!["a\\b.txt", "c:notes.txt"]
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unreadable_file_fails_scan() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let locked = dir.path().join("locked.txt");
        fs::write(&locked, "secret").unwrap();
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();

        // root 用户无视权限位，此时无法构造失败场景
        if fs::read(&locked).is_ok() {
            return;
        }

        let result = LocalTreeScanner::new(dir.path(), ContentHasher::default())
            .unwrap()
            .scan()
            .await;
        match result {
            Err(ScanError::Io { path, .. }) => assert_eq!(path, locked),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
