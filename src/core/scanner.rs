use crate::core::snapshot::{normalize_path, DirectorySnapshot};
use crate::storage::{join_remote, scan_local_tree, FileEntry, Transport, TransportError};
use futures::stream::{self, StreamExt};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// 文件扫描器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanConfig {
    /// 排除规则（glob patterns），对本地和远程同时生效
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
    /// 路径比较是否区分大小写
    #[serde(default = "default_case_sensitive")]
    pub case_sensitive: bool,
}

fn default_case_sensitive() -> bool {
    true
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            exclude_patterns: Vec::new(),
            case_sensitive: default_case_sensitive(),
        }
    }
}

/// 远程扫描结果
#[derive(Debug, Clone)]
pub struct RemoteScan {
    pub snapshot: DirectorySnapshot,
    /// 远程根目录是否存在
    pub root_exists: bool,
}

/// 编译后的排除规则
#[derive(Debug, Clone, Default)]
struct ExcludeRules {
    /// 含 `/` 的规则匹配完整相对路径
    path_rules: Vec<Regex>,
    /// 其余规则只匹配文件名
    name_rules: Vec<Regex>,
}

impl ExcludeRules {
    fn new(patterns: &[String]) -> Self {
        let mut rules = Self::default();
        for pattern in patterns {
            let pattern = pattern.trim().trim_start_matches('/').to_lowercase();
            if pattern.is_empty() {
                continue;
            }
            let Some(re) = glob_to_regex(&pattern) else {
                warn!("忽略无效的排除规则: {}", pattern);
                continue;
            };
            if pattern.contains('/') {
                rules.path_rules.push(re);
            } else {
                rules.name_rules.push(re);
            }
        }
        rules
    }

    fn is_empty(&self) -> bool {
        self.path_rules.is_empty() && self.name_rules.is_empty()
    }

    fn matches(&self, relative_path: &str) -> bool {
        if self.is_empty() {
            return false;
        }
        let path = relative_path.to_lowercase();
        let name = path.rsplit('/').next().unwrap_or(&path);
        self.path_rules.iter().any(|re| re.is_match(&path))
            || self.name_rules.iter().any(|re| re.is_match(name))
    }
}

/// 简单的 glob 转正则：`**` 跨目录，`*` 和 `?` 不跨目录
fn glob_to_regex(pattern: &str) -> Option<Regex> {
    let mut out = String::from("^");
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' if chars.peek() == Some(&'*') => {
                chars.next();
                out.push_str(".*");
            }
            '*' => out.push_str("[^/]*"),
            '?' => out.push_str("[^/]"),
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }
    out.push('$');
    Regex::new(&out).ok()
}

/// 文件扫描器
pub struct FileScanner {
    max_concurrent: usize,
    config: ScanConfig,
    rules: ExcludeRules,
}

impl FileScanner {
    pub fn new(max_concurrent: usize) -> Self {
        Self::with_config(max_concurrent, ScanConfig::default())
    }

    pub fn with_config(max_concurrent: usize, config: ScanConfig) -> Self {
        let rules = ExcludeRules::new(&config.exclude_patterns);
        Self {
            max_concurrent: max_concurrent.max(1),
            config,
            rules,
        }
    }

    /// 检查路径是否应该被排除
    pub fn should_exclude(&self, path: &str) -> bool {
        self.rules.matches(path)
    }

    /// 扫描本地源目录
    pub async fn scan_local(&self, root: &Path) -> io::Result<DirectorySnapshot> {
        info!("开始扫描本地目录: {}", root.display());

        let rules = self.rules.clone();
        let tree = scan_local_tree(root, move |path| rules.matches(path)).await?;
        let mut snapshot = DirectorySnapshot::from_entries(tree.entries, self.config.case_sensitive);
        for path in &tree.unreadable {
            snapshot.mark_unreadable(path);
        }
        if !tree.unreadable.is_empty() {
            warn!(
                "{} 个本地条目无法读取，对应的远程内容将保留",
                tree.unreadable.len()
            );
        }

        let (files, dirs) = snapshot.counts();
        info!("本地扫描完成: {} 个文件, {} 个目录", files, dirs);
        Ok(snapshot)
    }

    /// 逐层列出远程目录，直到覆盖整个子树
    ///
    /// 根目录不存在时返回空快照并将 `root_exists` 置为 false。
    pub async fn scan_remote(
        &self,
        transport: Arc<dyn Transport>,
        root: &str,
    ) -> Result<RemoteScan, TransportError> {
        info!("开始扫描远程目录: {} {}", transport.name(), root);

        let mut snapshot = DirectorySnapshot::new(self.config.case_sensitive);

        let root_entries = match transport.list_dir(root).await {
            Ok(entries) => entries,
            Err(e) if e.is_not_found() => {
                info!("远程根目录不存在: {}", root);
                return Ok(RemoteScan {
                    snapshot,
                    root_exists: false,
                });
            }
            Err(e) => return Err(e),
        };

        let mut level = self.collect_level(&mut snapshot, "", root_entries);

        while !level.is_empty() {
            debug!("扫描远程目录层级: {} 个目录", level.len());

            let listings: Vec<_> = stream::iter(level)
                .map(|dir| {
                    let transport = transport.clone();
                    let remote_path = join_remote(root, &dir);
                    async move {
                        let result = transport.list_dir(&remote_path).await;
                        (dir, result)
                    }
                })
                .buffer_unordered(self.max_concurrent)
                .collect()
                .await;

            let mut next = Vec::new();
            for (dir, result) in listings {
                match result {
                    Ok(entries) => next.extend(self.collect_level(&mut snapshot, &dir, entries)),
                    Err(e) if e.is_not_found() => {
                        warn!("远程目录在扫描期间消失: {}", dir);
                    }
                    Err(e) => return Err(e),
                }
            }
            level = next;
        }

        let (files, dirs) = snapshot.counts();
        info!("远程扫描完成: {} 个文件, {} 个目录", files, dirs);

        Ok(RemoteScan {
            snapshot,
            root_exists: true,
        })
    }

    /// 把一层列表放入快照，返回需要继续进入的子目录
    fn collect_level(
        &self,
        snapshot: &mut DirectorySnapshot,
        parent: &str,
        entries: Vec<crate::storage::RemoteEntry>,
    ) -> Vec<String> {
        let mut subdirs = Vec::new();
        for entry in entries {
            if entry.name.is_empty() || entry.name == "." || entry.name == ".." {
                continue;
            }
            let path = normalize_path(&format!("{}/{}", parent, entry.name));
            if self.should_exclude(&path) {
                debug!("排除远程条目: {}", path);
                snapshot.mark_excluded(&path);
                continue;
            }
            if entry.kind.is_dir() {
                subdirs.push(path.clone());
            }
            snapshot.insert(FileEntry {
                path,
                kind: entry.kind,
                size: entry.size,
                modified_time: entry.modified_time,
                permissions: None,
            });
        }
        subdirs
    }
}

impl Default for FileScanner {
    fn default() -> Self {
        Self::new(8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::{FailOn, MemoryTransport};

    fn scanner_with(patterns: &[&str]) -> FileScanner {
        FileScanner::with_config(
            4,
            ScanConfig {
                exclude_patterns: patterns.iter().map(|s| s.to_string()).collect(),
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_exclude_patterns() {
        let scanner = scanner_with(&["*.tmp", ".git", "build/**", "Thumbs.db"]);
        assert!(scanner.should_exclude("a/b/file.TMP"));
        assert!(scanner.should_exclude(".git"));
        assert!(scanner.should_exclude("sub/.git"));
        assert!(scanner.should_exclude("build/out/x.o"));
        assert!(scanner.should_exclude("thumbs.db"));
        assert!(!scanner.should_exclude("build"));
        assert!(!scanner.should_exclude("src/main.rs"));
        assert!(!scanner.should_exclude("tmp"));
    }

    #[test]
    fn test_no_patterns_excludes_nothing() {
        assert!(!FileScanner::default().should_exclude("anything/at/all"));
    }

    #[tokio::test]
    async fn test_scan_remote_covers_subtree() {
        let transport = Arc::new(MemoryTransport::new());
        transport.insert_file("/r/a.txt", b"abc", 100);
        transport.insert_file("/r/sub/b.txt", b"x", 200);
        transport.insert_file("/r/sub/deeper/c.txt", b"yy", 300);
        transport.insert_file("/other/z.txt", b"z", 1);

        let scan = FileScanner::default()
            .scan_remote(transport.clone(), "/r")
            .await
            .unwrap();
        assert!(scan.root_exists);

        let paths: Vec<_> = scan.snapshot.preorder().iter().map(|e| e.path.clone()).collect();
        assert_eq!(
            paths,
            vec!["a.txt", "sub", "sub/b.txt", "sub/deeper", "sub/deeper/c.txt"]
        );
        let c = scan.snapshot.get("sub/deeper/c.txt").unwrap();
        assert_eq!(c.size, 2);
        assert_eq!(c.modified_time, 300);
    }

    #[tokio::test]
    async fn test_scan_remote_missing_root_is_empty() {
        let transport = Arc::new(MemoryTransport::new());
        let scan = FileScanner::default()
            .scan_remote(transport, "/fresh")
            .await
            .unwrap();
        assert!(!scan.root_exists);
        assert!(scan.snapshot.is_empty());
    }

    #[tokio::test]
    async fn test_scan_remote_skips_excluded_dirs() {
        let transport = Arc::new(MemoryTransport::new());
        transport.insert_file("/r/.git/HEAD", b"ref", 1);
        transport.insert_file("/r/keep.txt", b"k", 1);

        let scan = scanner_with(&[".git"])
            .scan_remote(transport, "/r")
            .await
            .unwrap();
        let paths: Vec<_> = scan.snapshot.iter().map(|e| e.path.clone()).collect();
        assert_eq!(paths, vec!["keep.txt"]);
    }

    #[tokio::test]
    async fn test_scan_remote_propagates_listing_failure() {
        let transport = Arc::new(MemoryTransport::new());
        transport.insert_file("/r/sub/b.txt", b"x", 1);
        transport.fail_on(FailOn::List, "/r/sub");

        let err = FileScanner::default()
            .scan_remote(transport, "/r")
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Operation { .. }));
    }

    #[tokio::test]
    async fn test_scan_remote_retains_dirs_with_excluded_content() {
        let transport = Arc::new(MemoryTransport::new());
        transport.insert_file("/r/old/x.tmp", b"t", 1);
        transport.insert_file("/r/old/y.txt", b"y", 1);

        let scan = scanner_with(&["*.tmp"])
            .scan_remote(transport, "/r")
            .await
            .unwrap();
        assert!(scan.snapshot.contains("old/y.txt"));
        assert!(!scan.snapshot.contains("old/x.tmp"));
        assert!(scan.snapshot.is_retained("old"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_scan_local_marks_unreadable_paths() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"a").unwrap();
        std::os::unix::fs::symlink(dir.path().join("gone"), dir.path().join("broken")).unwrap();

        let snapshot = FileScanner::default().scan_local(dir.path()).await.unwrap();
        assert!(snapshot.contains("a.txt"));
        assert!(snapshot.is_unreadable("broken"));
    }
}
