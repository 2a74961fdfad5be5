use crate::core::snapshot::{is_ancestor, DirectorySnapshot};
use crate::storage::{EntryKind, FileEntry};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use tracing::{debug, warn};

/// 同步动作
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SyncOperation {
    /// 上传本地文件到远程同一相对路径
    Upload { path: String, size: u64 },
    /// 删除远程条目
    Remove { path: String, kind: EntryKind },
    /// 创建远程目录（其内容的操作都排在它之后）
    EnterDir { path: String },
}

impl SyncOperation {
    pub fn path(&self) -> &str {
        match self {
            SyncOperation::Upload { path, .. } => path,
            SyncOperation::Remove { path, .. } => path,
            SyncOperation::EnterDir { path } => path,
        }
    }

    pub fn is_removal(&self) -> bool {
        matches!(self, SyncOperation::Remove { .. })
    }

    pub fn upload(path: impl Into<String>, size: u64) -> Self {
        SyncOperation::Upload {
            path: path.into(),
            size,
        }
    }

    pub fn remove_file(path: impl Into<String>) -> Self {
        SyncOperation::Remove {
            path: path.into(),
            kind: EntryKind::File,
        }
    }

    pub fn remove_dir(path: impl Into<String>) -> Self {
        SyncOperation::Remove {
            path: path.into(),
            kind: EntryKind::Directory,
        }
    }

    pub fn enter_dir(path: impl Into<String>) -> Self {
        SyncOperation::EnterDir { path: path.into() }
    }

    fn removal_of(entry: &FileEntry) -> Self {
        SyncOperation::Remove {
            path: entry.path.clone(),
            kind: entry.kind,
        }
    }
}

impl fmt::Display for SyncOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncOperation::Upload { path, size } => write!(f, "上传 {} ({} 字节)", path, size),
            SyncOperation::Remove { path, kind } if kind.is_dir() => write!(f, "删除目录 {}", path),
            SyncOperation::Remove { path, .. } => write!(f, "删除 {}", path),
            SyncOperation::EnterDir { path } => write!(f, "创建目录 {}", path),
        }
    }
}

/// 同步计划：按执行顺序排列的动作
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncPlan {
    pub operations: Vec<SyncOperation>,
}

impl SyncPlan {
    pub fn new(operations: Vec<SyncOperation>) -> Self {
        Self { operations }
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SyncOperation> {
        self.operations.iter()
    }

    /// 统计同步动作
    pub fn summary(&self) -> PlanSummary {
        let mut summary = PlanSummary::default();
        for op in &self.operations {
            match op {
                SyncOperation::Upload { size, .. } => {
                    summary.upload_count += 1;
                    summary.upload_bytes += size;
                }
                SyncOperation::EnterDir { .. } => summary.dir_count += 1,
                SyncOperation::Remove { .. } => summary.remove_count += 1,
            }
        }
        summary
    }
}

/// 动作统计
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlanSummary {
    pub dir_count: usize,
    pub upload_count: usize,
    pub upload_bytes: u64,
    pub remove_count: usize,
}

impl PlanSummary {
    pub fn total_operations(&self) -> usize {
        self.dir_count + self.upload_count + self.remove_count
    }
}

/// 文件比较结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileRelation {
    /// 文件相同
    Equal,
    /// 本地文件更新
    SourceNewer,
    /// 远程文件更新（单向同步时保留远程）
    DestNewer,
    /// 不同（大小不同）
    Different,
}

/// 比较配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompareConfig {
    /// 时间容差（秒），本地时间超过远程时间该值以上才视为更新
    #[serde(default)]
    pub time_tolerance_seconds: i64,
    /// 是否忽略文件时间（仅比较大小）
    #[serde(default)]
    pub ignore_mtime: bool,
    /// 是否删除远程多余的条目（关闭后为备份模式）
    #[serde(default = "default_delete_extraneous")]
    pub delete_extraneous: bool,
}

fn default_delete_extraneous() -> bool {
    true
}

impl Default for CompareConfig {
    fn default() -> Self {
        Self {
            time_tolerance_seconds: 0,
            ignore_mtime: false,
            delete_extraneous: default_delete_extraneous(),
        }
    }
}

/// 文件比较器
pub struct FileComparator {
    config: CompareConfig,
}

impl FileComparator {
    pub fn new() -> Self {
        Self::with_config(CompareConfig::default())
    }

    pub fn with_config(config: CompareConfig) -> Self {
        Self { config }
    }

    /// 比较两个文件，大小不同优先于时间
    pub fn compare_files(&self, source: &FileEntry, dest: &FileEntry) -> FileRelation {
        if source.size != dest.size {
            debug!(
                "文件大小不同: {} (src={}, dst={})",
                source.path, source.size, dest.size
            );
            return FileRelation::Different;
        }

        if self.config.ignore_mtime {
            return FileRelation::Equal;
        }

        let time_diff = source.modified_time - dest.modified_time;
        if time_diff > self.config.time_tolerance_seconds {
            debug!(
                "本地文件更新: {} (src_time={}, dst_time={}, diff={}s)",
                source.path, source.modified_time, dest.modified_time, time_diff
            );
            FileRelation::SourceNewer
        } else if time_diff < 0 {
            FileRelation::DestNewer
        } else {
            FileRelation::Equal
        }
    }

    /// 比较本地与远程快照，生成同步计划
    ///
    /// 先按先序输出目录创建和上传（类型冲突时先内联删除远程条目），
    /// 再按后序输出远程多余条目的删除。
    pub fn diff(&self, local: &DirectorySnapshot, remote: &DirectorySnapshot) -> SyncPlan {
        let mut operations = Vec::new();
        // 已经安排删除的远程路径（查找键）
        let mut removed: HashSet<String> = HashSet::new();
        // 远程不存在或被替换的目录，其内容无需再与远程比较
        let mut fresh_dirs: Vec<String> = Vec::new();

        for entry in local.preorder() {
            let key = remote.key_for(&entry.path);
            let under_fresh_dir = fresh_dirs.iter().any(|dir| is_ancestor(dir, &key));

            let counterpart = if under_fresh_dir {
                None
            } else {
                remote.get(&entry.path)
            };

            match (entry.kind, counterpart) {
                (EntryKind::Directory, Some(dst)) if dst.is_dir() => {}
                (EntryKind::Directory, other) => {
                    if let Some(dst) = other {
                        // 远程同名文件，先删除
                        operations.push(SyncOperation::removal_of(dst));
                        removed.insert(key.clone());
                    }
                    operations.push(SyncOperation::enter_dir(entry.path.clone()));
                    fresh_dirs.push(key);
                }
                (EntryKind::File, Some(dst)) if dst.is_dir() => {
                    // 远程同名目录，先删除其整个子树
                    for child in remote.descendants_postorder(&dst.path) {
                        operations.push(SyncOperation::removal_of(child));
                        removed.insert(remote.key_for(&child.path));
                    }
                    operations.push(SyncOperation::removal_of(dst));
                    removed.insert(key);
                    operations.push(SyncOperation::upload(entry.path.clone(), entry.size));
                }
                (EntryKind::File, Some(dst)) => match self.compare_files(entry, dst) {
                    FileRelation::Equal | FileRelation::DestNewer => {}
                    FileRelation::SourceNewer | FileRelation::Different => {
                        operations.push(SyncOperation::upload(entry.path.clone(), entry.size));
                    }
                },
                (EntryKind::File, None) => {
                    operations.push(SyncOperation::upload(entry.path.clone(), entry.size));
                }
            }
        }

        if self.config.delete_extraneous {
            for entry in remote.postorder() {
                let key = remote.key_for(&entry.path);
                if removed.contains(&key) || local.contains(&entry.path) {
                    continue;
                }
                if local.is_unreadable(&entry.path) {
                    warn!("本地无法读取，保留远程条目: {}", entry.path);
                    continue;
                }
                if entry.is_dir() && remote.is_retained(&entry.path) {
                    debug!("远程目录含有被排除的条目，保留: {}", entry.path);
                    continue;
                }
                operations.push(SyncOperation::removal_of(entry));
            }
        }

        let plan = SyncPlan::new(operations);
        let summary = plan.summary();
        debug!(
            "比较完成: {} 个操作, {} 个目录, {} 个上传 ({} 字节), {} 个删除",
            plan.len(),
            summary.dir_count,
            summary.upload_count,
            summary.upload_bytes,
            summary.remove_count
        );
        plan
    }
}

impl Default for FileComparator {
    fn default() -> Self {
        Self::new()
    }
}
