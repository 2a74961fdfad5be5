//! 目录快照
//!
//! 一次运行中某个根目录下所有条目的视图，键为规范化后的相对路径。

use crate::storage::FileEntry;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

/// 规范化相对路径：统一使用 `/`，去掉首尾分隔符、`.` 和重复的分隔符
pub fn normalize_path(path: &str) -> String {
    path.replace('\\', "/")
        .split('/')
        .filter(|part| !part.is_empty() && *part != ".")
        .collect::<Vec<_>>()
        .join("/")
}

/// 按路径分量比较，父目录排在子孙之前（先序）
pub fn preorder_cmp(a: &str, b: &str) -> Ordering {
    a.split('/').cmp(b.split('/'))
}

/// 按路径分量比较，子孙排在父目录之前（后序）
pub fn postorder_cmp(a: &str, b: &str) -> Ordering {
    let mut left = a.split('/');
    let mut right = b.split('/');
    loop {
        match (left.next(), right.next()) {
            (Some(x), Some(y)) if x == y => continue,
            (Some(x), Some(y)) => return x.cmp(y),
            // 较短的一方是祖先，排在后面
            (None, Some(_)) => return Ordering::Greater,
            (Some(_), None) => return Ordering::Less,
            (None, None) => return Ordering::Equal,
        }
    }
}

/// `ancestor` 是否是 `path` 的祖先目录（不含自身）
pub fn is_ancestor(ancestor: &str, path: &str) -> bool {
    path.len() > ancestor.len()
        && path.starts_with(ancestor)
        && path.as_bytes()[ancestor.len()] == b'/'
}

/// 两个路径相同或存在祖先/子孙关系
pub fn paths_related(a: &str, b: &str) -> bool {
    a == b || is_ancestor(a, b) || is_ancestor(b, a)
}

/// 父目录路径，根下条目返回 None
pub fn parent_path(path: &str) -> Option<&str> {
    path.rsplit_once('/').map(|(parent, _)| parent)
}

/// 目录快照
#[derive(Debug, Clone, Default)]
pub struct DirectorySnapshot {
    entries: BTreeMap<String, FileEntry>,
    case_sensitive: bool,
    /// 无法读取的路径（查找键），其内容未知
    unreadable: BTreeSet<String>,
    /// 含有被排除条目的目录（查找键），不能作为空目录删除
    retained: BTreeSet<String>,
}

impl DirectorySnapshot {
    pub fn new(case_sensitive: bool) -> Self {
        Self {
            entries: BTreeMap::new(),
            case_sensitive,
            unreadable: BTreeSet::new(),
            retained: BTreeSet::new(),
        }
    }

    /// 由条目列表构建，路径会被规范化
    pub fn from_entries(entries: impl IntoIterator<Item = FileEntry>, case_sensitive: bool) -> Self {
        let mut snapshot = Self::new(case_sensitive);
        for entry in entries {
            snapshot.insert(entry);
        }
        snapshot
    }

    /// 查找键：规范化路径，大小写不敏感时转小写
    pub fn key_for(&self, path: &str) -> String {
        let normalized = normalize_path(path);
        if self.case_sensitive {
            normalized
        } else {
            normalized.to_lowercase()
        }
    }

    /// 插入条目，空路径（根目录自身）被忽略
    pub fn insert(&mut self, mut entry: FileEntry) {
        entry.path = normalize_path(&entry.path);
        if entry.path.is_empty() {
            return;
        }
        let key = self.key_for(&entry.path);
        self.entries.insert(key, entry);
    }

    /// 记录一个无法读取的路径
    pub fn mark_unreadable(&mut self, path: &str) {
        let key = self.key_for(path);
        if !key.is_empty() {
            self.unreadable.insert(key);
        }
    }

    /// `path` 自身或其某个祖先无法读取
    pub fn is_unreadable(&self, path: &str) -> bool {
        let key = self.key_for(path);
        self.unreadable
            .iter()
            .any(|bad| *bad == key || is_ancestor(bad, &key))
    }

    pub fn unreadable_paths(&self) -> impl Iterator<Item = &String> {
        self.unreadable.iter()
    }

    /// 记录一个被排除的条目，保留它的所有祖先目录
    pub fn mark_excluded(&mut self, path: &str) {
        let key = self.key_for(path);
        let mut parent = parent_path(&key);
        while let Some(dir) = parent {
            self.retained.insert(dir.to_string());
            parent = parent_path(dir);
        }
    }

    /// 目录中是否有被排除的内容
    pub fn is_retained(&self, path: &str) -> bool {
        self.retained.contains(&self.key_for(path))
    }

    pub fn get(&self, path: &str) -> Option<&FileEntry> {
        self.entries.get(&self.key_for(path))
    }

    pub fn contains(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_case_sensitive(&self) -> bool {
        self.case_sensitive
    }

    pub fn iter(&self) -> impl Iterator<Item = &FileEntry> {
        self.entries.values()
    }

    /// 文件数和目录数
    pub fn counts(&self) -> (usize, usize) {
        let dirs = self.entries.values().filter(|e| e.is_dir()).count();
        (self.entries.len() - dirs, dirs)
    }

    /// 先序遍历：每个目录排在其内容之前
    pub fn preorder(&self) -> Vec<&FileEntry> {
        let mut entries: Vec<_> = self.entries.iter().collect();
        entries.sort_by(|(a, _), (b, _)| preorder_cmp(a, b));
        entries.into_iter().map(|(_, e)| e).collect()
    }

    /// 后序遍历：每个目录排在其内容之后
    pub fn postorder(&self) -> Vec<&FileEntry> {
        let mut entries: Vec<_> = self.entries.iter().collect();
        entries.sort_by(|(a, _), (b, _)| postorder_cmp(a, b));
        entries.into_iter().map(|(_, e)| e).collect()
    }

    /// `path` 之下的所有条目（后序，不含自身）
    pub fn descendants_postorder(&self, path: &str) -> Vec<&FileEntry> {
        let key = self.key_for(path);
        let mut entries: Vec<_> = self
            .entries
            .iter()
            .filter(|(k, _)| is_ancestor(&key, k))
            .collect();
        entries.sort_by(|(a, _), (b, _)| postorder_cmp(a, b));
        entries.into_iter().map(|(_, e)| e).collect()
    }
}
