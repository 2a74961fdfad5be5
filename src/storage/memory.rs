//! 内存远程存储
//!
//! 用一棵内存中的目录树模拟 SFTP 服务器，可以对指定路径注入失败，
//! 用于测试同步引擎。

use super::{Connector, EntryKind, RemoteEntry, SessionConfig, Transport, TransportError};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// 内存中的节点
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryNode {
    pub kind: EntryKind,
    pub data: Vec<u8>,
    pub modified_time: i64,
    pub permissions: Option<u32>,
}

/// 可注入失败的操作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailOn {
    List,
    Upload,
    CreateDir,
    Remove,
    Permissions,
    Timestamp,
    /// 上传该路径时会话断开
    Disconnect,
}

#[derive(Debug, Default)]
struct MemoryState {
    nodes: BTreeMap<String, MemoryNode>,
    failures: HashSet<(FailOn, String)>,
    operations: Vec<String>,
}

/// 内存传输
#[derive(Debug, Default)]
pub struct MemoryTransport {
    state: Mutex<MemoryState>,
    closed: AtomicBool,
}

fn normalize(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}

fn parent_of(path: &str) -> Option<String> {
    if path == "/" {
        return None;
    }
    match path.rsplit_once('/') {
        Some(("", _)) => Some("/".to_string()),
        Some((parent, _)) => Some(parent.to_string()),
        None => None,
    }
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

impl MemoryState {
    fn is_dir(&self, path: &str) -> bool {
        path == "/"
            || self
                .nodes
                .get(path)
                .map(|n| n.kind.is_dir())
                .unwrap_or(false)
    }

    fn check(&self, op: FailOn, path: &str) -> Result<(), TransportError> {
        if self.failures.contains(&(op, path.to_string())) {
            return Err(TransportError::operation(path, format!("{:?} 注入失败", op)));
        }
        Ok(())
    }

    fn require_parent(&self, path: &str) -> Result<(), TransportError> {
        match parent_of(path) {
            Some(parent) if self.is_dir(&parent) => Ok(()),
            _ => Err(TransportError::operation(path, "父目录不存在")),
        }
    }

    fn insert_parents(&mut self, path: &str, modified_time: i64) {
        let mut parent = parent_of(path);
        while let Some(p) = parent {
            if p == "/" {
                break;
            }
            self.nodes.entry(p.clone()).or_insert(MemoryNode {
                kind: EntryKind::Directory,
                data: Vec::new(),
                modified_time,
                permissions: None,
            });
            parent = parent_of(&p);
        }
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        Ok(())
    }

    /// 放入一个文件（自动创建父目录）
    pub fn insert_file(&self, path: &str, data: &[u8], modified_time: i64) {
        let path = normalize(path);
        let mut state = self.state();
        state.insert_parents(&path, modified_time);
        state.nodes.insert(
            path,
            MemoryNode {
                kind: EntryKind::File,
                data: data.to_vec(),
                modified_time,
                permissions: None,
            },
        );
    }

    /// 放入一个目录（自动创建父目录）
    pub fn insert_dir(&self, path: &str, modified_time: i64) {
        let path = normalize(path);
        let mut state = self.state();
        state.insert_parents(&path, modified_time);
        state.nodes.insert(
            path,
            MemoryNode {
                kind: EntryKind::Directory,
                data: Vec::new(),
                modified_time,
                permissions: None,
            },
        );
    }

    /// 对某个路径的某类操作注入失败
    pub fn fail_on(&self, op: FailOn, path: &str) {
        self.state().failures.insert((op, normalize(path)));
    }

    pub fn node(&self, path: &str) -> Option<MemoryNode> {
        self.state().nodes.get(&normalize(path)).cloned()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.node(path).is_some()
    }

    /// 所有节点路径（排序）
    pub fn paths(&self) -> Vec<String> {
        self.state().nodes.keys().cloned().collect()
    }

    /// 已执行的写操作记录，形如 "put /r/a.txt"
    pub fn operations(&self) -> Vec<String> {
        self.state().operations.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// 重新打开已关闭的会话，树内容保持不变
    pub fn reopen(&self) {
        self.closed.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn list_dir(&self, path: &str) -> Result<Vec<RemoteEntry>, TransportError> {
        self.ensure_open()?;
        let path = normalize(path);
        let state = self.state();
        state.check(FailOn::List, &path)?;
        if !state.is_dir(&path) {
            return Err(TransportError::NotFound(path));
        }

        let entries = state
            .nodes
            .iter()
            .filter(|(p, _)| parent_of(p).as_deref() == Some(path.as_str()))
            .map(|(p, node)| RemoteEntry {
                name: p.rsplit('/').next().unwrap_or_default().to_string(),
                kind: node.kind,
                size: node.data.len() as u64,
                modified_time: node.modified_time,
            })
            .collect();
        Ok(entries)
    }

    async fn upload(&self, local_path: &Path, remote_path: &str) -> Result<u64, TransportError> {
        self.ensure_open()?;
        let path = normalize(remote_path);
        let data = tokio::fs::read(local_path)
            .await
            .map_err(|e| TransportError::operation(&path, e))?;

        let mut state = self.state();
        if state.failures.contains(&(FailOn::Disconnect, path.clone())) {
            self.closed.store(true, Ordering::SeqCst);
            return Err(TransportError::NotConnected);
        }
        state.check(FailOn::Upload, &path)?;
        state.require_parent(&path)?;
        if state.is_dir(&path) {
            return Err(TransportError::operation(&path, "目标是一个目录"));
        }
        let bytes = data.len() as u64;
        state.nodes.insert(
            path.clone(),
            MemoryNode {
                kind: EntryKind::File,
                data,
                modified_time: now(),
                permissions: None,
            },
        );
        state.operations.push(format!("put {}", path));
        Ok(bytes)
    }

    async fn create_dir(&self, path: &str) -> Result<(), TransportError> {
        self.ensure_open()?;
        let path = normalize(path);
        let mut state = self.state();
        state.check(FailOn::CreateDir, &path)?;
        state.require_parent(&path)?;
        if state.nodes.contains_key(&path) {
            return Err(TransportError::operation(&path, "已存在"));
        }
        state.nodes.insert(
            path.clone(),
            MemoryNode {
                kind: EntryKind::Directory,
                data: Vec::new(),
                modified_time: now(),
                permissions: None,
            },
        );
        state.operations.push(format!("mkdir {}", path));
        Ok(())
    }

    async fn remove_file(&self, path: &str) -> Result<(), TransportError> {
        self.ensure_open()?;
        let path = normalize(path);
        let mut state = self.state();
        state.check(FailOn::Remove, &path)?;
        match state.nodes.get(&path) {
            Some(node) if !node.kind.is_dir() => {}
            Some(_) => return Err(TransportError::operation(&path, "不是文件")),
            None => return Err(TransportError::NotFound(path)),
        }
        state.nodes.remove(&path);
        state.operations.push(format!("rm {}", path));
        Ok(())
    }

    async fn remove_dir(&self, path: &str) -> Result<(), TransportError> {
        self.ensure_open()?;
        let path = normalize(path);
        let mut state = self.state();
        state.check(FailOn::Remove, &path)?;
        if !state.is_dir(&path) || path == "/" {
            return Err(TransportError::NotFound(path));
        }
        let has_children = state
            .nodes
            .keys()
            .any(|p| parent_of(p).as_deref() == Some(path.as_str()));
        if has_children {
            return Err(TransportError::operation(&path, "目录不为空"));
        }
        state.nodes.remove(&path);
        state.operations.push(format!("rmdir {}", path));
        Ok(())
    }

    async fn set_permissions(&self, path: &str, mode: u32) -> Result<(), TransportError> {
        self.ensure_open()?;
        let path = normalize(path);
        let mut state = self.state();
        state.check(FailOn::Permissions, &path)?;
        let node = state
            .nodes
            .get_mut(&path)
            .ok_or_else(|| TransportError::NotFound(path.clone()))?;
        node.permissions = Some(mode);
        Ok(())
    }

    async fn set_modified(&self, path: &str, modified_time: i64) -> Result<(), TransportError> {
        self.ensure_open()?;
        let path = normalize(path);
        let mut state = self.state();
        state.check(FailOn::Timestamp, &path)?;
        let node = state
            .nodes
            .get_mut(&path)
            .ok_or_else(|| TransportError::NotFound(path.clone()))?;
        node.modified_time = modified_time;
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

/// 返回同一个内存传输的连接器
pub struct MemoryConnector {
    transport: Arc<MemoryTransport>,
    refuse: Option<TransportError>,
}

impl MemoryConnector {
    pub fn new(transport: Arc<MemoryTransport>) -> Self {
        Self {
            transport,
            refuse: None,
        }
    }

    /// 每次连接都返回给定错误
    pub fn refusing(transport: Arc<MemoryTransport>, error: TransportError) -> Self {
        Self {
            transport,
            refuse: Some(error),
        }
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, _config: &SessionConfig) -> Result<Arc<dyn Transport>, TransportError> {
        if let Some(e) = &self.refuse {
            return Err(e.clone());
        }
        self.transport.reopen();
        Ok(self.transport.clone() as Arc<dyn Transport>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_list_dir_one_level() {
        let t = MemoryTransport::new();
        t.insert_file("/r/a.txt", b"abc", 10);
        t.insert_file("/r/sub/b.txt", b"x", 20);

        let mut entries = t.list_dir("/r").await.unwrap();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "a.txt");
        assert_eq!(entries[0].size, 3);
        assert_eq!(entries[1].name, "sub");
        assert!(entries[1].kind.is_dir());

        assert!(t.list_dir("/missing").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_remove_dir_requires_empty() {
        let t = MemoryTransport::new();
        t.insert_file("/r/sub/b.txt", b"x", 20);
        assert!(t.remove_dir("/r/sub").await.is_err());
        t.remove_file("/r/sub/b.txt").await.unwrap();
        t.remove_dir("/r/sub").await.unwrap();
        assert!(!t.contains("/r/sub"));
    }

    #[tokio::test]
    async fn test_create_dir_all_and_close() {
        let t = MemoryTransport::new();
        t.create_dir_all("/a/b/c").await.unwrap();
        assert!(t.contains("/a/b/c"));
        t.close().await.unwrap();
        assert!(t.is_closed());
        assert_eq!(
            t.list_dir("/a").await.unwrap_err(),
            TransportError::NotConnected
        );
    }
}
