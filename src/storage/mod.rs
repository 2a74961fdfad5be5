pub mod local;
pub mod memory;
pub mod sftp;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

pub use local::{scan_local_tree, LocalTree};
pub use memory::MemoryTransport;
pub use sftp::{SftpConnector, SftpTransport};

// ============ 公共常量 ============

/// SFTP 默认端口
pub const DEFAULT_SFTP_PORT: u16 = 22;
/// 单次请求超时（秒）
pub const OP_TIMEOUT_SECS: u64 = 30;

/// 条目类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryKind {
    File,
    Directory,
}

impl EntryKind {
    pub fn is_dir(&self) -> bool {
        matches!(self, EntryKind::Directory)
    }
}

/// 文件信息（本地或远程，路径相对于各自的根目录）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: String,
    pub kind: EntryKind,
    pub size: u64,
    /// Unix 时间戳（秒）
    pub modified_time: i64,
    /// Unix 权限位，平台不支持时为 None
    pub permissions: Option<u32>,
}

impl FileEntry {
    pub fn file(path: impl Into<String>, size: u64, modified_time: i64) -> Self {
        Self {
            path: path.into(),
            kind: EntryKind::File,
            size,
            modified_time,
            permissions: None,
        }
    }

    pub fn dir(path: impl Into<String>, modified_time: i64) -> Self {
        Self {
            path: path.into(),
            kind: EntryKind::Directory,
            size: 0,
            modified_time,
            permissions: None,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind.is_dir()
    }
}

/// 远程目录中的单个条目（一层列表，只有名称）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub name: String,
    pub kind: EntryKind,
    pub size: u64,
    pub modified_time: i64,
}

/// 会话参数
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// 不校验服务器主机密钥
    pub accept_any_host_key: bool,
    pub timeout_secs: u64,
}

/// 传输层错误
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("远程路径不存在: {0}")]
    NotFound(String),
    #[error("会话未打开")]
    NotConnected,
    #[error("无法连接到 {host}: {message}")]
    Connect { host: String, message: String },
    #[error("认证失败: {0}")]
    Auth(String),
    #[error("主机密钥被拒绝: {0}")]
    HostKey(String),
    #[error("{path}: {message}")]
    Operation { path: String, message: String },
}

impl TransportError {
    pub fn operation(path: impl Into<String>, message: impl ToString) -> Self {
        TransportError::Operation {
            path: path.into(),
            message: message.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, TransportError::NotFound(_))
    }
}

/// 远程传输接口
#[async_trait]
pub trait Transport: Send + Sync {
    /// 列出一个远程目录（不递归）
    async fn list_dir(&self, path: &str) -> Result<Vec<RemoteEntry>, TransportError>;

    /// 上传本地文件，返回写入的字节数
    async fn upload(&self, local_path: &Path, remote_path: &str) -> Result<u64, TransportError>;

    /// 创建单个目录（父目录须已存在）
    async fn create_dir(&self, path: &str) -> Result<(), TransportError>;

    /// 删除文件
    async fn remove_file(&self, path: &str) -> Result<(), TransportError>;

    /// 删除空目录
    async fn remove_dir(&self, path: &str) -> Result<(), TransportError>;

    /// 设置权限位
    async fn set_permissions(&self, path: &str, mode: u32) -> Result<(), TransportError>;

    /// 设置修改时间（Unix 秒）
    async fn set_modified(&self, path: &str, modified_time: i64) -> Result<(), TransportError>;

    /// 逐级创建目录，已存在的部分忽略
    async fn create_dir_all(&self, path: &str) -> Result<(), TransportError> {
        let absolute = path.starts_with('/');
        let mut current = String::new();
        for part in path.split('/').filter(|s| !s.is_empty()) {
            if absolute || !current.is_empty() {
                current.push('/');
            }
            current.push_str(part);
            if self.list_dir(&current).await.is_ok() {
                continue;
            }
            self.create_dir(&current).await?;
        }
        Ok(())
    }

    /// 关闭会话
    async fn close(&self) -> Result<(), TransportError>;

    /// 获取传输名称（用于日志）
    fn name(&self) -> &str;
}

/// 建立会话
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, config: &SessionConfig) -> Result<Arc<dyn Transport>, TransportError>;
}

/// 拼接远程根目录和相对路径
pub fn join_remote(root: &str, relative: &str) -> String {
    let relative = relative.trim_matches('/');
    if relative.is_empty() {
        return root.to_string();
    }
    if root.is_empty() {
        return relative.to_string();
    }
    format!("{}/{}", root.trim_end_matches('/'), relative)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_remote() {
        assert_eq!(join_remote("/srv/data", "a/b.txt"), "/srv/data/a/b.txt");
        assert_eq!(join_remote("/srv/data/", "/a"), "/srv/data/a");
        assert_eq!(join_remote("/", "a"), "/a");
        assert_eq!(join_remote("/srv", ""), "/srv");
        assert_eq!(join_remote("", "x"), "x");
    }
}
