use crate::config::ConfigError;
use crate::storage::TransportError;

/// 会终止整个运行的错误；单个文件的失败记录在 `SyncResult` 中，不经过这里
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("配置错误: {0}")]
    Configuration(#[from] ConfigError),
    #[error("SFTP 连接失败: {0}")]
    TransportConnect(TransportError),
    #[error("远程操作失败: {0}")]
    TransportOperation(TransportError),
}
