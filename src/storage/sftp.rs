use super::{
    Connector, EntryKind, RemoteEntry, SessionConfig, Transport, TransportError, OP_TIMEOUT_SECS,
};
use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::keys::key::PublicKey;
use russh_sftp::client::error::Error as SftpError;
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::{FileAttributes, StatusCode};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// SSH 客户端回调，只负责主机密钥校验
struct ClientHandler {
    host: String,
    port: u16,
    accept_any_host_key: bool,
}

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        if self.accept_any_host_key {
            debug!("跳过主机密钥校验: {}", self.host);
            return Ok(true);
        }

        match russh::keys::check_known_hosts(&self.host, self.port, server_public_key) {
            Ok(known) => {
                if !known {
                    warn!("主机密钥不在 known_hosts 中: {}", self.host);
                }
                Ok(known)
            }
            Err(e) => {
                warn!("主机密钥校验失败: {}: {}", self.host, e);
                Ok(false)
            }
        }
    }
}

/// 基于 russh-sftp 的远程传输
pub struct SftpTransport {
    sftp: SftpSession,
    handle: Mutex<Option<Handle<ClientHandler>>>,
    timeout: Duration,
    name: String,
}

fn map_sftp_error(path: &str, e: SftpError) -> TransportError {
    match e {
        SftpError::Status(ref status) if status.status_code == StatusCode::NoSuchFile => {
            TransportError::NotFound(path.to_string())
        }
        other => TransportError::operation(path, other),
    }
}

impl SftpTransport {
    /// 打开 SSH 连接、认证并启动 sftp 子系统
    pub async fn open(config: &SessionConfig) -> Result<Self, TransportError> {
        let connect_error = |message: String| TransportError::Connect {
            host: config.host.clone(),
            message,
        };

        let timeout = Duration::from_secs(if config.timeout_secs == 0 {
            OP_TIMEOUT_SECS
        } else {
            config.timeout_secs
        });

        let ssh_config = Arc::new(client::Config {
            inactivity_timeout: Some(timeout * 10),
            ..Default::default()
        });
        let handler = ClientHandler {
            host: config.host.clone(),
            port: config.port,
            accept_any_host_key: config.accept_any_host_key,
        };

        info!("连接 SFTP: {}@{}:{}", config.username, config.host, config.port);

        let mut handle = tokio::time::timeout(
            timeout,
            client::connect(ssh_config, (config.host.as_str(), config.port), handler),
        )
        .await
        .map_err(|_| connect_error("连接超时".to_string()))?
        .map_err(|e| match e {
            russh::Error::UnknownKey => TransportError::HostKey(config.host.clone()),
            other => connect_error(other.to_string()),
        })?;

        let authenticated = handle
            .authenticate_password(config.username.clone(), config.password.clone())
            .await
            .map_err(|e| connect_error(e.to_string()))?;
        if !authenticated {
            return Err(TransportError::Auth(config.username.clone()));
        }

        let channel = handle
            .channel_open_session()
            .await
            .map_err(|e| connect_error(e.to_string()))?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| connect_error(e.to_string()))?;
        let sftp = SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| connect_error(e.to_string()))?;

        Ok(Self {
            sftp,
            handle: Mutex::new(Some(handle)),
            timeout,
            name: format!("sftp://{}@{}:{}", config.username, config.host, config.port),
        })
    }

    /// SSH 连接已经断开，或会话已被关闭
    async fn connection_lost(&self) -> bool {
        match self.handle.lock().await.as_ref() {
            Some(handle) => handle.is_closed(),
            None => true,
        }
    }

    /// 连接断开时统一报告为未连接，其余错误原样返回
    async fn classify(&self, error: TransportError) -> TransportError {
        if matches!(error, TransportError::NotFound(_)) || !self.connection_lost().await {
            return error;
        }
        warn!("SFTP 连接已断开: {}: {}", self.name, error);
        TransportError::NotConnected
    }

    /// 给单个请求加超时
    async fn timed<T, F>(&self, path: &str, fut: F) -> Result<T, TransportError>
    where
        F: Future<Output = Result<T, SftpError>>,
    {
        let error = match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) => map_sftp_error(path, e),
            Err(_) => TransportError::operation(path, "请求超时"),
        };
        Err(self.classify(error).await)
    }
}

#[async_trait]
impl Transport for SftpTransport {
    async fn list_dir(&self, path: &str) -> Result<Vec<RemoteEntry>, TransportError> {
        let read_dir = self.timed(path, self.sftp.read_dir(path)).await?;

        let entries = read_dir
            .filter(|entry| {
                let name = entry.file_name();
                name != "." && name != ".."
            })
            .map(|entry| {
                let metadata = entry.metadata();
                let kind = if entry.file_type().is_dir() {
                    EntryKind::Directory
                } else {
                    EntryKind::File
                };
                RemoteEntry {
                    name: entry.file_name(),
                    kind,
                    size: if kind.is_dir() { 0 } else { metadata.size.unwrap_or(0) },
                    modified_time: metadata.mtime.map(i64::from).unwrap_or(0),
                }
            })
            .collect();

        Ok(entries)
    }

    async fn upload(&self, local_path: &Path, remote_path: &str) -> Result<u64, TransportError> {
        let mut local = tokio::fs::File::open(local_path)
            .await
            .map_err(|e| TransportError::operation(remote_path, e))?;

        let mut remote = self.timed(remote_path, self.sftp.create(remote_path)).await?;

        let copied = tokio::io::copy(&mut local, &mut remote).await;
        let bytes = match copied {
            Ok(bytes) => bytes,
            Err(e) => {
                let error = TransportError::operation(remote_path, e);
                return Err(self.classify(error).await);
            }
        };
        if let Err(e) = remote.shutdown().await {
            let error = TransportError::operation(remote_path, e);
            return Err(self.classify(error).await);
        }

        debug!("写入完成: {} ({} 字节)", remote_path, bytes);
        Ok(bytes)
    }

    async fn create_dir(&self, path: &str) -> Result<(), TransportError> {
        self.timed(path, self.sftp.create_dir(path)).await
    }

    async fn remove_file(&self, path: &str) -> Result<(), TransportError> {
        self.timed(path, self.sftp.remove_file(path)).await
    }

    async fn remove_dir(&self, path: &str) -> Result<(), TransportError> {
        self.timed(path, self.sftp.remove_dir(path)).await
    }

    async fn set_permissions(&self, path: &str, mode: u32) -> Result<(), TransportError> {
        let attrs = FileAttributes {
            permissions: Some(mode),
            ..FileAttributes::empty()
        };
        self.timed(path, self.sftp.set_metadata(path, attrs)).await
    }

    async fn set_modified(&self, path: &str, modified_time: i64) -> Result<(), TransportError> {
        let mtime = u32::try_from(modified_time)
            .map_err(|_| TransportError::operation(path, "时间戳超出 SFTP 范围"))?;
        // SFTP v3 只能同时设置 atime 和 mtime
        let attrs = FileAttributes {
            atime: Some(mtime),
            mtime: Some(mtime),
            ..FileAttributes::empty()
        };
        self.timed(path, self.sftp.set_metadata(path, attrs)).await
    }

    async fn close(&self) -> Result<(), TransportError> {
        let Some(handle) = self.handle.lock().await.take() else {
            return Ok(());
        };

        if let Err(e) = self.sftp.close().await {
            debug!("关闭 sftp 子系统失败: {}", e);
        }
        handle
            .disconnect(russh::Disconnect::ByApplication, "", "English")
            .await
            .map_err(|e| TransportError::operation(&self.name, e))?;

        info!("SFTP 会话已关闭: {}", self.name);
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// 打开真实 SFTP 会话的连接器
#[derive(Debug, Default, Clone, Copy)]
pub struct SftpConnector;

#[async_trait]
impl Connector for SftpConnector {
    async fn connect(&self, config: &SessionConfig) -> Result<Arc<dyn Transport>, TransportError> {
        let transport = SftpTransport::open(config).await?;
        Ok(Arc::new(transport) as Arc<dyn Transport>)
    }
}
