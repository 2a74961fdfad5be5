//! 应用配置模块
//!
//! 配置来自一个 JSON 文件，键名沿用 `SftpIp`、`SftpUserName` 等，
//! 每个键都可以用环境变量 `SFTPSYNC_<KEY>` 覆盖（如 `SFTPSYNC_SFTP_PASSWORD`）。

use crate::core::SyncConfig;
use crate::logging::LogConfig;
use crate::storage::{SessionConfig, DEFAULT_SFTP_PORT, OP_TIMEOUT_SECS};
use serde::Deserialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// 环境变量前缀
pub const ENV_PREFIX: &str = "SFTPSYNC_";

/// 配置错误
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("缺少配置项 {0}")]
    Missing(&'static str),
    #[error("无法读取配置文件 {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("配置文件格式错误: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("配置项 {key} 无效: {value}")]
    Invalid { key: &'static str, value: String },
    #[error("源目录不可用 {path}: {message}")]
    SourcePath { path: PathBuf, message: String },
}

/// 配置文件的原始内容，必填项在校验前都是可选的
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawSettings {
    sftp_ip: Option<String>,
    sftp_port: Option<u16>,
    sftp_user_name: Option<String>,
    sftp_password: Option<String>,
    source_path: Option<String>,
    destination_path: Option<String>,
    accept_any_host_key: Option<bool>,
    timeout_secs: Option<u64>,
    #[serde(default)]
    sync: SyncConfig,
    #[serde(default)]
    log: LogConfig,
}

impl RawSettings {
    /// 用环境变量覆盖文件中的值
    fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(&format!("{}{}", ENV_PREFIX, key));

        if let Some(v) = get("SFTP_IP") {
            self.sftp_ip = Some(v);
        }
        if let Some(v) = get("SFTP_PORT") {
            self.sftp_port = Some(v.parse().map_err(|_| ConfigError::Invalid {
                key: "SftpPort",
                value: v.clone(),
            })?);
        }
        if let Some(v) = get("SFTP_USER_NAME") {
            self.sftp_user_name = Some(v);
        }
        if let Some(v) = get("SFTP_PASSWORD") {
            self.sftp_password = Some(v);
        }
        if let Some(v) = get("SOURCE_PATH") {
            self.source_path = Some(v);
        }
        if let Some(v) = get("DESTINATION_PATH") {
            self.destination_path = Some(v);
        }
        if let Some(v) = get("ACCEPT_ANY_HOST_KEY") {
            self.accept_any_host_key = Some(parse_bool(&v).ok_or(ConfigError::Invalid {
                key: "AcceptAnyHostKey",
                value: v.clone(),
            })?);
        }
        if let Some(v) = get("TIMEOUT_SECS") {
            self.timeout_secs = Some(v.parse().map_err(|_| ConfigError::Invalid {
                key: "TimeoutSecs",
                value: v.clone(),
            })?);
        }
        Ok(())
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn required(value: Option<String>, key: &'static str) -> Result<String, ConfigError> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or(ConfigError::Missing(key))
}

/// 校验后的运行配置
#[derive(Debug, Clone)]
pub struct Settings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub source_path: PathBuf,
    pub destination_path: String,
    pub accept_any_host_key: bool,
    pub timeout_secs: u64,
    pub sync: SyncConfig,
    pub log: LogConfig,
}

impl Settings {
    /// 从配置文件和进程环境变量加载；文件不存在时只使用环境变量
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!("配置文件不存在，仅使用环境变量: {}", path.display());
                "{}".to_string()
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        Self::from_json_str(&content, |key| std::env::var(key).ok())
    }

    /// 从 JSON 文本加载，`env` 用于查找覆盖值
    pub fn from_json_str<F>(content: &str, env: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut raw: RawSettings = serde_json::from_str(content)?;
        raw.apply_env(env)?;

        let settings = Self {
            host: required(raw.sftp_ip, "SftpIp")?,
            port: raw.sftp_port.unwrap_or(DEFAULT_SFTP_PORT),
            username: required(raw.sftp_user_name, "SftpUserName")?,
            password: raw
                .sftp_password
                .ok_or(ConfigError::Missing("SftpPassword"))?,
            source_path: PathBuf::from(required(raw.source_path, "SourcePath")?),
            destination_path: required(raw.destination_path, "DestinationPath")?,
            accept_any_host_key: raw.accept_any_host_key.unwrap_or(true),
            timeout_secs: raw.timeout_secs.unwrap_or(OP_TIMEOUT_SECS),
            sync: raw.sync,
            log: raw.log,
        };

        if settings.port == 0 {
            return Err(ConfigError::Invalid {
                key: "SftpPort",
                value: "0".to_string(),
            });
        }

        Ok(settings)
    }

    /// 传输会话参数
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            host: self.host.clone(),
            port: self.port,
            username: self.username.clone(),
            password: self.password.clone(),
            accept_any_host_key: self.accept_any_host_key,
            timeout_secs: self.timeout_secs,
        }
    }
}
