//! SFTP 单向目录同步
//!
//! 将本地源目录同步到远程 SFTP 目录：上传新增和变化的文件，
//! 删除远程多余的条目，并记录每一步的结果。

pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod storage;

pub use config::{ConfigError, Settings};
pub use core::{RunState, SyncConfig, SyncPlan, SyncResult, SyncRunner};
pub use error::SyncError;
pub use logging::{LogConfig, LogSink, MemorySink, TracingSink};
