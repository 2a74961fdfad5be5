//! 运行编排
//!
//! 一次运行依次经过 连接 -> 扫描与比较 -> 执行 -> 报告，
//! 任何阶段的致命错误都会进入错误状态。会话建立后无论成功与否都会关闭，
//! 并且总会写出 "程序结束"。

use crate::config::{ConfigError, Settings};
use crate::core::comparator::{FileComparator, SyncPlan};
use crate::core::executor::PlanExecutor;
use crate::core::result::SyncResult;
use crate::core::scanner::FileScanner;
use crate::error::SyncError;
use crate::logging::LogSink;
use crate::storage::{Connector, Transport, TransportError};
use std::sync::Arc;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

/// 运行状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Connecting,
    Connected,
    Syncing,
    Reporting,
    Done,
    Error,
}

/// 已连接并完成比较的运行
struct Prepared {
    settings: Settings,
    transport: Arc<dyn Transport>,
    plan: SyncPlan,
}

/// 同步运行器
pub struct SyncRunner {
    connector: Arc<dyn Connector>,
    sink: Arc<dyn LogSink>,
    state: RunState,
}

impl SyncRunner {
    pub fn new(connector: Arc<dyn Connector>, sink: Arc<dyn LogSink>) -> Self {
        Self {
            connector,
            sink,
            state: RunState::Idle,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    fn transition(&mut self, next: RunState) {
        debug!("运行状态: {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    fn log(&self, line: &str) {
        self.sink.append(line);
    }

    /// 执行一次完整同步
    ///
    /// 单个文件的失败只体现在返回的 `SyncResult` 中；
    /// 只有配置、连接和远程根目录级别的问题才返回错误。
    pub async fn run<F>(&mut self, load: F) -> Result<SyncResult, SyncError>
    where
        F: FnOnce() -> Result<Settings, ConfigError>,
    {
        let span = info_span!("sync_run", run_id = %Uuid::new_v4());
        self.state = RunState::Idle;
        self.log("*********************");
        self.log("程序启动");
        let _finished = scopeguard::guard(self.sink.clone(), |sink| sink.append("程序结束"));

        let result = self.sync(load).instrument(span).await;
        self.settle(result)
    }

    /// 只扫描和比较，返回计划而不执行，远程不做任何修改
    pub async fn analyze<F>(&mut self, load: F) -> Result<SyncPlan, SyncError>
    where
        F: FnOnce() -> Result<Settings, ConfigError>,
    {
        let span = info_span!("sync_analyze", run_id = %Uuid::new_v4());
        self.state = RunState::Idle;
        self.log("*********************");
        self.log("程序启动 (仅分析)");
        let _finished = scopeguard::guard(self.sink.clone(), |sink| sink.append("程序结束"));

        let result = self.plan_only(load).instrument(span).await;
        self.settle(result)
    }

    fn settle<T>(&mut self, result: Result<T, SyncError>) -> Result<T, SyncError> {
        match result {
            Ok(value) => {
                self.transition(RunState::Done);
                Ok(value)
            }
            Err(e) => {
                self.transition(RunState::Error);
                self.log(&e.to_string());
                Err(e)
            }
        }
    }

    async fn sync<F>(&mut self, load: F) -> Result<SyncResult, SyncError>
    where
        F: FnOnce() -> Result<Settings, ConfigError>,
    {
        let prepared = self.prepare(load, true).await?;
        let Prepared {
            settings,
            transport,
            plan,
        } = prepared;

        let executor = PlanExecutor::new(
            transport.clone(),
            settings.source_path.clone(),
            settings.destination_path.clone(),
            settings.sync.clone(),
        );
        let result = executor.execute(&plan).await;

        if result.disconnected {
            // 已完成部分仍然写入日志，之后按致命错误处理
            self.report(&result);
            close_session(transport.as_ref()).await;
            return Err(SyncError::TransportOperation(TransportError::NotConnected));
        }

        self.transition(RunState::Reporting);
        self.report(&result);
        close_session(transport.as_ref()).await;

        Ok(result)
    }

    async fn plan_only<F>(&mut self, load: F) -> Result<SyncPlan, SyncError>
    where
        F: FnOnce() -> Result<Settings, ConfigError>,
    {
        let prepared = self.prepare(load, false).await?;

        self.transition(RunState::Reporting);
        let summary = prepared.plan.summary();
        self.log(&format!(
            "待执行: 创建目录 {}, 上传 {} ({} 字节), 删除 {}",
            summary.dir_count, summary.upload_count, summary.upload_bytes, summary.remove_count
        ));
        for operation in prepared.plan.iter() {
            self.log(&operation.to_string());
        }
        close_session(prepared.transport.as_ref()).await;

        Ok(prepared.plan)
    }

    /// 加载配置、连接并生成计划
    async fn prepare<F>(&mut self, load: F, create_root: bool) -> Result<Prepared, SyncError>
    where
        F: FnOnce() -> Result<Settings, ConfigError>,
    {
        let settings = load()?;

        self.transition(RunState::Connecting);
        info!(
            "同步 {} -> {}:{}",
            settings.source_path.display(),
            settings.host,
            settings.destination_path
        );
        let transport = match self.connector.connect(&settings.session_config()).await {
            Ok(transport) => transport,
            Err(e) => {
                self.log("SFTP 未连接");
                return Err(SyncError::TransportConnect(e));
            }
        };

        self.transition(RunState::Connected);
        self.log("SFTP 已连接");

        match self.build_plan(&settings, transport.clone(), create_root).await {
            Ok(plan) => Ok(Prepared {
                settings,
                transport,
                plan,
            }),
            Err(e) => {
                close_session(transport.as_ref()).await;
                Err(e)
            }
        }
    }

    async fn build_plan(
        &mut self,
        settings: &Settings,
        transport: Arc<dyn Transport>,
        create_root: bool,
    ) -> Result<SyncPlan, SyncError> {
        self.transition(RunState::Syncing);

        let sync = &settings.sync;
        let remote_root = settings.destination_path.as_str();
        let scanner = FileScanner::with_config(sync.max_concurrent_transfers, sync.scan.clone());

        let local = scanner
            .scan_local(&settings.source_path)
            .await
            .map_err(|e| ConfigError::SourcePath {
                path: settings.source_path.clone(),
                message: e.to_string(),
            })?;

        let remote = scanner
            .scan_remote(transport.clone(), remote_root)
            .await
            .map_err(SyncError::TransportOperation)?;

        if !remote.root_exists {
            if !sync.auto_create_dir {
                return Err(SyncError::TransportOperation(TransportError::NotFound(
                    remote_root.to_string(),
                )));
            }
            if create_root {
                info!("远程根目录不存在，自动创建: {}", remote_root);
                transport
                    .create_dir_all(remote_root)
                    .await
                    .map_err(SyncError::TransportOperation)?;
            }
        }

        let plan = FileComparator::with_config(sync.compare.clone()).diff(&local, &remote.snapshot);
        let summary = plan.summary();
        info!(
            "同步计划: 创建目录 {}, 上传 {} ({} 字节), 删除 {}",
            summary.dir_count, summary.upload_count, summary.upload_bytes, summary.remove_count
        );
        Ok(plan)
    }

    fn report(&self, result: &SyncResult) {
        if result.is_success {
            self.log("同步成功");
        } else {
            self.log("同步未成功");
            for failure in &result.failures {
                self.log(&failure.message());
            }
        }

        self.log(&format!("已上传: {}", result.uploads.len()));
        self.log(&format!("已删除: {}", result.removals.len()));

        if !result.uploads.is_empty() {
            self.log("已上传文件");
            for outcome in &result.uploads {
                self.log(outcome.path());
            }
        }

        if !result.removals.is_empty() {
            self.log("已删除文件");
            for outcome in &result.removals {
                self.log(outcome.path());
            }
        }
    }
}

async fn close_session(transport: &dyn Transport) {
    if let Err(e) = transport.close().await {
        warn!("关闭会话失败: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::MemorySink;
    use crate::storage::memory::{MemoryConnector, MemoryTransport};
    use std::fs;
    use std::path::Path;

    fn settings_for(source: &Path, destination: &str) -> Settings {
        let content = serde_json::json!({
            "SftpIp": "127.0.0.1",
            "SftpUserName": "u",
            "SftpPassword": "p",
            "SourcePath": source.to_string_lossy(),
            "DestinationPath": destination,
            "Sync": { "retryBaseDelayMs": 1 }
        });
        Settings::from_json_str(&content.to_string(), |_| None).unwrap()
    }

    #[tokio::test]
    async fn test_successful_run_reaches_done() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), b"hello").unwrap();

        let remote = Arc::new(MemoryTransport::new());
        remote.insert_dir("/out", 0);
        let sink = Arc::new(MemorySink::new());
        let mut runner = SyncRunner::new(
            Arc::new(MemoryConnector::new(remote.clone())),
            sink.clone(),
        );
        assert_eq!(runner.state(), RunState::Idle);

        let settings = settings_for(dir.path(), "/out");
        let result = runner.run(|| Ok(settings)).await.unwrap();

        assert_eq!(runner.state(), RunState::Done);
        assert!(result.is_success);
        assert!(remote.contains("/out/a.txt"));
        assert!(remote.is_closed());

        let lines = sink.lines();
        assert_eq!(lines[0], "*********************");
        assert_eq!(lines[1], "程序启动");
        assert_eq!(lines[2], "SFTP 已连接");
        assert!(lines.contains(&"同步成功".to_string()));
        assert!(lines.contains(&"已上传: 1".to_string()));
        assert_eq!(lines.last().map(String::as_str), Some("程序结束"));
    }

    #[tokio::test]
    async fn test_config_error_enters_error_state() {
        let remote = Arc::new(MemoryTransport::new());
        let sink = Arc::new(MemorySink::new());
        let mut runner = SyncRunner::new(Arc::new(MemoryConnector::new(remote)), sink.clone());

        let err = runner
            .run(|| Err(ConfigError::Missing("SftpIp")))
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::Configuration(_)));
        assert_eq!(runner.state(), RunState::Error);
        assert_eq!(sink.lines().last().map(String::as_str), Some("程序结束"));
    }

    #[tokio::test]
    async fn test_analyze_does_not_modify_remote() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/b.txt"), b"xyz").unwrap();

        let remote = Arc::new(MemoryTransport::new());
        let sink = Arc::new(MemorySink::new());
        let mut runner = SyncRunner::new(
            Arc::new(MemoryConnector::new(remote.clone())),
            sink.clone(),
        );

        let settings = settings_for(dir.path(), "/missing/root");
        let plan = runner.analyze(|| Ok(settings)).await.unwrap();

        assert_eq!(runner.state(), RunState::Done);
        assert_eq!(plan.summary().dir_count, 1);
        assert_eq!(plan.summary().upload_count, 1);
        assert!(remote.operations().is_empty());
        assert!(remote.paths().is_empty());
        assert!(remote.is_closed());
    }
}
