use crate::core::comparator::{CompareConfig, SyncOperation, SyncPlan};
use crate::core::result::{OperationOutcome, PermissionResult, SyncResult, TimestampResult};
use crate::core::scanner::ScanConfig;
use crate::core::snapshot::paths_related;
use crate::storage::local::{local_modified_time, local_permissions};
use crate::storage::{join_remote, Transport, TransportError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// 同步配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConfig {
    /// 最大并发传输数
    #[serde(default = "default_max_concurrent_transfers")]
    pub max_concurrent_transfers: usize,
    /// 最大重试次数
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// 重试基础延迟（毫秒）
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    /// 上传后设置远程权限
    #[serde(default = "default_true")]
    pub preserve_permissions: bool,
    /// 上传后设置远程修改时间
    #[serde(default = "default_true")]
    pub preserve_timestamps: bool,
    /// 远程根目录不存在时自动创建
    #[serde(default = "default_true")]
    pub auto_create_dir: bool,
    /// 比较配置
    #[serde(default)]
    pub compare: CompareConfig,
    /// 扫描配置
    #[serde(default)]
    pub scan: ScanConfig,
}

fn default_max_concurrent_transfers() -> usize {
    4
}

fn default_max_retries() -> u32 {
    2
}

fn default_retry_base_delay_ms() -> u64 {
    1000
}

fn default_true() -> bool {
    true
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_concurrent_transfers: default_max_concurrent_transfers(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            preserve_permissions: true,
            preserve_timestamps: true,
            auto_create_dir: true,
            compare: CompareConfig::default(),
            scan: ScanConfig::default(),
        }
    }
}

/// 单个动作的执行上下文，可在任务间共享
#[derive(Clone)]
struct ActionContext {
    transport: Arc<dyn Transport>,
    local_root: PathBuf,
    remote_root: String,
    config: Arc<SyncConfig>,
    /// 某个动作发现会话已断开
    disconnected: Arc<AtomicBool>,
}

/// 计划执行器
pub struct PlanExecutor {
    context: ActionContext,
}

impl PlanExecutor {
    pub fn new(
        transport: Arc<dyn Transport>,
        local_root: impl Into<PathBuf>,
        remote_root: impl Into<String>,
        config: SyncConfig,
    ) -> Self {
        Self {
            context: ActionContext {
                transport,
                local_root: local_root.into(),
                remote_root: remote_root.into(),
                config: Arc::new(config),
                disconnected: Arc::new(AtomicBool::new(false)),
            },
        }
    }

    /// 按计划顺序执行，单个动作失败不会中止整个运行
    ///
    /// 路径相同或存在祖先/子孙关系的两个动作不会并发，后者等待前者完成。
    /// 会话断开后不再调度新的动作，结果中 `disconnected` 为 true。
    pub async fn execute(&self, plan: &SyncPlan) -> SyncResult {
        let disconnected = self.context.disconnected.clone();
        disconnected.store(false, Ordering::SeqCst);

        let max_concurrent = self.context.config.max_concurrent_transfers.max(1);
        let semaphore = Arc::new(Semaphore::new(max_concurrent));
        let mut outcomes: Vec<Option<OperationOutcome>> = vec![None; plan.len()];
        let mut in_flight: Vec<(usize, String, JoinHandle<OperationOutcome>)> = Vec::new();

        info!(
            "开始执行同步计划: {} 个操作, 并发 {}",
            plan.len(),
            max_concurrent
        );

        for (index, operation) in plan.iter().enumerate() {
            // 等待与该动作相关的进行中动作，同时回收已完成的任务
            let mut i = 0;
            while i < in_flight.len() {
                let related = paths_related(&in_flight[i].1, operation.path());
                if related || in_flight[i].2.is_finished() {
                    let (done_index, _, handle) = in_flight.swap_remove(i);
                    outcomes[done_index] = Some(Self::join(&plan.operations[done_index], handle).await);
                } else {
                    i += 1;
                }
            }

            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    outcomes[index] = Some(OperationOutcome::failed(operation.clone(), e));
                    continue;
                }
            };

            if disconnected.load(Ordering::SeqCst) {
                error!("会话已断开，停止调度剩余 {} 个操作", plan.len() - index);
                break;
            }

            let context = self.context.clone();
            let operation = operation.clone();
            let path = operation.path().to_string();
            let handle = tokio::spawn(async move {
                let outcome = context.run(operation).await;
                drop(permit);
                outcome
            });
            in_flight.push((index, path, handle));
        }

        // 等待所有任务完成
        for (index, _, handle) in in_flight {
            outcomes[index] = Some(Self::join(&plan.operations[index], handle).await);
        }

        let mut result = SyncResult::from_outcomes(outcomes.into_iter().flatten());
        result.disconnected = disconnected.load(Ordering::SeqCst);
        info!(
            "同步计划执行完成: 上传 {}, 删除 {}, 失败 {}",
            result.uploads.len(),
            result.removals.len(),
            result.failures.len()
        );
        result
    }

    async fn join(operation: &SyncOperation, handle: JoinHandle<OperationOutcome>) -> OperationOutcome {
        match handle.await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("任务失败: {}: {}", operation, e);
                OperationOutcome::failed(operation.clone(), format!("任务异常: {}", e))
            }
        }
    }
}

impl ActionContext {
    fn local_path(&self, relative: &str) -> PathBuf {
        self.local_root.join(relative)
    }

    fn remote_path(&self, relative: &str) -> String {
        join_remote(&self.remote_root, relative)
    }

    async fn run(&self, operation: SyncOperation) -> OperationOutcome {
        match self.execute_with_retry(&operation).await {
            Ok(bytes) => {
                match &operation {
                    SyncOperation::Upload { path, .. } => info!("上传 {} 成功", path),
                    SyncOperation::EnterDir { path } => info!("创建目录 {} 成功", path),
                    SyncOperation::Remove { path, .. } => info!("删除 {} 成功", path),
                }
                let outcome = OperationOutcome::succeeded(operation, bytes);
                self.apply_metadata(outcome).await
            }
            Err(e) => {
                error!("{} 失败: {}", operation, e);
                if e == TransportError::NotConnected {
                    self.disconnected.store(true, Ordering::SeqCst);
                }
                OperationOutcome::failed(operation, e)
            }
        }
    }

    /// 带重试的动作执行
    async fn execute_with_retry(&self, operation: &SyncOperation) -> Result<u64, TransportError> {
        let max_retries = self.config.max_retries;
        let base_delay_ms = self.config.retry_base_delay_ms;
        let mut attempt = 0;

        loop {
            match self.execute_action(operation).await {
                Ok(bytes) => return Ok(bytes),
                Err(e) if attempt < max_retries && e != TransportError::NotConnected => {
                    // 指数退避
                    let delay = base_delay_ms.saturating_mul(2_u64.saturating_pow(attempt));
                    warn!(
                        "操作失败，{}ms 后重试 ({}/{}): {}",
                        delay,
                        attempt + 1,
                        max_retries,
                        e
                    );
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// 执行单个动作，返回传输的字节数
    async fn execute_action(&self, operation: &SyncOperation) -> Result<u64, TransportError> {
        match operation {
            SyncOperation::Upload { path, size } => {
                let local = self.local_path(path);
                let remote = self.remote_path(path);
                debug!("上传: {:?} -> {} ({}字节)", local, remote, size);
                self.transport.upload(&local, &remote).await
            }
            SyncOperation::EnterDir { path } => {
                let remote = self.remote_path(path);
                debug!("创建目录: {}", remote);
                self.transport.create_dir(&remote).await?;
                Ok(0)
            }
            SyncOperation::Remove { path, kind } => {
                let remote = self.remote_path(path);
                debug!("删除: {}", remote);
                let result = if kind.is_dir() {
                    self.transport.remove_dir(&remote).await
                } else {
                    self.transport.remove_file(&remote).await
                };
                match result {
                    Ok(()) => Ok(0),
                    // 已经不存在，视为删除成功
                    Err(e) if e.is_not_found() => {
                        debug!("远程条目已不存在: {}", remote);
                        Ok(0)
                    }
                    Err(e) => Err(e),
                }
            }
        }
    }

    /// 为成功的上传/目录创建设置权限和时间戳，失败只记录在结果上
    async fn apply_metadata(&self, outcome: OperationOutcome) -> OperationOutcome {
        let (path, set_timestamp) = match &outcome.operation {
            SyncOperation::Upload { path, .. } => (path.clone(), true),
            SyncOperation::EnterDir { path } => (path.clone(), false),
            SyncOperation::Remove { .. } => return outcome,
        };
        let remote = self.remote_path(&path);

        let metadata = match tokio::fs::metadata(self.local_path(&path)).await {
            Ok(m) => Some(m),
            Err(e) => {
                warn!("读取本地元数据失败: {}: {}", path, e);
                None
            }
        };

        let mode = metadata
            .as_ref()
            .filter(|_| self.config.preserve_permissions)
            .and_then(local_permissions);
        let permissions = match mode {
            Some(mode) => {
                let error = match self.transport.set_permissions(&remote, mode).await {
                    Ok(()) => {
                        info!("{} 的权限已设置为 {:o}", path, mode);
                        None
                    }
                    Err(e) => {
                        warn!("设置 {} 的权限失败: {}", path, e);
                        Some(e.to_string())
                    }
                };
                Some(PermissionResult { mode, error })
            }
            None => {
                info!("{} 的权限保持默认值", path);
                None
            }
        };

        let modified_time = metadata
            .as_ref()
            .filter(|_| set_timestamp && self.config.preserve_timestamps)
            .and_then(local_modified_time);
        let timestamp = match modified_time {
            Some(modified_time) => {
                let error = match self.transport.set_modified(&remote, modified_time).await {
                    Ok(()) => {
                        info!("{} 的时间戳已设置为 {}", path, format_time(modified_time));
                        None
                    }
                    Err(e) => {
                        warn!("设置 {} 的时间戳失败: {}", path, e);
                        Some(e.to_string())
                    }
                };
                Some(TimestampResult {
                    modified_time,
                    error,
                })
            }
            None => {
                if set_timestamp {
                    info!("{} 的时间戳保持默认值（当前时间）", path);
                }
                None
            }
        };

        outcome
            .with_permissions(permissions)
            .with_timestamp(timestamp)
    }
}

fn format_time(timestamp: i64) -> String {
    chrono::DateTime::from_timestamp(timestamp, 0)
        .map(|t| t.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| timestamp.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::{FailOn, MemoryTransport};
    use std::fs;

    fn quick_config() -> SyncConfig {
        SyncConfig {
            max_retries: 0,
            retry_base_delay_ms: 0,
            ..Default::default()
        }
    }

    fn executor(
        transport: &Arc<MemoryTransport>,
        local: &std::path::Path,
        config: SyncConfig,
    ) -> PlanExecutor {
        PlanExecutor::new(transport.clone(), local, "/r", config)
    }

    #[tokio::test]
    async fn test_upload_into_new_directory() {
        let local = tempfile::tempdir().unwrap();
        fs::create_dir(local.path().join("sub")).unwrap();
        fs::write(local.path().join("sub/b.txt"), b"bee").unwrap();

        let transport = Arc::new(MemoryTransport::new());
        transport.insert_dir("/r", 0);

        let plan = SyncPlan::new(vec![
            SyncOperation::enter_dir("sub"),
            SyncOperation::upload("sub/b.txt", 3),
        ]);
        let result = executor(&transport, local.path(), quick_config())
            .execute(&plan)
            .await;

        assert!(result.is_success);
        assert_eq!(result.uploads.len(), 2);
        assert_eq!(result.uploads[1].bytes, 3);
        assert_eq!(transport.node("/r/sub/b.txt").unwrap().data, b"bee");
        assert_eq!(
            transport.operations(),
            vec!["mkdir /r/sub", "put /r/sub/b.txt"]
        );
    }

    #[tokio::test]
    async fn test_failure_is_isolated() {
        let local = tempfile::tempdir().unwrap();
        for name in ["a.txt", "y.txt", "z.txt"] {
            fs::write(local.path().join(name), name.as_bytes()).unwrap();
        }
        let transport = Arc::new(MemoryTransport::new());
        transport.insert_dir("/r", 0);
        transport.insert_file("/r/old.txt", b"o", 1);
        transport.fail_on(FailOn::Upload, "/r/y.txt");

        let plan = SyncPlan::new(vec![
            SyncOperation::upload("a.txt", 5),
            SyncOperation::upload("y.txt", 5),
            SyncOperation::upload("z.txt", 5),
            SyncOperation::remove_file("old.txt"),
        ]);
        let result = executor(&transport, local.path(), quick_config())
            .execute(&plan)
            .await;

        assert!(!result.is_success);
        assert_eq!(result.failures.len(), 1);
        assert_eq!(result.failures[0].path(), "y.txt");
        assert!(result.failures[0].error.is_some());
        let uploaded: Vec<_> = result.uploads.iter().map(|o| o.path()).collect();
        assert_eq!(uploaded, vec!["a.txt", "z.txt"]);
        assert_eq!(result.removals.len(), 1);
        assert!(!transport.contains("/r/old.txt"));
    }

    #[tokio::test]
    async fn test_metadata_failure_keeps_upload_successful() {
        let local = tempfile::tempdir().unwrap();
        fs::write(local.path().join("m.txt"), b"meta").unwrap();
        let transport = Arc::new(MemoryTransport::new());
        transport.insert_dir("/r", 0);
        transport.fail_on(FailOn::Timestamp, "/r/m.txt");
        transport.fail_on(FailOn::Permissions, "/r/m.txt");

        let plan = SyncPlan::new(vec![SyncOperation::upload("m.txt", 4)]);
        let result = executor(&transport, local.path(), quick_config())
            .execute(&plan)
            .await;

        assert!(result.is_success);
        let outcome = &result.uploads[0];
        assert!(outcome.success);
        let timestamp = outcome.timestamp.as_ref().unwrap();
        assert!(timestamp.error.is_some());
        if cfg!(unix) {
            assert!(outcome.permissions.as_ref().unwrap().error.is_some());
        } else {
            assert!(outcome.permissions.is_none());
        }
    }

    #[tokio::test]
    async fn test_timestamp_and_permissions_applied() {
        let local = tempfile::tempdir().unwrap();
        fs::write(local.path().join("t.txt"), b"time").unwrap();
        let local_meta = fs::metadata(local.path().join("t.txt")).unwrap();
        let expected_mtime = local_modified_time(&local_meta).unwrap();

        let transport = Arc::new(MemoryTransport::new());
        transport.insert_dir("/r", 0);

        let plan = SyncPlan::new(vec![SyncOperation::upload("t.txt", 4)]);
        let result = executor(&transport, local.path(), quick_config())
            .execute(&plan)
            .await;

        let node = transport.node("/r/t.txt").unwrap();
        assert_eq!(node.modified_time, expected_mtime);
        assert_eq!(node.permissions, local_permissions(&local_meta));
        assert!(result.uploads[0].timestamp.as_ref().unwrap().error.is_none());
    }

    #[tokio::test]
    async fn test_metadata_skipped_when_disabled() {
        let local = tempfile::tempdir().unwrap();
        fs::write(local.path().join("t.txt"), b"time").unwrap();
        let transport = Arc::new(MemoryTransport::new());
        transport.insert_dir("/r", 0);

        let config = SyncConfig {
            preserve_permissions: false,
            preserve_timestamps: false,
            ..quick_config()
        };
        let plan = SyncPlan::new(vec![SyncOperation::upload("t.txt", 4)]);
        let result = executor(&transport, local.path(), config).execute(&plan).await;

        assert!(result.uploads[0].permissions.is_none());
        assert!(result.uploads[0].timestamp.is_none());
    }

    #[tokio::test]
    async fn test_removals_respect_order_with_concurrency() {
        let local = tempfile::tempdir().unwrap();
        let transport = Arc::new(MemoryTransport::new());
        transport.insert_file("/r/d/e/f.txt", b"1", 1);
        transport.insert_file("/r/d/g.txt", b"1", 1);
        transport.insert_file("/r/h.txt", b"1", 1);

        let plan = SyncPlan::new(vec![
            SyncOperation::remove_file("d/e/f.txt"),
            SyncOperation::remove_dir("d/e"),
            SyncOperation::remove_file("d/g.txt"),
            SyncOperation::remove_dir("d"),
            SyncOperation::remove_file("h.txt"),
        ]);
        let config = SyncConfig {
            max_concurrent_transfers: 8,
            ..quick_config()
        };
        let result = executor(&transport, local.path(), config).execute(&plan).await;

        assert!(result.is_success, "{:?}", result.failures);
        assert_eq!(result.removals.len(), 5);
        assert_eq!(transport.paths(), vec!["/r"]);
    }

    #[tokio::test]
    async fn test_remove_missing_entry_counts_as_removed() {
        let local = tempfile::tempdir().unwrap();
        let transport = Arc::new(MemoryTransport::new());
        transport.insert_dir("/r", 0);

        let plan = SyncPlan::new(vec![SyncOperation::remove_file("ghost.txt")]);
        let result = executor(&transport, local.path(), quick_config())
            .execute(&plan)
            .await;
        assert!(result.is_success);
        assert_eq!(result.removals.len(), 1);
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_max_retries() {
        let local = tempfile::tempdir().unwrap();
        fs::write(local.path().join("r.txt"), b"r").unwrap();
        let transport = Arc::new(MemoryTransport::new());
        transport.insert_dir("/r", 0);
        transport.fail_on(FailOn::Upload, "/r/r.txt");

        let config = SyncConfig {
            max_retries: 2,
            retry_base_delay_ms: 1,
            ..Default::default()
        };
        let plan = SyncPlan::new(vec![SyncOperation::upload("r.txt", 1)]);
        let result = executor(&transport, local.path(), config).execute(&plan).await;
        assert_eq!(result.failures.len(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_stops_scheduling() {
        let local = tempfile::tempdir().unwrap();
        for name in ["a.txt", "b.txt", "c.txt", "d.txt"] {
            fs::write(local.path().join(name), b"12345").unwrap();
        }
        let transport = Arc::new(MemoryTransport::new());
        transport.insert_dir("/r", 0);
        transport.fail_on(FailOn::Disconnect, "/r/b.txt");

        let config = SyncConfig {
            max_concurrent_transfers: 1,
            max_retries: 3,
            retry_base_delay_ms: 1,
            ..Default::default()
        };
        let plan = SyncPlan::new(
            ["a.txt", "b.txt", "c.txt", "d.txt"]
                .into_iter()
                .map(|name| SyncOperation::upload(name, 5))
                .collect(),
        );
        let result = executor(&transport, local.path(), config).execute(&plan).await;

        assert!(result.disconnected);
        assert_eq!(result.uploads.len(), 1);
        assert_eq!(result.failures.len(), 1);
        assert_eq!(result.failures[0].path(), "b.txt");
        assert_eq!(result.executed(), 2);
        assert_eq!(transport.operations(), vec!["put /r/a.txt"]);
    }

    #[derive(Clone, Default)]
    struct Capture(Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for Capture {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_kept_defaults_are_reported_at_info() {
        let local = tempfile::tempdir().unwrap();
        fs::write(local.path().join("t.txt"), b"time").unwrap();
        let transport = Arc::new(MemoryTransport::new());
        transport.insert_dir("/r", 0);

        let capture = Capture::default();
        let writer = capture.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let config = SyncConfig {
            preserve_permissions: false,
            preserve_timestamps: false,
            ..quick_config()
        };
        let plan = SyncPlan::new(vec![SyncOperation::upload("t.txt", 4)]);
        executor(&transport, local.path(), config).execute(&plan).await;

        let output = String::from_utf8(capture.0.lock().unwrap().clone()).unwrap();
        assert!(output.contains("t.txt 的权限保持默认值"), "{}", output);
        assert!(output.contains("t.txt 的时间戳保持默认值"), "{}", output);
    }
}
