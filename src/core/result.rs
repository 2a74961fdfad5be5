//! 同步结果

use crate::core::comparator::SyncOperation;
use serde::Serialize;

/// 权限设置结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionResult {
    pub mode: u32,
    pub error: Option<String>,
}

/// 时间戳设置结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimestampResult {
    pub modified_time: i64,
    pub error: Option<String>,
}

/// 单个动作的执行结果
///
/// `permissions`/`timestamp` 为 None 表示未尝试（保持远程默认值）。
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationOutcome {
    pub operation: SyncOperation,
    pub success: bool,
    pub error: Option<String>,
    pub permissions: Option<PermissionResult>,
    pub timestamp: Option<TimestampResult>,
    pub bytes: u64,
}

impl OperationOutcome {
    pub fn succeeded(operation: SyncOperation, bytes: u64) -> Self {
        Self {
            operation,
            success: true,
            error: None,
            permissions: None,
            timestamp: None,
            bytes,
        }
    }

    pub fn failed(operation: SyncOperation, error: impl ToString) -> Self {
        Self {
            operation,
            success: false,
            error: Some(error.to_string()),
            permissions: None,
            timestamp: None,
            bytes: 0,
        }
    }

    pub fn with_permissions(mut self, permissions: Option<PermissionResult>) -> Self {
        self.permissions = permissions;
        self
    }

    pub fn with_timestamp(mut self, timestamp: Option<TimestampResult>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn path(&self) -> &str {
        self.operation.path()
    }

    /// 失败信息，形如 "上传 a.txt (3 字节): 原因"
    pub fn message(&self) -> String {
        match &self.error {
            Some(e) => format!("{}: {}", self.operation, e),
            None => self.operation.to_string(),
        }
    }
}

/// 一次运行的汇总结果
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResult {
    pub is_success: bool,
    /// 成功的上传和目录创建
    pub uploads: Vec<OperationOutcome>,
    /// 成功的删除
    pub removals: Vec<OperationOutcome>,
    pub failures: Vec<OperationOutcome>,
    /// 会话在执行中断开，剩余动作未执行
    pub disconnected: bool,
}

impl SyncResult {
    /// 按计划顺序汇总
    pub fn from_outcomes(outcomes: impl IntoIterator<Item = OperationOutcome>) -> Self {
        let mut uploads = Vec::new();
        let mut removals = Vec::new();
        let mut failures = Vec::new();

        for outcome in outcomes {
            if !outcome.success {
                failures.push(outcome);
            } else if outcome.operation.is_removal() {
                removals.push(outcome);
            } else {
                uploads.push(outcome);
            }
        }

        Self {
            is_success: failures.is_empty(),
            uploads,
            removals,
            failures,
            disconnected: false,
        }
    }

    pub fn executed(&self) -> usize {
        self.uploads.len() + self.removals.len() + self.failures.len()
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.uploads.iter().map(|o| o.bytes).sum()
    }

    /// 元数据设置失败的成功动作数
    pub fn metadata_warnings(&self) -> usize {
        self.uploads
            .iter()
            .filter(|o| {
                o.permissions.as_ref().is_some_and(|p| p.error.is_some())
                    || o.timestamp.as_ref().is_some_and(|t| t.error.is_some())
            })
            .count()
    }
}
