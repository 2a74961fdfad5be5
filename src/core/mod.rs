pub mod comparator;
pub mod executor;
pub mod orchestrator;
pub mod result;
pub mod scanner;
pub mod snapshot;

pub use comparator::{CompareConfig, FileComparator, FileRelation, PlanSummary, SyncOperation, SyncPlan};
pub use executor::{PlanExecutor, SyncConfig};
pub use orchestrator::{RunState, SyncRunner};
pub use result::{OperationOutcome, PermissionResult, SyncResult, TimestampResult};
pub use scanner::{FileScanner, RemoteScan, ScanConfig};
pub use snapshot::DirectorySnapshot;
