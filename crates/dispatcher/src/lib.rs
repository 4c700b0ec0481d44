//! 调度协调：依赖检查、失败重试、失联 Worker 巡检与控制操作

pub mod controller;
pub mod dependency_checker;
pub mod retry_service;
pub mod worker_failure_detector;

#[cfg(test)]
pub mod test_utils;

pub use controller::{ControlOutcome, TaskController, TaskStatusSummary};
pub use dependency_checker::{DependencyCheckResult, DependencyCheckService, DependencyChecker};
pub use retry_service::{RetryService, TaskRetryService};
pub use worker_failure_detector::{
    SweepReport, WorkerFailureDetector, WorkerFailureDetectorConfig, WorkerFailureDetectorService,
};
