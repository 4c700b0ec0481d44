//! Worker：领取任务、在独立工作目录中运行、上报结果

pub mod components;
pub mod scheduler;
pub mod service;

pub use scheduler::{ActiveTask, StartOutcome, TaskReport, TaskScheduler};
pub use service::{WorkerService, WorkerServiceBuilder, WorkerSummary};
