pub mod directive_runner;
pub mod heartbeat_manager;
pub mod task_execution;
pub mod worker_lifecycle;

pub use directive_runner::DirectiveRunner;
pub use heartbeat_manager::HeartbeatManager;
pub use task_execution::{run_diagnostic, ProcessOutcome, RunningProcess};
pub use worker_lifecycle::{LifecycleAction, WorkerLifecycle};
