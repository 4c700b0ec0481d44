pub mod app_config;
pub mod database;
pub mod dispatcher_worker;
pub mod observability;
pub mod project_staging;

pub use app_config::AppConfig;
pub use database::DatabaseConfig;
pub use dispatcher_worker::{DispatcherConfig, RecoveryPolicy, WorkerConfig};
pub use observability::ObservabilityConfig;
pub use project_staging::{CacheConfig, CacheMode, ExecutionContext, ProjectConfig, StagingConfig};
