pub mod memory;
pub mod sqlite;

pub use memory::MemoryBackend;
pub use sqlite::{DatabaseManager, SqliteDocumentBackend};

use std::sync::Arc;
use taskyard_core::{config::DatabaseConfig, DocumentBackend, SchedulerResult};
use tracing::info;

/// 按配置打开文档后端：`memory://` 使用进程内存储，否则连接 SQLite
pub async fn open_backend(config: &DatabaseConfig) -> SchedulerResult<Arc<dyn DocumentBackend>> {
    if config.is_memory() {
        info!("使用内存存储后端");
        return Ok(Arc::new(MemoryBackend::new()));
    }

    let manager = DatabaseManager::new(config).await?;
    manager.migrate().await?;
    info!("已连接SQLite存储: {}", config.url);
    Ok(Arc::new(SqliteDocumentBackend::new(manager.pool().clone())))
}
