use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use taskyard_core::{config::ProjectConfig, models::WorkerRecord, ObjectId, SchedulerResult};
use taskyard_infrastructure::{MemoryBackend, Project};

use crate::retry_service::RetryService;

pub fn memory_project() -> Arc<Project> {
    Arc::new(Project::new(
        ProjectConfig::default(),
        Arc::new(MemoryBackend::new()),
    ))
}

/// 注册一个最近心跳在 `seconds_ago` 秒前的Worker
pub async fn register_worker(project: &Project, seconds_ago: i64) -> WorkerRecord {
    let mut worker = WorkerRecord::new("w", "localhost", "/tmp");
    worker.seen = Utc::now() - Duration::seconds(seconds_ago);
    project.workers.save(&worker).await.unwrap();
    worker
}

#[derive(Debug, Clone, Default)]
pub struct MockRetryService;

#[async_trait]
impl RetryService for MockRetryService {
    async fn handle_failed_task(&self, _task_id: ObjectId) -> SchedulerResult<bool> {
        Ok(false)
    }

    async fn handle_worker_failure(&self, _worker_id: ObjectId) -> SchedulerResult<Vec<ObjectId>> {
        Ok(vec![])
    }
}
