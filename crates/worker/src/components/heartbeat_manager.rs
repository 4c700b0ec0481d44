use std::sync::Arc;

use chrono::Utc;
use metrics::counter;
use taskyard_core::models::{WorkerRecord, WorkerState};
use taskyard_core::{ObjectId, SchedulerResult};
use taskyard_infrastructure::Project;
use tracing::{debug, warn};

/// 维护 Worker 记录上的心跳时间
pub struct HeartbeatManager {
    project: Arc<Project>,
    worker_id: ObjectId,
}

impl HeartbeatManager {
    pub fn new(project: Arc<Project>, worker_id: ObjectId) -> Self {
        Self { project, worker_id }
    }

    /// 写入一次心跳，只改 `seen` 字段
    ///
    /// 如果巡检已经把本 Worker 判定为 dead，心跳会把它改回 running；
    /// 已被放回的任务不会再回来。
    pub async fn beat(&self) -> SchedulerResult<Arc<WorkerRecord>> {
        let now = Utc::now().timestamp_millis();
        let record = self
            .project
            .workers
            .set_field(self.worker_id, "seen", now)
            .await?;
        debug!("心跳: worker={}", self.worker_id);

        if record.state == WorkerState::Dead {
            warn!("Worker {} 曾被判定为失联，恢复为运行状态", self.worker_id);
            counter!("taskyard_workers_revived_total").increment(1);
            if let Some(revived) = self
                .project
                .workers
                .modify_if(self.worker_id, "state", WorkerState::Dead, WorkerState::Running)
                .await?
            {
                return Ok(revived);
            }
        }
        Ok(record)
    }
}
