use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use taskyard_core::{
    models::{Task, TaskState, WorkerCommand, WorkerState},
    Filter, IndexValue, Modification, ObjectId, SchedulerError, SchedulerResult,
};
use taskyard_infrastructure::Project;

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct TaskStatusSummary {
    pub created: u64,
    pub queued: u64,
    pub running: u64,
    pub success: u64,
    pub fail: u64,
    pub cancelled: u64,
    pub halted: u64,
}

impl TaskStatusSummary {
    pub fn total(&self) -> u64 {
        self.created
            + self.queued
            + self.running
            + self.success
            + self.fail
            + self.cancelled
            + self.halted
    }

    pub fn active(&self) -> u64 {
        self.queued + self.running
    }

    pub fn finished(&self) -> u64 {
        self.success + self.fail + self.cancelled + self.halted
    }
}

/// 控制操作的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlOutcome {
    /// 直接在存储中完成了状态转换
    Transitioned(TaskState),
    /// 任务正在执行，已向所属 Worker 发送命令
    Signalled(ObjectId),
}

/// 控制端对任务和 Worker 的操作
pub struct TaskController {
    project: Arc<Project>,
}

impl TaskController {
    pub fn new(project: Arc<Project>) -> Self {
        Self { project }
    }

    pub async fn cancel(&self, task_id: ObjectId) -> SchedulerResult<ControlOutcome> {
        self.stop(task_id, TaskState::Cancelled, WorkerCommand::Cancel)
            .await
    }

    pub async fn halt(&self, task_id: ObjectId) -> SchedulerResult<ControlOutcome> {
        self.stop(task_id, TaskState::Halted, WorkerCommand::Halt).await
    }

    /// 未开始的任务直接转换，执行中的任务交给所属 Worker 在下一次轮询时处理
    async fn stop(
        &self,
        task_id: ObjectId,
        target: TaskState,
        command: WorkerCommand,
    ) -> SchedulerResult<ControlOutcome> {
        loop {
            let task = self.project.tasks.reload(task_id).await?;
            if !task.state.can_transition_to(target) {
                return Err(SchedulerError::InvalidTransition {
                    from: task.state,
                    to: target,
                });
            }

            if task.state == TaskState::Running {
                if let Some(worker) = task.worker {
                    let record = self.project.workers.load(worker).await?;
                    if record.current == Some(task_id) {
                        self.send_command(worker, command.clone()).await?;
                        info!("任务 {} 正在 Worker {} 上执行，已发送 {}", task_id, worker, command);
                        return Ok(ControlOutcome::Signalled(worker));
                    }
                }
            }

            let changed = self
                .project
                .tasks
                .modify_if(task_id, "state", task.state, target)
                .await?;
            if changed.is_some() {
                info!("任务 {}: {} -> {}", task_id, task.state, target);
                return Ok(ControlOutcome::Transitioned(target));
            }
            debug!("任务 {} 状态在操作期间发生变化，重试", task_id);
        }
    }

    /// 把失败或中止的任务放回 created
    pub async fn restart(&self, task_id: ObjectId) -> SchedulerResult<Arc<Task>> {
        let task = self.project.tasks.reload(task_id).await?;
        let mut restarted = (*task).clone();
        restarted.restart()?;

        let modification = Modification::new("state", task.state, TaskState::Created)
            .also("worker", IndexValue::Null);
        let updated = self
            .project
            .tasks
            .modify_by_id(task_id, &modification)
            .await?
            .ok_or(SchedulerError::InvalidTransition {
                from: task.state,
                to: TaskState::Created,
            })?;

        info!("重启任务 {} (原状态 {})", task_id, task.state);
        Ok(updated)
    }

    /// 写入 Worker 的命令字段。上一条命令尚未被消费时返回 false。
    pub async fn send_command(
        &self,
        worker_id: ObjectId,
        command: WorkerCommand,
    ) -> SchedulerResult<bool> {
        let sent = self
            .project
            .workers
            .modify_if(worker_id, "command", IndexValue::Null, command.to_string())
            .await?
            .is_some();
        if !sent {
            warn!("Worker {} 还有未处理的命令，{} 未发送", worker_id, command);
        }
        Ok(sent)
    }

    /// 通知所有运行中的 Worker 退出
    pub async fn shutdown_all(&self) -> SchedulerResult<usize> {
        let workers = self
            .project
            .workers
            .find(&Filter::new().eq("state", WorkerState::Running))
            .await?;
        let mut sent = 0;
        for worker in workers {
            if self.send_command(worker.id, WorkerCommand::Shutdown).await? {
                sent += 1;
            }
        }
        info!("已向 {} 个 Worker 发送 shutdown", sent);
        Ok(sent)
    }

    pub async fn status_summary(&self) -> SchedulerResult<TaskStatusSummary> {
        let tasks = &self.project.tasks;
        let count = |state: TaskState| async move {
            tasks.count(&Filter::new().eq("state", state)).await
        };

        Ok(TaskStatusSummary {
            created: count(TaskState::Created).await?,
            queued: count(TaskState::Queued).await?,
            running: count(TaskState::Running).await?,
            success: count(TaskState::Success).await?,
            fail: count(TaskState::Fail).await?,
            cancelled: count(TaskState::Cancelled).await?,
            halted: count(TaskState::Halted).await?,
        })
    }
}
