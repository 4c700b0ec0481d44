use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use taskyard_core::{
    config::RecoveryPolicy,
    models::{Task, TaskState},
    Filter, IndexValue, Modification, ObjectId, SchedulerResult,
};
use taskyard_infrastructure::Project;

/// 重试服务接口
#[async_trait]
pub trait RetryService: Send + Sync {
    /// 处理失败的任务，`restartable` 且未超过最大尝试次数时放回 created
    async fn handle_failed_task(&self, task_id: ObjectId) -> SchedulerResult<bool>;

    /// 按恢复策略处理失联 Worker 名下仍处于 queued/running 的任务
    async fn handle_worker_failure(&self, worker_id: ObjectId) -> SchedulerResult<Vec<ObjectId>>;
}

/// 重试服务实现
pub struct TaskRetryService {
    project: Arc<Project>,
    policy: RecoveryPolicy,
}

impl TaskRetryService {
    pub fn new(project: Arc<Project>, policy: Option<RecoveryPolicy>) -> Self {
        Self {
            project,
            policy: policy.unwrap_or_default(),
        }
    }

    pub fn policy(&self) -> RecoveryPolicy {
        self.policy
    }

    /// 仍处于 `state` 并归属于 `owner` 的这一个任务
    fn still_owned(task: &Task, state: TaskState, owner: Option<ObjectId>) -> Filter {
        Filter::new()
            .ids(vec![task.id])
            .eq("state", state)
            .eq("worker", owner)
    }

    /// 把任务从 `from` 放回 created 并解除 Worker 归属。
    /// 任务期间被其他 Worker 重新领取时不做修改。
    async fn requeue(
        &self,
        task: &Task,
        from: TaskState,
        owner: Option<ObjectId>,
    ) -> SchedulerResult<bool> {
        let modification = Modification::new("state", from, TaskState::Created)
            .also("worker", IndexValue::Null);
        let requeued = self
            .project
            .tasks
            .modify_one_where(&Self::still_owned(task, from, owner), &modification)
            .await?;
        Ok(requeued.is_some())
    }
}

#[async_trait]
impl RetryService for TaskRetryService {
    async fn handle_failed_task(&self, task_id: ObjectId) -> SchedulerResult<bool> {
        let task = self.project.tasks.reload(task_id).await?;

        if task.state != TaskState::Fail {
            debug!("任务 {} 当前状态为 {}，无需重试", task_id, task.state);
            return Ok(false);
        }

        if !task.may_auto_restart() {
            debug!(
                "任务 {} 不会自动重启 (restartable={}, 已尝试 {} 次)",
                task_id, task.restartable, task.attempts
            );
            return Ok(false);
        }

        let restarted = self.requeue(&task, TaskState::Fail, task.worker).await?;
        if restarted {
            info!("任务 {} 失败后自动重启，已尝试 {} 次", task_id, task.attempts);
        }
        Ok(restarted)
    }

    async fn handle_worker_failure(&self, worker_id: ObjectId) -> SchedulerResult<Vec<ObjectId>> {
        let filter = Filter::new().eq("worker", worker_id).any_of(
            "state",
            vec![TaskState::Queued.into(), TaskState::Running.into()],
        );
        let tasks = self.project.tasks.find(&filter).await?;

        if tasks.is_empty() {
            return Ok(Vec::new());
        }

        if self.policy == RecoveryPolicy::Ignore {
            warn!(
                "Worker {} 失联，按策略保留其 {} 个任务的状态",
                worker_id,
                tasks.len()
            );
            return Ok(Vec::new());
        }

        let mut recovered = Vec::new();
        for task in tasks {
            let handled = match self.policy {
                RecoveryPolicy::Requeue => {
                    self.requeue(&task, task.state, Some(worker_id)).await?
                }
                RecoveryPolicy::MarkFailed => {
                    let failed = self
                        .project
                        .tasks
                        .modify_one_where(
                            &Self::still_owned(&task, task.state, Some(worker_id)),
                            &Modification::new("state", task.state, TaskState::Fail),
                        )
                        .await?
                        .is_some();
                    if failed {
                        self.handle_failed_task(task.id).await?;
                    }
                    failed
                }
                RecoveryPolicy::Ignore => false,
            };

            if handled {
                info!(
                    "Worker {} 失联，任务 {} 已从 {} 恢复 ({:?})",
                    worker_id, task.id, task.state, self.policy
                );
                recovered.push(task.id);
            } else {
                debug!("任务 {} 状态已变化，跳过恢复", task.id);
            }
        }

        Ok(recovered)
    }
}
