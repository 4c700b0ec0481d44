use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use taskyard_core::{
    models::{dependency_okay, Task, TaskState},
    IndexValue, ObjectId, SchedulerResult,
};
use taskyard_infrastructure::Project;

#[derive(Debug, Clone)]
pub struct DependencyCheckResult {
    pub can_execute: bool,
    pub blocking_dependencies: Vec<ObjectId>,
    pub reason: Option<String>,
}

#[async_trait]
pub trait DependencyCheckService: Send + Sync {
    /// 检查单个任务的依赖是否全部成功
    async fn check_dependencies(&self, task: &Task) -> SchedulerResult<DependencyCheckResult>;

    /// 从候选任务中挑出依赖已满足的任务，保持原顺序
    async fn ready_among(&self, candidates: &[Arc<Task>]) -> SchedulerResult<Vec<ObjectId>>;

    /// 递归查找阻塞该任务、自身已经可以执行的 created 依赖
    async fn unmet_created_dependencies(&self, task: &Task) -> SchedulerResult<Vec<ObjectId>>;
}

pub struct DependencyChecker {
    project: Arc<Project>,
}

fn state_of(value: Option<&IndexValue>) -> Option<TaskState> {
    value.and_then(IndexValue::as_text).and_then(|s| s.parse().ok())
}

impl DependencyChecker {
    pub fn new(project: Arc<Project>) -> Self {
        Self { project }
    }

    async fn dependency_states(
        &self,
        ids: &[ObjectId],
    ) -> SchedulerResult<HashMap<ObjectId, IndexValue>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        self.project.tasks.index_of(ids, "state").await
    }

    fn is_satisfied(task: &Task, states: &HashMap<ObjectId, IndexValue>) -> bool {
        let known: Option<Vec<TaskState>> = task
            .dependencies
            .iter()
            .map(|id| state_of(states.get(id)))
            .collect();
        known.is_some_and(|states| dependency_okay(&states))
    }
}

#[async_trait]
impl DependencyCheckService for DependencyChecker {
    async fn check_dependencies(&self, task: &Task) -> SchedulerResult<DependencyCheckResult> {
        let states = self.dependency_states(&task.dependencies).await?;

        let blocking: Vec<ObjectId> = task
            .dependencies
            .iter()
            .filter(|id| state_of(states.get(*id)) != Some(TaskState::Success))
            .copied()
            .collect();

        if blocking.is_empty() {
            return Ok(DependencyCheckResult {
                can_execute: true,
                blocking_dependencies: blocking,
                reason: None,
            });
        }

        let reason = blocking
            .iter()
            .map(|id| match state_of(states.get(id)) {
                Some(state) => format!("{id}={state}"),
                None => format!("{id}=缺失"),
            })
            .collect::<Vec<_>>()
            .join(", ");
        debug!("任务 {} 的依赖未满足: {}", task.id, reason);

        Ok(DependencyCheckResult {
            can_execute: false,
            blocking_dependencies: blocking,
            reason: Some(format!("依赖未满足: {reason}")),
        })
    }

    async fn ready_among(&self, candidates: &[Arc<Task>]) -> SchedulerResult<Vec<ObjectId>> {
        let ids: Vec<ObjectId> = candidates
            .iter()
            .flat_map(|task| task.dependencies.iter().copied())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        let states = self.dependency_states(&ids).await?;

        Ok(candidates
            .iter()
            .filter(|task| Self::is_satisfied(task, &states))
            .map(|task| task.id)
            .collect())
    }

    async fn unmet_created_dependencies(&self, task: &Task) -> SchedulerResult<Vec<ObjectId>> {
        let mut visited: HashSet<ObjectId> = HashSet::new();
        let mut pending: Vec<ObjectId> = task.dependencies.clone();
        let mut runnable = Vec::new();

        while let Some(id) = pending.pop() {
            if !visited.insert(id) {
                continue;
            }
            let Some(dependency) = self.project.tasks.get(id).await? else {
                continue;
            };
            if dependency.state != TaskState::Created {
                continue;
            }

            let states = self.dependency_states(&dependency.dependencies).await?;
            if Self::is_satisfied(&dependency, &states) {
                runnable.push(id);
            } else {
                pending.extend(
                    dependency
                        .dependencies
                        .iter()
                        .filter(|dep| state_of(states.get(*dep)) != Some(TaskState::Success))
                        .copied(),
                );
            }
        }

        runnable.sort();
        debug!("任务 {} 可自动提交的依赖: {:?}", task.id, runnable);
        Ok(runnable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::memory_project;

    async fn saved(project: &Project, mut task: Task, deps: &[&Task]) -> Task {
        for dep in deps {
            task.add_dependency(dep).unwrap();
        }
        project.queue(&task).await.unwrap();
        task
    }

    async fn set_state(project: &Project, task: &Task, state: TaskState) {
        project.tasks.set_field(task.id, "state", state).await.unwrap();
    }

    #[tokio::test]
    async fn test_ready_iff_all_dependencies_succeeded() {
        let project = memory_project();
        let checker = DependencyChecker::new(project.clone());
        let a = saved(&project, Task::new("a"), &[]).await;
        let b = saved(&project, Task::new("b"), &[]).await;
        let c = saved(&project, Task::new("c"), &[&a, &b]).await;

        let result = checker.check_dependencies(&c).await.unwrap();
        assert!(!result.can_execute);
        assert_eq!(result.blocking_dependencies, vec![a.id, b.id]);

        set_state(&project, &a, TaskState::Success).await;
        set_state(&project, &b, TaskState::Success).await;
        assert!(checker.check_dependencies(&c).await.unwrap().can_execute);

        set_state(&project, &b, TaskState::Fail).await;
        let result = checker.check_dependencies(&c).await.unwrap();
        assert!(!result.can_execute);
        assert_eq!(result.blocking_dependencies, vec![b.id]);
    }

    #[tokio::test]
    async fn test_ready_among_keeps_only_ready_candidates() {
        let project = memory_project();
        let checker = DependencyChecker::new(project.clone());
        let a = saved(&project, Task::new("a"), &[]).await;
        let b = saved(&project, Task::new("b"), &[&a]).await;

        let candidates = vec![Arc::new(a.clone()), Arc::new(b.clone())];
        assert_eq!(checker.ready_among(&candidates).await.unwrap(), vec![a.id]);

        set_state(&project, &a, TaskState::Success).await;
        assert_eq!(
            checker.ready_among(&candidates).await.unwrap(),
            vec![a.id, b.id]
        );
    }

    #[tokio::test]
    async fn test_unmet_created_dependencies_walks_the_chain() {
        let project = memory_project();
        let checker = DependencyChecker::new(project.clone());
        let a = saved(&project, Task::new("a"), &[]).await;
        let b = saved(&project, Task::new("b"), &[&a]).await;
        let c = saved(&project, Task::new("c"), &[]).await;
        let d = saved(&project, Task::new("d"), &[&b, &c]).await;

        let mut runnable = checker.unmet_created_dependencies(&d).await.unwrap();
        runnable.sort();
        assert_eq!(runnable, vec![a.id, c.id]);

        set_state(&project, &a, TaskState::Running).await;
        assert_eq!(
            checker.unmet_created_dependencies(&d).await.unwrap(),
            vec![c.id]
        );
    }
}
