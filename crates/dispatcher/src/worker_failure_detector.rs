use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::counter;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use taskyard_core::{
    config::DispatcherConfig,
    models::{TaskState, WorkerRecord, WorkerState},
    Filter, ObjectId, SchedulerResult,
};
use taskyard_infrastructure::Project;

use crate::retry_service::RetryService;

/// Worker失效检测配置
#[derive(Debug, Clone)]
pub struct WorkerFailureDetectorConfig {
    /// 心跳超时时间（秒）
    pub dead_time_seconds: i64,
    /// 检测间隔（秒）
    pub detection_interval_seconds: u64,
}

impl Default for WorkerFailureDetectorConfig {
    fn default() -> Self {
        DispatcherConfig::default().into()
    }
}

impl From<DispatcherConfig> for WorkerFailureDetectorConfig {
    fn from(config: DispatcherConfig) -> Self {
        Self {
            dead_time_seconds: config.dead_time_seconds,
            detection_interval_seconds: config.sweep_interval_seconds,
        }
    }
}

/// 一次巡检的结果
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub dead_workers: Vec<ObjectId>,
    pub recovered_tasks: Vec<ObjectId>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.dead_workers.is_empty() && self.recovered_tasks.is_empty()
    }
}

/// Worker失效检测服务接口
#[async_trait]
pub trait WorkerFailureDetectorService: Send + Sync {
    /// 启动失效检测，直到 `stop_detection` 被调用
    async fn start_detection(&self) -> SchedulerResult<()>;

    async fn stop_detection(&self) -> SchedulerResult<()>;

    /// 检测心跳超时的Worker
    async fn detect_failed_workers(&self) -> SchedulerResult<Vec<Arc<WorkerRecord>>>;

    /// 标记为 dead 并恢复其任务，返回被恢复的任务
    async fn handle_failed_worker(&self, worker: &WorkerRecord) -> SchedulerResult<Vec<ObjectId>>;

    /// 执行一次完整巡检
    async fn sweep(&self) -> SchedulerResult<SweepReport>;
}

/// Worker失效检测服务实现
pub struct WorkerFailureDetector {
    project: Arc<Project>,
    retry_service: Arc<dyn RetryService>,
    config: WorkerFailureDetectorConfig,
    running: Arc<tokio::sync::RwLock<bool>>,
}

impl WorkerFailureDetector {
    pub fn new(
        project: Arc<Project>,
        retry_service: Arc<dyn RetryService>,
        config: Option<WorkerFailureDetectorConfig>,
    ) -> Self {
        Self {
            project,
            retry_service,
            config: config.unwrap_or_default(),
            running: Arc::new(tokio::sync::RwLock::new(false)),
        }
    }

    fn is_worker_failed(&self, worker: &WorkerRecord, now: DateTime<Utc>) -> bool {
        worker.state == WorkerState::Running
            && worker.is_heartbeat_expired(self.config.dead_time_seconds, now)
    }

    /// 仍归属于已失联或已退出 Worker 的活动任务，例如上一次巡检中途失败留下的
    async fn recover_orphans(&self) -> SchedulerResult<Vec<ObjectId>> {
        let active = self
            .project
            .tasks
            .find(&Filter::new().any_of(
                "state",
                vec![TaskState::Queued.into(), TaskState::Running.into()],
            ))
            .await?;

        let mut owners: BTreeMap<ObjectId, usize> = BTreeMap::new();
        for task in &active {
            if let Some(worker) = task.worker {
                *owners.entry(worker).or_default() += 1;
            }
        }
        if owners.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<ObjectId> = owners.keys().copied().collect();
        let states = self.project.workers.index_of(&ids, "state").await?;

        let mut recovered = Vec::new();
        for id in ids {
            let alive = states
                .get(&id)
                .and_then(|s| s.as_text())
                .is_some_and(|s| s == WorkerState::Running.as_str());
            if !alive {
                warn!("任务仍归属于不在运行的Worker {}，执行恢复", id);
                recovered.extend(self.retry_service.handle_worker_failure(id).await?);
            }
        }
        Ok(recovered)
    }

    async fn detection_loop(&self) -> SchedulerResult<()> {
        info!("启动Worker失效检测循环");

        let interval_duration = Duration::from_secs(self.config.detection_interval_seconds);

        loop {
            if !*self.running.read().await {
                info!("收到停止信号，退出Worker失效检测循环");
                break;
            }

            match self.sweep().await {
                Ok(report) if !report.is_empty() => {
                    info!(
                        "巡检完成: {} 个失效Worker, {} 个任务已恢复",
                        report.dead_workers.len(),
                        report.recovered_tasks.len()
                    );
                }
                Ok(_) => debug!("巡检完成，未发现失效Worker"),
                Err(e) => error!("Worker失效检测时出错: {}", e),
            }

            tokio::time::sleep(interval_duration).await;
        }

        Ok(())
    }
}

#[async_trait]
impl WorkerFailureDetectorService for WorkerFailureDetector {
    async fn start_detection(&self) -> SchedulerResult<()> {
        info!("启动Worker失效检测服务");
        {
            let mut running = self.running.write().await;
            *running = true;
        }
        self.detection_loop().await
    }

    async fn stop_detection(&self) -> SchedulerResult<()> {
        info!("停止Worker失效检测服务");
        let mut running = self.running.write().await;
        *running = false;
        Ok(())
    }

    async fn detect_failed_workers(&self) -> SchedulerResult<Vec<Arc<WorkerRecord>>> {
        let now = Utc::now();
        let workers = self
            .project
            .workers
            .find(&Filter::new().eq("state", WorkerState::Running))
            .await?;

        let failed: Vec<Arc<WorkerRecord>> = workers
            .into_iter()
            .filter(|worker| self.is_worker_failed(worker, now))
            .collect();

        for worker in &failed {
            warn!(
                "检测到失效Worker: {} ({}), 上次心跳: {}",
                worker.name,
                worker.id,
                worker.seen.format("%Y-%m-%d %H:%M:%S UTC")
            );
        }
        Ok(failed)
    }

    async fn handle_failed_worker(&self, worker: &WorkerRecord) -> SchedulerResult<Vec<ObjectId>> {
        let marked = self
            .project
            .workers
            .modify_if(worker.id, "state", WorkerState::Running, WorkerState::Dead)
            .await?;
        if marked.is_none() {
            debug!("Worker {} 状态已变化，跳过", worker.id);
            return Ok(Vec::new());
        }

        counter!("taskyard_workers_dead_total").increment(1);
        info!("Worker {} 已标记为 dead", worker.id);
        let recovered = self.retry_service.handle_worker_failure(worker.id).await?;
        counter!("taskyard_tasks_recovered_total").increment(recovered.len() as u64);
        Ok(recovered)
    }

    async fn sweep(&self) -> SchedulerResult<SweepReport> {
        let mut report = SweepReport::default();

        for worker in self.detect_failed_workers().await? {
            match self.handle_failed_worker(&worker).await {
                Ok(recovered) => {
                    report.dead_workers.push(worker.id);
                    report.recovered_tasks.extend(recovered);
                }
                Err(e) => error!("处理失效Worker {} 时出错: {}", worker.id, e),
            }
        }

        for id in self.recover_orphans().await? {
            if !report.recovered_tasks.contains(&id) {
                report.recovered_tasks.push(id);
            }
        }

        Ok(report)
    }
}
