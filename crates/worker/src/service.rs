use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use taskyard_core::models::{LogRecord, LogStream, Task, TaskState, WorkerCommand, WorkerRecord, WorkerState};
use taskyard_core::{
    AppConfig, IndexValue, Modification, ObjectId, RecoveryPolicy, SchedulerResult, StagingConfig,
    WorkerConfig,
};
use taskyard_dispatcher::{DependencyChecker, RetryService, TaskRetryService};
use taskyard_infrastructure::error_handling::record_unavailable;
use taskyard_infrastructure::{retry_transient, Backoff, Project, StoreOperation};
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::components::{run_diagnostic, HeartbeatManager, LifecycleAction, WorkerLifecycle};
use crate::scheduler::{ActiveTask, StartOutcome, TaskReport, TaskScheduler};

const DIAGNOSTIC_TIMEOUT: Duration = Duration::from_secs(60);
const EXIT_ATTEMPTS: usize = 5;

/// Worker服务构建器
pub struct WorkerServiceBuilder {
    project: Arc<Project>,
    config: WorkerConfig,
    staging: StagingConfig,
    recovery_policy: Option<RecoveryPolicy>,
    hostname: String,
    exit_when_idle: bool,
    retry: Option<Arc<dyn RetryService>>,
}

impl WorkerServiceBuilder {
    pub fn new(project: Arc<Project>) -> Self {
        Self {
            project,
            config: WorkerConfig::default(),
            staging: StagingConfig::default(),
            recovery_policy: None,
            hostname: hostname::get()
                .unwrap_or_else(|_| "unknown".into())
                .to_string_lossy()
                .to_string(),
            exit_when_idle: false,
            retry: None,
        }
    }

    /// 按应用配置初始化
    pub fn from_config(project: Arc<Project>, config: &AppConfig) -> Self {
        Self::new(project)
            .worker_config(config.worker.clone())
            .staging(config.staging.clone())
            .recovery_policy(config.dispatcher.recovery_policy)
    }

    pub fn worker_config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn staging(mut self, staging: StagingConfig) -> Self {
        self.staging = staging;
        self
    }

    pub fn recovery_policy(mut self, policy: RecoveryPolicy) -> Self {
        self.recovery_policy = Some(policy);
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = Some(name.into());
        self
    }

    pub fn work_root(mut self, work_root: impl Into<String>) -> Self {
        self.config.work_root = work_root.into();
        self
    }

    /// 设置心跳间隔
    pub fn heartbeat_interval_seconds(mut self, seconds: u64) -> Self {
        self.config.heartbeat_interval_seconds = seconds;
        self
    }

    /// 设置轮询间隔
    pub fn poll_interval_ms(mut self, poll_interval_ms: u64) -> Self {
        self.config.poll_interval_ms = poll_interval_ms;
        self
    }

    pub fn walltime_seconds(mut self, walltime: Option<u64>, grace: u64) -> Self {
        self.config.walltime_seconds = walltime;
        self.config.walltime_grace_seconds = grace;
        self
    }

    /// 只领取这些生成器产生的任务
    pub fn generators<I, S>(mut self, generators: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.generators = generators.into_iter().map(Into::into).collect();
        self
    }

    pub fn auto_submit_dependencies(mut self, enabled: bool) -> Self {
        self.config.auto_submit_dependencies = enabled;
        self
    }

    pub fn keep_workdirs(mut self, keep: bool) -> Self {
        self.config.keep_workdirs = keep;
        self
    }

    pub fn store_backoff_ms(mut self, initial: u64, max: u64) -> Self {
        self.config.store_backoff_initial_ms = initial;
        self.config.store_backoff_max_ms = max;
        self
    }

    /// 设置主机名
    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    /// 没有可领取的任务时自动退出
    pub fn exit_when_idle(mut self, enabled: bool) -> Self {
        self.exit_when_idle = enabled;
        self
    }

    pub fn retry_service(mut self, retry: Arc<dyn RetryService>) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn build(self) -> WorkerService {
        let retry = self.retry.unwrap_or_else(|| {
            Arc::new(TaskRetryService::new(self.project.clone(), self.recovery_policy))
        });
        WorkerService {
            project: self.project,
            config: self.config,
            staging: self.staging,
            hostname: self.hostname,
            exit_when_idle: self.exit_when_idle,
            retry,
        }
    }
}

/// 一次运行的统计
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerSummary {
    pub worker_id: Option<ObjectId>,
    pub succeeded: u64,
    pub failed: u64,
    pub stopped: u64,
}

struct LoopState {
    scheduler: TaskScheduler,
    lifecycle: WorkerLifecycle,
    /// 已领取、尚未启动的任务
    claimed: Option<Arc<Task>>,
    active: Option<ActiveTask>,
    /// 已在本机生成、尚未写入存储的报告
    pending: Option<TaskReport>,
    summary: WorkerSummary,
}

impl LoopState {
    fn is_idle(&self) -> bool {
        self.active.is_none() && self.pending.is_none()
    }
}

/// Worker服务实现
///
/// 单个轮询循环：一次只运行一个任务，子进程只通过 `try_wait` 检查，
/// 心跳和控制命令在同一个循环里处理。
pub struct WorkerService {
    project: Arc<Project>,
    config: WorkerConfig,
    staging: StagingConfig,
    hostname: String,
    exit_when_idle: bool,
    retry: Arc<dyn RetryService>,
}

impl WorkerService {
    pub fn builder(project: Arc<Project>) -> WorkerServiceBuilder {
        WorkerServiceBuilder::new(project)
    }

    fn work_root(&self) -> PathBuf {
        let root = PathBuf::from(&self.config.work_root);
        if root.is_absolute() {
            root
        } else {
            std::env::current_dir()
                .map(|cwd| cwd.join(&root))
                .unwrap_or(root)
        }
    }

    async fn register(&self, work_root: &Path) -> SchedulerResult<WorkerRecord> {
        let name = self
            .config
            .name
            .clone()
            .unwrap_or_else(|| format!("{}-{}", self.hostname, std::process::id()));
        let mut record = WorkerRecord::new(name, &self.hostname, work_root.to_string_lossy());
        record.session = uuid::Uuid::new_v4().to_string();
        record.generators = self.config.generators.clone();
        record.walltime_seconds = self.config.walltime_seconds;

        let mut backoff = self.backoff();
        retry_transient(StoreOperation::Save, &mut backoff, usize::MAX, || {
            self.project.workers.save(&record)
        })
        .await?;
        info!(
            "Worker {} ({}) 已注册，会话 {}",
            record.name, record.id, record.session
        );
        Ok(record)
    }

    fn backoff(&self) -> Backoff {
        Backoff::from_millis(
            self.config.store_backoff_initial_ms,
            self.config.store_backoff_max_ms,
        )
    }

    /// 运行直到收到停止信号、控制命令要求退出或 walltime 结束
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) -> SchedulerResult<WorkerSummary> {
        let work_root = self.work_root();
        tokio::fs::create_dir_all(&work_root).await?;
        let record = self.register(&work_root).await?;

        let checker = Arc::new(DependencyChecker::new(self.project.clone()));
        let mut state = LoopState {
            scheduler: TaskScheduler::new(
                self.project.clone(),
                checker,
                self.retry.clone(),
                &self.staging,
                &record,
                &work_root,
                self.config.auto_submit_dependencies,
                self.config.keep_workdirs,
            ),
            lifecycle: WorkerLifecycle::from_seconds(
                self.config.walltime_seconds,
                self.config.walltime_grace_seconds,
            ),
            claimed: None,
            active: None,
            pending: None,
            summary: WorkerSummary {
                worker_id: Some(record.id),
                ..WorkerSummary::default()
            },
        };
        let heartbeat = HeartbeatManager::new(self.project.clone(), record.id);
        let mut backoff = self.backoff();

        let mut poll = interval(Duration::from_millis(self.config.poll_interval_ms));
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut beat = interval(Duration::from_secs(self.config.heartbeat_interval_seconds));
        beat.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut signalled = false;

        loop {
            tokio::select! {
                _ = poll.tick() => {
                    match self.tick(&mut state).await {
                        Ok(()) => backoff.reset(),
                        Err(e) if e.is_transient() => {
                            record_unavailable(StoreOperation::Query, &e);
                            tokio::time::sleep(backoff.next_delay()).await;
                        }
                        Err(e) => error!("Worker 轮询出错: {}", e),
                    }

                    if state.lifecycle.should_exit()
                        || (state.lifecycle.is_draining() && state.is_idle())
                    {
                        break;
                    }
                }
                _ = beat.tick() => {
                    if let Err(e) = heartbeat.beat().await {
                        if e.is_transient() {
                            record_unavailable(StoreOperation::Heartbeat, &e);
                        } else {
                            warn!("心跳失败: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv(), if !signalled => {
                    signalled = true;
                    state.lifecycle.begin_drain("收到停止信号");
                }
            }
        }

        self.exit(&mut state, record.id).await;
        Ok(state.summary)
    }

    async fn tick(&self, state: &mut LoopState) -> SchedulerResult<()> {
        self.flush(state).await?;
        self.handle_command(state).await?;

        state.lifecycle.check_walltime();
        if state.lifecycle.grace_expired() {
            if let Some(active) = state.active.take() {
                warn!("宽限时间已过，放弃任务 {}", active.id());
                state.pending = Some(state.scheduler.abandon(active, TaskState::Created).await);
                self.flush(state).await?;
            }
        }

        if let Some(active) = state.active.as_mut() {
            let status = match active.try_finish() {
                Ok(None) => return Ok(()),
                Ok(Some(status)) => Some(status),
                Err(e) => {
                    warn!("无法获取任务 {} 的退出状态: {}", active.id(), e);
                    None
                }
            };
            if let Some(active) = state.active.take() {
                state.pending = Some(state.scheduler.finish(active, status).await);
            }
            self.flush(state).await?;
        }

        if !state.lifecycle.may_claim() || state.pending.is_some() {
            return Ok(());
        }

        let claimed = match state.claimed.take() {
            Some(task) => Some(task),
            None => state.scheduler.claim().await?,
        };
        let Some(task) = claimed else {
            if self.exit_when_idle {
                state.lifecycle.begin_drain("没有可执行的任务");
            }
            return Ok(());
        };

        match state.scheduler.start(&task).await {
            Ok(StartOutcome::Running(active)) => state.active = Some(active),
            Ok(StartOutcome::Failed(report)) => {
                state.pending = Some(report);
                self.flush(state).await?;
            }
            Ok(StartOutcome::Skipped) => {}
            Err(e) => {
                state.claimed = Some(task);
                return Err(e);
            }
        }
        Ok(())
    }

    /// 写入待上报的报告，失败时保留以便重试
    async fn flush(&self, state: &mut LoopState) -> SchedulerResult<()> {
        let Some(report) = state.pending.as_ref() else {
            return Ok(());
        };
        state.scheduler.submit_report(report).await?;
        match report.state() {
            TaskState::Success => state.summary.succeeded += 1,
            TaskState::Fail => state.summary.failed += 1,
            _ => state.summary.stopped += 1,
        }
        state.pending = None;
        Ok(())
    }

    /// 读取并消费 Worker 记录上的控制命令
    async fn handle_command(&self, state: &mut LoopState) -> SchedulerResult<()> {
        let worker_id = state.scheduler.worker_id();
        let index = self
            .project
            .workers
            .index_of(&[worker_id], "command")
            .await?;
        let Some(IndexValue::Text(raw)) = index.get(&worker_id).cloned() else {
            return Ok(());
        };

        if self
            .project
            .workers
            .modify_if(worker_id, "command", raw.as_str(), IndexValue::Null)
            .await?
            .is_none()
        {
            return Ok(());
        }

        let command: WorkerCommand = match raw.parse() {
            Ok(command) => command,
            Err(e) => {
                warn!("忽略无法识别的命令 {:?}: {}", raw, e);
                return Ok(());
            }
        };
        info!("Worker {} 收到命令: {}", worker_id, command);

        match WorkerLifecycle::interpret(&command) {
            LifecycleAction::Drain => state.lifecycle.begin_drain("shutdown 命令"),
            LifecycleAction::Exit => {
                state.lifecycle.request_exit();
                self.stop_current(state, TaskState::Created).await?;
            }
            LifecycleAction::StopCurrent(next) => self.stop_current(state, next).await?,
            LifecycleAction::Release => {
                state.scheduler.release_queued().await?;
            }
            LifecycleAction::Diagnose(cmd) => self.spawn_diagnostic(worker_id, cmd),
        }
        Ok(())
    }

    async fn stop_current(&self, state: &mut LoopState, next: TaskState) -> SchedulerResult<()> {
        match state.active.take() {
            Some(active) => {
                state.pending = Some(state.scheduler.abandon(active, next).await);
                self.flush(state).await
            }
            None => {
                debug!("没有正在运行的任务，忽略 {}", next);
                Ok(())
            }
        }
    }

    fn spawn_diagnostic(&self, worker_id: ObjectId, command: String) {
        let project = self.project.clone();
        let workdir = self.work_root();
        tokio::spawn(async move {
            let output = run_diagnostic(&command, &workdir, DIAGNOSTIC_TIMEOUT).await;
            let record = LogRecord::new(LogStream::Worker, output).from_worker(worker_id);
            if let Err(e) = project.logs.save(&record).await {
                warn!("保存诊断输出失败: {}", e);
            }
        });
    }

    /// 退出前放回任务并把 Worker 标记为 shutdown
    async fn exit(&self, state: &mut LoopState, worker_id: ObjectId) {
        if let Some(active) = state.active.take() {
            state.pending = Some(state.scheduler.abandon(active, TaskState::Created).await);
        }

        let mut backoff = self.backoff();
        if let Some(report) = state.pending.take() {
            let submitted = retry_transient(StoreOperation::Report, &mut backoff, EXIT_ATTEMPTS, || {
                state.scheduler.submit_report(&report)
            })
            .await;
            if let Err(e) = submitted {
                error!("退出前无法上报任务 {}: {}", report.task.id, e);
            }
        }

        let released = retry_transient(StoreOperation::Update, &mut backoff, EXIT_ATTEMPTS, || {
            state.scheduler.release_queued()
        })
        .await;
        if let Err(e) = released {
            error!("退出前无法放回已领取的任务: {}", e);
        }

        let modification = Modification::unconditional("state", WorkerState::Shutdown)
            .also("current", IndexValue::Null);
        let marked = retry_transient(StoreOperation::Update, &mut backoff, EXIT_ATTEMPTS, || {
            self.project.workers.modify_by_id(worker_id, &modification)
        })
        .await;
        match marked {
            Ok(_) => info!(
                "Worker {} 已退出: 成功 {} 个, 失败 {} 个, 停止 {} 个",
                worker_id, state.summary.succeeded, state.summary.failed, state.summary.stopped
            ),
            Err(e) => error!("无法标记 Worker {} 为 shutdown: {}", worker_id, e),
        }
    }
}
