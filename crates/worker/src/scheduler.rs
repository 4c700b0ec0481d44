//! 单个任务从领取到上报的全过程
//!
//! 本地步骤（建目录、写脚本、运行、检查产物）和写存储的步骤分开：
//! `finish` 只在本机生成 [`TaskReport`]，`submit_report` 才写入存储，
//! 存储不可用时报告可以保留下来重试。

use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, histogram};
use taskyard_core::models::{
    Drive, File, LogRecord, LogStream, Task, TaskKind, TaskState, WorkerRecord,
};
use taskyard_core::{
    Filter, IndexValue, Modification, ObjectId, SchedulerError, SchedulerResult, StagingConfig,
};
use taskyard_dispatcher::{DependencyCheckService, RetryService};
use taskyard_infrastructure::Project;
use taskyard_staging::call::{self, BOOTSTRAP, BOOTSTRAP_FILE, INPUT_FILE, OUTPUT_FILE};
use taskyard_staging::{DriveMap, ScriptBuilder, StagingDirective};
use tokio::fs;
use tracing::{debug, error, info, warn};

use crate::components::{DirectiveRunner, ProcessOutcome, RunningProcess};

/// 正在本 Worker 上运行的任务
pub struct ActiveTask {
    pub task: Task,
    pub workdir: PathBuf,
    process: RunningProcess,
    stage_out: Vec<StagingDirective>,
}

impl ActiveTask {
    pub fn id(&self) -> ObjectId {
        self.task.id
    }

    pub fn try_finish(&mut self) -> SchedulerResult<Option<ExitStatus>> {
        self.process.try_finish()
    }

    pub fn elapsed(&self) -> Duration {
        self.process.elapsed()
    }
}

/// 一次执行的最终结果，尚未写入存储
#[derive(Debug, Clone)]
pub struct TaskReport {
    pub task: Task,
    /// 写入前存储中应有的状态
    pub previous: TaskState,
    pub logs: Vec<LogRecord>,
    /// 成功时需要登记的产物
    pub targets: Vec<File>,
    pub workdir: PathBuf,
    pub duration: Duration,
}

impl TaskReport {
    pub fn state(&self) -> TaskState {
        self.task.state
    }

    pub fn is_success(&self) -> bool {
        self.task.state == TaskState::Success
    }
}

pub enum StartOutcome {
    Running(ActiveTask),
    /// 启动前就失败（脚本无法生成、暂存失败、进程无法启动）
    Failed(TaskReport),
    /// 任务在领取后被其他方改动
    Skipped,
}

pub struct TaskScheduler {
    project: Arc<Project>,
    checker: Arc<dyn DependencyCheckService>,
    retry: Arc<dyn RetryService>,
    builder: ScriptBuilder,
    script_name: String,
    worker_id: ObjectId,
    generators: Vec<String>,
    work_root: PathBuf,
    auto_submit: bool,
    keep_workdirs: bool,
}

impl TaskScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        project: Arc<Project>,
        checker: Arc<dyn DependencyCheckService>,
        retry: Arc<dyn RetryService>,
        staging: &StagingConfig,
        worker: &WorkerRecord,
        work_root: impl Into<PathBuf>,
        auto_submit: bool,
        keep_workdirs: bool,
    ) -> Self {
        let drives = DriveMap::for_project(
            &project.config().shared_root,
            project.name(),
            &worker.session,
        );
        Self {
            builder: ScriptBuilder::from_config(staging, drives),
            script_name: staging.script_name.clone(),
            worker_id: worker.id,
            generators: worker.generators.clone(),
            work_root: work_root.into(),
            project,
            checker,
            retry,
            auto_submit,
            keep_workdirs,
        }
    }

    pub fn worker_id(&self) -> ObjectId {
        self.worker_id
    }

    pub fn workdir_for(&self, task: ObjectId) -> PathBuf {
        self.work_root.join(task.to_string())
    }

    /// 领取一个依赖已满足的任务
    ///
    /// 领取是一次条件写入：`created -> queued` 且同时写入 worker，
    /// 多个 Worker 竞争时只有一个成功，失败方得到 `None`。
    pub async fn claim(&self) -> SchedulerResult<Option<Arc<Task>>> {
        let mut filter = Filter::new().eq("state", TaskState::Created);
        if !self.generators.is_empty() {
            let generators = self
                .generators
                .iter()
                .map(|g| IndexValue::from(g.as_str()))
                .collect();
            filter = filter.any_of("generator", generators);
        }

        let candidates = self.project.tasks.find(&filter).await?;
        if candidates.is_empty() {
            return Ok(None);
        }

        let mut ready = self.checker.ready_among(&candidates).await?;
        if self.auto_submit {
            for candidate in &candidates {
                if ready.contains(&candidate.id) {
                    continue;
                }
                for dependency in self.checker.unmet_created_dependencies(candidate).await? {
                    if !ready.contains(&dependency) {
                        debug!("任务 {} 的依赖 {} 一并提交", candidate.id, dependency);
                        ready.push(dependency);
                    }
                }
            }
        }

        if ready.is_empty() {
            debug!("{} 个候选任务的依赖均未满足", candidates.len());
            return Ok(None);
        }

        let modification = Modification::new("state", TaskState::Created, TaskState::Queued)
            .also("worker", self.worker_id);
        let claimed = self
            .project
            .tasks
            .modify_one_where(&Filter::new().ids(ready), &modification)
            .await?;

        if let Some(task) = &claimed {
            counter!("taskyard_tasks_claimed_total").increment(1);
            info!("Worker {} 领取任务 {}", self.worker_id, task.id);
        }
        Ok(claimed)
    }

    async fn prepare_workdir(&self, workdir: &Path) -> SchedulerResult<()> {
        if fs::metadata(workdir).await.is_ok() {
            warn!("清理上次遗留的工作目录: {}", workdir.display());
            fs::remove_dir_all(workdir).await?;
        }
        fs::create_dir_all(workdir).await?;
        Ok(())
    }

    /// 在工作目录中写出脚本和调用文件，返回暂存指令
    async fn materialize(
        &self,
        task: &mut Task,
        workdir: &Path,
    ) -> SchedulerResult<(Vec<StagingDirective>, Vec<StagingDirective>)> {
        let script = self.builder.build(task)?;
        let rendered = script.render();
        fs::write(workdir.join(&self.script_name), &rendered).await?;

        if let TaskKind::Call(call_spec) = &task.kind {
            fs::write(workdir.join(INPUT_FILE), call::input_json(call_spec)?).await?;
            fs::write(workdir.join(BOOTSTRAP_FILE), BOOTSTRAP).await?;
        }

        task.script = Some(rendered);
        Ok((script.stage_in, script.stage_out))
    }

    /// 把已领取的任务变为 running 并启动进程
    pub async fn start(&self, claimed: &Task) -> SchedulerResult<StartOutcome> {
        let mut task = claimed.clone();
        let workdir = self.workdir_for(task.id);
        let prepared = match self.prepare_workdir(&workdir).await {
            Ok(()) => self.materialize(&mut task, &workdir).await,
            Err(e) => Err(e),
        };

        let (stage_in, stage_out) = match prepared {
            Ok(directives) => directives,
            Err(e) if e.is_transient() => return Err(e),
            Err(e) => {
                error!("任务 {} 无法生成脚本: {}", task.id, e);
                return Ok(StartOutcome::Failed(self.failed_early(
                    task,
                    workdir,
                    &e,
                    TaskState::Queued,
                )));
            }
        };

        task.transition(TaskState::Running)?;
        task.attempts += 1;
        task.worker = Some(self.worker_id);
        if !self
            .project
            .tasks
            .update_where(&task, &self.owned_in(TaskState::Queued))
            .await?
        {
            warn!("任务 {} 在启动前被修改，放弃执行", task.id);
            self.remove_workdir(&workdir).await;
            return Ok(StartOutcome::Skipped);
        }
        if let Err(e) = self
            .project
            .workers
            .set_field(self.worker_id, "current", task.id)
            .await
        {
            warn!("无法记录当前任务 {}: {}", task.id, e);
        }

        if let Err(e) = DirectiveRunner::new(&workdir).run_all(&stage_in).await {
            error!("任务 {} 输入暂存失败: {}", task.id, e);
            return Ok(StartOutcome::Failed(self.failed_early(
                task,
                workdir,
                &e,
                TaskState::Running,
            )));
        }

        let env = [
            ("TASKYARD_TASK_ID", task.id.to_string()),
            ("TASKYARD_WORKER_ID", self.worker_id.to_string()),
        ];
        let process =
            match RunningProcess::spawn(&workdir.join(&self.script_name), &workdir, &env) {
                Ok(process) => process,
                Err(e) => {
                    error!("任务 {} 进程启动失败: {}", task.id, e);
                    let report = self.failed_early(task, workdir, &e, TaskState::Running);
                    return Ok(StartOutcome::Failed(report));
                }
            };

        info!("任务 {} 开始执行 (第 {} 次)", task.id, task.attempts);
        Ok(StartOutcome::Running(ActiveTask {
            task,
            workdir,
            process,
            stage_out,
        }))
    }

    /// 进程启动前的失败，`previous` 是存储中任务当前的状态
    fn failed_early(
        &self,
        mut task: Task,
        workdir: PathBuf,
        error: &SchedulerError,
        previous: TaskState,
    ) -> TaskReport {
        let stderr = self.log(&task, LogStream::Stderr, error.to_string());
        task.stderr = Some(stderr.id);
        task.state = TaskState::Fail;
        task.updated_at = chrono::Utc::now();
        TaskReport {
            task,
            previous,
            logs: vec![stderr],
            targets: Vec::new(),
            workdir,
            duration: Duration::ZERO,
        }
    }

    fn log(&self, task: &Task, stream: LogStream, content: String) -> LogRecord {
        LogRecord::new(stream, content)
            .for_task(task.id)
            .from_worker(self.worker_id)
    }

    /// 进程结束后在本机完成收尾：输出暂存、检查产物、读取返回值
    pub async fn finish(&self, active: ActiveTask, status: Option<ExitStatus>) -> TaskReport {
        let ActiveTask {
            mut task,
            workdir,
            process,
            stage_out,
        } = active;
        let mut outcome = process.collect(status).await;

        if outcome.success {
            if let Err(problem) = self.finalize_outputs(&mut task, &workdir, &stage_out).await {
                warn!("任务 {} 收尾失败: {}", task.id, problem);
                outcome.success = false;
                outcome.stderr.push_str(&format!("{problem}\n"));
            }
        } else {
            debug!("任务 {} 退出码 {:?}", task.id, outcome.exit_code);
        }

        let next = if outcome.success {
            TaskState::Success
        } else {
            TaskState::Fail
        };
        self.report(task, workdir, outcome, next)
    }

    async fn finalize_outputs(
        &self,
        task: &mut Task,
        workdir: &Path,
        stage_out: &[StagingDirective],
    ) -> SchedulerResult<()> {
        DirectiveRunner::new(workdir).run_all(stage_out).await?;

        let local = self
            .builder
            .drives()
            .clone()
            .with_root(Drive::Worker, &workdir.to_string_lossy());
        for target in task.targets() {
            let path = local.resolve(&target.location);
            if fs::metadata(&path).await.is_err() {
                return Err(SchedulerError::TaskExecution(format!(
                    "缺少声明的产物: {} ({})",
                    target.location, path
                )));
            }
        }

        if task.is_call() {
            let text = fs::read_to_string(workdir.join(OUTPUT_FILE))
                .await
                .map_err(|e| SchedulerError::TaskExecution(format!("缺少 {OUTPUT_FILE}: {e}")))?;
            task.return_value = Some(call::parse_output(&text)?);
        }
        Ok(())
    }

    /// 杀掉正在运行的任务，并把它置为 `next`
    pub async fn abandon(&self, active: ActiveTask, next: TaskState) -> TaskReport {
        let ActiveTask {
            task,
            workdir,
            process,
            ..
        } = active;
        info!("停止任务 {}，目标状态 {}", task.id, next);
        let outcome = process.kill().await;
        self.report(task, workdir, outcome, next)
    }

    fn report(&self, mut task: Task, workdir: PathBuf, outcome: ProcessOutcome, next: TaskState) -> TaskReport {
        let stdout = self.log(&task, LogStream::Stdout, outcome.stdout);
        let stderr = self.log(&task, LogStream::Stderr, outcome.stderr);
        task.stdout = Some(stdout.id);
        task.stderr = Some(stderr.id);
        task.state = next;
        task.updated_at = chrono::Utc::now();
        if next == TaskState::Created {
            task.worker = None;
        }

        let targets = if next == TaskState::Success {
            task.targets()
                .into_iter()
                .map(|file| file.with_generator(task.id))
                .collect()
        } else {
            Vec::new()
        };

        histogram!("taskyard_task_duration_ms").record(outcome.duration.as_millis() as f64);
        TaskReport {
            task,
            previous: TaskState::Running,
            logs: vec![stdout, stderr],
            targets,
            workdir,
            duration: outcome.duration,
        }
    }

    /// 把报告写入存储
    ///
    /// 可以重复调用：日志按标识保存，任务只在仍处于报告前的状态且归属于本 Worker
    /// 时覆盖。状态已经写入时只补做登记产物和失败处理，二者本身是幂等的。
    pub async fn submit_report(&self, report: &TaskReport) -> SchedulerResult<()> {
        for log in &report.logs {
            self.project.logs.save(log).await?;
        }

        let id = report.task.id;
        let written = self
            .project
            .tasks
            .update_where(&report.task, &self.owned_in(report.previous))
            .await?;

        // 上一次提交可能在写入状态后中断，此时登记产物和失败处理仍需补做
        let stored = if written {
            true
        } else {
            let current = self.project.tasks.reload(id).await?;
            if current.state == report.task.state
                && current.attempts == report.task.attempts
                && current.worker == report.task.worker
            {
                debug!("任务 {} 的状态已经写入过，补做后续步骤", id);
                true
            } else {
                warn!(
                    "任务 {} 已被外部修改为 {} (worker={:?})，丢弃本次结果 {}",
                    id,
                    current.state,
                    current.worker,
                    report.task.state
                );
                false
            }
        };

        if stored {
            for target in &report.targets {
                self.project.register_file(target).await?;
            }
        }

        self.project
            .workers
            .set_field(self.worker_id, "current", IndexValue::Null)
            .await?;

        if written {
            match report.state() {
                TaskState::Success => {
                    counter!("taskyard_tasks_succeeded_total").increment(1);
                    info!("任务 {} 成功，耗时 {:?}", id, report.duration);
                }
                TaskState::Fail => {
                    counter!("taskyard_tasks_failed_total").increment(1);
                    warn!("任务 {} 失败，工作目录保留在 {}", id, report.workdir.display());
                }
                other => info!("任务 {} 结束于 {}", id, other),
            }
        }
        if stored && report.state() == TaskState::Fail {
            self.retry.handle_failed_task(id).await?;
        }

        if report.is_success() && !self.keep_workdirs {
            self.remove_workdir(&report.workdir).await;
        }
        Ok(())
    }

    /// 仍处于 `state` 且归属于本 Worker 的任务
    fn owned_in(&self, state: TaskState) -> Filter {
        Filter::new()
            .eq("state", state)
            .eq("worker", self.worker_id)
    }

    async fn remove_workdir(&self, workdir: &Path) {
        match fs::remove_dir_all(workdir).await {
            Ok(()) => debug!("已删除工作目录 {}", workdir.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("删除工作目录 {} 失败: {}", workdir.display(), e),
        }
    }

    /// 把本 Worker 已领取但未开始的任务放回 created
    pub async fn release_queued(&self) -> SchedulerResult<Vec<ObjectId>> {
        let filter = Filter::new()
            .eq("worker", self.worker_id)
            .eq("state", TaskState::Queued);
        let queued = self.project.tasks.find(&filter).await?;

        let modification = Modification::new("state", TaskState::Queued, TaskState::Created)
            .also("worker", IndexValue::Null);
        let mut released = Vec::new();
        for task in queued {
            let mine = self.owned_in(TaskState::Queued).ids(vec![task.id]);
            if self
                .project
                .tasks
                .modify_one_where(&mine, &modification)
                .await?
                .is_some()
            {
                released.push(task.id);
            }
        }
        if !released.is_empty() {
            info!("Worker {} 放回 {} 个已领取的任务", self.worker_id, released.len());
        }
        Ok(released)
    }
}
