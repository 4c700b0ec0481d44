use std::sync::Arc;

use anyhow::{Context, Result};
use taskyard_core::AppConfig;
use taskyard_dispatcher::{
    TaskRetryService, WorkerFailureDetector, WorkerFailureDetectorConfig,
    WorkerFailureDetectorService,
};
use taskyard_infrastructure::Project;
use taskyard_worker::WorkerServiceBuilder;
use tokio::sync::broadcast;
use tracing::{error, info};

/// 应用运行模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppMode {
    /// 领取并执行任务
    Worker,
    /// 周期性巡检失联的 Worker
    Sweep,
    /// 巡检一次后退出
    SweepOnce,
}

impl std::str::FromStr for AppMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "worker" => Ok(AppMode::Worker),
            "sweep" => Ok(AppMode::Sweep),
            "sweep-once" => Ok(AppMode::SweepOnce),
            other => Err(anyhow::anyhow!("不支持的运行模式: {other}")),
        }
    }
}

pub struct Application {
    config: AppConfig,
    mode: AppMode,
    project: Arc<Project>,
    exit_when_idle: bool,
}

impl Application {
    pub async fn new(config: AppConfig, mode: AppMode) -> Result<Self> {
        let project = Project::open(&config)
            .await
            .with_context(|| format!("打开项目失败: {}", config.project.name))?;
        Ok(Self {
            config,
            mode,
            project: Arc::new(project),
            exit_when_idle: false,
        })
    }

    pub fn exit_when_idle(mut self, enabled: bool) -> Self {
        self.exit_when_idle = enabled;
        self
    }

    pub async fn run(&self, shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        match self.mode {
            AppMode::Worker => self.run_worker(shutdown_rx).await,
            AppMode::Sweep => self.run_sweep(shutdown_rx).await,
            AppMode::SweepOnce => self.sweep_once().await,
        }
    }

    async fn run_worker(&self, shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        let summary = WorkerServiceBuilder::from_config(self.project.clone(), &self.config)
            .exit_when_idle(self.exit_when_idle)
            .build()
            .run(shutdown_rx)
            .await
            .context("Worker运行失败")?;
        info!(
            "Worker 结束: 成功 {} 个, 失败 {} 个, 停止 {} 个",
            summary.succeeded, summary.failed, summary.stopped
        );
        Ok(())
    }

    fn detector(&self) -> Arc<WorkerFailureDetector> {
        let retry = Arc::new(TaskRetryService::new(
            self.project.clone(),
            Some(self.config.dispatcher.recovery_policy),
        ));
        Arc::new(WorkerFailureDetector::new(
            self.project.clone(),
            retry,
            Some(WorkerFailureDetectorConfig::from(self.config.dispatcher.clone())),
        ))
    }

    async fn run_sweep(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        let detector = self.detector();
        let looping = detector.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = looping.start_detection().await {
                error!("巡检循环异常退出: {}", e);
            }
        });

        let _ = shutdown_rx.recv().await;
        detector.stop_detection().await?;
        handle.await.context("等待巡检循环结束失败")?;
        Ok(())
    }

    async fn sweep_once(&self) -> Result<()> {
        let report = self.detector().sweep().await.context("巡检失败")?;
        info!(
            "巡检完成: {} 个失联Worker, {} 个任务已恢复",
            report.dead_workers.len(),
            report.recovered_tasks.len()
        );
        Ok(())
    }
}
