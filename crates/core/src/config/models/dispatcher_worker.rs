use serde::{Deserialize, Serialize};

/// Worker 失联后其任务的处理方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryPolicy {
    /// 放回 created，任务可能被执行多次
    #[default]
    Requeue,
    /// 标记为 fail
    MarkFailed,
    /// 保持原状态，由人工处理
    Ignore,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// 心跳超过该时长的 Worker 视为失联
    pub dead_time_seconds: i64,
    pub sweep_interval_seconds: u64,
    pub recovery_policy: RecoveryPolicy,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            dead_time_seconds: 60,
            sweep_interval_seconds: 30,
            recovery_policy: RecoveryPolicy::Requeue,
        }
    }
}

impl DispatcherConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.dead_time_seconds <= 0 {
            return Err(anyhow::anyhow!("失联判定时间必须大于0"));
        }

        if self.sweep_interval_seconds == 0 {
            return Err(anyhow::anyhow!("巡检间隔必须大于0"));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub name: Option<String>,
    /// 任务工作目录的根
    pub work_root: String,
    pub heartbeat_interval_seconds: u64,
    pub poll_interval_ms: u64,
    pub walltime_seconds: Option<u64>,
    /// 达到 walltime 后等待当前任务结束的时间
    pub walltime_grace_seconds: u64,
    /// 生成器亲和性，空表示接受全部
    pub generators: Vec<String>,
    pub auto_submit_dependencies: bool,
    pub keep_workdirs: bool,
    pub store_backoff_initial_ms: u64,
    pub store_backoff_max_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: None,
            work_root: "./workers".to_string(),
            heartbeat_interval_seconds: 10,
            poll_interval_ms: 500,
            walltime_seconds: None,
            walltime_grace_seconds: 60,
            generators: Vec::new(),
            auto_submit_dependencies: false,
            keep_workdirs: false,
            store_backoff_initial_ms: 500,
            store_backoff_max_ms: 30_000,
        }
    }
}

impl WorkerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.work_root.is_empty() {
            return Err(anyhow::anyhow!("工作目录根不能为空"));
        }

        if self.heartbeat_interval_seconds == 0 {
            return Err(anyhow::anyhow!("心跳间隔必须大于0"));
        }

        if self.poll_interval_ms == 0 {
            return Err(anyhow::anyhow!("轮询间隔必须大于0"));
        }

        if self.walltime_seconds == Some(0) {
            return Err(anyhow::anyhow!("walltime必须大于0"));
        }

        if self.store_backoff_initial_ms == 0
            || self.store_backoff_initial_ms > self.store_backoff_max_ms
        {
            return Err(anyhow::anyhow!("存储重试退避配置无效"));
        }

        Ok(())
    }
}
