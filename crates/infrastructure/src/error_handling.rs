//! 存储不可用时的重试与退避
//!
//! 存储中断不是任务失败：调用方在瞬时错误上退避重试，其余错误照常返回。

use metrics::counter;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use taskyard_core::SchedulerResult;
use tracing::warn;

#[derive(Debug, Clone, Copy)]
pub enum StoreOperation {
    Save,
    Load,
    Update,
    Claim,
    Heartbeat,
    Query,
    Report,
}

impl fmt::Display for StoreOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreOperation::Save => write!(f, "保存"),
            StoreOperation::Load => write!(f, "读取"),
            StoreOperation::Update => write!(f, "更新"),
            StoreOperation::Claim => write!(f, "领取任务"),
            StoreOperation::Heartbeat => write!(f, "心跳"),
            StoreOperation::Query => write!(f, "查询"),
            StoreOperation::Report => write!(f, "上报结果"),
        }
    }
}

/// 指数退避，封顶于 `max`
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            current: initial,
        }
    }

    pub fn from_millis(initial_ms: u64, max_ms: u64) -> Self {
        Self::new(Duration::from_millis(initial_ms), Duration::from_millis(max_ms))
    }

    /// 返回本次应等待的时间，并把下一次的等待时间翻倍
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// 记录一次存储不可用
pub fn record_unavailable(operation: StoreOperation, error: &dyn fmt::Display) {
    counter!("taskyard_store_unavailable_total").increment(1);
    warn!("存储暂时不可用，{}操作将稍后重试: {}", operation, error);
}

/// 在瞬时错误上退避重试，最多 `attempts` 次
pub async fn retry_transient<T, F, Fut>(
    operation: StoreOperation,
    backoff: &mut Backoff,
    attempts: usize,
    mut f: F,
) -> SchedulerResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = SchedulerResult<T>>,
{
    let mut tried = 0;
    loop {
        tried += 1;
        match f().await {
            Ok(value) => {
                backoff.reset();
                return Ok(value);
            }
            Err(err) if err.is_transient() && tried < attempts => {
                record_unavailable(operation, &err);
                tokio::time::sleep(backoff.next_delay()).await;
            }
            Err(err) => return Err(err),
        }
    }
}
