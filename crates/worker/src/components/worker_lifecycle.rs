use std::time::{Duration, Instant};

use taskyard_core::models::{TaskState, WorkerCommand};
use tracing::info;

/// 控制命令和 walltime 决定的下一步动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleAction {
    /// 不再领取新任务，当前任务结束后退出
    Drain,
    /// 立即退出，当前任务放回 created
    Exit,
    /// 停止当前任务并置为给定状态
    StopCurrent(TaskState),
    /// 放回本 Worker 已领取但未开始的任务
    Release,
    /// 执行诊断命令
    Diagnose(String),
}

/// Worker 的运行期限与排空状态
#[derive(Debug)]
pub struct WorkerLifecycle {
    started: Instant,
    walltime: Option<Duration>,
    grace: Duration,
    drain_started: Option<Instant>,
    /// walltime 到期的时刻，只有这种排空会放弃当前任务
    walltime_reached: Option<Instant>,
    exiting: bool,
}

impl WorkerLifecycle {
    pub fn new(walltime: Option<Duration>, grace: Duration) -> Self {
        Self {
            started: Instant::now(),
            walltime,
            grace,
            drain_started: None,
            walltime_reached: None,
            exiting: false,
        }
    }

    pub fn from_seconds(walltime_seconds: Option<u64>, grace_seconds: u64) -> Self {
        Self::new(
            walltime_seconds.map(Duration::from_secs),
            Duration::from_secs(grace_seconds),
        )
    }

    pub fn interpret(command: &WorkerCommand) -> LifecycleAction {
        match command {
            WorkerCommand::Shutdown => LifecycleAction::Drain,
            WorkerCommand::Kill => LifecycleAction::Exit,
            WorkerCommand::Halt => LifecycleAction::StopCurrent(TaskState::Halted),
            WorkerCommand::Cancel => LifecycleAction::StopCurrent(TaskState::Cancelled),
            WorkerCommand::Release => LifecycleAction::Release,
            WorkerCommand::Shell(cmd) => LifecycleAction::Diagnose(cmd.clone()),
        }
    }

    pub fn begin_drain(&mut self, reason: &str) {
        if self.drain_started.is_none() {
            info!("Worker 开始排空: {}", reason);
            self.drain_started = Some(Instant::now());
        }
    }

    pub fn request_exit(&mut self) {
        self.exiting = true;
    }

    pub fn is_draining(&self) -> bool {
        self.drain_started.is_some()
    }

    pub fn should_exit(&self) -> bool {
        self.exiting
    }

    pub fn may_claim(&self) -> bool {
        !self.exiting && !self.is_draining()
    }

    pub fn walltime_expired(&self) -> bool {
        self.walltime.is_some_and(|w| self.started.elapsed() >= w)
    }

    /// 检查 walltime，到期时开始排空
    pub fn check_walltime(&mut self) {
        if self.walltime_reached.is_none() && self.walltime_expired() {
            self.walltime_reached = Some(Instant::now());
            self.begin_drain("达到 walltime");
        }
    }

    /// walltime 到期并超过宽限时间后，当前任务需要被放弃。
    /// `shutdown` 引起的排空会等当前任务自然结束。
    pub fn grace_expired(&self) -> bool {
        self.walltime_reached
            .is_some_and(|since| since.elapsed() >= self.grace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_interpretation() {
        assert_eq!(
            WorkerLifecycle::interpret(&WorkerCommand::Shutdown),
            LifecycleAction::Drain
        );
        assert_eq!(
            WorkerLifecycle::interpret(&WorkerCommand::Halt),
            LifecycleAction::StopCurrent(TaskState::Halted)
        );
        assert_eq!(
            WorkerLifecycle::interpret(&WorkerCommand::Cancel),
            LifecycleAction::StopCurrent(TaskState::Cancelled)
        );
        assert_eq!(
            WorkerLifecycle::interpret(&WorkerCommand::Shell("uptime".into())),
            LifecycleAction::Diagnose("uptime".into())
        );
    }

    #[test]
    fn test_walltime_starts_drain() {
        let mut lifecycle = WorkerLifecycle::new(Some(Duration::ZERO), Duration::ZERO);
        assert!(lifecycle.may_claim());
        lifecycle.check_walltime();
        assert!(lifecycle.is_draining());
        assert!(!lifecycle.may_claim());
        assert!(lifecycle.grace_expired());
        assert!(!lifecycle.should_exit());
    }

    #[test]
    fn test_no_walltime_never_drains() {
        let mut lifecycle = WorkerLifecycle::from_seconds(None, 0);
        lifecycle.check_walltime();
        assert!(!lifecycle.is_draining());
        lifecycle.begin_drain("shutdown");
        assert!(lifecycle.is_draining());
        // 没有 walltime 的排空不会放弃当前任务，即使宽限时间为 0
        assert!(!lifecycle.grace_expired());
        lifecycle.request_exit();
        assert!(lifecycle.should_exit());
    }

    #[test]
    fn test_walltime_after_shutdown_still_enforces_grace() {
        let mut lifecycle = WorkerLifecycle::new(Some(Duration::ZERO), Duration::ZERO);
        lifecycle.begin_drain("shutdown");
        assert!(!lifecycle.grace_expired());
        lifecycle.check_walltime();
        assert!(lifecycle.grace_expired());
    }
}
