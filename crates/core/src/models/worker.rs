use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::{SchedulerError, SchedulerResult};
use crate::id::ObjectId;
use crate::traits::{IndexFields, IndexValue, StoreObject};

/// Worker 状态。记录永远不会被删除，失联的 Worker 被标记为 `dead`。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Running,
    Shutdown,
    Dead,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Running => "running",
            WorkerState::Shutdown => "shutdown",
            WorkerState::Dead => "dead",
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<WorkerState> for IndexValue {
    fn from(value: WorkerState) -> Self {
        IndexValue::Text(value.as_str().to_string())
    }
}

/// Worker 注册记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub id: ObjectId,
    pub name: String,
    pub hostname: String,
    /// 任务工作目录的根
    pub cwd: String,
    /// 本次运行的会话标识，用于划分 sandbox
    pub session: String,
    pub state: WorkerState,
    /// 最近一次心跳（Unix毫秒）
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub seen: DateTime<Utc>,
    pub current: Option<ObjectId>,
    /// 待处理的控制命令
    pub command: Option<String>,
    pub generators: Vec<String>,
    pub walltime_seconds: Option<u64>,
    pub started_at: DateTime<Utc>,
}

impl WorkerRecord {
    pub fn new(name: impl Into<String>, hostname: impl Into<String>, cwd: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: ObjectId::generate(),
            name: name.into(),
            hostname: hostname.into(),
            cwd: cwd.into(),
            session: String::new(),
            state: WorkerState::Running,
            seen: now,
            current: None,
            command: None,
            generators: Vec::new(),
            walltime_seconds: None,
            started_at: now,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.state == WorkerState::Running
    }

    /// 心跳是否超过失效阈值
    pub fn is_heartbeat_expired(&self, dead_time_seconds: i64, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.seen).num_seconds() > dead_time_seconds
    }

    /// 是否接受指定生成器的任务。没有配置亲和性时接受全部。
    pub fn accepts_generator(&self, generator: Option<&str>) -> bool {
        if self.generators.is_empty() {
            return true;
        }
        generator.is_some_and(|g| self.generators.iter().any(|own| own == g))
    }
}

impl StoreObject for WorkerRecord {
    const CONTENT_TYPE: &'static str = "worker";

    fn id(&self) -> ObjectId {
        self.id
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    fn index_fields(&self) -> IndexFields {
        let mut index = IndexFields::new();
        index.insert("state".into(), self.state.into());
        index.insert("seen".into(), self.seen.timestamp_millis().into());
        index.insert("current".into(), IndexValue::from(self.current));
        index.insert("command".into(), IndexValue::from(self.command.clone()));
        index
    }
}

/// shell 转义命令的前缀
pub const SHELL_COMMAND_PREFIX: char = '!';

/// 写入 Worker 记录 `command` 字段的控制命令
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerCommand {
    /// 不再领取新任务，完成当前任务后退出
    Shutdown,
    /// 立即退出，当前任务放回 created
    Kill,
    /// 中止当前任务（halted）
    Halt,
    /// 取消当前任务（cancelled）
    Cancel,
    /// 把本 Worker 已领取但未开始的任务放回 created
    Release,
    /// 在 Worker 主机上执行诊断命令
    Shell(String),
}

impl FromStr for WorkerCommand {
    type Err = SchedulerError;

    fn from_str(s: &str) -> SchedulerResult<Self> {
        let s = s.trim();
        if let Some(rest) = s.strip_prefix(SHELL_COMMAND_PREFIX) {
            let rest = rest.trim();
            if rest.is_empty() {
                return Err(SchedulerError::TaskExecution("shell 命令不能为空".to_string()));
            }
            return Ok(WorkerCommand::Shell(rest.to_string()));
        }
        match s {
            "shutdown" => Ok(WorkerCommand::Shutdown),
            "kill" => Ok(WorkerCommand::Kill),
            "halt" => Ok(WorkerCommand::Halt),
            "cancel" => Ok(WorkerCommand::Cancel),
            "release" => Ok(WorkerCommand::Release),
            other => Err(SchedulerError::TaskExecution(format!("未知的Worker命令: {other}"))),
        }
    }
}

impl fmt::Display for WorkerCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerCommand::Shutdown => f.write_str("shutdown"),
            WorkerCommand::Kill => f.write_str("kill"),
            WorkerCommand::Halt => f.write_str("halt"),
            WorkerCommand::Cancel => f.write_str("cancel"),
            WorkerCommand::Release => f.write_str("release"),
            WorkerCommand::Shell(cmd) => write!(f, "{SHELL_COMMAND_PREFIX}{cmd}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_command_parsing() {
        assert_eq!("shutdown".parse::<WorkerCommand>().unwrap(), WorkerCommand::Shutdown);
        assert_eq!(" kill ".parse::<WorkerCommand>().unwrap(), WorkerCommand::Kill);
        assert_eq!(
            "!nvidia-smi -L".parse::<WorkerCommand>().unwrap(),
            WorkerCommand::Shell("nvidia-smi -L".into())
        );
        assert!("!".parse::<WorkerCommand>().is_err());
        assert!("reboot".parse::<WorkerCommand>().is_err());
        assert_eq!(WorkerCommand::Shell("ls".into()).to_string(), "!ls");
    }

    #[test]
    fn test_heartbeat_expiry() {
        let mut worker = WorkerRecord::new("w1", "node01", "/tmp/w1");
        let now = Utc::now();
        worker.seen = now - Duration::seconds(120);
        assert!(worker.is_heartbeat_expired(60, now));
        assert!(!worker.is_heartbeat_expired(300, now));
    }

    #[test]
    fn test_generator_affinity() {
        let mut worker = WorkerRecord::new("w1", "node01", "/tmp/w1");
        assert!(worker.accepts_generator(None));
        worker.generators = vec!["openmm".into()];
        assert!(worker.accepts_generator(Some("openmm")));
        assert!(!worker.accepts_generator(Some("pyemma")));
        assert!(!worker.accepts_generator(None));
    }

    #[test]
    fn test_seen_index_matches_serialized_millis() {
        let worker = WorkerRecord::new("w1", "node01", "/tmp/w1");
        let json = serde_json::to_value(&worker).unwrap();
        for (key, value) in worker.index_fields() {
            assert_eq!(json[&key], value.to_json());
        }
    }
}
