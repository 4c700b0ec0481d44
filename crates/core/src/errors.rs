use thiserror::Error;

use crate::id::ObjectId;
use crate::models::TaskState;

/// 调度器错误类型定义
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("存储不可用: {0}")]
    StoreUnavailable(String),

    #[error("对象未找到: {store}/{id}")]
    ObjectNotFound { store: String, id: ObjectId },

    #[error("对象类型不匹配: 存储 {store} 只接受 {expected}，实际为 {actual}")]
    TypeMismatch {
        store: String,
        expected: String,
        actual: String,
    },

    #[error("无效的位置: {0}")]
    InvalidLocation(String),

    #[error("文件状态冲突: {0}")]
    FileState(String),

    #[error("无效的文件操作: {0}")]
    InvalidAction(String),

    #[error("没有匹配的暂存规则: {0}")]
    NoStagingRule(String),

    #[error("非法的暂存操作: {0}")]
    IllegalStaging(String),

    #[error("无效的状态转换: {from} -> {to}")]
    InvalidTransition { from: TaskState, to: TaskState },

    #[error("无效的依赖关系: {0}")]
    InvalidDependency(String),

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("任务执行错误: {0}")]
    TaskExecution(String),

    #[error("IO错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("内部错误: {0}")]
    Internal(String),
}

impl SchedulerError {
    /// 是否为可重试的存储错误（存储暂时不可用，而不是数据或逻辑错误）
    pub fn is_transient(&self) -> bool {
        match self {
            SchedulerError::StoreUnavailable(_) => true,
            SchedulerError::Database(err) => match err {
                sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => true,
                sqlx::Error::Database(db) => db.code().is_some_and(|code| is_busy_code(&code)),
                _ => false,
            },
            _ => false,
        }
    }
}

/// SQLITE_BUSY / SQLITE_LOCKED，包括扩展错误码（低 8 位是主错误码）
fn is_busy_code(code: &str) -> bool {
    code.parse::<i32>()
        .is_ok_and(|code| matches!(code & 0xff, 5 | 6))
}

impl From<serde_json::Error> for SchedulerError {
    fn from(err: serde_json::Error) -> Self {
        SchedulerError::Serialization(err.to_string())
    }
}

/// 统一的Result类型
pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;
