use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::ObjectId;
use crate::traits::{IndexFields, IndexValue, StoreObject};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
    Worker,
}

impl LogStream {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogStream::Stdout => "stdout",
            LogStream::Stderr => "stderr",
            LogStream::Worker => "worker",
        }
    }
}

/// 任务输出或 Worker 诊断输出
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub id: ObjectId,
    pub task: Option<ObjectId>,
    pub worker: Option<ObjectId>,
    pub stream: LogStream,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl LogRecord {
    pub fn new(stream: LogStream, content: impl Into<String>) -> Self {
        Self {
            id: ObjectId::generate(),
            task: None,
            worker: None,
            stream,
            content: content.into(),
            created_at: Utc::now(),
        }
    }

    pub fn for_task(mut self, task: ObjectId) -> Self {
        self.task = Some(task);
        self
    }

    pub fn from_worker(mut self, worker: ObjectId) -> Self {
        self.worker = Some(worker);
        self
    }
}

impl StoreObject for LogRecord {
    const CONTENT_TYPE: &'static str = "log";

    fn id(&self) -> ObjectId {
        self.id
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn index_fields(&self) -> IndexFields {
        let mut index = IndexFields::new();
        index.insert("task".into(), IndexValue::from(self.task));
        index.insert("worker".into(), IndexValue::from(self.worker));
        index.insert("stream".into(), self.stream.as_str().into());
        index
    }
}
