//! 对象存储接口定义
//!
//! 此模块定义了持久化层的核心抽象：
//! - 可存储对象 (`StoreObject`)：带类型标签、可序列化、声明检索索引字段
//! - 文档后端 (`DocumentBackend`)：按"存储名 + 对象标识"保存记录的异步后端
//! - 查询条件 (`Filter`) 与条件修改 (`Modification`)
//!
//! ## 设计原则
//!
//! ### 索引字段
//! 每个对象声明一组索引字段，字段名与序列化后对象的顶层字段一一对应，
//! 取值的 JSON 表示也完全相同。后端只在索引字段上做过滤和条件判断，
//! 条件修改会同时写入索引与对象本体，保证二者一致。
//!
//! ### 条件修改
//! `modify_one` / `modify_by_id` 是唯一的协调原语：
//! 在一个原子步骤内找到第一条（按标识排序）满足条件的记录并修改它。
//! 多个进程同时对同一记录发起相同的条件修改时，恰好一个成功。
//!
//! ### 后端实现
//! - SQLite 实现（生产）
//! - 内存实现（测试与单进程运行）
//!
//! ## 使用示例
//!
//! ```ignore
//! use taskyard_core::traits::{Filter, IndexValue, Modification};
//!
//! // 领取一个属于指定生成器的 created 任务
//! let filter = Filter::new().any_of("generator", vec!["openmm".into()]);
//! let claim = Modification::new("state", "created", "queued").also("worker", worker_id);
//! let claimed = backend.modify_one("project.tasks", &filter, &claim).await?;
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::errors::SchedulerResult;
use crate::id::ObjectId;

/// 索引字段取值
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IndexValue {
    Null,
    Bool(bool),
    Int(i64),
    Text(String),
}

impl IndexValue {
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            IndexValue::Null => serde_json::Value::Null,
            IndexValue::Bool(b) => serde_json::Value::Bool(*b),
            IndexValue::Int(i) => serde_json::Value::from(*i),
            IndexValue::Text(s) => serde_json::Value::String(s.clone()),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            IndexValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            IndexValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, IndexValue::Null)
    }
}

impl From<i64> for IndexValue {
    fn from(value: i64) -> Self {
        IndexValue::Int(value)
    }
}

impl From<bool> for IndexValue {
    fn from(value: bool) -> Self {
        IndexValue::Bool(value)
    }
}

impl From<&str> for IndexValue {
    fn from(value: &str) -> Self {
        IndexValue::Text(value.to_string())
    }
}

impl From<String> for IndexValue {
    fn from(value: String) -> Self {
        IndexValue::Text(value)
    }
}

impl From<ObjectId> for IndexValue {
    fn from(value: ObjectId) -> Self {
        IndexValue::Int(value.as_i64())
    }
}

impl<T: Into<IndexValue>> From<Option<T>> for IndexValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(IndexValue::Null)
    }
}

pub type IndexFields = BTreeMap<String, IndexValue>;

/// 可以放入对象存储的类型
pub trait StoreObject: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// 存储接受的基础类型标签，子类型使用 `基础标签.子类型` 形式
    const CONTENT_TYPE: &'static str;

    fn id(&self) -> ObjectId;

    /// 具体类型标签，默认等于 `CONTENT_TYPE`
    fn kind(&self) -> String {
        Self::CONTENT_TYPE.to_string()
    }

    fn created_at(&self) -> DateTime<Utc>;

    fn index_fields(&self) -> IndexFields;
}

/// 后端中保存的一条记录
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub id: ObjectId,
    pub kind: String,
    pub state: serde_json::Value,
    pub index: IndexFields,
    pub created_at: DateTime<Utc>,
}

impl StoredRecord {
    pub fn index_value(&self, key: &str) -> IndexValue {
        self.index.get(key).cloned().unwrap_or(IndexValue::Null)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Eq { key: String, value: IndexValue },
    AnyOf { key: String, values: Vec<IndexValue> },
}

/// 索引字段上的合取查询条件
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    pub conditions: Vec<Condition>,
    pub ids: Option<Vec<ObjectId>>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, key: &str, value: impl Into<IndexValue>) -> Self {
        self.conditions.push(Condition::Eq {
            key: key.to_string(),
            value: value.into(),
        });
        self
    }

    pub fn any_of(mut self, key: &str, values: Vec<IndexValue>) -> Self {
        self.conditions.push(Condition::AnyOf {
            key: key.to_string(),
            values,
        });
        self
    }

    /// 限定在给定标识集合内
    pub fn ids(mut self, ids: Vec<ObjectId>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn matches(&self, id: ObjectId, index: &IndexFields) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.contains(&id) {
                return false;
            }
        }
        self.conditions.iter().all(|condition| match condition {
            Condition::Eq { key, value } => {
                index.get(key).unwrap_or(&IndexValue::Null) == value
            }
            Condition::AnyOf { key, values } => {
                values.contains(index.get(key).unwrap_or(&IndexValue::Null))
            }
        })
    }
}

/// 条件修改：当 `key` 的当前值等于 `expected` 时写入 `set` 中的所有字段。
/// `expected` 为 None 时无条件写入。
#[derive(Debug, Clone, PartialEq)]
pub struct Modification {
    pub key: String,
    pub expected: Option<IndexValue>,
    pub set: Vec<(String, IndexValue)>,
}

impl Modification {
    pub fn new(
        key: &str,
        expected: impl Into<IndexValue>,
        new_value: impl Into<IndexValue>,
    ) -> Self {
        Self {
            key: key.to_string(),
            expected: Some(expected.into()),
            set: vec![(key.to_string(), new_value.into())],
        }
    }

    pub fn unconditional(key: &str, new_value: impl Into<IndexValue>) -> Self {
        Self {
            key: key.to_string(),
            expected: None,
            set: vec![(key.to_string(), new_value.into())],
        }
    }

    /// 同一次写入中额外设置的字段
    pub fn also(mut self, key: &str, value: impl Into<IndexValue>) -> Self {
        self.set.push((key.to_string(), value.into()));
        self
    }

    pub fn applies_to(&self, index: &IndexFields) -> bool {
        match &self.expected {
            Some(expected) => index.get(&self.key).unwrap_or(&IndexValue::Null) == expected,
            None => true,
        }
    }

    /// 同时更新索引与对象本体
    pub fn apply(&self, record: &mut StoredRecord) {
        for (key, value) in &self.set {
            record.index.insert(key.clone(), value.clone());
            if let serde_json::Value::Object(map) = &mut record.state {
                map.insert(key.clone(), value.to_json());
            }
        }
    }
}

/// 文档后端接口
///
/// 记录按 `(store, id)` 唯一定位，`find` / `consume_one` / `modify_one`
/// 均按标识升序选择记录。
#[async_trait]
pub trait DocumentBackend: Send + Sync {
    /// 插入记录，标识已存在时不做任何修改并返回 false
    async fn insert(&self, store: &str, record: &StoredRecord) -> SchedulerResult<bool>;

    /// 整体替换已存在的记录
    async fn replace(&self, store: &str, record: &StoredRecord) -> SchedulerResult<()>;

    /// 仅当记录当前的索引字段满足 `precondition` 时整体替换，返回是否写入
    async fn replace_where(
        &self,
        store: &str,
        record: &StoredRecord,
        precondition: &Filter,
    ) -> SchedulerResult<bool>;

    async fn fetch(&self, store: &str, id: ObjectId) -> SchedulerResult<Option<StoredRecord>>;

    async fn find(&self, store: &str, filter: &Filter) -> SchedulerResult<Vec<StoredRecord>>;

    /// 读取一组记录的索引字段，不存在的标识被忽略
    async fn fetch_index(
        &self,
        store: &str,
        ids: &[ObjectId],
    ) -> SchedulerResult<Vec<(ObjectId, IndexFields)>>;

    /// 原子地修改第一条满足过滤条件与修改前置条件的记录，返回修改后的记录
    async fn modify_one(
        &self,
        store: &str,
        filter: &Filter,
        modification: &Modification,
    ) -> SchedulerResult<Option<StoredRecord>>;

    /// 对指定标识做条件修改
    async fn modify_by_id(
        &self,
        store: &str,
        id: ObjectId,
        modification: &Modification,
    ) -> SchedulerResult<Option<StoredRecord>>;

    /// 原子地取出并删除第一条满足条件的记录
    async fn consume_one(
        &self,
        store: &str,
        filter: &Filter,
    ) -> SchedulerResult<Option<StoredRecord>>;

    async fn count(&self, store: &str, filter: &Filter) -> SchedulerResult<u64>;

    /// 连通性检查
    async fn ping(&self) -> SchedulerResult<()>;
}
