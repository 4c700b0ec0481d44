use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, MutexGuard};
use taskyard_core::{
    config::CacheMode, DocumentBackend, Filter, IndexValue, Modification, ObjectId,
    SchedulerError, SchedulerResult, StoreObject, StoredRecord,
};
use tracing::debug;

use super::cache::{build_cache, CachePolicy};

/// 单一类型对象的持久化集合
///
/// 对象按标识保存在文档后端的一个命名存储中，并按缓存策略保留在本进程内。
/// 缓存只加速 `load`；`find` / `reload` / 条件修改总是读取后端并刷新缓存。
pub struct ObjectStore<T: StoreObject> {
    name: String,
    content_type: String,
    backend: Arc<dyn DocumentBackend>,
    cache: Mutex<Box<dyn CachePolicy<T>>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: StoreObject> ObjectStore<T> {
    pub fn new(name: impl Into<String>, backend: Arc<dyn DocumentBackend>, cache: CacheMode) -> Self {
        Self {
            name: name.into(),
            content_type: T::CONTENT_TYPE.to_string(),
            backend,
            cache: Mutex::new(build_cache(cache)),
            _marker: PhantomData,
        }
    }

    /// 收窄存储接受的类型，例如只接受 `task.call`
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn cache_len(&self) -> usize {
        self.cache().len()
    }

    fn cache(&self) -> MutexGuard<'_, Box<dyn CachePolicy<T>>> {
        self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn accepts(&self, kind: &str) -> bool {
        kind == self.content_type
            || kind
                .strip_prefix(self.content_type.as_str())
                .is_some_and(|rest| rest.starts_with('.'))
    }

    fn check_kind(&self, kind: &str) -> SchedulerResult<()> {
        if self.accepts(kind) {
            Ok(())
        } else {
            Err(SchedulerError::TypeMismatch {
                store: self.name.clone(),
                expected: self.content_type.clone(),
                actual: kind.to_string(),
            })
        }
    }

    fn encode(&self, object: &T) -> SchedulerResult<StoredRecord> {
        let kind = object.kind();
        self.check_kind(&kind)?;
        Ok(StoredRecord {
            id: object.id(),
            kind,
            state: serde_json::to_value(object)?,
            index: object.index_fields(),
            created_at: object.created_at(),
        })
    }

    fn decode(&self, record: StoredRecord) -> SchedulerResult<Arc<T>> {
        self.check_kind(&record.kind)?;
        let object: T = serde_json::from_value(record.state)?;
        let object = Arc::new(object);
        self.cache().put(record.id, object.clone());
        Ok(object)
    }

    /// 保存新对象。标识已存在时不做任何修改，返回 false。
    pub async fn save(&self, object: &T) -> SchedulerResult<bool> {
        let record = self.encode(object)?;
        let inserted = self.backend.insert(&self.name, &record).await?;
        if inserted {
            self.cache().put(record.id, Arc::new(object.clone()));
        } else {
            debug!("对象 {}/{} 已存在，跳过保存", self.name, record.id);
        }
        Ok(inserted)
    }

    /// 整体覆盖已保存的对象
    pub async fn update(&self, object: &T) -> SchedulerResult<()> {
        let record = self.encode(object)?;
        self.backend.replace(&self.name, &record).await?;
        self.cache().put(record.id, Arc::new(object.clone()));
        Ok(())
    }

    /// 仅当 `key` 的当前值仍为 `expected` 时整体覆盖
    pub async fn update_if(
        &self,
        object: &T,
        key: &str,
        expected: impl Into<IndexValue>,
    ) -> SchedulerResult<bool> {
        self.update_where(object, &Filter::new().eq(key, expected))
            .await
    }

    /// 仅当已保存记录的索引字段满足 `precondition` 时整体覆盖
    pub async fn update_where(&self, object: &T, precondition: &Filter) -> SchedulerResult<bool> {
        let record = self.encode(object)?;
        let written = self
            .backend
            .replace_where(&self.name, &record, precondition)
            .await?;
        if written {
            self.cache().put(record.id, Arc::new(object.clone()));
        } else {
            self.cache().remove(record.id);
        }
        Ok(written)
    }

    pub async fn get(&self, id: ObjectId) -> SchedulerResult<Option<Arc<T>>> {
        if let Some(cached) = self.cache().get(id) {
            return Ok(Some(cached));
        }
        self.reload_optional(id).await
    }

    pub async fn load(&self, id: ObjectId) -> SchedulerResult<Arc<T>> {
        self.get(id).await?.ok_or_else(|| SchedulerError::ObjectNotFound {
            store: self.name.clone(),
            id,
        })
    }

    /// 跳过缓存，从后端读取最新状态
    pub async fn reload(&self, id: ObjectId) -> SchedulerResult<Arc<T>> {
        self.reload_optional(id)
            .await?
            .ok_or_else(|| SchedulerError::ObjectNotFound {
                store: self.name.clone(),
                id,
            })
    }

    async fn reload_optional(&self, id: ObjectId) -> SchedulerResult<Option<Arc<T>>> {
        match self.backend.fetch(&self.name, id).await? {
            Some(record) => self.decode(record).map(Some),
            None => {
                self.cache().remove(id);
                Ok(None)
            }
        }
    }

    /// 按索引字段查询，按标识升序返回。其他子类型的记录被忽略。
    pub async fn find(&self, filter: &Filter) -> SchedulerResult<Vec<Arc<T>>> {
        let records = self.backend.find(&self.name, filter).await?;
        let mut objects = Vec::with_capacity(records.len());
        for record in records {
            if !self.accepts(&record.kind) {
                continue;
            }
            objects.push(self.decode(record)?);
        }
        Ok(objects)
    }

    pub async fn all(&self) -> SchedulerResult<Vec<Arc<T>>> {
        self.find(&Filter::new()).await
    }

    pub async fn count(&self, filter: &Filter) -> SchedulerResult<u64> {
        self.backend.count(&self.name, filter).await
    }

    /// 原子地把第一条 `key == expected` 的记录改为 `new_value`
    pub async fn modify_one(
        &self,
        key: &str,
        expected: impl Into<IndexValue>,
        new_value: impl Into<IndexValue>,
    ) -> SchedulerResult<Option<Arc<T>>> {
        self.modify_one_where(&Filter::new(), &Modification::new(key, expected, new_value))
            .await
    }

    pub async fn modify_one_where(
        &self,
        filter: &Filter,
        modification: &Modification,
    ) -> SchedulerResult<Option<Arc<T>>> {
        let record = self
            .backend
            .modify_one(&self.name, filter, modification)
            .await?;
        record.map(|r| self.decode(r)).transpose()
    }

    /// 对单条记录做比较并交换
    pub async fn modify_if(
        &self,
        id: ObjectId,
        key: &str,
        expected: impl Into<IndexValue>,
        new_value: impl Into<IndexValue>,
    ) -> SchedulerResult<Option<Arc<T>>> {
        self.modify_by_id(id, &Modification::new(key, expected, new_value))
            .await
    }

    pub async fn modify_by_id(
        &self,
        id: ObjectId,
        modification: &Modification,
    ) -> SchedulerResult<Option<Arc<T>>> {
        let record = self
            .backend
            .modify_by_id(&self.name, id, modification)
            .await?;
        if record.is_none() {
            self.cache().remove(id);
        }
        record.map(|r| self.decode(r)).transpose()
    }

    /// 只写一个字段，不影响记录的其他部分
    pub async fn set_field(
        &self,
        id: ObjectId,
        key: &str,
        value: impl Into<IndexValue>,
    ) -> SchedulerResult<Arc<T>> {
        self.modify_by_id(id, &Modification::unconditional(key, value))
            .await?
            .ok_or_else(|| SchedulerError::ObjectNotFound {
                store: self.name.clone(),
                id,
            })
    }

    /// 原子地取出并删除第一条满足条件的记录
    pub async fn consume_one(&self, filter: &Filter) -> SchedulerResult<Option<T>> {
        let Some(record) = self.backend.consume_one(&self.name, filter).await? else {
            return Ok(None);
        };
        self.cache().remove(record.id);
        self.check_kind(&record.kind)?;
        Ok(Some(serde_json::from_value(record.state)?))
    }

    /// 读取一组对象的某个索引字段，不存在的对象不出现在结果中
    pub async fn index_of(
        &self,
        ids: &[ObjectId],
        key: &str,
    ) -> SchedulerResult<HashMap<ObjectId, IndexValue>> {
        let rows = self.backend.fetch_index(&self.name, ids).await?;
        Ok(rows
            .into_iter()
            .map(|(id, index)| (id, index.get(key).cloned().unwrap_or(IndexValue::Null)))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::MemoryBackend;
    use taskyard_core::models::{CallSpec, File, Task, TaskState};

    fn task_store(cache: CacheMode) -> ObjectStore<Task> {
        ObjectStore::new("proj.tasks", Arc::new(MemoryBackend::new()), cache)
    }

    #[tokio::test]
    async fn test_save_then_load_roundtrip() {
        let store = task_store(CacheMode::None);
        let task = Task::new("echo").with_arguments(["hello"]);
        assert!(store.save(&task).await.unwrap());
        let loaded = store.load(task.id).await.unwrap();
        assert_eq!(*loaded, task);
    }

    #[tokio::test]
    async fn test_save_existing_identity_is_noop() {
        let store = task_store(CacheMode::Unbounded);
        let mut task = Task::new("echo");
        store.save(&task).await.unwrap();
        task.executable = "changed".into();
        assert!(!store.save(&task).await.unwrap());
        assert_eq!(store.reload(task.id).await.unwrap().executable, "echo");
    }

    #[tokio::test]
    async fn test_load_missing_is_not_found() {
        let store = task_store(CacheMode::Lru { capacity: 4 });
        let err = store.load(ObjectId::generate()).await.unwrap_err();
        assert!(matches!(err, SchedulerError::ObjectNotFound { .. }));
    }

    #[tokio::test]
    async fn test_narrowed_store_rejects_other_kinds() {
        let store = task_store(CacheMode::None).with_content_type("task.call");
        let err = store.save(&Task::new("echo")).await.unwrap_err();
        assert!(matches!(err, SchedulerError::TypeMismatch { .. }));
        assert!(store.save(&Task::call(CallSpec::new("m.f"))).await.unwrap());
    }

    #[tokio::test]
    async fn test_load_with_wrong_kind_is_type_mismatch() {
        let backend: Arc<dyn DocumentBackend> = Arc::new(MemoryBackend::new());
        let files: ObjectStore<File> = ObjectStore::new("proj.shared", backend.clone(), CacheMode::None);
        let tasks: ObjectStore<Task> = ObjectStore::new("proj.shared", backend, CacheMode::None);
        let task = Task::new("echo");
        tasks.save(&task).await.unwrap();
        let err = files.load(task.id).await.unwrap_err();
        assert!(matches!(err, SchedulerError::TypeMismatch { .. }));
    }

    #[tokio::test]
    async fn test_lru_eviction_does_not_affect_correctness() {
        let store = task_store(CacheMode::Lru { capacity: 2 });
        let tasks: Vec<Task> = (0..10).map(|i| Task::new(format!("job-{i}"))).collect();
        for task in &tasks {
            store.save(task).await.unwrap();
        }
        assert_eq!(store.cache_len(), 2);
        for task in &tasks {
            assert_eq!(store.load(task.id).await.unwrap().executable, task.executable);
        }
    }

    #[tokio::test]
    async fn test_modify_one_claims_once() {
        let store = task_store(CacheMode::Unbounded);
        let task = Task::new("echo");
        store.save(&task).await.unwrap();

        let claimed = store
            .modify_one("state", TaskState::Created, TaskState::Queued)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.state, TaskState::Queued);
        assert!(store
            .modify_one("state", TaskState::Created, TaskState::Queued)
            .await
            .unwrap()
            .is_none());
        // 缓存跟随修改
        assert_eq!(store.load(task.id).await.unwrap().state, TaskState::Queued);
    }

    #[tokio::test]
    async fn test_update_if_and_index_of() {
        let store = task_store(CacheMode::None);
        let mut task = Task::new("echo");
        store.save(&task).await.unwrap();

        task.state = TaskState::Queued;
        assert!(!store.update_if(&task, "state", TaskState::Running).await.unwrap());
        assert!(store.update_if(&task, "state", TaskState::Created).await.unwrap());

        let states = store.index_of(&[task.id, ObjectId::generate()], "state").await.unwrap();
        assert_eq!(states.len(), 1);
        assert_eq!(states[&task.id], IndexValue::from("queued"));
    }

    #[tokio::test]
    async fn test_consume_one() {
        let store = task_store(CacheMode::Unbounded);
        let first = Task::new("a");
        let second = Task::new("b");
        store.save(&second).await.unwrap();
        store.save(&first).await.unwrap();

        let taken = store.consume_one(&Filter::new()).await.unwrap().unwrap();
        assert_eq!(taken.id, first.id);
        assert!(store.get(first.id).await.unwrap().is_none());
        assert_eq!(store.count(&Filter::new()).await.unwrap(), 1);
    }
}
