use std::ops::Deref;
use taskyard_core::{ObjectId, SchedulerResult, StoreObject};

use super::object_store::ObjectStore;

/// 与存储同步的单个对象
///
/// 读取时从存储加载，本地修改只通过 `modify` 进行并标记为脏，
/// `sync` 把脏对象写回存储。
#[derive(Debug, Clone)]
pub struct Synced<T: StoreObject> {
    value: T,
    dirty: bool,
}

impl<T: StoreObject> Synced<T> {
    /// 尚未保存的新对象
    pub fn new(value: T) -> Self {
        Self { value, dirty: true }
    }

    pub async fn load(store: &ObjectStore<T>, id: ObjectId) -> SchedulerResult<Self> {
        let value = store.load(id).await?;
        Ok(Self {
            value: (*value).clone(),
            dirty: false,
        })
    }

    pub fn id(&self) -> ObjectId {
        self.value.id()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn modify<R>(&mut self, f: impl FnOnce(&mut T) -> R) -> R {
        self.dirty = true;
        f(&mut self.value)
    }

    /// 写回存储，返回是否发生了写入
    pub async fn sync(&mut self, store: &ObjectStore<T>) -> SchedulerResult<bool> {
        if !self.dirty {
            return Ok(false);
        }
        if !store.save(&self.value).await? {
            store.update(&self.value).await?;
        }
        self.dirty = false;
        Ok(true)
    }

    /// 丢弃本地修改，读取存储中的最新状态
    pub async fn refresh(&mut self, store: &ObjectStore<T>) -> SchedulerResult<()> {
        let value = store.reload(self.value.id()).await?;
        self.value = (*value).clone();
        self.dirty = false;
        Ok(())
    }

    pub fn into_inner(self) -> T {
        self.value
    }
}

impl<T: StoreObject> Deref for Synced<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::MemoryBackend;
    use std::sync::Arc;
    use taskyard_core::config::CacheMode;
    use taskyard_core::models::Task;

    fn store() -> ObjectStore<Task> {
        ObjectStore::new("p.tasks", Arc::new(MemoryBackend::new()), CacheMode::None)
    }

    #[tokio::test]
    async fn test_write_through_only_when_dirty() {
        let store = store();
        let mut task = Synced::new(Task::new("echo"));
        assert!(task.sync(&store).await.unwrap());
        assert!(!task.sync(&store).await.unwrap());

        task.modify(|t| {
            t.setenv("A", "1");
        });
        assert!(task.is_dirty());
        assert!(task.sync(&store).await.unwrap());

        let loaded = Synced::load(&store, task.id()).await.unwrap();
        assert!(!loaded.is_dirty());
        assert_eq!(loaded.environment.get("A").map(String::as_str), Some("1"));
    }

    #[tokio::test]
    async fn test_refresh_discards_local_changes() {
        let store = store();
        let mut task = Synced::new(Task::new("echo"));
        task.sync(&store).await.unwrap();

        task.modify(|t| t.executable = "changed".into());
        task.refresh(&store).await.unwrap();
        assert_eq!(task.executable, "echo");
        assert!(!task.is_dirty());
    }
}
