use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use taskyard_core::{
    DocumentBackend, Filter, IndexFields, Modification, ObjectId, SchedulerError,
    SchedulerResult, StoredRecord,
};
use tokio::sync::Mutex;

type Records = BTreeMap<ObjectId, StoredRecord>;

/// 进程内文档后端
///
/// 所有操作在同一把锁内完成，条件修改天然原子。
/// `set_offline(true)` 让所有操作返回 `StoreUnavailable`，用于模拟存储中断。
#[derive(Default)]
pub struct MemoryBackend {
    stores: Mutex<HashMap<String, Records>>,
    offline: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn ensure_online(&self) -> SchedulerResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(SchedulerError::StoreUnavailable("内存存储已离线".to_string()));
        }
        Ok(())
    }
}

fn first_match<'a>(
    records: &'a mut Records,
    filter: &Filter,
    modification: Option<&Modification>,
) -> Option<&'a mut StoredRecord> {
    records.values_mut().find(|record| {
        filter.matches(record.id, &record.index)
            && modification.map_or(true, |m| m.applies_to(&record.index))
    })
}

#[async_trait]
impl DocumentBackend for MemoryBackend {
    async fn insert(&self, store: &str, record: &StoredRecord) -> SchedulerResult<bool> {
        self.ensure_online()?;
        let mut stores = self.stores.lock().await;
        let records = stores.entry(store.to_string()).or_default();
        if records.contains_key(&record.id) {
            return Ok(false);
        }
        records.insert(record.id, record.clone());
        Ok(true)
    }

    async fn replace(&self, store: &str, record: &StoredRecord) -> SchedulerResult<()> {
        self.ensure_online()?;
        let mut stores = self.stores.lock().await;
        match stores.get_mut(store).and_then(|r| r.get_mut(&record.id)) {
            Some(existing) => {
                let created_at = existing.created_at;
                *existing = record.clone();
                existing.created_at = created_at;
                Ok(())
            }
            None => Err(SchedulerError::ObjectNotFound {
                store: store.to_string(),
                id: record.id,
            }),
        }
    }

    async fn replace_where(
        &self,
        store: &str,
        record: &StoredRecord,
        precondition: &Filter,
    ) -> SchedulerResult<bool> {
        self.ensure_online()?;
        let mut stores = self.stores.lock().await;
        match stores.get_mut(store).and_then(|r| r.get_mut(&record.id)) {
            Some(existing) if precondition.matches(existing.id, &existing.index) => {
                let created_at = existing.created_at;
                *existing = record.clone();
                existing.created_at = created_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn fetch(&self, store: &str, id: ObjectId) -> SchedulerResult<Option<StoredRecord>> {
        self.ensure_online()?;
        let stores = self.stores.lock().await;
        Ok(stores.get(store).and_then(|r| r.get(&id)).cloned())
    }

    async fn find(&self, store: &str, filter: &Filter) -> SchedulerResult<Vec<StoredRecord>> {
        self.ensure_online()?;
        let stores = self.stores.lock().await;
        Ok(stores
            .get(store)
            .map(|records| {
                records
                    .values()
                    .filter(|r| filter.matches(r.id, &r.index))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn fetch_index(
        &self,
        store: &str,
        ids: &[ObjectId],
    ) -> SchedulerResult<Vec<(ObjectId, IndexFields)>> {
        self.ensure_online()?;
        let stores = self.stores.lock().await;
        let Some(records) = stores.get(store) else {
            return Ok(Vec::new());
        };
        Ok(ids
            .iter()
            .filter_map(|id| records.get(id).map(|r| (r.id, r.index.clone())))
            .collect())
    }

    async fn modify_one(
        &self,
        store: &str,
        filter: &Filter,
        modification: &Modification,
    ) -> SchedulerResult<Option<StoredRecord>> {
        self.ensure_online()?;
        let mut stores = self.stores.lock().await;
        let Some(records) = stores.get_mut(store) else {
            return Ok(None);
        };
        Ok(first_match(records, filter, Some(modification)).map(|record| {
            modification.apply(record);
            record.clone()
        }))
    }

    async fn modify_by_id(
        &self,
        store: &str,
        id: ObjectId,
        modification: &Modification,
    ) -> SchedulerResult<Option<StoredRecord>> {
        self.ensure_online()?;
        let mut stores = self.stores.lock().await;
        let record = stores.get_mut(store).and_then(|r| r.get_mut(&id));
        Ok(match record {
            Some(record) if modification.applies_to(&record.index) => {
                modification.apply(record);
                Some(record.clone())
            }
            _ => None,
        })
    }

    async fn consume_one(
        &self,
        store: &str,
        filter: &Filter,
    ) -> SchedulerResult<Option<StoredRecord>> {
        self.ensure_online()?;
        let mut stores = self.stores.lock().await;
        let Some(records) = stores.get_mut(store) else {
            return Ok(None);
        };
        let id = first_match(records, filter, None).map(|r| r.id);
        Ok(id.and_then(|id| records.remove(&id)))
    }

    async fn count(&self, store: &str, filter: &Filter) -> SchedulerResult<u64> {
        self.ensure_online()?;
        let stores = self.stores.lock().await;
        Ok(stores
            .get(store)
            .map(|records| {
                records
                    .values()
                    .filter(|r| filter.matches(r.id, &r.index))
                    .count() as u64
            })
            .unwrap_or(0))
    }

    async fn ping(&self) -> SchedulerResult<()> {
        self.ensure_online()
    }
}
