//! 对象存储的缓存策略
//!
//! 缓存中保存 `Arc<T>`，调用方拿到的是共享引用。LRU 策略只限制强引用数量：
//! 被淘汰的对象仍以弱引用登记，只要外部还持有它，再次 `get` 就会拿回同一个实例，
//! 因此同一标识在进程内不会出现两个并存的副本。

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use taskyard_core::{config::CacheMode, ObjectId};

pub trait CachePolicy<T>: Send {
    fn get(&mut self, id: ObjectId) -> Option<Arc<T>>;
    fn put(&mut self, id: ObjectId, value: Arc<T>);
    fn remove(&mut self, id: ObjectId);
    /// 强引用条目数
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct NoCache;

impl<T> CachePolicy<T> for NoCache {
    fn get(&mut self, _id: ObjectId) -> Option<Arc<T>> {
        None
    }

    fn put(&mut self, _id: ObjectId, _value: Arc<T>) {}

    fn remove(&mut self, _id: ObjectId) {}

    fn len(&self) -> usize {
        0
    }
}

pub struct UnboundedCache<T> {
    entries: HashMap<ObjectId, Arc<T>>,
}

impl<T> Default for UnboundedCache<T> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<T: Send + Sync> CachePolicy<T> for UnboundedCache<T> {
    fn get(&mut self, id: ObjectId) -> Option<Arc<T>> {
        self.entries.get(&id).cloned()
    }

    fn put(&mut self, id: ObjectId, value: Arc<T>) {
        self.entries.insert(id, value);
    }

    fn remove(&mut self, id: ObjectId) {
        self.entries.remove(&id);
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

pub struct LruCache<T> {
    capacity: usize,
    strong: HashMap<ObjectId, Arc<T>>,
    order: VecDeque<ObjectId>,
    weak: HashMap<ObjectId, Weak<T>>,
}

impl<T> LruCache<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            strong: HashMap::new(),
            order: VecDeque::new(),
            weak: HashMap::new(),
        }
    }

    fn touch(&mut self, id: ObjectId) {
        if let Some(pos) = self.order.iter().position(|x| *x == id) {
            self.order.remove(pos);
        }
        self.order.push_back(id);
    }

    fn evict(&mut self) {
        while self.strong.len() > self.capacity {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.strong.remove(&oldest);
                }
                None => break,
            }
        }

        if self.weak.len() > self.capacity * 4 + 16 {
            self.weak.retain(|_, w| w.strong_count() > 0);
        }
    }

    /// 仍可通过弱引用取回的条目数
    pub fn weak_len(&self) -> usize {
        self.weak.values().filter(|w| w.strong_count() > 0).count()
    }
}

impl<T: Send + Sync> CachePolicy<T> for LruCache<T> {
    fn get(&mut self, id: ObjectId) -> Option<Arc<T>> {
        if let Some(value) = self.strong.get(&id).cloned() {
            self.touch(id);
            return Some(value);
        }

        match self.weak.get(&id).and_then(Weak::upgrade) {
            Some(value) => {
                self.put(id, value.clone());
                Some(value)
            }
            None => {
                self.weak.remove(&id);
                None
            }
        }
    }

    fn put(&mut self, id: ObjectId, value: Arc<T>) {
        self.weak.insert(id, Arc::downgrade(&value));
        self.strong.insert(id, value);
        self.touch(id);
        self.evict();
    }

    fn remove(&mut self, id: ObjectId) {
        self.strong.remove(&id);
        self.weak.remove(&id);
        if let Some(pos) = self.order.iter().position(|x| *x == id) {
            self.order.remove(pos);
        }
    }

    fn len(&self) -> usize {
        self.strong.len()
    }
}

pub fn build_cache<T: Send + Sync + 'static>(mode: CacheMode) -> Box<dyn CachePolicy<T>> {
    match mode {
        CacheMode::None => Box::new(NoCache),
        CacheMode::Unbounded => Box::new(UnboundedCache::default()),
        CacheMode::Lru { capacity } => Box::new(LruCache::new(capacity)),
    }
}
