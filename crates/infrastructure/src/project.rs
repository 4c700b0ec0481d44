use chrono::Utc;
use std::sync::Arc;
use taskyard_core::{
    config::{AppConfig, ProjectConfig},
    models::{File, Location, LogRecord, Task, TaskState, WorkerRecord},
    DocumentBackend, Filter, IndexValue, ObjectId, SchedulerError, SchedulerResult,
};
use tracing::{debug, info, warn};

use crate::database::open_backend;
use crate::store::ObjectStore;

/// 一个项目的全部存储：任务、Worker、文件登记与日志
pub struct Project {
    config: ProjectConfig,
    backend: Arc<dyn DocumentBackend>,
    pub tasks: ObjectStore<Task>,
    pub workers: ObjectStore<WorkerRecord>,
    pub files: ObjectStore<File>,
    pub logs: ObjectStore<LogRecord>,
}

impl Project {
    pub fn new(config: ProjectConfig, backend: Arc<dyn DocumentBackend>) -> Self {
        let store = |suffix: &str| format!("{}.{}", config.name, suffix);
        Self {
            tasks: ObjectStore::new(store("tasks"), backend.clone(), config.cache.tasks),
            workers: ObjectStore::new(store("workers"), backend.clone(), config.cache.workers),
            files: ObjectStore::new(store("files"), backend.clone(), config.cache.files),
            logs: ObjectStore::new(store("logs"), backend.clone(), config.cache.logs),
            backend,
            config,
        }
    }

    pub async fn open(config: &AppConfig) -> SchedulerResult<Self> {
        let backend = open_backend(&config.database).await?;
        backend.ping().await?;
        info!("打开项目: {}", config.project.name);
        Ok(Self::new(config.project.clone(), backend))
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ProjectConfig {
        &self.config
    }

    pub fn backend(&self) -> Arc<dyn DocumentBackend> {
        self.backend.clone()
    }

    /// 提交任务。依赖必须已经提交过。
    pub async fn queue(&self, task: &Task) -> SchedulerResult<bool> {
        if !matches!(task.state, TaskState::Created | TaskState::Dummy) {
            return Err(SchedulerError::InvalidTransition {
                from: task.state,
                to: TaskState::Created,
            });
        }

        if !task.dependencies.is_empty() {
            let known = self.tasks.index_of(&task.dependencies, "state").await?;
            if let Some(missing) = task.dependencies.iter().find(|id| !known.contains_key(id)) {
                return Err(SchedulerError::InvalidDependency(format!(
                    "任务 {} 依赖的任务 {} 尚未提交",
                    task.id, missing
                )));
            }
        }

        let saved = self.tasks.save(task).await?;
        if saved {
            debug!("任务已提交: {}", task.id);
        }
        Ok(saved)
    }

    /// 按顺序提交一组任务（依赖在前）
    pub async fn queue_all(&self, tasks: &[Task]) -> SchedulerResult<usize> {
        let mut saved = 0;
        for task in tasks {
            if self.queue(task).await? {
                saved += 1;
            }
        }
        Ok(saved)
    }

    /// 某个位置当前有效的文件。已产生的记录优先，其次是标识最小的占位记录。
    pub async fn file_at(&self, location: &Location) -> SchedulerResult<Option<Arc<File>>> {
        let found = self.valid_files(location).await?;
        let produced = found.iter().find(|f| f.exists()).cloned();
        Ok(produced.or_else(|| found.into_iter().next()))
    }

    async fn valid_files(&self, location: &Location) -> SchedulerResult<Vec<Arc<File>>> {
        let found = self
            .files
            .find(&Filter::new().eq("location", location.render()))
            .await?;
        Ok(found.into_iter().filter(|f| !f.is_invalidated()).collect())
    }

    /// 登记一个已产生的文件。同一位置已有有效记录时不做修改，返回 false。
    ///
    /// 并发登记同一位置时，所有登记者最终收敛到标识最小的已产生记录，其余记录失效。
    pub async fn register_file(&self, file: &File) -> SchedulerResult<bool> {
        if let Some(existing) = self.file_at(&file.location).await? {
            if existing.exists() {
                debug!("文件已登记，跳过: {}", file.location);
                return Ok(false);
            }
            let mut updated = (*existing).clone();
            match file.created {
                Some(ts) if ts > 0 => updated.created = Some(ts),
                _ => updated.mark_created(Utc::now())?,
            }
            updated.generator = file.generator.or(existing.generator);
            if !self.files.update_if(&updated, "created", IndexValue::Null).await? {
                debug!("占位记录已被其他登记者写入: {}", file.location);
                return Ok(false);
            }
            return self.settle_duplicates(&updated).await;
        }

        let mut record = file.clone();
        if !record.exists() {
            record.mark_created(Utc::now())?;
        }
        if !self.files.save(&record).await? {
            return Ok(false);
        }
        self.settle_duplicates(&record).await
    }

    /// 让同一位置多余的已产生记录失效，返回 `record` 是否保留下来
    async fn settle_duplicates(&self, record: &File) -> SchedulerResult<bool> {
        let produced: Vec<_> = self
            .valid_files(&record.location)
            .await?
            .into_iter()
            .filter(|f| f.exists())
            .collect();
        let Some(keeper) = produced.first() else {
            return Ok(false);
        };
        for extra in &produced[1..] {
            if let Some(ts) = extra.created {
                self.files.modify_if(extra.id, "created", ts, -ts).await?;
            }
        }
        if keeper.id != record.id {
            warn!(
                "文件 {} 被并发登记，保留记录 {}",
                record.location, keeper.id
            );
        }
        Ok(keeper.id == record.id)
    }

    /// 让某个位置的文件失效（例如被删除）
    pub async fn invalidate_file(&self, location: &Location) -> SchedulerResult<bool> {
        let Some(existing) = self.file_at(location).await? else {
            return Ok(false);
        };
        let mut updated = (*existing).clone();
        updated.invalidate();
        self.files.update(&updated).await?;
        Ok(true)
    }

    pub async fn task_logs(&self, task: ObjectId) -> SchedulerResult<Vec<Arc<LogRecord>>> {
        self.logs.find(&Filter::new().eq("task", task)).await
    }
}
