use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{SchedulerError, SchedulerResult};
use crate::id::ObjectId;
use crate::models::location::{Drive, Location};
use crate::traits::{IndexFields, IndexValue, StoreObject};

/// 受管理的文件（或以 `/` 结尾的目录）
///
/// `created` 为 None 表示尚未产生；正数为产生时间（Unix毫秒）；
/// 负数表示该文件已失效，绝对值是原产生时间。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct File {
    pub id: ObjectId,
    pub location: Location,
    pub created: Option<i64>,
    /// 产生该文件的任务
    pub generator: Option<ObjectId>,
    pub created_at: DateTime<Utc>,
}

impl File {
    pub fn new(location: Location) -> Self {
        Self {
            id: ObjectId::generate(),
            location,
            created: None,
            generator: None,
            created_at: Utc::now(),
        }
    }

    pub fn at(raw: &str) -> SchedulerResult<Self> {
        Ok(Self::new(Location::parse(raw)?))
    }

    pub fn drive(&self) -> Drive {
        self.location.drive()
    }

    pub fn is_folder(&self) -> bool {
        self.location.is_folder()
    }

    pub fn basename(&self) -> &str {
        self.location.basename()
    }

    pub fn exists(&self) -> bool {
        matches!(self.created, Some(ts) if ts > 0)
    }

    pub fn is_invalidated(&self) -> bool {
        matches!(self.created, Some(ts) if ts < 0)
    }

    /// 记录文件已产生。只有尚未产生的文件可以标记，失效的记录需要 [`File::supersede`]。
    pub fn mark_created(&mut self, at: DateTime<Utc>) -> SchedulerResult<()> {
        if self.exists() {
            return Err(SchedulerError::FileState(format!(
                "文件 {} 已存在，不能覆盖产生时间",
                self.location
            )));
        }
        if self.is_invalidated() {
            return Err(SchedulerError::FileState(format!(
                "文件 {} 已失效，不能重新产生",
                self.location
            )));
        }
        self.created = Some(at.timestamp_millis().max(1));
        Ok(())
    }

    pub fn invalidate(&mut self) {
        match self.created {
            Some(ts) if ts > 0 => self.created = Some(-ts),
            Some(_) => {}
            None => self.created = Some(-Utc::now().timestamp_millis().max(1)),
        }
    }

    /// 同一位置的新版本：旧记录失效，返回带新标识的文件
    pub fn supersede(&mut self) -> File {
        self.invalidate();
        File::new(self.location.clone())
    }

    pub fn with_generator(mut self, task: ObjectId) -> Self {
        self.generator = Some(task);
        self
    }
}

impl StoreObject for File {
    const CONTENT_TYPE: &'static str = "file";

    fn id(&self) -> ObjectId {
        self.id
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn index_fields(&self) -> IndexFields {
        let mut index = IndexFields::new();
        index.insert("location".into(), self.location.render().into());
        index.insert("created".into(), IndexValue::from(self.created));
        index.insert("generator".into(), IndexValue::from(self.generator));
        index
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_created_lifecycle() {
        let mut file = File::at("staging://traj.dcd").unwrap();
        assert!(!file.exists());
        file.mark_created(Utc::now()).unwrap();
        assert!(file.exists());

        // 已产生的文件不能被静默覆盖
        assert!(file.mark_created(Utc::now()).is_err());

        let stamp = file.created.unwrap();
        file.invalidate();
        assert!(file.is_invalidated());
        assert_eq!(file.created, Some(-stamp));

        // 失效的记录保持失效，新版本要换新标识
        assert!(file.mark_created(Utc::now()).is_err());
        assert_eq!(file.created, Some(-stamp));
        let mut next = file.supersede();
        next.mark_created(Utc::now()).unwrap();
        assert!(next.exists());
    }

    #[test]
    fn test_supersede_gives_new_identity() {
        let mut file = File::at("shared://model.bin").unwrap();
        file.mark_created(Utc::now()).unwrap();
        let next = file.supersede();
        assert!(file.is_invalidated());
        assert_ne!(next.id, file.id);
        assert_eq!(next.location, file.location);
        assert!(!next.exists());
    }

    #[test]
    fn test_index_fields_match_serialized_fields() {
        let file = File::at("worker://out/").unwrap().with_generator(ObjectId::from_raw(5));
        let json = serde_json::to_value(&file).unwrap();
        for (key, value) in file.index_fields() {
            assert_eq!(json[&key], value.to_json());
        }
    }
}
