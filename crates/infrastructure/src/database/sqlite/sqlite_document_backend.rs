use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use taskyard_core::traits::Condition;
use taskyard_core::{
    DocumentBackend, Filter, IndexFields, IndexValue, Modification, ObjectId, SchedulerError,
    SchedulerResult, StoredRecord,
};
use tracing::{debug, instrument};

const RETURNING: &str = " RETURNING id, kind, state, index_fields, created_at";

/// 基于单表的 SQLite 文档后端
///
/// 每条记录保存序列化后的对象和索引字段（均为 JSON 文本），
/// 条件判断通过 `json_extract` 在索引字段上完成。条件修改是单条语句，
/// 由 SQLite 的写锁保证原子性。
pub struct SqliteDocumentBackend {
    pool: SqlitePool,
}

impl SqliteDocumentBackend {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_record(row: &SqliteRow) -> SchedulerResult<StoredRecord> {
        let state: String = row.try_get("state")?;
        let index: String = row.try_get("index_fields")?;
        Ok(StoredRecord {
            id: ObjectId::from_raw(row.try_get("id")?),
            kind: row.try_get("kind")?,
            state: serde_json::from_str(&state)?,
            index: serde_json::from_str(&index)?,
            created_at: row.try_get("created_at")?,
        })
    }
}

fn json_path(key: &str) -> String {
    format!("$.\"{key}\"")
}

fn push_value(qb: &mut QueryBuilder<'_, Sqlite>, value: &IndexValue) {
    match value {
        IndexValue::Null => qb.push_bind(Option::<i64>::None),
        IndexValue::Bool(b) => qb.push_bind(i64::from(*b)),
        IndexValue::Int(i) => qb.push_bind(*i),
        IndexValue::Text(s) => qb.push_bind(s.clone()),
    };
}

fn push_field_is(qb: &mut QueryBuilder<'_, Sqlite>, key: &str, value: &IndexValue) {
    qb.push(" AND json_extract(index_fields, ");
    qb.push_bind(json_path(key));
    qb.push(") IS ");
    push_value(qb, value);
}

fn push_filter(qb: &mut QueryBuilder<'_, Sqlite>, filter: &Filter) {
    if let Some(ids) = &filter.ids {
        if ids.is_empty() {
            qb.push(" AND 0");
        } else {
            qb.push(" AND id IN (");
            let mut separated = qb.separated(", ");
            for id in ids {
                separated.push_bind(id.as_i64());
            }
            qb.push(")");
        }
    }

    for condition in &filter.conditions {
        match condition {
            Condition::Eq { key, value } => push_field_is(qb, key, value),
            Condition::AnyOf { key, values } => {
                let concrete: Vec<&IndexValue> = values.iter().filter(|v| !v.is_null()).collect();
                let with_null = concrete.len() != values.len();
                qb.push(" AND (");
                if concrete.is_empty() {
                    qb.push("0");
                } else {
                    qb.push("json_extract(index_fields, ");
                    qb.push_bind(json_path(key));
                    qb.push(") IN (");
                    for (i, value) in concrete.into_iter().enumerate() {
                        if i > 0 {
                            qb.push(", ");
                        }
                        push_value(qb, value);
                    }
                    qb.push(")");
                }
                if with_null {
                    qb.push(" OR json_extract(index_fields, ");
                    qb.push_bind(json_path(key));
                    qb.push(") IS NULL");
                }
                qb.push(")");
            }
        }
    }
}

fn push_json_set(qb: &mut QueryBuilder<'_, Sqlite>, column: &str, modification: &Modification) {
    qb.push(column);
    qb.push(" = json_set(");
    qb.push(column);
    for (key, value) in &modification.set {
        qb.push(", ");
        qb.push_bind(json_path(key));
        qb.push(", json(");
        qb.push_bind(value.to_json().to_string());
        qb.push(")");
    }
    qb.push(")");
}

fn push_update_head(qb: &mut QueryBuilder<'_, Sqlite>, modification: &Modification) {
    push_json_set(qb, "index_fields", modification);
    qb.push(", ");
    push_json_set(qb, "state", modification);
}

#[async_trait]
impl DocumentBackend for SqliteDocumentBackend {
    #[instrument(skip(self, record), fields(id = %record.id))]
    async fn insert(&self, store: &str, record: &StoredRecord) -> SchedulerResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO objects (store, id, kind, state, index_fields, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT(store, id) DO NOTHING
            "#,
        )
        .bind(store)
        .bind(record.id.as_i64())
        .bind(&record.kind)
        .bind(record.state.to_string())
        .bind(serde_json::to_string(&record.index)?)
        .bind(record.created_at)
        .execute(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        debug!("保存对象 {}/{}: {}", store, record.id, result.rows_affected());
        Ok(result.rows_affected() == 1)
    }

    async fn replace(&self, store: &str, record: &StoredRecord) -> SchedulerResult<()> {
        let result = sqlx::query(
            "UPDATE objects SET kind = $1, state = $2, index_fields = $3 WHERE store = $4 AND id = $5",
        )
        .bind(&record.kind)
        .bind(record.state.to_string())
        .bind(serde_json::to_string(&record.index)?)
        .bind(store)
        .bind(record.id.as_i64())
        .execute(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        if result.rows_affected() == 0 {
            return Err(SchedulerError::ObjectNotFound {
                store: store.to_string(),
                id: record.id,
            });
        }
        Ok(())
    }

    async fn replace_where(
        &self,
        store: &str,
        record: &StoredRecord,
        precondition: &Filter,
    ) -> SchedulerResult<bool> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE objects SET kind = ");
        qb.push_bind(record.kind.clone());
        qb.push(", state = ");
        qb.push_bind(record.state.to_string());
        qb.push(", index_fields = ");
        qb.push_bind(serde_json::to_string(&record.index)?);
        qb.push(" WHERE store = ");
        qb.push_bind(store.to_string());
        qb.push(" AND id = ");
        qb.push_bind(record.id.as_i64());
        push_filter(&mut qb, precondition);

        let result = qb
            .build()
            .execute(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;
        Ok(result.rows_affected() == 1)
    }

    async fn fetch(&self, store: &str, id: ObjectId) -> SchedulerResult<Option<StoredRecord>> {
        let row = sqlx::query(
            "SELECT id, kind, state, index_fields, created_at FROM objects WHERE store = $1 AND id = $2",
        )
        .bind(store)
        .bind(id.as_i64())
        .fetch_optional(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        row.as_ref().map(Self::row_to_record).transpose()
    }

    async fn find(&self, store: &str, filter: &Filter) -> SchedulerResult<Vec<StoredRecord>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT id, kind, state, index_fields, created_at FROM objects WHERE store = ",
        );
        qb.push_bind(store.to_string());
        push_filter(&mut qb, filter);
        qb.push(" ORDER BY id");

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;
        rows.iter().map(Self::row_to_record).collect()
    }

    async fn fetch_index(
        &self,
        store: &str,
        ids: &[ObjectId],
    ) -> SchedulerResult<Vec<(ObjectId, IndexFields)>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT id, index_fields FROM objects WHERE store = ");
        qb.push_bind(store.to_string());
        push_filter(&mut qb, &Filter::new().ids(ids.to_vec()));

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;

        rows.iter()
            .map(|row| -> SchedulerResult<(ObjectId, IndexFields)> {
                let index: String = row.try_get("index_fields")?;
                Ok((ObjectId::from_raw(row.try_get("id")?), serde_json::from_str(&index)?))
            })
            .collect()
    }

    #[instrument(skip(self, filter, modification), fields(key = %modification.key))]
    async fn modify_one(
        &self,
        store: &str,
        filter: &Filter,
        modification: &Modification,
    ) -> SchedulerResult<Option<StoredRecord>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE objects SET ");
        push_update_head(&mut qb, modification);
        qb.push(" WHERE store = ");
        qb.push_bind(store.to_string());
        qb.push(" AND id = (SELECT id FROM objects WHERE store = ");
        qb.push_bind(store.to_string());
        push_filter(&mut qb, filter);
        if let Some(expected) = &modification.expected {
            push_field_is(&mut qb, &modification.key, expected);
        }
        qb.push(" ORDER BY id LIMIT 1)");
        qb.push(RETURNING);

        let row = qb
            .build()
            .fetch_optional(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;
        row.as_ref().map(Self::row_to_record).transpose()
    }

    async fn modify_by_id(
        &self,
        store: &str,
        id: ObjectId,
        modification: &Modification,
    ) -> SchedulerResult<Option<StoredRecord>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE objects SET ");
        push_update_head(&mut qb, modification);
        qb.push(" WHERE store = ");
        qb.push_bind(store.to_string());
        qb.push(" AND id = ");
        qb.push_bind(id.as_i64());
        if let Some(expected) = &modification.expected {
            push_field_is(&mut qb, &modification.key, expected);
        }
        qb.push(RETURNING);

        let row = qb
            .build()
            .fetch_optional(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;
        row.as_ref().map(Self::row_to_record).transpose()
    }

    async fn consume_one(
        &self,
        store: &str,
        filter: &Filter,
    ) -> SchedulerResult<Option<StoredRecord>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("DELETE FROM objects WHERE store = ");
        qb.push_bind(store.to_string());
        qb.push(" AND id = (SELECT id FROM objects WHERE store = ");
        qb.push_bind(store.to_string());
        push_filter(&mut qb, filter);
        qb.push(" ORDER BY id LIMIT 1)");
        qb.push(RETURNING);

        let row = qb
            .build()
            .fetch_optional(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;
        row.as_ref().map(Self::row_to_record).transpose()
    }

    async fn count(&self, store: &str, filter: &Filter) -> SchedulerResult<u64> {
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT COUNT(*) AS count FROM objects WHERE store = ");
        qb.push_bind(store.to_string());
        push_filter(&mut qb, filter);

        let row = qb
            .build()
            .fetch_one(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;
        Ok(row.try_get::<i64, _>("count")? as u64)
    }

    async fn ping(&self) -> SchedulerResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;
        Ok(())
    }
}
