use std::str::FromStr;
use std::sync::Arc;

use depot_core::Document;
use depot_query::sql::{self, Dialect, TranslateError};
use depot_query::{Query, Update};
use serde_json::Value;
use sqlx::sqlite::{SqliteArguments, SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};

use crate::{Backend, Store, StoreError};

impl From<TranslateError> for StoreError {
    fn from(err: TranslateError) -> Self {
        match err {
            TranslateError::UnsupportedOperator(op) => StoreError::Unsupported(op),
            TranslateError::InvalidField(field) => {
                StoreError::Unsupported(format!("field {field}"))
            }
        }
    }
}

/// SQLite backend: one table per namespace,
/// `(id TEXT PRIMARY KEY, data TEXT, created_at, updated_at)`, with clauses
/// translated to `json_extract(data, '$.field')` comparisons and unique
/// properties enforced by expression indexes.
pub struct SqliteBackend {
    pool: SqlitePool,
}

impl SqliteBackend {
    /// Open (or create) the database file at `path`.
    pub async fn connect(path: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{path}"))
            .map_err(StoreError::backend)?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .connect_with(options)
            .await
            .map_err(StoreError::backend)?;
        Ok(SqliteBackend { pool })
    }

    /// An in-memory database on a single connection, for tests.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options =
            SqliteConnectOptions::from_str("sqlite::memory:").map_err(StoreError::backend)?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(StoreError::backend)?;
        Ok(SqliteBackend { pool })
    }
}

#[async_trait::async_trait]
impl Backend for SqliteBackend {
    async fn open(
        &self,
        namespace: &str,
        unique_fields: &[String],
    ) -> Result<Arc<dyn Store>, StoreError> {
        let table = valid_table_name(namespace)?;
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS \"{table}\" (\
                id TEXT PRIMARY KEY, \
                data TEXT NOT NULL, \
                created_at TEXT, \
                updated_at TEXT)"
        ))
        .execute(&self.pool)
        .await
        .map_err(StoreError::backend)?;

        for field in unique_fields {
            if !field.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                return Err(StoreError::Unsupported(format!("field {field}")));
            }
            sqlx::query(&format!(
                "CREATE UNIQUE INDEX IF NOT EXISTS \"{table}_{field}_unique\" \
                 ON \"{table}\" (json_extract(data, '$.{field}')) \
                 WHERE json_extract(data, '$.{field}') IS NOT NULL"
            ))
            .execute(&self.pool)
            .await
            .map_err(StoreError::backend)?;
        }

        Ok(Arc::new(SqliteStore {
            pool: self.pool.clone(),
            table,
            unique_fields: unique_fields.to_vec(),
        }))
    }
}

pub struct SqliteStore {
    pool: SqlitePool,
    table: String,
    unique_fields: Vec<String>,
}

impl SqliteStore {
    fn select_sql(&self, query: &Query) -> Result<(String, Vec<Value>), StoreError> {
        let filter = sql::filter_to_sql(&query.filter, Dialect::Sqlite)?;
        let mut stmt = format!("SELECT data FROM \"{}\"", self.table);
        if !filter.expr.is_empty() {
            stmt.push_str(" WHERE ");
            stmt.push_str(&filter.expr);
        }
        stmt.push_str(&sql::options_to_sql(&query.options, Dialect::Sqlite)?);
        Ok((stmt, filter.binds))
    }

    /// Map a driver error, recognizing unique-index violations by the index
    /// naming scheme used in [`SqliteBackend::open`].
    fn map_write_error(&self, err: sqlx::Error) -> StoreError {
        if let sqlx::Error::Database(db) = &err {
            let message = db.message();
            if message.contains("UNIQUE constraint failed") {
                for field in &self.unique_fields {
                    if message.contains(&format!("{}_{}_unique", self.table, field)) {
                        return StoreError::UniqueViolation {
                            field: field.clone(),
                        };
                    }
                }
                return StoreError::UniqueViolation { field: "id".into() };
            }
        }
        StoreError::backend(err)
    }
}

#[async_trait::async_trait]
impl Store for SqliteStore {
    async fn find(&self, query: &Query) -> Result<Vec<Document>, StoreError> {
        let (stmt, binds) = self.select_sql(query)?;
        let rows = push_binds(sqlx::query(&stmt), &binds)
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::backend)?;
        rows.iter()
            .map(|row| {
                let raw: String = row.try_get("data").map_err(StoreError::backend)?;
                parse_blob(&raw)
            })
            .collect()
    }

    async fn find_one(&self, query: &Query) -> Result<Option<Document>, StoreError> {
        let mut limited = query.clone();
        limited.options.limit = Some(1);
        Ok(self.find(&limited).await?.into_iter().next())
    }

    async fn count(&self, query: &Query) -> Result<i64, StoreError> {
        let filter = sql::filter_to_sql(&query.filter, Dialect::Sqlite)?;
        let mut stmt = format!("SELECT COUNT(*) FROM \"{}\"", self.table);
        if !filter.expr.is_empty() {
            stmt.push_str(" WHERE ");
            stmt.push_str(&filter.expr);
        }
        let row = push_binds(sqlx::query(&stmt), &filter.binds)
            .fetch_one(&self.pool)
            .await
            .map_err(StoreError::backend)?;
        row.try_get(0).map_err(StoreError::backend)
    }

    async fn insert(&self, mut doc: Document) -> Result<Document, StoreError> {
        let id = doc.ensure_id();
        doc.stamp_created();
        let created = doc.get("createdAt").cloned().unwrap_or(Value::Null);
        let raw = serde_json::to_string(&doc).map_err(StoreError::backend)?;
        sqlx::query(&format!(
            "INSERT INTO \"{}\" (id, data, created_at, updated_at) VALUES (?, ?, ?, ?)",
            self.table
        ))
        .bind(&id)
        .bind(&raw)
        .bind(created.as_str().unwrap_or_default())
        .bind(created.as_str().unwrap_or_default())
        .execute(&self.pool)
        .await
        .map_err(|e| self.map_write_error(e))?;
        Ok(doc)
    }

    async fn update_one(
        &self,
        query: &Query,
        update: &Update,
    ) -> Result<(Document, Document), StoreError> {
        let filter = sql::filter_to_sql(&query.filter, Dialect::Sqlite)?;
        let mut tx = self.pool.begin().await.map_err(StoreError::backend)?;

        let mut stmt = format!("SELECT data FROM \"{}\"", self.table);
        if !filter.expr.is_empty() {
            stmt.push_str(" WHERE ");
            stmt.push_str(&filter.expr);
        }
        stmt.push_str(" LIMIT 1");
        let row = push_binds(sqlx::query(&stmt), &filter.binds)
            .fetch_optional(&mut *tx)
            .await
            .map_err(StoreError::backend)?
            .ok_or(StoreError::NotFound)?;
        let raw: String = row.try_get("data").map_err(StoreError::backend)?;
        let pre = parse_blob(&raw)?;

        let mut post = pre.clone();
        update.apply(&mut post);
        if let Some(id) = pre.get("id") {
            post.insert("id".into(), id.clone());
        }
        post.stamp_updated();
        let updated = post
            .get("updatedAt")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let raw = serde_json::to_string(&post).map_err(StoreError::backend)?;

        sqlx::query(&format!(
            "UPDATE \"{}\" SET data = ?, updated_at = ? WHERE id = ?",
            self.table
        ))
        .bind(&raw)
        .bind(&updated)
        .bind(pre.id().unwrap_or_default())
        .execute(&mut *tx)
        .await
        .map_err(|e| self.map_write_error(e))?;

        tx.commit().await.map_err(StoreError::backend)?;
        Ok((post, pre))
    }

    async fn remove(&self, query: &Query) -> Result<u64, StoreError> {
        let filter = sql::filter_to_sql(&query.filter, Dialect::Sqlite)?;
        let mut stmt = format!("DELETE FROM \"{}\"", self.table);
        if !filter.expr.is_empty() {
            stmt.push_str(" WHERE ");
            stmt.push_str(&filter.expr);
        }
        let result = push_binds(sqlx::query(&stmt), &filter.binds)
            .execute(&self.pool)
            .await
            .map_err(StoreError::backend)?;
        Ok(result.rows_affected())
    }
}

fn parse_blob(raw: &str) -> Result<Document, StoreError> {
    match serde_json::from_str(raw) {
        Ok(Value::Object(map)) => Ok(Document(map)),
        Ok(_) => Err(StoreError::Backend("stored blob is not an object".into())),
        Err(e) => Err(StoreError::backend(e)),
    }
}

fn valid_table_name(namespace: &str) -> Result<String, StoreError> {
    let ok = !namespace.is_empty()
        && namespace
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if !ok {
        return Err(StoreError::Unsupported(format!(
            "collection name {namespace}"
        )));
    }
    Ok(namespace.to_string())
}

fn push_binds<'q>(
    mut query: sqlx::query::Query<'q, sqlx::Sqlite, SqliteArguments<'q>>,
    binds: &[Value],
) -> sqlx::query::Query<'q, sqlx::Sqlite, SqliteArguments<'q>> {
    for value in binds {
        query = match value {
            Value::Number(n) if n.is_i64() => query.bind(n.as_i64().unwrap_or_default()),
            Value::Number(n) => query.bind(n.as_f64().unwrap_or_default()),
            Value::Bool(b) => query.bind(*b),
            Value::String(s) => query.bind(s.clone()),
            other => query.bind(other.to_string()),
        };
    }
    query
}
