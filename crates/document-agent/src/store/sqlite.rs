//! SQLite-backed store adapter. Documents live as JSON text in a single `kv`
//! table and are addressed with SQLite JSON1 paths.

use std::path::Path;
use std::sync::Arc;

use anyhow::bail;
use async_trait::async_trait;
use lazy_static::lazy_static;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use regex::Regex;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::schema::{FieldKind, IndexDefinition, IndexField, SCHEMA_SQL};
use super::{vector, SearchHit, SearchQuery, SearchReply, StoreAdapter, ROOT};
use crate::error::AgentError;
use crate::utils::now_millis;

lazy_static! {
    static ref PATH_REGEX: Regex = Regex::new(r"^\$(\.[A-Za-z_][A-Za-z0-9_]*|\[-?\d+\])*$").unwrap();
    static ref NEGATIVE_INDEX_REGEX: Regex = Regex::new(r"\[-(\d+)\]").unwrap();
}

const LIVE: &str = "(expires_at IS NULL OR expires_at > ?)";

pub struct SqliteStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl SqliteStore {
    pub fn open(db_path: &Path) -> anyhow::Result<Self> {
        info!("Opening document store at: {}", db_path.display());
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let manager = SqliteConnectionManager::file(db_path).with_init(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA busy_timeout = 5000;",
            )
        });
        let pool = Pool::builder()
            .max_size(10)
            .build(manager)
            .map_err(|e| anyhow::anyhow!("Failed to create connection pool: {}", e))?;

        {
            let conn = pool.get()?;
            conn.execute_batch(SCHEMA_SQL)?;
            let purged = purge_expired(&conn)?;
            if purged > 0 {
                debug!("Purged {} expired keys on open", purged);
            }
        }

        info!("Document store initialized successfully");
        Ok(Self { pool: Arc::new(pool) })
    }

    async fn run<T, F>(&self, f: F) -> anyhow::Result<T>
    where
        F: FnOnce(&mut Connection) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = Arc::clone(&self.pool);
        tokio::task::spawn_blocking(move || {
            let mut conn = pool
                .get()
                .map_err(|e| anyhow::anyhow!("Failed to get connection from pool: {}", e))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| anyhow::anyhow!("Store task failed: {}", e))?
    }
}

/// Validates a `$.a.b[0]` style path and converts negative indexes to SQLite's `[#-n]`.
fn sql_path(path: &str) -> anyhow::Result<String> {
    if !PATH_REGEX.is_match(path) {
        bail!("Unsupported JSON path: {}", path);
    }
    Ok(NEGATIVE_INDEX_REGEX.replace_all(path, "[#-$1]").into_owned())
}

/// `$.a.b` → `/a/b`, for `serde_json::Value::pointer`.
fn json_pointer(path: &str) -> String {
    path.trim_start_matches('$').replace('.', "/")
}

fn purge_key(conn: &Connection, key: &str, now: i64) -> rusqlite::Result<usize> {
    conn.execute(
        "DELETE FROM kv WHERE key = ?1 AND expires_at IS NOT NULL AND expires_at <= ?2",
        params![key, now],
    )
}

fn upsert(conn: &Connection, key: &str, value: &Value) -> anyhow::Result<()> {
    purge_key(conn, key, now_millis())?;
    conn.execute(
        "INSERT INTO kv (key, value) VALUES (?1, json(?2))
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value.to_string()],
    )?;
    Ok(())
}

/// Removes expired keys; reads already hide them.
fn purge_expired(conn: &Connection) -> rusqlite::Result<usize> {
    conn.execute(
        "DELETE FROM kv WHERE expires_at IS NOT NULL AND expires_at <= ?1",
        params![now_millis()],
    )
}

fn load_definition(conn: &Connection, name: &str) -> anyhow::Result<Option<IndexDefinition>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT definition FROM search_indexes WHERE name = ?1",
            params![name],
            |row| row.get(0),
        )
        .optional()?;
    match raw {
        Some(text) => Ok(Some(serde_json::from_str(&text)?)),
        None => Ok(None),
    }
}

fn resolve_field<'a>(
    definition: &'a IndexDefinition,
    alias: &str,
    accepts: impl Fn(&FieldKind) -> bool,
) -> anyhow::Result<&'a IndexField> {
    match definition.lookup(alias) {
        Some(field) if accepts(&field.kind) => Ok(field),
        Some(field) => bail!("Field {} of {} cannot be queried as {:?}", alias, definition.name, field.kind),
        None => bail!("Unknown field {} in index {}", alias, definition.name),
    }
}

/// Select expression for the document column. Projected fields are bound as
/// parameters starting at the current end of `args`.
fn projection(
    definition: &IndexDefinition,
    query: &SearchQuery,
    args: &mut Vec<SqlValue>,
) -> anyhow::Result<String> {
    if query.return_fields.is_empty() {
        return Ok("value".to_string());
    }
    let mut aliases: Vec<&str> = query.return_fields.iter().map(String::as_str).collect();
    if let Some(knn) = &query.knn {
        if !aliases.contains(&knn.field.as_str()) {
            aliases.push(&knn.field);
        }
    }

    let mut pairs = Vec::with_capacity(aliases.len());
    for alias in aliases {
        let field = resolve_field(definition, alias, |_| true)?;
        args.push(SqlValue::Text(field.alias.clone()));
        args.push(SqlValue::Text(field.path.clone()));
        pairs.push(format!("?{}, json(value -> ?{})", args.len() - 1, args.len()));
    }
    Ok(format!("json_object({})", pairs.join(", ")))
}

fn as_vector(value: Option<&Value>) -> Vec<f32> {
    value
        .and_then(Value::as_array)
        .and_then(|items| items.iter().map(|v| v.as_f64().map(|f| f as f32)).collect())
        .unwrap_or_default()
}

fn run_search(conn: &Connection, index: &str, query: &SearchQuery) -> anyhow::Result<SearchReply> {
    let definition = load_definition(conn, index)?.ok_or_else(|| AgentError::not_found("index", index))?;

    let mut args: Vec<SqlValue> = vec![
        SqlValue::Text(definition.prefix.clone()),
        SqlValue::Integer(now_millis()),
    ];
    let projection = projection(&definition, query, &mut args)?;
    let mut sql = format!(
        "SELECT key, {} FROM kv WHERE substr(key, 1, length(?1)) = ?1
         AND (expires_at IS NULL OR expires_at > ?2)",
        projection
    );

    for tag in &query.tags {
        let field = resolve_field(&definition, &tag.field, |k| matches!(k, FieldKind::Tag))?;
        if tag.any_of.is_empty() {
            return Ok(SearchReply::default());
        }
        args.push(SqlValue::Text(field.path.clone()));
        let path_slot = args.len();
        let mut slots = Vec::with_capacity(tag.any_of.len());
        for value in &tag.any_of {
            args.push(SqlValue::Text(value.clone()));
            slots.push(format!("?{}", args.len()));
        }
        sql.push_str(&format!(
            " AND CAST(json_extract(value, ?{}) AS TEXT) IN ({})",
            path_slot,
            slots.join(", ")
        ));
    }

    if let Some((alias, needle)) = &query.text {
        let field = resolve_field(&definition, alias, |k| matches!(k, FieldKind::Text | FieldKind::Tag))?;
        args.push(SqlValue::Text(field.path.clone()));
        args.push(SqlValue::Text(needle.clone()));
        sql.push_str(&format!(
            " AND instr(lower(CAST(json_extract(value, ?{}) AS TEXT)), lower(?{})) > 0",
            args.len() - 1,
            args.len()
        ));
    }

    match (&query.knn, &query.sort_by) {
        (None, Some(sort)) => {
            let field = resolve_field(&definition, &sort.field, |k| !matches!(k, FieldKind::Vector { .. }))?;
            args.push(SqlValue::Text(field.path.clone()));
            sql.push_str(&format!(
                " ORDER BY json_extract(value, ?{}) {}, key",
                args.len(),
                if sort.descending { "DESC" } else { "ASC" }
            ));
        }
        _ => sql.push_str(" ORDER BY key"),
    }

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(args.iter()), |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut documents: Vec<(String, Value)> = Vec::with_capacity(rows.len());
    for (key, text) in rows {
        match serde_json::from_str(&text) {
            Ok(value) => documents.push((key, value)),
            Err(e) => warn!("Skipping unreadable document {}: {}", key, e),
        }
    }

    let mut hits: Vec<SearchHit> = match &query.knn {
        Some(knn) => {
            let field = resolve_field(&definition, &knn.field, |k| matches!(k, FieldKind::Vector { .. }))?;
            if let FieldKind::Vector { dimensions } = field.kind {
                if knn.vector.len() != dimensions {
                    bail!(
                        "Index {} expects {}-dimensional vectors, query has {}",
                        definition.name,
                        dimensions,
                        knn.vector.len()
                    );
                }
            }
            let pointer = json_pointer(&field.path);
            let vectors: Vec<Vec<f32>> = documents.iter().map(|(_, v)| as_vector(v.pointer(&pointer))).collect();
            vector::rank_nearest(&knn.vector, &vectors, knn.k)
                .into_iter()
                .map(|(i, distance)| SearchHit {
                    key: documents[i].0.clone(),
                    value: documents[i].1.clone(),
                    distance: Some(distance),
                })
                .collect()
        }
        None => documents
            .into_iter()
            .map(|(key, value)| SearchHit { key, value, distance: None })
            .collect(),
    };

    if let Some(knn) = &query.knn {
        if !query.return_fields.is_empty() && !query.return_fields.contains(&knn.field) {
            for hit in hits.iter_mut() {
                if let Some(object) = hit.value.as_object_mut() {
                    object.remove(&knn.field);
                }
            }
        }
    }

    let total = hits.len();
    let documents = hits.into_iter().skip(query.offset).take(query.limit).collect();
    Ok(SearchReply { total, documents })
}

#[async_trait]
impl StoreAdapter for SqliteStore {
    async fn create_index(&self, definition: &IndexDefinition) -> anyhow::Result<()> {
        for field in &definition.fields {
            sql_path(&field.path)?;
        }
        let definition = definition.clone();
        self.run(move |conn| {
            let created = conn.execute(
                "INSERT OR IGNORE INTO search_indexes (name, prefix, definition, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    definition.name,
                    definition.prefix,
                    serde_json::to_string(&definition)?,
                    chrono::Utc::now().to_rfc3339(),
                ],
            )?;
            if created > 0 {
                debug!("Created index {} over prefix {}", definition.name, definition.prefix);
            }
            Ok(())
        })
        .await
    }

    async fn index_exists(&self, name: &str) -> anyhow::Result<bool> {
        let name = name.to_string();
        self.run(move |conn| {
            let found: Option<i64> = conn
                .query_row("SELECT 1 FROM search_indexes WHERE name = ?1", params![name], |row| row.get(0))
                .optional()?;
            Ok(found.is_some())
        })
        .await
    }

    async fn drop_index(&self, name: &str, delete_documents: bool) -> anyhow::Result<()> {
        let name = name.to_string();
        self.run(move |conn| {
            let tx = conn.transaction()?;
            if let Some(definition) = load_definition(&tx, &name)? {
                tx.execute("DELETE FROM search_indexes WHERE name = ?1", params![name])?;
                if delete_documents {
                    let removed = tx.execute(
                        "DELETE FROM kv WHERE substr(key, 1, length(?1)) = ?1",
                        params![definition.prefix],
                    )?;
                    debug!("Dropped index {} with {} documents", name, removed);
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn get(&self, key: &str, path: &str) -> anyhow::Result<Option<Value>> {
        let path = sql_path(path)?;
        let key = key.to_string();
        self.run(move |conn| {
            let raw: Option<Option<String>> = conn
                .query_row(
                    &format!("SELECT value -> ?2 FROM kv WHERE key = ?1 AND {}", LIVE),
                    params![key, path, now_millis()],
                    |row| row.get(0),
                )
                .optional()?;
            match raw.flatten() {
                Some(text) => Ok(Some(serde_json::from_str(&text)?)),
                None => Ok(None),
            }
        })
        .await
    }

    async fn set(&self, key: &str, path: &str, value: Value) -> anyhow::Result<()> {
        let path = sql_path(path)?;
        let key = key.to_string();
        self.run(move |conn| {
            if path == ROOT {
                return upsert(conn, &key, &value);
            }
            let changed = conn.execute(
                &format!("UPDATE kv SET value = json_set(value, ?2, json(?3)) WHERE key = ?1 AND {}", LIVE),
                params![key, path, value.to_string(), now_millis()],
            )?;
            if changed == 0 {
                return Err(AgentError::not_found("key", key).into());
            }
            Ok(())
        })
        .await
    }

    async fn mset(&self, entries: Vec<(String, Value)>) -> anyhow::Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        self.run(move |conn| {
            let tx = conn.transaction()?;
            for (key, value) in &entries {
                upsert(&tx, key, value)?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn append(&self, key: &str, path: &str, value: Value) -> anyhow::Result<usize> {
        let path = sql_path(path)?;
        let key = key.to_string();
        self.run(move |conn| {
            let now = now_millis();
            let tx = conn.transaction()?;
            let changed = tx.execute(
                &format!("UPDATE kv SET value = json_insert(value, ?2, json(?3)) WHERE key = ?1 AND {}", LIVE),
                params![key, format!("{}[#]", path), value.to_string(), now],
            )?;
            if changed == 0 {
                return Err(AgentError::not_found("key", key).into());
            }
            let length: Option<i64> = tx.query_row(
                "SELECT json_array_length(value, ?2) FROM kv WHERE key = ?1",
                params![key, path],
                |row| row.get(0),
            )?;
            tx.commit()?;
            Ok(length.unwrap_or(0) as usize)
        })
        .await
    }

    async fn array_len(&self, key: &str, path: &str) -> anyhow::Result<Option<usize>> {
        let path = sql_path(path)?;
        let key = key.to_string();
        self.run(move |conn| {
            let length: Option<Option<i64>> = conn
                .query_row(
                    &format!("SELECT json_array_length(value, ?2) FROM kv WHERE key = ?1 AND {}", LIVE),
                    params![key, path, now_millis()],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(length.flatten().map(|n| n as usize))
        })
        .await
    }

    async fn exists(&self, key: &str) -> anyhow::Result<bool> {
        let key = key.to_string();
        self.run(move |conn| {
            let found: Option<i64> = conn
                .query_row(
                    &format!("SELECT 1 FROM kv WHERE key = ?1 AND {}", LIVE),
                    params![key, now_millis()],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(found.is_some())
        })
        .await
    }

    async fn del(&self, keys: &[String]) -> anyhow::Result<usize> {
        if keys.is_empty() {
            return Ok(0);
        }
        let keys = keys.to_vec();
        self.run(move |conn| {
            let tx = conn.transaction()?;
            let mut removed = 0;
            {
                let mut stmt = tx.prepare("DELETE FROM kv WHERE key = ?1")?;
                for key in &keys {
                    removed += stmt.execute(params![key])?;
                }
            }
            tx.commit()?;
            Ok(removed)
        })
        .await
    }

    async fn expire(&self, key: &str, seconds: i64) -> anyhow::Result<bool> {
        let key = key.to_string();
        self.run(move |conn| {
            let now = now_millis();
            let changed = if seconds <= 0 {
                conn.execute(&format!("DELETE FROM kv WHERE key = ?1 AND {}", LIVE), params![key, now])?
            } else {
                conn.execute(
                    &format!("UPDATE kv SET expires_at = ?2 WHERE key = ?1 AND {}", LIVE),
                    params![key, now + seconds * 1000, now],
                )?
            };
            Ok(changed > 0)
        })
        .await
    }

    async fn keys(&self, prefix: &str) -> anyhow::Result<Vec<String>> {
        let prefix = prefix.to_string();
        self.run(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT key FROM kv WHERE substr(key, 1, length(?1)) = ?1 AND {} ORDER BY key",
                LIVE
            ))?;
            let keys = stmt
                .query_map(params![prefix, now_millis()], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            Ok(keys)
        })
        .await
    }

    async fn search(&self, index: &str, query: &SearchQuery) -> anyhow::Result<SearchReply> {
        let index = index.to_string();
        let query = query.clone();
        self.run(move |conn| run_search(conn, &index, &query)).await
    }
}
