//! Key persistence

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::ApiKey;
use crate::error::{GatewayError, Result};

/// Get/put/list access to key records and their counters
#[async_trait]
pub trait KeyStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<ApiKey>>;

    /// Insert or replace a record
    async fn put(&self, key: &ApiKey) -> Result<()>;

    /// Every key, or only those of one provider, oldest first
    async fn list(&self, provider_id: Option<&str>) -> Result<Vec<ApiKey>>;
}

// ── In-memory ──

/// Process-local store, used in tests and when no database is configured
#[derive(Debug, Default)]
pub struct MemoryKeyStore {
    keys: RwLock<HashMap<String, ApiKey>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyStore for MemoryKeyStore {
    async fn get(&self, id: &str) -> Result<Option<ApiKey>> {
        Ok(self.keys.read().await.get(id).cloned())
    }

    async fn put(&self, key: &ApiKey) -> Result<()> {
        self.keys.write().await.insert(key.id.clone(), key.clone());
        Ok(())
    }

    async fn list(&self, provider_id: Option<&str>) -> Result<Vec<ApiKey>> {
        let keys = self.keys.read().await;
        let mut out: Vec<ApiKey> = keys
            .values()
            .filter(|k| provider_id.is_none_or(|p| k.provider_id == p))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(out)
    }
}

// ── SQLite ──

/// SQLite-backed store (thread-safe via Arc<Mutex>)
pub struct SqliteKeyStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteKeyStore {
    /// Open or create the database and its schema
    pub fn open<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let conn = Connection::open(path.as_ref()).context("Failed to open key database")?;
        info!("Opened key database at {:?}", path.as_ref());
        Self::init(conn)
    }

    pub fn in_memory() -> anyhow::Result<Self> {
        Self::init(Connection::open_in_memory().context("Failed to open in-memory database")?)
    }

    fn init(conn: Connection) -> anyhow::Result<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS api_keys (
                id TEXT PRIMARY KEY,
                provider_id TEXT NOT NULL,
                secret TEXT NOT NULL,
                prefix TEXT NOT NULL,
                active INTEGER NOT NULL,
                degraded_until TEXT,
                window_requests INTEGER NOT NULL,
                window_tokens INTEGER NOT NULL,
                window_start TEXT NOT NULL,
                total_requests INTEGER NOT NULL,
                total_tokens INTEGER NOT NULL,
                last_used_at TEXT,
                created_at TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_api_keys_provider ON api_keys(provider_id)",
            [],
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> anyhow::Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap_or_else(|poisoned| {
                warn!("Database mutex was poisoned, recovering");
                poisoned.into_inner()
            });
            f(&conn)
        })
        .await
        .context("spawn_blocking task panicked")
        .and_then(|r| r)
        .map_err(|e| GatewayError::Storage(format!("{:#}", e)))
    }
}

const COLUMNS: &str = "id, provider_id, secret, prefix, active, degraded_until, window_requests,
     window_tokens, window_start, total_requests, total_tokens, last_used_at, created_at";

fn ts(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_ts(column: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    s.parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(column, Type::Text, Box::new(e)))
}

fn parse_opt_ts(column: usize, s: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    s.map(|s| parse_ts(column, &s)).transpose()
}

fn to_db(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

fn from_db(n: i64) -> u64 {
    u64::try_from(n).unwrap_or(0)
}

fn row_to_key(row: &Row<'_>) -> rusqlite::Result<ApiKey> {
    Ok(ApiKey {
        id: row.get(0)?,
        provider_id: row.get(1)?,
        secret: row.get(2)?,
        prefix: row.get(3)?,
        active: row.get::<_, i64>(4)? != 0,
        degraded_until: parse_opt_ts(5, row.get(5)?)?,
        window_requests: from_db(row.get(6)?),
        window_tokens: from_db(row.get(7)?),
        window_start: parse_ts(8, &row.get::<_, String>(8)?)?,
        total_requests: from_db(row.get(9)?),
        total_tokens: from_db(row.get(10)?),
        last_used_at: parse_opt_ts(11, row.get(11)?)?,
        created_at: parse_ts(12, &row.get::<_, String>(12)?)?,
    })
}

#[async_trait]
impl KeyStore for SqliteKeyStore {
    async fn get(&self, id: &str) -> Result<Option<ApiKey>> {
        let id = id.to_owned();
        self.with_conn(move |conn| {
            let key = conn
                .query_row(
                    &format!("SELECT {} FROM api_keys WHERE id = ?1", COLUMNS),
                    params![&id],
                    row_to_key,
                )
                .optional()?;
            Ok(key)
        })
        .await
    }

    async fn put(&self, key: &ApiKey) -> Result<()> {
        let key = key.clone();
        self.with_conn(move |conn| {
            conn.execute(
                &format!(
                    "INSERT OR REPLACE INTO api_keys ({})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                    COLUMNS
                ),
                params![
                    &key.id,
                    &key.provider_id,
                    &key.secret,
                    &key.prefix,
                    key.active as i64,
                    key.degraded_until.as_ref().map(ts),
                    to_db(key.window_requests),
                    to_db(key.window_tokens),
                    ts(&key.window_start),
                    to_db(key.total_requests),
                    to_db(key.total_tokens),
                    key.last_used_at.as_ref().map(ts),
                    ts(&key.created_at),
                ],
            )?;
            debug!("Stored key {} ({})", key.prefix, key.id);
            Ok(())
        })
        .await
    }

    async fn list(&self, provider_id: Option<&str>) -> Result<Vec<ApiKey>> {
        let provider_id = provider_id.map(str::to_owned);
        self.with_conn(move |conn| {
            let keys = match provider_id {
                Some(provider) => {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {} FROM api_keys WHERE provider_id = ?1 ORDER BY created_at, id",
                        COLUMNS
                    ))?;
                    stmt.query_map(params![&provider], row_to_key)?
                        .collect::<rusqlite::Result<Vec<_>>>()?
                }
                None => {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {} FROM api_keys ORDER BY created_at, id",
                        COLUMNS
                    ))?;
                    stmt.query_map([], row_to_key)?
                        .collect::<rusqlite::Result<Vec<_>>>()?
                }
            };
            Ok(keys)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn exercise(store: &dyn KeyStore) {
        let mut a = ApiKey::new("openai", "sk-aaaaaaaaaaaa1111");
        let b = ApiKey::new("anthropic", "sk-ant-bbbbbbbb2222");
        store.put(&a).await.unwrap();
        store.put(&b).await.unwrap();

        let fetched = store.get(&a.id).await.unwrap().unwrap();
        assert_eq!(fetched, a);
        assert!(store.get("missing").await.unwrap().is_none());

        a.window_requests = 7;
        a.degraded_until = Some(Utc::now());
        store.put(&a).await.unwrap();
        assert_eq!(store.get(&a.id).await.unwrap().unwrap(), a);

        assert_eq!(store.list(None).await.unwrap().len(), 2);
        let openai = store.list(Some("openai")).await.unwrap();
        assert_eq!(openai.len(), 1);
        assert_eq!(openai[0].id, a.id);
    }

    #[tokio::test]
    async fn test_memory_store() {
        exercise(&MemoryKeyStore::new()).await;
    }

    #[tokio::test]
    async fn test_sqlite_store() {
        exercise(&SqliteKeyStore::in_memory().unwrap()).await;
    }

    #[tokio::test]
    async fn test_sqlite_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.db");
        let key = ApiKey::new("openai", "sk-persisted-key-9999");
        {
            let store = SqliteKeyStore::open(&path).unwrap();
            store.put(&key).await.unwrap();
        }
        let store = SqliteKeyStore::open(&path).unwrap();
        assert_eq!(store.get(&key.id).await.unwrap().unwrap(), key);
    }

    #[tokio::test]
    async fn test_corrupt_timestamp_is_storage_error() {
        let store = SqliteKeyStore::in_memory().unwrap();
        let key = ApiKey::new("openai", "sk-corrupted-ts-0001");
        store.put(&key).await.unwrap();
        store
            .conn
            .lock()
            .unwrap()
            .execute(
                "UPDATE api_keys SET window_start = 'yesterday-ish' WHERE id = ?1",
                params![&key.id],
            )
            .unwrap();

        let err = store.get(&key.id).await.unwrap_err();
        assert!(matches!(err, GatewayError::Storage(_)));
        assert!(store.list(Some("openai")).await.is_err());
    }
}
