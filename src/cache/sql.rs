//! Relational cache backend
//!
//! One table, `autocert_cache(cache_key, cache_value)`, accessed through the
//! sqlx `Any` driver. The SQL text is chosen from an explicit [`SqlDialect`]
//! tag; the dialects differ only in placeholder and upsert syntax.
//!
//! Values are base64 encoded before they are written so binary ciphertext
//! survives text columns on every database.

use super::{CacheBackend, CacheError};
use async_trait::async_trait;
use base64::Engine;
use sqlx::any::AnyPoolOptions;
use sqlx::AnyPool;
use sqlx::Row;
use std::str::FromStr;
use tracing::debug;

/// SQL flavour spoken by the configured database
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlDialect {
    MySql,
    Postgres,
    Sqlite,
}

impl FromStr for SqlDialect {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mysql" => Ok(SqlDialect::MySql),
            "postgres" | "postgresql" => Ok(SqlDialect::Postgres),
            "sqlite" => Ok(SqlDialect::Sqlite),
            other => Err(CacheError::Config(format!("unsupported sql driver: {:?}", other))),
        }
    }
}

impl SqlDialect {
    fn create_table(&self) -> &'static str {
        match self {
            SqlDialect::MySql => {
                "CREATE TABLE IF NOT EXISTS autocert_cache (
                    cache_key VARCHAR(255) NOT NULL PRIMARY KEY,
                    cache_value MEDIUMTEXT NOT NULL
                )"
            }
            SqlDialect::Postgres | SqlDialect::Sqlite => {
                "CREATE TABLE IF NOT EXISTS autocert_cache (
                    cache_key TEXT NOT NULL PRIMARY KEY,
                    cache_value TEXT NOT NULL
                )"
            }
        }
    }

    fn select(&self) -> &'static str {
        match self {
            SqlDialect::MySql | SqlDialect::Sqlite => {
                "SELECT cache_value FROM autocert_cache WHERE cache_key = ? LIMIT 1"
            }
            SqlDialect::Postgres => "SELECT cache_value FROM autocert_cache WHERE cache_key = $1 LIMIT 1",
        }
    }

    fn upsert(&self) -> &'static str {
        match self {
            SqlDialect::MySql => {
                "INSERT INTO autocert_cache (cache_key, cache_value) VALUES (?, ?)
                 ON DUPLICATE KEY UPDATE cache_value = VALUES(cache_value)"
            }
            SqlDialect::Postgres => {
                "INSERT INTO autocert_cache (cache_key, cache_value) VALUES ($1, $2)
                 ON CONFLICT (cache_key) DO UPDATE SET cache_value = EXCLUDED.cache_value"
            }
            SqlDialect::Sqlite => {
                "INSERT INTO autocert_cache (cache_key, cache_value) VALUES (?, ?)
                 ON CONFLICT(cache_key) DO UPDATE SET cache_value = excluded.cache_value"
            }
        }
    }

    fn delete(&self) -> &'static str {
        match self {
            SqlDialect::MySql | SqlDialect::Sqlite => "DELETE FROM autocert_cache WHERE cache_key = ?",
            SqlDialect::Postgres => "DELETE FROM autocert_cache WHERE cache_key = $1",
        }
    }
}

/// Cache backend storing entries in a relational database
pub struct SqlBackend {
    pool: AnyPool,
    dialect: SqlDialect,
}

impl SqlBackend {
    /// Connect to `dsn`, check the connection and create the table if needed
    pub async fn connect(dialect: SqlDialect, dsn: &str) -> Result<Self, CacheError> {
        sqlx::any::install_default_drivers();

        let in_memory = dialect == SqlDialect::Sqlite && dsn.contains(":memory:");
        let options = if in_memory {
            // Every connection to an in-memory database is a new database
            AnyPoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            AnyPoolOptions::new().max_connections(5)
        };

        let pool = options
            .connect(dsn)
            .await
            .map_err(|e| CacheError::Config(format!("error establishing database connection: {}", e)))?;

        sqlx::query(dialect.create_table())
            .execute(&pool)
            .await
            .map_err(|e| CacheError::Config(format!("error creating cache table: {}", e)))?;

        debug!(?dialect, "SQL certificate cache ready");
        Ok(Self { pool, dialect })
    }
}

#[async_trait]
impl CacheBackend for SqlBackend {
    async fn get(&self, key: &str) -> Result<Vec<u8>, CacheError> {
        let row = sqlx::query(self.dialect.select())
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(query_error)?
            .ok_or(CacheError::NotFound)?;

        let encoded: String = row
            .try_get("cache_value")
            .map_err(|e| CacheError::Corrupted(e.to_string()))?;

        base64::engine::general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .map_err(|e| CacheError::Corrupted(format!("invalid base64 value: {}", e)))
    }

    async fn put(&self, key: &str, data: &[u8]) -> Result<(), CacheError> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(data);
        sqlx::query(self.dialect.upsert())
            .bind(key)
            .bind(encoded)
            .execute(&self.pool)
            .await
            .map_err(query_error)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        sqlx::query(self.dialect.delete())
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(query_error)?;
        Ok(())
    }
}

fn query_error(err: sqlx::Error) -> CacheError {
    match err {
        sqlx::Error::RowNotFound => CacheError::NotFound,
        other => CacheError::Backend(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_backend() -> SqlBackend {
        SqlBackend::connect(SqlDialect::Sqlite, "sqlite::memory:").await.unwrap()
    }

    #[test]
    fn test_dialect_from_str() {
        assert_eq!("mysql".parse::<SqlDialect>().unwrap(), SqlDialect::MySql);
        assert_eq!("postgres".parse::<SqlDialect>().unwrap(), SqlDialect::Postgres);
        assert_eq!("postgresql".parse::<SqlDialect>().unwrap(), SqlDialect::Postgres);
        assert_eq!("sqlite".parse::<SqlDialect>().unwrap(), SqlDialect::Sqlite);
        assert!(matches!("oracle".parse::<SqlDialect>(), Err(CacheError::Config(_))));
    }

    #[test]
    fn test_dialect_placeholders() {
        assert!(SqlDialect::MySql.upsert().contains("ON DUPLICATE KEY UPDATE"));
        assert!(SqlDialect::MySql.select().contains("cache_key = ?"));
        assert!(SqlDialect::Postgres.upsert().contains("ON CONFLICT (cache_key)"));
        assert!(SqlDialect::Postgres.select().contains("cache_key = $1"));
        assert!(SqlDialect::Postgres.delete().contains("cache_key = $1"));
        assert!(SqlDialect::Sqlite.upsert().contains("excluded.cache_value"));
    }

    #[tokio::test]
    async fn test_sqlite_put_get_delete() {
        let backend = memory_backend().await;

        backend.put("example.com", b"\x00\x01binary\xff").await.unwrap();
        assert_eq!(backend.get("example.com").await.unwrap(), b"\x00\x01binary\xff");

        backend.delete("example.com").await.unwrap();
        assert!(backend.get("example.com").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_sqlite_upsert_overwrites() {
        let backend = memory_backend().await;

        backend.put("k", b"first").await.unwrap();
        backend.put("k", b"second").await.unwrap();
        assert_eq!(backend.get("k").await.unwrap(), b"second");
    }

    #[tokio::test]
    async fn test_missing_key_is_not_found() {
        let backend = memory_backend().await;
        assert!(matches!(backend.get("absent").await, Err(CacheError::NotFound)));
        backend.delete("absent").await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_base64_is_corrupted() {
        let backend = memory_backend().await;
        sqlx::query("INSERT INTO autocert_cache (cache_key, cache_value) VALUES (?, ?)")
            .bind("k")
            .bind("not base64 !!")
            .execute(&backend.pool)
            .await
            .unwrap();

        assert!(matches!(backend.get("k").await, Err(CacheError::Corrupted(_))));
    }

    #[tokio::test]
    async fn test_unreachable_database_is_config_error() {
        let result = SqlBackend::connect(SqlDialect::Sqlite, "sqlite:///nonexistent/dir/cache.db").await;
        assert!(matches!(result, Err(CacheError::Config(_))));
    }
}
