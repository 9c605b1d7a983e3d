//! Certificate cache
//!
//! `CertCache` is the persistence layer of the ACME manager. It sits in front
//! of a pluggable [`CacheBackend`] (SQL, Redis or a directory of files),
//! optionally encrypts everything it stores and optionally keeps a plaintext
//! precache in memory.
//!
//! The precache is only ever filled from a successful backend read or after a
//! successful backend write, so it can be dropped at any time without losing
//! data.

mod crypto;
pub mod dir;
pub mod redis;
pub mod sql;

pub use crypto::{EncryptionKey, IV_LENGTH};
pub use dir::DirBackend;
pub use redis::RedisBackend;
pub use sql::{SqlBackend, SqlDialect};

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// Errors returned by the certificate cache and its backends
#[derive(Debug, Error)]
pub enum CacheError {
    /// The key is not present. This is a normal cache miss.
    #[error("cache miss")]
    NotFound,
    /// A stored value could not be decoded or decrypted
    #[error("corrupted cache entry: {0}")]
    Corrupted(String),
    #[error("encryption error: {0}")]
    Crypto(String),
    #[error("cache backend error: {0}")]
    Backend(String),
    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Invalid cache configuration, fatal at startup
    #[error("invalid cache configuration: {0}")]
    Config(String),
}

impl CacheError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, CacheError::NotFound)
    }
}

/// A durable key/value store for cache entries.
///
/// Implementations must report an absent key as [`CacheError::NotFound`] and
/// nothing else. `delete` of an absent key succeeds.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Vec<u8>, CacheError>;
    async fn put(&self, key: &str, data: &[u8]) -> Result<(), CacheError>;
    async fn delete(&self, key: &str) -> Result<(), CacheError>;
}

/// Encrypted, optionally precached cache in front of a backend
pub struct CertCache {
    backend: Arc<dyn CacheBackend>,
    key: Option<EncryptionKey>,
    precache: Option<DashMap<String, Vec<u8>>>,
}

impl std::fmt::Debug for CertCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertCache")
            .field("encrypted", &self.key.is_some())
            .field("precaching", &self.precache.is_some())
            .finish()
    }
}

impl CertCache {
    /// Create a cache over `backend`
    pub fn new(backend: Arc<dyn CacheBackend>, key: Option<EncryptionKey>, use_precaching: bool) -> Self {
        Self {
            backend,
            key,
            precache: use_precaching.then(DashMap::new),
        }
    }

    /// Build a cache from a backend tag and its option bag.
    ///
    /// Recognised backends are `sql` (`driver`, `dsn`), `redis` (`addr`,
    /// optional `password` and `db`) and `dir` (`path`). Every backend also
    /// accepts `encryptionKey` and `usePrecaching`.
    pub async fn from_options(backend: &str, options: &HashMap<String, String>) -> Result<Self, CacheError> {
        let use_precaching = options
            .get("usePrecaching")
            .map(|v| parse_bool(v))
            .unwrap_or(false);
        let key = options
            .get("encryptionKey")
            .and_then(|passphrase| EncryptionKey::from_passphrase(passphrase));

        let driver: Arc<dyn CacheBackend> = match backend {
            "sql" => {
                let dialect: SqlDialect = required(options, "driver")?.parse()?;
                let dsn = required(options, "dsn")?;
                Arc::new(SqlBackend::connect(dialect, dsn).await?)
            }
            "redis" => {
                let addr = required(options, "addr")?;
                let password = options.get("password").map(String::as_str);
                let db = match options.get("db") {
                    Some(db) => db
                        .parse::<i64>()
                        .map_err(|_| CacheError::Config(format!("invalid redis db number: {}", db)))?,
                    None => 0,
                };
                Arc::new(RedisBackend::connect(addr, password, db).await?)
            }
            "dir" => {
                let path = required(options, "path")?;
                Arc::new(DirBackend::new(path).await?)
            }
            other => {
                return Err(CacheError::Config(format!("unknown cache backend: {:?}", other)));
            }
        };

        info!(
            backend,
            encrypted = key.is_some(),
            precaching = use_precaching,
            "Certificate cache initialized"
        );

        Ok(Self::new(driver, key, use_precaching))
    }

    pub fn is_encrypted(&self) -> bool {
        self.key.is_some()
    }

    /// Fetch the plaintext stored under `key`
    pub async fn get(&self, key: &str) -> Result<Vec<u8>, CacheError> {
        if let Some(precache) = &self.precache {
            if let Some(data) = precache.get(key) {
                debug!(key, "Certificate cache precache hit");
                return Ok(data.value().clone());
            }
        }

        let stored = self.backend.get(key).await?;
        let data = match &self.key {
            Some(enc) => enc.decrypt(&stored)?,
            None => stored,
        };

        if let Some(precache) = &self.precache {
            precache.insert(key.to_string(), data.clone());
        }

        Ok(data)
    }

    /// Store `data` under `key`
    pub async fn put(&self, key: &str, data: &[u8]) -> Result<(), CacheError> {
        let stored = match &self.key {
            Some(enc) => enc.encrypt(data)?,
            None => data.to_vec(),
        };

        match self.backend.put(key, &stored).await {
            Ok(()) => {
                if let Some(precache) = &self.precache {
                    precache.insert(key.to_string(), data.to_vec());
                }
                Ok(())
            }
            Err(e) => {
                if let Some(precache) = &self.precache {
                    precache.remove(key);
                }
                Err(e)
            }
        }
    }

    /// Remove `key` from the precache and the backend
    pub async fn delete(&self, key: &str) -> Result<(), CacheError> {
        if let Some(precache) = &self.precache {
            precache.remove(key);
        }
        self.backend.delete(key).await
    }
}

fn required<'a>(options: &'a HashMap<String, String>, name: &str) -> Result<&'a str, CacheError> {
    options
        .get(name)
        .map(String::as_str)
        .ok_or_else(|| CacheError::Config(format!("missing required option {:?}", name)))
}

/// Boolean option parsing; unparsable values read as false
fn parse_bool(value: &str) -> bool {
    matches!(value, "1" | "t" | "T" | "true" | "TRUE" | "True")
}
