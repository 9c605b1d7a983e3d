//! Redis cache backend
//!
//! Plain GET/SET/DEL on the logical key, no expiry.

use super::{CacheBackend, CacheError};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, ConnectionAddr, ConnectionInfo, RedisConnectionInfo};
use tracing::debug;

const DEFAULT_PORT: u16 = 6379;

/// Cache backend storing entries in Redis
pub struct RedisBackend {
    conn: ConnectionManager,
}

impl RedisBackend {
    /// Connect to the Redis server at `addr` (`host:port`)
    pub async fn connect(addr: &str, password: Option<&str>, db: i64) -> Result<Self, CacheError> {
        let info = connection_info(addr, password, db)?;
        let client = redis::Client::open(info)
            .map_err(|e| CacheError::Config(format!("invalid redis address {:?}: {}", addr, e)))?;

        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| CacheError::Config(format!("error contacting redis at {}: {}", addr, e)))?;

        debug!(addr, db, "Redis certificate cache ready");
        Ok(Self { conn })
    }
}

#[async_trait]
impl CacheBackend for RedisBackend {
    async fn get(&self, key: &str) -> Result<Vec<u8>, CacheError> {
        let mut conn = self.conn.clone();
        let value: Option<Vec<u8>> = conn.get(key).await.map_err(backend_error)?;
        value.ok_or(CacheError::NotFound)
    }

    async fn put(&self, key: &str, data: &[u8]) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(key, data).await.map_err(backend_error)
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key).await.map_err(backend_error)
    }
}

fn backend_error(err: redis::RedisError) -> CacheError {
    CacheError::Backend(err.to_string())
}

fn connection_info(addr: &str, password: Option<&str>, db: i64) -> Result<ConnectionInfo, CacheError> {
    let (host, port) = match addr.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .map_err(|_| CacheError::Config(format!("invalid redis port in {:?}", addr)))?;
            (host, port)
        }
        None => (addr, DEFAULT_PORT),
    };
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(CacheError::Config(format!("invalid redis address {:?}", addr)));
    }

    Ok(ConnectionInfo {
        addr: ConnectionAddr::Tcp(host.to_string(), port),
        redis: RedisConnectionInfo {
            db,
            password: password.filter(|p| !p.is_empty()).map(str::to_string),
            ..Default::default()
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_info() {
        let info = connection_info("127.0.0.1:6379", None, 0).unwrap();
        assert_eq!(info.addr, ConnectionAddr::Tcp("127.0.0.1".to_string(), 6379));
        assert_eq!(info.redis.db, 0);
        assert_eq!(info.redis.password, None);

        let info = connection_info("cache", Some(""), 2).unwrap();
        assert_eq!(info.addr, ConnectionAddr::Tcp("cache".to_string(), DEFAULT_PORT));
        assert_eq!(info.redis.db, 2);
        assert_eq!(info.redis.password, None);

        let info = connection_info("[::1]:6380", None, 0).unwrap();
        assert_eq!(info.addr, ConnectionAddr::Tcp("::1".to_string(), 6380));
    }

    #[test]
    fn test_password_is_passed_verbatim() {
        let info = connection_info("cache:6379", Some("p@ss:w/rd"), 1).unwrap();
        assert_eq!(info.redis.password.as_deref(), Some("p@ss:w/rd"));
        assert!(redis::Client::open(info).is_ok());
    }

    #[test]
    fn test_invalid_address() {
        assert!(matches!(connection_info("cache:port", None, 0), Err(CacheError::Config(_))));
        assert!(matches!(connection_info(":6379", None, 0), Err(CacheError::Config(_))));
    }
}
