//! Connection pool for database-style backends
//!
//! DocumentDB, Valkey and Memcached connections are opened by a `connect`
//! tool and referenced afterwards by a generated UUID. The pool tracks last
//! use so a background task can close connections nobody touches.

use crate::core::service::ServiceError;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Connection entry with metadata
struct PoolEntry<C> {
    connection: Arc<Mutex<C>>,
    /// Human readable target, e.g. `host:port`
    target: String,
    created: Instant,
    last_used: Instant,
}

/// Summary of a pooled connection
#[derive(Debug, Clone, serde::Serialize)]
pub struct ConnectionInfo {
    pub connection_id: String,
    pub target: String,
    pub age_secs: u64,
    pub idle_secs: u64,
}

/// Pool of live connections keyed by UUID
pub struct ConnectionPool<C> {
    entries: Arc<Mutex<HashMap<String, PoolEntry<C>>>>,
    max_connections: usize,
}

impl<C> Clone for ConnectionPool<C> {
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
            max_connections: self.max_connections,
        }
    }
}

impl<C: Send + 'static> ConnectionPool<C> {
    pub fn new(max_connections: usize) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            max_connections,
        }
    }

    /// Register a connection and return its id
    pub async fn insert(&self, target: impl Into<String>, connection: C) -> Result<String, ServiceError> {
        let mut entries = self.entries.lock().await;
        if entries.len() >= self.max_connections {
            return Err(ServiceError::Connection(format!(
                "connection limit of {} reached; disconnect an existing connection first",
                self.max_connections
            )));
        }

        let id = uuid::Uuid::new_v4().to_string();
        let now = Instant::now();
        let target = target.into();
        debug!("🔌 Pooled connection {} -> {}", id, target);
        entries.insert(
            id.clone(),
            PoolEntry {
                connection: Arc::new(Mutex::new(connection)),
                target,
                created: now,
                last_used: now,
            },
        );
        Ok(id)
    }

    /// Look up a connection, refreshing its last-use time
    pub async fn get(&self, id: &str) -> Result<Arc<Mutex<C>>, ServiceError> {
        let mut entries = self.entries.lock().await;
        let entry = entries.get_mut(id).ok_or_else(|| {
            ServiceError::NotFound(format!(
                "connection '{}' does not exist or was closed after being idle; call connect again",
                id
            ))
        })?;
        entry.last_used = Instant::now();
        Ok(entry.connection.clone())
    }

    /// Remove a connection; returns whether it existed
    pub async fn remove(&self, id: &str) -> bool {
        let removed = self.entries.lock().await.remove(id).is_some();
        if removed {
            debug!("❌ Removed connection {}", id);
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Describe all open connections
    pub async fn list(&self) -> Vec<ConnectionInfo> {
        let entries = self.entries.lock().await;
        let now = Instant::now();
        let mut infos: Vec<ConnectionInfo> = entries
            .iter()
            .map(|(id, entry)| ConnectionInfo {
                connection_id: id.clone(),
                target: entry.target.clone(),
                age_secs: now.duration_since(entry.created).as_secs(),
                idle_secs: now.duration_since(entry.last_used).as_secs(),
            })
            .collect();
        infos.sort_by(|a, b| a.connection_id.cmp(&b.connection_id));
        infos
    }

    /// Drop connections unused for longer than `max_idle`
    pub async fn evict_idle(&self, max_idle: Duration) -> Vec<String> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        let stale: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.last_used) >= max_idle)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            entries.remove(id);
        }
        stale
    }

    /// Spawn a task that periodically evicts idle connections
    ///
    /// The task stops when `shutdown` is cancelled.
    pub fn spawn_reaper(&self, max_idle: Duration, shutdown: CancellationToken) {
        let pool = self.clone();
        let period = (max_idle / 4).max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let evicted = pool.evict_idle(max_idle).await;
                        if !evicted.is_empty() {
                            info!("🧹 Closed {} idle connection(s)", evicted.len());
                        }
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_insert_and_get() {
        let pool = ConnectionPool::new(4);
        let id = pool.insert("localhost:6379", 42u32).await.unwrap();
        assert_eq!(uuid::Uuid::parse_str(&id).unwrap().get_version_num(), 4);
        let conn = pool.get(&id).await.unwrap();
        assert_eq!(*conn.lock().await, 42);
        assert_eq!(pool.len().await, 1);
    }

    #[tokio::test]
    async fn test_limit_enforced() {
        let pool = ConnectionPool::new(1);
        pool.insert("a", ()).await.unwrap();
        let err = pool.insert("b", ()).await.unwrap_err();
        assert!(matches!(err, ServiceError::Connection(_)));
    }

    #[tokio::test]
    async fn test_remove_and_unknown_id() {
        let pool = ConnectionPool::new(2);
        let id = pool.insert("a", ()).await.unwrap();
        assert!(pool.remove(&id).await);
        assert!(!pool.remove(&id).await);
        assert!(matches!(pool.get(&id).await, Err(ServiceError::NotFound(_))));
        assert!(pool.is_empty().await);
    }

    #[tokio::test]
    async fn test_evict_idle() {
        let pool = ConnectionPool::new(2);
        let id = pool.insert("a", ()).await.unwrap();
        assert!(pool.evict_idle(Duration::from_secs(3600)).await.is_empty());
        let evicted = pool.evict_idle(Duration::ZERO).await;
        assert_eq!(evicted, vec![id]);
        assert!(pool.is_empty().await);
    }

    #[tokio::test]
    async fn test_list_reports_target() {
        let pool = ConnectionPool::new(2);
        let id = pool.insert("db.example:27017", ()).await.unwrap();
        let infos = pool.list().await;
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].connection_id, id);
        assert_eq!(infos[0].target, "db.example:27017");
    }
}
