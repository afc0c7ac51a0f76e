//! Time-bounded schema cache.

use crate::error::Result;
use crate::schema_context::{SchemaContextProvider, SchemaSnapshot};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info};

struct CachedSnapshot {
    fetched_at: Instant,
    snapshot: Arc<SchemaSnapshot>,
}

/// Caches the full snapshot of an inner provider for `ttl`.
///
/// A refresh builds a new `Arc` and swaps it in; runs holding the previous
/// one are unaffected.
pub struct CachedSchemaProvider {
    inner: Arc<dyn SchemaContextProvider>,
    ttl: Duration,
    cached: RwLock<Option<CachedSnapshot>>,
}

impl CachedSchemaProvider {
    pub fn new(inner: Arc<dyn SchemaContextProvider>, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            cached: RwLock::new(None),
        }
    }

    async fn current(&self) -> Result<Arc<SchemaSnapshot>> {
        {
            let guard = self.cached.read().await;
            if let Some(cached) = guard.as_ref() {
                if cached.fetched_at.elapsed() < self.ttl {
                    return Ok(Arc::clone(&cached.snapshot));
                }
            }
        }

        let mut guard = self.cached.write().await;
        // Another run may have refreshed while we waited for the lock.
        if let Some(cached) = guard.as_ref() {
            if cached.fetched_at.elapsed() < self.ttl {
                debug!("Schema cache refreshed by a concurrent lookup");
                return Ok(Arc::clone(&cached.snapshot));
            }
        }

        let snapshot = self.inner.lookup(None).await?;
        info!(tables = snapshot.tables.len(), "Schema cache refreshed");
        *guard = Some(CachedSnapshot {
            fetched_at: Instant::now(),
            snapshot: Arc::clone(&snapshot),
        });
        Ok(snapshot)
    }
}

#[async_trait]
impl SchemaContextProvider for CachedSchemaProvider {
    async fn lookup(&self, table_filter: Option<&[String]>) -> Result<Arc<SchemaSnapshot>> {
        let snapshot = self.current().await?;
        Ok(match table_filter {
            Some(names) => Arc::new(snapshot.restrict(names)),
            None => snapshot,
        })
    }

    async fn invalidate(&self) {
        if self.cached.write().await.take().is_some() {
            info!("Schema cache invalidated");
        }
    }
}
