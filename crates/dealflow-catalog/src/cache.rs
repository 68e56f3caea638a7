//! Read-through cache of pipelines with their stages
//!
//! Catalog edits are rare and administrative, so reads are served from a
//! moka cache and every edit invalidates the affected pipeline. Each
//! invalidation bumps a generation counter; a load that overlapped one
//! never stays cached.

use dealflow_model::{PipelineId, PipelineWithStages};
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Cache sizing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CatalogConfig {
    /// Maximum cached pipelines
    pub cache_capacity: u64,
    /// Expire entries after this many seconds; `None` keeps them until evicted
    pub cache_ttl_secs: Option<u64>,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            cache_capacity: 256,
            cache_ttl_secs: Some(300),
        }
    }
}

/// Cache keyed by pipeline id
#[derive(Debug, Clone)]
pub struct PipelineCache {
    inner: Cache<PipelineId, Arc<PipelineWithStages>>,
    generation: Arc<AtomicU64>,
}

impl PipelineCache {
    /// Cache sized from config
    #[must_use]
    pub fn new(config: &CatalogConfig) -> Self {
        let mut builder = Cache::builder().max_capacity(config.cache_capacity);
        if let Some(ttl) = config.cache_ttl_secs {
            builder = builder.time_to_live(Duration::from_secs(ttl));
        }
        Self {
            inner: builder.build(),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Cached value
    #[inline]
    pub async fn get(&self, id: &PipelineId) -> Option<Arc<PipelineWithStages>> {
        self.inner.get(id).await
    }

    /// Cached value, or load it and cache the result
    ///
    /// The result is returned either way, but it is only kept if no
    /// invalidation happened while it was loading.
    pub async fn try_get_or_load<E, F, Fut>(
        &self,
        id: PipelineId,
        load: F,
    ) -> Result<Arc<PipelineWithStages>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<PipelineWithStages, E>>,
    {
        if let Some(cached) = self.inner.get(&id).await {
            return Ok(cached);
        }
        let generation = self.generation.load(Ordering::SeqCst);
        let loaded = Arc::new(load().await?);
        if self.generation.load(Ordering::SeqCst) != generation {
            tracing::debug!(pipeline = %id, "Catalog edited during load, not caching");
            return Ok(loaded);
        }
        self.inner.insert(id, loaded.clone()).await;
        // An edit between the check and the insert bumped the generation
        // before its own invalidate, so one of the two removes the entry.
        if self.generation.load(Ordering::SeqCst) != generation {
            self.inner.invalidate(&id).await;
        }
        Ok(loaded)
    }

    /// Drop one pipeline
    pub async fn invalidate(&self, id: &PipelineId) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.inner.invalidate(id).await;
    }
}
