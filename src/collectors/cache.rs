//! Per-request collector instance cache.
//!
//! Instances are memoized on the raw request query string, so
//! `?target=ORCL` and `?target=ORCL&tablerows=true` resolve to two distinct
//! instances while identical query strings share one. The cache is a bounded
//! LRU: every distinct request shape costs one registry plus its metric
//! families, and the query string is caller-controlled, so unbounded growth
//! would be an easy memory exhaustion vector.

use anyhow::Result;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::collectors::instance::{CollectorInstance, ExporterSettings, ScrapeFlags};
use crate::config::Target;

pub const DEFAULT_CACHE_CAPACITY: usize = 64;

pub struct CollectorCache {
    /// Full configured target registry; instances borrow filtered subsets.
    targets: Vec<Target>,
    settings: ExporterSettings,
    capacity: usize,
    inner: Mutex<CacheInner>,
}

#[derive(Default)]
struct CacheInner {
    map: HashMap<String, Arc<CollectorInstance>>,
    /// Keys from least to most recently resolved.
    order: VecDeque<String>,
}

impl CollectorCache {
    #[must_use]
    pub fn new(targets: Vec<Target>, settings: ExporterSettings, capacity: usize) -> Self {
        Self {
            targets,
            settings,
            capacity: capacity.max(1),
            inner: Mutex::new(CacheInner::default()),
        }
    }

    #[must_use]
    pub fn target_count(&self) -> usize {
        self.targets.len()
    }

    #[must_use]
    pub fn targets(&self) -> &[Target] {
        &self.targets
    }

    /// Resolve or build the instance for one request shape.
    ///
    /// `key` is the raw request query string; `target_filter` and `flags`
    /// are the parsed view of the same request. A hit reuses the existing
    /// instance and its registry unmodified.
    ///
    /// # Errors
    ///
    /// Returns an error if a cache miss fails to build its instance.
    pub async fn resolve(
        &self,
        key: &str,
        target_filter: Option<&str>,
        flags: ScrapeFlags,
    ) -> Result<Arc<CollectorInstance>> {
        let mut inner = self.inner.lock().await;

        if let Some(instance) = inner.map.get(key).cloned() {
            debug!(key, "reusing cached collector instance");
            inner.touch(key);
            return Ok(instance);
        }

        let selected = self.select_targets(target_filter);
        let flags = self.settings.base_flags.union(flags);
        let instance = CollectorInstance::new(selected, flags, &self.settings)?;

        info!(
            key,
            targets = instance.target_count(),
            "built collector instance"
        );

        if inner.map.len() >= self.capacity {
            inner.evict_oldest();
        }

        inner.map.insert(key.to_string(), Arc::clone(&instance));
        inner.order.push_back(key.to_string());

        Ok(instance)
    }

    /// Number of cached instances, for tests and the health endpoint.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.map.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.map.is_empty()
    }

    /// Exact display-name match; absent or empty filter selects all targets,
    /// in declaration order.
    fn select_targets(&self, filter: Option<&str>) -> Vec<Target> {
        match filter {
            None | Some("") => self.targets.clone(),
            Some(name) => self
                .targets
                .iter()
                .filter(|t| t.name == name)
                .cloned()
                .collect(),
        }
    }
}

impl CacheInner {
    fn touch(&mut self, key: &str) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            if let Some(k) = self.order.remove(pos) {
                self.order.push_back(k);
            }
        }
    }

    fn evict_oldest(&mut self) {
        if let Some(oldest) = self.order.pop_front() {
            debug!(key = %oldest, "evicting least recently used collector instance");
            self.map.remove(&oldest);
        }
    }
}
