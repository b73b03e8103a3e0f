//! Routing cache: app id to host port
//!
//! Filled by the proxy on a miss and invalidated synchronously by every
//! lifecycle transition that changes an app's port or status. Each fill
//! carries the generation observed before the registry read; a fill whose
//! generation is out of date lost a race with an invalidation and is dropped.

use parking_lot::RwLock;
use std::collections::HashMap;

#[derive(Debug, Default)]
struct Routes {
    generation: u64,
    ports: HashMap<String, u16>,
}

#[derive(Debug, Default)]
pub struct RouteCache {
    inner: RwLock<Routes>,
}

impl RouteCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, app_id: &str) -> Option<u16> {
        self.inner.read().ports.get(app_id).copied()
    }

    /// Generation to pass to [`RouteCache::fill`] after reading the registry
    pub fn generation(&self) -> u64 {
        self.inner.read().generation
    }

    /// Cache a route unless an invalidation happened since `observed`
    pub fn fill(&self, app_id: &str, port: u16, observed: u64) -> bool {
        let mut routes = self.inner.write();
        if routes.generation != observed {
            return false;
        }
        routes.ports.insert(app_id.to_string(), port);
        true
    }

    pub fn invalidate(&self, app_id: &str) {
        let mut routes = self.inner.write();
        routes.generation += 1;
        routes.ports.remove(app_id);
    }

    pub fn len(&self) -> usize {
        self.inner.read().ports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
