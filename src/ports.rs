//! Host port allocation for app containers

use crate::registry::AppRepository;
use crate::runtime::{ContainerRuntime, RuntimeError};
use std::collections::HashSet;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy)]
pub struct PortAllocator {
    base: u16,
    max: u16,
}

impl PortAllocator {
    pub fn new(base: u16, max: u16) -> Self {
        Self { base, max }
    }

    /// Pick the lowest free port for `app_id`.
    ///
    /// A port is taken if another registry record holds it or any running
    /// container publishes it, tracked by us or not. The app's own stale
    /// record is ignored so a restart can reuse its old port. Callers hold the
    /// global allocation lock until the container is started.
    pub async fn allocate(
        &self,
        app_id: &str,
        registry: &dyn AppRepository,
        runtime: &dyn ContainerRuntime,
    ) -> Result<u16, RuntimeError> {
        let mut taken: HashSet<u16> = registry
            .list_all()
            .into_iter()
            .filter(|r| r.id != app_id)
            .filter_map(|r| r.port)
            .collect();

        match runtime.list_bound_host_ports().await {
            Ok(live) => taken.extend(live),
            Err(RuntimeError::Unavailable(reason)) => {
                return Err(RuntimeError::Unavailable(reason));
            }
            Err(e) => {
                warn!(error = %e, "Could not list published ports, using registry only");
            }
        }

        let port = self.first_free(&taken).ok_or_else(|| {
            RuntimeError::Command(format!(
                "no free host port between {} and {}",
                self.base, self.max
            ))
        })?;

        debug!(app = %app_id, port, "Allocated host port");
        Ok(port)
    }

    /// Lowest port in range not in `taken`
    pub fn first_free(&self, taken: &HashSet<u16>) -> Option<u16> {
        (self.base..=self.max).find(|p| !taken.contains(p))
    }
}
