//! Hot-swappable resolvers.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::time::Instant;

use super::{ClusterAddress, ClusterResolver};
use crate::error::ResolverError;

pub type ResolverFactory =
    Box<dyn Fn() -> Result<Arc<dyn ClusterResolver>, ResolverError> + Send + Sync>;

/// Rebuilds its delegate from a factory every `interval`.
///
/// A replacement only takes over if it resolves to a different endpoint
/// set; otherwise it is discarded. If the factory or the replacement
/// fails, the current delegate stays and the interval doubles, up to
/// `max_multiplier` times the base.
pub struct ReloadingResolver {
    factory: ResolverFactory,
    interval: Duration,
    max_multiplier: u32,
    state: Mutex<ReloadState>,
}

struct ReloadState {
    active: Arc<dyn ClusterResolver>,
    endpoints: Option<HashSet<ClusterAddress>>,
    multiplier: u32,
    next_reload: Instant,
}

impl ReloadingResolver {
    /// Builds the first delegate with `factory` itself.
    pub fn new(
        factory: ResolverFactory,
        interval: Duration,
        max_multiplier: u32,
    ) -> Result<Self, ResolverError> {
        let active = factory()?;
        Ok(Self::with_initial(active, factory, interval, max_multiplier))
    }

    pub fn with_initial(
        active: Arc<dyn ClusterResolver>,
        factory: ResolverFactory,
        interval: Duration,
        max_multiplier: u32,
    ) -> Self {
        Self {
            factory,
            interval,
            max_multiplier: max_multiplier.max(1),
            state: Mutex::new(ReloadState {
                active,
                endpoints: None,
                multiplier: 1,
                next_reload: Instant::now() + interval,
            }),
        }
    }

    /// Current back-off multiplier of the reload interval.
    pub fn multiplier(&self) -> u32 {
        self.state.lock().multiplier
    }

    async fn reload(&self) {
        let candidate = match (self.factory)() {
            Ok(candidate) => candidate,
            Err(e) => return self.back_off(e),
        };
        let endpoints: HashSet<ClusterAddress> = match candidate.resolve().await {
            Ok(endpoints) => endpoints.into_iter().collect(),
            Err(e) => return self.back_off(e),
        };

        let mut state = self.state.lock();
        state.multiplier = 1;
        state.next_reload = Instant::now() + self.interval;
        if state.endpoints.as_ref() == Some(&endpoints) {
            debug!(
                "reloaded resolver yields the same {} endpoints; keeping the current one",
                endpoints.len()
            );
            return;
        }
        info!("switching to reloaded resolver with {} endpoints", endpoints.len());
        state.active = candidate;
        state.endpoints = Some(endpoints);
    }

    fn back_off(&self, error: ResolverError) {
        let mut state = self.state.lock();
        state.multiplier = (state.multiplier * 2).min(self.max_multiplier);
        state.next_reload = Instant::now() + self.interval * state.multiplier;
        warn!(
            "resolver reload failed, retrying in {:?}: {}",
            self.interval * state.multiplier,
            error
        );
    }
}

#[async_trait]
impl ClusterResolver for ReloadingResolver {
    async fn resolve(&self) -> Result<Vec<ClusterAddress>, ResolverError> {
        let due = Instant::now() >= self.state.lock().next_reload;
        if due {
            self.reload().await;
        }

        let active = Arc::clone(&self.state.lock().active);
        let endpoints = active.resolve().await?;

        let mut state = self.state.lock();
        if Arc::ptr_eq(&state.active, &active) {
            state.endpoints = Some(endpoints.iter().cloned().collect());
        }
        Ok(endpoints)
    }
}
