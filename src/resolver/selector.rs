//! Client-side choice of the next server to talk to.

use std::sync::Arc;

use parking_lot::Mutex;
use rand::Rng;

use super::{ClusterAddress, ClusterResolver};
use crate::error::ResolverError;

/// Client-side "best next server": rotates over the resolver's current
/// list, starting from a random position so clients do not all pick the
/// same first server.
pub struct RoundRobinSelector {
    resolver: Arc<dyn ClusterResolver>,
    position: Mutex<usize>,
}

impl RoundRobinSelector {
    pub fn new(resolver: Arc<dyn ClusterResolver>) -> Self {
        Self::starting_at(resolver, rand::thread_rng().gen())
    }

    pub fn starting_at(resolver: Arc<dyn ClusterResolver>, position: usize) -> Self {
        Self {
            resolver,
            position: Mutex::new(position),
        }
    }

    /// The next endpoint, or `None` if the resolver currently has none.
    pub async fn next(&self) -> Result<Option<ClusterAddress>, ResolverError> {
        let endpoints = self.resolver.resolve().await?;
        if endpoints.is_empty() {
            return Ok(None);
        }
        let mut position = self.position.lock();
        let chosen = endpoints[*position % endpoints.len()].clone();
        *position = position.wrapping_add(1);
        Ok(Some(chosen))
    }
}
