//! Several resolvers behind one.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use log::warn;

use super::{watch, ClusterAddress, ClusterResolver};
use crate::error::ResolverError;
use crate::notification::ChangeNotification;

/// Concatenates the endpoints of several resolvers. Members that fail are
/// skipped as long as at least one succeeds.
pub struct CompositeResolver {
    members: Vec<Arc<dyn ClusterResolver>>,
}

impl CompositeResolver {
    pub fn new(members: Vec<Arc<dyn ClusterResolver>>) -> Self {
        Self { members }
    }

    /// Merged topology streams of all members, each member watched on its
    /// own.
    pub fn watch_all(
        &self,
        interval: Duration,
    ) -> BoxStream<'static, ChangeNotification<ClusterAddress>> {
        let streams = self
            .members
            .iter()
            .map(|member| watch(Arc::clone(member), interval));
        stream::select_all(streams).boxed()
    }
}

#[async_trait]
impl ClusterResolver for CompositeResolver {
    async fn resolve(&self) -> Result<Vec<ClusterAddress>, ResolverError> {
        let mut endpoints = Vec::new();
        let mut last_error = None;
        let mut succeeded = false;

        for member in &self.members {
            match member.resolve().await {
                Ok(found) => {
                    succeeded = true;
                    endpoints.extend(found);
                }
                Err(e) => {
                    warn!("composite member failed to resolve: {}", e);
                    last_error = Some(e);
                }
            }
        }

        match (succeeded, last_error) {
            (false, Some(e)) => Err(e),
            _ => Ok(endpoints),
        }
    }
}
