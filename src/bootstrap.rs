//! Seeding a freshly started node from its peers.
//!
//! Candidates come from a [`ClusterResolver`] and are tried in order. From
//! each one the service subscribes to the full registry and reads until the
//! peer signals the end of its snapshot. The first peer that delivers any
//! data wins; its snapshot is written into the local registry under a
//! bootstrap source, where the copies live under a lease until the node's
//! own replication takes over.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use log::{info, warn};

use crate::error::{BootstrapError, TransportError};
use crate::interest::Interest;
use crate::model::{InstanceRecord, Source};
use crate::notification::{evaluate, ChangeNotification, StreamNotification};
use crate::registry::Registry;
use crate::resolver::{ClusterAddress, ClusterResolver};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

pub type PeerStream =
    BoxStream<'static, Result<StreamNotification<InstanceRecord>, TransportError>>;

/// Opens interest subscriptions on other registry nodes.
#[async_trait]
pub trait InterestClient: Send + Sync {
    async fn subscribe(
        &self,
        peer: &ClusterAddress,
        interest: &Interest,
    ) -> Result<PeerStream, TransportError>;
}

pub struct BootstrapService {
    resolver: Arc<dyn ClusterResolver>,
    client: Arc<dyn InterestClient>,
    timeout: Duration,
}

impl BootstrapService {
    pub fn new(
        resolver: Arc<dyn ClusterResolver>,
        client: Arc<dyn InterestClient>,
        timeout: Duration,
    ) -> Self {
        Self {
            resolver,
            client,
            timeout,
        }
    }

    /// Loads a peer's snapshot into `registry` under `source`. Returns the
    /// number of instances written.
    pub async fn load_into_registry(
        &self,
        registry: &Registry,
        source: Source,
    ) -> Result<usize, BootstrapError> {
        info!("bootstrapping registry as {}", source);
        let loaded = tokio::time::timeout(self.timeout, self.load(registry, &source))
            .await
            .map_err(|_| BootstrapError::Timeout(self.timeout))??;
        info!("bootstrap loaded {} instances", loaded);
        Ok(loaded)
    }

    async fn load(&self, registry: &Registry, source: &Source) -> Result<usize, BootstrapError> {
        let candidates = self.resolver.resolve().await?;
        if candidates.is_empty() {
            return Err(BootstrapError::NoPeers);
        }

        for peer in &candidates {
            match self.fetch(peer).await {
                Ok(snapshot) if snapshot.is_empty() => {
                    info!("bootstrap peer {} has no data, trying the next one", peer);
                }
                Ok(snapshot) => return Ok(apply(registry, source, snapshot)),
                Err(e) => warn!("bootstrap from {} failed: {}", peer, e),
            }
        }
        Err(BootstrapError::Exhausted {
            attempted: candidates.len(),
        })
    }

    /// Data notifications up to the peer's end-of-snapshot marker.
    async fn fetch(
        &self,
        peer: &ClusterAddress,
    ) -> Result<Vec<ChangeNotification<InstanceRecord>>, BootstrapError> {
        let mut stream = self.client.subscribe(peer, &Interest::FullRegistry).await?;
        let mut snapshot = Vec::new();
        while let Some(next) = stream.next().await {
            let notification = next?;
            if notification.is_live_sentinel() {
                return Ok(snapshot);
            }
            if notification.notification.is_data() {
                snapshot.push(notification.notification);
            }
        }
        Err(BootstrapError::Incomplete { peer: peer.to_string() })
    }
}

/// Writes the instances the snapshot leaves standing.
fn apply(
    registry: &Registry,
    source: &Source,
    snapshot: Vec<ChangeNotification<InstanceRecord>>,
) -> usize {
    let records = evaluate(snapshot);
    let written = records.len();
    for record in records {
        registry.register(record, source.clone());
    }
    written
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Origin;
    use crate::registry::RegistryConfig;
    use crate::resolver::{ServicePorts, StaticResolver};
    use futures_util::stream;

    struct Silent;

    #[async_trait]
    impl InterestClient for Silent {
        async fn subscribe(
            &self,
            _: &ClusterAddress,
            _: &Interest,
        ) -> Result<PeerStream, TransportError> {
            Ok(stream::pending().boxed())
        }
    }

    struct Truncated;

    #[async_trait]
    impl InterestClient for Truncated {
        async fn subscribe(
            &self,
            _: &ClusterAddress,
            _: &Interest,
        ) -> Result<PeerStream, TransportError> {
            let record = InstanceRecord::builder("a").app("web").build();
            let add = StreamNotification::snapshot(None, ChangeNotification::Add(record));
            Ok(stream::iter(vec![Ok(add)]).boxed())
        }
    }

    /// A snapshot that churns before its end marker.
    struct Churning;

    #[async_trait]
    impl InterestClient for Churning {
        async fn subscribe(
            &self,
            _: &ClusterAddress,
            _: &Interest,
        ) -> Result<PeerStream, TransportError> {
            let record = |id: &str| InstanceRecord::builder(id).app("web").build();
            let a = record("a");
            let updates = vec![
                ChangeNotification::Add(a.clone()),
                ChangeNotification::Add(record("b")),
                ChangeNotification::Modify {
                    data: a.to_builder().app("billing").build(),
                    deltas: Vec::new(),
                },
                ChangeNotification::Delete(record("b")),
                ChangeNotification::Add(record("c")),
            ];
            let items = updates
                .into_iter()
                .map(|n| Ok(StreamNotification::snapshot(None, n)))
                .chain([Ok(StreamNotification::live_sentinel())]);
            Ok(stream::iter(items).boxed())
        }
    }

    fn one_peer() -> Arc<dyn ClusterResolver> {
        Arc::new(StaticResolver::new(vec![ClusterAddress::new("peer", ServicePorts::read(7001))]))
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_peer_times_out() {
        let (registry, _queue) = Registry::new(RegistryConfig::default());
        let service = BootstrapService::new(one_peer(), Arc::new(Silent), Duration::from_secs(5));
        let result = service
            .load_into_registry(&registry, Source::new(Origin::Bootstrap, "boot", 1))
            .await;
        assert!(matches!(result, Err(BootstrapError::Timeout(_))));
    }

    #[tokio::test]
    async fn stream_ending_before_the_marker_counts_as_failure() {
        let (registry, _queue) = Registry::new(RegistryConfig::default());
        let service = BootstrapService::new(one_peer(), Arc::new(Truncated), DEFAULT_TIMEOUT);
        let result = service
            .load_into_registry(&registry, Source::new(Origin::Bootstrap, "boot", 1))
            .await;
        assert!(matches!(result, Err(BootstrapError::Exhausted { attempted: 1 })));
        assert_eq!(registry.size(), 0);
    }

    #[tokio::test]
    async fn only_instances_standing_at_the_marker_are_loaded() {
        let (registry, _queue) = Registry::new(RegistryConfig::default());
        let service = BootstrapService::new(one_peer(), Arc::new(Churning), DEFAULT_TIMEOUT);
        let loaded = service
            .load_into_registry(&registry, Source::new(Origin::Bootstrap, "boot", 1))
            .await
            .unwrap();

        assert_eq!(loaded, 2);
        assert!(registry.get("b").is_none());
        assert_eq!(registry.get("a").map(|r| r.app().to_owned()).as_deref(), Some("billing"));
    }

    #[tokio::test]
    async fn no_candidates_is_reported() {
        let (registry, _queue) = Registry::new(RegistryConfig::default());
        let nobody = Arc::new(StaticResolver::new(Vec::new()));
        let service = BootstrapService::new(nobody, Arc::new(Silent), DEFAULT_TIMEOUT);
        let result = service
            .load_into_registry(&registry, Source::new(Origin::Bootstrap, "boot", 1))
            .await;
        assert!(matches!(result, Err(BootstrapError::NoPeers)));
    }
}
