use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};

use roster::bootstrap::{BootstrapService, InterestClient, PeerStream};
use roster::error::TransportError;
use roster::interest::Interest;
use roster::model::{InstanceRecord, Origin, Source};
use roster::resolver::{ClusterAddress, ServicePorts, StaticResolver};
use roster::{ChangeNotification, Registry, RegistryConfig, StreamNotification};

/// Serves canned subscriptions; peers without an entry are unreachable.
struct CannedPeers {
    answers: HashMap<String, Vec<StreamNotification<InstanceRecord>>>,
}

#[async_trait]
impl InterestClient for CannedPeers {
    async fn subscribe(
        &self,
        peer: &ClusterAddress,
        interest: &Interest,
    ) -> Result<PeerStream, TransportError> {
        assert_eq!(*interest, Interest::FullRegistry);
        let answer = self.answers.get(&peer.host).cloned().ok_or_else(|| TransportError::Connect {
            peer: peer.to_string(),
            message: "connection refused".into(),
        })?;
        // a live peer keeps its subscription open after the snapshot
        Ok(stream::iter(answer.into_iter().map(Ok)).chain(stream::pending()).boxed())
    }
}

fn peer(host: &str) -> ClusterAddress {
    ClusterAddress::new(host, ServicePorts::read(7001))
}

#[tokio::test]
async fn falls_back_until_a_peer_has_data() {
    let snapshot: Vec<_> = (0..5)
        .map(|i| {
            let record = InstanceRecord::builder(format!("i-{i}")).app("web").build();
            StreamNotification::snapshot(None, ChangeNotification::Add(record))
        })
        .chain([StreamNotification::live_sentinel()])
        .collect();

    let mut answers = HashMap::new();
    answers.insert("empty".to_owned(), vec![StreamNotification::live_sentinel()]);
    answers.insert("full".to_owned(), snapshot);
    let client = Arc::new(CannedPeers { answers });
    let resolver = Arc::new(StaticResolver::new(vec![peer("empty"), peer("down"), peer("full")]));

    let (registry, _queue) = Registry::new(RegistryConfig::default());
    let service = BootstrapService::new(resolver, client, Duration::from_secs(5));
    let source = Source::new(Origin::Bootstrap, "bootstrap", 1);

    let loaded = service.load_into_registry(&registry, source.clone()).await.unwrap();
    assert_eq!(loaded, 5);
    assert_eq!(registry.size(), 5);
    assert!(registry.diagnostics().iter().all(|d| d.sources == vec![source.clone()]));
}

#[tokio::test]
async fn all_empty_peers_leave_the_registry_empty() {
    let mut answers = HashMap::new();
    answers.insert("a".to_owned(), vec![StreamNotification::live_sentinel()]);
    answers.insert("b".to_owned(), vec![StreamNotification::live_sentinel()]);
    let client = Arc::new(CannedPeers { answers });
    let resolver = Arc::new(StaticResolver::new(vec![peer("a"), peer("b")]));

    let (registry, _queue) = Registry::new(RegistryConfig::default());
    let service = BootstrapService::new(resolver, client, Duration::from_secs(5));
    let err = service
        .load_into_registry(&registry, Source::new(Origin::Bootstrap, "bootstrap", 1))
        .await
        .unwrap_err();

    assert!(err.to_string().contains("none of 2"));
    assert_eq!(registry.size(), 0);
}
