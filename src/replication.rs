//! Registry-to-registry replication.
//!
//! Each node pushes the instances registered with it (its LOCAL copies) to
//! every peer in the write cluster. A channel opens with a
//! [`ReplicationHello`] naming the sender; the receiver tags everything that
//! arrives on the channel with a REPLICATED source for that sender and
//! connection generation, so a reconnect never mixes with what the previous
//! connection left behind.

use std::collections::HashMap;
use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::{Stream, StreamExt};
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::error::{ReplicationError, TransportError};
use crate::interest::Interest;
use crate::model::{InstanceRecord, Origin, Source, SourceMatcher};
use crate::notification::ChangeNotification;
use crate::registry::Registry;
use crate::resolver::ClusterAddress;

pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// First message on every replication channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationHello {
    /// The sending node and its connection generation.
    pub source: Source,
    pub registry_size: usize,
}

pub type ReplicationStream = BoxStream<'static, ChangeNotification<InstanceRecord>>;

/// Carries a replication channel to one peer. `open` returns once the
/// channel is gone, either because `updates` ended or the peer went away.
#[async_trait]
pub trait ReplicationTransport: Send + Sync {
    async fn open(
        &self,
        peer: &ClusterAddress,
        hello: ReplicationHello,
        updates: ReplicationStream,
    ) -> Result<(), TransportError>;
}

/// Accepts replication channels opened by peers.
pub struct ReplicationReceiver {
    registry: Arc<Registry>,
    node_name: String,
    generations: Mutex<HashMap<String, u64>>,
}

impl ReplicationReceiver {
    pub fn new(registry: Arc<Registry>, node_name: impl Into<String>) -> Self {
        Self {
            registry,
            node_name: node_name.into(),
            generations: Mutex::new(HashMap::new()),
        }
    }

    /// The source the next channel from `peer` will be tagged with.
    fn next_source(&self, peer: &str) -> Source {
        let mut generations = self.generations.lock();
        let generation = generations.entry(peer.to_owned()).or_insert(0);
        *generation += 1;
        Source::new(Origin::Replicated, peer, *generation)
    }

    /// Serves one channel until it ends. Whatever earlier channels from
    /// the same peer contributed is dropped before the new one is read.
    pub async fn accept<S, E>(
        &self,
        hello: ReplicationHello,
        updates: S,
    ) -> Result<(), ReplicationError>
    where
        S: Stream<Item = Result<ChangeNotification<InstanceRecord>, E>>,
        E: Display,
    {
        let peer = hello.source.name();
        if peer == self.node_name {
            warn!("replication loop detected: {} connected to itself", peer);
            return Err(ReplicationError::Loop(peer.to_owned()));
        }

        let source = self.next_source(peer);
        let flushed = self
            .registry
            .evict_all(&SourceMatcher::PriorGenerations(source.clone()));
        info!(
            "replication channel from {} accepted as {} (peer holds {}, {} stale copies dropped)",
            peer, source, hello.registry_size, flushed
        );

        self.registry.connect(source, updates).await?;
        Ok(())
    }
}

/// Keeps one outbound replication channel per peer in the topology.
pub struct ReplicationSender {
    registry: Arc<Registry>,
    transport: Arc<dyn ReplicationTransport>,
    node_name: String,
    reconnect_delay: Duration,
    generation: Arc<AtomicU64>,
}

impl ReplicationSender {
    pub fn new(
        registry: Arc<Registry>,
        transport: Arc<dyn ReplicationTransport>,
        node_name: impl Into<String>,
        reconnect_delay: Duration,
    ) -> Self {
        Self {
            registry,
            transport,
            node_name: node_name.into(),
            reconnect_delay,
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Follows `topology` until it ends, opening channels to added peers and
    /// closing those of removed ones.
    pub async fn run<T>(self, topology: T)
    where
        T: Stream<Item = ChangeNotification<ClusterAddress>> + Send,
    {
        futures_util::pin_mut!(topology);
        let mut channels: HashMap<ClusterAddress, JoinHandle<()>> = HashMap::new();

        while let Some(change) = topology.next().await {
            match change {
                ChangeNotification::Add(peer) | ChangeNotification::Modify { data: peer, .. } => {
                    if channels.contains_key(&peer) {
                        continue;
                    }
                    info!("replicating to {}", peer);
                    let handle = tokio::spawn(self.channel_loop(peer.clone()));
                    channels.insert(peer, handle);
                }
                ChangeNotification::Delete(peer) => {
                    if let Some(handle) = channels.remove(&peer) {
                        info!("{} left the cluster; closing its replication channel", peer);
                        handle.abort();
                    }
                }
                ChangeNotification::BufferSentinel => {
                    debug!("replicating to {} peers", channels.len());
                }
            }
        }

        for (_, handle) in channels {
            handle.abort();
        }
    }

    fn channel_loop(
        &self,
        peer: ClusterAddress,
    ) -> impl std::future::Future<Output = ()> + Send + 'static {
        let registry = Arc::clone(&self.registry);
        let transport = Arc::clone(&self.transport);
        let generation = Arc::clone(&self.generation);
        let node_name = self.node_name.clone();
        let delay = self.reconnect_delay;

        async move {
            loop {
                let hello = ReplicationHello {
                    source: Source::new(
                        Origin::Replicated,
                        node_name.as_str(),
                        generation.fetch_add(1, Ordering::Relaxed) + 1,
                    ),
                    registry_size: registry.size(),
                };
                let updates = registry
                    .for_interest_from(Interest::FullRegistry, SourceMatcher::Origin(Origin::Local))
                    .map(|n| n.notification)
                    .boxed();

                match transport.open(&peer, hello, updates).await {
                    Ok(()) => info!("replication channel to {} closed", peer),
                    Err(e) => warn!("replication channel to {} failed: {}", peer, e),
                }
                tokio::time::sleep(delay).await;
            }
        }
    }
}
