//! Cluster endpoint resolution.
//!
//! A [`ClusterResolver`] produces the current list of peer or server
//! endpoints. Resolvers compose: [`ZoneAffineResolver`] reorders another
//! resolver's output, [`ReloadingResolver`] swaps implementations at run
//! time, [`CompositeResolver`] concatenates several. [`watch`] turns any of
//! them into a stream of topology changes.

use std::collections::HashSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::ResolverError;
use crate::notification::{ChangeNotification, ChannelStream, Keyed};

pub mod composite;
pub mod dns;
pub mod file;
pub mod reloading;
pub mod selector;
pub mod zone;

pub use composite::CompositeResolver;
pub use dns::{DnsLookup, DnsResolver, HickoryLookup};
pub use file::FileResolver;
pub use reloading::ReloadingResolver;
pub use selector::RoundRobinSelector;
pub use zone::ZoneAffineResolver;

/// Which of a node's ports a resolver is looking for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortRole {
    Registration,
    #[default]
    Interest,
    Replication,
}

/// The ports a registry node listens on. Read-cluster nodes only serve
/// interest subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ServicePorts {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registration: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interest: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replication: Option<u16>,
}

impl ServicePorts {
    pub fn read(interest: u16) -> Self {
        Self {
            interest: Some(interest),
            ..Self::default()
        }
    }

    pub fn write(registration: u16, interest: u16, replication: u16) -> Self {
        Self {
            registration: Some(registration),
            interest: Some(interest),
            replication: Some(replication),
        }
    }

    pub fn get(&self, role: PortRole) -> Option<u16> {
        match role {
            PortRole::Registration => self.registration,
            PortRole::Interest => self.interest,
            PortRole::Replication => self.replication,
        }
    }

    pub fn with(mut self, role: PortRole, port: u16) -> Self {
        match role {
            PortRole::Registration => self.registration = Some(port),
            PortRole::Interest => self.interest = Some(port),
            PortRole::Replication => self.replication = Some(port),
        }
        self
    }
}

/// A peer or server endpoint. Equality and hashing cover host and ports;
/// the zone is placement metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterAddress {
    pub host: String,
    pub ports: ServicePorts,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone: Option<String>,
}

impl ClusterAddress {
    pub fn new(host: impl Into<String>, ports: ServicePorts) -> Self {
        Self {
            host: host.into(),
            ports,
            zone: None,
        }
    }

    pub fn in_zone(mut self, zone: impl Into<String>) -> Self {
        self.zone = Some(zone.into());
        self
    }

    pub fn port(&self, role: PortRole) -> Option<u16> {
        self.ports.get(role)
    }
}

impl PartialEq for ClusterAddress {
    fn eq(&self, other: &Self) -> bool {
        self.host == other.host && self.ports == other.ports
    }
}

impl Eq for ClusterAddress {}

impl Hash for ClusterAddress {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.host.hash(state);
        self.ports.hash(state);
    }
}

impl Keyed for ClusterAddress {
    type Key = ClusterAddress;

    fn key(&self) -> ClusterAddress {
        self.clone()
    }
}

impl fmt::Display for ClusterAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.host)?;
        let ports = [self.ports.registration, self.ports.interest, self.ports.replication];
        match ports {
            [None, Some(interest), None] => write!(f, ":{interest}")?,
            _ => {
                for port in ports {
                    match port {
                        Some(port) => write!(f, ":{port}")?,
                        None => f.write_str(":-")?,
                    }
                }
            }
        }
        if let Some(zone) = &self.zone {
            write!(f, "@{zone}")?;
        }
        Ok(())
    }
}

/// Parses `host:interest` (read cluster) or
/// `host:registration:interest:replication` (write cluster), optionally
/// followed by `@zone`.
impl FromStr for ClusterAddress {
    type Err = ResolverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ResolverError::InvalidAddress(s.to_owned());
        let (address, zone) = match s.trim().split_once('@') {
            Some((address, zone)) if !zone.is_empty() => (address, Some(zone.to_owned())),
            Some(_) => return Err(invalid()),
            None => (s.trim(), None),
        };

        let mut parts = address.split(':');
        let host = parts.next().filter(|h| !h.is_empty()).ok_or_else(invalid)?;
        let ports: Vec<u16> = parts
            .map(|p| p.parse::<u16>().map_err(|_| invalid()))
            .collect::<Result<_, _>>()?;
        let ports = match ports.as_slice() {
            [interest] => ServicePorts::read(*interest),
            [registration, interest, replication] => {
                ServicePorts::write(*registration, *interest, *replication)
            }
            _ => return Err(invalid()),
        };

        Ok(ClusterAddress {
            host: host.to_owned(),
            ports,
            zone,
        })
    }
}

#[async_trait]
pub trait ClusterResolver: Send + Sync {
    /// The current endpoint list.
    async fn resolve(&self) -> Result<Vec<ClusterAddress>, ResolverError>;
}

/// A fixed endpoint list.
#[derive(Debug, Clone)]
pub struct StaticResolver {
    endpoints: Vec<ClusterAddress>,
}

impl StaticResolver {
    pub fn new(endpoints: Vec<ClusterAddress>) -> Self {
        Self { endpoints }
    }

    pub fn parse<'a>(entries: impl IntoIterator<Item = &'a str>) -> Result<Self, ResolverError> {
        let endpoints = entries
            .into_iter()
            .map(str::parse)
            .collect::<Result<Vec<ClusterAddress>, _>>()?;
        Ok(Self::new(endpoints))
    }
}

#[async_trait]
impl ClusterResolver for StaticResolver {
    async fn resolve(&self) -> Result<Vec<ClusterAddress>, ResolverError> {
        Ok(self.endpoints.clone())
    }
}

/// Notifications that turn `previous` into `next`: an Add for every new
/// endpoint, then a Delete for every endpoint that is gone. Endpoints in
/// both sets produce nothing.
pub fn delta(
    previous: &[ClusterAddress],
    next: &[ClusterAddress],
) -> Vec<ChangeNotification<ClusterAddress>> {
    let before: HashSet<&ClusterAddress> = previous.iter().collect();
    let after: HashSet<&ClusterAddress> = next.iter().collect();

    let mut seen = HashSet::new();
    let added = next
        .iter()
        .filter(|address| !before.contains(address) && seen.insert(*address))
        .map(|address| ChangeNotification::Add(address.clone()));
    let removed = previous
        .iter()
        .filter(|address| !after.contains(address))
        .map(|address| ChangeNotification::Delete(address.clone()));
    added.chain(removed).collect()
}

/// Topology changes: deltas between successive resolutions, each batch
/// closed by a `BufferSentinel`.
pub type TopologyStream = ChannelStream<ChangeNotification<ClusterAddress>>;

/// Re-resolves every `interval` and streams the changes. The first batch
/// holds the initial endpoint set and is sent even when it is empty. A
/// failed resolution keeps the last known set. Dropping the stream stops
/// the background task.
pub fn watch(resolver: Arc<dyn ClusterResolver>, interval: Duration) -> TopologyStream {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut known: Option<Vec<ClusterAddress>> = None;
        loop {
            match resolver.resolve().await {
                Ok(next) => {
                    let changes = delta(known.as_deref().unwrap_or_default(), &next);
                    if known.is_none() || !changes.is_empty() {
                        debug!("topology changed: {} notifications", changes.len());
                        for change in changes {
                            if tx.send(change).is_err() {
                                return;
                            }
                        }
                        if tx.send(ChangeNotification::BufferSentinel).is_err() {
                            return;
                        }
                    }
                    known = Some(next);
                }
                Err(e) => warn!("cluster resolution failed, keeping the last topology: {}", e),
            }

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = tx.closed() => return,
            }
        }
    });
    ChannelStream::new(rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    fn host(name: &str) -> ClusterAddress {
        ClusterAddress::new(name, ServicePorts::read(7001))
    }

    #[test]
    fn delta_emits_only_the_difference() {
        let changes = delta(&[host("h1"), host("h2")], &[host("h2"), host("h3")]);
        assert_eq!(
            changes,
            vec![
                ChangeNotification::Add(host("h3")),
                ChangeNotification::Delete(host("h1")),
            ]
        );
    }

    #[test]
    fn addresses_parse_for_both_cluster_roles() {
        let read: ClusterAddress = "reader:7001".parse().unwrap();
        assert_eq!(read, host("reader"));

        let write: ClusterAddress = "writer:7002:7001:7003@zone-a".parse().unwrap();
        assert_eq!(write.ports, ServicePorts::write(7002, 7001, 7003));
        assert_eq!(write.zone.as_deref(), Some("zone-a"));
        assert_eq!(write.to_string(), "writer:7002:7001:7003@zone-a");

        for bad in ["", ":7001", "host", "host:1:2", "host:x", "host:7001@"] {
            assert!(bad.parse::<ClusterAddress>().is_err(), "{bad} should not parse");
        }
    }

    #[test]
    fn zone_does_not_affect_identity() {
        assert_eq!(host("h1").in_zone("a"), host("h1").in_zone("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn watcher_sends_initial_set_then_changes_only() {
        struct Flip(parking_lot::Mutex<u32>);

        #[async_trait]
        impl ClusterResolver for Flip {
            async fn resolve(&self) -> Result<Vec<ClusterAddress>, ResolverError> {
                let mut calls = self.0.lock();
                *calls += 1;
                Ok(match *calls {
                    1 | 2 => vec![host("h1"), host("h2")],
                    _ => vec![host("h2"), host("h3")],
                })
            }
        }

        let flip = Arc::new(Flip(parking_lot::Mutex::new(0)));
        let mut topology = watch(flip, Duration::from_secs(5));
        let first: Vec<_> = (&mut topology).take(3).collect().await;
        assert_eq!(
            first,
            vec![
                ChangeNotification::Add(host("h1")),
                ChangeNotification::Add(host("h2")),
                ChangeNotification::BufferSentinel,
            ]
        );

        let second: Vec<_> = (&mut topology).take(3).collect().await;
        assert_eq!(
            second,
            vec![
                ChangeNotification::Add(host("h3")),
                ChangeNotification::Delete(host("h1")),
                ChangeNotification::BufferSentinel,
            ]
        );
    }
}
