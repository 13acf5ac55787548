//! DNS-backed endpoint discovery.

use std::sync::Arc;

use async_trait::async_trait;
use hickory_resolver::TokioAsyncResolver;
use log::{debug, warn};
use parking_lot::Mutex;

use super::{ClusterAddress, ClusterResolver, ServicePorts};
use crate::error::ResolverError;

/// The two lookups endpoint discovery needs.
#[async_trait]
pub trait DnsLookup: Send + Sync {
    /// A and AAAA addresses of `name`, following CNAME chains.
    async fn addresses(&self, name: &str) -> Result<Vec<String>, ResolverError>;

    /// Host names listed in the TXT records of `name`.
    async fn txt_hosts(&self, name: &str) -> Result<Vec<String>, ResolverError>;
}

pub struct HickoryLookup {
    resolver: TokioAsyncResolver,
}

impl HickoryLookup {
    pub fn from_system_conf() -> Result<Self, ResolverError> {
        let resolver =
            TokioAsyncResolver::tokio_from_system_conf().map_err(|e| ResolverError::Lookup {
                name: "resolv.conf".into(),
                message: e.to_string(),
            })?;
        Ok(Self { resolver })
    }
}

#[async_trait]
impl DnsLookup for HickoryLookup {
    async fn addresses(&self, name: &str) -> Result<Vec<String>, ResolverError> {
        let lookup = self
            .resolver
            .lookup_ip(name)
            .await
            .map_err(|e| ResolverError::Lookup {
                name: name.to_owned(),
                message: e.to_string(),
            })?;
        Ok(lookup.iter().map(|ip| ip.to_string()).collect())
    }

    async fn txt_hosts(&self, name: &str) -> Result<Vec<String>, ResolverError> {
        let lookup = self
            .resolver
            .txt_lookup(name)
            .await
            .map_err(|e| ResolverError::Lookup {
                name: name.to_owned(),
                message: e.to_string(),
            })?;
        let mut hosts = Vec::new();
        for txt in lookup.iter() {
            for chunk in txt.txt_data() {
                let text = String::from_utf8_lossy(chunk);
                hosts.extend(text.split_whitespace().map(str::to_owned));
            }
        }
        Ok(hosts)
    }
}

/// Resolves a domain name to endpoints that all share the same ports.
///
/// Address records win; if there are none, the TXT records are read as a
/// list of host names. Once a resolution has succeeded, later failures
/// return the last good result.
pub struct DnsResolver {
    name: String,
    ports: ServicePorts,
    lookup: Arc<dyn DnsLookup>,
    last: Mutex<Option<Vec<ClusterAddress>>>,
}

impl DnsResolver {
    pub fn new(name: impl Into<String>, ports: ServicePorts, lookup: Arc<dyn DnsLookup>) -> Self {
        Self {
            name: name.into(),
            ports,
            lookup,
            last: Mutex::new(None),
        }
    }

    async fn lookup_hosts(&self) -> Result<Vec<String>, ResolverError> {
        match self.lookup.addresses(&self.name).await {
            Ok(hosts) if !hosts.is_empty() => return Ok(hosts),
            Ok(_) => debug!("{} has no address records, trying TXT", self.name),
            Err(e) => debug!("address lookup of {} failed ({}), trying TXT", self.name, e),
        }
        self.lookup.txt_hosts(&self.name).await
    }
}

#[async_trait]
impl ClusterResolver for DnsResolver {
    async fn resolve(&self) -> Result<Vec<ClusterAddress>, ResolverError> {
        if self.name.eq_ignore_ascii_case("localhost") {
            return Ok(vec![ClusterAddress::new("localhost", self.ports)]);
        }

        let resolved = self.lookup_hosts().await.and_then(|mut hosts| {
            if hosts.is_empty() {
                return Err(ResolverError::Empty(self.name.clone()));
            }
            hosts.sort();
            hosts.dedup();
            Ok(hosts
                .into_iter()
                .map(|host| ClusterAddress::new(host, self.ports))
                .collect::<Vec<_>>())
        });

        let mut last = self.last.lock();
        match resolved {
            Ok(endpoints) => {
                *last = Some(endpoints.clone());
                Ok(endpoints)
            }
            Err(e) => match last.as_ref() {
                Some(previous) => {
                    warn!(
                        "resolving {} failed, keeping {} known endpoints: {}",
                        self.name,
                        previous.len(),
                        e
                    );
                    Ok(previous.clone())
                }
                None => Err(e),
            },
        }
    }
}
