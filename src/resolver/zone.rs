//! Zone-affine ordering.
//!
//! Endpoints in this node's zone come first. Each partition is shuffled
//! with a generator seeded from this host's IP address, so one host always
//! produces the same order while different hosts spread their load.

use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::sync::Arc;

use async_trait::async_trait;
use log::debug;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use sha2::{Digest, Sha256};

use super::{ClusterAddress, ClusterResolver};
use crate::error::ResolverError;

pub struct ZoneAffineResolver {
    delegate: Arc<dyn ClusterResolver>,
    zone: String,
    seed: u64,
}

impl ZoneAffineResolver {
    pub fn new(
        delegate: Arc<dyn ClusterResolver>,
        zone: impl Into<String>,
        local_ip: IpAddr,
    ) -> Self {
        Self {
            delegate,
            zone: zone.into(),
            seed: shuffle_seed(local_ip),
        }
    }

    /// Splits `endpoints` into this zone and the rest, shuffles both and
    /// returns them in that order.
    pub fn reorder(&self, endpoints: Vec<ClusterAddress>) -> Vec<ClusterAddress> {
        let (mut mine, mut others): (Vec<_>, Vec<_>) = endpoints
            .into_iter()
            .partition(|endpoint| endpoint.zone.as_deref() == Some(self.zone.as_str()));

        let mut rng = StdRng::seed_from_u64(self.seed);
        mine.shuffle(&mut rng);
        others.shuffle(&mut rng);
        mine.extend(others);
        mine
    }
}

#[async_trait]
impl ClusterResolver for ZoneAffineResolver {
    async fn resolve(&self) -> Result<Vec<ClusterAddress>, ResolverError> {
        let endpoints = self.delegate.resolve().await?;
        Ok(self.reorder(endpoints))
    }
}

/// First eight bytes of the SHA-256 of the address.
pub fn shuffle_seed(ip: IpAddr) -> u64 {
    let digest = Sha256::digest(ip.to_string().as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    debug!("shuffle seed for {} is {}", ip, hex::encode(prefix));
    u64::from_be_bytes(prefix)
}

/// The address this host uses for outbound traffic. Nothing is sent: a
/// connected UDP socket only picks a route. Falls back to loopback.
pub fn detect_local_ip() -> IpAddr {
    let routed = UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| {
            socket.connect("8.8.8.8:80")?;
            socket.local_addr()
        })
        .map(|addr| addr.ip());
    match routed {
        Ok(ip) if !ip.is_unspecified() => ip,
        _ => IpAddr::V4(Ipv4Addr::LOCALHOST),
    }
}
