use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::bootstrap::{BootstrapService, InterestClient};
use crate::error::ResolverError;
use crate::model::LeaseTerms;
use crate::quota::DEFAULT_ALLOWED_PERCENTAGE_DROP;
use crate::registry::{Registry, RegistryConfig};
use crate::replication::{ReplicationSender, ReplicationTransport};
use crate::resolver::reloading::ResolverFactory;
use crate::resolver::{
    ClusterResolver, DnsResolver, FileResolver, HickoryLookup, PortRole, ReloadingResolver,
    ServicePorts, StaticResolver, ZoneAffineResolver,
};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub node_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zone: Option<String>,
    /// Seeds the zone-affine shuffle. Detected when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_ip: Option<IpAddr>,
    pub registry: RegistrySettings,
    pub bootstrap: BootstrapSettings,
    /// Replication peers.
    pub cluster: ResolverSettings,
    pub replication: ReplicationSettings,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RegistrySettings {
    pub lease_renewal_interval_secs: u64,
    pub lease_duration_secs: u64,
    pub expiry_sweep_interval_secs: u64,
    pub eviction_allowed_percentage_drop: u8,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BootstrapSettings {
    pub enabled: bool,
    pub timeout_ms: u64,
    pub resolver: ResolverSettings,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReplicationSettings {
    pub reconnect_delay_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ResolverSettings {
    pub endpoints: EndpointSource,
    /// Put endpoints in this node's zone first.
    pub zone_affinity: bool,
    /// How often the resolver is rebuilt from configuration and how often
    /// topology watchers re-resolve.
    pub reload_interval_secs: u64,
    pub max_backoff_multiplier: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EndpointSource {
    /// `host:port` or `host:registration:interest:replication`, with an
    /// optional `@zone`.
    Fixed { endpoints: Vec<String> },
    Dns { name: String, ports: ServicePorts },
    File {
        path: PathBuf,
        role: PortRole,
        ports: ServicePorts,
        #[serde(default)]
        always_reload: bool,
    },
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_name: "roster".into(),
            zone: None,
            local_ip: None,
            registry: RegistrySettings {
                lease_renewal_interval_secs: LeaseTerms::default().renewal_interval_secs,
                lease_duration_secs: LeaseTerms::default().duration_secs,
                expiry_sweep_interval_secs: 30,
                eviction_allowed_percentage_drop: DEFAULT_ALLOWED_PERCENTAGE_DROP,
            },
            bootstrap: BootstrapSettings {
                enabled: false,
                timeout_ms: 30_000,
                resolver: ResolverSettings::fixed(Vec::new()),
            },
            cluster: ResolverSettings::fixed(Vec::new()),
            replication: ReplicationSettings {
                reconnect_delay_ms: 30_000,
            },
        }
    }
}

impl ResolverSettings {
    pub fn fixed(endpoints: Vec<String>) -> Self {
        Self {
            endpoints: EndpointSource::Fixed { endpoints },
            zone_affinity: false,
            reload_interval_secs: 30,
            max_backoff_multiplier: 10,
        }
    }

    pub fn reload_interval(&self) -> Duration {
        Duration::from_secs(self.reload_interval_secs.max(1))
    }

    fn build_base(&self) -> Result<Arc<dyn ClusterResolver>, ResolverError> {
        let resolver: Arc<dyn ClusterResolver> = match &self.endpoints {
            EndpointSource::Fixed { endpoints } => {
                Arc::new(StaticResolver::parse(endpoints.iter().map(String::as_str))?)
            }
            EndpointSource::Dns { name, ports } => Arc::new(DnsResolver::new(
                name.as_str(),
                *ports,
                Arc::new(HickoryLookup::from_system_conf()?),
            )),
            EndpointSource::File {
                path,
                role,
                ports,
                always_reload,
            } => Arc::new(
                FileResolver::new(path.clone(), *role, *ports).always_reload(*always_reload),
            ),
        };
        Ok(resolver)
    }
}

impl Config {
    /// Defaults, then `roster.toml`, `roster.json` and `ROSTER_` variables
    /// (nested keys separated by `__`).
    pub fn figment() -> Figment {
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("roster.toml"))
            .merge(Json::file("roster.json"))
            .merge(Env::prefixed("ROSTER_").split("__"))
    }

    pub fn load() -> anyhow::Result<Self> {
        let config: Config = Self::figment()
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

        if config.registry.eviction_allowed_percentage_drop > 100 {
            anyhow::bail!(
                "registry.eviction_allowed_percentage_drop must be at most 100, got {}",
                config.registry.eviction_allowed_percentage_drop
            );
        }
        Ok(config)
    }

    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            lease: LeaseTerms {
                renewal_interval_secs: self.registry.lease_renewal_interval_secs,
                duration_secs: self.registry.lease_duration_secs,
            },
        }
    }

    pub fn expiry_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.registry.expiry_sweep_interval_secs.max(1))
    }

    /// The replication peer resolver.
    pub fn cluster_resolver(
        &self,
        local_ip: IpAddr,
    ) -> Result<Arc<dyn ClusterResolver>, ResolverError> {
        self.resolver(|config| &config.cluster, local_ip)
    }

    pub fn bootstrap_resolver(
        &self,
        local_ip: IpAddr,
    ) -> Result<Arc<dyn ClusterResolver>, ResolverError> {
        self.resolver(|config| &config.bootstrap.resolver, local_ip)
    }

    pub fn bootstrap_service(
        &self,
        client: Arc<dyn InterestClient>,
        local_ip: IpAddr,
    ) -> Result<BootstrapService, ResolverError> {
        Ok(BootstrapService::new(
            self.bootstrap_resolver(local_ip)?,
            client,
            Duration::from_millis(self.bootstrap.timeout_ms),
        ))
    }

    pub fn replication_sender(
        &self,
        registry: Arc<Registry>,
        transport: Arc<dyn ReplicationTransport>,
    ) -> ReplicationSender {
        ReplicationSender::new(
            registry,
            transport,
            self.node_name.as_str(),
            Duration::from_millis(self.replication.reconnect_delay_ms),
        )
    }

    /// Builds the resolver described by the section `select` picks. The
    /// section is re-read from the configuration sources on every reload,
    /// so a node can switch between fixed, DNS and file discovery while
    /// running.
    fn resolver(
        &self,
        select: fn(&Config) -> &ResolverSettings,
        local_ip: IpAddr,
    ) -> Result<Arc<dyn ClusterResolver>, ResolverError> {
        let settings = select(self);
        let factory: ResolverFactory = Box::new(move || {
            let current: Config = Self::figment()
                .extract()
                .map_err(|e| ResolverError::Factory(e.to_string()))?;
            select(&current).build_base()
        });

        let initial = settings.build_base()?;
        let reloading: Arc<dyn ClusterResolver> = Arc::new(ReloadingResolver::with_initial(
            initial,
            factory,
            settings.reload_interval(),
            settings.max_backoff_multiplier,
        ));

        match (&self.zone, settings.zone_affinity) {
            (Some(zone), true) => Ok(Arc::new(ZoneAffineResolver::new(
                reloading,
                zone.as_str(),
                local_ip,
            ))),
            _ => Ok(reloading),
        }
    }
}
