//! Roster daemon entry point.

use std::sync::Arc;

use futures_util::StreamExt;
use log::{error, info, warn};
use tokio::signal;

use roster::config::Config;
use roster::registry::{run_expiry_sweep, EvictionWorker, Registry};
use roster::resolver::{self, zone::detect_local_ip};
use roster::notification::{collapse, delineated_batches};
use roster::{ChangeNotification, EvictionQuotaKeeper};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let cfg = Config::load()?;
    info!("Starting roster node {} with config: {:?}", cfg.node_name, cfg);

    let local_ip = cfg.local_ip.unwrap_or_else(detect_local_ip);
    info!("Local address {}", local_ip);

    // Registry and self-preservation
    let (registry, evictions) = Registry::new(cfg.registry_config());
    let keeper = EvictionQuotaKeeper::new(
        cfg.registry.eviction_allowed_percentage_drop,
        registry.size_stream(),
    );
    let worker = EvictionWorker::new(Arc::clone(&registry), evictions, &keeper);

    let quota_handle = tokio::spawn(keeper.follow_size());
    let eviction_handle = tokio::spawn(worker.run());
    let sweep_handle = tokio::spawn(run_expiry_sweep(
        Arc::clone(&registry),
        cfg.expiry_sweep_interval(),
    ));

    // Peer topology
    let cluster = cfg.cluster_resolver(local_ip)?;
    let watch_interval = cfg.cluster.reload_interval();
    let topology_handle = tokio::spawn(async move {
        let mut topology = delineated_batches(resolver::watch(cluster, watch_interval)).boxed();
        while let Some(batch) = topology.next().await {
            for change in collapse(batch) {
                match change {
                    ChangeNotification::Add(peer) => info!("Peer {} joined the cluster", peer),
                    ChangeNotification::Delete(peer) => info!("Peer {} left the cluster", peer),
                    _ => {}
                }
            }
        }
        error!("Cluster topology watcher stopped");
    });

    // Bootstrap and replication need a transport, which the embedding
    // application supplies through `Config::bootstrap_service` and
    // `Config::replication_sender`.
    if cfg.bootstrap.enabled {
        warn!(
            "Bootstrap is enabled but no interest transport is linked in; serving an empty registry"
        );
    }

    // Graceful Shutdown
    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Received Ctrl+C, shutting down...");
        }
        Err(err) => {
            error!("Unable to listen for shutdown signal: {}", err);
        }
    }

    registry.shutdown();
    match serde_json::to_string(&registry.diagnostics()) {
        Ok(diagnostics) => info!("Final registry state: {}", diagnostics),
        Err(e) => error!("Unable to render registry diagnostics: {}", e),
    }

    // Abort tasks
    quota_handle.abort();
    eviction_handle.abort();
    sweep_handle.abort();
    topology_handle.abort();

    info!("Shutdown complete.");
    Ok(())
}
