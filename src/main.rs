use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use skein::cluster::{ClusterEvents, Manager, ManagerRegistry};
use skein::{api, cli};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "skein=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Parse args and env vars
    let args = cli::Cli::parse();
    let cluster_address = args.cluster_socket_address()?;
    let http_address = args.http_socket_address()?;

    // Start the cluster node
    let (manager, events) = Manager::new(args.cluster_config()?)?;
    for peer in args.peers.iter() {
        manager.add_peer(peer.name.as_str(), peer.address.as_str());
    }
    let bound = manager.listen_and_serve(&cluster_address.to_string()).await?;
    info!("Starting skein node {} (cluster on {})", manager.name(), bound);
    tokio::spawn(drain_events(events));

    let registry = ManagerRegistry::new();
    registry.add(manager.clone());

    // Build Axum Router
    let api = api::api(registry.clone());

    // Start server
    info!("Starting admin API on {}", http_address);
    axum::Server::bind(&http_address)
        .serve(api.into_make_service())
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("failed to listen for ctrl-c: {}", e);
            }
        })
        .await?;

    info!("Shutting down skein node {}", manager.name());
    registry.remove(manager.name().as_str());
    manager.shutdown().await;
    Ok(())
}

/// Stand-in for the load balancer: report everything the cluster publishes
async fn drain_events(mut events: ClusterEvents) {
    loop {
        tokio::select! {
            Some(packet) = events.from_cluster.recv() => {
                info!("packet {} from {}", packet.data_type(), packet.name());
            }
            Some(request) = events.from_cluster_api.recv() => {
                info!("admin request {} for {}", request.action, request.node);
            }
            Some(name) = events.node_join.recv() => info!("node joined: {}", name),
            Some(name) = events.node_leave.recv() => info!("node left: {}", name),
            Some(quorum) = events.quorum_state.recv() => info!("quorum: {}", quorum),
            // already emitted through tracing by the manager
            Some(_line) = events.log.recv() => {}
            else => break,
        }
    }
}
