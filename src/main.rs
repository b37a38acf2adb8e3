//! chainkit - publish, discover and join blockchain networks
//!
//! Thin CLI over the discovery server in `chainkit-core`.

use chainkit_core::{Action, Config, DiscoveryServer, PeerInfo, ProjectPaths};
use futures_util::StreamExt;
use std::error::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // Parse CLI arguments and build config
    let (config, action) = Config::from_cli()?;

    // Initialize logging
    init_logging(&config.log_level);

    match action {
        Action::Announce {
            project,
            node_id,
            p2p_port,
        } => announce(&config, ProjectPaths::new(project), node_id, p2p_port).await,
        Action::Join { network_id } => join(&config, &network_id).await,
        Action::Peers { network_id } => peers(&config, &network_id).await,
    }
}

fn init_logging(level: &str) {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(level))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn announce(
    config: &Config,
    project: ProjectPaths,
    node_id: String,
    p2p_port: u16,
) -> Result<(), Box<dyn Error>> {
    let mut server = DiscoveryServer::new(config.discovery(&project));
    server.start().await?;
    for addr in server.listen_addresses()? {
        tracing::info!("Discovery node listening on {}", addr);
    }

    let network_id = server
        .publish(
            &project.manifest_path(),
            &project.genesis_path(),
            &project.image_path(),
        )
        .await?
        .to_string();
    server
        .announce(&network_id, PeerInfo::new(node_id, p2p_port))
        .await?;

    println!("{network_id}");
    tracing::info!("Network is live at {}, press Ctrl-C to stop", network_id);

    tokio::signal::ctrl_c().await?;
    server.stop().await?;
    Ok(())
}

async fn join(config: &Config, network_id: &str) -> Result<(), Box<dyn Error>> {
    let project = config.network_project(network_id)?;
    let mut server = DiscoveryServer::new(config.discovery(&project));
    server.start().await?;

    tracing::info!("Retrieving network information for {}", network_id);
    let result = write_network(&server, network_id, &project).await;
    server.stop().await?;
    result?;

    println!("{}", project.root().display());
    Ok(())
}

async fn write_network(
    server: &DiscoveryServer,
    network_id: &str,
    project: &ProjectPaths,
) -> Result<(), Box<dyn Error>> {
    let mut network = server.join(network_id).await?;

    tokio::fs::create_dir_all(project.config_dir()).await?;

    let mut manifest = tokio::fs::File::create(project.manifest_path()).await?;
    network.write_manifest(&mut manifest).await?;

    let mut genesis = tokio::fs::File::create(project.genesis_path()).await?;
    network.write_genesis(&mut genesis).await?;

    let mut image = tokio::fs::File::create(project.image_path()).await?;
    let size = network.write_image(&mut image).await?;

    tracing::info!(image_size = size, "Wrote network into {:?}", project.root());
    Ok(())
}

async fn peers(config: &Config, network_id: &str) -> Result<(), Box<dyn Error>> {
    let project = config.network_project(network_id)?;
    let mut server = DiscoveryServer::new(config.discovery(&project));
    server.start().await?;

    let mut found = 0;
    let result: Result<(), Box<dyn Error>> = async {
        let mut peers = server.peers(network_id).await?;
        while let Some(peer) = peers.next().await {
            println!("{}", format_peer(&peer));
            found += 1;
        }
        Ok(())
    }
    .await;

    tracing::info!("Found {} peers for {}", found, network_id);
    server.stop().await?;
    result
}

/// `<node id>@<ip>:<port>` per address, as a consensus persistent-peers entry
fn format_peer(peer: &PeerInfo) -> String {
    peer.ips
        .iter()
        .map(|ip| format!("{}@{}:{}", peer.node_id, ip, peer.tendermint_p2p_port))
        .collect::<Vec<_>>()
        .join(",")
}
