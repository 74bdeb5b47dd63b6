use clap::Parser;
use log::info;
use quorum::network::QuorumServer;
use shared::config::ClusterConfig;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Cluster configuration file (JSON); defaults to the built-in layout
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => ClusterConfig::load(path)?,
        None => ClusterConfig::default(),
    };

    info!("starting quorum at {}", config.quorum_addr);

    let server = QuorumServer::bind(config).await?;
    server.seed_initial_sections().await;
    server.run().await
}
