use clap::Parser;
use front::network::FrontServer;
use log::info;
use shared::config::ClusterConfig;
use shared::world::FrontId;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Which configured front this process is
    #[arg(short, long)]
    front: FrontId,

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

    info!("starting front #{}", args.front);

    let server = FrontServer::new(args.front, config).await?;
    server.run().await
}
