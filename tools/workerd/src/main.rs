use std::net::SocketAddr;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tessella_network::{Fabric, TcpFabric};
use tessella_worker::run_worker;

/// Pooled solver worker. Dials the coordinator's rendezvous address, joins
/// the fabric and serves solve tasks until asked to shut down.
#[derive(Parser, Debug)]
#[command(name = "tessella-workerd")]
struct Args {
    /// Rendezvous address of the coordinator, e.g. 10.0.0.1:45000
    #[arg(long, env = "TESSELLA_CONNECT")]
    connect: SocketAddr,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let fabric = TcpFabric::connect(args.connect)
        .await
        .with_context(|| format!("joining the fabric at {}", args.connect))?;
    let rank = fabric.rank();
    run_worker(fabric)
        .await
        .with_context(|| format!("worker {rank} stopped"))?;
    info!(rank, "worker exited cleanly");
    Ok(())
}
