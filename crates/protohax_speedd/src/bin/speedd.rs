//! Speed-camera ticketing server.

use std::net::SocketAddr;

use anyhow::Result;
use clap::Parser;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
struct Args {
    /// Address to bind the TCP listener to.
    #[arg(long, default_value = "0.0.0.0:7006")]
    listen: SocketAddr,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let listener = TcpListener::bind(args.listen).await?;
    protohax_speedd::server::listen(listener).await?;
    Ok(())
}
