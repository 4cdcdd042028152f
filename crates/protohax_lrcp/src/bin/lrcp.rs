//! Line-reversal server speaking LRCP over UDP.

use std::net::SocketAddr;

use anyhow::Result;
use clap::Parser;
use tokio::net::UdpSocket;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
struct Args {
    /// Address to bind the UDP socket to.
    #[arg(long, default_value = "0.0.0.0:7007")]
    listen: SocketAddr,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let socket = UdpSocket::bind(args.listen).await?;
    protohax_lrcp::server::listen(socket).await?;
    Ok(())
}
