use anyhow::Result;
use clap::Parser;
use edge_proxy::config::{Cli, ProxyConfig};

#[tokio::main]
async fn main() -> Result<()> {
    edge_proxy::init_tracing()?;
    let config = ProxyConfig::try_from(Cli::parse())?;
    edge_proxy::run(config).await
}
