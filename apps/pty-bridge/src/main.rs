use anyhow::Result;
use clap::Parser;
use pty_bridge::config::{BridgeConfig, Cli};
use pty_bridge::telemetry::Telemetry;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = Telemetry::init()?;

    let cli = Cli::parse();
    let config = BridgeConfig::try_from(cli)?;
    info!(
        listen_addr = %config.listen_addr,
        workspace_root = %config.workspace_root.display(),
        program = %config.program,
        buffer_bytes = config.buffer_bytes,
        "starting pty-bridge"
    );

    pty_bridge::run(config, Some(telemetry.metrics_handle())).await
}
