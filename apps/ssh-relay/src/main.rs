use anyhow::Result;
use clap::Parser;
use ssh_relay::config::{Cli, Command, ServerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    ssh_relay::init_tracing()?;
    let mut cli = Cli::parse();

    match cli.command.take() {
        Some(Command::Keys { action }) => ssh_relay::run_keys_command(&cli.key_db, action).await,
        None => {
            let config = ServerConfig::try_from(&cli)?;
            ssh_relay::serve(config).await
        }
    }
}
