use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};

use sack_chat::{
    cli::{Cli, Command, ServerArgs},
    client,
    config::ServerConfig,
    server::ChatServer,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

async fn run_server(args: ServerArgs) -> Result<()> {
    let server = ChatServer::bind(ServerConfig::from(&args)).await?;

    // Keep the address last on this line; scripts read it from there.
    info!("server listening on {}", server.local_addr()?);

    server.serve_until_ctrl_c().await.inspect_err(|err| {
        warn!("server exited with error: {err:?}");
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    match Cli::parse().command {
        Command::Server(args) => run_server(args).await,
        Command::Client(args) => client::run(args).await,
    }
}
