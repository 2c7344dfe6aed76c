use std::{net::SocketAddr, time::Duration};

use clap::{Args, Parser, Subcommand};

use crate::config::{DEFAULT_CONNECT_TIMEOUT, ServerConfig, SessionConfig};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the chat server until interrupted.
    Server(ServerArgs),
    /// Join a server and chat from the terminal.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Socket address to listen on. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:8080")]
    pub listen: SocketAddr,

    /// Milliseconds allowed for a single write to one client.
    #[arg(long, default_value_t = 5000)]
    pub write_timeout_ms: u64,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Name to join with (1 to 15 characters).
    #[arg(long)]
    pub username: String,

    /// Server to connect to, as host:port.
    #[arg(long, default_value = "localhost:8080")]
    pub server: String,

    /// Milliseconds to wait for the TCP connection.
    #[arg(long, default_value_t = DEFAULT_CONNECT_TIMEOUT.as_millis() as u64)]
    pub connect_timeout_ms: u64,
}

impl From<&ServerArgs> for ServerConfig {
    fn from(args: &ServerArgs) -> Self {
        Self {
            write_timeout: Duration::from_millis(args.write_timeout_ms),
            ..Self::new(args.listen)
        }
    }
}

impl From<&ClientArgs> for SessionConfig {
    fn from(args: &ClientArgs) -> Self {
        Self {
            connect_timeout: Duration::from_millis(args.connect_timeout_ms),
            ..Self::new(args.server.clone())
        }
    }
}
