use clap::Parser;
use log::info;
use server::{NetworkServer, ServerConfig};
use shared::{DEFAULT_MAX_CARS, DEFAULT_PING_TIMEOUT_SECS, DEFAULT_PORT, DEFAULT_TICK_RATE};

/// Command line arguments
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Server IP address to bind to
    #[clap(short = 'H', long, default_value = "127.0.0.1")]
    host: String,
    /// Server port to listen on
    #[clap(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,
    /// Position broadcasts per second
    #[clap(short, long, default_value_t = DEFAULT_TICK_RATE)]
    tick_rate: u32,
    /// Cars per player, not counting the unicycle
    #[clap(long, default_value_t = DEFAULT_MAX_CARS)]
    max_cars: usize,
    /// Seconds without a ping before a client is dropped
    #[clap(long, default_value_t = DEFAULT_PING_TIMEOUT_SECS)]
    ping_timeout: u64,
    /// Maximum number of connected clients
    #[clap(long, default_value = "32")]
    max_clients: usize,
}

impl From<Args> for ServerConfig {
    fn from(args: Args) -> Self {
        ServerConfig {
            host: args.host,
            port: args.port,
            tick_rate: args.tick_rate,
            max_cars: args.max_cars,
            ping_timeout_secs: args.ping_timeout,
            max_clients: args.max_clients,
        }
    }
}

/// Parses command-line arguments, then runs the server until the listener fails.
fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServerConfig::from(Args::parse());
    info!(
        "Starting server: {} clients max, {} cars per player, {}Hz, {}s ping timeout",
        config.max_clients, config.max_cars, config.tick_rate, config.ping_timeout_secs
    );

    NetworkServer::bind(config)?.run()?;
    Ok(())
}
