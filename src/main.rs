use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use portmap::{Server, ServerConfig};

/// Byte-transparent TCP port-mapping relay.
///
/// All arguments are positional and optional; omitted ones take the
/// documented defaults.
#[derive(Parser, Debug)]
#[command(name = "portmap", version, about)]
struct Args {
    /// Upstream port to map to.
    #[arg(default_value_t = 80)]
    remote_port: u16,

    /// Upstream hostname or IP address.
    #[arg(default_value = "google.com")]
    remote_address: String,

    /// Local port to listen on.
    #[arg(default_value_t = 10001)]
    local_port: u16,

    /// Local interface address; empty means all interfaces.
    #[arg(default_value = "0.0.0.0")]
    local_address: String,

    /// Worker threads in the acceptor pool.
    #[arg(default_value_t = 2)]
    thread_num_acceptors: usize,

    /// Worker threads in the executor pool; defaults to hardware
    /// concurrency.
    #[arg(default_value_t = num_cpus::get())]
    thread_num_executors: usize,

    /// Locale to report in the banner. The process locale itself is the
    /// environment's concern.
    #[arg(default_value = "")]
    language_locale: String,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let locale = if args.language_locale.is_empty() {
        "system"
    } else {
        args.language_locale.as_str()
    };
    info!(
        remote_port = args.remote_port,
        remote_address = %args.remote_address,
        local_port = args.local_port,
        local_address = %args.local_address,
        acceptors = args.thread_num_acceptors,
        executors = args.thread_num_executors,
        locale,
        "portmap starting"
    );

    let config = ServerConfig {
        remote_address: args.remote_address,
        remote_port: args.remote_port,
        local_address: args.local_address,
        local_port: args.local_port,
        acceptor_threads: args.thread_num_acceptors,
        executor_threads: args.thread_num_executors,
    };
    let server = Server::start(&config)?;
    server.run_until_interrupted()
}
