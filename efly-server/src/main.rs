//! Binary entrypoint for `efly-server`.

mod command;
mod conn_context;
mod eval;
mod generic_family;
mod memcache;
mod network;
mod registry;
mod server_family;
mod server_state;
mod service;
mod string_family;

use std::sync::Arc;

use clap::Parser;
use efly_common::config::RuntimeConfig;
use efly_common::ids::ShardCount;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use crate::service::Service;

/// emberfly: an in-memory, Redis-wire-compatible key-value store.
#[derive(Parser, Debug)]
#[command(name = "efly-server", version, about)]
struct Cli {
    /// Redis listener port.
    #[arg(long, default_value_t = 6380)]
    port: u16,

    /// Memcached listener port; 0 disables the listener.
    #[arg(long = "memcache_port", default_value_t = 0)]
    memcache_port: u16,

    /// When non-empty, connections must AUTH before any other command.
    #[arg(long)]
    requirepass: Option<String>,

    /// Worker thread count; one thread is reserved for non-shard work when more than one exists.
    #[arg(long, default_value_t = 5)]
    threads: u16,

    /// Reject write commands, as on a read-only replica.
    #[arg(long = "replica_read_only", default_value_t = false)]
    replica_read_only: bool,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let Some(shard_count) = ShardCount::from_thread_count(cli.threads) else {
        eprintln!("failed to start efly-server: --threads must be positive");
        std::process::exit(1);
    };
    let config = RuntimeConfig {
        shard_count,
        redis_port: cli.port,
        memcached_port: (cli.memcache_port != 0).then_some(cli.memcache_port),
        requirepass: cli.requirepass,
        replica_read_only: cli.replica_read_only,
    };

    let service = Arc::new(Service::new(config));
    if let Err(error) = service.init() {
        eprintln!("failed to start efly-server: {error}");
        std::process::exit(1);
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            eprintln!("failed to start efly-server: {error}");
            std::process::exit(1);
        }
    };

    let served = runtime.block_on(network::serve(Arc::clone(&service)));
    if let Err(error) = service.shutdown() {
        warn!(%error, "service teardown reported an error");
    }
    if let Err(error) = served {
        eprintln!("efly-server terminated: {error}");
        std::process::exit(1);
    }
}
