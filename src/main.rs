//! grow-a-server: an echo server on the pooled networking core
//!
//! Serves the length-prefixed echo protocol over:
//! - TCP with native async sockets
//! - TCP with blocking sockets on the blocking thread pool
//! - UDP, one datagram per frame
//!
//! Configuration via CLI arguments or TOML file.

use grow_a_server::config::Config;
use grow_a_server::protocols::echo::{EchoProtocol, EchoServlet};
use grow_a_server::runtime::{BufferPool, Dispatcher, Listener};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        kind = ?config.connection_kind(),
        workers = config.workers,
        buffer_capacity = config.buffer_capacity,
        "Starting grow-a-server"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.workers)
        .thread_name("worker")
        .enable_all()
        .build()?;

    let buffers = Arc::new(BufferPool::new(
        config.buffer_pool_size,
        config.buffer_capacity,
    ));
    let dispatcher = Dispatcher::new(
        EchoProtocol::default(),
        EchoServlet,
        Arc::clone(&buffers),
        config.exchange_config(),
        runtime.handle().clone(),
    );

    let listener = Listener::open(config.connection_kind(), buffers, runtime.handle().clone());
    let addr = listener.bind(config.listen, config.backlog)?;
    listener.accept(dispatcher.clone())?;
    info!(address = %addr, "Accepting connections");

    runtime.block_on(tokio::signal::ctrl_c())?;

    info!("Shutting down");
    listener.close();
    let stats = dispatcher.stats();
    info!(
        exchanges = stats.exchanges,
        ill_requests = stats.ill_requests,
        io_errors = stats.io_errors,
        servlet_faults = stats.servlet_faults,
        "Server stopped"
    );

    // Blocking-mode reads may still be parked on the blocking pool
    runtime.shutdown_timeout(Duration::from_secs(1));
    Ok(())
}
