//! linechat: A minimal multi-client line-oriented TCP chat server
//!
//! Features:
//! - Username handshake followed by a send/echo loop per client
//! - Bounded, process-wide history of the most recent messages
//! - Automatic fallback to the next free port on bind conflict
//! - Session admission limit and coordinated shutdown on SIGINT/SIGQUIT/SIGTERM
//! - Configuration via CLI arguments or TOML file

mod config;
mod errno;
mod history;
mod protocol;
mod registry;
mod server;
mod session;
mod shutdown;

use config::Config;
use server::Server;
use shutdown::{ShutdownController, TerminationSignal};
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
        host = %config.host,
        port = config.port,
        backlog = config.backlog,
        max_sessions = config.max_sessions,
        history_capacity = config.history_capacity,
        message_capacity = config.message_capacity,
        "Starting linechat server"
    );

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if let Some(workers) = config.workers {
        builder.worker_threads(workers);
    }
    let runtime = builder.build()?;

    let signal = runtime.block_on(serve(config))?;

    info!(signal = signal.name(), code = signal.number(), "Exit by signal");
    runtime.shutdown_background();
    std::process::exit(signal.number());
}

/// Bind, serve until a termination condition arrives, and return it.
async fn serve(config: Config) -> Result<TerminationSignal, Box<dyn std::error::Error>> {
    let (controller, shutdown) = ShutdownController::new();
    controller.install()?;

    let server = Server::bind(&config)?;
    info!(address = %server.local_addr(), "Server listening");

    Ok(server.run(shutdown).await)
}
