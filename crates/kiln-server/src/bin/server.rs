//! The kiln server: delegator plus parallel-tempered sampler.

use std::path::PathBuf;

use clap::Parser;
use kiln_server::{init_logging, ServerConfig, ServerWrapper};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "kiln-server", about = "Distributed MCMC sampling server")]
struct Args {
    /// Port the delegator listens on for agents.
    #[arg(long, default_value_t = 5555)]
    port: u16,

    /// Path to the JSON configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Verbosity: 0 warn, 1 info, 2 debug, 3+ trace.
    #[arg(long, default_value_t = 1)]
    log_level: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.log_level);

    // A bad config must exit non-zero before any task starts.
    let config = ServerConfig::load(&args.config)?;

    let server = ServerWrapper::start(args.port, config).await?;
    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupted, shutting down");
            let _ = shutdown.send(());
        }
    });

    server.join().await
}
