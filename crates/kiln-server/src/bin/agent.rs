//! Standalone agent: bridges workers on this host to a remote kiln server.

use std::time::Duration;

use clap::Parser;
use kiln_comms::agent::{Agent, AgentSettings};
use kiln_server::init_logging;
use tokio::sync::broadcast;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "kiln-agent", about = "Per-host bridge to the kiln server")]
struct Args {
    /// Address of the kiln server's network socket.
    #[arg(long, default_value = "tcp://localhost:5555")]
    network_addr: String,

    /// Local address workers connect to.
    #[arg(long, default_value = "ipc:///tmp/kiln-agent.sock")]
    agent_addr: String,

    /// Heartbeat timeout proposed to the server, in seconds.
    #[arg(long, default_value_t = 15)]
    hb_timeout: u64,

    /// Verbosity: 0 warn, 1 info, 2 debug, 3+ trace.
    #[arg(long, default_value_t = 1)]
    log_level: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.log_level);

    let agent = Agent::connect(AgentSettings {
        bind_addr: args.agent_addr,
        network_addr: args.network_addr,
        heartbeat_timeout: Duration::from_secs(args.hb_timeout),
    })
    .await?;

    let (shutdown, _) = broadcast::channel(1);
    let handle = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupted, shutting down");
            let _ = handle.send(());
        }
    });

    agent.run(shutdown.subscribe()).await
}
