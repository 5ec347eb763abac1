//! Demo likelihood worker: evaluates an isotropic Gaussian negative log
//! likelihood for every job type.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use kiln_server::{init_logging, WorkerRuntime};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "kiln-worker", about = "Demo Gaussian likelihood worker")]
struct Args {
    /// Address of the kiln server's network socket.
    #[arg(long, default_value = "tcp://localhost:5555")]
    network_addr: String,

    /// Lowest job type this worker evaluates.
    #[arg(long, default_value_t = 1)]
    job_type_lo: u32,

    /// Highest job type this worker evaluates.
    #[arg(long, default_value_t = 1)]
    job_type_hi: u32,

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

    let likelihood: kiln_comms::worker::LikelihoodFn = Arc::new(|_job_type, sample: &[f32]| {
        sample.iter().map(|x| 0.5 * f64::from(*x) * f64::from(*x)).sum()
    });

    let runtime = WorkerRuntime::start(
        &args.network_addr,
        (args.job_type_lo, args.job_type_hi),
        likelihood,
        Duration::from_secs(args.hb_timeout),
    )
    .await?;

    let shutdown = runtime.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupted, shutting down");
            let _ = shutdown.send(());
        }
    });

    runtime.join().await
}
