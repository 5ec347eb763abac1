//! The server wrapper: wires the delegator and sampler tasks together with a
//! shared shutdown broadcast.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use kiln_comms::delegator::{Delegator, DelegatorSettings};
use kiln_comms::requester::Requester;
use kiln_infer::{
    ChainArray, ChainSettings, EnergyBroker, EpsrDiagnostic, GaussianProposal, ProposalBounds,
    RegressionAdapter, Sampler, TableLogger,
};
use nalgebra::DVector;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::ServerConfig;

/// Adapts the fabric [`Requester`] to the sampler's broker seam.
struct RequesterBroker(Requester);

#[async_trait]
impl EnergyBroker for RequesterBroker {
    async fn submit(&mut self, chain_id: u32, data: &[f64]) -> anyhow::Result<()> {
        self.0.submit(chain_id, data).await?;
        Ok(())
    }

    async fn retrieve(&mut self) -> anyhow::Result<(u32, Vec<f64>)> {
        Ok(self.0.retrieve().await?)
    }
}

pub struct ServerWrapper {
    shutdown: broadcast::Sender<()>,
    delegator_task: JoinHandle<anyhow::Result<()>>,
    sampler_task: JoinHandle<anyhow::Result<()>>,
}

impl ServerWrapper {
    /// Bind the delegator, then launch its poll task and the sampler task.
    pub async fn start(port: u16, config: ServerConfig) -> anyhow::Result<Self> {
        let delegator_settings = DelegatorSettings {
            requester_addr: format!("ipc:///tmp/kiln-delegator-{}.sock", std::process::id()),
            network_addr: format!("tcp://0.0.0.0:{port}"),
            n_job_types: config.n_job_types,
            heartbeat_timeout: Duration::from_secs(config.heartbeat_timeout_sec),
            max_jobs_per_worker: 10,
        };
        let requester_addr = delegator_settings.requester_addr.clone();

        let delegator = Delegator::bind(delegator_settings)
            .await
            .context("failed to bind delegator sockets")?;

        let (shutdown, _) = broadcast::channel(4);
        let delegator_task = tokio::spawn(delegator.run(shutdown.subscribe()));
        let sampler_task = tokio::spawn(run_sampler(config, requester_addr, shutdown.clone()));

        Ok(ServerWrapper {
            shutdown,
            delegator_task,
            sampler_task,
        })
    }

    /// Handle for requesting shutdown from signal handlers.
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown.clone()
    }

    pub fn stop(&self) {
        let _ = self.shutdown.send(());
    }

    /// Wait for the sampler to finish (it requests global shutdown itself on
    /// completion), then for the delegator to wind down.
    pub async fn join(self) -> anyhow::Result<()> {
        let sampler_result = self.sampler_task.await.context("sampler task panicked")?;
        let _ = self.shutdown.send(());
        let delegator_result = self
            .delegator_task
            .await
            .context("delegator task panicked")?;
        sampler_result?;
        delegator_result
    }
}

fn initial_sample(
    config: &ServerConfig,
    bounds: Option<&ProposalBounds>,
    rng: &mut StdRng,
) -> DVector<f64> {
    let n = config.dimensionality;
    let raw = if config.use_initial {
        DVector::from_vec(config.initial.clone())
    } else {
        DVector::from_iterator(n, (0..n).map(|_| rng.gen_range(-1.0..1.0)))
    };
    match bounds {
        Some(b) => DVector::from_iterator(
            n,
            (0..n).map(|i| kiln_infer::reflect(raw[i], b.min[i], b.max[i])),
        ),
        None => raw,
    }
}

async fn run_sampler(
    config: ServerConfig,
    requester_addr: String,
    shutdown: broadcast::Sender<()>,
) -> anyhow::Result<()> {
    let mut shutdown_rx = shutdown.subscribe();

    let n_stacks = config.parallel_tempering.stacks;
    let n_temps = config.parallel_tempering.chains;
    let n_chains = n_stacks * n_temps;
    let n_dims = config.dimensionality;

    let sigma_adapter = RegressionAdapter::new(n_stacks, n_temps, config.optimal_accept_rate);
    let mut beta_adapter = RegressionAdapter::new(n_stacks, n_temps, config.optimal_swap_rate);
    let bounds = config.bounds();

    let chain_settings = ChainSettings {
        output_path: config.output_path.clone(),
        recover: config.recover,
        ..ChainSettings::default()
    };
    let mut chains = ChainArray::new(n_stacks, n_temps, &chain_settings)?;

    let mut broker = RequesterBroker(Requester::connect(&requester_addr).await?);

    // Evaluate an initial sample per chain, building each stack's beta
    // ladder before seeding its coldest chain.
    let mut rng = StdRng::from_entropy();
    for id in 0..n_chains {
        let sample = initial_sample(&config, bounds.as_ref(), &mut rng);
        broker.submit(id as u32, sample.as_slice()).await?;
        // One batch in flight at a time, so the result is ours.
        let (_, components) = tokio::select! {
            result = broker.retrieve() => result?,
            _ = shutdown_rx.recv() => return Ok(()),
        };
        let energy: f64 = components.iter().sum();

        if id % n_temps == 0 {
            beta_adapter.compute_beta_stack(id)?;
        }
        let sigma = sigma_adapter.values()[id];
        let beta = beta_adapter.values()[id];
        info!(chain = id, energy, sigma, beta, "chain initialised");
        chains.initialise(id, sample, energy, sigma, beta);
    }

    let proposal = GaussianProposal::new(n_chains, n_dims, bounds);
    let mut sampler = Sampler::new(
        broker,
        chains,
        proposal,
        sigma_adapter,
        beta_adapter,
        config.parallel_tempering.swap_interval,
    );
    sampler.start().await?;

    let mut epsr = EpsrDiagnostic::new(n_stacks, n_temps, n_dims, config.epsr_threshold);
    let mut logger = TableLogger::new(Duration::from_secs_f64(config.logging_rate_sec));

    let mut n_samples = 0u64;
    let mut interrupted = false;
    while n_samples < config.n_samples_total {
        if sampler.outstanding() == 0 {
            error!("no chains are live, stopping");
            break;
        }
        let (id, state) = tokio::select! {
            result = sampler.step() => result?,
            _ = shutdown_rx.recv() => {
                interrupted = true;
                break;
            }
        };
        if id % n_temps == 0 {
            n_samples += 1;
            epsr.update(id, &state);
        }
        logger.update(sampler.chains(), sampler.sigma_adapter(), sampler.beta_adapter());
    }

    info!(
        n_samples,
        converged = epsr.has_converged(),
        "sampling finished, flushing chains"
    );
    if interrupted {
        // The delegator is stopping too, so outstanding results will never
        // arrive; persist what we have.
        sampler.flush_to_disk()?;
    } else {
        sampler.flush().await?;
    }

    let _ = shutdown.send(());
    Ok(())
}
