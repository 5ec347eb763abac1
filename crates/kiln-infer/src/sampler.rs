//! The cooperative MCMC loop.
//!
//! One outstanding likelihood evaluation per chain: the sampler blocks on
//! the next batch result, appends it to the owning chain, adapts sigma and
//! the proposal shape, then either proposes again or runs one leg of the
//! swap cascade. Swaps start at the hottest chain of a stack every
//! `swap_interval` steps and walk down the ladder through `locked` flags:
//! a locked chain holds its next proposal until the chain below has swapped
//! with it.

use async_trait::async_trait;
use nalgebra::DVector;
use tracing::{debug, error};

use crate::adaptive::RegressionAdapter;
use crate::chain::ChainArray;
use crate::proposal::GaussianProposal;
use crate::state::{State, SwapType};
use crate::InferError;

/// The sampler's view of the dispatch fabric. Results arrive in completion
/// order, one per submitted chain id.
#[async_trait]
pub trait EnergyBroker: Send {
    async fn submit(&mut self, chain_id: u32, data: &[f64]) -> anyhow::Result<()>;
    async fn retrieve(&mut self) -> anyhow::Result<(u32, Vec<f64>)>;
}

pub struct Sampler<B> {
    broker: B,
    chains: ChainArray,
    proposal: GaussianProposal,
    sigma_adapter: RegressionAdapter,
    beta_adapter: RegressionAdapter,
    swap_interval: u64,
    /// Most recently submitted proposal per chain.
    prop_states: Vec<DVector<f64>>,
    outstanding: usize,
    /// A locked chain is waiting to swap with the chain above it.
    locked: Vec<bool>,
    /// Stacks disabled by a numerical failure keep draining but stop
    /// proposing; the others sample on.
    stack_alive: Vec<bool>,
}

impl<B: EnergyBroker> Sampler<B> {
    pub fn new(
        broker: B,
        chains: ChainArray,
        proposal: GaussianProposal,
        sigma_adapter: RegressionAdapter,
        beta_adapter: RegressionAdapter,
        swap_interval: u64,
    ) -> Self {
        let n = chains.n_chains();
        let n_stacks = chains.n_stacks();
        Sampler {
            broker,
            chains,
            proposal,
            sigma_adapter,
            beta_adapter,
            swap_interval: swap_interval.max(1),
            prop_states: vec![DVector::zeros(0); n],
            outstanding: 0,
            locked: vec![false; n],
            stack_alive: vec![true; n_stacks],
        }
    }

    pub fn chains(&self) -> &ChainArray {
        &self.chains
    }

    pub fn sigma_adapter(&self) -> &RegressionAdapter {
        &self.sigma_adapter
    }

    pub fn beta_adapter(&self) -> &RegressionAdapter {
        &self.beta_adapter
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    pub fn stack_alive(&self, stack: usize) -> bool {
        self.stack_alive[stack]
    }

    /// Submit the first proposal for every chain, hottest to coldest. Chains
    /// must already be initialised.
    pub async fn start(&mut self) -> Result<(), InferError> {
        for id in (0..self.chains.n_chains()).rev() {
            self.propose(id).await?;
        }
        Ok(())
    }

    /// Advance one chain by one state. Blocks until a result is available.
    pub async fn step(&mut self) -> Result<(usize, State), InferError> {
        let (id, components) = self.broker.retrieve().await.map_err(InferError::Broker)?;
        let id = id as usize;
        self.outstanding -= 1;
        let energy: f64 = components.iter().sum();

        let previous = self.chains.last_state(id).clone();
        self.chains.append(id, self.prop_states[id].clone(), energy)?;
        let state = self.chains.last_state(id).clone();

        if !self.stack_alive[self.chains.stack_index(id)] {
            // Drain only; the stack stopped proposing.
            return Ok((id, state));
        }

        // Adapt the proposal scale toward the target acceptance rate.
        let log_temper = -state.beta.ln();
        self.sigma_adapter
            .update(id, state.sigma.ln(), log_temper, state.accepted);
        match self.sigma_adapter.compute_sigma(id, log_temper) {
            Ok(sigma) => self.chains.set_sigma(id, sigma),
            Err(err) => {
                self.disable_stack(id, &err);
                return Ok((id, state));
            }
        }

        // Adapt the proposal shape from accepted steps.
        if state.accepted {
            let step = &state.sample - &previous.sample;
            self.proposal.update(id, &step);
        }

        if self.locked[id] {
            // The chain above is waiting: attempt the swap, then pass the
            // cascade down the ladder.
            let swapped = self.chains.swap(id, id + 1) == SwapType::Accept;
            self.unlock(id).await?;

            self.beta_adapter.beta_update(
                id,
                self.chains.beta(id),
                self.chains.beta(id + 1),
                swapped,
            );
            if self.chains.is_coldest_in_stack(id) {
                if let Err(err) = self.beta_adapter.compute_beta_stack(id) {
                    self.disable_stack(id, &err);
                    return Ok((id, state));
                }
            }
            // The chain we just unlocked starts its next interval at the
            // freshly adapted temperature.
            self.chains
                .set_beta(id + 1, self.beta_adapter.values()[id + 1]);
        } else if self.chains.is_hottest_in_stack(id)
            && self.chains.length(id) % self.swap_interval == 0
            && self.chains.n_temps() > 1
        {
            // Start a swap cascade: hold the neighbour below.
            self.locked[id - 1] = true;
        } else {
            self.propose(id).await?;
        }

        Ok((id, self.chains.last_state(id).clone()))
    }

    /// Force every chain's cache to disk without draining the fabric, for
    /// shutdown paths where no more results will arrive.
    pub fn flush_to_disk(&mut self) -> Result<(), InferError> {
        self.chains.flush_all()
    }

    /// Drain every outstanding result without proposing, then force all
    /// caches to disk.
    pub async fn flush(&mut self) -> Result<(), InferError> {
        while self.outstanding > 0 {
            let (id, components) = self.broker.retrieve().await.map_err(InferError::Broker)?;
            self.outstanding -= 1;
            let id = id as usize;
            let energy: f64 = components.iter().sum();
            self.chains
                .append(id, self.prop_states[id].clone(), energy)?;
        }
        self.chains.flush_all()
    }

    async fn propose(&mut self, id: usize) -> Result<(), InferError> {
        let sigma = self.sigma_adapter.values()[id];
        let current = self.chains.last_state(id).sample.clone();
        let proposed = self.proposal.propose(id, &current, sigma);

        let data: Vec<f64> = proposed.iter().copied().collect();
        self.broker
            .submit(id as u32, &data)
            .await
            .map_err(InferError::Broker)?;
        self.prop_states[id] = proposed;
        self.outstanding += 1;
        debug!(chain = id, sigma, "proposed");
        Ok(())
    }

    async fn unlock(&mut self, id: usize) -> Result<(), InferError> {
        self.locked[id] = false;

        // The hotter chain no longer waits on us.
        self.propose(id + 1).await?;

        if self.chains.temp_index(id) != 0 {
            // Pass the cascade to the colder neighbour.
            self.locked[id - 1] = true;
        } else {
            // Bottom of the ladder: this chain resumes as well.
            self.propose(id).await?;
        }
        Ok(())
    }

    fn disable_stack(&mut self, chain_id: usize, err: &InferError) {
        let stack = self.chains.stack_index(chain_id);
        if !self.stack_alive[stack] {
            return;
        }
        error!(stack, error = %err, "numerical failure, stopping this stack");
        self.stack_alive[stack] = false;
        let base = stack * self.chains.n_temps();
        for id in base..base + self.chains.n_temps() {
            self.locked[id] = false;
        }
    }
}
