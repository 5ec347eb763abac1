//! Periodic table logging of chain progress.

use std::time::{Duration, Instant};

use tracing::info;

use crate::adaptive::RegressionAdapter;
use crate::chain::ChainArray;

/// Emits a per-chain status table through `tracing` at a fixed wall-time
/// rate. Call [`update`](Self::update) after every sampler step; emission is
/// throttled internally.
pub struct TableLogger {
    interval: Duration,
    last_emit: Instant,
    steps: u64,
}

impl TableLogger {
    pub fn new(interval: Duration) -> Self {
        TableLogger {
            interval,
            last_emit: Instant::now(),
            steps: 0,
        }
    }

    pub fn update(
        &mut self,
        chains: &ChainArray,
        sigma_adapter: &RegressionAdapter,
        beta_adapter: &RegressionAdapter,
    ) {
        self.steps += 1;
        if self.last_emit.elapsed() < self.interval {
            return;
        }
        self.last_emit = Instant::now();

        let mut table = String::from(
            "chain  stack  temp     length  accept   sigma     swap     beta\n",
        );
        for id in 0..chains.n_chains() {
            let accept = sigma_adapter.rates()[id];
            let swap = beta_adapter.rates()[id];
            table.push_str(&format!(
                "{:>5}  {:>5}  {:>4}  {:>9}  {:>6.3}  {:>8.3e}  {:>6.3}  {:>8.3e}\n",
                id,
                chains.stack_index(id),
                chains.temp_index(id),
                chains.length(id),
                accept,
                sigma_adapter.values()[id],
                swap,
                chains.beta(id),
            ));
        }
        info!(steps = self.steps, "sampler progress\n{table}");
    }
}
