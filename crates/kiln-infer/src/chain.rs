//! The chain array: per-chain sample storage with a bounded in-memory cache
//! and append-only CSV spill for the coldest chain of each stack.
//!
//! Chain ids are laid out stack-major: with 2 stacks of 4 temperatures,
//! ids 0..4 are stack 0 from coldest (temperature index 0, beta = 1) to
//! hottest, ids 4..8 are stack 1. Only temperature-0 chains are persisted;
//! hotter chains keep their most recent state and discard the rest when
//! trimmed.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use nalgebra::DVector;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use crate::state::{State, SwapType};
use crate::writer::CsvChainWriter;
use crate::InferError;

#[derive(Debug, Clone)]
pub struct ChainSettings {
    /// Directory receiving `<stack>.csv` files.
    pub output_path: PathBuf,
    /// Reconstruct each cold chain's last state from its CSV on startup.
    pub recover: bool,
    /// Cache size that triggers a trim, in states.
    pub cache_length: usize,
    /// Wall-time between background flushes of all caches.
    pub flush_interval: Duration,
    /// Fixed RNG seed for the accept/swap draws; random when absent.
    pub seed: Option<u64>,
}

impl Default for ChainSettings {
    fn default() -> Self {
        ChainSettings {
            output_path: PathBuf::from("output"),
            recover: false,
            cache_length: 1000,
            flush_interval: Duration::from_secs(10),
            seed: None,
        }
    }
}

pub struct ChainArray {
    writer: CsvChainWriter,
    n_stacks: usize,
    n_temps: usize,
    lengths_on_disk: Vec<u64>,
    /// True while the head of a recovered chain's cache is already on disk.
    head_persisted: Vec<bool>,
    beta: Vec<f64>,
    sigma: Vec<f64>,
    cache: Vec<Vec<State>>,
    cache_length: usize,
    flush_interval: Duration,
    last_flush: Instant,
    rng: StdRng,
}

impl ChainArray {
    pub fn new(
        n_stacks: usize,
        n_temps: usize,
        settings: &ChainSettings,
    ) -> Result<Self, InferError> {
        let n = n_stacks * n_temps;
        let writer = CsvChainWriter::new(&settings.output_path, n_stacks, settings.recover)?;

        let mut chains = ChainArray {
            writer,
            n_stacks,
            n_temps,
            lengths_on_disk: vec![0; n],
            head_persisted: vec![false; n],
            beta: vec![1.0; n],
            sigma: vec![1.0; n],
            cache: vec![Vec::new(); n],
            cache_length: settings.cache_length.max(2),
            flush_interval: settings.flush_interval,
            last_flush: Instant::now(),
            rng: match settings.seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_entropy(),
            },
        };

        if settings.recover {
            for stack in 0..n_stacks {
                if let Some((state, rows)) =
                    CsvChainWriter::read_last(&settings.output_path, stack)?
                {
                    let id = stack * n_temps;
                    debug!(stack, rows, "recovered cold chain from disk");
                    chains.sigma[id] = state.sigma;
                    chains.beta[id] = state.beta;
                    chains.lengths_on_disk[id] = rows;
                    chains.head_persisted[id] = true;
                    chains.cache[id].push(state);
                }
            }
        }

        Ok(chains)
    }

    pub fn n_stacks(&self) -> usize {
        self.n_stacks
    }

    pub fn n_temps(&self) -> usize {
        self.n_temps
    }

    pub fn n_chains(&self) -> usize {
        self.n_stacks * self.n_temps
    }

    pub fn stack_index(&self, id: usize) -> usize {
        id / self.n_temps
    }

    pub fn temp_index(&self, id: usize) -> usize {
        id % self.n_temps
    }

    pub fn is_coldest_in_stack(&self, id: usize) -> bool {
        self.temp_index(id) == 0
    }

    pub fn is_hottest_in_stack(&self, id: usize) -> bool {
        self.temp_index(id) == self.n_temps - 1
    }

    pub fn length(&self, id: usize) -> u64 {
        self.lengths_on_disk[id] + self.cache[id].len() as u64
            - u64::from(self.head_persisted[id])
    }

    pub fn sigma(&self, id: usize) -> f64 {
        self.sigma[id]
    }

    pub fn set_sigma(&mut self, id: usize, sigma: f64) {
        self.sigma[id] = sigma;
    }

    pub fn beta(&self, id: usize) -> f64 {
        self.beta[id]
    }

    pub fn set_beta(&mut self, id: usize, beta: f64) {
        self.beta[id] = beta;
    }

    /// The most recent state of a chain. The chain must have been
    /// initialised.
    pub fn last_state(&self, id: usize) -> &State {
        self.cache[id].last().expect("chain not initialised")
    }

    /// Seed a chain by force-accepting a state and fixing its sigma and beta.
    pub fn initialise(
        &mut self,
        id: usize,
        sample: DVector<f64>,
        energy: f64,
        sigma: f64,
        beta: f64,
    ) {
        self.set_sigma(id, sigma);
        self.set_beta(id, beta);
        self.cache[id].push(State {
            sample,
            energy,
            sigma,
            beta,
            accepted: true,
            swap_type: SwapType::NoAttempt,
        });
    }

    /// Metropolis step: accept the proposed sample with probability
    /// `exp(-beta * (energy - last.energy))`, re-appending a copy of the
    /// previous state on rejection. Returns whether the proposal was
    /// accepted.
    pub fn append(
        &mut self,
        id: usize,
        sample: DVector<f64>,
        energy: f64,
    ) -> Result<bool, InferError> {
        let last = self.last_state(id).clone();
        let accepted = if energy.is_infinite() {
            false
        } else {
            let delta = energy - last.energy;
            let accept_prob = (-self.beta[id] * delta).exp();
            self.rng.gen::<f64>() < accept_prob
        };

        let mut state = if accepted {
            State {
                sample,
                energy,
                sigma: self.sigma[id],
                beta: self.beta[id],
                accepted: true,
                swap_type: SwapType::NoAttempt,
            }
        } else {
            last
        };
        state.accepted = accepted;
        state.swap_type = SwapType::NoAttempt;
        self.cache[id].push(state);

        if self.cache[id].len() >= self.cache_length {
            self.flush(id)?;
        }
        if self.last_flush.elapsed() >= self.flush_interval {
            self.last_flush = Instant::now();
            self.flush_all()?;
        }

        Ok(accepted)
    }

    /// Attempt to exchange the most recent states of two adjacent-temperature
    /// chains in the same stack; `id_cold` is the colder (lower id) chain.
    /// The samples, energies and accepted flags move; sigma and beta stay
    /// with their chains. The outcome is recorded on the colder chain only.
    pub fn swap(&mut self, id_cold: usize, id_hot: usize) -> SwapType {
        debug_assert_eq!(id_hot, id_cold + 1, "swaps are between adjacent chains");
        debug_assert_eq!(
            self.stack_index(id_cold),
            self.stack_index(id_hot),
            "swaps stay within a stack"
        );

        let state_cold = self.last_state(id_cold).clone();
        let state_hot = self.last_state(id_hot).clone();

        let delta_energy = state_hot.energy - state_cold.energy;
        let delta_beta = self.beta[id_hot] - self.beta[id_cold];
        let swap_prob = (delta_energy * delta_beta).exp();
        let accepted = self.rng.gen::<f64>() < swap_prob;

        if accepted {
            let cold = self.cache[id_cold].last_mut().expect("chain not initialised");
            cold.sample = state_hot.sample;
            cold.energy = state_hot.energy;
            cold.accepted = state_hot.accepted;
            cold.swap_type = SwapType::Accept;

            let hot = self.cache[id_hot].last_mut().expect("chain not initialised");
            hot.sample = state_cold.sample;
            hot.energy = state_cold.energy;
            hot.accepted = state_cold.accepted;
            SwapType::Accept
        } else {
            let cold = self.cache[id_cold].last_mut().expect("chain not initialised");
            cold.swap_type = SwapType::Reject;
            SwapType::Reject
        }
    }

    /// Trim a chain's cache to its most recent state, spilling the trimmed
    /// states to CSV when the chain is the coldest of its stack.
    pub fn flush(&mut self, id: usize) -> Result<(), InferError> {
        let len = self.cache[id].len();
        if len <= 1 {
            return Ok(());
        }

        let start = usize::from(self.head_persisted[id]);
        if self.temp_index(id) == 0 {
            let stack = self.stack_index(id);
            self.writer.append(stack, &self.cache[id][start..len - 1])?;
        }
        self.lengths_on_disk[id] += (len - 1 - start) as u64;
        self.head_persisted[id] = false;

        let recent = self.cache[id].pop().expect("cache non-empty");
        self.cache[id].clear();
        self.cache[id].push(recent);
        Ok(())
    }

    pub fn flush_all(&mut self) -> Result<(), InferError> {
        for id in 0..self.n_chains() {
            self.flush(id)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::dvector;

    fn settings(dir: &std::path::Path) -> ChainSettings {
        ChainSettings {
            output_path: dir.to_path_buf(),
            seed: Some(42),
            ..ChainSettings::default()
        }
    }

    #[test]
    fn chains_start_at_length_zero() {
        let dir = tempfile::tempdir().unwrap();
        let chains = ChainArray::new(2, 3, &settings(dir.path())).unwrap();
        for id in 0..chains.n_chains() {
            assert_eq!(chains.length(id), 0);
        }
    }

    #[test]
    fn initialise_force_accepts() {
        let dir = tempfile::tempdir().unwrap();
        let mut chains = ChainArray::new(2, 3, &settings(dir.path())).unwrap();

        chains.initialise(0, dvector![1.0, 2.0, 3.0, 4.0, 5.0], 666.0, 1.0, 1.0);

        assert_eq!(chains.length(0), 1);
        assert_eq!(chains.sigma(0), 1.0);
        assert_eq!(chains.beta(0), 1.0);
        let state = chains.last_state(0);
        assert_eq!(state.energy, 666.0);
        assert_eq!(state.sample, dvector![1.0, 2.0, 3.0, 4.0, 5.0]);
        assert!(state.accepted);
        assert_eq!(state.swap_type, SwapType::NoAttempt);
    }

    #[test]
    fn append_stores_chain_sigma_and_beta() {
        let dir = tempfile::tempdir().unwrap();
        let mut chains = ChainArray::new(1, 1, &settings(dir.path())).unwrap();
        chains.initialise(0, dvector![0.0], 10.0, 1.0, 1.0);

        chains.set_sigma(0, 0.7);
        chains.set_beta(0, 0.9);
        // A large energy drop is always accepted.
        chains.append(0, dvector![1.0], -1000.0).unwrap();

        let state = chains.last_state(0);
        assert!(state.accepted);
        assert_eq!(state.sigma, chains.sigma(0));
        assert_eq!(state.beta, chains.beta(0));
    }

    #[test]
    fn downhill_moves_always_accept_and_infinite_energy_rejects() {
        let dir = tempfile::tempdir().unwrap();
        let mut chains = ChainArray::new(1, 1, &settings(dir.path())).unwrap();
        chains.initialise(0, dvector![0.0], 100.0, 1.0, 1.0);

        assert!(chains.append(0, dvector![1.0], 50.0).unwrap());
        assert_eq!(chains.last_state(0).energy, 50.0);

        assert!(!chains.append(0, dvector![2.0], f64::INFINITY).unwrap());
        // The rejected step re-appends the previous state.
        assert_eq!(chains.length(0), 3);
        assert_eq!(chains.last_state(0).energy, 50.0);
        assert_eq!(chains.last_state(0).sample, dvector![1.0]);
        assert!(!chains.last_state(0).accepted);
    }

    #[test]
    fn swap_exchanges_samples_but_not_temperatures() {
        let dir = tempfile::tempdir().unwrap();
        let mut chains = ChainArray::new(2, 3, &settings(dir.path())).unwrap();

        let m1 = dvector![1.0, 2.0, 3.0, 4.0, 5.0];
        let m2 = dvector![-1.0, -2.0, -3.0, -4.0, -5.0];

        // delta_energy * delta_beta = 1.0 * 0.01 > 0, so the swap probability
        // exceeds one and the outcome is deterministic.
        chains.initialise(0, m1.clone(), 666.0, 1.0, 0.1);
        chains.initialise(1, m2.clone(), 667.0, 0.2, 0.11);

        assert_eq!(chains.swap(0, 1), SwapType::Accept);
        assert_eq!(chains.length(0), 1);
        assert_eq!(chains.length(1), 1);

        let cold = chains.last_state(0);
        assert_eq!(cold.sample, m2);
        assert_eq!(cold.energy, 667.0);
        assert_eq!(cold.sigma, 1.0);
        assert_eq!(cold.beta, 0.1);
        assert_eq!(cold.swap_type, SwapType::Accept);

        let hot = chains.last_state(1);
        assert_eq!(hot.sample, m1);
        assert_eq!(hot.energy, 666.0);
        assert_eq!(hot.sigma, 0.2);
        assert_eq!(hot.beta, 0.11);
        assert_eq!(hot.swap_type, SwapType::NoAttempt);
    }

    #[test]
    fn hopeless_swap_is_rejected_and_marked() {
        let dir = tempfile::tempdir().unwrap();
        let mut chains = ChainArray::new(1, 2, &settings(dir.path())).unwrap();

        // delta_energy * delta_beta = (-1e6) * 0.5 -> prob exp(-5e5) = 0.
        chains.initialise(0, dvector![0.0], 1e6, 1.0, 1.0);
        chains.initialise(1, dvector![1.0], 0.0, 1.0, 0.5);
        // Make delta_beta positive so the product is hugely negative.
        chains.set_beta(1, 1.5);

        assert_eq!(chains.swap(0, 1), SwapType::Reject);
        assert_eq!(chains.last_state(0).swap_type, SwapType::Reject);
        assert_eq!(chains.last_state(0).energy, 1e6);
        assert_eq!(chains.last_state(1).swap_type, SwapType::NoAttempt);
    }

    #[test]
    fn only_cold_chains_are_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let mut chains = ChainArray::new(1, 2, &settings(dir.path())).unwrap();
        chains.initialise(0, dvector![0.0], 1.0, 1.0, 1.0);
        chains.initialise(1, dvector![0.0], 1.0, 1.0, 0.5);
        for _ in 0..5 {
            chains.append(0, dvector![1.0], -1.0).unwrap();
            chains.append(1, dvector![1.0], -1.0).unwrap();
        }
        chains.flush_all().unwrap();

        assert!(dir.path().join("0.csv").exists());
        assert!(!dir.path().join("1.csv").exists());
        // Both caches were trimmed to the most recent state.
        assert_eq!(chains.length(0), 6);
        assert_eq!(chains.length(1), 6);
    }

    #[test]
    fn recovery_restores_last_persisted_state() {
        let dir = tempfile::tempdir().unwrap();
        let m2 = dvector![-1.0, -2.0];
        {
            let mut chains = ChainArray::new(1, 1, &settings(dir.path())).unwrap();
            chains.initialise(0, dvector![1.0, 2.0], 666.0, 0.5, 1.0);
            chains.append(0, m2.clone(), 333.0).unwrap();
            chains.append(0, dvector![9.0, 9.0], f64::INFINITY).unwrap();
            chains.flush_all().unwrap();
        }

        let recovered = ChainArray::new(
            1,
            1,
            &ChainSettings {
                recover: true,
                ..settings(dir.path())
            },
        )
        .unwrap();

        // Two rows were flushed (the trailing cache element is not spilled).
        assert_eq!(recovered.length(0), 2);
        let state = recovered.last_state(0);
        assert_eq!(state.sample, m2);
        assert_eq!(state.energy, 333.0);
        assert_eq!(recovered.sigma(0), 0.5);
        assert_eq!(recovered.beta(0), 1.0);
    }

    #[test]
    fn recovered_head_is_not_written_twice() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut chains = ChainArray::new(1, 1, &settings(dir.path())).unwrap();
            chains.initialise(0, dvector![1.0], 666.0, 0.5, 1.0);
            chains.append(0, dvector![2.0], 1.0).unwrap();
            chains.flush_all().unwrap();
        }
        {
            let mut chains = ChainArray::new(
                1,
                1,
                &ChainSettings {
                    recover: true,
                    ..settings(dir.path())
                },
            )
            .unwrap();
            chains.append(0, dvector![3.0], 0.5).unwrap();
            chains.append(0, dvector![4.0], 0.25).unwrap();
            chains.flush_all().unwrap();
            assert_eq!(chains.length(0), 3);
        }

        // Disk rows: the original flush (1) plus one new state; the recovered
        // head must not be duplicated.
        let (_, rows) = CsvChainWriter::read_last(dir.path(), 0).unwrap().unwrap();
        assert_eq!(rows, 2);
    }
}
