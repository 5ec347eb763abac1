//! The parallel-tempered MCMC engine.
//!
//! A [`ChainArray`] holds `n_stacks * n_temps` chains; the [`Sampler`]
//! advances them cooperatively, one outstanding likelihood evaluation per
//! chain, interleaving Metropolis steps with a swap cascade between adjacent
//! temperatures. [`RegressionAdapter`]s steer proposal scale and the
//! temperature ladder toward target acceptance and swap rates, and the
//! [`EpsrDiagnostic`] reports convergence across the cold chains.

pub mod adaptive;
pub mod chain;
pub mod diagnostics;
pub mod logging;
pub mod proposal;
pub mod sampler;
pub mod state;
mod writer;

pub use adaptive::{CovarianceEstimator, RegressionAdapter};
pub use chain::{ChainArray, ChainSettings};
pub use diagnostics::EpsrDiagnostic;
pub use logging::TableLogger;
pub use proposal::{reflect, GaussianProposal, ProposalBounds};
pub use sampler::{EnergyBroker, Sampler};
pub use state::{State, SwapType};

/// Errors from the inference engine.
#[derive(Debug, thiserror::Error)]
pub enum InferError {
    #[error("chain output I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("chain CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("malformed chain CSV row: {0}")]
    BadRow(String),
    #[error("adapter produced non-finite weights for chain {chain}")]
    NonFinite { chain: usize },
    #[error(transparent)]
    Broker(#[from] anyhow::Error),
}
