//! Gaussian proposal with covariance shaping and bounded reflection.

use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, StandardNormal};
use tracing::info;

use crate::adaptive::CovarianceEstimator;

/// Hard bounds for the sampled parameters. Both vectors must have the
/// problem's dimensionality.
#[derive(Debug, Clone)]
pub struct ProposalBounds {
    pub min: DVector<f64>,
    pub max: DVector<f64>,
}

/// Mirror a value about the nearest bound until it lands inside
/// `[min, max]`, so proposals bounce off walls rather than pile up on them.
pub fn reflect(value: f64, min: f64, max: f64) -> f64 {
    let width = max - min;
    if value > max {
        let overstep = value - max;
        let n_steps = (overstep / width) as u64;
        let still_to_go = overstep - n_steps as f64 * width;
        if n_steps % 2 == 0 {
            max - still_to_go
        } else {
            min + still_to_go
        }
    } else if value < min {
        let understep = min - value;
        let n_steps = (understep / width) as u64;
        let still_to_go = understep - n_steps as f64 * width;
        if n_steps % 2 == 0 {
            min + still_to_go
        } else {
            max - still_to_go
        }
    } else {
        value
    }
}

fn reflect_vector(mut value: DVector<f64>, bounds: &ProposalBounds) -> DVector<f64> {
    for i in 0..value.len() {
        value[i] = reflect(value[i], bounds.min[i], bounds.max[i]);
    }
    value
}

/// Per-chain Gaussian proposal: `sample + L_id * z * sigma` with `L_id` the
/// Cholesky factor of the chain's estimated proposal covariance (identity
/// until steps accumulate).
pub struct GaussianProposal {
    bounds: Option<ProposalBounds>,
    shape: Vec<DMatrix<f64>>,
    estimator: CovarianceEstimator,
    rng: StdRng,
}

impl GaussianProposal {
    pub fn new(n_chains: usize, n_dims: usize, bounds: Option<ProposalBounds>) -> Self {
        match &bounds {
            Some(_) => info!("using a bounded Gaussian proposal"),
            None => info!("using an unbounded Gaussian proposal"),
        }
        GaussianProposal {
            bounds,
            shape: vec![DMatrix::identity(n_dims, n_dims); n_chains],
            estimator: CovarianceEstimator::new(n_chains, n_dims),
            rng: StdRng::from_entropy(),
        }
    }

    pub fn seeded(n_chains: usize, n_dims: usize, bounds: Option<ProposalBounds>, seed: u64) -> Self {
        let mut proposal = GaussianProposal::new(n_chains, n_dims, bounds);
        proposal.rng = StdRng::seed_from_u64(seed);
        proposal
    }

    pub fn bounds(&self) -> Option<&ProposalBounds> {
        self.bounds.as_ref()
    }

    /// Draw the next proposed sample for a chain.
    pub fn propose(&mut self, id: usize, sample: &DVector<f64>, sigma: f64) -> DVector<f64> {
        let n = sample.len();
        let z = DVector::from_iterator(
            n,
            (0..n).map(|_| {
                let draw: f64 = StandardNormal.sample(&mut self.rng);
                draw
            }),
        );
        let proposed = sample + &self.shape[id] * z * sigma;
        match &self.bounds {
            Some(bounds) => reflect_vector(proposed, bounds),
            None => proposed,
        }
    }

    /// Feed an accepted step into the covariance estimate and refresh the
    /// chain's Cholesky factor. A failed factorization keeps the old shape.
    pub fn update(&mut self, id: usize, step: &DVector<f64>) {
        self.estimator.update(id, step);
        if let Some(chol) = self.estimator.covariance(id).clone().cholesky() {
            self.shape[id] = chol.l();
        }
    }
}
