//! Online regression adapters for proposal scale and temperature control.
//!
//! For each temperature index the adapter maintains a 3-weight linear model
//! predicting the acceptance (or swap) rate from `(-log value, t, 1)`,
//! updated with running means of outer products and solved by least squares.
//! Prediction inverts the model to find the log-value expected to hit the
//! target rate. The same machinery serves sigma (value = proposal scale,
//! t = -log beta) and beta (value = temperature-ratio target, t = -log beta).

use std::collections::VecDeque;

use nalgebra::{Matrix3, Vector3};
use tracing::error;

use crate::InferError;

/// Clipping range for log values; also shapes the initial guess.
const MIN_LOG_VALUE: f64 = -10.0;
const MAX_LOG_VALUE: f64 = 10.0;

/// Offset applied to the predicted log temperature-ratio factor.
const LOG_BETA_FACTOR: f64 = 0.0;

/// Prior observation count, for stability with few samples.
const INITIAL_COUNT: f64 = 50.0;

/// Minimum gradient of the rate with respect to the log value.
const MIN_GRADIENT: f64 = 1e-3;

/// Length of the rate-logging window.
const WINDOW_LEN: usize = 1000;

pub struct RegressionAdapter {
    n_temps: usize,
    optimal_rate: f64,
    mu_xx: Vec<Matrix3<f64>>,
    mu_xy: Vec<Vector3<f64>>,
    weights: Vec<Vector3<f64>>,
    counts: Vec<f64>,
    windows: Vec<VecDeque<bool>>,
    window_sums: Vec<usize>,
    rates: Vec<f64>,
    values: Vec<f64>,
}

impl RegressionAdapter {
    pub fn new(n_stacks: usize, n_temps: usize, optimal_rate: f64) -> Self {
        let n_chains = n_stacks * n_temps;

        // Prior moments put equal mass on both clipping bounds, which seeds
        // the model with a gentle positive gradient.
        let bound1 = Vector3::new(-MAX_LOG_VALUE, 0.0, 1.0);
        let bound2 = Vector3::new(-MIN_LOG_VALUE, 0.0, 1.0);
        let mu_xx = bound1 * bound1.transpose() * 0.5 + bound2 * bound2.transpose() * 0.5;
        let mu_xy = bound2 * 0.5;

        RegressionAdapter {
            n_temps,
            optimal_rate,
            mu_xx: vec![mu_xx; n_temps],
            mu_xy: vec![mu_xy; n_temps],
            weights: vec![mu_xy; n_temps],
            counts: vec![INITIAL_COUNT; n_temps],
            windows: vec![VecDeque::with_capacity(WINDOW_LEN); n_chains],
            window_sums: vec![0; n_chains],
            rates: vec![f64::NAN; n_chains],
            values: vec![1.0; n_chains],
        }
    }

    /// Fold one outcome into the model for this chain's temperature.
    /// `log_value` is the log of the controlled quantity (log sigma, or the
    /// log temperature-ratio target) and `t` the temperature covariate
    /// (-log beta).
    pub fn update(&mut self, chain_id: usize, log_value: f64, t: f64, accepted: bool) {
        let temp_id = chain_id % self.n_temps;
        let logval = log_value.clamp(MIN_LOG_VALUE, MAX_LOG_VALUE);
        let x = Vector3::new(-logval, t, 1.0);
        let y = f64::from(u8::from(accepted));

        self.counts[temp_id] += 1.0;
        let alpha = 1.0 / self.counts[temp_id];
        self.mu_xx[temp_id] =
            self.mu_xx[temp_id] * (1.0 - alpha) + x * x.transpose() * alpha;
        self.mu_xy[temp_id] = self.mu_xy[temp_id] * (1.0 - alpha) + x * y * alpha;
        // Least-squares solve; SVD tolerates the rank-deficient moments that
        // show up while every observation shares a temperature.
        if let Ok(solved) = self.mu_xx[temp_id]
            .svd(true, true)
            .solve(&self.mu_xy[temp_id], 1e-12)
        {
            self.weights[temp_id] = solved;
        }

        // Rate logging over a sliding window of the last outcomes.
        let window = &mut self.windows[chain_id];
        window.push_back(accepted);
        self.window_sums[chain_id] += usize::from(accepted);
        if window.len() > WINDOW_LEN {
            if let Some(oldest) = window.pop_front() {
                self.window_sums[chain_id] -= usize::from(oldest);
            }
        }
        self.rates[chain_id] = self.window_sums[chain_id] as f64 / window.len() as f64;
    }

    /// Invert the model: the log value expected to achieve the target rate at
    /// temperature covariate `t`, clipped to the valid range.
    pub fn predict(&self, chain_id: usize, t: f64) -> Result<f64, InferError> {
        let temp_id = chain_id % self.n_temps;
        let w = &self.weights[temp_id];

        let denom = w[0].max(MIN_GRADIENT);
        let numer = (-(self.optimal_rate - w[1] * t - w[2]))
            .clamp(denom * MIN_LOG_VALUE, denom * MAX_LOG_VALUE);
        let x = numer / denom;

        if x.is_nan() {
            error!(
                chain = chain_id,
                weights = ?w,
                "adapter weights are non-finite"
            );
            return Err(InferError::NonFinite { chain: chain_id });
        }
        Ok(x)
    }

    /// Next proposal scale for a chain; cached into `values`.
    pub fn compute_sigma(&mut self, chain_id: usize, t: f64) -> Result<f64, InferError> {
        let sigma = self.predict(chain_id, t)?.exp();
        self.values[chain_id] = sigma;
        Ok(sigma)
    }

    /// Learn from a swap outcome between the chain and its hotter neighbour.
    /// The learning target is the temperature ratio that the forward
    /// transform of [`compute_beta_stack`](Self::compute_beta_stack) would
    /// need to reproduce the observed ladder.
    pub fn beta_update(&mut self, chain_id: usize, beta_low: f64, beta_high: f64, accepted: bool) {
        let target = ((beta_low / beta_high - 1.0) / LOG_BETA_FACTOR.exp())
            .clamp(MIN_LOG_VALUE.exp(), MAX_LOG_VALUE.exp());
        self.update(chain_id, target.ln(), -beta_low.ln(), accepted);
    }

    /// Rebuild the cached beta ladder for one stack, walking up from the
    /// coldest chain: `temp_{i+1} = (1 + exp(predict + offset)) * temp_i`.
    pub fn compute_beta_stack(&mut self, coldest_chain_id: usize) -> Result<(), InferError> {
        let mut temp = 1.0f64;
        self.values[coldest_chain_id] = 1.0;
        for i in 1..self.n_temps {
            let log_factor = self.predict(coldest_chain_id + i - 1, temp.ln())? + LOG_BETA_FACTOR;
            temp *= 1.0 + log_factor.exp();
            self.values[coldest_chain_id + i] = 1.0 / temp;
        }
        Ok(())
    }

    /// Last computed output value per chain (sigma, or beta).
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Windowed acceptance/swap rate per chain, for logging.
    pub fn rates(&self) -> &[f64] {
        &self.rates
    }
}

/// Per-chain running mean and second moment, yielding the sample covariance
/// used to shape the Gaussian proposal.
pub struct CovarianceEstimator {
    lengths: Vec<u64>,
    second_moment: Vec<nalgebra::DMatrix<f64>>,
    mean: Vec<nalgebra::DVector<f64>>,
    covs: Vec<nalgebra::DMatrix<f64>>,
}

impl CovarianceEstimator {
    pub fn new(n_chains: usize, n_dims: usize) -> Self {
        CovarianceEstimator {
            lengths: vec![0; n_chains],
            second_moment: vec![nalgebra::DMatrix::identity(n_dims, n_dims); n_chains],
            mean: vec![nalgebra::DVector::zeros(n_dims); n_chains],
            covs: vec![nalgebra::DMatrix::identity(n_dims, n_dims); n_chains],
        }
    }

    pub fn update(&mut self, id: usize, sample: &nalgebra::DVector<f64>) {
        // The identity prior carries the weight of 10 * n_dims observations.
        let n = self.lengths[id] as f64 + 10.0 * sample.len() as f64;
        let shrink = n / (n + 1.0);

        self.second_moment[id] =
            &self.second_moment[id] * shrink + sample * sample.transpose() / (n + 1.0);
        self.mean[id] = &self.mean[id] * shrink + sample / (n + 1.0);
        self.covs[id] = &self.second_moment[id] - &self.mean[id] * self.mean[id].transpose();

        self.lengths[id] += 1;
    }

    pub fn covariance(&self, id: usize) -> &nalgebra::DMatrix<f64> {
        &self.covs[id]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_values_are_unity() {
        let adapter = RegressionAdapter::new(2, 3, 0.24);
        assert!(adapter.values().iter().all(|v| *v == 1.0));
    }

    #[test]
    fn prediction_is_always_clipped() {
        let mut adapter = RegressionAdapter::new(1, 1, 0.24);
        for i in 0..200 {
            adapter.update(0, 3.0, 0.0, i % 7 == 0);
        }
        let x = adapter.predict(0, 0.0).unwrap();
        assert!((MIN_LOG_VALUE..=MAX_LOG_VALUE).contains(&x));

        let sigma = adapter.compute_sigma(0, 0.0).unwrap();
        assert!(sigma > 0.0);
        assert!(sigma <= MAX_LOG_VALUE.exp());
        assert_eq!(adapter.values()[0], sigma);
    }

    #[test]
    fn rejection_heavy_updates_shrink_sigma() {
        let mut adapter = RegressionAdapter::new(1, 1, 0.24);
        let before = adapter.compute_sigma(0, 0.0).unwrap();

        // Everything rejected at a large sigma: the model should ask for a
        // smaller scale.
        for _ in 0..500 {
            adapter.update(0, 2.0f64.ln(), 0.0, false);
        }
        let after = adapter.compute_sigma(0, 0.0).unwrap();
        assert!(after < before, "sigma should shrink: {before} -> {after}");
    }

    #[test]
    fn windowed_rates_track_outcomes() {
        let mut adapter = RegressionAdapter::new(1, 2, 0.24);
        for i in 0..100 {
            adapter.update(0, 0.0, 0.0, i % 2 == 0);
        }
        let rate = adapter.rates()[0];
        assert!((rate - 0.5).abs() < 0.02);

        // Chain 1 never updated: rate stays NaN.
        assert!(adapter.rates()[1].is_nan());
    }

    #[test]
    fn window_is_bounded() {
        let mut adapter = RegressionAdapter::new(1, 1, 0.24);
        for _ in 0..(WINDOW_LEN + 500) {
            adapter.update(0, 0.0, 0.0, false);
        }
        // Early accepts have rolled out of the window entirely.
        assert_eq!(adapter.rates()[0], 0.0);
        assert_eq!(adapter.windows[0].len(), WINDOW_LEN);
    }

    #[test]
    fn beta_stack_is_a_descending_ladder() {
        let mut adapter = RegressionAdapter::new(1, 4, 0.24);
        adapter.compute_beta_stack(0).unwrap();

        let betas = adapter.values();
        assert_eq!(betas[0], 1.0);
        for i in 1..4 {
            assert!(betas[i] < betas[i - 1], "ladder must cool: {betas:?}");
            assert!(betas[i] > 0.0);
        }
    }

    #[test]
    fn beta_update_accepts_extreme_ratios() {
        let mut adapter = RegressionAdapter::new(1, 2, 0.24);
        // A degenerate ladder (equal betas) must clip, not panic or poison
        // the model.
        adapter.beta_update(0, 1.0, 1.0, true);
        adapter.compute_beta_stack(0).unwrap();
        assert!(adapter.values()[1] < 1.0);
    }

    #[test]
    fn covariance_starts_at_identity_and_adapts() {
        let mut est = CovarianceEstimator::new(1, 2);
        assert_eq!(est.covariance(0), &nalgebra::DMatrix::identity(2, 2));

        // Feed strongly x-aligned steps.
        for _ in 0..2000 {
            est.update(0, &nalgebra::dvector![1.0, 0.0]);
            est.update(0, &nalgebra::dvector![-1.0, 0.0]);
        }
        let cov = est.covariance(0);
        assert!(cov[(0, 0)] > cov[(1, 1)]);
        // Still symmetric positive-ish along the diagonal.
        assert!(cov[(1, 1)] > 0.0);
    }
}
