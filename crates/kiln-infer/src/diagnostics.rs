//! Convergence diagnostics.

use nalgebra::{DMatrix, DVector};

use crate::state::State;

/// Estimated potential scale reduction across the coldest chain of every
/// stack, via Welford running moments. Values near one indicate the stacks
/// agree.
pub struct EpsrDiagnostic {
    n_temps: usize,
    /// Per-dimension running means, one column per stack.
    means: DMatrix<f64>,
    /// Per-dimension sums of squared deviations, one column per stack.
    sq_devs: DMatrix<f64>,
    counts: Vec<u64>,
    threshold: f64,
}

impl EpsrDiagnostic {
    pub fn new(n_stacks: usize, n_temps: usize, n_dims: usize, threshold: f64) -> Self {
        EpsrDiagnostic {
            n_temps,
            means: DMatrix::zeros(n_dims, n_stacks),
            sq_devs: DMatrix::zeros(n_dims, n_stacks),
            counts: vec![0; n_stacks],
            threshold,
        }
    }

    /// Fold in a new state; only coldest-in-stack chains are monitored.
    pub fn update(&mut self, chain_id: usize, state: &State) {
        if chain_id % self.n_temps != 0 {
            return;
        }
        let stack = chain_id / self.n_temps;
        let n = (self.counts[stack] + 1) as f64;

        for d in 0..state.sample.len() {
            let x = state.sample[d];
            let old_mean = self.means[(d, stack)];
            let new_mean = old_mean + (x - old_mean) / n;
            self.sq_devs[(d, stack)] += (x - old_mean) * (x - new_mean);
            self.means[(d, stack)] = new_mean;
        }
        self.counts[stack] += 1;
    }

    /// The potential scale reduction factor per dimension.
    pub fn r_hat(&self) -> DVector<f64> {
        let n = self.counts.iter().copied().min().unwrap_or(0) as f64;
        let m = self.counts.len() as f64;
        let dims = self.means.nrows();

        let mut result = DVector::zeros(dims);
        for d in 0..dims {
            let overall_mean = self.means.row(d).sum() / m;
            let between = (n / (m - 1.0))
                * self
                    .means
                    .row(d)
                    .iter()
                    .map(|mu| (mu - overall_mean).powi(2))
                    .sum::<f64>();
            let within = self.sq_devs.row(d).iter().sum::<f64>() / (m * (n - 1.0));
            let v_hat = ((n - 1.0) / n) * within + between / n;
            result[d] = (v_hat / (within + 1e-30)).sqrt();
        }
        result
    }

    pub fn has_converged(&self) -> bool {
        self.r_hat().iter().all(|r| *r < self.threshold)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::SwapType;
    use nalgebra::dvector;

    fn state(sample: DVector<f64>) -> State {
        State {
            sample,
            energy: 0.0,
            sigma: 1.0,
            beta: 1.0,
            accepted: true,
            swap_type: SwapType::NoAttempt,
        }
    }

    #[test]
    fn identical_chains_have_zero_r_hat() {
        // 5 stacks, 10 samples each, every sample zero.
        let mut epsr = EpsrDiagnostic::new(5, 1, 1, 1.1);
        for _ in 0..10 {
            for stack in 0..5 {
                epsr.update(stack, &state(dvector![0.0]));
            }
        }
        let r = epsr.r_hat();
        assert_eq!(r[0], 0.0);
        assert!(epsr.has_converged());
    }

    #[test]
    fn only_cold_chains_count() {
        let mut epsr = EpsrDiagnostic::new(2, 3, 1, 1.1);
        // Hot-chain updates are ignored.
        epsr.update(1, &state(dvector![100.0]));
        epsr.update(2, &state(dvector![100.0]));
        assert_eq!(epsr.counts, vec![0, 0]);

        epsr.update(0, &state(dvector![1.0]));
        epsr.update(3, &state(dvector![1.0]));
        assert_eq!(epsr.counts, vec![1, 1]);
    }

    #[test]
    fn disagreeing_chains_do_not_converge() {
        let mut epsr = EpsrDiagnostic::new(2, 1, 1, 1.1);
        for i in 0..50 {
            // Tight noise around well-separated means.
            let jitter = (i % 3) as f64 * 0.01;
            epsr.update(0, &state(dvector![0.0 + jitter]));
            epsr.update(1, &state(dvector![10.0 + jitter]));
        }
        assert!(epsr.r_hat()[0] > 1.1);
        assert!(!epsr.has_converged());
    }

    #[test]
    fn agreeing_noisy_chains_converge() {
        let mut epsr = EpsrDiagnostic::new(2, 1, 2, 1.1);
        for i in 0..200 {
            let x = (i % 7) as f64;
            epsr.update(0, &state(dvector![x, -x]));
            epsr.update(1, &state(dvector![x, -x]));
        }
        assert!(epsr.has_converged());
    }
}
