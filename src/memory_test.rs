//! Permutation-based significance test for sequential memory.
//!
//! An HMM fit to the original time ordering should achieve a higher
//! log-likelihood than fits to randomly permuted orderings exactly when the
//! series carries sequential structure. This module runs that Monte Carlo
//! permutation test: one fit on the original order, `replications − 1` fits
//! on shuffled copies, and an empirical p-value comparing the two.

use crate::{
    backend::{BackendDispatcher, ExecutionBackend, HmmDims},
    errors::{validate_count, validate_data_length, validate_positive, HmmResult},
    hmm_core::{GaussianHmm, HmmConfig, HmmFitResult},
    math_utils::{mean, sample_std},
    preprocessing::{permute_rows, standardize_columns},
    secure_rng::SecureRng,
    task_pool::{resolve_worker_count, run_indexed},
    ProgressFn,
};
use nalgebra::DMatrix;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Configuration for the memory significance test.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct MemoryTestConfig {
    /// Number of hidden states
    pub num_states: usize,
    /// EM iteration limit per restart
    pub max_iterations: usize,
    /// Random restarts per fit
    pub num_restarts: usize,
    /// EM convergence tolerance
    pub tolerance: f64,
    /// Ridge strength for covariance protection
    pub regularization: f64,
    /// Total MCPT replications, including the original ordering
    pub mcpt_replications: usize,
    /// Maximum concurrent permutation fits; 0 uses one worker per CPU
    pub max_threads: usize,
    /// Standardize feature columns before fitting
    pub standardize: bool,
    /// Attempt the registered accelerated backend before the CPU path
    pub use_accelerated_backend: bool,
    /// Restart selection policy forwarded to [`HmmConfig`]
    pub exclude_nonconverged_restarts: bool,
}

impl Default for MemoryTestConfig {
    fn default() -> Self {
        Self {
            num_states: 3,
            max_iterations: 500,
            num_restarts: 5,
            tolerance: 1e-6,
            regularization: 1e-6,
            mcpt_replications: 20,
            max_threads: 8,
            standardize: true,
            use_accelerated_backend: false,
            exclude_nonconverged_restarts: false,
        }
    }
}

/// Result of a memory significance test.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct MemoryTestResult {
    /// Log-likelihood of the fit on the original ordering
    pub original_log_likelihood: f64,
    /// Permutation log-likelihoods, indexed by task position
    /// (length = `mcpt_replications - 1`)
    pub permutation_log_likelihoods: Vec<f64>,
    /// Empirical p-value that the original ordering carries no more
    /// structure than chance
    pub p_value: f64,
    /// Mean of the permutation log-likelihood distribution
    pub mean_permutation_log_likelihood: f64,
    /// Sample standard deviation of the permutation distribution
    pub std_permutation_log_likelihood: f64,
    /// Full fit result for the original ordering
    pub original_fit: HmmFitResult,
}

/// Permutation significance tester for sequential memory.
pub struct MemoryAnalyzer {
    config: MemoryTestConfig,
    accelerated: Option<Arc<dyn ExecutionBackend>>,
}

impl MemoryAnalyzer {
    /// Create an analyzer, validating the configuration.
    ///
    /// A replication count of zero is treated as one: the test then fits
    /// the original ordering only and reports p = 1.
    pub fn new(config: MemoryTestConfig) -> HmmResult<Self> {
        validate_count(config.num_states, 2, "num_states")?;
        validate_count(config.max_iterations, 1, "max_iterations")?;
        validate_count(config.num_restarts, 1, "num_restarts")?;
        validate_positive(config.tolerance, "tolerance")?;

        let mut config = config;
        if config.mcpt_replications < 1 {
            config.mcpt_replications = 1;
        }
        Ok(Self {
            config,
            accelerated: None,
        })
    }

    /// Register an accelerated execution backend.
    ///
    /// The backend is only consulted when the configuration enables it and
    /// its capability query accepts the problem dimensions.
    pub fn with_backend(mut self, backend: Arc<dyn ExecutionBackend>) -> Self {
        self.accelerated = Some(backend);
        self
    }

    /// Run the memory test on an observation matrix (rows = time steps).
    ///
    /// The caller's RNG seeds the original fit and the per-permutation
    /// generators; an identical RNG state reproduces the full result. The
    /// progress callback receives completed-work fractions in [0, 1] and may
    /// be invoked from worker threads.
    pub fn analyze(
        &self,
        observations: &DMatrix<f64>,
        rng: &mut SecureRng,
        progress: Option<&ProgressFn>,
    ) -> HmmResult<MemoryTestResult> {
        validate_data_length(observations.nrows(), 3, "memory test")?;

        let mut data = observations.clone();
        if self.config.standardize {
            standardize_columns(&mut data);
        }

        let model_config = HmmConfig {
            num_states: self.config.num_states,
            num_features: data.ncols(),
            max_iterations: self.config.max_iterations,
            num_restarts: self.config.num_restarts,
            tolerance: self.config.tolerance,
            regularization: self.config.regularization,
            exclude_nonconverged_restarts: self.config.exclude_nonconverged_restarts,
        };
        let dims = HmmDims {
            num_states: model_config.num_states,
            num_features: model_config.num_features,
        };
        let accelerated = if self.config.use_accelerated_backend {
            self.accelerated.as_deref()
        } else {
            None
        };
        let dispatcher = BackendDispatcher::new(accelerated, dims);

        let original_fit = dispatcher.fit(&data, &model_config, rng)?;
        let original_log_likelihood = original_fit.log_likelihood;

        let total_runs = self.config.mcpt_replications;
        if total_runs <= 1 {
            if let Some(callback) = progress {
                callback(1.0);
            }
            return Ok(MemoryTestResult {
                original_log_likelihood,
                permutation_log_likelihoods: Vec::new(),
                p_value: 1.0,
                mean_permutation_log_likelihood: 0.0,
                std_permutation_log_likelihood: 0.0,
                original_fit,
            });
        }

        let permutations = total_runs - 1;
        // Seeds are drawn single-threaded before dispatch so the result is
        // independent of scheduling.
        let seeds: Vec<u64> = (0..permutations).map(|_| rng.next_seed()).collect();

        let completed = AtomicUsize::new(0);
        let report = |done: usize| {
            if let Some(callback) = progress {
                callback((done as f64 / permutations as f64).min(1.0));
            }
        };

        let mut permutation_log_likelihoods = vec![f64::NEG_INFINITY; permutations];

        // Accelerated phase: sequential, one device. The dispatcher reroutes
        // the first failing unit to the CPU itself; the loop then stops
        // attempting the backend and hands the rest to the worker pool.
        let mut next_task = 0;
        while next_task < permutations && dispatcher.accelerated_active() {
            let mut local = SecureRng::with_seed(seeds[next_task]);
            let permuted = permuted_copy(&data, &mut local);
            let fit = dispatcher.fit(&permuted, &model_config, &mut local)?;
            permutation_log_likelihoods[next_task] = fit.log_likelihood;
            next_task += 1;
            report(completed.fetch_add(1, Ordering::SeqCst) + 1);
        }

        if next_task < permutations {
            let model = GaussianHmm::new(model_config.clone())?;
            let offset = next_task;
            let remaining = permutations - offset;
            let workers = resolve_worker_count(self.config.max_threads);

            let results: Vec<HmmResult<f64>> = run_indexed(workers, remaining, |task| {
                let mut local = SecureRng::with_seed(seeds[offset + task]);
                let permuted = permuted_copy(&data, &mut local);
                let fit = model.fit(&permuted, &mut local)?;
                report(completed.fetch_add(1, Ordering::SeqCst) + 1);
                Ok(fit.log_likelihood)
            });
            for (task, outcome) in results.into_iter().enumerate() {
                permutation_log_likelihoods[offset + task] = outcome?;
            }
        }

        // The leading 1 accounts for the unpermuted run itself.
        let mut greater_or_equal = 1usize;
        for &log_likelihood in &permutation_log_likelihoods {
            if log_likelihood >= original_log_likelihood {
                greater_or_equal += 1;
            }
        }
        let p_value = greater_or_equal as f64 / total_runs as f64;

        let mean_permutation_log_likelihood = mean(&permutation_log_likelihoods);
        let std_permutation_log_likelihood = sample_std(
            &permutation_log_likelihoods,
            mean_permutation_log_likelihood,
        );

        if let Some(callback) = progress {
            callback(1.0);
        }

        Ok(MemoryTestResult {
            original_log_likelihood,
            permutation_log_likelihoods,
            p_value,
            mean_permutation_log_likelihood,
            std_permutation_log_likelihood,
            original_fit,
        })
    }
}

/// Materialize a row-shuffled copy of `data` using the given RNG.
fn permuted_copy(data: &DMatrix<f64>, rng: &mut SecureRng) -> DMatrix<f64> {
    let mut order: Vec<usize> = (0..data.nrows()).collect();
    rng.shuffle(&mut order);
    permute_rows(data, &order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::HmmAnalysisError;

    fn structured_data(rows: usize) -> DMatrix<f64> {
        // Two long blocks with different levels: strongly ordered data.
        DMatrix::from_fn(rows, 2, |r, c| {
            let offset = if r < rows / 2 { 0.0 } else { 4.0 };
            offset + 0.2 * (((r * 31 + c * 17) % 11) as f64 - 5.0)
        })
    }

    fn quick_config(replications: usize) -> MemoryTestConfig {
        MemoryTestConfig {
            num_states: 2,
            max_iterations: 40,
            num_restarts: 1,
            mcpt_replications: replications,
            max_threads: 2,
            ..MemoryTestConfig::default()
        }
    }

    #[test]
    fn test_rejects_too_few_observations() {
        let analyzer = MemoryAnalyzer::new(quick_config(3)).unwrap();
        let data = DMatrix::zeros(2, 2);
        let mut rng = SecureRng::with_seed(1);
        assert!(matches!(
            analyzer.analyze(&data, &mut rng, None),
            Err(HmmAnalysisError::InsufficientData { .. })
        ));
    }

    #[test]
    fn test_single_replication_short_circuits() {
        let analyzer = MemoryAnalyzer::new(quick_config(1)).unwrap();
        let data = structured_data(24);
        let mut rng = SecureRng::with_seed(2);
        let result = analyzer.analyze(&data, &mut rng, None).unwrap();

        assert_eq!(result.p_value, 1.0);
        assert!(result.permutation_log_likelihoods.is_empty());
        assert!(result.original_log_likelihood.is_finite());
    }

    #[test]
    fn test_permutation_count_and_p_value_range() {
        let analyzer = MemoryAnalyzer::new(quick_config(5)).unwrap();
        let data = structured_data(30);
        let mut rng = SecureRng::with_seed(3);
        let result = analyzer.analyze(&data, &mut rng, None).unwrap();

        assert_eq!(result.permutation_log_likelihoods.len(), 4);
        assert!(result.p_value >= 0.0 && result.p_value <= 1.0);
        assert!(result.std_permutation_log_likelihood >= 0.0);
    }

    #[test]
    fn test_zero_replications_clamped_to_one() {
        let analyzer = MemoryAnalyzer::new(quick_config(0)).unwrap();
        let data = structured_data(24);
        let mut rng = SecureRng::with_seed(4);
        let result = analyzer.analyze(&data, &mut rng, None).unwrap();
        assert_eq!(result.p_value, 1.0);
        assert!(result.permutation_log_likelihoods.is_empty());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = MemoryTestConfig {
            num_states: 1,
            ..MemoryTestConfig::default()
        };
        assert!(MemoryAnalyzer::new(config).is_err());

        let config = MemoryTestConfig {
            tolerance: -1.0,
            ..MemoryTestConfig::default()
        };
        assert!(MemoryAnalyzer::new(config).is_err());
    }
}
